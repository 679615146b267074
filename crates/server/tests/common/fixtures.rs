//! Test fixtures.

use bytes::Bytes;
use drivex_core::ServerMessage;

/// Deterministic test payload.
#[allow(dead_code)]
pub fn test_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Split `data` into frames of `frame` bytes, as a client would send them.
#[allow(dead_code)]
pub fn frames(data: &[u8], frame: usize) -> Vec<Bytes> {
    data.chunks(frame.max(1)).map(Bytes::copy_from_slice).collect()
}

/// Progress values in the order they were sent.
#[allow(dead_code)]
pub fn progress_values(messages: &[ServerMessage]) -> Vec<u8> {
    messages
        .iter()
        .filter_map(|m| match m {
            ServerMessage::Progress(pct) => Some(*pct),
            _ => None,
        })
        .collect()
}

/// Messages that end a session.
#[allow(dead_code)]
pub fn terminal_messages(messages: &[ServerMessage]) -> Vec<&ServerMessage> {
    messages.iter().filter(|m| m.is_terminal()).collect()
}
