//! Process memory budget for in-flight uploads.
//!
//! The monitor keeps a running total of memory reserved by admitted uploads
//! and refuses reservations that would push it past a ceiling (a percentage
//! of total memory). It also refuses when the process itself is already
//! using more than the ceiling, whatever has been reserved.

use drivex_core::config::UploadConfig;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use time::OffsetDateTime;
use tokio::task::JoinHandle;

/// Source of memory figures.
pub trait MemoryProbe: Send + Sync {
    /// Total memory of the host, in bytes.
    fn total_memory(&self) -> u64;

    /// Resident memory of this process, in bytes.
    fn process_memory(&self) -> u64;
}

/// Reads memory figures from the operating system.
pub struct SysinfoProbe {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                tracing::warn!(error = %e, "cannot resolve current pid, process memory reads as 0");
                None
            }
        };
        Self {
            system: Mutex::new(System::new()),
            pid,
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SysinfoProbe {
    fn total_memory(&self) -> u64 {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_memory();
        system.total_memory()
    }

    fn process_memory(&self) -> u64 {
        let Some(pid) = self.pid else {
            return 0;
        };
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing().with_memory(),
        );
        system.process(pid).map(|p| p.memory()).unwrap_or(0)
    }
}

/// One memory usage sample.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct MemorySample {
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    pub process_bytes: u64,
    pub reserved_bytes: u64,
}

/// Point-in-time view for operators.
#[derive(Clone, Debug, Serialize)]
pub struct MemorySnapshot {
    pub total_bytes: u64,
    pub ceiling_bytes: u64,
    pub process_bytes: u64,
    /// Process memory as a fraction of total memory.
    pub used_fraction: f64,
    pub reserved_bytes: u64,
    pub history: Vec<MemorySample>,
}

struct MonitorState {
    reserved: u64,
    history: VecDeque<MemorySample>,
}

/// Tracks outstanding memory reservations against a ceiling.
pub struct MemoryMonitor {
    probe: Arc<dyn MemoryProbe>,
    total_bytes: u64,
    ceiling_bytes: u64,
    history_len: usize,
    state: Mutex<MonitorState>,
}

impl MemoryMonitor {
    /// Create a monitor allowing `ceiling_percent` of total memory.
    ///
    /// `total_override` replaces the probed total (containers often report
    /// the host's memory rather than their limit).
    pub fn new(
        probe: Arc<dyn MemoryProbe>,
        ceiling_percent: u8,
        total_override: Option<u64>,
        history_len: usize,
    ) -> Self {
        let total_bytes = total_override.unwrap_or_else(|| probe.total_memory());
        let ceiling_bytes =
            (u128::from(total_bytes) * u128::from(ceiling_percent.min(100)) / 100) as u64;
        Self {
            probe,
            total_bytes,
            ceiling_bytes,
            history_len: history_len.max(1),
            state: Mutex::new(MonitorState {
                reserved: 0,
                history: VecDeque::with_capacity(history_len.max(1)),
            }),
        }
    }

    /// Create a monitor backed by the operating system probe.
    pub fn from_config(config: &UploadConfig) -> Self {
        Self::new(
            Arc::new(SysinfoProbe::new()),
            config.memory_ceiling_percent,
            config.memory_total_bytes,
            config.memory_history_len,
        )
    }

    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn ceiling_bytes(&self) -> u64 {
        self.ceiling_bytes
    }

    /// Bytes currently reserved.
    pub fn reserved(&self) -> u64 {
        self.lock().reserved
    }

    /// Try to reserve `bytes`. Reserves nothing on failure.
    pub fn try_reserve(&self, bytes: u64) -> bool {
        // Probe outside the lock; it may touch /proc.
        let process_bytes = self.probe.process_memory();
        if process_bytes > self.ceiling_bytes {
            tracing::warn!(
                process_bytes,
                ceiling_bytes = self.ceiling_bytes,
                "process memory above ceiling, refusing reservation"
            );
            return false;
        }

        let mut state = self.lock();
        match state.reserved.checked_add(bytes) {
            Some(next) if next <= self.ceiling_bytes => {
                state.reserved = next;
                crate::metrics::RESERVED_MEMORY_BYTES.set(next as i64);
                true
            }
            _ => false,
        }
    }

    /// Return `bytes` to the budget.
    pub fn release(&self, bytes: u64) {
        let mut state = self.lock();
        if bytes > state.reserved {
            tracing::error!(
                requested = bytes,
                outstanding = state.reserved,
                "memory release exceeds outstanding reservations, clamping to zero"
            );
            state.reserved = 0;
        } else {
            state.reserved -= bytes;
        }
        crate::metrics::RESERVED_MEMORY_BYTES.set(state.reserved as i64);
    }

    /// Take a sample and append it to the bounded history.
    pub fn record_sample(&self) -> MemorySample {
        let process_bytes = self.probe.process_memory();
        let mut state = self.lock();
        let sample = MemorySample {
            at: OffsetDateTime::now_utc(),
            process_bytes,
            reserved_bytes: state.reserved,
        };
        if state.history.len() == self.history_len {
            state.history.pop_front();
        }
        state.history.push_back(sample);
        sample
    }

    pub fn current_usage_snapshot(&self) -> MemorySnapshot {
        let process_bytes = self.probe.process_memory();
        let state = self.lock();
        let used_fraction = if self.total_bytes == 0 {
            0.0
        } else {
            process_bytes as f64 / self.total_bytes as f64
        };
        MemorySnapshot {
            total_bytes: self.total_bytes,
            ceiling_bytes: self.ceiling_bytes,
            process_bytes,
            used_fraction,
            reserved_bytes: state.reserved,
            history: state.history.iter().copied().collect(),
        }
    }

    /// Spawn the background sampler.
    pub fn spawn_sampler(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let sample = self.record_sample();
                tracing::trace!(
                    process_bytes = sample.process_bytes,
                    reserved_bytes = sample.reserved_bytes,
                    "memory sample"
                );
            }
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Probe with fixed totals and adjustable process usage.
    pub(crate) struct FixedProbe {
        pub total: u64,
        pub process: AtomicU64,
    }

    impl FixedProbe {
        pub(crate) fn new(total: u64) -> Arc<Self> {
            Arc::new(Self {
                total,
                process: AtomicU64::new(0),
            })
        }
    }

    impl MemoryProbe for FixedProbe {
        fn total_memory(&self) -> u64 {
            self.total
        }

        fn process_memory(&self) -> u64 {
            self.process.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_ceiling_is_percent_of_total() {
        let monitor = MemoryMonitor::new(FixedProbe::new(1000), 80, None, 4);
        assert_eq!(monitor.ceiling_bytes(), 800);

        let monitor = MemoryMonitor::new(FixedProbe::new(1000), 50, Some(400), 4);
        assert_eq!(monitor.total_bytes(), 400);
        assert_eq!(monitor.ceiling_bytes(), 200);
    }

    #[test]
    fn test_reserve_up_to_ceiling() {
        let monitor = MemoryMonitor::new(FixedProbe::new(1000), 80, None, 4);
        assert!(monitor.try_reserve(500));
        assert!(monitor.try_reserve(300));
        assert!(!monitor.try_reserve(1));
        assert_eq!(monitor.reserved(), 800);

        monitor.release(300);
        assert!(monitor.try_reserve(1));
        assert_eq!(monitor.reserved(), 501);
    }

    #[test]
    fn test_failed_reservation_reserves_nothing() {
        let monitor = MemoryMonitor::new(FixedProbe::new(1000), 80, None, 4);
        assert!(monitor.try_reserve(700));
        assert!(!monitor.try_reserve(200));
        assert_eq!(monitor.reserved(), 700);
        assert!(!monitor.try_reserve(u64::MAX));
        assert_eq!(monitor.reserved(), 700);
    }

    #[test]
    fn test_refuses_when_process_already_over_ceiling() {
        let probe = FixedProbe::new(1000);
        let monitor = MemoryMonitor::new(probe.clone(), 80, None, 4);
        probe.process.store(801, Ordering::SeqCst);
        assert!(!monitor.try_reserve(1));
        assert_eq!(monitor.reserved(), 0);

        probe.process.store(100, Ordering::SeqCst);
        assert!(monitor.try_reserve(1));
    }

    #[test]
    fn test_over_release_clamps_to_zero() {
        let monitor = MemoryMonitor::new(FixedProbe::new(1000), 80, None, 4);
        assert!(monitor.try_reserve(10));
        monitor.release(25);
        assert_eq!(monitor.reserved(), 0);
    }

    #[test]
    fn test_outstanding_total_stays_within_bounds() {
        let monitor = MemoryMonitor::new(FixedProbe::new(10_000), 60, None, 4);
        let mut held = Vec::new();
        for i in 0..200u64 {
            let size = (i * 37) % 900 + 1;
            if i % 3 == 2 {
                if let Some(bytes) = held.pop() {
                    monitor.release(bytes);
                }
            } else if monitor.try_reserve(size) {
                held.push(size);
            }
            assert!(monitor.reserved() <= monitor.ceiling_bytes());
            assert_eq!(monitor.reserved(), held.iter().sum::<u64>());
        }
        for bytes in held.drain(..) {
            monitor.release(bytes);
        }
        assert_eq!(monitor.reserved(), 0);
    }

    #[test]
    fn test_history_is_bounded() {
        let probe = FixedProbe::new(1000);
        let monitor = MemoryMonitor::new(probe.clone(), 80, None, 3);
        for i in 0..5 {
            probe.process.store(i * 10, Ordering::SeqCst);
            monitor.record_sample();
        }
        let snapshot = monitor.current_usage_snapshot();
        assert_eq!(snapshot.history.len(), 3);
        assert_eq!(snapshot.history[0].process_bytes, 20);
        assert_eq!(snapshot.history[2].process_bytes, 40);
        assert_eq!(snapshot.process_bytes, 40);
        assert!((snapshot.used_fraction - 0.04).abs() < f64::EPSILON);
    }
}
