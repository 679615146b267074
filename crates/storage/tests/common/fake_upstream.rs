//! In-process fake of a resumable-upload HTTP API.

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

pub const TOKEN: &str = "test-token";

#[derive(Default)]
struct FakeSession {
    total: u64,
    data: Vec<u8>,
}

#[derive(Default)]
pub struct FakeState {
    base_url: String,
    sessions: HashMap<String, FakeSession>,
    objects: HashMap<String, Vec<u8>>,
    /// Responses to return instead of handling the next PUTs.
    injected: VecDeque<(StatusCode, String)>,
    pub put_count: usize,
}

/// Handle to a running fake upstream.
#[derive(Clone)]
pub struct FakeUpstream {
    pub endpoint: String,
    state: Arc<Mutex<FakeState>>,
}

#[allow(dead_code)]
impl FakeUpstream {
    pub async fn start() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let endpoint = format!("http://{addr}");
        let state = Arc::new(Mutex::new(FakeState {
            base_url: endpoint.clone(),
            ..Default::default()
        }));

        let app = Router::new()
            .route("/upload", post(open_session))
            .route("/session/{id}", put(upload_range))
            .route("/files/{id}", get(read_object))
            .with_state(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { endpoint, state }
    }

    /// Make the next PUT return `status` with `body`.
    pub fn inject(&self, status: StatusCode, body: &str) {
        self.state
            .lock()
            .unwrap()
            .injected
            .push_back((status, body.to_string()));
    }

    pub fn object(&self, id: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().objects.get(id).cloned()
    }

    pub fn put_count(&self) -> usize {
        self.state.lock().unwrap().put_count
    }
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {TOKEN}"))
}

async fn open_session(
    State(state): State<Arc<Mutex<FakeState>>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if query.get("uploadType").map(String::as_str) != Some("resumable") {
        return StatusCode::BAD_REQUEST.into_response();
    }
    let Some(total) = headers
        .get("x-upload-content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
    else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    let mut state = state.lock().unwrap();
    let id = uuid::Uuid::new_v4().to_string();
    let location = format!("{}/session/{id}", state.base_url);
    state.sessions.insert(
        id,
        FakeSession {
            total,
            data: Vec::new(),
        },
    );
    (StatusCode::OK, [(header::LOCATION, location)]).into_response()
}

/// Parse `bytes a-b/total` or `bytes */total` into `(start, end_exclusive, total)`.
fn parse_content_range(value: &str) -> Option<(u64, u64, u64)> {
    let spec = value.strip_prefix("bytes ")?;
    let (range, total) = spec.split_once('/')?;
    let total: u64 = total.parse().ok()?;
    if range == "*" {
        return Some((0, 0, total));
    }
    let (a, b) = range.split_once('-')?;
    Some((a.parse().ok()?, b.parse::<u64>().ok()? + 1, total))
}

async fn upload_range(
    State(state): State<Arc<Mutex<FakeState>>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut state = state.lock().unwrap();
    state.put_count += 1;
    if let Some((status, body)) = state.injected.pop_front() {
        return (status, body).into_response();
    }
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let Some((start, end, total)) = headers
        .get(header::CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_content_range)
    else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    let Some(session) = state.sessions.get_mut(&id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if total != session.total || start != session.data.len() as u64 {
        return StatusCode::BAD_REQUEST.into_response();
    }
    if body.len() as u64 != end - start {
        return StatusCode::BAD_REQUEST.into_response();
    }
    session.data.extend_from_slice(&body);

    if session.data.len() as u64 == session.total {
        let data = std::mem::take(&mut session.data);
        state.sessions.remove(&id);
        let object_id = format!("obj-{id}");
        state.objects.insert(object_id.clone(), data);
        return (
            StatusCode::OK,
            axum::Json(serde_json::json!({ "id": object_id })),
        )
            .into_response();
    }

    let received = session.data.len() as u64;
    (
        StatusCode::PERMANENT_REDIRECT,
        [(header::RANGE, format!("bytes=0-{}", received - 1))],
    )
        .into_response()
}

async fn read_object(
    State(state): State<Arc<Mutex<FakeState>>>,
    Path(id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if query.get("alt").map(String::as_str) != Some("media") {
        return StatusCode::BAD_REQUEST.into_response();
    }
    match state.lock().unwrap().objects.get(&id) {
        Some(data) => (StatusCode::OK, data.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
