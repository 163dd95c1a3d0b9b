//! In-process stand-in for an ArcGIS REST server, used by the fetcher, walker
//! and sync tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use axum::{
    extract::State,
    http::{header, StatusCode, Uri},
    response::IntoResponse,
    Router,
};
use crate::config::FetchConfig;

#[derive(Clone)]
struct MockResponse {
    status: StatusCode,
    body: String,
    delay: Duration,
}

#[derive(Default)]
struct MockState {
    /// Queued responses per path; the last one repeats forever
    responses: HashMap<String, VecDeque<MockResponse>>,
    hits: HashMap<String, usize>,
}

#[derive(Clone, Default)]
pub struct MockUpstream {
    state: Arc<Mutex<MockState>>,
}

impl MockUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, path: &str, response: MockResponse) -> &Self {
        let mut state = self.state.lock().unwrap();
        state.responses.entry(path.to_string()).or_default().push_back(response);
        self
    }

    pub fn respond(&self, path: &str, status: StatusCode, body: &str) -> &Self {
        self.push(path, MockResponse { status, body: body.to_string(), delay: Duration::ZERO })
    }

    pub fn json(&self, path: &str, value: serde_json::Value) -> &Self {
        self.respond(path, StatusCode::OK, &value.to_string())
    }

    pub fn slow_json(&self, path: &str, value: serde_json::Value, delay: Duration) -> &Self {
        self.push(path, MockResponse { status: StatusCode::OK, body: value.to_string(), delay })
    }

    /// Replace everything queued for `path`
    pub fn reset(&self, path: &str) -> &Self {
        self.state.lock().unwrap().responses.remove(path);
        self
    }

    pub fn hits(&self, path: &str) -> usize {
        self.state.lock().unwrap().hits.get(path).copied().unwrap_or(0)
    }

    pub fn total_hits(&self) -> usize {
        self.state.lock().unwrap().hits.values().sum()
    }

    /// Bind to an ephemeral port and return the server origin, e.g. `http://127.0.0.1:40123`
    pub async fn serve(&self) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().fallback(handle).with_state(self.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }
}

async fn handle(State(mock): State<MockUpstream>, uri: Uri) -> impl IntoResponse {
    let path = uri.path().to_string();
    let response = {
        let mut state = mock.state.lock().unwrap();
        *state.hits.entry(path.clone()).or_default() += 1;
        match state.responses.get_mut(&path) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => None,
        }
    };

    let response = response.unwrap_or(MockResponse {
        status: StatusCode::NOT_FOUND,
        body: r#"{"error":{"code":404,"message":"not found"}}"#.to_string(),
        delay: Duration::ZERO,
    });

    if !response.delay.is_zero() {
        tokio::time::sleep(response.delay).await;
    }

    (response.status, [(header::CONTENT_TYPE, "application/json")], response.body)
}

/// Fetch settings that keep tests fast
pub fn fast_fetch_config() -> FetchConfig {
    FetchConfig {
        timeout_secs: 5,
        retries: 2,
        base_delay_ms: 1,
        max_delay_ms: 5,
        user_agent: "catalog-syncd-test".to_string(),
    }
}
