//! Scripted HTTP server the service clients are tested against.

use std::{collections::VecDeque, sync::Arc};

use axum::{
    extract::State,
    http::{
        header::{HeaderName, AUTHORIZATION, CONTENT_TYPE},
        HeaderMap, Method, StatusCode, Uri,
    },
    Json, Router,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::TcpListener;

/// One request as the server saw it.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub query: String,
    pub authorization: Option<String>,
    pub content_type: Option<String>,
    pub body: String,
}

#[derive(Clone, Default)]
struct StubState {
    responses: Arc<Mutex<VecDeque<(StatusCode, Value)>>>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

/// Answers requests in order with the scripted responses; the last one
/// repeats once the script runs out.
pub struct StubServer {
    pub endpoint: String,
    state: StubState,
}

impl StubServer {
    pub async fn start(responses: Vec<(u16, Value)>) -> Self {
        let state = StubState::default();
        state.responses.lock().extend(responses.into_iter().map(|(status, body)| {
            (StatusCode::from_u16(status).unwrap(), body)
        }));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().fallback(respond).with_state(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            endpoint: format!("http://{addr}"),
            state,
        }
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().clone()
    }
}

async fn respond(
    State(state): State<StubState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: String,
) -> (StatusCode, Json<Value>) {
    let header = |name: HeaderName| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    };
    state.requests.lock().push(RecordedRequest {
        method: method.to_string(),
        path: uri.path().to_string(),
        query: uri.query().unwrap_or_default().to_string(),
        authorization: header(AUTHORIZATION),
        content_type: header(CONTENT_TYPE),
        body,
    });
    let mut responses = state.responses.lock();
    let next = if responses.len() > 1 {
        responses.pop_front()
    } else {
        responses.front().cloned()
    };
    let (status, body) = next.unwrap_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            json!({ "error": { "message": "no scripted response" } }),
        )
    });
    (status, Json(body))
}
