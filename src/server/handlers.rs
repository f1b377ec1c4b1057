//! HTTP handlers for the REST and push services.
//!
//! Routes:
//! - `POST|PUT /update/{uaid}/{chid}` - version bump intake
//! - `GET  /status/` - liveness
//! - `GET  /realstatus/` - readiness (store and router health)
//! - `GET  /` - WebSocket upgrade into a push session

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::client::ClientRegistry;
use crate::constants::VERSION;
use crate::dispatch::{DispatchError, UpdateQueue};
use crate::push::{PushContext, PushSession};
use crate::router::Router;
use crate::storage::ChannelStore;
use crate::update::{UpdateMessage, Version};

/// State shared by the REST and push handlers of one relay.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Intake queue.
    pub queue: UpdateQueue,
    /// Live connections.
    pub registry: Arc<ClientRegistry>,
    /// Channel store, checked by `/realstatus/`.
    pub store: Arc<dyn ChannelStore>,
    /// Router, checked by `/realstatus/`.
    pub router: Arc<Router>,
    /// Context handed to every push session.
    pub push: PushContext,
    /// One permit per push connection.
    pub connections: Arc<Semaphore>,
    /// Tracks push session tasks for shutdown.
    pub tracker: TaskTracker,
    /// Cancelled when the relay stops taking work.
    pub closing: CancellationToken,
}

/// REST routes.
pub fn rest_routes(state: AppState) -> axum::Router {
    axum::Router::new()
        .route("/update/{uaid}/{chid}", post(update).put(update))
        .route("/status/", get(status))
        .route("/realstatus/", get(real_status))
        .with_state(state)
}

/// Push upgrade route.
pub fn push_routes(state: AppState) -> axum::Router {
    axum::Router::new()
        .route("/", get(upgrade))
        .with_state(state)
}

#[derive(Deserialize)]
struct VersionBody {
    version: Version,
}

/// Parse an update body.
///
/// Accepts `{"version": N}`, `version=N` form text, or a bare integer. An
/// empty body means "now" in UNIX seconds.
pub fn parse_version(body: &str) -> Result<Version, String> {
    let body = body.trim();
    if body.is_empty() {
        return Ok(u64::try_from(Utc::now().timestamp()).unwrap_or_default());
    }

    if body.starts_with('{') {
        return serde_json::from_str::<VersionBody>(body)
            .map(|b| b.version)
            .map_err(|e| format!("invalid JSON body: {e}"));
    }

    let raw = match body.split('&').find_map(|pair| pair.strip_prefix("version=")) {
        Some(value) => value,
        None if body.contains('=') => return Err("missing version field".to_string()),
        None => body,
    };
    raw.trim()
        .parse::<Version>()
        .map_err(|_| format!("{raw:?} is not a version number"))
}

async fn update(
    State(state): State<AppState>,
    Path((uaid, chid)): Path<(String, String)>,
    body: String,
) -> Response {
    if state.closing.is_cancelled() {
        return unavailable("shutting down");
    }

    let version = match parse_version(&body) {
        Ok(version) => version,
        Err(e) => return bad_request(&e),
    };

    let update = UpdateMessage::new(uaid, chid, version);
    if let Err(e) = update.validate() {
        return bad_request(&e.to_string());
    }

    log::debug!("[Relay] Update {}", update);
    match state.queue.submit(update).await {
        Ok(outcome) => {
            let mut body = serde_json::to_value(&outcome.delivery).unwrap_or_else(|_| json!({}));
            body["applied"] = json!(outcome.applied);
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(DispatchError::InvalidUpdate(e)) => bad_request(&e.to_string()),
        Err(e @ (DispatchError::Storage(_) | DispatchError::Unavailable)) => {
            unavailable(&e.to_string())
        }
    }
}

async fn status() -> Json<serde_json::Value> {
    Json(json!({"status": "OK", "version": VERSION}))
}

async fn real_status(State(state): State<AppState>) -> Response {
    let store = state.store.healthy().await;
    let router = !state.router.is_closed();
    let healthy = store && router && !state.closing.is_cancelled();

    let label = if healthy { "OK" } else { "NOK" };
    let body = json!({
        "status": label,
        "healthy": healthy,
        "clients": state.registry.len(),
        "store": store,
        "router": router,
        "version": VERSION,
    });
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body)).into_response()
}

async fn upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    if state.closing.is_cancelled() {
        return unavailable("shutting down");
    }

    let Ok(permit) = Arc::clone(&state.connections).try_acquire_owned() else {
        log::warn!("[Push] Connection limit reached, refusing upgrade");
        return unavailable("too many connections");
    };

    let (session, commands) = PushSession::new(state.push.clone());
    let tracker = state.tracker.clone();
    ws.on_upgrade(move |socket| {
        tracker.track_future(async move {
            let _permit = permit;
            session.run(socket, commands).await;
        })
    })
}

fn bad_request(reason: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({"error": reason}))).into_response()
}

fn unavailable(reason: &str) -> Response {
    (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"error": reason}))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{Dispatcher, UpdateWorker};
    use crate::push::PushSettings;
    use crate::router::{ForwardSettings, ShardMap};
    use crate::storage::MemoryStore;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    fn state() -> (AppState, UpdateWorker) {
        let registry = Arc::new(ClientRegistry::new());
        let store: Arc<dyn ChannelStore> = Arc::new(MemoryStore::new());
        let router = Arc::new(
            Router::new(
                ShardMap::single("127.0.0.1:3000".into()),
                Arc::clone(&registry),
                ForwardSettings::default(),
                Duration::from_secs(1),
            )
            .unwrap(),
        );
        let (queue, rx) = UpdateQueue::new(16);
        let worker = UpdateWorker::spawn(Dispatcher::new(Arc::clone(&store), Arc::clone(&router)), rx);
        let closing = CancellationToken::new();
        let push = PushContext {
            registry: Arc::clone(&registry),
            shards: router.shards().clone(),
            store: Arc::clone(&store),
            settings: PushSettings::default(),
            shutdown: closing.child_token(),
        };
        let state = AppState {
            queue,
            registry,
            store,
            router,
            push,
            connections: Arc::new(Semaphore::new(4)),
            tracker: TaskTracker::new(),
            closing,
        };
        (state, worker)
    }

    fn post(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_parse_version_forms() {
        assert_eq!(parse_version(r#"{"version": 7}"#), Ok(7));
        assert_eq!(parse_version("version=8"), Ok(8));
        assert_eq!(parse_version("foo=1&version=9"), Ok(9));
        assert_eq!(parse_version(" 10\n"), Ok(10));
        assert!(parse_version("abc").is_err());
        assert!(parse_version("foo=1").is_err());
        assert!(parse_version(r#"{"v": 1}"#).is_err());
    }

    #[test]
    fn test_empty_body_uses_current_time() {
        let before = u64::try_from(Utc::now().timestamp()).unwrap();
        let version = parse_version("").unwrap();
        assert!(version >= before);
    }

    #[tokio::test]
    async fn test_update_then_stale_update() {
        let (state, worker) = state();
        let app = rest_routes(state);

        let first = app.clone().oneshot(post("/update/u1/c1", "version=5")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let body = json_body(first).await;
        assert_eq!(body["applied"], true);
        assert_eq!(body["delivery"], "not_connected");

        let stale = app.oneshot(post("/update/u1/c1", "3")).await.unwrap();
        assert_eq!(stale.status(), StatusCode::OK);
        let body = json_body(stale).await;
        assert_eq!(body["applied"], false);
        assert_eq!(body["delivery"], "skipped");

        worker.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_put_is_accepted() {
        let (state, worker) = state();
        let request = Request::builder()
            .method("PUT")
            .uri("/update/u1/c1")
            .body(Body::from(r#"{"version": 1}"#))
            .unwrap();
        let response = rest_routes(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        worker.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_bad_update_requests() {
        let (state, worker) = state();
        let app = rest_routes(state);

        let bad_id = app.clone().oneshot(post("/update/u%201/c1", "1")).await.unwrap();
        assert_eq!(bad_id.status(), StatusCode::BAD_REQUEST);

        let bad_body = app.oneshot(post("/update/u1/c1", "soon")).await.unwrap();
        assert_eq!(bad_body.status(), StatusCode::BAD_REQUEST);

        worker.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_update_while_closing_is_refused() {
        let (state, worker) = state();
        state.closing.cancel();
        let response = rest_routes(state).oneshot(post("/update/u1/c1", "1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        worker.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_status_endpoints() {
        let (state, worker) = state();
        let app = rest_routes(state.clone());

        let request = Request::builder().uri("/status/").body(Body::empty()).unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "OK");

        let request = Request::builder().uri("/realstatus/").body(Body::empty()).unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["healthy"], true);
        assert_eq!(body["clients"], 0);

        state.router.close_all();
        let request = Request::builder().uri("/realstatus/").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_body(response).await["status"], "NOK");

        worker.stop(Duration::from_secs(1)).await;
    }
}
