//! Shard listener: accepts updates forwarded by peer nodes.
//!
//! `POST /route/{uaid}` with a [`ForwardBody`] JSON body. Accepted updates go
//! into the same queue as REST updates, tagged as peer-origin so they are
//! delivered locally and never forwarded again.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::Json;
use serde_json::{json, Value};

use super::Router;
use crate::dispatch::UpdateQueue;
use crate::update::ForwardBody;

/// Shared state of the shard listener.
#[derive(Debug, Clone)]
pub struct InboundState {
    /// Router whose shutdown closes the intake.
    pub router: Arc<Router>,
    /// Queue the accepted updates go into.
    pub queue: UpdateQueue,
}

/// Routes served by the shard listener.
pub fn shard_routes(state: InboundState) -> axum::Router {
    axum::Router::new()
        .route("/route/{uaid}", post(route_update))
        .with_state(state)
}

/// Take one forwarded update from a peer.
pub async fn route_update(
    State(state): State<InboundState>,
    Path(uaid): Path<String>,
    body: Result<Json<ForwardBody>, JsonRejection>,
) -> (StatusCode, Json<Value>) {
    if !state.router.accepting_forwards() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "router closed"})),
        );
    }

    let Json(body) = match body {
        Ok(body) => body,
        Err(e) => {
            log::warn!("[Router] Bad forward for {}: {}", uaid, e.body_text());
            return (StatusCode::BAD_REQUEST, Json(json!({"error": e.body_text()})));
        }
    };

    let update = body.into_update(uaid);
    if let Err(e) = update.validate() {
        log::warn!("[Router] Rejecting forward {}: {}", update, e);
        return (StatusCode::BAD_REQUEST, Json(json!({"error": e.to_string()})));
    }

    let described = update.to_string();
    match state.queue.try_enqueue(update) {
        Ok(()) => {
            log::debug!("[Router] Accepted forward {}", described);
            (StatusCode::ACCEPTED, Json(json!({"accepted": true})))
        }
        Err(e) => {
            log::warn!("[Router] Refusing forward {}: {}", described, e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"error": e.to_string()})),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientRegistry;
    use crate::router::{ForwardSettings, ShardMap};
    use crate::update::Origin;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    fn state(capacity: usize) -> (InboundState, tokio::sync::mpsc::Receiver<crate::dispatch::UpdateJob>) {
        let router = Router::new(
            ShardMap::single("127.0.0.1:3000".into()),
            Arc::new(ClientRegistry::new()),
            ForwardSettings::default(),
            Duration::from_secs(1),
        )
        .unwrap();
        let (queue, rx) = UpdateQueue::new(capacity);
        (
            InboundState {
                router: Arc::new(router),
                queue,
            },
            rx,
        )
    }

    fn forward(uaid: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(format!("/route/{uaid}"))
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    const BODY: &str = r#"{"chid":"c1","version":5,"time":"2026-01-01T00:00:00Z"}"#;

    #[tokio::test]
    async fn test_forward_is_queued_as_peer_update() {
        let (state, mut rx) = state(4);
        let response = shard_routes(state).oneshot(forward("u1", BODY)).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let job = rx.try_recv().unwrap();
        assert_eq!(job.update.uaid, "u1");
        assert_eq!(job.update.chid, "c1");
        assert_eq!(job.update.version, 5);
        assert_eq!(job.update.origin, Origin::Peer);
    }

    #[tokio::test]
    async fn test_malformed_forward_is_rejected() {
        let (state, mut rx) = state(4);
        let response = shard_routes(state)
            .oneshot(forward("u1", r#"{"chid":"c1"}"#))
            .await
            .unwrap();
        assert!(response.status().is_client_error());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_invalid_uaid_is_rejected() {
        let (state, _rx) = state(4);
        let response = shard_routes(state).oneshot(forward("u.1", BODY)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_full_queue_answers_503() {
        let (state, _rx) = state(1);
        let app = shard_routes(state);
        let first = app.clone().oneshot(forward("u1", BODY)).await.unwrap();
        assert_eq!(first.status(), StatusCode::ACCEPTED);
        let second = app.oneshot(forward("u1", BODY)).await.unwrap();
        assert_eq!(second.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_closed_router_answers_503() {
        let (state, mut rx) = state(4);
        state.router.close_all();
        let response = shard_routes(state).oneshot(forward("u1", BODY)).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(rx.try_recv().is_err());
    }
}
