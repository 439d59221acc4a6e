//! Local HTTP control surface.
//!
//! `POST /relay/send` hands a JSON request to the outbound path and answers
//! `{"status":"ok"}` once the publish attempt has been made, whether or not it
//! succeeded. `POST /libp2p/send` is kept as an alias for existing tunnel
//! deployments. `GET /relay/status` reports identity and counters.

use std::collections::BTreeMap;

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{debug, warn};

use crate::router::{MessageRouter, SendError};

#[derive(Clone)]
struct ControlState {
    router: MessageRouter,
    peer_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub did: String,
    pub peer_id: String,
    pub topic: String,
    pub counters: BTreeMap<String, u64>,
}

pub fn control_router(router: MessageRouter, peer_id: impl Into<String>) -> Router {
    let state = ControlState {
        router,
        peer_id: peer_id.into(),
    };
    Router::new()
        .route("/relay/send", post(send))
        .route("/libp2p/send", post(send))
        .route("/relay/status", get(status))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(false))
                .on_response(DefaultOnResponse::new().include_headers(false)),
        )
        .with_state(state)
}

fn invalid_request(reason: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": "Invalid JSON", "reason": reason.into()})),
    )
        .into_response()
}

async fn send(State(state): State<ControlState>, body: Bytes) -> Response {
    let request: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(err) => return invalid_request(err.to_string()),
    };
    match state.router.send_outbound(request).await {
        Ok(_) => {}
        Err(SendError::Envelope(err)) => {
            debug!(error = %err, "rejecting request without a string recipient");
            return invalid_request(err.to_string());
        }
        Err(SendError::Publish(err)) => {
            warn!(error = %err, "publish failed; acknowledging anyway");
        }
    }
    Json(json!({"status": "ok"})).into_response()
}

async fn status(State(state): State<ControlState>) -> Json<StatusReport> {
    let router = &state.router;
    Json(StatusReport {
        did: router.did().to_string(),
        peer_id: state.peer_id.clone(),
        topic: router.topic_name().to_owned(),
        counters: router.telemetry().snapshot().counters,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{body::Body, http::Request};
    use pretty_assertions::assert_eq;
    use sight_identity::Did;
    use sight_overlay::{MemoryOverlay, OverlayHost, PeerId, RELAY_TOPIC};
    use sight_telemetry::{metrics, TelemetryHandle};
    use tower::ServiceExt;

    use super::*;
    use crate::tunnel::HttpTunnel;

    struct Fixture {
        app: Router,
        host: sight_overlay::MemoryHost,
        overlay: MemoryOverlay,
        telemetry: TelemetryHandle,
    }

    async fn fixture() -> Fixture {
        let overlay = MemoryOverlay::default();
        let host = overlay.host();
        let topic = host.join(RELAY_TOPIC).await.unwrap();
        let tunnel = HttpTunnel::new(
            "http://127.0.0.1:9/unused",
            std::time::Duration::from_millis(100),
        )
        .unwrap();
        let telemetry = TelemetryHandle::default();
        let router = MessageRouter::new(
            Did::from("did:sight:hoster:me"),
            topic,
            Arc::new(tunnel),
            telemetry.clone(),
        );
        let app = control_router(router, host.peer_id().to_string());
        Fixture {
            app,
            host,
            overlay,
            telemetry,
        }
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_owned()))
            .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn send_publishes_and_acknowledges() {
        let fixture = fixture().await;
        let observer = fixture.overlay.host().join(RELAY_TOPIC).await.unwrap();
        let mut observed = observer.subscribe().await.unwrap();

        let response = fixture
            .app
            .oneshot(post_json("/relay/send", r#"{"to":"x"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({"status": "ok"}));

        let published: Value =
            serde_json::from_slice(&observed.next().await.unwrap().data).unwrap();
        assert_eq!(published, json!({"to": "x", "payload": {"to": "x"}}));
    }

    #[tokio::test]
    async fn send_acknowledges_even_when_publish_fails() {
        let fixture = fixture().await;
        fixture.host.close().await;

        let response = fixture
            .app
            .oneshot(post_json("/relay/send", r#"{"to":"x"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({"status": "ok"}));
        assert_eq!(fixture.telemetry.counter(metrics::OUTBOUND_PUBLISH_FAILED), 1);
    }

    #[tokio::test]
    async fn invalid_json_is_a_bad_request() {
        let fixture = fixture().await;
        let response = fixture
            .app
            .oneshot(post_json("/relay/send", "{\"to\":"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], "Invalid JSON");
    }

    #[tokio::test]
    async fn request_without_recipient_is_a_bad_request() {
        let fixture = fixture().await;
        let response = fixture
            .app
            .clone()
            .oneshot(post_json("/relay/send", r#"{"foo":1}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let response = fixture
            .app
            .oneshot(post_json("/relay/send", "[1,2,3]"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn legacy_send_route_is_served() {
        let fixture = fixture().await;
        let response = fixture
            .app
            .oneshot(post_json("/libp2p/send", r#"{"to":"gateway"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn status_reports_identity_and_counters() {
        let fixture = fixture().await;
        fixture
            .telemetry
            .record_counter(metrics::INBOUND_FORWARDED, 3)
            .unwrap();
        let peer_id: PeerId = fixture.host.peer_id();
        let response = fixture
            .app
            .oneshot(
                Request::builder()
                    .uri("/relay/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["did"], "did:sight:hoster:me");
        assert_eq!(body["peerId"], peer_id.to_string());
        assert_eq!(body["topic"], RELAY_TOPIC);
        assert_eq!(body["counters"][metrics::INBOUND_FORWARDED], 3);
    }
}
