//! Status HTTP API.
//!
//! Two routes over the registry:
//! - `GET /healthz`: liveness for orchestrators, 200 only when every
//!   registered source is healthy
//! - `GET /status`: full per-source status snapshots as JSON

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};

use crate::core::CoreStatus;
use crate::registry::ConnectorRegistry;

/// Shared state for the status handlers.
#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<ConnectorRegistry>,
}

// ---------------------------------------------------------------------------
// HTTP handlers
// ---------------------------------------------------------------------------

async fn healthz(State(state): State<Arc<ApiState>>) -> (StatusCode, String) {
    if state.registry.is_empty() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "no sources registered".to_string(),
        );
    }
    if !state.registry.all_healthy() {
        let unhealthy: Vec<String> = state
            .registry
            .statuses()
            .into_iter()
            .filter(|status| !status.healthy)
            .map(|status| status.source)
            .collect();
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            format!("unhealthy sources: {}", unhealthy.join(", ")),
        );
    }
    (StatusCode::OK, "ok".to_string())
}

async fn status(State(state): State<Arc<ApiState>>) -> Json<Vec<CoreStatus>> {
    Json(state.registry.statuses())
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/status", get(status))
        .with_state(Arc::new(state))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::Value;
    use tower::util::ServiceExt;

    use super::*;
    use crate::config::ActiveConfig;
    use crate::core::ConnectorCore;
    use crate::handler::SourceHandler;
    use crate::protocol::Envelope;
    use crate::session::socket::fake::{FakeBehavior, FakeDialer};
    use crate::session::{SessionSender, SessionSettings, SocketDialer};
    use crate::settings::ConnectorSettings;

    struct NullHandler;

    #[async_trait]
    impl SourceHandler for NullHandler {
        fn name(&self) -> &str {
            "null"
        }

        async fn on_configure(
            &self,
            _session: SessionSender,
            _config: &ActiveConfig,
        ) -> anyhow::Result<()> {
            Ok(())
        }

        async fn on_publish(&self, _envelope: Envelope) -> anyhow::Result<()> {
            Ok(())
        }

        async fn on_query(&self, _envelope: Envelope) -> anyhow::Result<Value> {
            Ok(Value::Null)
        }
    }

    fn add_core(registry: &ConnectorRegistry, source: &str, behavior: FakeBehavior) {
        let dialer = FakeDialer::new(behavior);
        let core = ConnectorCore::with_dialer(
            SessionSettings::new("ws://platform.test/link", "token-1", source),
            dialer as Arc<dyn SocketDialer>,
            Arc::new(NullHandler),
            &ConnectorSettings::default(),
        );
        registry.register(core).unwrap();
    }

    fn make_app(registry: Arc<ConnectorRegistry>) -> Router {
        create_router(ApiState { registry })
    }

    async fn get_response(app: Router, uri: &str) -> (StatusCode, String) {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn healthz_with_no_sources_is_unavailable() {
        let registry = Arc::new(ConnectorRegistry::new());
        let (status, body) = get_response(make_app(registry), "/healthz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body.contains("no sources registered"));
    }

    #[tokio::test]
    async fn healthz_names_the_unhealthy_sources() {
        let registry = Arc::new(ConnectorRegistry::new());
        add_core(&registry, "sensor-a", FakeBehavior::accept());
        // Never started, so the session sits in Disconnected.
        let (status, body) = get_response(make_app(registry), "/healthz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body.contains("sensor-a"), "got: {body}");
    }

    #[tokio::test]
    async fn healthz_is_ok_once_every_source_is_connected() {
        let registry = Arc::new(ConnectorRegistry::new());
        add_core(&registry, "sensor-a", FakeBehavior::accept());
        add_core(&registry, "sensor-b", FakeBehavior::accept());
        assert_eq!(registry.start_all(Duration::from_secs(1)).await, 2);

        let (status, body) = get_response(make_app(Arc::clone(&registry)), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");

        registry.stop_all().await;
    }

    #[tokio::test]
    async fn status_lists_every_source_with_session_state() {
        let registry = Arc::new(ConnectorRegistry::new());
        add_core(&registry, "beta", FakeBehavior::accept());
        add_core(&registry, "alpha", FakeBehavior::accept());
        registry.get("beta").unwrap().start(Duration::from_secs(1)).await;

        let (status, body) = get_response(make_app(Arc::clone(&registry)), "/status").await;
        assert_eq!(status, StatusCode::OK);

        let entries: Vec<Value> = serde_json::from_str(&body).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["source"], "alpha");
        assert_eq!(entries[0]["sessionState"], "disconnected");
        assert_eq!(entries[0]["healthy"], false);
        assert_eq!(entries[1]["source"], "beta");
        assert_eq!(entries[1]["sessionState"], "sourceConnected");
        assert_eq!(entries[1]["healthy"], true);
        assert_eq!(entries[1]["dispatch"]["answered"], 0);

        registry.get("beta").unwrap().stop().await;
    }
}
