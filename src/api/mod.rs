//! HTTP surface of the dashboard core.
//!
//! All routes live under `/api`. Handlers share an [`AppState`] and never
//! touch global state.

mod error;
mod logs;
mod portforward;
mod validation;
mod watch;

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    routing::{get, post},
};
use serde_json::{Value, json};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub use error::ApiError;

use crate::{
    cluster::ClusterClient, config::Config, logstream::StreamRegistry, probe::PortProber,
    registry::SessionRegistry, tunnel::TunnelEstablisher,
};

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionRegistry,
    pub streams: StreamRegistry,
    pub cluster: Arc<dyn ClusterClient>,
    pub prober: PortProber,
    pub establisher: TunnelEstablisher,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(cluster: Arc<dyn ClusterClient>, config: Config) -> Self {
        let sessions = SessionRegistry::new();
        let establisher = TunnelEstablisher::new(
            Arc::clone(&cluster),
            sessions.clone(),
            config.tunnel.ready_timeout(),
            config.tunnel.stop_grace(),
        );

        Self {
            sessions,
            streams: StreamRegistry::new(),
            prober: PortProber::new(config.tunnel.probe_timeout()),
            establisher,
            cluster,
            config: Arc::new(config),
        }
    }
}

/// Build the `/api` router
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/health", get(health))
        .route("/portforward/sessions", get(portforward::list_sessions))
        .route("/portforward/start", post(portforward::start))
        .route("/portforward/stop/{id}", post(portforward::stop))
        .route("/portforward/check/{port}", get(portforward::check_port))
        .route("/logs/stream/{namespace}/{pod}", get(logs::stream))
        .route("/logs/streams", get(logs::list_streams))
        .route("/logs/stop/{id}", post(logs::stop))
        .route("/watch/pods", get(watch::pods));

    let mut app = Router::new()
        .nest("/api", api)
        .layer(TraceLayer::new_for_http());
    if state.config.server.cors {
        app = app.layer(CorsLayer::permissive());
    }
    app.with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "sessions": state.sessions.len().await,
        "streams": state.streams.len().await,
    }))
}

#[cfg(test)]
pub(crate) mod test_support {
    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode},
    };
    use tower::ServiceExt;

    use super::*;
    use crate::cluster::mock::MockCluster;

    pub fn state(cluster: &MockCluster) -> AppState {
        let mut config = Config::default();
        config.tunnel.ready_timeout_secs = 1;
        config.tunnel.stop_grace_secs = 1;
        config.tunnel.probe_timeout_ms = 200;
        AppState::new(Arc::new(cluster.clone()), config)
    }

    /// Send one request through a fresh router and decode the JSON body
    pub async fn call(state: &AppState, request: Request<Body>) -> (StatusCode, Value) {
        let response = router(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    pub fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    pub fn post(uri: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    pub fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }
}
