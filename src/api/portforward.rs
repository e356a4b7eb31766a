use std::{sync::Arc, time::Duration};

use axum::{
    Json,
    extract::{Path, State, rejection::JsonRejection},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use super::{AppState, ApiError, validation::validate_target};
use crate::{
    cluster::pod_phase,
    forwarding::PortPair,
    session::{Session, SessionStatus},
};

/// Margin on top of the readiness timeout for the start handler's wait
const SETTLE_MARGIN: Duration = Duration::from_secs(1);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub pod: String,
    pub namespace: String,
    pub remote_port: i64,
    pub local_port: i64,
}

impl StartRequest {
    /// Validated `(local, remote)` pair
    fn port_pair(&self) -> Result<PortPair, ApiError> {
        let remote = u16::try_from(self.remote_port)
            .ok()
            .filter(|p| *p >= 1)
            .ok_or_else(|| {
                ApiError::bad_request(
                    "Invalid request data",
                    "remotePort must be between 1 and 65535",
                )
            })?;
        let local = u16::try_from(self.local_port)
            .ok()
            .filter(|p| *p >= 1024)
            .ok_or_else(|| {
                ApiError::bad_request(
                    "Invalid request data",
                    "localPort must be between 1024 and 65535",
                )
            })?;
        Ok(PortPair::new(local, remote))
    }
}

pub async fn list_sessions(State(state): State<AppState>) -> Json<Value> {
    let sessions = state.sessions.summaries().await;
    Json(json!({
        "count": sessions.len(),
        "sessions": sessions,
    }))
}

pub async fn start(
    State(state): State<AppState>,
    payload: Result<Json<StartRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(req) =
        payload.map_err(|e| ApiError::bad_request("Invalid request data", e.body_text()))?;
    let pair = req.port_pair()?;
    validate_target(&req.namespace, &req.pod)?;

    if state.prober.is_port_in_use(pair.local_port).await {
        return Err(ApiError::conflict(
            "Port already in use",
            format!("Port {} is already in use on localhost", pair.local_port),
        ));
    }

    let pod = state
        .cluster
        .get_pod(&req.namespace, &req.pod)
        .await
        .map_err(|e| {
            if e.is_not_found() {
                ApiError::not_found(
                    "Pod not found",
                    format!(
                        "Pod {}/{} does not exist or is not accessible",
                        req.namespace, req.pod
                    ),
                )
            } else {
                e.into()
            }
        })?;

    let phase = pod_phase(&pod);
    if phase != "Running" {
        return Err(ApiError::bad_request(
            "Pod not ready",
            format!(
                "Pod {}/{} is not running (current status: {})",
                req.namespace, req.pod, phase
            ),
        ));
    }

    let session = Arc::new(Session::new(&req.namespace, &req.pod, vec![pair])?);
    if !state.sessions.add(Arc::clone(&session)).await {
        return Err(ApiError::conflict(
            "Session already exists",
            format!("A session with id {} is already registered", session.id()),
        ));
    }
    state.establisher.spawn(Arc::clone(&session));

    let limit = state.config.tunnel.ready_timeout() + SETTLE_MARGIN;
    let settled = session.wait_until_settled(limit).await;
    if settled.status != SessionStatus::Running {
        warn!(
            id = session.id(),
            status = %settled.status,
            "Port-forward did not start"
        );
        state.sessions.stop(session.id()).await;
        state.sessions.remove(session.id()).await;
        return Err(ApiError::internal(
            "Port-forward failed to start",
            settled
                .error
                .unwrap_or_else(|| "Failed to establish port-forward connection".to_string()),
        ));
    }

    info!(id = session.id(), url = session.url(), "Port-forward started");
    Ok(Json(json!({
        "success": true,
        "session": session.summary(),
        "message": format!(
            "Port-forward started successfully: localhost:{} → {}/{}:{}",
            pair.local_port,
            session.namespace(),
            session.pod(),
            pair.remote_port
        ),
    })))
}

pub async fn stop(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let not_found = || {
        ApiError::not_found(
            "Session not found",
            format!("No port-forward session with id {id}"),
        )
    };

    let session = state.sessions.get(&id).await.ok_or_else(not_found)?;
    if !state.sessions.stop(&id).await {
        return Err(not_found());
    }

    // the establisher removes the session once the tunnel has unwound
    let limit = state.config.tunnel.stop_grace() + SETTLE_MARGIN;
    let final_state = session.wait_until_terminal(limit).await;
    if !final_state.status.is_terminal() {
        warn!(id = %id, "Port-forward did not stop within {:?}", limit);
        return Err(ApiError::internal(
            "Failed to stop session",
            format!(
                "Port-forward {id} is still {} after {}s",
                final_state.status,
                limit.as_secs()
            ),
        ));
    }

    Ok(Json(json!({
        "success": true,
        "message": format!(
            "Port-forward stopped for {}/{}",
            session.namespace(),
            session.pod()
        ),
        "session": session.summary(),
    })))
}

pub async fn check_port(
    State(state): State<AppState>,
    Path(port): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let port = port
        .parse::<u16>()
        .ok()
        .filter(|p| *p >= 1)
        .ok_or_else(|| {
            ApiError::bad_request(
                "Invalid port number",
                "Port must be a number between 1 and 65535",
            )
        })?;

    let available = !state.prober.is_port_in_use(port).await;
    Ok(Json(json!({
        "port": port,
        "available": available,
    })))
}
