use std::sync::Arc;

use axum::{
    Json,
    extract::{
        Path, Query, State, WebSocketUpgrade,
        ws::WebSocket,
    },
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use super::{AppState, ApiError, validation::validate_target};
use crate::{
    config::LogsConfig,
    logstream::{LogStreamController, LogStreamOptions, StreamInfo, StreamTimings},
    relay::WsConnection,
};

/// Query string of the log stream endpoint
///
/// Values are kept as strings so a malformed number falls back to the
/// default instead of rejecting the request.
#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    pub tail: Option<String>,
    pub follow: Option<String>,
    pub buffer: Option<String>,
}

impl StreamQuery {
    pub fn options(&self, defaults: &LogsConfig) -> LogStreamOptions {
        let tail_lines = self
            .tail
            .as_deref()
            .and_then(|t| t.trim().parse::<i64>().ok())
            .filter(|t| *t >= 0)
            .unwrap_or(defaults.default_tail_lines);
        let buffer_size = self
            .buffer
            .as_deref()
            .and_then(|b| b.trim().parse::<usize>().ok())
            .filter(|b| *b > 0)
            .unwrap_or(defaults.default_buffer_size);

        LogStreamOptions {
            tail_lines,
            follow: self.follow.as_deref() == Some("true"),
            buffer_size,
        }
    }
}

pub async fn stream(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path((namespace, pod)): Path<(String, String)>,
    Query(query): Query<StreamQuery>,
) -> Result<Response, ApiError> {
    validate_target(&namespace, &pod)?;
    let options = query.options(&state.config.logs);

    Ok(ws
        .on_upgrade(move |socket| run_stream(state, socket, namespace, pod, options))
        .into_response())
}

async fn run_stream(
    state: AppState,
    socket: WebSocket,
    namespace: String,
    pod: String,
    options: LogStreamOptions,
) {
    let info = StreamInfo::new(&namespace, &pod, options);
    let id = info.id.clone();
    let cancel = info.cancel_token().clone();
    state.streams.add(info).await;

    let connection = WsConnection::start(
        socket,
        options.buffer_size,
        state.config.logs.write_timeout(),
        cancel.clone(),
    );
    let controller = LogStreamController::new(
        Arc::clone(&state.cluster),
        &namespace,
        &pod,
        options,
        StreamTimings::from(&state.config.logs),
        cancel,
        connection,
    );
    let connection = controller.run().await;

    state.streams.remove(&id).await;
    connection.close().await;
    debug!(id = %id, "Log stream connection closed");
}

pub async fn list_streams(State(state): State<AppState>) -> Json<Value> {
    let streams = state.streams.list().await;
    Json(json!({
        "count": streams.len(),
        "streams": streams,
    }))
}

pub async fn stop(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if !state.streams.stop(&id).await {
        return Err(ApiError::not_found(
            "Log stream not found",
            format!("No active log stream with id {id}"),
        ));
    }

    Ok(Json(json!({
        "message": "Log stream stopped",
        "stream": id,
    })))
}
