use std::sync::Arc;

use axum::{
    extract::{Query, State, WebSocketUpgrade},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::{AppState, ApiError, validation::is_valid_namespace};
use crate::{relay::WsConnection, watch::watch_pods};

const DEFAULT_NAMESPACE: &str = "default";

#[derive(Debug, Default, Deserialize)]
pub struct WatchQuery {
    pub namespace: Option<String>,
}

impl WatchQuery {
    fn namespace(&self) -> &str {
        self.namespace
            .as_deref()
            .filter(|ns| !ns.is_empty())
            .unwrap_or(DEFAULT_NAMESPACE)
    }
}

pub async fn pods(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WatchQuery>,
) -> Result<Response, ApiError> {
    let namespace = query.namespace().to_string();
    if !is_valid_namespace(&namespace) {
        return Err(ApiError::bad_request(
            "Invalid namespace",
            "Namespace must match Kubernetes naming conventions",
        ));
    }

    Ok(ws
        .on_upgrade(move |socket| async move {
            let closed = CancellationToken::new();
            let connection = WsConnection::start(
                socket,
                state.config.logs.default_buffer_size,
                state.config.logs.write_timeout(),
                closed.clone(),
            );
            let connection =
                watch_pods(Arc::clone(&state.cluster), &namespace, closed, connection).await;
            connection.close().await;
        })
        .into_response())
}
