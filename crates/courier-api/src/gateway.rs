use axum::{
    extract::{
        Query, State,
        ws::{WebSocketUpgrade, rejection::WebSocketUpgradeRejection},
    },
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::debug;

use courier_core::ChatError;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct GatewayQuery {
    pub token: Option<String>,
}

/// Browsers cannot set headers on a WebSocket handshake, so the token rides
/// in the query string. It is checked before the upgrade is accepted.
pub async fn upgrade(
    State(state): State<AppState>,
    Query(query): Query<GatewayQuery>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let claims = match query.token.as_deref().map(|token| state.verifier.verify(token)) {
        Some(Ok(claims)) => claims,
        Some(Err(e)) => return ApiError(e).into_response(),
        None => return ApiError(ChatError::Unauthorized).into_response(),
    };

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            debug!("Gateway upgrade for {} rejected: {}", claims.sub, rejection);
            return rejection.into_response();
        }
    };

    let courier = state.courier.clone();
    ws.on_upgrade(move |socket| {
        courier_gateway::handle_connection(socket, courier, claims.sub, claims.username)
    })
}
