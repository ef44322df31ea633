//! Inbound chat endpoint: one HTTP request becomes one relayed dispatch.

use std::time::Duration;

use {
    axum::{
        Json,
        extract::{Path, Query, State, rejection::JsonRejection},
    },
    botlink_protocol::MAX_DISPATCH_TIMEOUT_MS,
    serde::Deserialize,
    serde_json::Value,
};

use crate::{error::ApiError, server::AppState};

#[derive(Debug, Default, Deserialize)]
pub struct ChatQuery {
    /// Overrides the configured bot response timeout for this request.
    pub timeout_ms: Option<u64>,
}

impl ChatQuery {
    fn timeout(&self) -> Result<Option<Duration>, ApiError> {
        match self.timeout_ms {
            None => Ok(None),
            Some(0) => Err(ApiError::bad_request("timeout_ms must be positive")),
            Some(ms) => Ok(Some(Duration::from_millis(ms.min(MAX_DISPATCH_TIMEOUT_MS)))),
        }
    }
}

/// `POST {chat_path}/{bot}`: relay the JSON body to the bot's worker and
/// answer with its reply.
pub async fn chat_handler(
    State(state): State<AppState>,
    Path(bot): Path<String>,
    Query(query): Query<ChatQuery>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(payload) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let timeout = query.timeout()?;
    let reply = state.relay.dispatch(&bot, payload, timeout).await?;
    Ok(Json(reply))
}
