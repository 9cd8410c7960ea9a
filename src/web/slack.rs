//! Slack slash commands and interactive payloads, one signed endpoint.

use crate::responders::{InteractionPayload, SlashCommand};
use crate::slack::signature;
use crate::web::routes::AppState;
use axum::{
    body::{to_bytes, Body},
    extract::{Form, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use chrono::Utc;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Slack never sends more than this in one request
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Buffer the body, check `X-Slack-Signature`, then hand the body on
pub async fn verify_signature(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let (parts, body) = request.into_parts();
    let bytes = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("Failed to read Slack request body: {}", e);
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    if !state.slack_signing_secret.is_empty() {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string()
        };
        if let Err(e) = signature::verify(
            &state.slack_signing_secret,
            &header("X-Slack-Request-Timestamp"),
            &header("X-Slack-Signature"),
            &bytes,
            Utc::now().timestamp(),
        ) {
            warn!("Rejected Slack request: {}", e);
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    next.run(Request::from_parts(parts, Body::from(bytes))).await
}

/// `POST /api/services/slack/events`
pub async fn handle_event(State(state): State<AppState>, Form(fields): Form<HashMap<String, String>>) -> Response {
    if let Some(payload) = fields.get("payload") {
        let payload: InteractionPayload = match serde_json::from_str(payload) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Unreadable Slack interaction payload: {}", e);
                return StatusCode::BAD_REQUEST.into_response();
            }
        };
        // Slack wants an ack inside three seconds, the work happens after
        let slack = state.slack.clone();
        tokio::spawn(async move {
            slack.handle_interaction(&payload).await;
        });
        return StatusCode::OK.into_response();
    }

    if fields.contains_key("command") {
        let command: SlashCommand = match serde_json::to_value(&fields).and_then(serde_json::from_value) {
            Ok(command) => command,
            Err(e) => {
                warn!("Unreadable Slack command: {}", e);
                return StatusCode::BAD_REQUEST.into_response();
            }
        };
        if command.command != state.slack.link_command() {
            debug!("Ignoring Slack command {}", command.command);
            return StatusCode::OK.into_response();
        }
        return Json(state.slack.handle_link_command(&command).await).into_response();
    }

    StatusCode::BAD_REQUEST.into_response()
}
