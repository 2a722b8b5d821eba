use axum::{extract::State, http::StatusCode, Json};
use pricebot_chat::decode_update;
use serde::Serialize;
use tracing::{debug, info};

use crate::health::AppState;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WebhookAck {
    pub ok: bool,
    pub accepted: bool,
}

/// Acknowledges every update at once. Text messages go through the gateway
/// in a detached task, which runs to completion so the conversation slot it
/// takes is always released.
pub async fn receive(
    State(state): State<AppState>,
    Json(update): Json<serde_json::Value>,
) -> (StatusCode, Json<WebhookAck>) {
    let Some(message) = decode_update(&update) else {
        debug!(event_name = "system.webhook.ignored", "update carries no text message");
        return (StatusCode::OK, Json(WebhookAck { ok: true, accepted: false }));
    };

    let gateway = state.gateway.clone();
    tokio::spawn(async move {
        let user_id = message.user_id.clone();
        let outcome = gateway.handle_event(message).await;
        info!(
            event_name = "system.webhook.handled",
            user_id = %user_id,
            outcome = ?outcome,
            "webhook message handled"
        );
    });

    (StatusCode::OK, Json(WebhookAck { ok: true, accepted: true }))
}
