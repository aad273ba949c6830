//! Outbound WhatsApp delivery via the Vonage Messages API. Strictly
//! fire-and-forget from the ticket lifecycle's point of view: a provider
//! failure surfaces as transport_unavailable and never touches ticket state.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use crate::config::WhatsAppConfig;
use crate::shared::error::ApiError;
use crate::shared::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SendWhatsAppRequest {
    pub to: Option<String>,
    pub body: Option<String>,
}

pub struct WhatsAppSender {
    client: reqwest::Client,
    config: WhatsAppConfig,
}

impl WhatsAppSender {
    pub fn new(config: WhatsAppConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    pub async fn send(&self, to: &str, body: &str) -> Result<serde_json::Value, ApiError> {
        let payload = json!({
            "channel": "whatsapp",
            "message_type": "text",
            "to": to,
            "from": self.config.from_number,
            "text": body,
        });

        let response = self
            .client
            .post(&self.config.api_url)
            .basic_auth(&self.config.api_key, Some(&self.config.api_secret))
            .json(&payload)
            .send()
            .await
            .map_err(|e| ApiError::TransportUnavailable(format!("whatsapp send failed: {e}")))?;

        if !response.status().is_success() {
            return Err(ApiError::TransportUnavailable(format!(
                "whatsapp provider returned {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| ApiError::TransportUnavailable(format!("bad provider response: {e}")))
    }
}

async fn send_whatsapp(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SendWhatsAppRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (Some(to), Some(body)) = (req.to, req.body) else {
        return Err(ApiError::Validation("missing \"to\" or \"body\"".to_string()));
    };

    let config = state
        .config
        .whatsapp
        .clone()
        .ok_or_else(|| ApiError::TransportUnavailable("whatsapp is not configured".to_string()))?;

    let sender = WhatsAppSender::new(config);
    let response = sender.send(&to, &body).await?;
    tracing::info!(%to, "whatsapp message relayed");

    Ok(Json(json!({ "status": "sent", "response": response })))
}

pub fn configure_whatsapp_routes() -> Router<Arc<AppState>> {
    Router::new().route("/api/whatsapp/send_whatsapp", post(send_whatsapp))
}
