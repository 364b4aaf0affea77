//! Webhook ingress and health endpoint.

use std::sync::Arc;

use anyhow::Result;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tokio::net::TcpListener;

use crate::channels::whatsapp::SIGNATURE_HEADER;
use crate::channels::WebhookOutcome;
use crate::daemon::AccountManager;

const TELEGRAM_SECRET_HEADER: &str = "X-Telegram-Bot-Api-Secret-Token";

#[derive(Clone)]
pub struct GatewayState {
    pub manager: Arc<AccountManager>,
}

pub fn build_router(manager: Arc<AccountManager>) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route(
            "/webhook/whatsapp/{account_id}",
            get(handle_whatsapp_verify).post(handle_whatsapp_message),
        )
        .route("/webhook/telegram/{account_id}", post(handle_telegram_update))
        .with_state(GatewayState { manager })
}

pub async fn run_gateway(host: &str, port: u16, manager: Arc<AccountManager>) -> Result<()> {
    let listener = TcpListener::bind(format!("{host}:{port}")).await?;
    let addr = listener.local_addr()?;
    tracing::info!("gateway listening on http://{addr}");
    axum::serve(listener, build_router(manager)).await?;
    Ok(())
}

// ── Response helpers ─────────────────────────────────────────────

type ApiResponse = (StatusCode, Json<serde_json::Value>);

fn err_json(status: StatusCode, message: &str) -> ApiResponse {
    (status, Json(serde_json::json!({ "error": message })))
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Forward accepted messages, or answer 401 with the rejection reason.
async fn finish(state: &GatewayState, account_id: &str, outcome: WebhookOutcome) -> ApiResponse {
    if !outcome.validation.valid {
        let reason = outcome.validation.reason.unwrap_or_else(|| "rejected".into());
        tracing::warn!(%account_id, "webhook rejected: {reason}");
        return err_json(StatusCode::UNAUTHORIZED, &reason);
    }
    let accepted = outcome.messages.len();
    for message in outcome.messages {
        state.manager.events().message(message).await;
    }
    (StatusCode::OK, Json(serde_json::json!({ "accepted": accepted })))
}

// ── Handlers ─────────────────────────────────────────────────────

async fn handle_health(State(state): State<GatewayState>) -> ApiResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ok",
            "accounts": state.manager.statuses(),
        })),
    )
}

#[derive(Debug, Deserialize)]
struct VerifyQuery {
    #[serde(rename = "hub.mode", default)]
    mode: String,
    #[serde(rename = "hub.verify_token", default)]
    token: String,
    #[serde(rename = "hub.challenge", default)]
    challenge: String,
}

/// `GET /webhook/whatsapp/{account_id}`: Meta's subscription handshake.
async fn handle_whatsapp_verify(
    State(state): State<GatewayState>,
    Path(account_id): Path<String>,
    Query(query): Query<VerifyQuery>,
) -> Response {
    let Some(client) = state.manager.whatsapp_business(&account_id) else {
        return err_json(StatusCode::NOT_FOUND, "unknown WhatsApp Business account").into_response();
    };
    match client.verify_webhook(&query.mode, &query.token, &query.challenge) {
        Some(challenge) => {
            tracing::info!(%account_id, "WhatsApp webhook verified");
            (StatusCode::OK, challenge).into_response()
        }
        None => {
            tracing::warn!(%account_id, "WhatsApp webhook verification failed");
            (StatusCode::FORBIDDEN, "Forbidden").into_response()
        }
    }
}

async fn handle_whatsapp_message(
    State(state): State<GatewayState>,
    Path(account_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResponse {
    let Some(client) = state.manager.whatsapp_business(&account_id) else {
        return err_json(StatusCode::NOT_FOUND, "unknown WhatsApp Business account");
    };
    let outcome = client.process_webhook(&body, header(&headers, SIGNATURE_HEADER));
    finish(&state, &account_id, outcome).await
}

async fn handle_telegram_update(
    State(state): State<GatewayState>,
    Path(account_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResponse {
    let Some(client) = state.manager.telegram_bot(&account_id) else {
        return err_json(StatusCode::NOT_FOUND, "unknown Telegram bot account");
    };
    let outcome = client.process_webhook(&body, header(&headers, TELEGRAM_SECRET_HEADER));
    finish(&state, &account_id, outcome).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::webhook::sign_hmac_sha256;
    use crate::channels::{ChannelEvent, EventSink};
    use crate::config::{
        AccountConfig, Config, PlatformCredentials, TelegramBotConfig, UpdateMode, WhatsAppBusinessConfig,
    };
    use axum::body::Body;
    use axum::http::Request;
    use tempfile::TempDir;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    const WA_BODY: &str = r#"{"object":"whatsapp_business_account","entry":[{"id":"1","changes":[{"field":"messages","value":{"contacts":[{"wa_id":"15551234567","profile":{"name":"Ann"}}],"messages":[{"from":"15551234567","id":"wamid.A1","timestamp":"1700000000","type":"text","text":{"body":"hello"}}]}}]}]}"#;

    fn setup() -> (TempDir, Router, mpsc::Receiver<ChannelEvent>) {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.workspace_dir = tmp.path().join("workspace");
        config.media.enabled = false;
        config.accounts = vec![
            AccountConfig {
                id: "biz".into(),
                enabled: true,
                allowed_senders: vec![],
                reconnect: None,
                platform: PlatformCredentials::WhatsappBusiness(WhatsAppBusinessConfig {
                    phone_number_id: "123".into(),
                    access_token: "token".into(),
                    verify_token: "verify-me".into(),
                    app_secret: Some("app-secret".into()),
                    api_base: "http://127.0.0.1:9".into(),
                }),
            },
            AccountConfig {
                id: "bot".into(),
                enabled: true,
                allowed_senders: vec![],
                reconnect: None,
                platform: PlatformCredentials::TelegramBot(TelegramBotConfig {
                    bot_token: "1:x".into(),
                    mode: UpdateMode::Webhook,
                    webhook_url: None,
                    webhook_secret: Some("tg-secret".into()),
                    api_base: "http://127.0.0.1:9".into(),
                    poll_timeout_secs: 1,
                }),
            },
        ];
        let (events, rx) = EventSink::channel(16);
        let manager = Arc::new(AccountManager::builder(config).build(events).unwrap());
        (tmp, build_router(manager), rx)
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn verify_echoes_challenge() {
        let (_tmp, app, _rx) = setup();
        let response = app
            .clone()
            .oneshot(
                Request::get("/webhook/whatsapp/biz?hub.mode=subscribe&hub.verify_token=verify-me&hub.challenge=42")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "42");

        let response = app
            .oneshot(
                Request::get("/webhook/whatsapp/biz?hub.mode=subscribe&hub.verify_token=nope&hub.challenge=42")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn signed_whatsapp_delivery_is_forwarded() {
        let (_tmp, app, mut rx) = setup();
        let signature = sign_hmac_sha256("app-secret", WA_BODY.as_bytes()).unwrap();
        let response = app
            .oneshot(
                Request::post("/webhook/whatsapp/biz")
                    .header(SIGNATURE_HEADER, signature)
                    .body(Body::from(WA_BODY))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_text(response).await.contains("\"accepted\":1"));

        let Some(ChannelEvent::Message(msg)) = rx.recv().await else {
            panic!("expected a message event");
        };
        assert_eq!(msg.external_id, "wamid.A1");
        assert_eq!(msg.text.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn bad_signature_is_401_with_reason() {
        let (_tmp, app, mut rx) = setup();
        let response = app
            .oneshot(
                Request::post("/webhook/whatsapp/biz")
                    .header(SIGNATURE_HEADER, "sha256=deadbeef")
                    .body(Body::from(WA_BODY))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(body_text(response).await.contains("error"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn telegram_secret_token_is_enforced() {
        let (_tmp, app, mut rx) = setup();
        let update = r#"{"update_id":1,"message":{"message_id":7,"date":1700000000,"chat":{"id":99,"type":"private"},"from":{"id":99,"is_bot":false,"first_name":"Ann"},"text":"hi"}}"#;

        let response = app
            .clone()
            .oneshot(Request::post("/webhook/telegram/bot").body(Body::from(update)).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(
                Request::post("/webhook/telegram/bot")
                    .header(TELEGRAM_SECRET_HEADER, "tg-secret")
                    .body(Body::from(update))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let Some(ChannelEvent::Message(msg)) = rx.recv().await else {
            panic!("expected a message event");
        };
        assert_eq!(msg.external_id, "99:7");
    }

    #[tokio::test]
    async fn unknown_account_is_404_and_health_lists_accounts() {
        let (_tmp, app, _rx) = setup();
        let response = app
            .clone()
            .oneshot(Request::post("/webhook/telegram/missing").body(Body::from("{}")).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body["accounts"].as_array().unwrap().len(), 2);
        assert_eq!(body["accounts"][0]["status"], "disconnected");
    }
}
