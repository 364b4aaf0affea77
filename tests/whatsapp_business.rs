//! WhatsApp Business client: outbound delivery through the pipeline against
//! a mocked Graph API.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use channelbridge::channels::{
    ClientContext, ConnectionState, EventSink, OutboundContent, PlatformClient, ReconnectPolicy, SendOptions,
    WhatsAppBusinessClient,
};
use channelbridge::config::WhatsAppBusinessConfig;
use channelbridge::delivery::{
    CircuitConfig, DeadLetterSink, DeliveryAttempt, OutboundPipeline, Quota, RateLimitConfig,
};
use channelbridge::error::LimitType;
use channelbridge::status::InMemoryStatusStore;
use channelbridge::{Platform, SendError};
use parking_lot::Mutex;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[derive(Default)]
struct RecordingSink {
    attempts: Mutex<Vec<DeliveryAttempt>>,
}

#[async_trait]
impl DeadLetterSink for RecordingSink {
    async fn dead_letter(&self, attempt: DeliveryAttempt) {
        self.attempts.lock().push(attempt);
    }
}

fn client(server: &MockServer, pipeline: OutboundPipeline) -> WhatsAppBusinessClient {
    let (events, _rx) = EventSink::channel(16);
    let store = Arc::new(InMemoryStatusStore::new());
    store.register("biz", Platform::WhatsappBusiness);
    let ctx = ClientContext::new(
        "biz",
        ReconnectPolicy::fixed(3, Duration::from_millis(20)),
        events,
        store,
        Arc::new(pipeline),
    );
    let config = WhatsAppBusinessConfig {
        phone_number_id: "555".into(),
        access_token: "graph-token".into(),
        verify_token: "verify".into(),
        app_secret: None,
        api_base: server.uri(),
    };
    WhatsAppBusinessClient::new(config, &ctx)
}

fn roomy() -> RateLimitConfig {
    RateLimitConfig {
        per_recipient: Quota::per_minute(100),
        per_account: Quota::per_minute(100),
    }
}

#[tokio::test]
async fn text_send_posts_to_graph_and_returns_wamid() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/555/messages"))
        .and(header("authorization", "Bearer graph-token"))
        .and(body_partial_json(json!({
            "messaging_product": "whatsapp",
            "to": "15551234567",
            "type": "text",
            "text": {"body": "hello"}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "messaging_product": "whatsapp",
            "messages": [{"id": "wamid.OUT1"}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let wa = client(&server, OutboundPipeline::new(roomy(), CircuitConfig::default()));
    let receipt = wa
        .send("+15551234567", &OutboundContent::text("hello"), &SendOptions::default())
        .await
        .unwrap();
    assert_eq!(receipt.id, "wamid.OUT1");
}

#[tokio::test]
async fn connect_reads_phone_number_metadata() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/555"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "555",
            "display_phone_number": "+1 555 0100",
            "verified_name": "Acme"
        })))
        .mount(&server)
        .await;

    let wa = client(&server, OutboundPipeline::default());
    assert_eq!(wa.connect().await.unwrap(), ConnectionState::Connected);
    wa.disconnect().await;
    assert_eq!(wa.status(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn throttled_send_is_flood_wait_and_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/555/messages"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("Retry-After", "12")
                .set_body_json(json!({"error": {"code": 130429, "message": "Rate limit hit"}})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let sink = Arc::new(RecordingSink::default());
    let wa = client(
        &server,
        OutboundPipeline::new(roomy(), CircuitConfig::default()).with_dead_letter_sink(sink.clone()),
    );
    let err = wa
        .send("15551234567", &OutboundContent::text("hi"), &SendOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.flood_wait_ms(), Some(12_000));
    assert_eq!(sink.attempts.lock().len(), 1);
}

#[tokio::test]
async fn local_quota_rejects_before_any_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/555/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"messages": [{"id": "wamid.X"}]})))
        .expect(2)
        .mount(&server)
        .await;

    let limits = RateLimitConfig {
        per_recipient: Quota::per_minute(2),
        per_account: Quota::per_minute(100),
    };
    let sink = Arc::new(RecordingSink::default());
    let wa = client(
        &server,
        OutboundPipeline::new(limits, CircuitConfig::default()).with_dead_letter_sink(sink.clone()),
    );
    for _ in 0..2 {
        wa.send("15551234567", &OutboundContent::text("hi"), &SendOptions::default())
            .await
            .unwrap();
    }
    let err = wa
        .send("15551234567", &OutboundContent::text("hi"), &SendOptions::default())
        .await
        .unwrap_err();
    match err {
        SendError::RateLimit {
            limit_type,
            retry_after_ms,
        } => {
            assert_eq!(limit_type, LimitType::PerRecipient);
            assert!(retry_after_ms > 0 && retry_after_ms <= 60_000);
        }
        other => panic!("expected rate limit, got {other:?}"),
    }
    // Never reached the transport, so nothing is dead-lettered.
    assert!(sink.attempts.lock().is_empty());
}

#[tokio::test]
async fn repeated_server_errors_open_the_circuit() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/555/messages"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({"error": {"code": 1, "message": "boom"}})))
        .expect(3)
        .mount(&server)
        .await;

    let circuit = CircuitConfig {
        failure_threshold: 3,
        success_threshold: 1,
        reset_timeout: Duration::from_secs(60),
    };
    let wa = client(&server, OutboundPipeline::new(roomy(), circuit));
    for i in 0..3 {
        let err = wa
            .send(&format!("1555000000{i}"), &OutboundContent::text("x"), &SendOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::Transport { .. }), "{err:?}");
    }
    let err = wa
        .send("15550009999", &OutboundContent::text("x"), &SendOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, SendError::CircuitOpen { .. }), "{err:?}");
}

#[tokio::test]
async fn bad_request_is_validation_and_does_not_trip_breaker() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/555/messages"))
        .respond_with(
            ResponseTemplate::new(400).set_body_json(json!({"error": {"code": 100, "message": "Invalid parameter"}})),
        )
        .mount(&server)
        .await;

    let circuit = CircuitConfig {
        failure_threshold: 1,
        success_threshold: 1,
        reset_timeout: Duration::from_secs(60),
    };
    let wa = client(&server, OutboundPipeline::new(roomy(), circuit));
    for _ in 0..3 {
        let err = wa
            .send("15551234567", &OutboundContent::text("x"), &SendOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::Validation(_)), "{err:?}");
    }
}
