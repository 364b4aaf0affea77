//! Webhook ingress shared by the WhatsApp Business and Telegram Bot clients.

use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;

use super::message::UnifiedMessage;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebhookValidation {
    pub valid: bool,
    pub reason: Option<String>,
}

impl WebhookValidation {
    pub fn ok() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebhookOutcome {
    pub messages: Vec<UnifiedMessage>,
    pub validation: WebhookValidation,
}

impl WebhookOutcome {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            messages: Vec::new(),
            validation: WebhookValidation::rejected(reason),
        }
    }
}

/// `hub.mode` / `hub.verify_token` handshake. Returns the challenge to echo.
pub fn verify_subscription(expected_token: &str, mode: &str, token: &str, challenge: &str) -> Option<String> {
    if mode == "subscribe" && !expected_token.is_empty() && constant_time_eq(token.as_bytes(), expected_token.as_bytes()) {
        Some(challenge.to_string())
    } else {
        None
    }
}

/// Check `sha256=<hex>` against an HMAC-SHA256 of the raw body.
pub fn verify_hmac_sha256(secret: &str, body: &[u8], header: Option<&str>) -> WebhookValidation {
    let Some(header) = header else {
        return WebhookValidation::rejected("missing signature header");
    };
    let Some(hex_sig) = header.strip_prefix("sha256=") else {
        return WebhookValidation::rejected("signature header must start with sha256=");
    };
    let Ok(expected) = hex::decode(hex_sig) else {
        return WebhookValidation::rejected("signature is not valid hex");
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return WebhookValidation::rejected("unusable signing secret");
    };
    mac.update(body);
    if mac.verify_slice(&expected).is_ok() {
        WebhookValidation::ok()
    } else {
        WebhookValidation::rejected("signature mismatch")
    }
}

/// Compute the header value a sender would attach. Used by tests and tools.
pub fn sign_hmac_sha256(secret: &str, body: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(body);
    Some(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

/// Length-revealing, content-constant-time comparison.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_handshake() {
        assert_eq!(
            verify_subscription("verify", "subscribe", "verify", "c123").as_deref(),
            Some("c123")
        );
        assert!(verify_subscription("verify", "subscribe", "wrong", "c").is_none());
        assert!(verify_subscription("verify", "unsubscribe", "verify", "c").is_none());
        assert!(verify_subscription("", "subscribe", "", "c").is_none());
    }

    #[test]
    fn hmac_accepts_own_signature() {
        let body = br#"{"entry":[]}"#;
        let header = sign_hmac_sha256("app-secret", body).unwrap();
        assert!(verify_hmac_sha256("app-secret", body, Some(&header)).valid);
    }

    #[test]
    fn hmac_rejections_carry_reason() {
        let body = b"payload";
        let header = sign_hmac_sha256("app-secret", body).unwrap();

        let tampered = verify_hmac_sha256("app-secret", b"payload!", Some(&header));
        assert_eq!(tampered.reason.as_deref(), Some("signature mismatch"));

        assert!(!verify_hmac_sha256("app-secret", body, None).valid);
        assert!(!verify_hmac_sha256("app-secret", body, Some("md5=abc")).valid);
        assert!(!verify_hmac_sha256("app-secret", body, Some("sha256=zz")).valid);
    }

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }
}
