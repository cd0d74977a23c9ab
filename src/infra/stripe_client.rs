use reqwest::Client;
use serde::Deserialize;

use crate::app_error::{AppError, AppResult};
use crate::application::ports::billing_provider::{BillingProviderPort, ProviderSubscription};

const STRIPE_API_BASE: &str = "https://api.stripe.com/v1";

/// Signature timestamps older than this are rejected.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    secret_key: String,
}

impl StripeClient {
    pub fn new(secret_key: String) -> Self {
        Self {
            client: Client::new(),
            secret_key,
        }
    }

    fn auth_header(&self) -> String {
        use base64::Engine;
        let encoded =
            base64::engine::general_purpose::STANDARD.encode(format!("{}:", self.secret_key));
        format!("Basic {}", encoded)
    }

    // ========================================================================
    // Webhook Signature Verification
    // ========================================================================

    /// Verify the provider's webhook signature header.
    ///
    /// Header format: `t=<unix secs>,v1=<hex hmac>,...` where the HMAC-SHA256
    /// is computed over `"<t>.<raw body>"` with the shared webhook secret.
    /// Any matching `v1` entry accepts, provided the timestamp is within
    /// tolerance.
    pub fn verify_webhook_signature(
        payload: &str,
        signature_header: &str,
        webhook_secret: &str,
    ) -> AppResult<()> {
        use hmac::{Hmac, Mac};
        use sha2::Sha256;

        let mut timestamp: Option<&str> = None;
        let mut signatures: Vec<&str> = Vec::new();

        for part in signature_header.split(',') {
            let kv: Vec<&str> = part.splitn(2, '=').collect();
            if kv.len() != 2 {
                continue;
            }
            match kv[0] {
                "t" => timestamp = Some(kv[1]),
                "v1" => signatures.push(kv[1]),
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or(AppError::SignatureInvalid)?;

        if signatures.is_empty() {
            return Err(AppError::SignatureInvalid);
        }

        let signed_payload = format!("{}.{}", timestamp, payload);
        let mut mac = Hmac::<Sha256>::new_from_slice(webhook_secret.as_bytes())
            .map_err(|_| AppError::Internal("HMAC error".into()))?;
        mac.update(signed_payload.as_bytes());
        let expected = hex::encode(mac.finalize().into_bytes());

        for sig in signatures {
            if constant_time_compare(sig, &expected) {
                let ts: i64 = timestamp.parse().map_err(|_| AppError::SignatureInvalid)?;
                let now = chrono::Utc::now().timestamp();
                if (now - ts).abs() > SIGNATURE_TOLERANCE_SECS {
                    return Err(AppError::SignatureInvalid);
                }
                return Ok(());
            }
        }

        Err(AppError::SignatureInvalid)
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn handle_response<T: for<'de> Deserialize<'de>>(
        &self,
        response: reqwest::Response,
    ) -> AppResult<T> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AppError::Provider(format!("failed to read response: {}", e)))?;

        if !status.is_success() {
            tracing::error!(status = %status, body = %body, "billing provider API error");

            if let Ok(error) = serde_json::from_str::<StripeErrorResponse>(&body) {
                return Err(AppError::Provider(
                    error.error.message.unwrap_or(error.error.error_type),
                ));
            }

            return Err(AppError::Provider(format!("{} - {}", status, body)));
        }

        serde_json::from_str(&body).map_err(|e| {
            tracing::error!(body = %body, error = %e, "failed to parse provider response");
            AppError::Provider(format!("unparsable response: {}", e))
        })
    }
}

#[async_trait::async_trait]
impl BillingProviderPort for StripeClient {
    async fn get_subscription(&self, subscription_id: &str) -> AppResult<ProviderSubscription> {
        let response = self
            .client
            .get(format!(
                "{}/subscriptions/{}",
                STRIPE_API_BASE, subscription_id
            ))
            .header("Authorization", self.auth_header())
            .send()
            .await
            .map_err(|e| AppError::Provider(format!("request failed: {}", e)))?;

        self.handle_response(response).await
    }
}

fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}

#[derive(Debug, Deserialize)]
struct StripeErrorResponse {
    error: StripeError,
}

#[derive(Debug, Deserialize)]
struct StripeError {
    #[serde(rename = "type")]
    error_type: String,
    message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    fn sign(payload: &str, secret: &str, timestamp: i64) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{}.{}", timestamp, payload).as_bytes());
        format!(
            "t={},v1={}",
            timestamp,
            hex::encode(mac.finalize().into_bytes())
        )
    }

    #[test]
    fn accepts_valid_signature() {
        let payload = r#"{"id":"evt_1"}"#;
        let secret = "whsec_test";
        let header = sign(payload, secret, chrono::Utc::now().timestamp());

        assert!(StripeClient::verify_webhook_signature(payload, &header, secret).is_ok());
    }

    #[test]
    fn rejects_wrong_secret() {
        let payload = r#"{"id":"evt_1"}"#;
        let header = sign(payload, "whsec_other", chrono::Utc::now().timestamp());

        assert!(matches!(
            StripeClient::verify_webhook_signature(payload, &header, "whsec_test"),
            Err(AppError::SignatureInvalid)
        ));
    }

    #[test]
    fn rejects_tampered_payload() {
        let secret = "whsec_test";
        let header = sign(r#"{"id":"evt_1"}"#, secret, chrono::Utc::now().timestamp());

        assert!(matches!(
            StripeClient::verify_webhook_signature(r#"{"id":"evt_2"}"#, &header, secret),
            Err(AppError::SignatureInvalid)
        ));
    }

    #[test]
    fn rejects_stale_timestamp() {
        let payload = r#"{"id":"evt_1"}"#;
        let secret = "whsec_test";
        let header = sign(payload, secret, chrono::Utc::now().timestamp() - 3600);

        assert!(matches!(
            StripeClient::verify_webhook_signature(payload, &header, secret),
            Err(AppError::SignatureInvalid)
        ));
    }

    #[test]
    fn rejects_malformed_header() {
        let payload = r#"{"id":"evt_1"}"#;

        for header in ["", "garbage", "t=123", "v1=abc"] {
            assert!(matches!(
                StripeClient::verify_webhook_signature(payload, header, "whsec_test"),
                Err(AppError::SignatureInvalid)
            ));
        }
    }

    #[test]
    fn constant_time_compare_basics() {
        assert!(constant_time_compare("abc", "abc"));
        assert!(!constant_time_compare("abc", "abd"));
        assert!(!constant_time_compare("abc", "abcd"));
    }
}
