use std::net::SocketAddr;

use axum::http::HeaderValue;
use env_helpers::{get_env, get_env_default};
use secrecy::SecretString;

pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub database_url: String,
    pub cors_origin: HeaderValue,
    /// Billing provider API key, used for outbound reads.
    pub billing_secret_key: SecretString,
    /// Webhook shared secret. Absent disables signature verification —
    /// inbound payloads are trusted verbatim (local development only).
    pub billing_webhook_secret: Option<SecretString>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let bind_addr: SocketAddr = get_env_default("BIND_ADDR", "127.0.0.1:3001".parse().unwrap());
        let database_url: String = get_env("DATABASE_URL");
        let cors_origin: HeaderValue =
            get_env_default("CORS_ORIGIN", String::from("http://localhost:3000"))
                .parse()
                .expect("CORS_ORIGIN must be a valid header value");

        let billing_secret_key: SecretString =
            SecretString::new(get_env::<String>("BILLING_SECRET_KEY").into());
        let billing_webhook_secret: Option<SecretString> = std::env::var("BILLING_WEBHOOK_SECRET")
            .ok()
            .filter(|s| !s.is_empty())
            .map(|s| SecretString::new(s.into()));

        Self {
            bind_addr,
            database_url,
            cors_origin,
            billing_secret_key,
            billing_webhook_secret,
        }
    }
}
