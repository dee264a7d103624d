//! IAM token acquisition for the Yandex Cloud search API.
//!
//! Two providers sit behind the [`TokenProvider`] trait: a static one
//! for an operator-supplied token, and a refreshing one that signs a
//! service-account JWT and exchanges it at the IAM endpoint.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::sync::Mutex;

pub const TOKEN_ENDPOINT: &str = "https://iam.api.cloud.yandex.net/iam/v1/tokens";

#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn get_token(&self) -> anyhow::Result<String>;
}

/// Hands back a fixed token, never refreshing it.
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new<S: Into<String>>(token: S) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn get_token(&self) -> anyhow::Result<String> {
        Ok(self.token.clone())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub service_account_id: String,
    #[serde(rename = "id")]
    pub key_id: String,
    pub private_key: String,
    #[serde(default = "default_key_algorithm")]
    pub key_algorithm: String,
}

fn default_key_algorithm() -> String {
    "RSA_2048".to_string()
}

pub fn load_service_account_key_from_file(path: &Path) -> anyhow::Result<ServiceAccountKey> {
    let raw = std::fs::read_to_string(path)?;
    load_service_account_key_from_str(&raw)
}

pub fn load_service_account_key_from_str(raw: &str) -> anyhow::Result<ServiceAccountKey> {
    Ok(serde_json::from_str(raw)?)
}

#[derive(Serialize)]
struct Claims<'a> {
    aud: &'a str,
    iss: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(rename = "iamToken")]
    iam_token: String,
    #[serde(rename = "expiresAt")]
    expires_at: String,
}

/// RSA service-account keys are signed PS256, elliptic ones ES256,
/// per the IAM API contract.
fn algorithm_for(key_algorithm: &str) -> Algorithm {
    if key_algorithm.contains("RSA") {
        Algorithm::PS256
    } else {
        Algorithm::ES256
    }
}

/// Exchanges a signed service-account JWT for an IAM token and keeps
/// the token cached until shortly before it expires.
pub struct IamTokenProvider {
    key: ServiceAccountKey,
    http: reqwest::Client,
    token_url: String,
    refresh_margin: Duration,
    cached: Mutex<Option<(String, DateTime<Utc>)>>,
}

impl IamTokenProvider {
    pub fn new(key: ServiceAccountKey) -> Self {
        Self::with_endpoint(key, TOKEN_ENDPOINT)
    }

    pub fn with_endpoint<S: Into<String>>(key: ServiceAccountKey, token_url: S) -> Self {
        Self {
            key,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("reqwest client"),
            token_url: token_url.into(),
            refresh_margin: Duration::from_secs(60),
            cached: Mutex::new(None),
        }
    }

    fn build_jwt(&self, now: DateTime<Utc>) -> anyhow::Result<String> {
        let algorithm = algorithm_for(&self.key.key_algorithm);
        let mut header = Header::new(algorithm);
        header.kid = Some(self.key.key_id.clone());

        let claims = Claims {
            aud: TOKEN_ENDPOINT,
            iss: &self.key.service_account_id,
            iat: now.timestamp(),
            exp: now.timestamp() + 3600,
        };

        let encoding_key = match algorithm {
            Algorithm::PS256 => EncodingKey::from_rsa_pem(self.key.private_key.as_bytes())?,
            _ => EncodingKey::from_ec_pem(self.key.private_key.as_bytes())?,
        };

        Ok(jsonwebtoken::encode(&header, &claims, &encoding_key)?)
    }
}

#[async_trait]
impl TokenProvider for IamTokenProvider {
    async fn get_token(&self) -> anyhow::Result<String> {
        let mut cached = self.cached.lock().await;
        let now = Utc::now();
        if let Some((token, expires_at)) = cached.as_ref() {
            if now + self.refresh_margin < *expires_at {
                return Ok(token.clone());
            }
        }

        let assertion = self.build_jwt(now)?;
        let response = self
            .http
            .post(&self.token_url)
            .json(&serde_json::json!({ "jwt": assertion }))
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() >= 400 {
            let body = response.text().await.unwrap_or_default();
            tracing::error!("IAM token request failed: {status} {body}");
            anyhow::bail!("IAM token request failed with status {status}");
        }

        let payload: TokenResponse = response.json().await?;
        let expires_at = DateTime::parse_from_rfc3339(&payload.expires_at)
            .map_err(|err| anyhow::anyhow!("IAM expiresAt is not RFC3339: {err}"))?
            .with_timezone(&Utc);

        tracing::debug!("IAM token refreshed, expires at {expires_at}");
        cached.replace((payload.iam_token.clone(), expires_at));
        Ok(payload.iam_token)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn static_provider_returns_token() {
        let provider = StaticTokenProvider::new("t-abc");
        assert_eq!(provider.get_token().await.unwrap(), "t-abc");
    }

    #[test]
    fn algorithm_selection_follows_key_type() {
        assert_eq!(algorithm_for("RSA_2048"), Algorithm::PS256);
        assert_eq!(algorithm_for("RSA_4096"), Algorithm::PS256);
        assert_eq!(algorithm_for("ECDSA_NIST_P256"), Algorithm::ES256);
    }

    #[test]
    fn key_parses_with_default_algorithm() {
        let key = load_service_account_key_from_str(
            r#"{"service_account_id": "sa1", "id": "key1", "private_key": "PEM"}"#,
        )
        .unwrap();
        assert_eq!(key.service_account_id, "sa1");
        assert_eq!(key.key_id, "key1");
        assert_eq!(key.key_algorithm, "RSA_2048");
    }
}
