//! Secrets resolution.
//!
//! Jobs reference secrets by logical path; the scheduler resolves them at
//! launch through one of two backends:
//!
//! - `vault`: HTTP read against a Vault KV tree, expecting the secret's
//!   `value` field to hold a string.
//! - `none`: echoes the path back, for development and tests.
//!
//! Resolved paths are `group/project/logical_name`.

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use crate::config::{SecretsBackend, VaultConfig};

/// Errors from secrets resolution.
#[derive(Debug, Error)]
pub enum SecretsError {
    #[error("secrets backend request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("secret not found: {0}")]
    NotFound(String),

    #[error("secret's value is not a string: {0}")]
    NotAString(String),
}

/// Secret read-through contract.
#[async_trait]
pub trait Secrets: Send + Sync + 'static {
    /// Resolve a logical path to its plaintext value.
    async fn read(&self, path: &str) -> Result<String, SecretsError>;
}

/// Build the configured backend.
pub fn new(backend: &SecretsBackend) -> Box<dyn Secrets> {
    match backend {
        SecretsBackend::None => Box::new(NoneSecrets),
        SecretsBackend::Vault(config) => Box::new(VaultSecrets::new(config)),
    }
}

/// Pass-through backend returning the path itself.
pub struct NoneSecrets;

#[async_trait]
impl Secrets for NoneSecrets {
    async fn read(&self, path: &str) -> Result<String, SecretsError> {
        Ok(path.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct VaultReadResponse {
    #[serde(default)]
    data: Option<serde_json::Map<String, serde_json::Value>>,
}

/// Vault KV backend. Secrets are read from `{addr}/v1/{root}{path}` and
/// must carry a string under the `value` key.
pub struct VaultSecrets {
    http: reqwest::Client,
    addr: String,
    root: String,
    token: String,
}

impl VaultSecrets {
    pub fn new(config: &VaultConfig) -> Self {
        if !config.addr.starts_with("https://") {
            warn!("Vault address does not use HTTPS; credentials travel in clear text");
        }
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            addr: config.addr.trim_end_matches('/').to_string(),
            root: config.root.clone(),
            token: config.token.clone(),
        }
    }
}

#[async_trait]
impl Secrets for VaultSecrets {
    async fn read(&self, path: &str) -> Result<String, SecretsError> {
        let url = format!("{}/v1/{}{}", self.addr, self.root, path);
        let response = self
            .http
            .get(&url)
            .header("X-Vault-Token", &self.token)
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(SecretsError::NotFound(path.to_string()));
        }
        let body: VaultReadResponse = response.error_for_status()?.json().await?;
        let Some(data) = body.data else {
            return Err(SecretsError::NotFound(path.to_string()));
        };
        match data.get("value") {
            Some(serde_json::Value::String(value)) => Ok(value.clone()),
            Some(_) => Err(SecretsError::NotAString(path.to_string())),
            None => Err(SecretsError::NotFound(path.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_none_backend_echoes_path() {
        let secrets = NoneSecrets;
        let value = secrets.read("g/p/db_password").await.unwrap();
        assert_eq!(value, "g/p/db_password");
    }

    #[test]
    fn test_vault_response_decoding() {
        let body: VaultReadResponse =
            serde_json::from_str(r#"{"data":{"value":"hunter2"}}"#).unwrap();
        assert_eq!(
            body.data.unwrap().get("value").unwrap().as_str().unwrap(),
            "hunter2"
        );

        let empty: VaultReadResponse = serde_json::from_str("{}").unwrap();
        assert!(empty.data.is_none());
    }
}
