//! Static SDK configuration, validated once at init.

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Credentials and endpoint override supplied by the host application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdkConfig {
    pub client_id: String,
    pub api_key: String,
    /// Optional override for the cloud configuration endpoint.
    #[serde(default)]
    pub endpoint_override: Option<String>,
}

impl SdkConfig {
    pub fn new(client_id: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            api_key: api_key.into(),
            endpoint_override: None,
        }
    }

    /// Load from a JSON document.
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check required fields. Called once at init; later code may assume a
    /// valid config.
    pub fn validate(&self) -> Result<(), Error> {
        if self.client_id.trim().is_empty() {
            return Err(Error::Config("client_id must not be empty".into()));
        }
        if self.api_key.trim().is_empty() {
            return Err(Error::Config("api_key must not be empty".into()));
        }
        if let Some(endpoint) = &self.endpoint_override {
            if !endpoint.starts_with("https://") {
                return Err(Error::Config("endpoint_override must be https".into()));
            }
        }
        Ok(())
    }
}
