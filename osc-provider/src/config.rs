//! Provider configuration

use std::collections::HashMap;

use osc_core::resource::Value;
use serde::Deserialize;
use thiserror::Error;

use crate::api::Service;

pub const ACCESS_KEY_ENV: &str = "OUTSCALE_ACCESSKEYID";
pub const SECRET_KEY_ENV: &str = "OUTSCALE_SECRETKEYID";
pub const REGION_ENV: &str = "OUTSCALE_REGION";

/// Errors raised while building a [`ProviderConfig`]
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("Missing required provider setting '{name}' (or environment variable {env})")]
    Missing { name: &'static str, env: &'static str },

    #[error("Provider setting '{name}' must be a string, got {got}")]
    InvalidType { name: String, got: &'static str },

    #[error("Invalid endpoint '{0}': expected an http(s) URL")]
    InvalidEndpoint(String),
}

/// Credentials and location of the Outscale account to manage
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProviderConfig {
    pub access_key_id: String,
    pub secret_key_id: String,
    pub region: String,
    /// Overrides the per-service default endpoints
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl ProviderConfig {
    /// Build from provider block attributes, falling back to the environment
    pub fn from_attributes(attributes: &HashMap<String, Value>) -> Result<Self, ConfigError> {
        Self::from_attributes_with_env(attributes, |name| std::env::var(name).ok())
    }

    pub fn from_attributes_with_env<F>(
        attributes: &HashMap<String, Value>,
        env: F,
    ) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let setting = |name: &'static str, env_name: &'static str| -> Result<String, ConfigError> {
            match attributes.get(name) {
                Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
                Some(Value::String(_)) | None => env(env_name)
                    .filter(|v| !v.is_empty())
                    .ok_or(ConfigError::Missing {
                        name,
                        env: env_name,
                    }),
                Some(other) => Err(ConfigError::InvalidType {
                    name: name.to_string(),
                    got: other.type_name(),
                }),
            }
        };

        let endpoint = match attributes.get("endpoint") {
            None => None,
            Some(Value::String(url)) => {
                if !(url.starts_with("https://") || url.starts_with("http://")) {
                    return Err(ConfigError::InvalidEndpoint(url.clone()));
                }
                Some(url.trim_end_matches('/').to_string())
            }
            Some(other) => {
                return Err(ConfigError::InvalidType {
                    name: "endpoint".to_string(),
                    got: other.type_name(),
                });
            }
        };

        Ok(Self {
            access_key_id: setting("access_key_id", ACCESS_KEY_ENV)?,
            secret_key_id: setting("secret_key_id", SECRET_KEY_ENV)?,
            region: setting("region", REGION_ENV)?,
            endpoint,
        })
    }

    /// Base URL for `service` (e.g., https://fcu.eu-west-2.outscale.com)
    pub fn endpoint_for(&self, service: Service) -> String {
        match &self.endpoint {
            Some(url) => format!("{}/{}", url, service),
            None => format!("https://{}.{}.outscale.com", service, self.region),
        }
    }
}
