//! Cloud API seam
//!
//! The wire protocol (signing, URL encoding, response unmarshalling) lives behind
//! [`CloudApi`]. Handlers talk to it through [`ApiClient`], which turns every
//! [`ApiError`] into a classified `ProviderError`.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use osc_core::provider::{ProviderError, ProviderResult};
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::errors::{CallSite, classify_error};

/// The four Outscale API families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    /// Compute (EC2-compatible)
    Fcu,
    /// Outscale API
    Oapi,
    /// Load balancers (ELB-compatible)
    Lbu,
    /// Identity and access management (IAM-compatible)
    Eim,
}

impl Service {
    pub const ALL: [Service; 4] = [Service::Fcu, Service::Oapi, Service::Lbu, Service::Eim];

    pub fn as_str(&self) -> &'static str {
        match self {
            Service::Fcu => "fcu",
            Service::Oapi => "oapi",
            Service::Lbu => "lbu",
            Service::Eim => "eim",
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by the cloud
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct ApiError {
    pub code: String,
    pub message: String,
    /// HTTP status, when the transport knows it
    pub status: Option<u16>,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            status: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

/// One request/response exchange with an Outscale endpoint
#[async_trait]
pub trait CloudApi: Send + Sync {
    async fn call(
        &self,
        service: Service,
        action: &str,
        request: JsonValue,
    ) -> Result<JsonValue, ApiError>;
}

/// Shared handle on the cloud API used by every handler
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<dyn CloudApi>,
}

impl ApiClient {
    pub fn new(inner: Arc<dyn CloudApi>) -> Self {
        Self { inner }
    }

    pub async fn call(
        &self,
        service: Service,
        action: &str,
        request: JsonValue,
    ) -> ProviderResult<JsonValue> {
        self.call_at(CallSite::Default, service, action, request)
            .await
    }

    /// Call with the error classification of a specific call site
    pub async fn call_at(
        &self,
        site: CallSite,
        service: Service,
        action: &str,
        request: JsonValue,
    ) -> ProviderResult<JsonValue> {
        debug!("{} {}", service, action);
        self.inner
            .call(service, action, request)
            .await
            .map_err(|e| classify_error(site, e))
    }

    /// Describe call where a not-found error means the resource is absent
    pub async fn describe(
        &self,
        service: Service,
        action: &str,
        request: JsonValue,
    ) -> ProviderResult<Option<JsonValue>> {
        match self.call(service, action, request).await {
            Ok(response) => Ok(Some(response)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiClient").finish_non_exhaustive()
    }
}

/// Turn an unexpected response shape into an API error
pub fn malformed(action: &str, detail: &str) -> ProviderError {
    ProviderError::api(format!("malformed {} response: {}", action, detail))
}
