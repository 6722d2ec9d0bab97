//! Provider - Trait abstracting resource operations, plus the shared error taxonomy
//!
//! A Provider exposes Create/Read/Update/Delete for every resource kind of one cloud.
//! Errors carry an [`ErrorClass`] decided by the provider's API adapter, so the
//! generic retry and wait machinery never has to inspect error text.

use std::future::Future;
use std::pin::Pin;

use crate::reconcile::{UpdateError, UpdateOutcome};
use crate::resource::{Resource, ResourceId, State};

/// Closed set of error classes the core reasons about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Throttling, rate limits, propagation delays
    Transient,
    /// The resource does not exist
    NotFound,
    /// Duplicate listener, dependency violation, resource in use
    Conflict,
    /// A deadline elapsed before the resource converged
    Timeout,
    /// The resource reached a state it cannot leave on its own
    UnexpectedState,
    /// Desired configuration is incomplete or asks for the impossible
    Validation,
    /// Any other API failure
    Api,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorClass::Transient => "transient",
            ErrorClass::NotFound => "not found",
            ErrorClass::Conflict => "conflict",
            ErrorClass::Timeout => "timeout",
            ErrorClass::UnexpectedState => "unexpected state",
            ErrorClass::Validation => "validation",
            ErrorClass::Api => "api",
        };
        f.write_str(name)
    }
}

/// Operation being reconciled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Read,
    Update,
    Delete,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Operation::Create => "create",
            Operation::Read => "read",
            Operation::Update => "update",
            Operation::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// Error type for Provider operations
#[derive(Debug)]
pub struct ProviderError {
    pub class: ErrorClass,
    pub message: String,
    pub resource_id: Option<ResourceId>,
    pub operation: Option<Operation>,
    /// Last state observed before giving up, if any
    pub last_state: Option<String>,
    /// Cloud ID of a resource created before the failure
    pub identifier: Option<String>,
    pub cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ref id) = self.resource_id {
            write!(f, "[{}] ", id)?;
        }
        if let Some(op) = self.operation {
            write!(f, "{}: ", op)?;
        }
        write!(f, "{}", self.message)?;
        if let Some(ref state) = self.last_state {
            write!(f, " (last state: {})", state)?;
        }
        Ok(())
    }
}

impl std::error::Error for ProviderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|e| e.as_ref() as &dyn std::error::Error)
    }
}

impl ProviderError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
            resource_id: None,
            operation: None,
            last_state: None,
            identifier: None,
            cause: None,
        }
    }

    pub fn api(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Api, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Transient, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Conflict, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Timeout, message)
    }

    pub fn unexpected_state(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::UnexpectedState, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Validation, message)
    }

    /// Attach the resource this error is about, unless one is already set
    pub fn for_resource(mut self, id: ResourceId) -> Self {
        self.resource_id.get_or_insert(id);
        self
    }

    /// Attach the operation this error happened in, unless one is already set
    pub fn during(mut self, operation: Operation) -> Self {
        self.operation.get_or_insert(operation);
        self
    }

    pub fn with_last_state(mut self, state: impl Into<String>) -> Self {
        self.last_state = Some(state.into());
        self
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn is_not_found(&self) -> bool {
        self.class == ErrorClass::NotFound
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Return type for async operations
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Main Provider trait
///
/// Each cloud provider implements this trait. All operations are async and involve
/// side effects; each one runs to completion, including any waiting for the cloud to
/// converge, before its future resolves.
pub trait Provider: Send + Sync {
    /// Name of this Provider (e.g., "outscale")
    fn name(&self) -> &'static str;

    /// Resource kinds this Provider can handle
    fn resource_kinds(&self) -> Vec<&'static str>;

    /// Get the current state of a resource
    ///
    /// Returns `State::not_found()` if the resource does not exist or no identifier is known.
    fn read(
        &self,
        id: &ResourceId,
        identifier: Option<&str>,
    ) -> BoxFuture<'_, ProviderResult<State>>;

    /// Create a resource
    ///
    /// Returns State with identifier set to the cloud ID (e.g., vol-xxx)
    fn create(&self, resource: &Resource) -> BoxFuture<'_, ProviderResult<State>>;

    /// Update a resource in place
    ///
    /// On failure the error reports which attribute groups were already applied.
    fn update(
        &self,
        id: &ResourceId,
        identifier: &str,
        from: &State,
        to: &Resource,
    ) -> BoxFuture<'_, Result<UpdateOutcome, UpdateError>>;

    /// Delete a resource; deleting something already gone succeeds
    fn delete(&self, id: &ResourceId, identifier: &str) -> BoxFuture<'_, ProviderResult<()>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = ProviderError::timeout("gave up waiting for running")
            .for_resource(ResourceId::new("vm", "web"))
            .during(Operation::Create)
            .with_last_state("pending");

        assert_eq!(
            err.to_string(),
            "[vm.web] create: gave up waiting for running (last state: pending)"
        );
    }

    #[test]
    fn first_context_wins() {
        let err = ProviderError::api("boom")
            .for_resource(ResourceId::new("vm", "inner"))
            .for_resource(ResourceId::new("vm", "outer"))
            .during(Operation::Delete)
            .during(Operation::Update);

        assert_eq!(err.resource_id, Some(ResourceId::new("vm", "inner")));
        assert_eq!(err.operation, Some(Operation::Delete));
    }

    #[test]
    fn cause_is_exposed_as_source() {
        use std::error::Error;

        let inner = ProviderError::transient("Throttling: rate exceeded");
        let err = ProviderError::timeout("retry budget exhausted").with_cause(inner);

        let source = err.source().map(|e| e.to_string());
        assert_eq!(source.as_deref(), Some("Throttling: rate exceeded"));
    }
}
