//! The boundary to the Kubernetes api server, reduced to the two operations
//! the reconciler needs: reading a resource by identity, and conditionally
//! writing its status subresource. The watch machinery that feeds requests to
//! the reconciler lives with the hosting process, not here.
use crate::resource::ResourceIdentity;

use serde_json::Value;

use std::fmt::{self, Display};

#[derive(Debug, Clone, PartialEq)]
pub enum KubeError {
    /// The write's resourceVersion precondition was stale. The caller should
    /// re-read and retry.
    Conflict { message: String },
    /// The resource no longer exists
    NotFound,
    /// The api server was unreachable or timed out. Retryable.
    Unavailable { message: String },
    /// The api server rejected the request for any other reason
    Api { status: u16, message: String },
}

impl KubeError {
    pub fn is_transient(&self) -> bool {
        match self {
            KubeError::Conflict { .. } | KubeError::Unavailable { .. } => true,
            KubeError::NotFound => false,
            // server errors are worth retrying, client errors are not
            KubeError::Api { status, .. } => *status >= 500,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, KubeError::Conflict { .. })
    }
}

impl Display for KubeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KubeError::Conflict { message } => write!(f, "Conflict: {}", message),
            KubeError::NotFound => f.write_str("Resource not found"),
            KubeError::Unavailable { message } => write!(f, "Api server unavailable: {}", message),
            KubeError::Api { status, message } => {
                write!(f, "Api error (status {}): {}", status, message)
            }
        }
    }
}

impl std::error::Error for KubeError {}

/// Synchronous api server operations against the watched resource kind.
pub trait KubeApi: Send + Sync {
    /// Fetches the raw resource for the given identity, or `None` if it has
    /// been deleted.
    fn get_resource(&self, identity: &ResourceIdentity) -> Result<Option<Value>, KubeError>;

    /// Replaces the resource's status subresource, conditional on
    /// `resource_version` still being current. Returns `KubeError::Conflict`
    /// when another writer got there first.
    fn update_status(
        &self,
        identity: &ResourceIdentity,
        resource_version: &str,
        status: &Value,
    ) -> Result<(), KubeError>;
}
