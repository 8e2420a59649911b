//! The error taxonomy for a reconciliation. Every failure is captured at the
//! reconciler boundary and folded into a `ReconcileOutcome`; nothing escapes
//! to the caller as a raw error or panic. The one question every error must
//! answer is whether redelivering the same request can succeed: transient
//! failures are handed back to the scheduler for backoff and redelivery,
//! terminal ones are surfaced on the resource's status and left alone until
//! the spec changes.
use crate::helm::HelmError;
use crate::k8s::KubeError;
use crate::release::{InvalidIdentityError, StoreError};
use crate::resource::InvalidResourceError;

use std::fmt::{self, Display};

#[derive(Debug)]
pub enum ReconcileError {
    /// The resource identity is malformed (empty name or kind). A programming
    /// error in the watch layer; aborts this reconciliation without touching
    /// any state.
    InvalidIdentity(InvalidIdentityError),
    /// The spec cannot be translated into chart values. Terminal until the
    /// spec changes.
    InvalidSpec(InvalidResourceError),
    /// The chart engine failed; retryability depends on the failure kind
    Helm(HelmError),
    /// The release store failed; always retryable
    Store(StoreError),
    /// The api server failed
    Kube(KubeError),
    /// The request's deadline expired before the blocking work completed
    DeadlineExceeded,
}

impl ReconcileError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ReconcileError::InvalidIdentity(_) | ReconcileError::InvalidSpec(_) => false,
            ReconcileError::Helm(err) => err.is_transient(),
            ReconcileError::Store(_) => true,
            ReconcileError::Kube(err) => err.is_transient(),
            ReconcileError::DeadlineExceeded => true,
        }
    }

    /// A short machine-readable token for the status condition's Reason field
    pub fn reason(&self) -> &'static str {
        match self {
            ReconcileError::InvalidIdentity(_) => "InvalidIdentity",
            ReconcileError::InvalidSpec(_) => "InvalidSpec",
            ReconcileError::Helm(_) => "ChartOperationFailed",
            ReconcileError::Store(_) => "ReleaseStoreFailed",
            ReconcileError::Kube(_) => "ApiServerFailed",
            ReconcileError::DeadlineExceeded => "DeadlineExceeded",
        }
    }
}

impl Display for ReconcileError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ReconcileError::InvalidIdentity(err) => Display::fmt(err, f),
            ReconcileError::InvalidSpec(err) => Display::fmt(err, f),
            ReconcileError::Helm(err) => Display::fmt(err, f),
            ReconcileError::Store(err) => Display::fmt(err, f),
            ReconcileError::Kube(err) => Display::fmt(err, f),
            ReconcileError::DeadlineExceeded => {
                f.write_str("Deadline exceeded before the operation completed")
            }
        }
    }
}

impl std::error::Error for ReconcileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReconcileError::InvalidIdentity(err) => Some(err),
            ReconcileError::InvalidSpec(err) => Some(err),
            ReconcileError::Helm(err) => Some(err),
            ReconcileError::Store(err) => Some(err),
            ReconcileError::Kube(err) => Some(err),
            ReconcileError::DeadlineExceeded => None,
        }
    }
}

impl From<InvalidIdentityError> for ReconcileError {
    fn from(err: InvalidIdentityError) -> ReconcileError {
        ReconcileError::InvalidIdentity(err)
    }
}

impl From<InvalidResourceError> for ReconcileError {
    fn from(err: InvalidResourceError) -> ReconcileError {
        ReconcileError::InvalidSpec(err)
    }
}

impl From<HelmError> for ReconcileError {
    fn from(err: HelmError) -> ReconcileError {
        ReconcileError::Helm(err)
    }
}

impl From<StoreError> for ReconcileError {
    fn from(err: StoreError) -> ReconcileError {
        ReconcileError::Store(err)
    }
}

impl From<KubeError> for ReconcileError {
    fn from(err: KubeError) -> ReconcileError {
        ReconcileError::Kube(err)
    }
}
