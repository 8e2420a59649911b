//! The boundary to the chart engine. The reconciler only ever talks to a
//! `HelmClient` trait object, which keeps the core synchronous, deterministic,
//! and testable with a scripted fake. Real implementations are expected to
//! shell out to or link against the chart engine and to honor the timeout
//! passed with each call.
use crate::chart::ChartDescriptor;
use crate::release::ReleaseIdent;

use serde_json::Value;

use std::fmt::{self, Display};
use std::time::Duration;

/// One installed instantiation of a chart, as reported by the chart engine.
/// The engine persists the chart version and effective values with each
/// revision, which is what allows release records to be rebuilt from the
/// cluster alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
    pub name: String,
    pub namespace: String,
    pub revision: i32,
    pub chart_version: String,
    pub values: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelmErrorKind {
    /// The operation did not complete within its deadline. Partial progress
    /// cannot be distinguished from total failure without re-querying, so
    /// this is always retryable.
    Timeout,
    /// The chart engine or its backing storage was unreachable
    Unavailable,
    /// Another writer modified the release's stored state concurrently
    Conflict,
    /// No release with the given name exists in the namespace
    ReleaseNotFound,
    /// The chart templates failed to render against the provided values.
    /// Terminal: the same inputs will fail the same way every time.
    RenderFailed,
    /// Anything the engine reported that fits none of the above
    Other,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HelmError {
    pub kind: HelmErrorKind,
    pub message: String,
}

impl HelmError {
    pub fn new(kind: HelmErrorKind, message: impl Into<String>) -> HelmError {
        HelmError {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> HelmError {
        HelmError::new(HelmErrorKind::Timeout, message)
    }

    pub fn unavailable(message: impl Into<String>) -> HelmError {
        HelmError::new(HelmErrorKind::Unavailable, message)
    }

    pub fn release_not_found(release: &ReleaseIdent) -> HelmError {
        HelmError::new(
            HelmErrorKind::ReleaseNotFound,
            format!("release {} not found", release),
        )
    }

    pub fn render_failed(message: impl Into<String>) -> HelmError {
        HelmError::new(HelmErrorKind::RenderFailed, message)
    }

    pub fn is_transient(&self) -> bool {
        match self.kind {
            HelmErrorKind::Timeout
            | HelmErrorKind::Unavailable
            | HelmErrorKind::Conflict
            | HelmErrorKind::Other => true,
            HelmErrorKind::ReleaseNotFound | HelmErrorKind::RenderFailed => false,
        }
    }
}

impl Display for HelmError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let kind = match self.kind {
            HelmErrorKind::Timeout => "timeout",
            HelmErrorKind::Unavailable => "unavailable",
            HelmErrorKind::Conflict => "conflict",
            HelmErrorKind::ReleaseNotFound => "release not found",
            HelmErrorKind::RenderFailed => "render failed",
            HelmErrorKind::Other => "error",
        };
        write!(f, "Helm {}: {}", kind, self.message)
    }
}

impl std::error::Error for HelmError {}

/// Synchronous chart engine operations. Each call is one logical step with no
/// partial-completion bookkeeping beyond what the engine's own release
/// storage provides. Implementations de-duplicate by release name, so a
/// retried install of an already-installed release must not create a second
/// release.
pub trait HelmClient: Send + Sync {
    fn install(
        &self,
        release: &ReleaseIdent,
        chart: &ChartDescriptor,
        values: &Value,
        timeout: Option<Duration>,
    ) -> Result<Release, HelmError>;

    fn upgrade(
        &self,
        release: &ReleaseIdent,
        chart: &ChartDescriptor,
        values: &Value,
        timeout: Option<Duration>,
    ) -> Result<Release, HelmError>;

    /// Removes the release. Implementations should return `ReleaseNotFound`
    /// when nothing is installed; the reconciler treats that as success.
    fn uninstall(&self, release: &ReleaseIdent, timeout: Option<Duration>)
        -> Result<(), HelmError>;

    /// Fetches the currently installed release, if any. Read-only; used to
    /// adopt releases that exist without a record and to detect records that
    /// outlived their release. Bounded by the same timeout as the mutating
    /// operations so a request deadline covers it too.
    fn get(
        &self,
        release: &ReleaseIdent,
        timeout: Option<Duration>,
    ) -> Result<Option<Release>, HelmError>;
}
