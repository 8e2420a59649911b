//! The pure decision at the heart of every reconciliation: given what is
//! recorded as installed and what the resource now declares, pick the one
//! chart operation to perform. No clocks, no io, no retries: everything
//! temporal lives with the scheduler that redelivers requests.
use crate::release::ReleaseRecord;

use std::fmt::{self, Display};

/// The operation the reconciler will execute for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// No record exists and a spec is present
    Install,
    /// A record exists and the desired fingerprint differs from the recorded one
    Upgrade,
    /// The spec is absent: the resource was deleted
    Uninstall,
    /// The desired fingerprint matches the recorded one; nothing to do and no
    /// chart engine call is made
    Unchanged,
}

impl Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Action::Install => "install",
            Action::Upgrade => "upgrade",
            Action::Uninstall => "uninstall",
            Action::Unchanged => "unchanged",
        };
        f.write_str(s)
    }
}

/// Decides the action for one request. `desired_fingerprint` is `None` when
/// the spec is absent (deletion). Duplicate and spurious notifications are
/// expected from at-least-once delivery; the fingerprint comparison is what
/// collapses them into no-ops without rendering the chart.
pub fn decide(record: Option<&ReleaseRecord>, desired_fingerprint: Option<&str>) -> Action {
    match (record, desired_fingerprint) {
        (_, None) => Action::Uninstall,
        (None, Some(_)) => Action::Install,
        (Some(record), Some(fingerprint)) => {
            if record.fingerprint == fingerprint {
                Action::Unchanged
            } else {
                Action::Upgrade
            }
        }
    }
}
