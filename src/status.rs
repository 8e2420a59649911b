//! Writes reconciliation outcomes back onto the resource's status
//! subresource. Status writes are best-effort: the release operation they
//! describe has already completed, so a failed write never rolls anything
//! back. It only asks the scheduler for a redelivery so the status can
//! converge.
use crate::error::ReconcileError;
use crate::k8s::KubeApi;
use crate::reconcile::{Phase, ReconcileOutcome};
use crate::resource::{str_value, ResourceIdentity};
use crate::values::compare_values;

use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};

use std::sync::Arc;

pub const READY_CONDITION: &str = "Ready";

pub struct StatusReporter {
    kube: Arc<dyn KubeApi>,
}

impl StatusReporter {
    pub fn new(kube: Arc<dyn KubeApi>) -> StatusReporter {
        StatusReporter { kube }
    }

    /// Renders the outcome into a condition set and writes it, conditional on
    /// the resource's current revision. On conflict the resource is
    /// re-fetched and the write retried exactly once before the failure is
    /// surfaced. A resource that has disappeared is not an error: there is
    /// nothing left to report on.
    pub fn report(
        &self,
        identity: &ResourceIdentity,
        outcome: &ReconcileOutcome,
        observed_generation: i64,
    ) -> Result<(), ReconcileError> {
        let resource = match self.kube.get_resource(identity)? {
            Some(resource) => resource,
            None => {
                log::debug!(
                    "Resource {} no longer exists, skipping status update",
                    identity
                );
                return Ok(());
            }
        };
        let old_status = resource.pointer("/status");

        if outcome.phase == Phase::Unchanged
            && is_already_reported(old_status, observed_generation)
        {
            log::debug!("Status for {} is already current", identity);
            return Ok(());
        }

        let new_status = render_status(outcome, observed_generation, old_status);
        if let Some(old) = old_status {
            let diffs = compare_values(old, &new_status);
            if diffs.is_empty() {
                log::debug!("Current and desired status are the same for {}", identity);
                return Ok(());
            }
            log::info!(
                "Found diffs in existing vs desired status for {}: {}",
                identity,
                diffs
            );
        }

        let resource_version = require_resource_version(&resource)?;
        match self
            .kube
            .update_status(identity, resource_version, &new_status)
        {
            Ok(()) => Ok(()),
            Err(ref err) if err.is_conflict() => {
                log::info!(
                    "Status write conflict for {}, re-fetching and retrying once",
                    identity
                );
                let resource = match self.kube.get_resource(identity)? {
                    Some(resource) => resource,
                    None => return Ok(()),
                };
                let resource_version = require_resource_version(&resource)?;
                self.kube
                    .update_status(identity, resource_version, &new_status)
                    .map_err(Into::into)
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn require_resource_version(resource: &Value) -> Result<&str, ReconcileError> {
    str_value(resource, "/metadata/resourceVersion").ok_or_else(|| {
        crate::resource::InvalidResourceError::new(
            "missing metadata.resourceVersion",
            resource.clone(),
        )
        .into()
    })
}

/// True when the existing status already has a Ready=True condition produced
/// from the same resource generation. Lets spurious redeliveries finish
/// without writing anything at all.
fn is_already_reported(old_status: Option<&Value>, observed_generation: i64) -> bool {
    let old = match old_status {
        Some(old) => old,
        None => return false,
    };
    if old.pointer("/observedGeneration").and_then(Value::as_i64) != Some(observed_generation) {
        return false;
    }
    find_condition(Some(old), READY_CONDITION)
        .and_then(|c| c.get("status"))
        .and_then(Value::as_str)
        == Some("True")
}

fn find_condition<'a>(status: Option<&'a Value>, condition_type: &str) -> Option<&'a Value> {
    status?
        .pointer("/conditions")?
        .as_array()?
        .iter()
        .find(|c| c.get("type").and_then(Value::as_str) == Some(condition_type))
}

/// Builds the full status object for the resource. The condition's
/// lastTransitionTime is carried over from the existing condition when the
/// Ready value has not flipped, so repeated writes of the same logical state
/// compare equal.
pub fn render_status(
    outcome: &ReconcileOutcome,
    observed_generation: i64,
    old_status: Option<&Value>,
) -> Value {
    let ready = match outcome.phase {
        Phase::Installed | Phase::Upgraded | Phase::Unchanged => "True",
        Phase::Uninstalled | Phase::Failed => "False",
    };
    let (reason, message) = condition_content(outcome, old_status);

    let old_condition = find_condition(old_status, READY_CONDITION);
    let last_transition = old_condition
        .filter(|c| c.get("status").and_then(Value::as_str) == Some(ready))
        .and_then(|c| c.get("lastTransitionTime"))
        .and_then(Value::as_str)
        .map(str::to_owned)
        .unwrap_or_else(|| Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true));

    let phase = match outcome.phase {
        // a no-op means the release is still installed
        Phase::Unchanged => Phase::Installed,
        other => other,
    };

    json!({
        "phase": phase,
        "observedGeneration": observed_generation,
        "releaseRevision": outcome.revision,
        "conditions": [
            {
                "type": READY_CONDITION,
                "status": ready,
                "reason": reason,
                "message": message,
                "observedGeneration": observed_generation,
                "lastTransitionTime": last_transition,
            }
        ],
    })
}

/// The reason/message pair for the Ready condition. An `Unchanged` outcome
/// reuses the existing condition's content when present, since nothing about
/// the release changed.
fn condition_content(outcome: &ReconcileOutcome, old_status: Option<&Value>) -> (String, String) {
    if outcome.phase == Phase::Unchanged {
        if let Some(condition) = find_condition(old_status, READY_CONDITION) {
            let reason = condition.get("reason").and_then(Value::as_str);
            let message = condition.get("message").and_then(Value::as_str);
            if let (Some(reason), Some(message)) = (reason, message) {
                if condition.get("status").and_then(Value::as_str) == Some("True") {
                    return (reason.to_owned(), message.to_owned());
                }
            }
        }
    }
    (outcome.reason.clone(), outcome.message.clone())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::reconcile::ReconcileOutcome;

    fn installed_outcome() -> ReconcileOutcome {
        ReconcileOutcome::success(
            Phase::Installed,
            Some(1),
            "InstallSucceeded",
            "Installed release default/nginx-web at revision 1",
        )
    }

    #[test]
    fn ready_condition_reflects_the_phase() {
        let status = render_status(&installed_outcome(), 2, None);
        assert_eq!(Some("Installed"), str_value(&status, "/phase"));
        assert_eq!(Some("True"), str_value(&status, "/conditions/0/status"));
        assert_eq!(
            Some("InstallSucceeded"),
            str_value(&status, "/conditions/0/reason")
        );
        assert_eq!(
            Some(2),
            status.pointer("/observedGeneration").and_then(Value::as_i64)
        );
    }

    #[test]
    fn failed_outcome_renders_ready_false() {
        let outcome = ReconcileOutcome::success(Phase::Failed, None, "InvalidSpec", "bad spec");
        let status = render_status(&outcome, 2, None);
        assert_eq!(Some("False"), str_value(&status, "/conditions/0/status"));
        assert_eq!(Some("InvalidSpec"), str_value(&status, "/conditions/0/reason"));
    }

    #[test]
    fn transition_time_is_carried_over_when_ready_does_not_flip() {
        let first = render_status(&installed_outcome(), 2, None);
        let second = render_status(&installed_outcome(), 2, Some(&first));
        assert_eq!(
            first.pointer("/conditions/0/lastTransitionTime"),
            second.pointer("/conditions/0/lastTransitionTime")
        );
        assert!(compare_values(&first, &second).is_empty());
    }

    #[test]
    fn unchanged_outcome_preserves_existing_condition_content() {
        let first = render_status(&installed_outcome(), 2, None);
        let unchanged = ReconcileOutcome::success(
            Phase::Unchanged,
            Some(1),
            "ReleaseUnchanged",
            "values are unchanged",
        );
        let second = render_status(&unchanged, 2, Some(&first));
        assert_eq!(
            Some("InstallSucceeded"),
            str_value(&second, "/conditions/0/reason")
        );
        assert!(compare_values(&first, &second).is_empty());
    }

    #[test]
    fn already_reported_detects_current_status() {
        let status = render_status(&installed_outcome(), 2, None);
        assert!(is_already_reported(Some(&status), 2));
        assert!(!is_already_reported(Some(&status), 3));
        assert!(!is_already_reported(None, 2));
    }
}
