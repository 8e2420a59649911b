//! The reconciliation core. One request goes in, one outcome comes out, and
//! the outcome is always a value, never a panic or a raw error: every failure
//! is classified as retryable or terminal so the scheduler knows whether
//! redelivering the request can help.
//!
//! The core owns no timers and no queues. Retry happens purely through
//! redelivery by the hosting watch layer, and duplicate deliveries collapse
//! into no-ops through the fingerprint comparison in [`decide`].
mod decision;

pub use self::decision::{decide, Action};

use crate::chart::{ChartDescriptor, ChartError};
use crate::config::OperatorConfig;
use crate::error::ReconcileError;
use crate::helm::{HelmClient, HelmErrorKind};
use crate::k8s::KubeApi;
use crate::metrics::Metrics;
use crate::release::{self, ReleaseIdent, ReleaseRecord, ReleaseStore};
use crate::resource::{ReconcileRequest, ResourceIdentity, ResourceSpec};
use crate::status::StatusReporter;
use crate::values;

use serde_json::Value;

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// What a reconciliation did to the release. `Unchanged` and `Failed` appear
/// only in outcomes; records persist the last mutating phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Installed,
    Upgraded,
    Uninstalled,
    Unchanged,
    Failed,
}

impl Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Phase::Installed => "Installed",
            Phase::Upgraded => "Upgraded",
            Phase::Uninstalled => "Uninstalled",
            Phase::Unchanged => "Unchanged",
            Phase::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// The result of one reconciliation, as reported to the scheduler and (via
/// the status reporter) to the resource itself.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileOutcome {
    pub phase: Phase,
    /// The release revision after this reconciliation, when one exists
    pub revision: Option<i32>,
    /// Machine-readable token, e.g. `InstallSucceeded` or `ChartOperationFailed`
    pub reason: String,
    pub message: String,
    /// Whether the scheduler should redeliver this request with backoff
    pub retryable: bool,
}

impl ReconcileOutcome {
    pub fn success(
        phase: Phase,
        revision: Option<i32>,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> ReconcileOutcome {
        ReconcileOutcome {
            phase,
            revision,
            reason: reason.into(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn failure(err: &ReconcileError) -> ReconcileOutcome {
        ReconcileOutcome {
            phase: Phase::Failed,
            revision: None,
            reason: err.reason().to_owned(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

/// One mutex per resource identity. Requests for different identities run
/// freely in parallel; requests for the same identity are serialized so the
/// record and the release are never raced.
#[derive(Default)]
struct IdentityLocks {
    locks: Mutex<HashMap<ResourceIdentity, Arc<Mutex<()>>>>,
}

impl IdentityLocks {
    fn for_identity(&self, identity: &ResourceIdentity) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(identity.clone()).or_default().clone()
    }

    /// Drops the identity's entry, but only when no one else holds the lock.
    /// A waiter that already cloned the Arc keeps serializing against the old
    /// mutex, so the entry must stay in the map until the last holder is
    /// gone; otherwise a later request would mint a fresh mutex and run
    /// concurrently with the waiter.
    fn remove_if_unused(&self, identity: &ResourceIdentity) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = locks.get(identity) {
            // cloning out of the map requires the map lock we hold here, so
            // the count cannot rise between the check and the removal
            if Arc::strong_count(entry) == 1 {
                locks.remove(identity);
            }
        }
    }
}

pub struct Reconciler {
    chart: Arc<ChartDescriptor>,
    helm: Arc<dyn HelmClient>,
    store: Arc<dyn ReleaseStore>,
    reporter: StatusReporter,
    metrics: Metrics,
    locks: IdentityLocks,
    /// Fallback timeout for chart engine calls when the request carries no deadline
    timeout: Option<Duration>,
}

impl Reconciler {
    pub fn new(
        chart: ChartDescriptor,
        helm: Arc<dyn HelmClient>,
        store: Arc<dyn ReleaseStore>,
        kube: Arc<dyn KubeApi>,
    ) -> Reconciler {
        Reconciler {
            chart: Arc::new(chart),
            helm,
            store,
            reporter: StatusReporter::new(kube),
            metrics: Metrics::new(),
            locks: IdentityLocks::default(),
            timeout: None,
        }
    }

    /// Loads the chart from the directory named by the config and applies the
    /// configured reconcile timeout.
    pub fn from_config(
        config: &OperatorConfig,
        helm: Arc<dyn HelmClient>,
        store: Arc<dyn ReleaseStore>,
        kube: Arc<dyn KubeApi>,
    ) -> Result<Reconciler, ChartError> {
        let chart = ChartDescriptor::load_dir(&config.chart_dir)?;
        let mut reconciler = Reconciler::new(chart, helm, store, kube);
        reconciler.timeout = config.reconcile_timeout;
        Ok(reconciler)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Reconciler {
        self.timeout = Some(timeout);
        self
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn chart(&self) -> &ChartDescriptor {
        &self.chart
    }

    /// Processes one request to completion. Requests for the same identity
    /// are serialized; this call blocks until any in-flight reconciliation of
    /// the same resource has finished.
    pub fn reconcile(&self, request: &ReconcileRequest) -> ReconcileOutcome {
        let start = Instant::now();
        let outcome = {
            let lock = self.locks.for_identity(&request.identity);
            let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
            self.metrics.reconcile_started(&request.identity);

            let mut outcome = match self.run(request) {
                Ok(outcome) => outcome,
                Err(err) => {
                    log::warn!(
                        "Reconciliation of {} failed (retryable: {}): {}",
                        request.identity,
                        err.is_retryable(),
                        err
                    );
                    ReconcileOutcome::failure(&err)
                }
            };

            if let Some(spec) = request.spec.as_ref() {
                if let Err(err) = self
                    .reporter
                    .report(&request.identity, &outcome, spec.generation)
                {
                    // the release operation stands either way; a retryable
                    // failure asks for a redelivery so the status can catch
                    // up, while a terminal one cannot be fixed by retrying
                    log::warn!(
                        "Failed to update status of {}: {}",
                        request.identity,
                        err
                    );
                    if err.is_retryable() {
                        outcome.retryable = true;
                    }
                }
            }
            outcome
        };

        // the per-identity lock is released above; the entry is only cleaned
        // up when no queued request still holds it
        if outcome.phase == Phase::Uninstalled {
            self.locks.remove_if_unused(&request.identity);
        }
        self.metrics
            .reconcile_finished(&request.identity, &outcome, start.elapsed());
        log::info!(
            "Finished reconciling {}: {} ({})",
            request.identity,
            outcome.phase,
            outcome.reason
        );
        outcome
    }

    fn run(&self, request: &ReconcileRequest) -> Result<ReconcileOutcome, ReconcileError> {
        let release = release::resolve(&request.identity)?;
        let record = self.store.get(&request.identity)?;
        match request.spec.as_ref() {
            None => self.uninstall(request, &release, record),
            Some(spec) => self.apply(request, spec, &release, record),
        }
    }

    fn apply(
        &self,
        request: &ReconcileRequest,
        spec: &ResourceSpec,
        release: &ReleaseIdent,
        record: Option<ReleaseRecord>,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let (merged, fingerprint) = values::translate(&self.chart, spec)?;

        let action = match decide(record.as_ref(), Some(fingerprint.as_str())) {
            Action::Unchanged => {
                log::debug!(
                    "Release {} is up to date with fingerprint {}",
                    release,
                    fingerprint
                );
                return self.unchanged(request, spec, record);
            }
            other => other,
        };
        ensure_time_remaining(request)?;

        if action == Action::Install {
            // No record. A live release may still exist, either because the
            // record was lost or because a previous record write failed after
            // the chart operation succeeded. Adopt it rather than reinstall.
            if let Some(live) = self.helm.get(release, self.op_timeout(request))? {
                log::info!(
                    "Adopting existing release {} at revision {}",
                    release,
                    live.revision
                );
                let mut adopted = ReleaseRecord::from_release(&live);
                if adopted.fingerprint == fingerprint {
                    adopted.observed_generation = spec.generation;
                    let revision = adopted.revision;
                    self.store.put(&request.identity, adopted)?;
                    return Ok(ReconcileOutcome::success(
                        Phase::Unchanged,
                        Some(revision),
                        "ReleaseUnchanged",
                        format!("Adopted release {} at revision {}", release, revision),
                    ));
                }
                return self.execute(request, spec, release, Action::Upgrade, &merged, fingerprint);
            }
            return self.execute(request, spec, release, Action::Install, &merged, fingerprint);
        }

        // A record can outlive its release if something else removed it from
        // the cluster; reinstall instead of upgrading into nothing.
        if self.helm.get(release, self.op_timeout(request))?.is_none() {
            log::warn!("Release {} is recorded but not installed, reinstalling", release);
            return self.execute(request, spec, release, Action::Install, &merged, fingerprint);
        }
        self.execute(request, spec, release, Action::Upgrade, &merged, fingerprint)
    }

    /// The no-op path makes no chart engine calls at all. The record's
    /// observed generation is refreshed when a newer spec produced the same
    /// values, so status reporting stays consistent with the resource.
    fn unchanged(
        &self,
        request: &ReconcileRequest,
        spec: &ResourceSpec,
        record: Option<ReleaseRecord>,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let revision = record.as_ref().map(|r| r.revision);
        if let Some(mut record) = record {
            if record.observed_generation != spec.generation {
                record.observed_generation = spec.generation;
                self.store.put(&request.identity, record)?;
            }
        }
        Ok(ReconcileOutcome::success(
            Phase::Unchanged,
            revision,
            "ReleaseUnchanged",
            "Declared values already match the installed release",
        ))
    }

    fn execute(
        &self,
        request: &ReconcileRequest,
        spec: &ResourceSpec,
        release: &ReleaseIdent,
        action: Action,
        merged: &Value,
        fingerprint: String,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let timeout = self.op_timeout(request);
        let start = Instant::now();
        let (installed, phase, reason) = match action {
            Action::Install => {
                log::info!("Installing release {} from chart {}", release, self.chart.name);
                let installed = self.helm.install(release, &self.chart, merged, timeout)?;
                (installed, Phase::Installed, "InstallSucceeded")
            }
            _ => {
                log::info!("Upgrading release {} from chart {}", release, self.chart.name);
                let installed = self.helm.upgrade(release, &self.chart, merged, timeout)?;
                (installed, Phase::Upgraded, "UpgradeSucceeded")
            }
        };
        self.metrics.observe_chart_operation(action, start.elapsed());

        // written only now that the engine has confirmed the operation
        let record = ReleaseRecord {
            release_name: installed.name.clone(),
            namespace: installed.namespace.clone(),
            chart_version: installed.chart_version.clone(),
            fingerprint,
            revision: installed.revision,
            observed_generation: spec.generation,
            phase,
        };
        self.store.put(&request.identity, record)?;

        Ok(ReconcileOutcome::success(
            phase,
            Some(installed.revision),
            reason,
            format!("Release {} is at revision {}", release, installed.revision),
        ))
    }

    fn uninstall(
        &self,
        request: &ReconcileRequest,
        release: &ReleaseIdent,
        record: Option<ReleaseRecord>,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        if record.is_none() {
            // duplicate deletion delivery; nothing is recorded as installed
            // and the engine is not consulted
            log::debug!("No release recorded for deleted resource {}", request.identity);
            return Ok(ReconcileOutcome::success(
                Phase::Uninstalled,
                None,
                "UninstallSucceeded",
                format!("No release is installed for {}", request.identity),
            ));
        }
        ensure_time_remaining(request)?;

        let start = Instant::now();
        match self.helm.uninstall(release, self.op_timeout(request)) {
            Ok(()) => {}
            Err(ref err) if err.kind == HelmErrorKind::ReleaseNotFound => {
                log::debug!("Release {} was already absent", release);
            }
            Err(err) => return Err(err.into()),
        }
        self.metrics
            .observe_chart_operation(Action::Uninstall, start.elapsed());

        self.store.delete(&request.identity)?;
        self.metrics.resource_removed(&request.identity);
        Ok(ReconcileOutcome::success(
            Phase::Uninstalled,
            None,
            "UninstallSucceeded",
            format!("Uninstalled release {}", release),
        ))
    }

    fn op_timeout(&self, request: &ReconcileRequest) -> Option<Duration> {
        request.time_remaining().or(self.timeout)
    }
}

fn ensure_time_remaining(request: &ReconcileRequest) -> Result<(), ReconcileError> {
    match request.time_remaining() {
        Some(remaining) if remaining == Duration::from_secs(0) => {
            Err(ReconcileError::DeadlineExceeded)
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::release::InMemoryReleaseStore;
    use crate::resource::str_value;
    use crate::testkit::{test_resource, FakeKube, HelmCall, RecordingHelm};
    use serde_json::json;

    struct Fixture {
        helm: Arc<RecordingHelm>,
        store: Arc<InMemoryReleaseStore>,
        kube: Arc<FakeKube>,
        reconciler: Reconciler,
    }

    fn chart() -> ChartDescriptor {
        ChartDescriptor {
            name: "nginx".to_owned(),
            version: "0.1.0".to_owned(),
            default_values: json!({
                "replicas": 1,
                "image": { "repository": "nginx", "tag": "1.19" },
            }),
            templates: Vec::new(),
        }
    }

    fn fixture() -> Fixture {
        let helm = Arc::new(RecordingHelm::new());
        let store = Arc::new(InMemoryReleaseStore::new());
        let kube = Arc::new(FakeKube::new());
        let reconciler = Reconciler::new(
            chart(),
            helm.clone(),
            store.clone(),
            kube.clone(),
        );
        Fixture {
            helm,
            store,
            kube,
            reconciler,
        }
    }

    fn identity(name: &str) -> ResourceIdentity {
        ResourceIdentity::new("demo.example.com", "v1alpha1", "Nginx", "default", name)
    }

    fn request_for(fixture: &Fixture, name: &str, generation: i64, spec: Value) -> ReconcileRequest {
        let id = identity(name);
        let resource = test_resource(&id, generation, spec);
        fixture.kube.put_resource(&id, resource.clone());
        let spec = ResourceSpec::from_resource(&resource).unwrap();
        ReconcileRequest::new(id, Some(spec))
    }

    #[test]
    fn first_delivery_installs_and_records_the_release() {
        let fix = fixture();
        let request = request_for(&fix, "web", 1, json!({"replicas": 2}));

        let outcome = fix.reconciler.reconcile(&request);
        assert_eq!(Phase::Installed, outcome.phase);
        assert_eq!(Some(1), outcome.revision);
        assert!(!outcome.retryable);
        assert_eq!(1, fix.helm.install_count());

        let record = fix.store.get(&request.identity).unwrap().unwrap();
        assert_eq!(1, record.revision);
        assert_eq!(1, record.observed_generation);

        let release = fix.helm.release_named(&record.release_name).unwrap();
        assert_eq!(json!(2), release.values["replicas"]);
        assert_eq!(json!("nginx"), release.values["image"]["repository"]);

        let status = fix.kube.status_of(&request.identity).unwrap();
        assert_eq!(Some("Installed"), str_value(&status, "/phase"));
        assert_eq!(Some("True"), str_value(&status, "/conditions/0/status"));
    }

    #[test]
    fn redelivery_of_the_same_spec_makes_no_chart_engine_calls() {
        let fix = fixture();
        let request = request_for(&fix, "web", 1, json!({"replicas": 2}));
        fix.reconciler.reconcile(&request);
        let calls_after_install = fix.helm.calls().len();

        let outcome = fix.reconciler.reconcile(&request);
        assert_eq!(Phase::Unchanged, outcome.phase);
        assert_eq!(Some(1), outcome.revision);
        assert_eq!(calls_after_install, fix.helm.calls().len());
    }

    #[test]
    fn changed_spec_upgrades_exactly_once() {
        let fix = fixture();
        let request = request_for(&fix, "web", 1, json!({"replicas": 2}));
        fix.reconciler.reconcile(&request);
        let first = fix.store.get(&request.identity).unwrap().unwrap();

        let request = request_for(&fix, "web", 2, json!({"replicas": 3}));
        let outcome = fix.reconciler.reconcile(&request);
        assert_eq!(Phase::Upgraded, outcome.phase);
        assert_eq!(Some(2), outcome.revision);
        assert_eq!(1, fix.helm.upgrade_count());

        let second = fix.store.get(&request.identity).unwrap().unwrap();
        assert_ne!(first.fingerprint, second.fingerprint);
        assert_eq!(2, second.observed_generation);
    }

    #[test]
    fn deletion_uninstalls_and_removes_the_record() {
        let fix = fixture();
        let request = request_for(&fix, "web", 1, json!({"replicas": 2}));
        fix.reconciler.reconcile(&request);
        fix.kube.remove_resource(&request.identity);

        let deletion = ReconcileRequest::new(request.identity.clone(), None);
        let outcome = fix.reconciler.reconcile(&deletion);
        assert_eq!(Phase::Uninstalled, outcome.phase);
        assert_eq!(1, fix.helm.uninstall_count());
        assert!(fix.store.get(&request.identity).unwrap().is_none());

        // redelivered deletion is a no-op without consulting the engine
        let outcome = fix.reconciler.reconcile(&deletion);
        assert_eq!(Phase::Uninstalled, outcome.phase);
        assert_eq!(1, fix.helm.uninstall_count());
    }

    #[test]
    fn transient_failure_leaves_the_record_unchanged_and_requests_retry() {
        let fix = fixture();
        let request = request_for(&fix, "web", 1, json!({"replicas": 2}));
        fix.helm
            .fail_next(crate::helm::HelmError::unavailable("engine down"));

        let outcome = fix.reconciler.reconcile(&request);
        assert_eq!(Phase::Failed, outcome.phase);
        assert!(outcome.retryable);
        assert_eq!("ChartOperationFailed", outcome.reason.as_str());
        assert!(fix.store.get(&request.identity).unwrap().is_none());

        // the redelivery succeeds
        let outcome = fix.reconciler.reconcile(&request);
        assert_eq!(Phase::Installed, outcome.phase);
    }

    #[test]
    fn render_failure_is_terminal() {
        let fix = fixture();
        let request = request_for(&fix, "web", 1, json!({"replicas": 2}));
        fix.helm
            .fail_next(crate::helm::HelmError::render_failed("bad template"));

        let outcome = fix.reconciler.reconcile(&request);
        assert_eq!(Phase::Failed, outcome.phase);
        assert!(!outcome.retryable);

        let status = fix.kube.status_of(&request.identity).unwrap();
        assert_eq!(Some("False"), str_value(&status, "/conditions/0/status"));
        assert_eq!(
            Some("ChartOperationFailed"),
            str_value(&status, "/conditions/0/reason")
        );
    }

    #[test]
    fn live_release_without_a_record_is_adopted_not_reinstalled() {
        let fix = fixture();
        let request = request_for(&fix, "web", 1, json!({"replicas": 2}));
        fix.reconciler.reconcile(&request);

        // a fresh store simulates a restart that lost the working records
        let store = Arc::new(InMemoryReleaseStore::new());
        let restarted = Reconciler::new(
            chart(),
            fix.helm.clone(),
            store.clone(),
            fix.kube.clone(),
        );
        let mutations_before = fix.helm.mutation_count();

        let outcome = restarted.reconcile(&request);
        assert_eq!(Phase::Unchanged, outcome.phase);
        assert_eq!(mutations_before, fix.helm.mutation_count());

        let record = store.get(&request.identity).unwrap().unwrap();
        assert_eq!(1, record.revision);
        assert_eq!(1, record.observed_generation);
    }

    #[test]
    fn record_without_a_live_release_reinstalls() {
        let fix = fixture();
        let request = request_for(&fix, "web", 1, json!({"replicas": 2}));
        fix.reconciler.reconcile(&request);

        // something outside the operator removed the release
        let record = fix.store.get(&request.identity).unwrap().unwrap();
        fix.helm.remove_release(&ReleaseIdent {
            name: record.release_name.clone(),
            namespace: record.namespace.clone(),
        });

        let request = request_for(&fix, "web", 2, json!({"replicas": 3}));
        let outcome = fix.reconciler.reconcile(&request);
        assert_eq!(Phase::Installed, outcome.phase);
        assert_eq!(2, fix.helm.install_count());
        assert_eq!(0, fix.helm.upgrade_count());
    }

    #[test]
    fn status_write_failure_keeps_the_phase_but_requests_retry() {
        let fix = fixture();
        let request = request_for(&fix, "web", 1, json!({"replicas": 2}));
        fix.kube.fail_next_update(crate::k8s::KubeError::Unavailable {
            message: "api server down".to_owned(),
        });

        let outcome = fix.reconciler.reconcile(&request);
        assert_eq!(Phase::Installed, outcome.phase);
        assert!(outcome.retryable);
        // the release operation was not rolled back
        assert!(fix.store.get(&request.identity).unwrap().is_some());
    }

    #[test]
    fn status_write_conflict_is_retried_exactly_once() {
        let fix = fixture();
        let request = request_for(&fix, "web", 1, json!({"replicas": 2}));
        fix.kube.fail_next_update(crate::k8s::KubeError::Conflict {
            message: "stale resourceVersion".to_owned(),
        });

        let outcome = fix.reconciler.reconcile(&request);
        assert_eq!(Phase::Installed, outcome.phase);
        assert!(!outcome.retryable);
        assert_eq!(2, fix.kube.update_count());
        assert!(fix.kube.status_of(&request.identity).is_some());
    }

    #[test]
    fn expired_deadline_fails_retryable_before_any_engine_call() {
        let fix = fixture();
        let request = request_for(&fix, "web", 1, json!({"replicas": 2}))
            .with_deadline(Instant::now() - Duration::from_secs(1));

        let outcome = fix.reconciler.reconcile(&request);
        assert_eq!(Phase::Failed, outcome.phase);
        assert!(outcome.retryable);
        assert_eq!("DeadlineExceeded", outcome.reason.as_str());
        assert_eq!(0, fix.helm.mutation_count());
    }

    #[test]
    fn requests_for_the_same_identity_are_serialized() {
        let helm = Arc::new(RecordingHelm::with_delay(Duration::from_millis(25)));
        let store = Arc::new(InMemoryReleaseStore::new());
        let kube = Arc::new(FakeKube::new());
        let reconciler = Arc::new(Reconciler::new(
            chart(),
            helm.clone(),
            store,
            kube.clone(),
        ));

        let id = identity("web");
        let handles: Vec<_> = (0..4)
            .map(|generation| {
                let reconciler = reconciler.clone();
                let id = id.clone();
                let kube = kube.clone();
                std::thread::spawn(move || {
                    let resource =
                        test_resource(&id, generation, json!({"replicas": generation}));
                    kube.put_resource(&id, resource.clone());
                    let spec = ResourceSpec::from_resource(&resource).unwrap();
                    reconciler.reconcile(&ReconcileRequest::new(id, Some(spec)))
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(1, helm.max_concurrent());
    }

    #[test]
    fn uninstall_does_not_unlock_queued_requests_for_the_same_identity() {
        let helm = Arc::new(RecordingHelm::with_delay(Duration::from_millis(50)));
        let store = Arc::new(InMemoryReleaseStore::new());
        let kube = Arc::new(FakeKube::new());
        let reconciler = Arc::new(Reconciler::new(
            chart(),
            helm.clone(),
            store,
            kube.clone(),
        ));

        let id = identity("web");
        let resource = test_resource(&id, 1, json!({"replicas": 2}));
        kube.put_resource(&id, resource.clone());
        let spec = ResourceSpec::from_resource(&resource).unwrap();
        reconciler.reconcile(&ReconcileRequest::new(id.clone(), Some(spec)));

        let recreate = |generation: i64| {
            let reconciler = reconciler.clone();
            let id = id.clone();
            let kube = kube.clone();
            std::thread::spawn(move || {
                let resource =
                    test_resource(&id, generation, json!({"replicas": 5 + generation}));
                kube.put_resource(&id, resource.clone());
                let spec = ResourceSpec::from_resource(&resource).unwrap();
                reconciler.reconcile(&ReconcileRequest::new(id, Some(spec)))
            })
        };

        // a deletion, one recreate queued behind it, and a second recreate
        // arriving only after the deletion has finished and cleaned up
        let deletion = {
            let reconciler = reconciler.clone();
            let id = id.clone();
            std::thread::spawn(move || reconciler.reconcile(&ReconcileRequest::new(id, None)))
        };
        std::thread::sleep(Duration::from_millis(10));
        let first_recreate = recreate(2);
        std::thread::sleep(Duration::from_millis(70));
        let second_recreate = recreate(3);

        deletion.join().unwrap();
        first_recreate.join().unwrap();
        second_recreate.join().unwrap();
        assert_eq!(1, helm.max_concurrent());
    }

    #[test]
    fn terminal_status_write_failure_is_not_retried() {
        let fix = fixture();
        let request = request_for(&fix, "web", 1, json!({"replicas": 2}));
        fix.kube.fail_next_update(crate::k8s::KubeError::Api {
            status: 422,
            message: "status schema rejected".to_owned(),
        });

        let outcome = fix.reconciler.reconcile(&request);
        assert_eq!(Phase::Installed, outcome.phase);
        assert!(!outcome.retryable);
        assert!(fix.store.get(&request.identity).unwrap().is_some());
    }

    #[test]
    fn every_engine_call_carries_the_configured_timeout() {
        let helm = Arc::new(RecordingHelm::new());
        let store = Arc::new(InMemoryReleaseStore::new());
        let kube = Arc::new(FakeKube::new());
        let reconciler = Reconciler::new(chart(), helm.clone(), store, kube.clone())
            .with_timeout(Duration::from_secs(30));

        let id = identity("web");
        let resource = test_resource(&id, 1, json!({"replicas": 2}));
        kube.put_resource(&id, resource.clone());
        let spec = ResourceSpec::from_resource(&resource).unwrap();
        reconciler.reconcile(&ReconcileRequest::new(id.clone(), Some(spec)));

        // a changed spec forces the read-before-upgrade existence check
        let resource = test_resource(&id, 2, json!({"replicas": 3}));
        kube.put_resource(&id, resource.clone());
        let spec = ResourceSpec::from_resource(&resource).unwrap();
        reconciler.reconcile(&ReconcileRequest::new(id, Some(spec)));

        assert!(helm
            .calls()
            .iter()
            .any(|call| matches!(call, HelmCall::Get(_))));
        let timeouts = helm.timeouts();
        assert!(!timeouts.is_empty());
        assert!(timeouts
            .iter()
            .all(|timeout| *timeout == Some(Duration::from_secs(30))));
    }

    #[test]
    fn distinct_resources_get_distinct_releases() {
        let fix = fixture();
        let a = request_for(&fix, "web", 1, json!({"replicas": 2}));
        let b = request_for(&fix, "api", 1, json!({"replicas": 2}));
        fix.reconciler.reconcile(&a);
        fix.reconciler.reconcile(&b);

        let installs: Vec<_> = fix
            .helm
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                HelmCall::Install(ident) => Some(ident),
                _ => None,
            })
            .collect();
        assert_eq!(2, installs.len());
        assert_ne!(installs[0], installs[1]);
    }
}
