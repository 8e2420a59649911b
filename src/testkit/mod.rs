//! Test instrumentation for exercising the reconciler without a cluster or a
//! chart engine. `RecordingHelm` and `FakeKube` stand in for the real
//! boundaries, record every call they receive, and can be scripted to fail.
//! Everything here panics freely on misuse, since it only ever runs in tests.
use crate::chart::ChartDescriptor;
use crate::helm::{HelmClient, HelmError, Release};
use crate::k8s::{KubeApi, KubeError};
use crate::release::ReleaseIdent;
use crate::resource::ResourceIdentity;

use serde_json::{json, Value};

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// One call received by a `RecordingHelm`, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum HelmCall {
    Install(ReleaseIdent),
    Upgrade(ReleaseIdent),
    Uninstall(ReleaseIdent),
    Get(ReleaseIdent),
}

/// An in-memory chart engine that behaves like the real one from the
/// reconciler's point of view: releases are keyed by (namespace, name),
/// revisions increase monotonically, and the effective values are stored with
/// each release. Failures queued with [`fail_next`](RecordingHelm::fail_next)
/// are returned by the next mutating call, one failure per call.
pub struct RecordingHelm {
    releases: Mutex<HashMap<ReleaseIdent, Release>>,
    calls: Mutex<Vec<HelmCall>>,
    timeouts: Mutex<Vec<Option<Duration>>>,
    failures: Mutex<VecDeque<HelmError>>,
    delay: Option<Duration>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl RecordingHelm {
    pub fn new() -> RecordingHelm {
        RecordingHelm {
            releases: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            timeouts: Mutex::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
            delay: None,
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    /// Makes every mutating call sleep for the given duration, to widen the
    /// window in which concurrent reconciliations could overlap.
    pub fn with_delay(delay: Duration) -> RecordingHelm {
        let mut helm = RecordingHelm::new();
        helm.delay = Some(delay);
        helm
    }

    pub fn fail_next(&self, err: HelmError) {
        self.failures.lock().unwrap().push_back(err);
    }

    pub fn calls(&self) -> Vec<HelmCall> {
        self.calls.lock().unwrap().clone()
    }

    /// The timeout passed with each call, in arrival order
    pub fn timeouts(&self) -> Vec<Option<Duration>> {
        self.timeouts.lock().unwrap().clone()
    }

    pub fn install_count(&self) -> usize {
        self.count(|call| matches!(call, HelmCall::Install(_)))
    }

    pub fn upgrade_count(&self) -> usize {
        self.count(|call| matches!(call, HelmCall::Upgrade(_)))
    }

    pub fn uninstall_count(&self) -> usize {
        self.count(|call| matches!(call, HelmCall::Uninstall(_)))
    }

    /// Total installs, upgrades, and uninstalls received, including failed ones
    pub fn mutation_count(&self) -> usize {
        self.count(|call| !matches!(call, HelmCall::Get(_)))
    }

    /// The largest number of mutating calls that were ever in flight at once
    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn release(&self, ident: &ReleaseIdent) -> Option<Release> {
        self.releases.lock().unwrap().get(ident).cloned()
    }

    pub fn release_named(&self, name: &str) -> Option<Release> {
        self.releases
            .lock()
            .unwrap()
            .values()
            .find(|release| release.name == name)
            .cloned()
    }

    pub fn put_release(&self, release: Release) {
        let ident = ReleaseIdent {
            name: release.name.clone(),
            namespace: release.namespace.clone(),
        };
        self.releases.lock().unwrap().insert(ident, release);
    }

    pub fn remove_release(&self, ident: &ReleaseIdent) {
        self.releases.lock().unwrap().remove(ident);
    }

    fn count(&self, predicate: impl Fn(&HelmCall) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| predicate(c)).count()
    }

    fn record(&self, call: HelmCall, timeout: Option<Duration>) {
        self.calls.lock().unwrap().push(call);
        self.timeouts.lock().unwrap().push(timeout);
    }

    fn next_failure(&self) -> Option<HelmError> {
        self.failures.lock().unwrap().pop_front()
    }

    fn mutate<T>(&self, work: impl FnOnce() -> T) -> T {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        let result = work();
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

impl Default for RecordingHelm {
    fn default() -> RecordingHelm {
        RecordingHelm::new()
    }
}

impl HelmClient for RecordingHelm {
    fn install(
        &self,
        release: &ReleaseIdent,
        chart: &ChartDescriptor,
        values: &Value,
        timeout: Option<Duration>,
    ) -> Result<Release, HelmError> {
        self.record(HelmCall::Install(release.clone()), timeout);
        if let Some(err) = self.next_failure() {
            return Err(err);
        }
        self.mutate(|| {
            let mut releases = self.releases.lock().unwrap();
            let revision = releases.get(release).map(|r| r.revision + 1).unwrap_or(1);
            let installed = Release {
                name: release.name.clone(),
                namespace: release.namespace.clone(),
                revision,
                chart_version: chart.version.clone(),
                values: values.clone(),
            };
            releases.insert(release.clone(), installed.clone());
            Ok(installed)
        })
    }

    fn upgrade(
        &self,
        release: &ReleaseIdent,
        chart: &ChartDescriptor,
        values: &Value,
        timeout: Option<Duration>,
    ) -> Result<Release, HelmError> {
        self.record(HelmCall::Upgrade(release.clone()), timeout);
        if let Some(err) = self.next_failure() {
            return Err(err);
        }
        self.mutate(|| {
            let mut releases = self.releases.lock().unwrap();
            let revision = releases.get(release).map(|r| r.revision + 1).unwrap_or(1);
            let upgraded = Release {
                name: release.name.clone(),
                namespace: release.namespace.clone(),
                revision,
                chart_version: chart.version.clone(),
                values: values.clone(),
            };
            releases.insert(release.clone(), upgraded.clone());
            Ok(upgraded)
        })
    }

    fn uninstall(
        &self,
        release: &ReleaseIdent,
        timeout: Option<Duration>,
    ) -> Result<(), HelmError> {
        self.record(HelmCall::Uninstall(release.clone()), timeout);
        if let Some(err) = self.next_failure() {
            return Err(err);
        }
        self.mutate(|| {
            let removed = self.releases.lock().unwrap().remove(release);
            if removed.is_none() {
                return Err(HelmError::release_not_found(release));
            }
            Ok(())
        })
    }

    fn get(
        &self,
        release: &ReleaseIdent,
        timeout: Option<Duration>,
    ) -> Result<Option<Release>, HelmError> {
        self.record(HelmCall::Get(release.clone()), timeout);
        Ok(self.releases.lock().unwrap().get(release).cloned())
    }
}

/// An in-memory api server for the watched resources. Status writes are
/// conditional on resourceVersion, just like the real thing, and every
/// successful write bumps the version.
pub struct FakeKube {
    resources: Mutex<HashMap<ResourceIdentity, Value>>,
    update_failures: Mutex<VecDeque<KubeError>>,
    update_attempts: AtomicUsize,
}

impl FakeKube {
    pub fn new() -> FakeKube {
        FakeKube {
            resources: Mutex::new(HashMap::new()),
            update_failures: Mutex::new(VecDeque::new()),
            update_attempts: AtomicUsize::new(0),
        }
    }

    pub fn put_resource(&self, identity: &ResourceIdentity, mut resource: Value) {
        if resource.pointer("/metadata/resourceVersion").is_none() {
            resource["metadata"]["resourceVersion"] = json!("1");
        }
        self.resources
            .lock()
            .unwrap()
            .insert(identity.clone(), resource);
    }

    pub fn remove_resource(&self, identity: &ResourceIdentity) {
        self.resources.lock().unwrap().remove(identity);
    }

    pub fn status_of(&self, identity: &ResourceIdentity) -> Option<Value> {
        self.resources
            .lock()
            .unwrap()
            .get(identity)
            .and_then(|resource| resource.pointer("/status"))
            .cloned()
    }

    /// Makes the next `update_status` call fail with the given error,
    /// regardless of its resourceVersion.
    pub fn fail_next_update(&self, err: KubeError) {
        self.update_failures.lock().unwrap().push_back(err);
    }

    /// Number of `update_status` calls received, including failed ones
    pub fn update_count(&self) -> usize {
        self.update_attempts.load(Ordering::SeqCst)
    }
}

impl Default for FakeKube {
    fn default() -> FakeKube {
        FakeKube::new()
    }
}

impl KubeApi for FakeKube {
    fn get_resource(&self, identity: &ResourceIdentity) -> Result<Option<Value>, KubeError> {
        Ok(self.resources.lock().unwrap().get(identity).cloned())
    }

    fn update_status(
        &self,
        identity: &ResourceIdentity,
        resource_version: &str,
        status: &Value,
    ) -> Result<(), KubeError> {
        self.update_attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.update_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        let mut resources = self.resources.lock().unwrap();
        let resource = resources.get_mut(identity).ok_or(KubeError::NotFound)?;
        let current = resource
            .pointer("/metadata/resourceVersion")
            .and_then(Value::as_str)
            .unwrap_or("");
        if current != resource_version {
            return Err(KubeError::Conflict {
                message: format!(
                    "resourceVersion {} does not match current {}",
                    resource_version, current
                ),
            });
        }
        let next_version = current.parse::<u64>().map(|v| v + 1).unwrap_or(1);
        resource["metadata"]["resourceVersion"] = json!(next_version.to_string());
        resource["status"] = status.clone();
        Ok(())
    }
}

/// A raw resource document of the identity's kind, with the given generation
/// and spec. The resourceVersion is derived from the generation so successive
/// documents for the same resource carry distinct versions.
pub fn test_resource(identity: &ResourceIdentity, generation: i64, spec: Value) -> Value {
    json!({
        "apiVersion": identity.format_api_version(),
        "kind": identity.kind,
        "metadata": {
            "namespace": identity.namespace,
            "name": identity.name,
            "generation": generation,
            "resourceVersion": format!("{}", 1000 + generation),
        },
        "spec": spec,
    })
}
