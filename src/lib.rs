//! Chartop turns a Helm chart into a Kubernetes operator: each instance of a
//! watched Custom Resource becomes exactly one release of a single chart, and
//! the resource's `spec` becomes the value overlay applied on top of the
//! chart's defaults.
//!
//! The crate is the reconciliation core only. The hosting process owns the
//! watch machinery and delivers `ReconcileRequest`s (at least once, possibly
//! duplicated); the `Reconciler` turns each request into at most one chart
//! engine operation and reports the result on the resource's status.
//!
//! Nginx operator example:
//! ```no_run
//! use chartop::prelude::*;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # fn helm_client() -> Arc<dyn chartop::helm::HelmClient> { unimplemented!() }
//! # fn kube_api() -> Arc<dyn chartop::k8s::KubeApi> { unimplemented!() }
//! # fn next_request() -> ReconcileRequest { unimplemented!() }
//! // One operator process binds to one resource kind and one chart directory
//! let kind = WatchedKind::new("demo.example.com", "v1alpha1", "Nginx", "nginxes");
//! let config = OperatorConfig::new("nginx-operator", kind, "helm-charts/nginx")
//!     .with_selector(LabelSelector::parse("app=nginx").unwrap())
//!     .with_reconcile_timeout(Duration::from_secs(60));
//!
//! let store = Arc::new(InMemoryReleaseStore::new());
//! let reconciler = Reconciler::from_config(&config, helm_client(), store, kube_api())
//!     .expect("failed to load chart");
//!
//! // the watch layer drives this loop and handles redelivery with backoff
//! loop {
//!     let request = next_request();
//!     let outcome = reconciler.reconcile(&request);
//!     if outcome.retryable {
//!         // requeue the request
//!     }
//! }
//! ```

#[macro_use]
extern crate serde_derive;

pub mod chart;
pub mod config;
pub mod error;
pub mod helm;
pub mod k8s;
pub mod metrics;
pub mod reconcile;
pub mod release;
pub mod resource;
pub mod status;
pub mod values;

#[cfg(any(test, feature = "testkit"))]
pub mod testkit;

pub use serde;
pub use serde_json;
pub use serde_yaml;

pub mod prelude {
    pub use crate::chart::ChartDescriptor;
    pub use crate::config::{LabelSelector, OperatorConfig, WatchedKind};
    pub use crate::error::ReconcileError;
    pub use crate::helm::{HelmClient, Release};
    pub use crate::k8s::KubeApi;
    pub use crate::reconcile::{Phase, ReconcileOutcome, Reconciler};
    pub use crate::release::{InMemoryReleaseStore, ReleaseIdent, ReleaseStore};
    pub use crate::resource::{ReconcileRequest, ResourceIdentity, ResourceSpec};
    pub use serde::{Deserialize, Serialize};
}
