//! Startup configuration for the operator. All of these values are read once
//! at process start and are immutable inputs to the reconciler for its
//! lifetime. The watched kind is explicit configuration rather than a global
//! type registry, so the same binary can manage a different kind without
//! recompilation.
use crate::resource::JsonObject;

use serde_json::Value;

use std::fmt::{self, Display};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_TRACKING_LABEL_NAME: &str = "app.kubernetes.io/instance";
pub const DEFAULT_OWNERSHIP_LABEL_NAME: &str = "app.kubernetes.io/managed-by";

/// The group/version/kind this operator manages. One operator process binds to
/// exactly one kind and one chart.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WatchedKind {
    /// Empty string for the core api group
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural_kind: String,
}

impl WatchedKind {
    pub fn new(group: &str, version: &str, kind: &str, plural_kind: &str) -> WatchedKind {
        WatchedKind {
            group: group.to_owned(),
            version: version.to_owned(),
            kind: kind.to_owned(),
            plural_kind: plural_kind.to_owned(),
        }
    }

    pub fn format_api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl Display for WatchedKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.plural_kind)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.plural_kind)
        }
    }
}

/// An equality-based label selector, e.g. `app=frontend,tier=web`. The watch
/// layer evaluates this against resource metadata before a reconcile request
/// is ever constructed; the reconciler itself never filters.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LabelSelector {
    requirements: Vec<(String, String)>,
}

#[derive(Debug, PartialEq, Clone)]
pub struct InvalidSelectorError {
    pub selector: String,
    pub message: &'static str,
}

impl Display for InvalidSelectorError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Invalid selector '{}': {}", self.selector, self.message)
    }
}

impl std::error::Error for InvalidSelectorError {}

impl LabelSelector {
    /// Parses a comma-separated list of `key=value` requirements. An empty
    /// string selects everything. Set-based requirements (`in`, `notin`, `!=`)
    /// are not supported.
    pub fn parse(selector: &str) -> Result<LabelSelector, InvalidSelectorError> {
        let mut requirements = Vec::new();
        for part in selector.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let mut split = part.splitn(2, '=');
            let key = split.next().unwrap_or("").trim();
            let value = match split.next() {
                Some(v) => v.trim(),
                None => {
                    return Err(InvalidSelectorError {
                        selector: selector.to_owned(),
                        message: "requirement is missing '='",
                    })
                }
            };
            if key.is_empty() {
                return Err(InvalidSelectorError {
                    selector: selector.to_owned(),
                    message: "requirement has an empty key",
                });
            }
            if key.ends_with('!') || value.starts_with('=') {
                return Err(InvalidSelectorError {
                    selector: selector.to_owned(),
                    message: "only equality-based requirements are supported",
                });
            }
            requirements.push((key.to_owned(), value.to_owned()));
        }
        Ok(LabelSelector { requirements })
    }

    /// Pure predicate over a resource's `metadata.labels` object. Every
    /// requirement must match.
    pub fn matches(&self, labels: &JsonObject) -> bool {
        self.requirements.iter().all(|(key, value)| {
            labels
                .get(key)
                .and_then(Value::as_str)
                .map(|v| v == value)
                .unwrap_or(false)
        })
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }
}

impl Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, (key, value)) in self.requirements.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}={}", key, value)?;
        }
        Ok(())
    }
}

/// Top-level operator configuration: which chart to instantiate, which
/// resource kind drives it, and how reconciliations are scoped and bounded.
#[derive(Debug, Clone, PartialEq)]
pub struct OperatorConfig {
    pub operator_name: String,
    pub watched_kind: WatchedKind,
    /// Directory containing `Chart.yaml`, `values.yaml`, and `templates/`
    pub chart_dir: PathBuf,
    /// Restricts which resource instances this operator manages
    pub selector: LabelSelector,
    /// Restricts watches to a single namespace when set
    pub namespace: Option<String>,
    /// Upper bound on the blocking work done for one reconcile request
    pub reconcile_timeout: Option<Duration>,
    pub tracking_label_name: String,
    pub ownership_label_name: String,
}

impl OperatorConfig {
    pub fn new(
        operator_name: impl Into<String>,
        watched_kind: WatchedKind,
        chart_dir: impl Into<PathBuf>,
    ) -> OperatorConfig {
        OperatorConfig {
            operator_name: operator_name.into(),
            watched_kind,
            chart_dir: chart_dir.into(),
            selector: LabelSelector::default(),
            namespace: None,
            reconcile_timeout: None,
            tracking_label_name: DEFAULT_TRACKING_LABEL_NAME.to_owned(),
            ownership_label_name: DEFAULT_OWNERSHIP_LABEL_NAME.to_owned(),
        }
    }

    pub fn with_selector(mut self, selector: LabelSelector) -> Self {
        self.selector = selector;
        self
    }

    pub fn within_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_reconcile_timeout(mut self, timeout: Duration) -> Self {
        self.reconcile_timeout = Some(timeout);
        self
    }
}
