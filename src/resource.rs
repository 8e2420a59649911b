//! Types describing the custom resources being reconciled. A `ResourceIdentity`
//! names exactly one resource instance and is used as the concurrency key for
//! the whole reconciliation pipeline. A `ResourceSpec` is the declared desired
//! state read from that instance, along with the metadata markers needed to
//! detect changes and to perform conditional status writes.
//!
//! Both types are plain data. They are handed to the reconciler by the watch
//! layer for the duration of a single reconciliation and are never retained
//! beyond that call.
use crate::config::WatchedKind;

use serde_json::Value;

use std::fmt::{self, Display};

pub type JsonObject = serde_json::Map<String, Value>;

/// Identifies a single custom resource instance. Names are only unique within
/// a namespace, so the full identity is (group, version, kind, namespace, name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceIdentity {
    pub group: String,
    pub version: String,
    pub kind: String,
    /// Empty string for cluster-scoped resources or when the default namespace applies
    pub namespace: String,
    pub name: String,
}

impl ResourceIdentity {
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> ResourceIdentity {
        ResourceIdentity {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Creates an identity for an instance of the given watched kind
    pub fn for_kind(
        kind: &WatchedKind,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> ResourceIdentity {
        ResourceIdentity {
            group: kind.group.clone(),
            version: kind.version.clone(),
            kind: kind.kind.clone(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Returns an option containing a non-empty namespace. Returns `None` if
    /// the namespace is an empty string.
    pub fn namespace(&self) -> Option<&str> {
        if self.namespace.is_empty() {
            None
        } else {
            Some(self.namespace.as_str())
        }
    }

    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// The `apiVersion` string as it appears on the wire, e.g. `demo.example.com/v1alpha1`
    pub fn format_api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}/{} {}/{}",
            self.format_api_version(),
            self.kind,
            self.namespace,
            self.name
        )
    }
}

/// Error returned when a resource instance is missing the fields required to
/// reconcile it. This is a terminal condition: retrying the same input cannot
/// succeed until the resource itself changes.
#[derive(Debug, PartialEq, Clone)]
pub struct InvalidResourceError {
    pub message: &'static str,
    pub value: Value,
}

impl InvalidResourceError {
    pub fn new(message: &'static str, value: Value) -> Self {
        InvalidResourceError { message, value }
    }
}

impl Display for InvalidResourceError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Invalid Resource: {}", self.message)
    }
}

impl std::error::Error for InvalidResourceError {}

/// The declared desired state read from one resource instance: the raw `spec`
/// object that becomes the chart value overlay, plus the generation and
/// resourceVersion markers from the metadata.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// The `spec` object of the resource, used as the chart value overlay
    pub overlay: Value,
    /// `metadata.generation` at the time the spec was observed
    pub generation: i64,
    /// `metadata.resourceVersion` at the time the spec was observed
    pub resource_version: String,
}

impl ResourceSpec {
    pub fn new(
        overlay: Value,
        generation: i64,
        resource_version: impl Into<String>,
    ) -> ResourceSpec {
        ResourceSpec {
            overlay,
            generation,
            resource_version: resource_version.into(),
        }
    }

    /// Extracts the spec from a raw resource as returned by the api server.
    /// The `spec` field may be absent (treated as an empty overlay), but the
    /// resourceVersion must be present.
    pub fn from_resource(resource: &Value) -> Result<ResourceSpec, InvalidResourceError> {
        let resource_version = resource
            .pointer("/metadata/resourceVersion")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                InvalidResourceError::new("missing metadata.resourceVersion", resource.clone())
            })?;
        let generation = resource
            .pointer("/metadata/generation")
            .and_then(Value::as_i64)
            .unwrap_or(-1);
        let overlay = resource
            .pointer("/spec")
            .cloned()
            .unwrap_or_else(|| Value::Object(JsonObject::new()));
        if !overlay.is_object() {
            return Err(InvalidResourceError::new(
                "spec must be an object",
                resource.clone(),
            ));
        }
        Ok(ResourceSpec {
            overlay,
            generation,
            resource_version: resource_version.to_owned(),
        })
    }
}

/// One unit of work delivered by the watch layer. A request with no spec means
/// the resource has been deleted and its release must be uninstalled. Delivery
/// is at-least-once, so requests may be duplicates of ones already processed.
#[derive(Debug, Clone)]
pub struct ReconcileRequest {
    pub identity: ResourceIdentity,
    pub spec: Option<ResourceSpec>,
    /// Deadline for the blocking chart and api operations performed on behalf
    /// of this request. When exceeded, the reconciliation reports a retryable
    /// failure rather than a terminal one.
    pub deadline: Option<std::time::Instant>,
}

impl ReconcileRequest {
    pub fn new(identity: ResourceIdentity, spec: Option<ResourceSpec>) -> ReconcileRequest {
        ReconcileRequest {
            identity,
            spec,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: std::time::Instant) -> ReconcileRequest {
        self.deadline = Some(deadline);
        self
    }

    /// Returns the time remaining until the deadline, or `None` if no deadline
    /// was set. A deadline in the past returns a zero duration.
    pub fn time_remaining(&self) -> Option<std::time::Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(std::time::Instant::now()))
    }
}

pub fn str_value<'a>(json: &'a Value, pointer: &str) -> Option<&'a str> {
    json.pointer(pointer).and_then(Value::as_str)
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn spec_is_extracted_from_a_raw_resource() {
        let resource = json!({
            "apiVersion": "demo.example.com/v1alpha1",
            "kind": "Nginx",
            "metadata": {
                "namespace": "default",
                "name": "web",
                "resourceVersion": "1234",
                "generation": 3,
            },
            "spec": {
                "replicas": 2,
            }
        });
        let spec = ResourceSpec::from_resource(&resource).unwrap();
        assert_eq!(json!({"replicas": 2}), spec.overlay);
        assert_eq!(3, spec.generation);
        assert_eq!("1234", spec.resource_version.as_str());
    }

    #[test]
    fn missing_spec_field_becomes_an_empty_overlay() {
        let resource = json!({
            "metadata": {
                "name": "web",
                "resourceVersion": "1",
            }
        });
        let spec = ResourceSpec::from_resource(&resource).unwrap();
        assert_eq!(json!({}), spec.overlay);
        assert_eq!(-1, spec.generation);
    }

    #[test]
    fn missing_resource_version_is_an_error() {
        let resource = json!({
            "metadata": { "name": "web" },
            "spec": {}
        });
        let err = ResourceSpec::from_resource(&resource).unwrap_err();
        assert_eq!("missing metadata.resourceVersion", err.message);
    }

    #[test]
    fn non_object_spec_is_an_error() {
        let resource = json!({
            "metadata": { "name": "web", "resourceVersion": "1" },
            "spec": ["not", "an", "object"]
        });
        assert!(ResourceSpec::from_resource(&resource).is_err());
    }

    #[test]
    fn api_version_formatting_handles_core_group() {
        let id = ResourceIdentity::new("", "v1", "ConfigMap", "default", "cm");
        assert_eq!("v1", id.format_api_version());
        let id = ResourceIdentity::new("demo.example.com", "v1alpha1", "Nginx", "default", "web");
        assert_eq!("demo.example.com/v1alpha1", id.format_api_version());
    }
}
