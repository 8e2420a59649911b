//! Loading and validating the chart this operator instantiates. The chart is
//! loaded once at startup and shared read-only by every reconciliation, so
//! any problem found here is fatal for the process rather than retried.
use crate::resource::JsonObject;

use serde_json::Value;

use std::fmt::{self, Display};
use std::fs;
use std::path::Path;

/// A packaged chart: identifying metadata, the default values it ships with,
/// and the names of its template files. Immutable for the process lifetime.
#[derive(Debug, Clone, PartialEq)]
pub struct ChartDescriptor {
    pub name: String,
    pub version: String,
    /// The contents of `values.yaml`, converted to json. Always a mapping.
    pub default_values: Value,
    /// Template file names relative to the chart's `templates/` directory
    pub templates: Vec<String>,
}

#[derive(Debug)]
pub enum ChartError {
    Io(std::io::Error),
    Yaml(serde_yaml::Error),
    MissingField(&'static str),
    InvalidValues(&'static str),
}

impl Display for ChartError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ChartError::Io(e) => write!(f, "Failed to read chart: {}", e),
            ChartError::Yaml(e) => write!(f, "Failed to parse chart yaml: {}", e),
            ChartError::MissingField(field) => {
                write!(f, "Chart.yaml is missing required field '{}'", field)
            }
            ChartError::InvalidValues(msg) => write!(f, "Invalid values.yaml: {}", msg),
        }
    }
}

impl std::error::Error for ChartError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ChartError::Io(e) => Some(e),
            ChartError::Yaml(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ChartError {
    fn from(err: std::io::Error) -> ChartError {
        ChartError::Io(err)
    }
}

impl From<serde_yaml::Error> for ChartError {
    fn from(err: serde_yaml::Error) -> ChartError {
        ChartError::Yaml(err)
    }
}

#[derive(Debug, Deserialize)]
struct ChartManifest {
    name: Option<String>,
    version: Option<String>,
}

impl ChartDescriptor {
    /// Loads a chart from a directory laid out the standard way: `Chart.yaml`
    /// with the name and version, an optional `values.yaml` with defaults,
    /// and an optional `templates/` directory.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<ChartDescriptor, ChartError> {
        let dir = dir.as_ref();
        let manifest_text = fs::read_to_string(dir.join("Chart.yaml"))?;
        let values_text = match fs::read_to_string(dir.join("values.yaml")) {
            Ok(text) => Some(text),
            Err(ref err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => return Err(err.into()),
        };
        let mut templates = Vec::new();
        let templates_dir = dir.join("templates");
        if templates_dir.is_dir() {
            for entry in fs::read_dir(&templates_dir)? {
                let entry = entry?;
                if entry.file_type()?.is_file() {
                    templates.push(entry.file_name().to_string_lossy().into_owned());
                }
            }
            templates.sort();
        }
        let chart = ChartDescriptor::from_yaml(&manifest_text, values_text.as_deref(), templates)?;
        log::info!(
            "Loaded chart '{}' version {} with {} templates from {}",
            chart.name,
            chart.version,
            chart.templates.len(),
            dir.display()
        );
        Ok(chart)
    }

    /// Builds a descriptor from raw yaml text. Split out from `load_dir` so
    /// that parsing and validation are testable without a filesystem.
    pub fn from_yaml(
        manifest_yaml: &str,
        values_yaml: Option<&str>,
        templates: Vec<String>,
    ) -> Result<ChartDescriptor, ChartError> {
        let manifest: ChartManifest = serde_yaml::from_str(manifest_yaml)?;
        let name = manifest.name.ok_or(ChartError::MissingField("name"))?;
        let version = manifest.version.ok_or(ChartError::MissingField("version"))?;

        let default_values = match values_yaml {
            Some(text) if !text.trim().is_empty() => {
                let yaml: serde_yaml::Value = serde_yaml::from_str(text)?;
                let json = serde_json::to_value(yaml)
                    .map_err(|_| ChartError::InvalidValues("values are not representable as json"))?;
                if !json.is_object() {
                    return Err(ChartError::InvalidValues("top level must be a mapping"));
                }
                json
            }
            _ => Value::Object(JsonObject::new()),
        };

        Ok(ChartDescriptor {
            name,
            version,
            default_values,
            templates,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    const MANIFEST: &str = "apiVersion: v2\nname: nginx\nversion: 0.1.0\n";

    #[test]
    fn chart_is_parsed_from_yaml() {
        let values = "replicas: 1\nimage:\n  repository: nginx\n  tag: \"1.25\"\n";
        let chart =
            ChartDescriptor::from_yaml(MANIFEST, Some(values), vec!["deployment.yaml".to_owned()])
                .unwrap();
        assert_eq!("nginx", chart.name.as_str());
        assert_eq!("0.1.0", chart.version.as_str());
        assert_eq!(
            json!({"replicas": 1, "image": {"repository": "nginx", "tag": "1.25"}}),
            chart.default_values
        );
        assert_eq!(vec!["deployment.yaml".to_owned()], chart.templates);
    }

    #[test]
    fn missing_values_file_yields_empty_defaults() {
        let chart = ChartDescriptor::from_yaml(MANIFEST, None, Vec::new()).unwrap();
        assert_eq!(json!({}), chart.default_values);
    }

    #[test]
    fn manifest_without_version_is_rejected() {
        let err = ChartDescriptor::from_yaml("name: nginx\n", None, Vec::new()).unwrap_err();
        match err {
            ChartError::MissingField(field) => assert_eq!("version", field),
            other => panic!("expected MissingField, got: {}", other),
        }
    }

    #[test]
    fn non_mapping_values_are_rejected() {
        let err = ChartDescriptor::from_yaml(MANIFEST, Some("- a\n- b\n"), Vec::new()).unwrap_err();
        match err {
            ChartError::InvalidValues(_) => {}
            other => panic!("expected InvalidValues, got: {}", other),
        }
    }
}
