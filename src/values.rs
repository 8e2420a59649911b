//! Chart value computation: merging the chart's default values with a
//! resource's declared overlay, and producing the stable fingerprint that lets
//! the reconciler recognize no-op requests without touching the chart engine.
//!
//! Values are modeled as `serde_json::Value` trees: scalars, sequences, and
//! mappings. Merge precedence is documented on `deep_merge`.
use crate::chart::ChartDescriptor;
use crate::resource::{InvalidResourceError, JsonObject, ResourceSpec};

use serde_json::Value;
use sha2::{Digest, Sha256};

use std::fmt::{self, Display, Write};

/// Merges `overlay` on top of `base` and returns the effective value tree.
///
/// Precedence rules:
/// - mapping + mapping: merged recursively, key by key
/// - anything else (scalar vs scalar, sequence vs sequence, or mismatched
///   node types): the overlay wins wholesale, last writer wins
///
/// Neither input is mutated.
pub fn deep_merge(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            let mut merged = base_map.clone();
            for (key, overlay_val) in overlay_map.iter() {
                match merged.get(key) {
                    Some(base_val) => {
                        let new_val = deep_merge(base_val, overlay_val);
                        merged.insert(key.clone(), new_val);
                    }
                    None => {
                        merged.insert(key.clone(), overlay_val.clone());
                    }
                }
            }
            Value::Object(merged)
        }
        (_, other) => other.clone(),
    }
}

/// Computes the effective values and their fingerprint for one resource spec.
/// The spec overlay takes precedence over the chart defaults. Returns an error
/// if the overlay is not a mapping, which is a terminal condition for the
/// resource as written.
pub fn translate(
    chart: &ChartDescriptor,
    spec: &ResourceSpec,
) -> Result<(Value, String), InvalidResourceError> {
    if !spec.overlay.is_object() {
        return Err(InvalidResourceError::new(
            "chart value overlay must be a mapping",
            spec.overlay.clone(),
        ));
    }
    let values = deep_merge(&chart.default_values, &spec.overlay);
    let fingerprint = fingerprint(chart.version.as_str(), &values);
    Ok((values, fingerprint))
}

/// A stable hash over the chart version and the effective values. Two
/// semantically equal value trees always produce the same fingerprint,
/// regardless of mapping key order, because keys are visited in sorted order.
///
/// SHA-256 rather than the std hasher: the fingerprint is persisted in release
/// records and must remain stable across toolchain versions.
pub fn fingerprint(chart_version: &str, values: &Value) -> String {
    let mut canonical = String::with_capacity(256);
    canonical.push_str(chart_version);
    canonical.push('\u{1f}');
    write_canonical(&mut canonical, values);
    let digest = Sha256::digest(canonical.as_bytes());
    let mut out = String::with_capacity(70);
    out.push_str("sha256:");
    for byte in digest.iter() {
        let _ = write!(out, "{:02x}", byte);
    }
    out
}

fn write_canonical(out: &mut String, value: &Value) {
    match value {
        Value::Object(map) => {
            // serde_json maps iterate in sorted key order, but we sort
            // explicitly so the fingerprint does not depend on the
            // preserve_order feature being off
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                let _ = write!(out, "{}:", Value::String((*key).clone()));
                write_canonical(out, &map[key.as_str()]);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(out, item);
            }
            out.push(']');
        }
        scalar => {
            let _ = write!(out, "{}", scalar);
        }
    }
}

#[derive(Debug, PartialEq)]
pub struct Diff<'a> {
    pub path: String,
    pub existing: &'a Value,
    pub desired: &'a Value,
}

impl<'a> Display for Diff<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Diff at path: '{}', existing: {}, desired: {}",
            self.path, self.existing, self.desired
        )
    }
}

pub struct Diffs<'a>(Vec<Diff<'a>>);

impl<'a> Diffs<'a> {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn non_empty(&self) -> bool {
        !self.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl<'a> Display for Diffs<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_empty() {
            f.write_str("<empty>")
        } else {
            write!(f, "{} differences: ", self.0.len())?;
            for (i, diff) in self.0.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                Display::fmt(diff, f)?;
            }
            Ok(())
        }
    }
}

enum Segment<'a> {
    Key(&'a str),
    Index(usize),
}

/// Compares an existing and desired json value. Returns an empty diff as long
/// as `existing` is a superset of `desired`: every value in `desired` must be
/// present and equal in `existing`, but extra fields in `existing` are
/// ignored. Used to skip status writes whose rendered content is already on
/// the resource.
pub fn compare_values<'a>(existing: &'a Value, desired: &'a Value) -> Diffs<'a> {
    let mut diffs = Vec::new();
    let mut path = Vec::with_capacity(8);
    compare(&mut diffs, &mut path, existing, desired);
    Diffs(diffs)
}

fn compare<'a>(
    diffs: &mut Vec<Diff<'a>>,
    path: &mut Vec<Segment<'a>>,
    superset: &'a Value,
    subset: &'a Value,
) {
    match (superset, subset) {
        (Value::Object(super_map), Value::Object(sub_map)) => {
            for (key, desired_val) in sub_map.iter() {
                path.push(Segment::Key(key));
                match super_map.get(key) {
                    Some(super_val) => compare(diffs, path, super_val, desired_val),
                    None => diffs.push(diff(&*path, &Value::Null, desired_val)),
                }
                path.pop();
            }
        }
        (Value::Array(super_array), Value::Array(sub_array)) => {
            for (i, desired_item) in sub_array.iter().enumerate() {
                path.push(Segment::Index(i));
                if super_array.len() > i {
                    compare(diffs, path, &super_array[i], desired_item);
                } else {
                    diffs.push(diff(&*path, &Value::Null, desired_item));
                }
                path.pop();
            }
            if super_array.len() != sub_array.len() {
                diffs.push(diff(&*path, superset, subset));
            }
        }
        (a, b) if a != b => {
            diffs.push(diff(&*path, a, b));
        }
        _ => {}
    }
}

fn diff<'a>(path: &[Segment], existing: &'a Value, desired: &'a Value) -> Diff<'a> {
    let mut p = String::with_capacity(8);
    for s in path.iter() {
        p.push('.');
        match s {
            Segment::Key(k) => p.push_str(k),
            Segment::Index(i) => {
                let _ = write!(p, "{}", i);
            }
        }
    }
    Diff {
        path: p,
        existing,
        desired,
    }
}

pub fn empty_object() -> Value {
    Value::Object(JsonObject::new())
}
