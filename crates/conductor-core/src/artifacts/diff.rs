//! Structured diffs between two versions of an artifact.
//!
//! Only versions sharing `(job_id, type, role)` are comparable. The diff
//! shape depends on the artifact type: charts compare their metadata
//! sections, point sets, and nested label/config objects; PDFs and text
//! compare scalar metadata fields. Every other type is unsupported.

use serde::Serialize;
use serde_json::{json, Map, Value};
use thiserror::Error;

use conductor_db::models::{Artifact, ArtifactType};

/// Chart metadata fields compared as scalars.
const CHART_SCALAR_FIELDS: &[&str] = &["title", "chart_type", "data_points"];

/// PDF metadata fields compared as scalars.
const PDF_SCALAR_FIELDS: &[&str] = &["pages", "embedded_artifacts", "section_count"];

/// Text metadata fields compared as scalars.
const TEXT_SCALAR_FIELDS: &[&str] = &["size_bytes", "line_count"];

#[derive(Debug, Error)]
pub enum DiffError {
    #[error("artifacts are not comparable: differing {field}")]
    NotComparable { field: &'static str },

    #[error("diffing {0} artifacts is not supported")]
    UnsupportedType(ArtifactType),
}

/// The body of a diff: any of the three sections may be absent.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DiffBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub added: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub removed: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changed: Option<Value>,
}

impl DiffBody {
    pub fn is_empty(&self) -> bool {
        self.added.is_none() && self.removed.is_none() && self.changed.is_none()
    }
}

/// A structured diff between two versions of the same artifact key.
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactDiff {
    pub artifact_type: ArtifactType,
    pub role: Option<String>,
    pub from_version: i32,
    pub to_version: i32,
    pub diff: DiffBody,
}

/// Diff two artifact rows with identical `(job_id, type, role)`.
pub fn diff(from: &Artifact, to: &Artifact) -> Result<ArtifactDiff, DiffError> {
    if from.job_id != to.job_id {
        return Err(DiffError::NotComparable { field: "job_id" });
    }
    if from.artifact_type != to.artifact_type {
        return Err(DiffError::NotComparable { field: "type" });
    }
    if from.role != to.role {
        return Err(DiffError::NotComparable { field: "role" });
    }

    let body = match from.artifact_type {
        ArtifactType::Chart => chart_diff(&from.metadata, &to.metadata),
        ArtifactType::Pdf => scalar_diff(&from.metadata, &to.metadata, PDF_SCALAR_FIELDS),
        ArtifactType::Text => scalar_diff(&from.metadata, &to.metadata, TEXT_SCALAR_FIELDS),
        other => return Err(DiffError::UnsupportedType(other)),
    };

    Ok(ArtifactDiff {
        artifact_type: from.artifact_type,
        role: from.role.clone(),
        from_version: from.version,
        to_version: to.version,
        diff: body,
    })
}

/// Scalar field comparison: `changed.{field} = {from, to}`.
fn scalar_diff(from: &Value, to: &Value, fields: &[&str]) -> DiffBody {
    let mut changed = Map::new();
    for field in fields {
        let a = from.get(field);
        let b = to.get(field);
        if a != b {
            changed.insert(
                (*field).to_owned(),
                json!({
                    "from": a.cloned().unwrap_or(Value::Null),
                    "to": b.cloned().unwrap_or(Value::Null),
                }),
            );
        }
    }

    DiffBody {
        added: None,
        removed: None,
        changed: (!changed.is_empty()).then_some(Value::Object(changed)),
    }
}

fn chart_diff(from: &Value, to: &Value) -> DiffBody {
    let mut body = scalar_diff(from, to, CHART_SCALAR_FIELDS);
    let mut added = Map::new();
    let mut removed = Map::new();

    // Top-level point set, keyed by "x:y".
    let (points_added, points_removed) =
        point_set_diff(from.get("points"), to.get("points"));
    if !points_added.is_empty() {
        added.insert("points".to_owned(), Value::Array(points_added));
    }
    if !points_removed.is_empty() {
        removed.insert("points".to_owned(), Value::Array(points_removed));
    }

    // Per-series data, keyed the same way, grouped under the series name.
    let mut series_added = Map::new();
    let mut series_removed = Map::new();
    for name in series_names(from).into_iter().chain(series_names(to)) {
        if series_added.contains_key(&name) || series_removed.contains_key(&name) {
            continue;
        }
        let (s_added, s_removed) = point_set_diff(
            series_data(from, &name),
            series_data(to, &name),
        );
        if !s_added.is_empty() {
            series_added.insert(name.clone(), Value::Array(s_added));
        }
        if !s_removed.is_empty() {
            series_removed.insert(name, Value::Array(s_removed));
        }
    }
    if !series_added.is_empty() {
        added.insert("series".to_owned(), Value::Object(series_added));
    }
    if !series_removed.is_empty() {
        removed.insert("series".to_owned(), Value::Object(series_removed));
    }

    // Labels and config are compared structurally.
    let mut changed = match body.changed.take() {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };
    for field in ["labels", "config"] {
        if let Some(obj_diff) = object_diff(
            from.get(field).unwrap_or(&Value::Null),
            to.get(field).unwrap_or(&Value::Null),
        ) {
            changed.insert(field.to_owned(), obj_diff);
        }
    }

    DiffBody {
        added: (!added.is_empty()).then_some(Value::Object(added)),
        removed: (!removed.is_empty()).then_some(Value::Object(removed)),
        changed: (!changed.is_empty()).then_some(Value::Object(changed)),
    }
}

/// Key a data point by its x and y coordinates.
fn point_key(point: &Value) -> String {
    let x = point.get("x").cloned().unwrap_or(Value::Null);
    let y = point.get("y").cloned().unwrap_or(Value::Null);
    format!("{x}:{y}")
}

/// Set difference over point arrays: `(in b not a, in a not b)`.
fn point_set_diff(a: Option<&Value>, b: Option<&Value>) -> (Vec<Value>, Vec<Value>) {
    let empty = vec![];
    let a_points = a.and_then(Value::as_array).unwrap_or(&empty);
    let b_points = b.and_then(Value::as_array).unwrap_or(&empty);

    let a_keys: std::collections::HashSet<String> = a_points.iter().map(point_key).collect();
    let b_keys: std::collections::HashSet<String> = b_points.iter().map(point_key).collect();

    let added = b_points
        .iter()
        .filter(|p| !a_keys.contains(&point_key(p)))
        .cloned()
        .collect();
    let removed = a_points
        .iter()
        .filter(|p| !b_keys.contains(&point_key(p)))
        .cloned()
        .collect();
    (added, removed)
}

fn series_names(metadata: &Value) -> Vec<String> {
    metadata
        .get("series")
        .and_then(Value::as_array)
        .map(|series| {
            series
                .iter()
                .filter_map(|s| s.get("name").and_then(Value::as_str))
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

fn series_data<'a>(metadata: &'a Value, name: &str) -> Option<&'a Value> {
    metadata
        .get("series")
        .and_then(Value::as_array)?
        .iter()
        .find(|s| s.get("name").and_then(Value::as_str) == Some(name))?
        .get("data")
}

/// Recursive object diff producing `{added, removed, changed}` maps.
///
/// Returns `None` when the values are equal.
fn object_diff(a: &Value, b: &Value) -> Option<Value> {
    if a == b {
        return None;
    }

    let (Some(a_map), Some(b_map)) = (a.as_object(), b.as_object()) else {
        // Not both objects: report as a plain change.
        return Some(json!({"from": a, "to": b}));
    };

    let mut added = Map::new();
    let mut removed = Map::new();
    let mut changed = Map::new();

    for (key, b_val) in b_map {
        match a_map.get(key) {
            None => {
                added.insert(key.clone(), b_val.clone());
            }
            Some(a_val) => {
                if let Some(nested) = object_diff(a_val, b_val) {
                    changed.insert(key.clone(), nested);
                }
            }
        }
    }
    for (key, a_val) in a_map {
        if !b_map.contains_key(key) {
            removed.insert(key.clone(), a_val.clone());
        }
    }

    let mut out = Map::new();
    if !added.is_empty() {
        out.insert("added".to_owned(), Value::Object(added));
    }
    if !removed.is_empty() {
        out.insert("removed".to_owned(), Value::Object(removed));
    }
    if !changed.is_empty() {
        out.insert("changed".to_owned(), Value::Object(changed));
    }
    (!out.is_empty()).then_some(Value::Object(out))
}
