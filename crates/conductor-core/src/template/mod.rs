//! The placeholder algebra.
//!
//! Task inputs arrive as JSON whose strings may embed
//! `{{tasks.<id>.outputs.<field>}}` references. Rather than re-scanning
//! strings at enqueue time, the graph is compiled once (at validation)
//! into a [`TemplateValue`] tree: literals, whole-value references, and
//! mixed text with embedded references. The resolver walks this tree
//! against the completed upstream outputs.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

/// The only template syntax supported on the wire.
static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{tasks\.([A-Za-z0-9_-]+)\.outputs\.([A-Za-z0-9_]+)\}\}")
        .expect("placeholder regex is valid")
});

/// A reference to an upstream task's output field.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OutputRef {
    pub node: String,
    pub field: String,
}

/// One segment of a string with embedded placeholders.
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Lit(String),
    Ref(OutputRef),
}

/// A compiled task input tree.
#[derive(Debug, Clone, PartialEq)]
pub enum TemplateValue {
    /// A JSON value with no placeholders anywhere inside it.
    Literal(Value),
    /// A string that is exactly one placeholder; resolves to the raw
    /// upstream value, which may be non-string.
    Ref(OutputRef),
    /// A string mixing literal text and placeholders; every referenced
    /// output must itself be a string.
    Text(Vec<Segment>),
    Object(BTreeMap<String, TemplateValue>),
    Array(Vec<TemplateValue>),
}

/// Errors raised while resolving a compiled template.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The referenced output does not exist. Dependency invariants make
    /// this unreachable for a validated DAG; it is reported loudly.
    #[error("missing output {field:?} of task {node:?} at resolution time")]
    MissingOutput { node: String, field: String },

    /// A placeholder embedded in surrounding text resolved to a
    /// non-string value. Interpolating non-strings is not permitted.
    #[error(
        "output {field:?} of task {node:?} is not a string and cannot be interpolated into text"
    )]
    NonStringInterpolation { node: String, field: String },
}

/// Upstream outputs visible to a task: node name -> field -> value.
pub type OutputMap = BTreeMap<String, BTreeMap<String, Value>>;

/// Scan a raw string for placeholder references, in order of appearance.
pub fn scan_refs(s: &str) -> Vec<OutputRef> {
    PLACEHOLDER_RE
        .captures_iter(s)
        .map(|c| OutputRef {
            node: c[1].to_owned(),
            field: c[2].to_owned(),
        })
        .collect()
}

/// Compile a raw JSON input value into a [`TemplateValue`].
pub fn compile(value: &Value) -> TemplateValue {
    match value {
        Value::String(s) => compile_string(s),
        Value::Object(map) => {
            let fields = map
                .iter()
                .map(|(k, v)| (k.clone(), compile(v)))
                .collect::<BTreeMap<_, _>>();
            TemplateValue::Object(fields)
        }
        Value::Array(items) => TemplateValue::Array(items.iter().map(compile).collect()),
        other => TemplateValue::Literal(other.clone()),
    }
}

fn compile_string(s: &str) -> TemplateValue {
    let mut segments = Vec::new();
    let mut last_end = 0;
    for caps in PLACEHOLDER_RE.captures_iter(s) {
        let m = caps.get(0).expect("capture group 0 always present");
        if m.start() > last_end {
            segments.push(Segment::Lit(s[last_end..m.start()].to_owned()));
        }
        segments.push(Segment::Ref(OutputRef {
            node: caps[1].to_owned(),
            field: caps[2].to_owned(),
        }));
        last_end = m.end();
    }

    if segments.is_empty() {
        return TemplateValue::Literal(Value::String(s.to_owned()));
    }
    if last_end < s.len() {
        segments.push(Segment::Lit(s[last_end..].to_owned()));
    }

    // A string that is exactly one placeholder resolves to the raw value.
    if let [Segment::Ref(r)] = segments.as_slice() {
        return TemplateValue::Ref(r.clone());
    }
    TemplateValue::Text(segments)
}

impl TemplateValue {
    /// All output references anywhere in the tree.
    pub fn refs(&self) -> Vec<&OutputRef> {
        let mut out = Vec::new();
        self.collect_refs(&mut out);
        out
    }

    fn collect_refs<'a>(&'a self, out: &mut Vec<&'a OutputRef>) {
        match self {
            Self::Literal(_) => {}
            Self::Ref(r) => out.push(r),
            Self::Text(segments) => {
                for seg in segments {
                    if let Segment::Ref(r) = seg {
                        out.push(r);
                    }
                }
            }
            Self::Object(fields) => {
                for v in fields.values() {
                    v.collect_refs(out);
                }
            }
            Self::Array(items) => {
                for v in items {
                    v.collect_refs(out);
                }
            }
        }
    }

    /// Whether the tree references any output of `node`.
    pub fn references_node(&self, node: &str) -> bool {
        self.refs().iter().any(|r| r.node == node)
    }

    /// Resolve the tree against completed upstream outputs.
    pub fn resolve(&self, outputs: &OutputMap) -> Result<Value, ResolveError> {
        match self {
            Self::Literal(v) => Ok(v.clone()),
            Self::Ref(r) => lookup(outputs, r).cloned(),
            Self::Text(segments) => {
                let mut s = String::new();
                for seg in segments {
                    match seg {
                        Segment::Lit(lit) => s.push_str(lit),
                        Segment::Ref(r) => match lookup(outputs, r)? {
                            Value::String(v) => s.push_str(v),
                            _ => {
                                return Err(ResolveError::NonStringInterpolation {
                                    node: r.node.clone(),
                                    field: r.field.clone(),
                                });
                            }
                        },
                    }
                }
                Ok(Value::String(s))
            }
            Self::Object(fields) => {
                let mut map = serde_json::Map::with_capacity(fields.len());
                for (k, v) in fields {
                    map.insert(k.clone(), v.resolve(outputs)?);
                }
                Ok(Value::Object(map))
            }
            Self::Array(items) => {
                let resolved = items
                    .iter()
                    .map(|v| v.resolve(outputs))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Value::Array(resolved))
            }
        }
    }
}

fn lookup<'a>(outputs: &'a OutputMap, r: &OutputRef) -> Result<&'a Value, ResolveError> {
    outputs
        .get(&r.node)
        .and_then(|fields| fields.get(&r.field))
        .ok_or_else(|| ResolveError::MissingOutput {
            node: r.node.clone(),
            field: r.field.clone(),
        })
}

/// Compile and resolve a raw payload in one step.
pub fn resolve_payload(payload: &Value, outputs: &OutputMap) -> Result<Value, ResolveError> {
    compile(payload).resolve(outputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outputs(node: &str, field: &str, value: Value) -> OutputMap {
        let mut fields = BTreeMap::new();
        fields.insert(field.to_owned(), value);
        let mut map = BTreeMap::new();
        map.insert(node.to_owned(), fields);
        map
    }

    #[test]
    fn scan_finds_references_in_order() {
        let refs = scan_refs("{{tasks.a.outputs.x}} and {{tasks.b.outputs.y}}");
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].node, "a");
        assert_eq!(refs[1].field, "y");
    }

    #[test]
    fn plain_string_compiles_to_literal() {
        let tv = compile(&json!("no placeholders here"));
        assert!(matches!(tv, TemplateValue::Literal(_)));
        assert!(tv.refs().is_empty());
    }

    #[test]
    fn whole_placeholder_compiles_to_ref() {
        let tv = compile(&json!("{{tasks.s.outputs.text}}"));
        assert!(matches!(tv, TemplateValue::Ref(_)));
    }

    #[test]
    fn whole_placeholder_resolves_to_raw_value() {
        let tv = compile(&json!("{{tasks.s.outputs.data}}"));
        let out = outputs("s", "data", json!({"points": [1, 2, 3]}));
        let resolved = tv.resolve(&out).expect("should resolve");
        assert_eq!(resolved, json!({"points": [1, 2, 3]}));
    }

    #[test]
    fn mixed_text_interpolates_strings() {
        let tv = compile(&json!("Summary: {{tasks.s.outputs.text}}!"));
        let out = outputs("s", "text", json!("hello"));
        assert_eq!(tv.resolve(&out).unwrap(), json!("Summary: hello!"));
    }

    #[test]
    fn mixed_text_rejects_non_string() {
        let tv = compile(&json!("data: {{tasks.s.outputs.data}}"));
        let out = outputs("s", "data", json!([1, 2]));
        let err = tv.resolve(&out).unwrap_err();
        assert!(matches!(err, ResolveError::NonStringInterpolation { .. }));
    }

    #[test]
    fn missing_output_is_fatal() {
        let tv = compile(&json!("{{tasks.s.outputs.text}}"));
        let err = tv.resolve(&OutputMap::new()).unwrap_err();
        assert!(matches!(err, ResolveError::MissingOutput { .. }));
    }

    #[test]
    fn nested_payload_resolves() {
        let payload = json!({
            "text": "{{tasks.s.outputs.text}}",
            "options": {"max_sentences": 3},
            "tags": ["fixed", "{{tasks.s.outputs.title}}"]
        });
        let mut out = outputs("s", "text", json!("body"));
        out.get_mut("s")
            .unwrap()
            .insert("title".to_owned(), json!("headline"));
        let resolved = resolve_payload(&payload, &out).expect("should resolve");
        assert_eq!(
            resolved,
            json!({
                "text": "body",
                "options": {"max_sentences": 3},
                "tags": ["fixed", "headline"]
            })
        );
    }

    #[test]
    fn references_node_sees_nested_refs() {
        let tv = compile(&json!({"a": {"b": "{{tasks.dep.outputs.text}}"}}));
        assert!(tv.references_node("dep"));
        assert!(!tv.references_node("other"));
    }
}
