//! Candidate workflow types and the DAG validator.
//!
//! A candidate workflow is `{nodes[], edges[]}` as produced by the planner
//! or submitted directly through the API. Validation is a pure function:
//! it accumulates every error it finds, short-circuiting only on
//! catastrophic structural faults (edges naming unknown endpoints).

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::registry;
use crate::template::{self, TemplateValue};

/// One DAG node as submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub id: String,
    pub agent_type: String,
    #[serde(default)]
    pub inputs: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// A dependency edge `from -> to` (`from` completes before `to` starts).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowEdge {
    pub from: String,
    pub to: String,
}

/// A candidate workflow DAG.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowGraph {
    pub nodes: Vec<WorkflowNode>,
    #[serde(default)]
    pub edges: Vec<WorkflowEdge>,
}

impl WorkflowGraph {
    /// The effective dependency set of a node: declared `dependencies`
    /// plus incoming edges, deduplicated, in first-seen order.
    pub fn dependencies_of(&self, node_id: &str) -> Vec<&str> {
        let node_deps = self
            .nodes
            .iter()
            .find(|n| n.id == node_id)
            .map(|n| n.dependencies.as_slice())
            .unwrap_or_default();

        let mut seen = HashSet::new();
        let mut deps = Vec::new();
        for dep in node_deps {
            if seen.insert(dep.as_str()) {
                deps.push(dep.as_str());
            }
        }
        for edge in self.edges.iter().filter(|e| e.to == node_id) {
            if seen.insert(edge.from.as_str()) {
                deps.push(edge.from.as_str());
            }
        }
        deps
    }
}

/// Errors accumulated by the validator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("edge references unknown node {node:?}")]
    UnknownEdgeEndpoint { node: String },

    #[error("node {node:?} depends on unknown node {dependency:?}")]
    UnknownDependency { node: String, dependency: String },

    #[error("dependency cycle detected: {path}")]
    Cycle { path: String },

    #[error("node {node:?} uses unknown agent type {agent_type:?}")]
    UnknownAgent { node: String, agent_type: String },

    #[error("node {node:?} is missing required input {input:?} for agent {agent_type:?}")]
    MissingRequiredInput {
        node: String,
        agent_type: String,
        input: String,
    },

    #[error("node {node:?} references unknown node {referenced:?} in a placeholder")]
    PlaceholderUnknownNode { node: String, referenced: String },

    #[error(
        "node {node:?} references outputs of {referenced:?} without depending on it \
         (references imply dependencies)"
    )]
    PlaceholderMissingEdge { node: String, referenced: String },

    #[error(
        "node {node:?} references output {field:?} which agent {agent_type:?} \
         of node {referenced:?} does not declare"
    )]
    PlaceholderUnknownOutput {
        node: String,
        referenced: String,
        agent_type: String,
        field: String,
    },

    #[error("reviewer node {node:?} must have exactly one dependency, found {count}")]
    ReviewerDependencyCount { node: String, count: usize },

    #[error(
        "node {node:?}: pdf_composer artifact references must be structured \
         {{type, role}} objects, not placeholder strings"
    )]
    PdfArtifactRefNotStructured { node: String },

    #[error("duplicate node id {node:?}")]
    DuplicateNodeId { node: String },

    #[error("workflow must contain at least one node")]
    Empty,
}

/// Result of validating a candidate workflow.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub errors: Vec<String>,
}

/// Validate a candidate workflow against the agent registry.
///
/// Checks, in order: edge endpoints, acyclicity, known agents, required
/// inputs, placeholder references. Only unknown edge endpoints
/// short-circuit; everything else accumulates.
pub fn validate(graph: &WorkflowGraph) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if graph.nodes.is_empty() {
        return Err(vec![ValidationError::Empty]);
    }

    let mut ids = HashSet::new();
    for node in &graph.nodes {
        if !ids.insert(node.id.as_str()) {
            errors.push(ValidationError::DuplicateNodeId {
                node: node.id.clone(),
            });
        }
    }

    // 1. Edge endpoints and declared dependencies must name known nodes.
    // Broken structure makes the graph walk meaningless, so this check
    // is catastrophic.
    let mut structural = Vec::new();
    for edge in &graph.edges {
        for endpoint in [&edge.from, &edge.to] {
            if !ids.contains(endpoint.as_str()) {
                structural.push(ValidationError::UnknownEdgeEndpoint {
                    node: endpoint.clone(),
                });
            }
        }
    }
    for node in &graph.nodes {
        for dep in &node.dependencies {
            if !ids.contains(dep.as_str()) {
                structural.push(ValidationError::UnknownDependency {
                    node: node.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }
    if !structural.is_empty() {
        errors.extend(structural);
        return Err(errors);
    }

    // 2. Acyclicity: DFS with a recursion stack, reporting the first cycle.
    if let Some(path) = find_cycle(graph) {
        errors.push(ValidationError::Cycle {
            path: path.join(" -> "),
        });
    }

    // 3 + 4. Agent lookups, required inputs, placeholder references.
    for node in &graph.nodes {
        let Some(capability) = registry::get(&node.agent_type) else {
            errors.push(ValidationError::UnknownAgent {
                node: node.id.clone(),
                agent_type: node.agent_type.clone(),
            });
            continue;
        };

        for required in capability.required_inputs() {
            if !node.inputs.contains_key(required) {
                errors.push(ValidationError::MissingRequiredInput {
                    node: node.id.clone(),
                    agent_type: node.agent_type.clone(),
                    input: required.to_owned(),
                });
            }
        }

        let deps: HashSet<&str> = graph.dependencies_of(&node.id).into_iter().collect();

        if node.agent_type == registry::REVIEWER_AGENT && deps.len() != 1 {
            errors.push(ValidationError::ReviewerDependencyCount {
                node: node.id.clone(),
                count: deps.len(),
            });
        }

        let compiled = template::compile(&serde_json::Value::Object(node.inputs.clone()));
        check_placeholders(graph, node, &compiled, &deps, &mut errors);

        if node.agent_type == registry::PDF_COMPOSER_AGENT {
            check_pdf_artifact_refs(node, &mut errors);
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Validate and flatten into the API-facing outcome shape.
pub fn validate_outcome(graph: &WorkflowGraph) -> ValidationOutcome {
    match validate(graph) {
        Ok(()) => ValidationOutcome {
            valid: true,
            errors: vec![],
        },
        Err(errors) => ValidationOutcome {
            valid: false,
            errors: errors.iter().map(|e| e.to_string()).collect(),
        },
    }
}

fn check_placeholders(
    graph: &WorkflowGraph,
    node: &WorkflowNode,
    compiled: &TemplateValue,
    deps: &HashSet<&str>,
    errors: &mut Vec<ValidationError>,
) {
    let mut reported = HashSet::new();
    for r in compiled.refs() {
        if !reported.insert((r.node.clone(), r.field.clone())) {
            continue;
        }

        let Some(referenced) = graph.nodes.iter().find(|n| n.id == r.node) else {
            errors.push(ValidationError::PlaceholderUnknownNode {
                node: node.id.clone(),
                referenced: r.node.clone(),
            });
            continue;
        };

        if !deps.contains(r.node.as_str()) {
            errors.push(ValidationError::PlaceholderMissingEdge {
                node: node.id.clone(),
                referenced: r.node.clone(),
            });
        }

        match registry::get(&referenced.agent_type) {
            Some(cap) if !cap.declares_output(&r.field) => {
                errors.push(ValidationError::PlaceholderUnknownOutput {
                    node: node.id.clone(),
                    referenced: r.node.clone(),
                    agent_type: referenced.agent_type.clone(),
                    field: r.field.clone(),
                });
            }
            // Unknown agent on the referenced node is reported when that
            // node itself is checked.
            _ => {}
        }
    }
}

/// The pdf_composer `artifacts` input must be an array of structured
/// `{type, role}` objects; placeholder strings are rejected.
fn check_pdf_artifact_refs(node: &WorkflowNode, errors: &mut Vec<ValidationError>) {
    let Some(artifacts) = node.inputs.get("artifacts") else {
        return;
    };
    let ok = match artifacts {
        serde_json::Value::Array(items) => items.iter().all(|item| {
            item.as_object()
                .is_some_and(|o| o.contains_key("type") && !template_string(item))
        }),
        _ => false,
    };
    if !ok {
        errors.push(ValidationError::PdfArtifactRefNotStructured {
            node: node.id.clone(),
        });
    }
}

fn template_string(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::String(s) => !template::scan_refs(s).is_empty(),
        serde_json::Value::Object(map) => map.values().any(template_string),
        serde_json::Value::Array(items) => items.iter().any(template_string),
        _ => false,
    }
}

/// DFS cycle detection with an explicit recursion stack.
///
/// Returns the first cycle found as a node-id path (closing node
/// repeated), or `None` when the graph is acyclic.
fn find_cycle(graph: &WorkflowGraph) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InStack,
        Done,
    }

    let ids: Vec<&str> = graph.nodes.iter().map(|n| n.id.as_str()).collect();
    let index: HashMap<&str, usize> = ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();

    // Edges point dependency -> dependent for the walk.
    let mut adj: Vec<Vec<usize>> = vec![vec![]; ids.len()];
    for node in &graph.nodes {
        let to = index[node.id.as_str()];
        for dep in graph.dependencies_of(&node.id) {
            adj[index[dep]].push(to);
        }
    }

    let mut marks = vec![Mark::Unvisited; ids.len()];
    let mut stack = Vec::new();

    fn dfs(
        v: usize,
        adj: &[Vec<usize>],
        marks: &mut [Mark],
        stack: &mut Vec<usize>,
        ids: &[&str],
    ) -> Option<Vec<String>> {
        marks[v] = Mark::InStack;
        stack.push(v);
        for &next in &adj[v] {
            match marks[next] {
                Mark::InStack => {
                    let start = stack.iter().position(|&s| s == next).unwrap_or(0);
                    let mut path: Vec<String> =
                        stack[start..].iter().map(|&i| ids[i].to_owned()).collect();
                    path.push(ids[next].to_owned());
                    return Some(path);
                }
                Mark::Unvisited => {
                    if let Some(path) = dfs(next, adj, marks, stack, ids) {
                        return Some(path);
                    }
                }
                Mark::Done => {}
            }
        }
        stack.pop();
        marks[v] = Mark::Done;
        None
    }

    for v in 0..ids.len() {
        if marks[v] == Mark::Unvisited {
            if let Some(path) = dfs(v, &adj, &mut marks, &mut stack, &ids) {
                return Some(path);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(id: &str, agent: &str, inputs: serde_json::Value, deps: &[&str]) -> WorkflowNode {
        WorkflowNode {
            id: id.to_owned(),
            agent_type: agent.to_owned(),
            inputs: inputs.as_object().cloned().unwrap_or_default(),
            dependencies: deps.iter().map(|d| (*d).to_owned()).collect(),
        }
    }

    fn linear_pipeline() -> WorkflowGraph {
        WorkflowGraph {
            nodes: vec![
                node("s", "scraper", json!({"url": "https://x"}), &[]),
                node(
                    "sum",
                    "summarizer",
                    json!({"text": "{{tasks.s.outputs.text}}"}),
                    &["s"],
                ),
            ],
            edges: vec![],
        }
    }

    #[test]
    fn valid_linear_pipeline() {
        assert!(validate(&linear_pipeline()).is_ok());
    }

    #[test]
    fn empty_workflow_rejected() {
        let errors = validate(&WorkflowGraph::default()).unwrap_err();
        assert_eq!(errors, vec![ValidationError::Empty]);
    }

    #[test]
    fn unknown_edge_endpoint_short_circuits() {
        let mut graph = linear_pipeline();
        graph.edges.push(WorkflowEdge {
            from: "ghost".to_owned(),
            to: "sum".to_owned(),
        });
        let errors = validate(&graph).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::UnknownEdgeEndpoint { node } if node == "ghost")));
    }

    #[test]
    fn cycle_rejected_with_path() {
        let graph = WorkflowGraph {
            nodes: vec![
                node("a", "scraper", json!({"url": "https://x"}), &["b"]),
                node(
                    "b",
                    "summarizer",
                    json!({"text": "{{tasks.a.outputs.text}}"}),
                    &["a"],
                ),
            ],
            edges: vec![],
        };
        let errors = validate(&graph).unwrap_err();
        let cycle = errors
            .iter()
            .find(|e| matches!(e, ValidationError::Cycle { .. }))
            .expect("cycle should be reported");
        let msg = cycle.to_string();
        assert!(msg.contains("a") && msg.contains("b"), "got: {msg}");
    }

    #[test]
    fn unknown_agent_rejected() {
        let graph = WorkflowGraph {
            nodes: vec![node("x", "mystery", json!({}), &[])],
            edges: vec![],
        };
        let errors = validate(&graph).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::UnknownAgent { agent_type, .. } if agent_type == "mystery")));
    }

    #[test]
    fn missing_required_input_rejected() {
        let graph = WorkflowGraph {
            nodes: vec![node("s", "scraper", json!({}), &[])],
            edges: vec![],
        };
        let errors = validate(&graph).unwrap_err();
        assert!(errors.iter().any(
            |e| matches!(e, ValidationError::MissingRequiredInput { input, .. } if input == "url")
        ));
    }

    #[test]
    fn placeholder_naming_unknown_output_rejected() {
        let graph = WorkflowGraph {
            nodes: vec![
                node("s", "scraper", json!({"url": "https://x"}), &[]),
                node(
                    "sum",
                    "summarizer",
                    json!({"text": "{{tasks.s.outputs.nonexistent}}"}),
                    &["s"],
                ),
            ],
            edges: vec![],
        };
        let errors = validate(&graph).unwrap_err();
        let err = errors
            .iter()
            .find(|e| matches!(e, ValidationError::PlaceholderUnknownOutput { .. }))
            .expect("unknown output should be reported");
        assert!(err.to_string().contains("nonexistent"));
    }

    #[test]
    fn placeholder_without_edge_rejected() {
        let graph = WorkflowGraph {
            nodes: vec![
                node("s", "scraper", json!({"url": "https://x"}), &[]),
                node(
                    "sum",
                    "summarizer",
                    json!({"text": "{{tasks.s.outputs.text}}"}),
                    &[],
                ),
            ],
            edges: vec![],
        };
        let errors = validate(&graph).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::PlaceholderMissingEdge { .. })));
    }

    #[test]
    fn edge_satisfies_placeholder_dependency() {
        let graph = WorkflowGraph {
            nodes: vec![
                node("s", "scraper", json!({"url": "https://x"}), &[]),
                node(
                    "sum",
                    "summarizer",
                    json!({"text": "{{tasks.s.outputs.text}}"}),
                    &[],
                ),
            ],
            edges: vec![WorkflowEdge {
                from: "s".to_owned(),
                to: "sum".to_owned(),
            }],
        };
        assert!(validate(&graph).is_ok());
    }

    #[test]
    fn reviewer_needs_exactly_one_dependency() {
        let graph = WorkflowGraph {
            nodes: vec![
                node("a", "scraper", json!({"url": "https://x"}), &[]),
                node("b", "scraper", json!({"url": "https://y"}), &[]),
                node("rev", "reviewer", json!({}), &["a", "b"]),
            ],
            edges: vec![],
        };
        let errors = validate(&graph).unwrap_err();
        assert!(errors.iter().any(
            |e| matches!(e, ValidationError::ReviewerDependencyCount { count, .. } if *count == 2)
        ));
    }

    #[test]
    fn pdf_composer_rejects_placeholder_artifact_refs() {
        let graph = WorkflowGraph {
            nodes: vec![
                node("c", "chart_renderer", json!({"data": []}), &[]),
                node(
                    "pdf",
                    "pdf_composer",
                    json!({
                        "title": "Report",
                        "artifacts": ["{{tasks.c.outputs.chart}}"]
                    }),
                    &["c"],
                ),
            ],
            edges: vec![],
        };
        let errors = validate(&graph).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::PdfArtifactRefNotStructured { .. })));
    }

    #[test]
    fn pdf_composer_accepts_structured_refs() {
        let graph = WorkflowGraph {
            nodes: vec![
                node("c", "chart_renderer", json!({"data": []}), &[]),
                node(
                    "pdf",
                    "pdf_composer",
                    json!({
                        "title": "Report",
                        "artifacts": [{"type": "chart", "role": "latency_p95"}]
                    }),
                    &["c"],
                ),
            ],
            edges: vec![],
        };
        assert!(validate(&graph).is_ok());
    }

    #[test]
    fn errors_accumulate() {
        let graph = WorkflowGraph {
            nodes: vec![
                node("s", "scraper", json!({}), &[]),
                node("m", "mystery", json!({}), &[]),
            ],
            edges: vec![],
        };
        let errors = validate(&graph).unwrap_err();
        assert!(errors.len() >= 2, "expected multiple errors: {errors:?}");
    }
}
