//! Static catalog of agent capabilities.
//!
//! The registry is the single source of truth for what inputs an agent
//! requires and what output field names it declares. Both the DAG
//! validator and the placeholder resolver consult it. Adding an agent is
//! a code change here, not configuration.

use std::sync::LazyLock;

use serde::{Deserialize, Serialize};

/// Broad category of an agent within a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentCategory {
    Input,
    Process,
    Output,
    Control,
}

/// Declared type of an input or output field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Json,
}

/// One declared input of an agent.
#[derive(Debug, Clone, Serialize)]
pub struct InputSpec {
    pub name: &'static str,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub required: bool,
}

/// One declared output of an agent.
#[derive(Debug, Clone, Serialize)]
pub struct OutputSpec {
    pub name: &'static str,
    #[serde(rename = "type")]
    pub field_type: FieldType,
}

/// The full capability declaration for one agent type.
#[derive(Debug, Clone, Serialize)]
pub struct AgentCapability {
    pub id: &'static str,
    pub category: AgentCategory,
    pub inputs: Vec<InputSpec>,
    pub outputs: Vec<OutputSpec>,
}

impl AgentCapability {
    /// Whether `field` is a declared output of this agent.
    pub fn declares_output(&self, field: &str) -> bool {
        self.outputs.iter().any(|o| o.name == field)
    }

    /// Iterator over the names of required inputs.
    pub fn required_inputs(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.inputs.iter().filter(|i| i.required).map(|i| i.name)
    }
}

const fn input(name: &'static str, field_type: FieldType, required: bool) -> InputSpec {
    InputSpec {
        name,
        field_type,
        required,
    }
}

const fn output(name: &'static str, field_type: FieldType) -> OutputSpec {
    OutputSpec { name, field_type }
}

/// Agent type id of the reviewer, which has dedicated lifecycle handling.
pub const REVIEWER_AGENT: &str = "reviewer";

/// Agent type id of the PDF composer, whose artifact references are
/// structured objects rather than placeholders.
pub const PDF_COMPOSER_AGENT: &str = "pdf_composer";

static CAPABILITIES: LazyLock<Vec<AgentCapability>> = LazyLock::new(|| {
    vec![
        AgentCapability {
            id: "scraper",
            category: AgentCategory::Input,
            inputs: vec![
                input("url", FieldType::String, true),
                input("selector", FieldType::String, false),
            ],
            outputs: vec![
                output("text", FieldType::String),
                output("title", FieldType::String),
            ],
        },
        AgentCapability {
            id: "summarizer",
            category: AgentCategory::Process,
            inputs: vec![
                input("text", FieldType::String, true),
                input("max_sentences", FieldType::Number, false),
            ],
            outputs: vec![output("summary", FieldType::String)],
        },
        AgentCapability {
            id: "chart_renderer",
            category: AgentCategory::Process,
            inputs: vec![
                input("data", FieldType::Json, true),
                input("chart_type", FieldType::String, false),
                input("title", FieldType::String, false),
                input("role", FieldType::String, false),
            ],
            outputs: vec![output("chart", FieldType::Json)],
        },
        AgentCapability {
            id: "table_builder",
            category: AgentCategory::Process,
            inputs: vec![
                input("rows", FieldType::Json, true),
                input("columns", FieldType::Json, false),
            ],
            outputs: vec![output("table", FieldType::Json)],
        },
        AgentCapability {
            id: PDF_COMPOSER_AGENT,
            category: AgentCategory::Output,
            inputs: vec![
                input("title", FieldType::String, true),
                input("artifacts", FieldType::Json, true),
                input("sections", FieldType::Json, false),
            ],
            outputs: vec![output("document", FieldType::Json)],
        },
        AgentCapability {
            id: "email_sender",
            category: AgentCategory::Output,
            inputs: vec![
                input("to", FieldType::String, true),
                input("subject", FieldType::String, true),
                input("body", FieldType::String, true),
            ],
            outputs: vec![output("message_id", FieldType::String)],
        },
        AgentCapability {
            id: REVIEWER_AGENT,
            category: AgentCategory::Control,
            inputs: vec![
                // Injected at enqueue from the reviewer's single dependency.
                input("target_task_id", FieldType::String, false),
                input("criteria", FieldType::String, false),
            ],
            outputs: vec![
                output("score", FieldType::Number),
                output("decision", FieldType::String),
                output("feedback", FieldType::String),
            ],
        },
    ]
});

/// Read-only lookup of an agent capability by id.
pub fn get(agent_type: &str) -> Option<&'static AgentCapability> {
    CAPABILITIES.iter().find(|c| c.id == agent_type)
}

/// All registered capabilities, in declaration order.
pub fn all() -> &'static [AgentCapability] {
    &CAPABILITIES
}

/// The registry serialized to JSON, embedded into the planner prompt.
pub fn to_json() -> serde_json::Value {
    serde_json::to_value(all()).unwrap_or_else(|_| serde_json::Value::Array(vec![]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_known_agent() {
        let cap = get("scraper").expect("scraper should be registered");
        assert_eq!(cap.category, AgentCategory::Input);
        assert!(cap.declares_output("text"));
        assert!(!cap.declares_output("summary"));
    }

    #[test]
    fn lookup_unknown_agent() {
        assert!(get("nonexistent").is_none());
    }

    #[test]
    fn required_inputs_of_summarizer() {
        let cap = get("summarizer").unwrap();
        let required: Vec<_> = cap.required_inputs().collect();
        assert_eq!(required, vec!["text"]);
    }

    #[test]
    fn registry_serializes_for_prompt() {
        let json = to_json();
        let agents = json.as_array().expect("registry JSON is an array");
        assert_eq!(agents.len(), all().len());
        assert!(agents.iter().any(|a| a["id"] == "reviewer"));
    }
}
