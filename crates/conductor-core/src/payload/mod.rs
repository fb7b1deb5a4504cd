//! Typed per-agent payloads.
//!
//! Task inputs travel as open JSON while they may still contain
//! placeholders; once the resolver has produced concrete values, the
//! payload is narrowed into the agent's variant before enqueue. Workers
//! therefore never see a placeholder, and a payload that does not fit its
//! agent's declared shape is caught before it reaches the broker.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use conductor_db::models::ArtifactType;

/// A structured artifact reference, used by the PDF composer instead of
/// placeholder strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRef {
    #[serde(rename = "type")]
    pub artifact_type: ArtifactType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScraperInputs {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummarizerInputs {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_sentences: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartRendererInputs {
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableBuilderInputs {
    pub rows: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub columns: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PdfComposerInputs {
    pub title: String,
    pub artifacts: Vec<ArtifactRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sections: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailSenderInputs {
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewerInputs {
    /// Injected from the reviewer's single dependency at enqueue time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub criteria: Option<String>,
}

/// The tagged union of every agent's resolved inputs.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentPayload {
    Scraper(ScraperInputs),
    Summarizer(SummarizerInputs),
    ChartRenderer(ChartRendererInputs),
    TableBuilder(TableBuilderInputs),
    PdfComposer(PdfComposerInputs),
    EmailSender(EmailSenderInputs),
    Reviewer(ReviewerInputs),
}

/// Error narrowing a resolved payload into an agent variant.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("unknown agent type {0:?}")]
    UnknownAgent(String),

    #[error("payload does not match the {agent_type} input shape: {source}")]
    Shape {
        agent_type: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize {agent_type} payload: {source}")]
    Serialize {
        agent_type: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl AgentPayload {
    /// Narrow a fully-resolved JSON payload into the agent's variant.
    pub fn from_resolved(agent_type: &str, resolved: Value) -> Result<Self, PayloadError> {
        fn narrow<T: serde::de::DeserializeOwned>(
            agent_type: &'static str,
            value: Value,
        ) -> Result<T, PayloadError> {
            serde_json::from_value(value).map_err(|source| PayloadError::Shape {
                agent_type,
                source,
            })
        }

        match agent_type {
            "scraper" => Ok(Self::Scraper(narrow("scraper", resolved)?)),
            "summarizer" => Ok(Self::Summarizer(narrow("summarizer", resolved)?)),
            "chart_renderer" => Ok(Self::ChartRenderer(narrow("chart_renderer", resolved)?)),
            "table_builder" => Ok(Self::TableBuilder(narrow("table_builder", resolved)?)),
            "pdf_composer" => Ok(Self::PdfComposer(narrow("pdf_composer", resolved)?)),
            "email_sender" => Ok(Self::EmailSender(narrow("email_sender", resolved)?)),
            "reviewer" => Ok(Self::Reviewer(narrow("reviewer", resolved)?)),
            other => Err(PayloadError::UnknownAgent(other.to_owned())),
        }
    }

    /// The agent type id this payload belongs to.
    pub fn agent_type(&self) -> &'static str {
        match self {
            Self::Scraper(_) => "scraper",
            Self::Summarizer(_) => "summarizer",
            Self::ChartRenderer(_) => "chart_renderer",
            Self::TableBuilder(_) => "table_builder",
            Self::PdfComposer(_) => "pdf_composer",
            Self::EmailSender(_) => "email_sender",
            Self::Reviewer(_) => "reviewer",
        }
    }

    /// Serialize back to the wire shape carried in the broker message.
    pub fn to_value(&self) -> Result<Value, PayloadError> {
        let (agent_type, result) = match self {
            Self::Scraper(v) => ("scraper", serde_json::to_value(v)),
            Self::Summarizer(v) => ("summarizer", serde_json::to_value(v)),
            Self::ChartRenderer(v) => ("chart_renderer", serde_json::to_value(v)),
            Self::TableBuilder(v) => ("table_builder", serde_json::to_value(v)),
            Self::PdfComposer(v) => ("pdf_composer", serde_json::to_value(v)),
            Self::EmailSender(v) => ("email_sender", serde_json::to_value(v)),
            Self::Reviewer(v) => ("reviewer", serde_json::to_value(v)),
        };
        result.map_err(|source| PayloadError::Serialize { agent_type, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scraper_payload_narrows() {
        let payload =
            AgentPayload::from_resolved("scraper", json!({"url": "https://x"})).unwrap();
        match payload {
            AgentPayload::Scraper(inputs) => {
                assert_eq!(inputs.url, "https://x");
                assert!(inputs.selector.is_none());
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn summarizer_rejects_missing_text() {
        let err = AgentPayload::from_resolved("summarizer", json!({"max_sentences": 3}))
            .unwrap_err();
        assert!(matches!(err, PayloadError::Shape { .. }));
    }

    #[test]
    fn unknown_agent_rejected() {
        let err = AgentPayload::from_resolved("mystery", json!({})).unwrap_err();
        assert!(matches!(err, PayloadError::UnknownAgent(_)));
    }

    #[test]
    fn pdf_composer_parses_structured_refs() {
        let payload = AgentPayload::from_resolved(
            "pdf_composer",
            json!({
                "title": "Weekly report",
                "artifacts": [
                    {"type": "chart", "role": "latency_p95"},
                    {"type": "table"}
                ]
            }),
        )
        .unwrap();
        match payload {
            AgentPayload::PdfComposer(inputs) => {
                assert_eq!(inputs.artifacts.len(), 2);
                assert_eq!(inputs.artifacts[0].artifact_type, ArtifactType::Chart);
                assert_eq!(inputs.artifacts[0].role.as_deref(), Some("latency_p95"));
                assert!(inputs.artifacts[1].role.is_none());
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn wire_roundtrip() {
        let payload = AgentPayload::from_resolved(
            "summarizer",
            json!({"text": "hello world", "max_sentences": 2}),
        )
        .unwrap();
        let wire = payload.to_value().unwrap();
        assert_eq!(wire, json!({"text": "hello world", "max_sentences": 2}));
    }
}
