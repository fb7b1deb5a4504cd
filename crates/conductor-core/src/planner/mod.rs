//! Planner: natural-language request -> validated workflow DAG.
//!
//! Builds a prompt embedding the agent registry and the hard authoring
//! rules, fans out over the configured providers in order, parses the
//! response, and runs the DAG validator over the result. The planner
//! never returns an error: every failure mode is folded into a
//! [`PlanOutcome`] with `can_execute = false`.

pub mod provider;

use serde::{Deserialize, Serialize};

use crate::config::CoreConfig;
use crate::dag::{self, WorkflowGraph};
use crate::registry;
use crate::retry::{with_retry, RetryPolicy};

use provider::{ChatProvider, GenerateText, ProviderError};

/// Planner verdict for one request.
#[derive(Debug, Clone, Serialize)]
pub struct PlanOutcome {
    pub can_execute: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow: Option<WorkflowGraph>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

impl PlanOutcome {
    fn rejected(reason: impl Into<String>) -> Self {
        Self {
            can_execute: false,
            reason: Some(reason.into()),
            workflow: None,
            explanation: None,
        }
    }
}

/// The response shape the prompt instructs the model to emit.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LlmPlan {
    can_execute: bool,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    workflow: Option<WorkflowGraph>,
    #[serde(default)]
    explanation: Option<String>,
}

/// The planner, holding the ordered provider chain.
pub struct Planner {
    providers: Vec<Box<dyn GenerateText>>,
}

impl Planner {
    /// Build the provider chain from configuration, in declared order.
    pub fn from_config(config: &CoreConfig) -> Self {
        let client = reqwest::Client::new();
        let providers = config
            .providers
            .iter()
            .cloned()
            .map(|p| Box::new(ChatProvider::new(p, client.clone())) as Box<dyn GenerateText>)
            .collect();
        Self { providers }
    }

    /// Build a planner over explicit providers (used by tests).
    pub fn new(providers: Vec<Box<dyn GenerateText>>) -> Self {
        Self { providers }
    }

    /// Translate a user prompt into a validated workflow.
    pub async fn plan(&self, user_prompt: &str) -> PlanOutcome {
        let prompt = build_prompt(user_prompt);

        let response = match self.generate_with_fanout(&prompt).await {
            Ok(text) => text,
            Err(reason) => return PlanOutcome::rejected(reason),
        };

        let stripped = strip_code_fences(&response);
        let parsed: LlmPlan = match serde_json::from_str(stripped) {
            Ok(plan) => plan,
            Err(err) => {
                tracing::warn!(error = %err, "planner response was not valid JSON");
                return PlanOutcome::rejected("internal error: planner response unparseable");
            }
        };

        if !parsed.can_execute {
            return PlanOutcome {
                can_execute: false,
                reason: parsed
                    .reason
                    .or_else(|| Some("request cannot be executed".to_owned())),
                workflow: None,
                explanation: parsed.explanation,
            };
        }

        let Some(workflow) = parsed.workflow else {
            return PlanOutcome::rejected("internal error: planner omitted the workflow");
        };

        match dag::validate(&workflow) {
            Ok(()) => PlanOutcome {
                can_execute: true,
                reason: None,
                workflow: Some(workflow),
                explanation: parsed.explanation,
            },
            Err(errors) => {
                let joined = errors
                    .iter()
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>()
                    .join("; ");
                tracing::warn!(errors = %joined, "planner emitted an invalid workflow");
                PlanOutcome::rejected(format!("generated workflow failed validation: {joined}"))
            }
        }
    }

    /// Try providers in order. Transient failures retry in place; quota
    /// failures skip to the next provider; providers without credentials
    /// are skipped outright.
    async fn generate_with_fanout(&self, prompt: &str) -> Result<String, String> {
        let mut attempted = 0usize;

        for provider in &self.providers {
            if !provider.available() {
                tracing::debug!(provider = provider.name(), "skipping provider: no credentials");
                continue;
            }
            attempted += 1;

            let result = with_retry(
                RetryPolicy::PROVIDER,
                ProviderError::class,
                || provider.generate(prompt),
            )
            .await;

            match result {
                Ok(text) => return Ok(text),
                Err(err) => {
                    // Quota and fatal both move on; transient errors only
                    // land here once their in-place retries are spent.
                    tracing::warn!(
                        provider = provider.name(),
                        error = %err,
                        class = ?err.class(),
                        "provider failed, moving to next"
                    );
                }
            }
        }

        if attempted == 0 {
            Err("no LLM provider is configured with credentials".to_owned())
        } else {
            Err("all LLM providers failed".to_owned())
        }
    }
}

/// Assemble the planning prompt: registry JSON plus the hard rules.
fn build_prompt(user_prompt: &str) -> String {
    let registry_json = serde_json::to_string_pretty(&registry::to_json())
        .unwrap_or_else(|_| "[]".to_owned());

    format!(
        r#"You translate a user's request into a workflow DAG of agent tasks.

Available agents (inputs and outputs are exhaustive):
{registry_json}

Rules:
1. Use only the agents listed above. If the request needs anything else, set canExecute to false and explain why in reason.
2. To pass an upstream output into an input string, use exactly this syntax: {{{{tasks.<node_id>.outputs.<field>}}}}. No other template syntax exists.
3. Any node whose inputs reference another node's outputs must list that node in its dependencies.
4. pdf_composer artifact references are structured objects of the form {{"type": "chart", "role": "..."}} -- never placeholder strings.
5. A reviewer node must depend on exactly one other node.
6. Node ids are short lowercase identifiers, unique within the workflow.

Respond with JSON only (no prose, no code fences):
{{"canExecute": true|false, "reason": "...", "explanation": "...",
 "workflow": {{"nodes": [{{"id": "...", "agent_type": "...", "inputs": {{...}}, "dependencies": [...]}}], "edges": []}}}}

User request:
{user_prompt}
"#
    )
}

/// Strip an optional Markdown code fence wrapper from a model response.
fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string ("json") on the opening fence line.
    let rest = match rest.find('\n') {
        Some(pos) => &rest[pos + 1..],
        None => rest,
    };
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeProvider {
        name: &'static str,
        available: bool,
        responses: Vec<Result<String, (u16, String)>>,
        calls: AtomicUsize,
    }

    impl FakeProvider {
        fn ok(name: &'static str, response: &str) -> Self {
            Self {
                name,
                available: true,
                responses: vec![Ok(response.to_owned())],
                calls: AtomicUsize::new(0),
            }
        }

        fn failing(name: &'static str, status: u16, body: &str) -> Self {
            Self {
                name,
                available: true,
                responses: vec![Err((status, body.to_owned()))],
                calls: AtomicUsize::new(0),
            }
        }

        fn unavailable(name: &'static str) -> Self {
            Self {
                name,
                available: false,
                responses: vec![],
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl GenerateText for FakeProvider {
        fn name(&self) -> &str {
            self.name
        }

        fn available(&self) -> bool {
            self.available
        }

        async fn generate(&self, _prompt: &str) -> Result<String, ProviderError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let idx = call.min(self.responses.len().saturating_sub(1));
            match &self.responses[idx] {
                Ok(text) => Ok(text.clone()),
                Err((status, body)) => Err(ProviderError::Http {
                    provider: self.name.to_owned(),
                    status: *status,
                    body: body.clone(),
                }),
            }
        }
    }

    const VALID_PLAN: &str = r#"{"canExecute": true, "explanation": "scrape then summarize",
        "workflow": {"nodes": [
            {"id": "s", "agent_type": "scraper", "inputs": {"url": "https://x"}, "dependencies": []},
            {"id": "sum", "agent_type": "summarizer",
             "inputs": {"text": "{{tasks.s.outputs.text}}"}, "dependencies": ["s"]}
        ], "edges": []}}"#;

    #[tokio::test]
    async fn valid_plan_passes_validation() {
        let planner = Planner::new(vec![Box::new(FakeProvider::ok("primary", VALID_PLAN))]);
        let outcome = planner.plan("scrape and summarize").await;
        assert!(outcome.can_execute, "reason: {:?}", outcome.reason);
        assert_eq!(outcome.workflow.unwrap().nodes.len(), 2);
    }

    #[tokio::test]
    async fn fenced_response_is_accepted() {
        let fenced = format!("```json\n{VALID_PLAN}\n```");
        let planner = Planner::new(vec![Box::new(FakeProvider::ok("primary", &fenced))]);
        let outcome = planner.plan("scrape and summarize").await;
        assert!(outcome.can_execute);
    }

    #[tokio::test]
    async fn invalid_workflow_is_rewritten_to_rejection() {
        let bad_plan = r#"{"canExecute": true, "workflow": {"nodes": [
            {"id": "sum", "agent_type": "summarizer",
             "inputs": {"text": "{{tasks.s.outputs.nonexistent}}"}, "dependencies": []}
        ], "edges": []}}"#;
        let planner = Planner::new(vec![Box::new(FakeProvider::ok("primary", bad_plan))]);
        let outcome = planner.plan("whatever").await;
        assert!(!outcome.can_execute);
        assert!(outcome.reason.unwrap().contains("validation"));
    }

    #[tokio::test]
    async fn unparseable_response_is_internal_error() {
        let planner = Planner::new(vec![Box::new(FakeProvider::ok("primary", "not json"))]);
        let outcome = planner.plan("whatever").await;
        assert!(!outcome.can_execute);
        assert!(outcome.reason.unwrap().contains("internal error"));
    }

    #[tokio::test]
    async fn quota_failure_falls_through_to_next_provider() {
        let primary = FakeProvider::failing("primary", 429, "quota exceeded");
        let fallback = FakeProvider::ok("fallback-1", VALID_PLAN);
        let planner = Planner::new(vec![Box::new(primary), Box::new(fallback)]);
        let outcome = planner.plan("scrape and summarize").await;
        assert!(outcome.can_execute);
    }

    #[tokio::test]
    async fn unavailable_providers_are_skipped() {
        let planner = Planner::new(vec![
            Box::new(FakeProvider::unavailable("primary")),
            Box::new(FakeProvider::ok("fallback-1", VALID_PLAN)),
        ]);
        let outcome = planner.plan("scrape and summarize").await;
        assert!(outcome.can_execute);
    }

    #[tokio::test]
    async fn all_providers_exhausted_reports_failure() {
        let planner = Planner::new(vec![
            Box::new(FakeProvider::failing("primary", 429, "quota")),
            Box::new(FakeProvider::failing("fallback-1", 401, "bad key")),
        ]);
        let outcome = planner.plan("whatever").await;
        assert!(!outcome.can_execute);
        assert!(outcome.reason.unwrap().contains("all LLM providers failed"));
    }

    #[tokio::test]
    async fn no_credentials_anywhere_reports_configuration() {
        let planner = Planner::new(vec![Box::new(FakeProvider::unavailable("primary"))]);
        let outcome = planner.plan("whatever").await;
        assert!(!outcome.can_execute);
        assert!(outcome.reason.unwrap().contains("no LLM provider"));
    }

    #[test]
    fn strip_fences_variants() {
        assert_eq!(strip_code_fences("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\n{\"a\":1}\n```"), "{\"a\":1}");
    }
}
