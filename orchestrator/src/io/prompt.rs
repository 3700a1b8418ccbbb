//! Task prompts for the analysis agent, rendered with minijinja.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde_json::Value;

use crate::core::validator::ValidationPolicy;

const INSIGHTS_TEMPLATE: &str = include_str!("prompts/insights.md");
const PROPOSAL_TEMPLATE: &str = include_str!("prompts/proposal.md");

/// Insight JSON embedded in a proposal prompt is cut at this many characters.
pub const INSIGHT_JSON_MAX_CHARS: usize = 50_000;

pub struct InsightsPrompt<'a> {
    pub prompt: &'a str,
    /// Rendered transcript (fork mode only).
    pub transcript: Option<&'a str>,
}

pub struct ProposalPrompt<'a> {
    pub prompt: Option<&'a str>,
    pub insight: &'a Value,
    pub transcript: Option<&'a str>,
    pub policy: &'a ValidationPolicy,
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("insights", INSIGHTS_TEMPLATE)
            .context("compile insights template")?;
        env.add_template("proposal", PROPOSAL_TEMPLATE)
            .context("compile proposal template")?;
        Ok(Self { env })
    }

    pub fn render_insights(&self, input: &InsightsPrompt<'_>, root_instructions: &str) -> Result<String> {
        let template = self.env.get_template("insights")?;
        let rendered = template.render(context! {
            prompt => input.prompt.trim(),
            transcript => non_empty(input.transcript),
            root_instructions => root_instructions,
        })?;
        Ok(finish(&rendered))
    }

    pub fn render_proposal(&self, input: &ProposalPrompt<'_>) -> Result<String> {
        let template = self.env.get_template("proposal")?;
        let insight_json = serde_json::to_string_pretty(input.insight)
            .context("serialize insight json")?;
        let rendered = template.render(context! {
            prompt => non_empty(input.prompt),
            insight_json => truncate_chars(&insight_json, INSIGHT_JSON_MAX_CHARS),
            transcript => non_empty(input.transcript),
            skills_prefix => input.policy.skills_prefix.as_str(),
            root_instructions => input.policy.root_instructions.as_str(),
            allow_nested_instructions => input.policy.allow_nested_instructions,
            max_patch_bytes => input.policy.max_patch_bytes,
            max_files => input.policy.max_files,
        })?;
        Ok(finish(&rendered))
    }
}

fn non_empty(text: Option<&str>) -> Option<&str> {
    text.map(str::trim).filter(|s| !s.is_empty())
}

fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Trim the rendered prompt and end it with exactly one newline.
fn finish(rendered: &str) -> String {
    format!("{}\n", rendered.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::OrchestratorConfig;
    use serde_json::json;

    fn engine() -> PromptEngine {
        PromptEngine::new().expect("templates compile")
    }

    #[test]
    fn insights_prompt_includes_transcript_only_when_present() {
        let with = engine()
            .render_insights(
                &InsightsPrompt {
                    prompt: "  What slowed us down?  ",
                    transcript: Some("[user]\nhi"),
                },
                "AGENTS.md",
            )
            .expect("render");
        assert!(with.contains("Conversation transcript:\n[user]\nhi"));
        assert!(with.contains("User prompt:\nWhat slowed us down?"));
        assert!(with.contains("AGENTS.md"));
        assert!(with.ends_with("What slowed us down?\n"));

        let without = engine()
            .render_insights(
                &InsightsPrompt {
                    prompt: "x",
                    transcript: Some("   "),
                },
                "AGENTS.md",
            )
            .expect("render");
        assert!(!without.contains("Conversation transcript"));
    }

    #[test]
    fn proposal_prompt_states_allowed_paths_and_embeds_insight() {
        let policy = OrchestratorConfig::default()
            .validation_policy()
            .expect("policy");
        let insight = json!({"insights_markdown": "use rg"});
        let rendered = engine()
            .render_proposal(&ProposalPrompt {
                prompt: None,
                insight: &insight,
                transcript: None,
                policy: &policy,
            })
            .expect("render");
        assert!(rendered.contains("Allowed paths: `.codex/skills/**` and `AGENTS.md` only."));
        assert!(rendered.contains("\"insights_markdown\": \"use rg\""));
        assert!(!rendered.contains("Additional user prompt"));
    }

    #[test]
    fn truncates_on_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("hi", 10), "hi");
    }
}
