//! Parsing and schema validation of the agent's final message.
//!
//! The agent is constrained with `--output-schema`, but its output is still
//! checked here before anything is persisted.

use jsonschema::validator_for;
use serde::Deserialize;
use serde_json::Value;

pub const INSIGHTS_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/insights.schema.json"
));
pub const PROPOSAL_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/proposal.schema.json"
));

/// The agent's final message did not have the expected shape.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} output rejected: {}", .messages.join("; "))]
pub struct SchemaViolation {
    pub kind: &'static str,
    pub messages: Vec<String>,
}

impl SchemaViolation {
    fn new(kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            messages: vec![message.into()],
        }
    }
}

/// Validated insights payload.
#[derive(Debug, Clone, PartialEq)]
pub struct InsightsOutput {
    pub markdown: Option<String>,
    pub json: Value,
}

/// Validated proposal payload. `files_touched` is the agent's own claim and is
/// only kept for comparison; the stored value is derived from the diff.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProposalOutput {
    pub summary: String,
    pub diff: String,
    pub files_touched: Vec<String>,
    #[serde(default)]
    pub safety_notes: Vec<String>,
}

pub fn parse_insights_output(raw: Option<&str>) -> Result<InsightsOutput, SchemaViolation> {
    let value = parse_message("insights", raw)?;
    check_schema("insights", INSIGHTS_SCHEMA, &value)?;

    let markdown = value
        .get("insights_markdown")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(|text| format!("{text}\n"));
    Ok(InsightsOutput {
        markdown,
        json: value,
    })
}

pub fn parse_proposal_output(raw: Option<&str>) -> Result<ProposalOutput, SchemaViolation> {
    let value = parse_message("proposal", raw)?;
    check_schema("proposal", PROPOSAL_SCHEMA, &value)?;

    let mut output: ProposalOutput = serde_json::from_value(value)
        .map_err(|err| SchemaViolation::new("proposal", err.to_string()))?;
    if output.diff.trim().is_empty() {
        return Err(SchemaViolation::new("proposal", "diff is empty"));
    }
    output.diff = format!("{}\n", output.diff.trim_end());
    Ok(output)
}

fn parse_message(kind: &'static str, raw: Option<&str>) -> Result<Value, SchemaViolation> {
    let text = raw
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .ok_or_else(|| SchemaViolation::new(kind, "agent produced no final message"))?;
    let value: Value = serde_json::from_str(text)
        .map_err(|err| SchemaViolation::new(kind, format!("final message is not JSON: {err}")))?;
    if !value.is_object() {
        return Err(SchemaViolation::new(kind, "final message is not a JSON object"));
    }
    Ok(value)
}

fn check_schema(kind: &'static str, schema: &str, value: &Value) -> Result<(), SchemaViolation> {
    let schema_value: Value = serde_json::from_str(schema)
        .map_err(|err| SchemaViolation::new(kind, format!("embedded schema is invalid: {err}")))?;
    let compiled = validator_for(&schema_value)
        .map_err(|err| SchemaViolation::new(kind, format!("embedded schema is invalid: {err}")))?;
    let messages: Vec<String> = compiled
        .iter_errors(value)
        .map(|err| err.to_string())
        .collect();
    if messages.is_empty() {
        Ok(())
    } else {
        Err(SchemaViolation { kind, messages })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn insights(markdown: &str) -> String {
        json!({
            "insights_markdown": markdown,
            "patterns": [],
            "skill_candidates": [],
            "agents_md_notes": ["prefer rg"],
        })
        .to_string()
    }

    #[test]
    fn accepts_well_formed_insights() {
        let out = parse_insights_output(Some(&insights("  # Findings\n"))).expect("parse");
        assert_eq!(out.markdown.as_deref(), Some("# Findings\n"));
        assert_eq!(out.json["agents_md_notes"][0], "prefer rg");
    }

    /// Blank markdown is kept as json-only output rather than rejected.
    #[test]
    fn blank_markdown_leaves_json_only() {
        let out = parse_insights_output(Some(&insights("   "))).expect("parse");
        assert!(out.markdown.is_none());
        assert!(out.json.is_object());
    }

    #[test]
    fn missing_message_is_a_violation() {
        let err = parse_insights_output(None).unwrap_err();
        assert!(err.messages[0].contains("no final message"));
        assert!(parse_insights_output(Some("  \n")).is_err());
    }

    #[test]
    fn non_json_message_is_a_violation() {
        let err = parse_insights_output(Some("all done!")).unwrap_err();
        assert!(err.messages[0].contains("not JSON"));
    }

    #[test]
    fn schema_mismatch_is_reported() {
        let err = parse_insights_output(Some(r#"{"insights_markdown": 3}"#)).unwrap_err();
        assert_eq!(err.kind, "insights");
        assert!(!err.messages.is_empty());
    }

    #[test]
    fn parses_proposal_and_normalizes_trailing_newline() {
        let raw = json!({
            "summary": "add skill",
            "diff": "--- /dev/null\n+++ b/AGENTS.md\n@@ -0,0 +1 @@\n+hi\n\n\n",
            "files_touched": ["AGENTS.md"],
            "safety_notes": [],
        })
        .to_string();
        let out = parse_proposal_output(Some(&raw)).expect("parse");
        assert!(out.diff.ends_with("+hi\n"));
        assert_eq!(out.summary, "add skill");
    }

    #[test]
    fn proposal_requires_non_empty_diff() {
        let raw = json!({
            "summary": "nothing",
            "diff": "   ",
            "files_touched": [],
            "safety_notes": [],
        })
        .to_string();
        assert!(parse_proposal_output(Some(&raw)).is_err());
    }
}
