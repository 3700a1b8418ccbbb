//! Insight artifact model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::core::ids::{ArtifactId, SessionId};

/// Structured output of one analysis run over a conversation. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsightArtifact {
    pub artifact_id: ArtifactId,
    pub session_id: SessionId,
    pub markdown: Option<String>,
    pub json: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl InsightArtifact {
    pub fn new(
        artifact_id: ArtifactId,
        session_id: SessionId,
        markdown: Option<String>,
        json: Option<Value>,
    ) -> Self {
        Self {
            artifact_id,
            session_id,
            markdown,
            json,
            created_at: Utc::now(),
        }
    }

    /// An artifact must carry at least one of markdown or json.
    pub fn is_well_formed(&self) -> bool {
        self.markdown.as_deref().is_some_and(|m| !m.trim().is_empty()) || self.json.is_some()
    }
}

/// Content handed to the store; the id is generated when absent.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InsightDraft {
    pub artifact_id: Option<ArtifactId>,
    pub markdown: Option<String>,
    pub json: Option<Value>,
}

/// Stable digest of an artifact's content, used to tell a harmless re-put from
/// an id collision.
pub fn content_digest(markdown: Option<&str>, json: Option<&Value>) -> String {
    let mut hasher = Sha256::new();
    match markdown {
        Some(text) => {
            hasher.update(b"md:");
            hasher.update(text.as_bytes());
        }
        None => hasher.update(b"md-none"),
    }
    hasher.update([0u8]);
    match json {
        Some(value) => {
            hasher.update(b"json:");
            hasher.update(value.to_string().as_bytes());
        }
        None => hasher.update(b"json-none"),
    }
    hex::encode(hasher.finalize())
}

/// Listing entry for a session's artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsightSummary {
    pub artifact_id: ArtifactId,
    pub session_id: SessionId,
    pub created_at: DateTime<Utc>,
    pub has_markdown: bool,
    pub has_json: bool,
}

impl From<&InsightArtifact> for InsightSummary {
    fn from(artifact: &InsightArtifact) -> Self {
        Self {
            artifact_id: artifact.artifact_id.clone(),
            session_id: artifact.session_id.clone(),
            created_at: artifact.created_at,
            has_markdown: artifact.markdown.is_some(),
            has_json: artifact.json.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ids() -> (ArtifactId, SessionId) {
        (
            ArtifactId::parse("a-1").expect("id"),
            SessionId::parse("abc").expect("id"),
        )
    }

    #[test]
    fn digest_distinguishes_fields() {
        let a = content_digest(Some("x"), None);
        assert_eq!(a, content_digest(Some("x"), None));
        assert_ne!(a, content_digest(None, Some(&json!("x"))));
        assert_ne!(a, content_digest(Some("x"), Some(&json!({}))));
    }

    #[test]
    fn requires_markdown_or_json() {
        let (a, s) = ids();
        assert!(!InsightArtifact::new(a.clone(), s.clone(), None, None).is_well_formed());
        assert!(!InsightArtifact::new(a.clone(), s.clone(), Some("  ".into()), None).is_well_formed());
        assert!(InsightArtifact::new(a.clone(), s.clone(), Some("# x".into()), None).is_well_formed());
        assert!(InsightArtifact::new(a, s, None, Some(json!({}))).is_well_formed());
    }
}
