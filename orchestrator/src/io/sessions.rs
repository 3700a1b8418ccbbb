//! Conversation history access.
//!
//! [`SessionStore`] is the seam the workflows depend on; [`CodexSessionStore`]
//! reads the agent's rollout files (`<codex_home>/sessions/**/rollout-*.jsonl`).
//! Each rollout is JSONL: a `session_meta` record (id, cwd, timestamp,
//! originator) followed by `response_item` records, some of which are chat
//! messages. Unreadable lines are skipped rather than failing the session.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, instrument, warn};
use walkdir::WalkDir;

use crate::core::ids::SessionId;
use crate::error::{OrchestratorError, OrchestratorResult, RecordKind};

const TITLE_MAX_CHARS: usize = 120;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub started_at: Option<DateTime<Utc>>,
    pub cwd: Option<String>,
    pub originator: Option<String>,
    pub rollout_path: PathBuf,
    /// First line of the first user message.
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationMessage {
    pub timestamp: Option<DateTime<Utc>>,
    pub role: String,
    pub text: String,
    pub phase: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionDetail {
    #[serde(flatten)]
    pub summary: SessionSummary,
    pub messages: Vec<ConversationMessage>,
}

#[derive(Debug, Clone)]
pub struct SessionQuery {
    /// Keep only sessions whose cwd is inside this directory.
    pub repo_root: Option<PathBuf>,
    pub include_all_repos: bool,
    pub limit: usize,
}

impl Default for SessionQuery {
    fn default() -> Self {
        Self {
            repo_root: None,
            include_all_repos: false,
            limit: 100,
        }
    }
}

/// Source of conversation context. Implementations may be slow and fallible.
pub trait SessionStore: Send + Sync {
    /// Sessions, newest first.
    fn list_sessions(&self, query: &SessionQuery) -> Result<Vec<SessionSummary>>;

    /// One session with its user/assistant/developer messages in time order.
    fn get_session(&self, session_id: &SessionId) -> OrchestratorResult<SessionDetail>;
}

/// Reads rollouts from an agent home directory.
#[derive(Debug, Clone)]
pub struct CodexSessionStore {
    codex_home: PathBuf,
}

impl CodexSessionStore {
    pub fn new(codex_home: impl Into<PathBuf>) -> Self {
        Self {
            codex_home: codex_home.into(),
        }
    }

    pub fn codex_home(&self) -> &Path {
        &self.codex_home
    }

    fn rollout_files(&self) -> impl Iterator<Item = PathBuf> {
        WalkDir::new(self.codex_home.join("sessions"))
            .follow_links(false)
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(err) => {
                    debug!(err = %err, "skipping unreadable session entry");
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file())
            .filter(|entry| {
                let name = entry.file_name().to_string_lossy();
                name.starts_with("rollout-") && name.ends_with(".jsonl")
            })
            .map(|entry| entry.into_path())
    }
}

impl SessionStore for CodexSessionStore {
    #[instrument(skip_all, fields(include_all_repos = query.include_all_repos, limit = query.limit))]
    fn list_sessions(&self, query: &SessionQuery) -> Result<Vec<SessionSummary>> {
        let repo_root = query
            .repo_root
            .as_ref()
            .map(|root| root.canonicalize().unwrap_or_else(|_| root.clone()));

        let mut summaries: Vec<SessionSummary> = self
            .rollout_files()
            .filter_map(|path| read_rollout(&path, false).map(|r| r.summary))
            .filter(|summary| {
                if query.include_all_repos {
                    return true;
                }
                match (&repo_root, &summary.cwd) {
                    (Some(root), Some(cwd)) => is_within(Path::new(cwd), root),
                    _ => true,
                }
            })
            .collect();

        // Newest first; undated sessions last.
        summaries.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        summaries.truncate(query.limit);
        Ok(summaries)
    }

    #[instrument(skip_all, fields(session_id = %session_id))]
    fn get_session(&self, session_id: &SessionId) -> OrchestratorResult<SessionDetail> {
        for path in self.rollout_files() {
            let Some(meta_id) = read_meta_id(&path) else {
                continue;
            };
            if meta_id != session_id.as_str() {
                continue;
            }
            if let Some(rollout) = read_rollout(&path, true) {
                return Ok(SessionDetail {
                    summary: rollout.summary,
                    messages: rollout.messages,
                });
            }
        }
        Err(OrchestratorError::not_found(
            RecordKind::Session,
            session_id.as_str(),
        ))
    }
}

struct Rollout {
    summary: SessionSummary,
    messages: Vec<ConversationMessage>,
}

fn is_within(cwd: &Path, root: &Path) -> bool {
    let cwd = cwd.canonicalize().unwrap_or_else(|_| cwd.to_path_buf());
    cwd.starts_with(root)
}

fn lines(path: &Path) -> Option<impl Iterator<Item = Value>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) => {
            warn!(path = %path.display(), err = %err, "cannot open rollout");
            return None;
        }
    };
    Some(
        BufReader::new(file)
            .lines()
            .map_while(|line| line.ok())
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str::<Value>(&line).ok()),
    )
}

fn session_meta(record: &Value) -> Option<&Value> {
    (record.get("type")?.as_str()? == "session_meta")
        .then(|| record.get("payload"))
        .flatten()
        .filter(|p| p.is_object())
}

fn read_meta_id(path: &Path) -> Option<String> {
    lines(path)?
        .find_map(|record| session_meta(&record).and_then(|m| str_field(m, "id")))
}

/// Parse a rollout. With `full = false` reading stops at the first user
/// message (enough for a listing entry).
fn read_rollout(path: &Path, full: bool) -> Option<Rollout> {
    let mut meta: Option<Value> = None;
    let mut title: Option<String> = None;
    let mut messages = Vec::new();

    for record in lines(path)? {
        if meta.is_none()
            && let Some(payload) = session_meta(&record)
        {
            meta = Some(payload.clone());
            continue;
        }
        let Some(message) = parse_message(&record) else {
            continue;
        };
        if title.is_none() && message.role == "user" {
            title = message
                .text
                .lines()
                .next()
                .map(|line| line.trim().chars().take(TITLE_MAX_CHARS).collect());
        }
        if !full {
            if meta.is_some() && title.is_some() {
                break;
            }
            continue;
        }
        if matches!(message.role.as_str(), "user" | "assistant" | "developer") {
            messages.push(message);
        }
    }

    let meta = meta?;
    let session_id = SessionId::parse(&str_field(&meta, "id")?).ok()?;
    messages.sort_by_key(|m| m.timestamp);
    Some(Rollout {
        summary: SessionSummary {
            session_id,
            started_at: str_field(&meta, "timestamp").and_then(|ts| parse_timestamp(&ts)),
            cwd: str_field(&meta, "cwd"),
            originator: str_field(&meta, "originator"),
            rollout_path: path.to_path_buf(),
            title,
        },
        messages,
    })
}

fn parse_message(record: &Value) -> Option<ConversationMessage> {
    if record.get("type")?.as_str()? != "response_item" {
        return None;
    }
    let payload = record.get("payload")?;
    if payload.get("type")?.as_str()? != "message" {
        return None;
    }
    let role = payload.get("role")?.as_str()?.to_string();
    let text = flatten_content(payload);
    if text.is_empty() {
        return None;
    }
    Some(ConversationMessage {
        timestamp: record
            .get("timestamp")
            .and_then(Value::as_str)
            .and_then(parse_timestamp),
        role,
        text,
        phase: str_field(payload, "phase"),
    })
}

fn flatten_content(payload: &Value) -> String {
    let Some(items) = payload.get("content").and_then(Value::as_array) else {
        return String::new();
    };
    items
        .iter()
        .filter_map(|item| item.get("text").and_then(Value::as_str))
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Plain-text transcript for embedding in a prompt.
///
/// Messages are rendered as `[role][phase]` headers followed by the text and
/// added whole until the next one would exceed `max_chars`.
pub fn render_transcript(messages: &[ConversationMessage], max_chars: usize) -> String {
    let mut chunks = Vec::new();
    let mut remaining = max_chars;
    for msg in messages {
        let header = match &msg.phase {
            Some(phase) => format!("[{}][{phase}]", msg.role),
            None => format!("[{}]", msg.role),
        };
        let piece = format!("{header}\n{}\n", msg.text.trim());
        let len = piece.chars().count();
        if len > remaining {
            break;
        }
        remaining -= len;
        chunks.push(piece);
    }
    chunks.join("\n").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;

    fn write_rollout(home: &Path, rel: &str, records: &[Value]) -> PathBuf {
        let path = home.join("sessions").join(rel);
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        let mut text = String::new();
        for record in records {
            text.push_str(&record.to_string());
            text.push('\n');
        }
        fs::write(&path, text).expect("write");
        path
    }

    fn meta(id: &str, cwd: &str, ts: &str) -> Value {
        json!({"type": "session_meta", "payload": {"id": id, "cwd": cwd, "timestamp": ts, "originator": "codex_cli_rs"}})
    }

    fn message(role: &str, text: &str, ts: &str) -> Value {
        json!({
            "type": "response_item",
            "timestamp": ts,
            "payload": {"type": "message", "role": role, "content": [{"type": "input_text", "text": text}]}
        })
    }

    fn fixture() -> (tempfile::TempDir, PathBuf) {
        let temp = tempfile::tempdir().expect("tempdir");
        let home = temp.path().join("codex-home");
        let repo = temp.path().join("repo");
        fs::create_dir_all(repo.join("sub")).expect("repo");
        let repo_str = repo.display().to_string();
        let sub_str = repo.join("sub").display().to_string();

        write_rollout(
            &home,
            "2026/01/05/rollout-a.jsonl",
            &[
                meta("sess-old", &repo_str, "2026-01-05T10:00:00Z"),
                message("user", "Fix the flaky test\nmore detail", "2026-01-05T10:00:01Z"),
                json!({"type": "response_item", "payload": {"type": "reasoning"}}),
                message("assistant", "Done.", "2026-01-05T10:00:05Z"),
            ],
        );
        write_rollout(
            &home,
            "2026/01/06/rollout-b.jsonl",
            &[
                meta("sess-new", &sub_str, "2026-01-06T09:00:00.123Z"),
                message("user", "Add a skill", "2026-01-06T09:00:01Z"),
            ],
        );
        write_rollout(
            &home,
            "2026/01/07/rollout-c.jsonl",
            &[
                meta("sess-elsewhere", "/somewhere/else", "2026-01-07T09:00:00Z"),
                message("user", "unrelated", "2026-01-07T09:00:01Z"),
            ],
        );
        fs::write(home.join("sessions/2026/01/07/notes.txt"), "ignored").expect("write");
        (temp, repo)
    }

    #[test]
    fn lists_repo_sessions_newest_first() {
        let (temp, repo) = fixture();
        let store = CodexSessionStore::new(temp.path().join("codex-home"));
        let listed = store
            .list_sessions(&SessionQuery {
                repo_root: Some(repo),
                ..SessionQuery::default()
            })
            .expect("list");
        let ids: Vec<_> = listed.iter().map(|s| s.session_id.to_string()).collect();
        assert_eq!(ids, vec!["sess-new", "sess-old"]);
        assert_eq!(listed[1].title.as_deref(), Some("Fix the flaky test"));
        assert_eq!(listed[1].originator.as_deref(), Some("codex_cli_rs"));
    }

    #[test]
    fn include_all_repos_and_limit() {
        let (temp, repo) = fixture();
        let store = CodexSessionStore::new(temp.path().join("codex-home"));
        let listed = store
            .list_sessions(&SessionQuery {
                repo_root: Some(repo),
                include_all_repos: true,
                limit: 2,
            })
            .expect("list");
        let ids: Vec<_> = listed.iter().map(|s| s.session_id.to_string()).collect();
        assert_eq!(ids, vec!["sess-elsewhere", "sess-new"]);
    }

    #[test]
    fn missing_home_lists_nothing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = CodexSessionStore::new(temp.path().join("nope"));
        assert!(store.list_sessions(&SessionQuery::default()).expect("list").is_empty());
    }

    #[test]
    fn get_session_reads_messages_in_order() {
        let (temp, _repo) = fixture();
        let store = CodexSessionStore::new(temp.path().join("codex-home"));
        let detail = store
            .get_session(&SessionId::parse("sess-old").expect("id"))
            .expect("get");
        let roles: Vec<_> = detail.messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["user", "assistant"]);
        assert_eq!(detail.messages[0].text, "Fix the flaky test\nmore detail");

        let err = store
            .get_session(&SessionId::parse("missing").expect("id"))
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn transcript_stops_before_budget_overflow() {
        let messages = vec![
            ConversationMessage {
                timestamp: None,
                role: "user".to_string(),
                text: " hi ".to_string(),
                phase: None,
            },
            ConversationMessage {
                timestamp: None,
                role: "assistant".to_string(),
                text: "hello".to_string(),
                phase: Some("final".to_string()),
            },
        ];
        assert_eq!(
            render_transcript(&messages, 1_000),
            "[user]\nhi\n\n[assistant][final]\nhello"
        );
        // "[user]\nhi\n" is 10 chars; the second piece does not fit.
        assert_eq!(render_transcript(&messages, 12), "[user]\nhi");
        assert_eq!(render_transcript(&messages, 3), "");
    }
}
