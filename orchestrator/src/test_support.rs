//! Helpers for tests: a scripted agent, an in-memory session store and a
//! scratch repository.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Result;
use serde_json::json;
use tempfile::TempDir;
use walkdir::WalkDir;

use crate::core::ids::SessionId;
use crate::error::{OrchestratorError, OrchestratorResult, RecordKind};
use crate::io::config::OrchestratorConfig;
use crate::io::init::{InitOptions, init_workspace};
use crate::io::invoker::{AgentInvoker, AgentRequest, ensure_parent, passthrough_env};
use crate::io::job_runner::JobSpec;
use crate::io::sessions::{
    ConversationMessage, SessionDetail, SessionQuery, SessionStore, SessionSummary,
};
use crate::orchestrator::Orchestrator;

pub const AGENTS_MD: &str = "# Agent rules\n\n- Run tests before committing.\n";
pub const SKILL_MD: &str = "# db-access\n\nUse the read replica.\n";

/// Agent stand-in that runs `/bin/sh -c <script>` with the last-message path
/// as `$1`. Every prepared request is recorded.
pub struct ScriptedInvoker {
    script: String,
    timeout: Option<Duration>,
    requests: Mutex<Vec<AgentRequest>>,
}

impl ScriptedInvoker {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            timeout: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Wall-clock limit for every job this invoker prepares.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Emit one progress event, then write `message` as the final message.
    pub fn replying(message: &str) -> Self {
        let quoted = shell_quote(message);
        Self::new(format!(
            "cat > /dev/null\nprintf '%s\\n' '{{\"type\":\"task_started\",\"task_id\":\"t-1\"}}'\nprintf '%s' {quoted} > \"$1\"\n"
        ))
    }

    /// Write `stderr` and exit with `code` without producing a message.
    pub fn failing(stderr: &str, code: i32) -> Self {
        let quoted = shell_quote(stderr);
        Self::new(format!("cat > /dev/null\necho {quoted} >&2\nexit {code}\n"))
    }

    /// Block for `secs` seconds in a background child, the way an agent runs
    /// its tools: the grandchild shares the job's stdout and stderr.
    pub fn sleeping(secs: u64) -> Self {
        Self::new(format!("sleep {secs} &\necho started\nwait\n"))
    }

    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl AgentInvoker for ScriptedInvoker {
    fn prepare(&self, request: &AgentRequest) -> Result<JobSpec> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        ensure_parent(&request.last_message_path)?;
        Ok(JobSpec {
            command: vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                self.script.clone(),
                "sh".to_string(),
                request.last_message_path.display().to_string(),
            ],
            env: passthrough_env(&["PATH".to_string()]),
            workdir: request.workdir.clone(),
            stdin: Some(request.prompt.clone()),
            timeout: self.timeout,
        })
    }
}

fn shell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}

/// Final message accepted by the insights schema.
pub fn insights_message(markdown: &str) -> String {
    json!({
        "insights_markdown": markdown,
        "patterns": [{
            "title": "Repeated lookups",
            "evidence": "searched for the schema three times",
            "recommendation": "document the schema location"
        }],
        "skill_candidates": [{"name": "db-access", "description": "query the replica"}],
        "agents_md_notes": ["mention the replica"]
    })
    .to_string()
}

/// Final message accepted by the proposal schema.
pub fn proposal_message(summary: &str, diff: &str, files: &[&str]) -> String {
    json!({
        "summary": summary,
        "diff": diff,
        "files_touched": files,
        "safety_notes": []
    })
    .to_string()
}

/// Fixed set of sessions.
#[derive(Default)]
pub struct StaticSessionStore {
    sessions: BTreeMap<String, SessionDetail>,
}

impl StaticSessionStore {
    pub fn with_session(mut self, id: &str, messages: &[(&str, &str)]) -> Self {
        let session_id = SessionId::parse(id).unwrap_or_else(|err| panic!("bad session id: {err}"));
        let messages = messages
            .iter()
            .map(|(role, text)| ConversationMessage {
                timestamp: None,
                role: role.to_string(),
                text: text.to_string(),
                phase: None,
            })
            .collect();
        self.sessions.insert(
            id.to_string(),
            SessionDetail {
                summary: SessionSummary {
                    session_id,
                    started_at: None,
                    cwd: None,
                    originator: Some("test".to_string()),
                    rollout_path: PathBuf::from(format!("rollout-{id}.jsonl")),
                    title: None,
                },
                messages,
            },
        );
        self
    }
}

impl SessionStore for StaticSessionStore {
    fn list_sessions(&self, query: &SessionQuery) -> Result<Vec<SessionSummary>> {
        Ok(self
            .sessions
            .values()
            .take(query.limit)
            .map(|detail| detail.summary.clone())
            .collect())
    }

    fn get_session(&self, session_id: &SessionId) -> OrchestratorResult<SessionDetail> {
        self.sessions
            .get(session_id.as_str())
            .cloned()
            .ok_or_else(|| OrchestratorError::not_found(RecordKind::Session, session_id.as_str()))
    }
}

/// Scratch repository with `AGENTS.md` and one skill, initialized for the orchestrator.
pub struct TestWorkspace {
    temp: TempDir,
}

impl TestWorkspace {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let ws = Self { temp };
        ws.write(".git/HEAD", "ref: refs/heads/main\n");
        ws.write("AGENTS.md", AGENTS_MD);
        ws.write(".codex/skills/db-access/SKILL.md", SKILL_MD);
        init_workspace(ws.path(), &InitOptions { force: false })
            .unwrap_or_else(|err| panic!("init workspace: {err:#}"));
        ws
    }

    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    pub fn write(&self, rel: &str, contents: &str) {
        let path = self.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap_or_else(|err| panic!("mkdir {rel}: {err}"));
        }
        fs::write(&path, contents).unwrap_or_else(|err| panic!("write {rel}: {err}"));
    }

    pub fn read(&self, rel: &str) -> String {
        fs::read_to_string(self.path().join(rel)).unwrap_or_else(|err| panic!("read {rel}: {err}"))
    }

    /// Every file outside `.git/` and the artifacts directory, with its bytes.
    pub fn snapshot(&self) -> BTreeMap<String, Vec<u8>> {
        let artifacts = OrchestratorConfig::default()
            .artifacts_dir
            .to_string_lossy()
            .into_owned();
        WalkDir::new(self.path())
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| {
                let rel = entry
                    .path()
                    .strip_prefix(self.path())
                    .ok()?
                    .to_string_lossy()
                    .replace('\\', "/");
                if rel.starts_with(".git/") || rel.starts_with(&format!("{artifacts}/")) {
                    return None;
                }
                let bytes = fs::read(entry.path()).ok()?;
                Some((rel, bytes))
            })
            .collect()
    }

    /// Orchestrator over this repository with a default config, the given
    /// agent, and a session `abc` holding a short conversation.
    pub fn orchestrator(&self, invoker: Arc<dyn AgentInvoker>) -> Orchestrator {
        let sessions = StaticSessionStore::default().with_session(
            "abc",
            &[
                ("user", "Where is the db schema?"),
                ("assistant", "It lives in db/schema.sql."),
            ],
        );
        Orchestrator::new(
            self.path().to_path_buf(),
            OrchestratorConfig::default(),
            invoker,
            Arc::new(sessions),
        )
        .unwrap_or_else(|err| panic!("orchestrator: {err:#}"))
    }
}

impl Default for TestWorkspace {
    fn default() -> Self {
        Self::new()
    }
}
