//! Agent invocation abstraction.
//!
//! The [`AgentInvoker`] trait turns an analysis request into a fully resolved
//! [`JobSpec`] (argv, environment, stdin). The job runner executes it; workflows
//! never build commands themselves. Tests plug in scripted invokers that run a
//! shell snippet instead of `codex`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

use crate::core::ids::SessionId;
use crate::core::run::RunMode;
use crate::io::config::AgentConfig;
use crate::io::job_runner::JobSpec;

/// One analysis/generation request.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    /// Complete task prompt, fed on stdin.
    pub prompt: String,
    pub mode: RunMode,
    /// Conversation being analyzed (resumed in place in resume mode).
    pub session_id: SessionId,
    pub workdir: PathBuf,
    /// JSON Schema constraining the agent's final message.
    pub output_schema_path: PathBuf,
    /// Where the agent writes its final message.
    pub last_message_path: PathBuf,
    /// Per-request model override.
    pub model: Option<String>,
}

/// Abstraction over agent backends.
pub trait AgentInvoker: Send + Sync {
    /// Build the invocation for `request`. Must arrange for the agent's final
    /// message to land in `request.last_message_path`.
    fn prepare(&self, request: &AgentRequest) -> Result<JobSpec>;
}

/// Invoker for `codex exec`.
#[derive(Debug, Clone)]
pub struct CodexInvoker {
    agent: AgentConfig,
    codex_home: PathBuf,
    timeout: Option<Duration>,
}

impl CodexInvoker {
    pub fn new(agent: AgentConfig, codex_home: PathBuf, timeout: Option<Duration>) -> Self {
        Self {
            agent,
            codex_home,
            timeout,
        }
    }

    /// Global flags first, then the `exec` subcommand; the prompt is read from stdin (`-`).
    pub fn argv(&self, request: &AgentRequest) -> Vec<String> {
        let mut cmd = vec![
            self.agent.program.clone(),
            "--ask-for-approval".to_string(),
            self.agent.approval.as_str().to_string(),
            "--sandbox".to_string(),
            self.agent.sandbox.as_str().to_string(),
        ];
        if let Some(model) = request.model.as_ref().or(self.agent.model.as_ref()) {
            cmd.extend(["--model".to_string(), model.clone()]);
        }
        if let Some(profile) = &self.agent.profile {
            cmd.extend(["--profile".to_string(), profile.clone()]);
        }
        for override_kv in &self.agent.config_overrides {
            cmd.extend(["-c".to_string(), override_kv.clone()]);
        }

        cmd.push("exec".to_string());
        if request.mode == RunMode::Resume {
            cmd.push("resume".to_string());
        }
        cmd.extend([
            "--json".to_string(),
            "-C".to_string(),
            request.workdir.display().to_string(),
            "-o".to_string(),
            request.last_message_path.display().to_string(),
            "--output-schema".to_string(),
            request.output_schema_path.display().to_string(),
        ]);
        if self.agent.skip_git_repo_check {
            cmd.push("--skip-git-repo-check".to_string());
        }
        if request.mode == RunMode::Resume {
            cmd.push(request.session_id.to_string());
        }
        cmd.push("-".to_string());
        cmd
    }

    /// Allowlisted parent variables plus an explicit `CODEX_HOME`.
    pub fn env(&self) -> BTreeMap<String, String> {
        passthrough_env(&self.agent.env_passthrough)
            .into_iter()
            .chain([(
                "CODEX_HOME".to_string(),
                self.codex_home.display().to_string(),
            )])
            .collect()
    }
}

impl AgentInvoker for CodexInvoker {
    #[instrument(skip_all, fields(mode = %request.mode, session_id = %request.session_id))]
    fn prepare(&self, request: &AgentRequest) -> Result<JobSpec> {
        if !request.output_schema_path.exists() {
            return Err(anyhow!(
                "missing output schema {}",
                request.output_schema_path.display()
            ));
        }
        ensure_parent(&request.last_message_path)?;
        let command = self.argv(request);
        debug!(argv = ?command, "prepared codex invocation");

        let mut stdin = request.prompt.clone();
        if !stdin.ends_with('\n') {
            stdin.push('\n');
        }
        Ok(JobSpec {
            command,
            env: self.env(),
            workdir: request.workdir.clone(),
            stdin: Some(stdin),
            timeout: self.timeout,
        })
    }
}

/// Copy the named variables that are set in this process's environment.
pub fn passthrough_env(names: &[String]) -> BTreeMap<String, String> {
    names
        .iter()
        .filter_map(|name| std::env::var(name).ok().map(|value| (name.clone(), value)))
        .collect()
}

pub fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create output dir {}", parent.display()))?;
    }
    Ok(())
}

/// Read the agent's final message; `None` when it wrote nothing.
pub fn read_last_message(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(text) if text.trim().is_empty() => Ok(None),
        Ok(text) => Ok(Some(text)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("read last message {}", path.display())),
    }
}
