//! Orchestrator configuration stored under `.codex-orchestrator/config.toml`.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::validator::ValidationPolicy;
use crate::io::atomic::write_atomic;

/// Default artifacts directory, relative to the repository root.
pub const DEFAULT_ARTIFACTS_DIR: &str = ".codex-orchestrator";
pub const CONFIG_FILE: &str = "config.toml";

/// Orchestrator configuration (TOML).
///
/// Edited by humans; missing fields fall back to defaults so a partial file
/// stays valid across upgrades.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Artifacts root. Relative paths resolve against the repository root.
    pub artifacts_dir: PathBuf,

    /// Upper bound on transcript characters embedded in a fork-mode prompt.
    pub transcript_max_chars: usize,

    pub jobs: JobsConfig,
    pub agent: AgentConfig,
    pub validation: ValidationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct JobsConfig {
    /// Lines kept per output stream (older lines are evicted).
    pub max_output_lines: usize,
    /// Wall-clock limit per job; `0` disables the limit.
    pub timeout_secs: u64,
    /// How often the supervisor checks for exit, cancel and timeout.
    pub poll_interval_ms: u64,
}

impl JobsConfig {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            max_output_lines: 2000,
            timeout_secs: 30 * 60,
            poll_interval_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SandboxMode {
    ReadOnly,
    WorkspaceWrite,
    DangerFullAccess,
}

impl SandboxMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SandboxMode::ReadOnly => "read-only",
            SandboxMode::WorkspaceWrite => "workspace-write",
            SandboxMode::DangerFullAccess => "danger-full-access",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalPolicy {
    Untrusted,
    OnFailure,
    OnRequest,
    Never,
}

impl ApprovalPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            ApprovalPolicy::Untrusted => "untrusted",
            ApprovalPolicy::OnFailure => "on-failure",
            ApprovalPolicy::OnRequest => "on-request",
            ApprovalPolicy::Never => "never",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent executable (resolved through `PATH` from the passthrough environment).
    pub program: String,
    pub model: Option<String>,
    pub profile: Option<String>,
    pub sandbox: SandboxMode,
    pub approval: ApprovalPolicy,
    /// Extra `-c key=value` overrides.
    pub config_overrides: Vec<String>,
    pub skip_git_repo_check: bool,
    /// Parent environment variables forwarded to jobs. Everything else is cleared.
    pub env_passthrough: Vec<String>,
    /// Agent home (auth and session history). Falls back to `$CODEX_HOME`, then `~/.codex`.
    pub codex_home: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            program: "codex".to_string(),
            model: None,
            profile: None,
            sandbox: SandboxMode::ReadOnly,
            approval: ApprovalPolicy::Never,
            config_overrides: Vec::new(),
            skip_git_repo_check: false,
            env_passthrough: [
                "PATH",
                "HOME",
                "USER",
                "LANG",
                "LC_ALL",
                "TERM",
                "TMPDIR",
                "SSL_CERT_FILE",
                "HTTP_PROXY",
                "HTTPS_PROXY",
                "NO_PROXY",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            codex_home: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ValidationConfig {
    pub skills_prefix: String,
    pub root_instructions: String,
    pub allow_nested_instructions: bool,
    /// Regexes matched against the normalized repo-relative path.
    pub denied_patterns: Vec<String>,
    pub denied_extensions: Vec<String>,
    pub max_patch_bytes: usize,
    pub max_files: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            skills_prefix: ".codex/skills/".to_string(),
            root_instructions: "AGENTS.md".to_string(),
            allow_nested_instructions: false,
            denied_patterns: [
                r"(^|/)\.env($|\.)",
                r"(^|/)\.netrc$",
                r"(^|/)\.npmrc$",
                r"(^|/)id_(rsa|dsa|ecdsa|ed25519)",
                r"(?i)(^|/)(credentials?|secrets?)(\.[^/]*)?$",
                r"(^|/)\.git/",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            denied_extensions: [
                "pem", "key", "p12", "pfx", "keystore", "jks", "der", "crt", "png", "jpg",
                "jpeg", "gif", "ico", "pdf", "zip", "gz", "tar", "exe", "dll", "so", "dylib",
                "bin",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            max_patch_bytes: 200_000,
            max_files: 20,
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            artifacts_dir: PathBuf::from(DEFAULT_ARTIFACTS_DIR),
            transcript_max_chars: 60_000,
            jobs: JobsConfig::default(),
            agent: AgentConfig::default(),
            validation: ValidationConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.artifacts_dir.as_os_str().is_empty() {
            return Err(anyhow!("artifacts_dir must not be empty"));
        }
        if self.jobs.max_output_lines == 0 {
            return Err(anyhow!("jobs.max_output_lines must be > 0"));
        }
        if self.jobs.poll_interval_ms == 0 {
            return Err(anyhow!("jobs.poll_interval_ms must be > 0"));
        }
        if self.agent.program.trim().is_empty() {
            return Err(anyhow!("agent.program must be non-empty"));
        }
        if self.validation.root_instructions.trim().is_empty()
            || self.validation.root_instructions.contains('/')
        {
            return Err(anyhow!(
                "validation.root_instructions must be a bare file name"
            ));
        }
        if self.validation.max_patch_bytes == 0 || self.validation.max_files == 0 {
            return Err(anyhow!(
                "validation.max_patch_bytes and validation.max_files must be > 0"
            ));
        }
        self.validation_policy().map(|_| ())
    }

    /// Compile the `[validation]` section into the validator's policy.
    pub fn validation_policy(&self) -> Result<ValidationPolicy> {
        let v = &self.validation;
        let denied_patterns = v
            .denied_patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern)
                    .with_context(|| format!("validation.denied_patterns: invalid regex {pattern:?}"))
            })
            .collect::<Result<Vec<_>>>()?;
        let denied_extensions: BTreeSet<String> = v
            .denied_extensions
            .iter()
            .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
            .filter(|ext| !ext.is_empty())
            .collect();
        Ok(ValidationPolicy {
            skills_prefix: v.skills_prefix.clone(),
            root_instructions: v.root_instructions.clone(),
            allow_nested_instructions: v.allow_nested_instructions,
            denied_patterns,
            denied_extensions,
            max_patch_bytes: v.max_patch_bytes,
            max_files: v.max_files,
        })
    }

    /// Artifacts root for `repo_root`.
    pub fn artifacts_root(&self, repo_root: &Path) -> PathBuf {
        if self.artifacts_dir.is_absolute() {
            self.artifacts_dir.clone()
        } else {
            repo_root.join(&self.artifacts_dir)
        }
    }

    /// Agent home: config value, then `$CODEX_HOME`, then `~/.codex`.
    pub fn codex_home(&self, repo_root: &Path) -> PathBuf {
        let configured = self
            .agent
            .codex_home
            .clone()
            .or_else(|| std::env::var_os("CODEX_HOME").map(PathBuf::from));
        match configured {
            Some(path) if path.is_absolute() => path,
            Some(path) => repo_root.join(path),
            None => std::env::var_os("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| repo_root.to_path_buf())
                .join(".codex"),
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `OrchestratorConfig::default()`.
pub fn load_config(path: &Path) -> Result<OrchestratorConfig> {
    if !path.exists() {
        let cfg = OrchestratorConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: OrchestratorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Validate, then write config atomically.
pub fn write_config(path: &Path, cfg: &OrchestratorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())
}

/// Walk up from `start` to the first directory containing `.git`.
///
/// Falls back to `start` itself outside a repository.
pub fn find_repo_root(start: &Path) -> PathBuf {
    let start = start.canonicalize().unwrap_or_else(|_| start.to_path_buf());
    start
        .ancestors()
        .find(|candidate| candidate.join(".git").exists())
        .map(Path::to_path_buf)
        .unwrap_or(start)
}

/// Config path for a repository using the default artifacts directory.
pub fn config_path(repo_root: &Path) -> PathBuf {
    repo_root.join(DEFAULT_ARTIFACTS_DIR).join(CONFIG_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, OrchestratorConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut cfg = OrchestratorConfig::default();
        cfg.agent.model = Some("gpt-5-codex".to_string());
        cfg.jobs.timeout_secs = 0;
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
        assert!(loaded.jobs.timeout().is_none());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[validation]\nmax_files = 3\n\n[agent]\nsandbox = \"workspace-write\"\n")
            .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.validation.max_files, 3);
        assert_eq!(cfg.validation.skills_prefix, ".codex/skills/");
        assert_eq!(cfg.agent.sandbox, SandboxMode::WorkspaceWrite);
        assert_eq!(cfg.jobs.max_output_lines, 2000);
    }

    #[test]
    fn invalid_regex_is_rejected() {
        let mut cfg = OrchestratorConfig::default();
        cfg.validation.denied_patterns.push("(unclosed".to_string());
        let err = cfg.validate().unwrap_err();
        assert!(format!("{err:#}").contains("invalid regex"));
    }

    #[test]
    fn policy_normalizes_extensions() {
        let mut cfg = OrchestratorConfig::default();
        cfg.validation.denied_extensions = vec![".PEM".to_string(), "".to_string()];
        let policy = cfg.validation_policy().expect("policy");
        assert!(policy.denied_extensions.contains("pem"));
        assert_eq!(policy.denied_extensions.len(), 1);
    }

    #[test]
    fn finds_repo_root_by_git_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().canonicalize().expect("canonical");
        fs::create_dir_all(root.join(".git")).expect("git dir");
        let nested = root.join("a/b");
        fs::create_dir_all(&nested).expect("nested");
        assert_eq!(find_repo_root(&nested), root);
    }
}
