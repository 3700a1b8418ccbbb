//! Scaffolding for `.codex-orchestrator/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use crate::io::artifact_store::ArtifactStore;
use crate::io::atomic::write_atomic;
use crate::io::config::{OrchestratorConfig, config_path, load_config, write_config};

/// Options for [`init_workspace`].
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// Overwrite an existing config with defaults.
    pub force: bool,
}

#[derive(Debug, Clone)]
pub struct InitReport {
    pub config_path: PathBuf,
    pub artifacts_root: PathBuf,
    pub wrote_config: bool,
}

/// Create the config, the artifacts directory and the output schemas.
///
/// An existing config is kept (and validated) unless `options.force` is set.
pub fn init_workspace(repo_root: &Path, options: &InitOptions) -> Result<InitReport> {
    let config_path = config_path(repo_root);
    let config_dir = config_path
        .parent()
        .ok_or_else(|| anyhow!("config path missing parent"))?;
    if config_dir.exists() && !config_dir.is_dir() {
        return Err(anyhow!(
            "init: {} exists but is not a directory",
            config_dir.display()
        ));
    }

    let wrote_config = options.force || !config_path.exists();
    let config = if wrote_config {
        let cfg = OrchestratorConfig::default();
        write_config(&config_path, &cfg)?;
        cfg
    } else {
        load_config(&config_path)?
    };

    let artifacts_root = config.artifacts_root(repo_root);
    for dir in ["insights", "proposals", "runs", "jobs"] {
        let path = artifacts_root.join(dir);
        fs::create_dir_all(&path).with_context(|| format!("create directory {}", path.display()))?;
    }
    ArtifactStore::new(&artifacts_root).write_schemas()?;

    let gitignore = artifacts_root.join(".gitignore");
    if !gitignore.exists() {
        write_atomic(&gitignore, GITIGNORE.as_bytes())?;
    }

    Ok(InitReport {
        config_path,
        artifacts_root,
        wrote_config,
    })
}

const GITIGNORE: &str = "jobs/\nruns/\n";
