//! Apply engine: writes a confirmed, validated proposal to the working tree.
//!
//! Every file is patched in memory first. Only when all hunks of all files
//! apply cleanly are the results staged as temp files and renamed into place;
//! a failure while committing, or while recording the result, restores the
//! files already replaced from their in-memory originals and removes any
//! directories the apply created. The tree either ends up fully patched or
//! unchanged.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::{info, instrument, warn};

use crate::core::diff::parse_unified_diff;
use crate::core::ids::ProposalId;
use crate::core::patch::{PatchConflict, apply_file_patch};
use crate::core::proposal::ProposalStatus;
use crate::core::run::ProposalAuditEntry;
use crate::core::validator::validate_diff;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::io::atomic::{stage_sibling, write_atomic};
use crate::orchestrator::Orchestrator;

/// Why an apply was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyBlock {
    /// The diff fails the path/size/content rules (or failed them when generated).
    Validation,
    /// The diff does not match the current working tree.
    Conflict,
    /// Writing the working tree failed; changes were rolled back.
    Io,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplyOutcome {
    pub applied: bool,
    pub files_changed: Vec<String>,
    pub errors: Vec<String>,
    pub blocked: Option<ApplyBlock>,
}

impl ApplyOutcome {
    fn blocked(block: ApplyBlock, errors: Vec<String>) -> Self {
        Self {
            applied: false,
            files_changed: Vec::new(),
            errors,
            blocked: Some(block),
        }
    }
}

/// What a successful commit left behind besides the files themselves.
#[derive(Debug, Default)]
struct Commit {
    /// Directories created for new files, shallowest first.
    created_dirs: Vec<PathBuf>,
}

/// Final contents for one repository path.
#[derive(Debug, Clone, PartialEq, Eq)]
struct FileChange {
    path: String,
    original: Option<String>,
    /// `None` removes the file.
    updated: Option<String>,
}

impl Orchestrator {
    /// Apply a `ready` proposal. `confirm` must be `true`.
    ///
    /// Missing proposals, unconfirmed requests and proposals that are not
    /// `ready` are errors and touch nothing. Validation failures, hunk
    /// conflicts and write failures come back as an [`ApplyOutcome`] with
    /// `applied: false`; the proposal stays `ready` so a retry is possible.
    #[instrument(skip_all, fields(proposal_id = %proposal_id))]
    pub fn apply_proposal(
        &self,
        proposal_id: &ProposalId,
        confirm: bool,
    ) -> OrchestratorResult<ApplyOutcome> {
        let _guard = self.lock_apply();
        let proposal = self.store.get_proposal(proposal_id)?;
        if !confirm {
            return Err(OrchestratorError::precondition(
                "apply requires explicit confirmation",
            ));
        }
        let Some(content) = proposal.content().filter(|_| proposal.status() == ProposalStatus::Ready)
        else {
            return Err(OrchestratorError::precondition(format!(
                "proposal {proposal_id} is {}, not ready",
                proposal.status().as_str()
            )));
        };

        let report = validate_diff(&content.diff, &self.policy);
        let mut errors = report.messages();
        if errors.is_empty() {
            errors = content.validation_errors.clone();
        }
        if !errors.is_empty() {
            return self.reject(proposal_id, ApplyBlock::Validation, errors);
        }

        let changes = match plan_changes(&self.repo_root, &content.diff) {
            Ok(changes) => changes,
            Err(conflict) => {
                return self.reject(proposal_id, ApplyBlock::Conflict, vec![conflict.to_string()]);
            }
        };
        let commit = match commit_changes(&self.repo_root, &changes) {
            Ok(commit) => commit,
            Err(err) => {
                return self.reject(proposal_id, ApplyBlock::Io, vec![format!("{err:#}")]);
            }
        };

        let files_changed: Vec<String> = changes.iter().map(|change| change.path.clone()).collect();
        if let Err(err) = self.record_applied(proposal_id, &files_changed) {
            warn!(err = %format!("{err:#}"), "recording the apply failed, rolling back");
            rollback(&self.repo_root, &changes, &commit);
            return Err(err);
        }
        info!(files = files_changed.len(), "proposal applied");
        Ok(ApplyOutcome {
            applied: true,
            files_changed,
            errors: Vec::new(),
            blocked: None,
        })
    }

    /// Audit first, then flip the status. If the status update fails the
    /// audit gets a follow-up entry saying the changes were rolled back.
    fn record_applied(
        &self,
        proposal_id: &ProposalId,
        files_changed: &[String],
    ) -> OrchestratorResult<()> {
        let applied_at = Utc::now();
        self.store.append_proposal_audit(
            proposal_id,
            &ProposalAuditEntry::Applied {
                at: applied_at,
                files_changed: files_changed.to_vec(),
                validation_errors: Vec::new(),
            },
        )?;
        let changed = files_changed.to_vec();
        let updated = self.store.update_proposal(proposal_id, move |proposal| {
            proposal.mark_applied(applied_at, changed)
        });
        if let Err(err) = updated {
            let note = ProposalAuditEntry::ApplyRejected {
                at: Utc::now(),
                errors: vec![format!("status update failed, changes rolled back: {err:#}")],
            };
            if let Err(audit_err) = self.store.append_proposal_audit(proposal_id, &note) {
                warn!(err = %format!("{audit_err:#}"), "could not record the rollback");
            }
            return Err(err);
        }
        Ok(())
    }

    fn reject(
        &self,
        proposal_id: &ProposalId,
        block: ApplyBlock,
        errors: Vec<String>,
    ) -> OrchestratorResult<ApplyOutcome> {
        warn!(block = ?block, errors = ?errors, "apply refused");
        self.store.append_proposal_audit(
            proposal_id,
            &ProposalAuditEntry::ApplyRejected {
                at: Utc::now(),
                errors: errors.clone(),
            },
        )?;
        Ok(ApplyOutcome::blocked(block, errors))
    }
}

/// Compute the final contents of every touched file without writing anything.
///
/// Paths are expected to be validated already; they are still confined to
/// `repo_root`, including through symlinked directories.
fn plan_changes(repo_root: &Path, diff: &str) -> Result<Vec<FileChange>, PatchConflict> {
    let parsed = parse_unified_diff(diff).map_err(|err| PatchConflict {
        path: String::new(),
        message: err.to_string(),
    })?;

    // path -> (contents on disk, contents after the patches so far)
    let mut files: BTreeMap<String, (Option<String>, Option<String>)> = BTreeMap::new();
    for patch in &parsed.files {
        let source = patch.old_path.as_deref().or(patch.new_path.as_deref());
        let Some(source) = source else {
            continue;
        };
        let current = load(repo_root, &mut files, source)?;
        let patched = apply_file_patch(current.as_deref(), patch)?;

        match (&patch.old_path, &patch.new_path) {
            (Some(old), Some(new)) if old != new => {
                if load(repo_root, &mut files, new)?.is_some() {
                    return Err(PatchConflict {
                        path: new.clone(),
                        message: "rename target already exists".to_string(),
                    });
                }
                set(&mut files, old, None);
                set(&mut files, new, patched);
            }
            _ => set(&mut files, source, patched),
        }
    }

    Ok(files
        .into_iter()
        .filter(|(_, (original, updated))| original != updated)
        .map(|(path, (original, updated))| FileChange {
            path,
            original,
            updated,
        })
        .collect())
}

fn load(
    repo_root: &Path,
    files: &mut BTreeMap<String, (Option<String>, Option<String>)>,
    path: &str,
) -> Result<Option<String>, PatchConflict> {
    if let Some((_, current)) = files.get(path) {
        return Ok(current.clone());
    }
    let original = read_original(repo_root, path).map_err(|err| PatchConflict {
        path: path.to_string(),
        message: format!("{err:#}"),
    })?;
    files.insert(path.to_string(), (original.clone(), original.clone()));
    Ok(original)
}

fn set(
    files: &mut BTreeMap<String, (Option<String>, Option<String>)>,
    path: &str,
    contents: Option<String>,
) {
    if let Some(entry) = files.get_mut(path) {
        entry.1 = contents;
    }
}

fn read_original(repo_root: &Path, path: &str) -> Result<Option<String>> {
    let abs = resolve(repo_root, path)?;
    match fs::read(&abs) {
        Ok(bytes) => String::from_utf8(bytes)
            .map(Some)
            .map_err(|_| anyhow!("not a UTF-8 text file")),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("read {}", abs.display())),
    }
}

/// Join `path` onto `repo_root`, refusing anything that resolves outside it.
fn resolve(repo_root: &Path, path: &str) -> Result<PathBuf> {
    let abs = repo_root.join(path);
    let root = repo_root
        .canonicalize()
        .with_context(|| format!("resolve {}", repo_root.display()))?;
    let mut existing = abs.parent();
    while let Some(dir) = existing {
        if dir.exists() {
            let real = dir
                .canonicalize()
                .with_context(|| format!("resolve {}", dir.display()))?;
            if !real.starts_with(&root) {
                return Err(anyhow!("resolves outside the repository"));
            }
            break;
        }
        existing = dir.parent();
    }
    if abs.is_symlink() {
        return Err(anyhow!("refusing to write through a symlink"));
    }
    Ok(abs)
}

/// Stage every new file, then swap them in. On any failure, restore what
/// was already replaced, drop the remaining temp files and remove the
/// directories created for them.
fn commit_changes(repo_root: &Path, changes: &[FileChange]) -> Result<Commit> {
    let mut commit = Commit::default();
    let mut staged: Vec<(PathBuf, Option<NamedTempFile>)> = Vec::with_capacity(changes.len());
    for change in changes {
        let target = repo_root.join(&change.path);
        let temp = match &change.updated {
            Some(contents) => match stage(&target, contents, &mut commit.created_dirs) {
                Ok(temp) => Some(temp),
                Err(err) => {
                    drop(staged);
                    remove_created_dirs(&commit.created_dirs);
                    return Err(err);
                }
            },
            None => None,
        };
        staged.push((target, temp));
    }

    let mut pending = staged.into_iter();
    let mut committed = 0;
    while let Some((target, temp)) = pending.next() {
        let result = match temp {
            Some(temp) => temp
                .persist(&target)
                .map(drop)
                .map_err(|err| err.error)
                .with_context(|| format!("replace {}", target.display())),
            None => fs::remove_file(&target)
                .with_context(|| format!("remove {}", target.display())),
        };
        if let Err(err) = result {
            // Temp files go first so the created directories can be emptied.
            drop(pending);
            rollback(repo_root, &changes[..committed], &commit);
            return Err(err);
        }
        committed += 1;
    }
    Ok(commit)
}

fn stage(target: &Path, contents: &str, created_dirs: &mut Vec<PathBuf>) -> Result<NamedTempFile> {
    let parent = target
        .parent()
        .with_context(|| format!("path missing parent {}", target.display()))?;
    create_missing_dirs(parent, created_dirs)?;
    stage_sibling(target, contents.as_bytes())
}

/// `create_dir_all` that records every directory it actually created.
fn create_missing_dirs(dir: &Path, created: &mut Vec<PathBuf>) -> Result<()> {
    let mut missing = Vec::new();
    let mut current = Some(dir);
    while let Some(path) = current {
        if path.exists() {
            break;
        }
        missing.push(path.to_path_buf());
        current = path.parent();
    }
    for path in missing.into_iter().rev() {
        match fs::create_dir(&path) {
            Ok(()) => created.push(path),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {}
            Err(err) => {
                return Err(err).with_context(|| format!("create directory {}", path.display()));
            }
        }
    }
    Ok(())
}

/// Deepest first; a directory that is no longer empty is left alone.
fn remove_created_dirs(created: &[PathBuf]) {
    for dir in created.iter().rev() {
        if let Err(err) = fs::remove_dir(dir) {
            warn!(dir = %dir.display(), err = %err, "could not remove directory created by apply");
        }
    }
}

fn rollback(repo_root: &Path, committed: &[FileChange], commit: &Commit) {
    for change in committed.iter().rev() {
        let target = repo_root.join(&change.path);
        let restored = match &change.original {
            Some(original) => write_atomic(&target, original.as_bytes()),
            None => fs::remove_file(&target)
                .with_context(|| format!("remove {}", target.display())),
        };
        if let Err(err) = restored {
            warn!(path = %change.path, err = %format!("{err:#}"), "rollback failed");
        }
    }
    remove_created_dirs(&commit.created_dirs);
}
