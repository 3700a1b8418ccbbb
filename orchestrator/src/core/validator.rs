//! Proposal safety checks.
//!
//! [`validate_diff`] is a pure function of the diff text and the policy: the
//! same inputs always produce the same report. It never mutates a proposal;
//! callers attach the returned messages as `validation_errors`.

use std::collections::BTreeSet;
use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::diff::parse_unified_diff;

/// Path and size rules a diff must satisfy before it may be applied.
#[derive(Debug, Clone)]
pub struct ValidationPolicy {
    /// Directory prefix for skill files (e.g. `.codex/skills/`).
    pub skills_prefix: String,
    /// Root agent-instructions file (e.g. `AGENTS.md`).
    pub root_instructions: String,
    /// Also allow `<dir>/AGENTS.md` anywhere in the tree.
    pub allow_nested_instructions: bool,
    pub denied_patterns: Vec<Regex>,
    /// Lower-case extensions without the dot.
    pub denied_extensions: BTreeSet<String>,
    pub max_patch_bytes: usize,
    pub max_files: usize,
}

/// A single reason a diff may not be applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum Violation {
    UnparseableDiff { detail: String },
    AbsolutePath { path: String },
    PathTraversal { path: String },
    DisallowedPath { path: String },
    DeniedPattern { path: String, pattern: String },
    DeniedExtension { path: String, extension: String },
    BinaryPatch { path: String },
    PatchTooLarge { bytes: usize, max: usize },
    TooManyFiles { files: usize, max: usize },
}

impl Violation {
    pub fn code(&self) -> &'static str {
        match self {
            Violation::UnparseableDiff { .. } => "unparseable_diff",
            Violation::AbsolutePath { .. } => "absolute_path",
            Violation::PathTraversal { .. } => "path_traversal",
            Violation::DisallowedPath { .. } => "disallowed_path",
            Violation::DeniedPattern { .. } => "denied_pattern",
            Violation::DeniedExtension { .. } => "denied_extension",
            Violation::BinaryPatch { .. } => "binary_patch",
            Violation::PatchTooLarge { .. } => "patch_too_large",
            Violation::TooManyFiles { .. } => "too_many_files",
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::UnparseableDiff { detail } => write!(f, "unparseable diff: {detail}"),
            Violation::AbsolutePath { path } => write!(f, "absolute path not allowed: {path}"),
            Violation::PathTraversal { path } => {
                write!(f, "parent-directory traversal not allowed: {path}")
            }
            Violation::DisallowedPath { path } => {
                write!(f, "path outside allowed locations: {path}")
            }
            Violation::DeniedPattern { path, pattern } => {
                write!(f, "sensitive path denied ({pattern}): {path}")
            }
            Violation::DeniedExtension { path, extension } => {
                write!(f, "file type .{extension} denied: {path}")
            }
            Violation::BinaryPatch { path } => write!(f, "binary patch not allowed: {path}"),
            Violation::PatchTooLarge { bytes, max } => {
                write!(f, "patch is {bytes} bytes (max {max})")
            }
            Violation::TooManyFiles { files, max } => {
                write!(f, "patch touches {files} files (max {max})")
            }
        }
    }
}

/// Outcome of validating one diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Distinct paths derived from the diff, sorted.
    pub files_touched: Vec<String>,
    pub violations: Vec<Violation>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }

    /// Human-readable messages in check order.
    pub fn messages(&self) -> Vec<String> {
        self.violations.iter().map(ToString::to_string).collect()
    }
}

/// Run every check against `diff` and collect all violations.
pub fn validate_diff(diff: &str, policy: &ValidationPolicy) -> ValidationReport {
    let mut violations = Vec::new();

    let parsed = match parse_unified_diff(diff) {
        Ok(parsed) => parsed,
        Err(err) => {
            violations.push(Violation::UnparseableDiff {
                detail: err.to_string(),
            });
            size_checks(diff, 0, policy, &mut violations);
            return ValidationReport {
                files_touched: Vec::new(),
                violations,
            };
        }
    };

    let touched = parsed.touched_paths();
    for path in &touched {
        path_checks(path, policy, &mut violations);
    }
    for file in parsed.files.iter().filter(|f| f.binary) {
        violations.push(Violation::BinaryPatch {
            path: file.target_path().unwrap_or_default().to_string(),
        });
    }
    size_checks(diff, touched.len(), policy, &mut violations);

    let files_touched: BTreeSet<String> = touched.iter().map(|p| normalize(p)).collect();
    ValidationReport {
        files_touched: files_touched.into_iter().collect(),
        violations,
    }
}

fn path_checks(path: &str, policy: &ValidationPolicy, out: &mut Vec<Violation>) {
    // Structural checks first; when one fails the allowlist answer is meaningless.
    let mut structural_ok = true;
    if is_absolute(path) {
        out.push(Violation::AbsolutePath {
            path: path.to_string(),
        });
        structural_ok = false;
    }
    if has_traversal(path) {
        out.push(Violation::PathTraversal {
            path: path.to_string(),
        });
        structural_ok = false;
    }
    let normalized = normalize(path);
    if structural_ok && !is_allowed(&normalized, policy) {
        out.push(Violation::DisallowedPath {
            path: normalized.clone(),
        });
    }

    for pattern in &policy.denied_patterns {
        if pattern.is_match(&normalized) {
            out.push(Violation::DeniedPattern {
                path: normalized.clone(),
                pattern: pattern.as_str().to_string(),
            });
        }
    }
    if let Some(ext) = extension(&normalized)
        && policy.denied_extensions.contains(&ext)
    {
        out.push(Violation::DeniedExtension {
            path: normalized,
            extension: ext,
        });
    }
}

fn size_checks(diff: &str, files: usize, policy: &ValidationPolicy, out: &mut Vec<Violation>) {
    if diff.len() > policy.max_patch_bytes {
        out.push(Violation::PatchTooLarge {
            bytes: diff.len(),
            max: policy.max_patch_bytes,
        });
    }
    if files > policy.max_files {
        out.push(Violation::TooManyFiles {
            files,
            max: policy.max_files,
        });
    }
}

fn is_absolute(path: &str) -> bool {
    let bytes = path.as_bytes();
    path.starts_with('/')
        || path.starts_with('\\')
        || path.starts_with('~')
        || (bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':')
}

fn has_traversal(path: &str) -> bool {
    path.split(['/', '\\']).any(|segment| segment == "..")
}

/// Drop `.` segments and duplicate separators; use `/` throughout.
fn normalize(path: &str) -> String {
    path.split(['/', '\\'])
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/")
}

fn is_allowed(normalized: &str, policy: &ValidationPolicy) -> bool {
    let skills = policy.skills_prefix.trim_end_matches('/');
    if !skills.is_empty()
        && normalized
            .strip_prefix(skills)
            .is_some_and(|rest| rest.starts_with('/') && rest.len() > 1)
    {
        return true;
    }
    if normalized == policy.root_instructions {
        return true;
    }
    policy.allow_nested_instructions
        && normalized.ends_with(&format!("/{}", policy.root_instructions))
}

fn extension(normalized: &str) -> Option<String> {
    let name = normalized.rsplit('/').next()?;
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}
