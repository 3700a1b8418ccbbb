//! In-memory hunk application.
//!
//! Applies a [`FilePatch`] to a file's current contents without touching the
//! filesystem. Context and removed lines must match exactly; a hunk may land at
//! an offset from its header position (the nearest exact match wins), but it
//! never overlaps an earlier hunk.

use crate::core::diff::{FilePatch, Hunk};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{path}: {message}")]
pub struct PatchConflict {
    pub path: String,
    pub message: String,
}

/// Apply `patch` to `original` (`None` when the file does not exist).
///
/// Returns the new contents, or `None` when the patch deletes the file.
pub fn apply_file_patch(
    original: Option<&str>,
    patch: &FilePatch,
) -> Result<Option<String>, PatchConflict> {
    let path = patch.target_path().unwrap_or_default().to_string();
    let conflict = |message: String| PatchConflict {
        path: path.clone(),
        message,
    };

    if patch.binary {
        return Err(conflict("binary patches cannot be applied".to_string()));
    }
    let original = match (original, patch.is_new_file()) {
        (Some(_), true) => return Err(conflict("file already exists".to_string())),
        (None, false) => return Err(conflict("file does not exist".to_string())),
        (Some(text), false) => text,
        (None, true) => "",
    };

    let crlf = original.contains("\r\n");
    let mut lines: Vec<String> = original.lines().map(str::to_string).collect();
    let mut trailing_newline = original.is_empty() || original.ends_with('\n');

    let mut offset: isize = 0;
    let mut floor = 0usize;
    for (idx, hunk) in patch.hunks.iter().enumerate() {
        let old = hunk.old_lines();
        let expected = expected_index(hunk, offset);
        let at = find_match(&lines, &old, expected, floor).ok_or_else(|| {
            conflict(format!(
                "hunk {} (@@ -{},{} +{},{} @@) does not match current contents",
                idx + 1,
                hunk.old_start,
                hunk.old_len,
                hunk.new_start,
                hunk.new_len
            ))
        })?;

        let touches_eof = at + old.len() == lines.len();
        let replacement: Vec<String> = hunk.new_lines().into_iter().map(str::to_string).collect();
        let inserted = replacement.len();
        lines.splice(at..at + old.len(), replacement);

        if touches_eof && (hunk.old_missing_newline || hunk.new_missing_newline) {
            trailing_newline = !hunk.new_missing_newline;
        }
        offset += inserted as isize - old.len() as isize;
        floor = at + inserted;
    }

    if patch.is_deletion() {
        if !lines.is_empty() {
            return Err(conflict(
                "deletion leaves content behind (file changed since diff was generated)"
                    .to_string(),
            ));
        }
        return Ok(None);
    }

    let sep = if crlf { "\r\n" } else { "\n" };
    let mut out = lines.join(sep);
    if trailing_newline && !lines.is_empty() {
        out.push_str(sep);
    }
    Ok(Some(out))
}

fn expected_index(hunk: &Hunk, offset: isize) -> usize {
    // For pure insertions the header names the line *after which* to insert.
    let base = if hunk.old_len == 0 {
        hunk.old_start
    } else {
        hunk.old_start.saturating_sub(1)
    };
    (base as isize + offset).max(0) as usize
}

/// Find `needle` in `lines` at or after `floor`, preferring positions closest to `expected`.
fn find_match(lines: &[String], needle: &[&str], expected: usize, floor: usize) -> Option<usize> {
    if needle.len() > lines.len() {
        return None;
    }
    let last_start = lines.len() - needle.len();
    if floor > last_start {
        return None;
    }
    let matches_at = |start: usize| {
        lines[start..start + needle.len()]
            .iter()
            .zip(needle)
            .all(|(have, want)| have == want)
    };

    let expected = expected.clamp(floor, last_start);
    let span = (expected - floor).max(last_start - expected);
    for delta in 0..=span {
        if let Some(start) = expected.checked_add(delta)
            && start <= last_start
            && matches_at(start)
        {
            return Some(start);
        }
        if delta > 0
            && let Some(start) = expected.checked_sub(delta)
            && start >= floor
            && matches_at(start)
        {
            return Some(start);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::diff::parse_unified_diff;

    fn patch(text: &str) -> FilePatch {
        parse_unified_diff(text)
            .expect("parse")
            .files
            .into_iter()
            .next()
            .expect("one file")
    }

    #[test]
    fn applies_simple_replacement() {
        let p = patch("--- a/f\n+++ b/f\n@@ -1,3 +1,3 @@\n a\n-b\n+B\n c\n");
        let out = apply_file_patch(Some("a\nb\nc\n"), &p).expect("apply");
        assert_eq!(out.as_deref(), Some("a\nB\nc\n"));
    }

    #[test]
    fn applies_at_offset_when_lines_shifted() {
        let p = patch("--- a/f\n+++ b/f\n@@ -1,2 +1,2 @@\n x\n-y\n+Y\n");
        let out = apply_file_patch(Some("header\nmore\nx\ny\n"), &p).expect("apply");
        assert_eq!(out.as_deref(), Some("header\nmore\nx\nY\n"));
    }

    #[test]
    fn context_mismatch_is_a_conflict() {
        let p = patch("--- a/f\n+++ b/f\n@@ -1,2 +1,2 @@\n a\n-b\n+B\n");
        let err = apply_file_patch(Some("a\nchanged\n"), &p).unwrap_err();
        assert!(err.message.contains("does not match"));
        assert_eq!(err.path, "f");
    }

    #[test]
    fn creates_new_file() {
        let p = patch("--- /dev/null\n+++ b/new.md\n@@ -0,0 +1,2 @@\n+one\n+two\n");
        let out = apply_file_patch(None, &p).expect("apply");
        assert_eq!(out.as_deref(), Some("one\ntwo\n"));
    }

    #[test]
    fn new_file_must_not_exist() {
        let p = patch("--- /dev/null\n+++ b/new.md\n@@ -0,0 +1 @@\n+one\n");
        assert!(apply_file_patch(Some("already here\n"), &p).is_err());
    }

    #[test]
    fn modifying_missing_file_is_a_conflict() {
        let p = patch("--- a/f\n+++ b/f\n@@ -1 +1 @@\n-a\n+b\n");
        let err = apply_file_patch(None, &p).unwrap_err();
        assert!(err.message.contains("does not exist"));
    }

    #[test]
    fn deletes_file() {
        let p = patch("--- a/old\n+++ /dev/null\n@@ -1,2 +0,0 @@\n-a\n-b\n");
        assert_eq!(apply_file_patch(Some("a\nb\n"), &p).expect("apply"), None);
    }

    #[test]
    fn appends_at_end_of_file() {
        let p = patch("--- a/f\n+++ b/f\n@@ -2,0 +3 @@\n+c\n");
        let out = apply_file_patch(Some("a\nb\n"), &p).expect("apply");
        assert_eq!(out.as_deref(), Some("a\nb\nc\n"));
    }

    #[test]
    fn honors_no_newline_marker_on_new_side() {
        let p = patch("--- a/f\n+++ b/f\n@@ -1 +1 @@\n-a\n+b\n\\ No newline at end of file\n");
        let out = apply_file_patch(Some("a\n"), &p).expect("apply");
        assert_eq!(out.as_deref(), Some("b"));
    }

    #[test]
    fn preserves_crlf_line_endings() {
        let p = patch("--- a/f\n+++ b/f\n@@ -1,2 +1,2 @@\n a\n-b\n+B\n");
        let out = apply_file_patch(Some("a\r\nb\r\n"), &p).expect("apply");
        assert_eq!(out.as_deref(), Some("a\r\nB\r\n"));
    }

    #[test]
    fn multiple_hunks_apply_in_order() {
        let p = patch(
            "--- a/f\n+++ b/f\n@@ -1,2 +1,2 @@\n-1\n+one\n 2\n@@ -5,2 +5,2 @@\n 5\n-6\n+six\n",
        );
        let out = apply_file_patch(Some("1\n2\n3\n4\n5\n6\n"), &p).expect("apply");
        assert_eq!(out.as_deref(), Some("one\n2\n3\n4\n5\nsix\n"));
    }
}
