//! Unified diff parser.
//!
//! Accepts both `git diff` output (with `diff --git` headers and extended
//! header lines) and plain `diff -u` output. Parsing is strict about hunk
//! bodies: a hunk whose line counts do not match its header is an error, since
//! applying it would be guesswork.

use std::sync::LazyLock;

use regex::Regex;

static HUNK_HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@").expect("hunk header regex")
});

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("line {line}: {message}")]
pub struct DiffParseError {
    pub line: usize,
    pub message: String,
}

fn parse_error(line: usize, message: impl Into<String>) -> DiffParseError {
    DiffParseError {
        line,
        message: message.into(),
    }
}

/// One line of a hunk body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HunkLine {
    Context(String),
    Remove(String),
    Add(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    pub old_start: usize,
    pub old_len: usize,
    pub new_start: usize,
    pub new_len: usize,
    pub lines: Vec<HunkLine>,
    /// Old side ends without a trailing newline (`\ No newline at end of file`).
    pub old_missing_newline: bool,
    /// New side ends without a trailing newline.
    pub new_missing_newline: bool,
}

impl Hunk {
    /// Lines the hunk expects to find (context + removals), in order.
    pub fn old_lines(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|line| match line {
                HunkLine::Context(s) | HunkLine::Remove(s) => Some(s.as_str()),
                HunkLine::Add(_) => None,
            })
            .collect()
    }

    /// Lines the hunk leaves behind (context + additions), in order.
    pub fn new_lines(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|line| match line {
                HunkLine::Context(s) | HunkLine::Add(s) => Some(s.as_str()),
                HunkLine::Remove(_) => None,
            })
            .collect()
    }
}

/// All changes to a single file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilePatch {
    /// Source path with the `a/` prefix stripped; `None` for `/dev/null`.
    pub old_path: Option<String>,
    /// Destination path with the `b/` prefix stripped; `None` for `/dev/null`.
    pub new_path: Option<String>,
    pub hunks: Vec<Hunk>,
    /// Binary patch or "Binary files differ" marker.
    pub binary: bool,
    saw_old_header: bool,
    saw_new_header: bool,
}

impl FilePatch {
    pub fn is_new_file(&self) -> bool {
        self.old_path.is_none() && self.new_path.is_some()
    }

    pub fn is_deletion(&self) -> bool {
        self.new_path.is_none() && self.old_path.is_some()
    }

    /// Every distinct path this patch reads or writes.
    pub fn paths(&self) -> Vec<&str> {
        let mut out = Vec::new();
        if let Some(old) = &self.old_path {
            out.push(old.as_str());
        }
        if let Some(new) = &self.new_path
            && Some(new) != self.old_path.as_ref()
        {
            out.push(new.as_str());
        }
        out
    }

    /// Path the patch writes to (or removes, for deletions).
    pub fn target_path(&self) -> Option<&str> {
        self.new_path.as_deref().or(self.old_path.as_deref())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedDiff {
    pub files: Vec<FilePatch>,
}

impl ParsedDiff {
    /// Distinct touched paths, in first-seen order.
    pub fn touched_paths(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for file in &self.files {
            for path in file.paths() {
                if !out.iter().any(|p| p == path) {
                    out.push(path.to_string());
                }
            }
        }
        out
    }
}

/// Parse unified diff text into per-file patches.
pub fn parse_unified_diff(text: &str) -> Result<ParsedDiff, DiffParseError> {
    let lines: Vec<&str> = text.lines().collect();
    let mut files: Vec<FilePatch> = Vec::new();
    let mut current: Option<FilePatch> = None;
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];
        let lineno = i + 1;

        if let Some(rest) = line.strip_prefix("diff --git ") {
            if let Some(done) = current.take() {
                files.push(finish_file(done, lineno)?);
            }
            let (old, new) = split_git_header(rest);
            current = Some(FilePatch {
                old_path: old,
                new_path: new,
                ..FilePatch::default()
            });
            i += 1;
            continue;
        }

        if let Some(rest) = line.strip_prefix("--- ") {
            let starts_new = current
                .as_ref()
                .is_none_or(|f| f.saw_old_header || !f.hunks.is_empty());
            if starts_new && let Some(done) = current.take() {
                files.push(finish_file(done, lineno)?);
            }
            let file = current.get_or_insert_with(FilePatch::default);
            file.old_path = strip_side_prefix(rest, "a/");
            file.saw_old_header = true;
            i += 1;
            continue;
        }

        if let Some(rest) = line.strip_prefix("+++ ") {
            let file = current
                .as_mut()
                .filter(|f| f.saw_old_header)
                .ok_or_else(|| parse_error(lineno, "'+++' header without preceding '---'"))?;
            file.new_path = strip_side_prefix(rest, "b/");
            file.saw_new_header = true;
            i += 1;
            continue;
        }

        if line.starts_with("@@") {
            let file = current
                .as_mut()
                .filter(|f| f.saw_old_header && f.saw_new_header)
                .ok_or_else(|| parse_error(lineno, "hunk without file headers"))?;
            let (hunk, consumed) = parse_hunk(&lines, i)?;
            file.hunks.push(hunk);
            i += consumed;
            continue;
        }

        if let Some(file) = current.as_mut() {
            if line.starts_with("Binary files ") || line == "GIT binary patch" {
                file.binary = true;
            } else if let Some(path) = line.strip_prefix("rename from ") {
                file.old_path = Some(unquote(path.trim()));
            } else if let Some(path) = line.strip_prefix("rename to ") {
                file.new_path = Some(unquote(path.trim()));
            } else if line.starts_with("new file mode") {
                file.old_path = None;
            } else if line.starts_with("deleted file mode") {
                file.new_path = None;
            }
        }
        // Anything else (index lines, mode lines, preamble text) carries no content.
        i += 1;
    }

    if let Some(done) = current.take() {
        files.push(finish_file(done, lines.len())?);
    }
    if files.is_empty() {
        return Err(parse_error(0, "no file changes found"));
    }
    Ok(ParsedDiff { files })
}

fn finish_file(file: FilePatch, lineno: usize) -> Result<FilePatch, DiffParseError> {
    if file.old_path.is_none() && file.new_path.is_none() {
        return Err(parse_error(lineno, "file patch has no paths"));
    }
    if file.saw_old_header && file.hunks.is_empty() && !file.binary {
        return Err(parse_error(
            lineno,
            format!(
                "file '{}' has headers but no hunks",
                file.target_path().unwrap_or_default()
            ),
        ));
    }
    Ok(file)
}

fn parse_hunk(lines: &[&str], start: usize) -> Result<(Hunk, usize), DiffParseError> {
    let header = lines[start];
    let caps = HUNK_HEADER_RE
        .captures(header)
        .ok_or_else(|| parse_error(start + 1, format!("malformed hunk header '{header}'")))?;
    let num = |idx: usize, default: usize| -> usize {
        caps.get(idx)
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(default)
    };
    let mut hunk = Hunk {
        old_start: num(1, 0),
        old_len: num(2, 1),
        new_start: num(3, 0),
        new_len: num(4, 1),
        lines: Vec::new(),
        old_missing_newline: false,
        new_missing_newline: false,
    };

    let (mut old_seen, mut new_seen) = (0usize, 0usize);
    let mut i = start + 1;
    while old_seen < hunk.old_len || new_seen < hunk.new_len {
        let Some(&line) = lines.get(i) else {
            return Err(parse_error(
                i,
                format!("hunk truncated (expected -{} +{})", hunk.old_len, hunk.new_len),
            ));
        };
        let lineno = i + 1;
        let body = |s: &str| s.get(1..).unwrap_or_default().to_string();
        match line.chars().next() {
            Some(' ') => {
                hunk.lines.push(HunkLine::Context(body(line)));
                old_seen += 1;
                new_seen += 1;
            }
            // Some generators strip the single space from blank context lines.
            None => {
                hunk.lines.push(HunkLine::Context(String::new()));
                old_seen += 1;
                new_seen += 1;
            }
            Some('-') => {
                hunk.lines.push(HunkLine::Remove(body(line)));
                old_seen += 1;
            }
            Some('+') => {
                hunk.lines.push(HunkLine::Add(body(line)));
                new_seen += 1;
            }
            Some('\\') => mark_missing_newline(&mut hunk),
            _ => {
                return Err(parse_error(
                    lineno,
                    format!("unexpected line in hunk: '{line}'"),
                ));
            }
        }
        if old_seen > hunk.old_len || new_seen > hunk.new_len {
            return Err(parse_error(lineno, "hunk body longer than its header"));
        }
        i += 1;
    }

    // A trailing "\ No newline" marker follows the last counted line.
    if let Some(line) = lines.get(i)
        && line.starts_with('\\')
    {
        mark_missing_newline(&mut hunk);
        i += 1;
    }

    Ok((hunk, i - start))
}

fn mark_missing_newline(hunk: &mut Hunk) {
    match hunk.lines.last() {
        Some(HunkLine::Remove(_)) => hunk.old_missing_newline = true,
        Some(HunkLine::Add(_)) => hunk.new_missing_newline = true,
        Some(HunkLine::Context(_)) => {
            hunk.old_missing_newline = true;
            hunk.new_missing_newline = true;
        }
        None => {}
    }
}

/// Split `a/foo b/foo` from a `diff --git` header. Paths with spaces are
/// ambiguous here; the `---`/`+++` headers override when present.
fn split_git_header(rest: &str) -> (Option<String>, Option<String>) {
    let rest = rest.trim();
    if let Some(idx) = rest.find(" b/") {
        let old = strip_side_prefix(&rest[..idx], "a/");
        let new = strip_side_prefix(&rest[idx + 1..], "b/");
        return (old, new);
    }
    let mut parts = rest.split_whitespace();
    let old = parts.next().and_then(|p| strip_side_prefix(p, "a/"));
    let new = parts.next().and_then(|p| strip_side_prefix(p, "b/"));
    (old, new)
}

fn strip_side_prefix(raw: &str, prefix: &str) -> Option<String> {
    // `diff -u` appends a tab and timestamp after the path.
    let path = raw.split('\t').next().unwrap_or_default().trim_end();
    let path = unquote(path);
    if path == "/dev/null" {
        return None;
    }
    Some(path.strip_prefix(prefix).unwrap_or(&path).to_string())
}

fn unquote(raw: &str) -> String {
    match raw.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        Some(inner) => inner.replace("\\\"", "\"").replace("\\\\", "\\"),
        None => raw.to_string(),
    }
}
