//! Locating a function's defining file and source text.
//!
//! Rust has no runtime reflection over function bodies, so a wrappable
//! function is described by a [`SourceLocatable`] value. [`FunctionSource`]
//! builds one either from explicit text or by reading the definition back out
//! of its source file, which is what [`source_of!`](crate::source_of) does.

use std::path::{Path, PathBuf};

use crate::error::MemoError;

/// Capability every wrappable function must provide.
pub trait SourceLocatable {
    /// Canonical (absolute, symlink-resolved) path of the defining file.
    fn source_path(&self) -> &Path;

    /// Fully qualified function name, e.g. `my_crate::io::load`.
    fn qualified_name(&self) -> &str;

    /// Exact text of the function definition.
    fn source_text(&self) -> &str;
}

/// Returns the canonical path of the file that defines `source`.
pub fn func_path(source: &impl SourceLocatable) -> &Path {
    source.source_path()
}

/// Source description of one function definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSource {
    path: PathBuf,
    name: String,
    text: String,
}

impl FunctionSource {
    /// Describes a function whose definition text is supplied by the caller.
    ///
    /// `file` must exist; it is canonicalized so the same file always maps to
    /// the same cache location.
    pub fn new(
        file: impl AsRef<Path>,
        qualified_name: impl Into<String>,
        text: impl Into<String>,
    ) -> Result<Self, MemoError> {
        let name = qualified_name.into();
        let path = canonical_source(file.as_ref(), &name)?;
        let text = text.into();
        if text.trim().is_empty() {
            return Err(MemoError::SourceUnavailable {
                name,
                path,
                reason: "empty source text".to_string(),
            });
        }
        Ok(Self { path, name, text })
    }

    /// Describes a function by reading its definition out of `file`.
    ///
    /// The definition is found by the last `::` segment of `qualified_name`.
    /// When the file holds several functions with that name the first one
    /// with a body wins.
    pub fn locate(
        file: impl AsRef<Path>,
        qualified_name: impl Into<String>,
    ) -> Result<Self, MemoError> {
        let name = qualified_name.into();
        let path = canonical_source(file.as_ref(), &name)?;
        let content = std::fs::read_to_string(&path).map_err(|e| MemoError::SourceUnavailable {
            name: name.clone(),
            path: path.clone(),
            reason: e.to_string(),
        })?;
        let simple = name.rsplit("::").next().unwrap_or(&name);
        let Some(text) = extract_fn(&content, simple) else {
            return Err(MemoError::SourceUnavailable {
                reason: format!("no definition of `fn {simple}` found"),
                name,
                path,
            });
        };
        let text = text.to_string();
        Ok(Self { path, name, text })
    }
}

impl SourceLocatable for FunctionSource {
    fn source_path(&self) -> &Path {
        &self.path
    }

    fn qualified_name(&self) -> &str {
        &self.name
    }

    fn source_text(&self) -> &str {
        &self.text
    }
}

fn canonical_source(file: &Path, name: &str) -> Result<PathBuf, MemoError> {
    std::fs::canonicalize(file).map_err(|e| MemoError::SourceUnavailable {
        name: name.to_string(),
        path: file.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Resolves a `file!()` path for the crate whose manifest lives in `manifest_dir`.
///
/// `file!()` is relative to the workspace root for workspace members and to
/// the package root otherwise, while tests and binaries may run from either.
/// The first existing candidate among `manifest_dir` and its ancestors wins.
pub fn resolve_source_file(manifest_dir: &str, file: &str) -> PathBuf {
    let file = Path::new(file);
    if file.is_absolute() {
        return file.to_path_buf();
    }
    Path::new(manifest_dir)
        .ancestors()
        .map(|dir| dir.join(file))
        .find(|candidate| candidate.is_file())
        .unwrap_or_else(|| file.to_path_buf())
}

/// Builds a [`FunctionSource`] for a function defined in the current file.
///
/// ```ignore
/// fn load(args: &CallArgs) -> std::io::Result<String> { /* ... */ }
///
/// let source = freshen_cache::source_of!(load)?;
/// ```
#[macro_export]
macro_rules! source_of {
    ($name:ident) => {
        $crate::FunctionSource::locate(
            $crate::source::resolve_source_file(env!("CARGO_MANIFEST_DIR"), file!()),
            concat!(module_path!(), "::", stringify!($name)),
        )
    };
}

/// Finds the text of the first `fn <name>` definition with a body.
///
/// Comments and literals are skipped, so a `fn <name>` mentioned in either
/// does not count. The returned slice starts at the beginning of the line
/// holding `fn` (so `pub`, `async` and friends are included) and ends at the
/// closing brace.
fn extract_fn<'a>(content: &'a str, name: &str) -> Option<&'a str> {
    let bytes = content.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if let Some(next) = skip_trivia(content, i) {
            i = next;
            continue;
        }
        if bytes[i..].starts_with(b"fn") && (i == 0 || !is_ident_byte(bytes[i - 1])) {
            let body = match_name(content, i + 2, name).and_then(|after| body_end(content, after));
            if let Some(end) = body {
                let line_start = content[..i].rfind('\n').map_or(0, |n| n + 1);
                return Some(&content[line_start..=end]);
            }
        }
        i += 1;
    }
    None
}

/// Matches whitespace then exactly `name` at `from`; returns the index after it.
fn match_name(content: &str, from: usize, name: &str) -> Option<usize> {
    let rest = content.get(from..)?;
    let trimmed = rest.trim_start();
    if trimmed.len() == rest.len() || !trimmed.starts_with(name) {
        return None;
    }
    let after = from + (rest.len() - trimmed.len()) + name.len();
    match content.as_bytes().get(after) {
        Some(&b) if is_ident_byte(b) => None,
        _ => Some(after),
    }
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// If a comment or literal starts at `i`, returns the index just past it.
fn skip_trivia(content: &str, i: usize) -> Option<usize> {
    let bytes = content.as_bytes();
    let token_start = i == 0 || !is_ident_byte(bytes[i - 1]);
    match bytes[i] {
        b'/' if bytes.get(i + 1) == Some(&b'/') => {
            Some(content[i..].find('\n').map_or(bytes.len(), |n| i + n))
        }
        b'/' if bytes.get(i + 1) == Some(&b'*') => Some(skip_block_comment(bytes, i + 2)),
        b'"' => Some(skip_string(bytes, i + 1)),
        b'r' if token_start => skip_raw_string(bytes, i + 1),
        b'b' if token_start && bytes.get(i + 1) == Some(&b'r') => skip_raw_string(bytes, i + 2),
        b'\'' => Some(skip_char_literal(content, i + 1)),
        _ => None,
    }
}

/// Returns the byte index of the brace closing the body that starts after
/// `from`, or `None` for a bodiless declaration or unbalanced input.
fn body_end(content: &str, from: usize) -> Option<usize> {
    let bytes = content.as_bytes();
    let mut depth = 0usize;
    let mut i = from;
    while i < bytes.len() {
        if let Some(next) = skip_trivia(content, i) {
            i = next;
            continue;
        }
        match bytes[i] {
            b';' if depth == 0 => return None,
            b'{' => depth += 1,
            b'}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

fn skip_block_comment(bytes: &[u8], mut i: usize) -> usize {
    let mut depth = 1;
    while i < bytes.len() {
        if bytes[i] == b'/' && bytes.get(i + 1) == Some(&b'*') {
            depth += 1;
            i += 2;
        } else if bytes[i] == b'*' && bytes.get(i + 1) == Some(&b'/') {
            depth -= 1;
            i += 2;
            if depth == 0 {
                return i;
            }
        } else {
            i += 1;
        }
    }
    i
}

fn skip_string(bytes: &[u8], mut i: usize) -> usize {
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'"' => return i + 1,
            _ => i += 1,
        }
    }
    i
}

/// `i` points just past the `r`. Returns `None` if this is not a raw string.
fn skip_raw_string(bytes: &[u8], mut i: usize) -> Option<usize> {
    let mut hashes = 0;
    while bytes.get(i) == Some(&b'#') {
        hashes += 1;
        i += 1;
    }
    if bytes.get(i) != Some(&b'"') {
        return None;
    }
    i += 1;
    while i < bytes.len() {
        if bytes[i] == b'"' {
            let closing = &bytes[i + 1..];
            if closing.len() >= hashes && closing[..hashes].iter().all(|&b| b == b'#') {
                return Some(i + 1 + hashes);
            }
        }
        i += 1;
    }
    Some(i)
}

/// `i` points just past a `'`. Lifetimes and labels are left alone.
fn skip_char_literal(content: &str, i: usize) -> usize {
    let bytes = content.as_bytes();
    if bytes.get(i) == Some(&b'\\') {
        // skip the escaped character itself so `'\''` closes correctly
        return content
            .get(i + 2..)
            .and_then(|s| s.find('\''))
            .map_or(bytes.len(), |n| i + 2 + n + 1);
    }
    match content.get(i..).and_then(|s| s.chars().next()) {
        Some(c) if bytes.get(i + c.len_utf8()) == Some(&b'\'') => i + c.len_utf8() + 1,
        _ => i,
    }
}
