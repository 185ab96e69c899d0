//! Helpers for sanitizing user-supplied names and log fields.
//!
//! Uploaded file names end up on disk and in tracing spans; neither should
//! carry directory components or the full storage layout.

use std::path::Path;

const MAX_FILE_NAME_LEN: usize = 100;
const FALLBACK_FILE_NAME: &str = "upload";

/// Returns only the filename component of a path (no directory).
///
/// Safe for span fields: reveals the file name, never the storage layout.
pub fn redact_path(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("<unknown>")
        .to_string()
}

/// Reduces a client-supplied file name to a safe single path component.
///
/// Directory parts (either separator) are dropped, anything outside
/// `[A-Za-z0-9._-]` becomes `_`, leading dots are stripped and the result
/// is capped in length while keeping the extension.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);

    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');

    if cleaned.is_empty() {
        return FALLBACK_FILE_NAME.to_string();
    }
    if cleaned.len() <= MAX_FILE_NAME_LEN {
        return cleaned.to_string();
    }

    // All characters are ASCII here, so byte slicing is safe.
    match cleaned.rfind('.') {
        Some(dot) if cleaned.len() - dot < MAX_FILE_NAME_LEN / 2 => {
            let ext = &cleaned[dot..];
            format!("{}{}", &cleaned[..MAX_FILE_NAME_LEN - ext.len()], ext)
        }
        _ => cleaned[..MAX_FILE_NAME_LEN].to_string(),
    }
}

/// Lower-cased extension of a client-supplied file name, without the dot.
pub fn file_extension(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let (stem, ext) = base.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}
