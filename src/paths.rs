use unicode_normalization::UnicodeNormalization;

use crate::error::{Error, Result};

/// Normalize a UTF-8 string to NFC.
pub fn normalize_nfc(input: &str) -> String {
    input.nfc().collect::<String>()
}

/// Validate a single resource name:
/// - not empty, not '.' or '..'
/// - no '/' and no NUL
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::invalid("name cannot be empty"));
    }
    if name == "." || name == ".." {
        return Err(Error::invalid("'.' and '..' are not allowed as names"));
    }
    if name.contains('/') {
        return Err(Error::invalid(format!("name '{}' contains a path separator", name)));
    }
    if name.chars().any(|c| c == '\u{0000}') {
        return Err(Error::invalid("name cannot contain NUL characters"));
    }
    Ok(())
}

/// Split a path relative to some starting node into NFC-normalized segments.
/// A leading "./" or "/" and repeated separators are tolerated; "." segments are skipped.
pub fn split_relative(path: &str) -> Result<Vec<String>> {
    if path.chars().any(|c| c == '\u{0000}') {
        return Err(Error::invalid("path cannot contain NUL characters"));
    }
    let mut out = Vec::new();
    for seg in path.split('/') {
        if seg.is_empty() || seg == "." {
            continue;
        }
        if seg == ".." {
            return Err(Error::invalid("'..' segments are not allowed"));
        }
        out.push(normalize_nfc(seg));
    }
    Ok(out)
}

/// Split a path into its parent part and final name.
pub fn split_dir_name(path: &str) -> Result<(String, String)> {
    let mut segs = split_relative(path)?;
    let name = segs.pop().ok_or_else(|| Error::invalid("path has no final segment"))?;
    Ok((segs.join("/"), name))
}

pub fn join(dir: &str, name: &str) -> String {
    let d = dir.trim_end_matches('/');
    if d.is_empty() || d == "." { format!("/{}", name) } else { format!("{}/{}", d, name) }
}
