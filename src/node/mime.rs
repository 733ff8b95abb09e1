use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::collections::HashMap;

pub const DIRECTORY_MIME: &str = "httpd/unix-directory";
pub const DEFAULT_MIME: &str = "application/octet-stream";

static REGISTRY: Lazy<RwLock<HashMap<String, String>>> = Lazy::new(|| {
    let pairs = [
        ("txt", "text/plain"),
        ("md", "text/markdown"),
        ("html", "text/html"),
        ("htm", "text/html"),
        ("css", "text/css"),
        ("csv", "text/csv"),
        ("js", "application/javascript"),
        ("json", "application/json"),
        ("xml", "application/xml"),
        ("pdf", "application/pdf"),
        ("zip", "application/zip"),
        ("gz", "application/gzip"),
        ("tar", "application/x-tar"),
        ("png", "image/png"),
        ("jpg", "image/jpeg"),
        ("jpeg", "image/jpeg"),
        ("gif", "image/gif"),
        ("svg", "image/svg+xml"),
        ("webp", "image/webp"),
        ("mp3", "audio/mpeg"),
        ("mp4", "video/mp4"),
        ("odt", "application/vnd.oasis.opendocument.text"),
        ("ods", "application/vnd.oasis.opendocument.spreadsheet"),
        ("docx", "application/vnd.openxmlformats-officedocument.wordprocessingml.document"),
        ("xlsx", "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"),
        ("pptx", "application/vnd.openxmlformats-officedocument.presentationml.presentation"),
    ];
    RwLock::new(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect())
});

/// Register or replace the mime type for an extension.
pub fn register_mime(ext: &str, mime: &str) {
    REGISTRY.write().insert(ext.trim_start_matches('.').to_ascii_lowercase(), mime.to_string());
}

/// Detect a mime type from the name's extension.
pub fn detect(is_container: bool, name: &str) -> String {
    if is_container {
        return DIRECTORY_MIME.to_string();
    }
    let ext = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => ext.to_ascii_lowercase(),
        _ => return DEFAULT_MIME.to_string(),
    };
    REGISTRY.read().get(&ext).cloned().unwrap_or_else(|| DEFAULT_MIME.to_string())
}
