use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Engine options. Every field has a default so a bare root is enough to open a store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Options {
    /// Storage root holding spaces, uploads and the propagation journal.
    pub root: PathBuf,

    /// Maintain accumulated subtree sizes on containers.
    pub treesize_accounting: bool,
    /// Maintain accumulated subtree modification times on containers.
    pub treetime_accounting: bool,
    /// Overwrites replace content without keeping a revision snapshot.
    pub disable_versioning: bool,
    /// Leave finished uploads in processing until an external consumer reports back.
    pub async_postprocessing: bool,

    /// Bounded wait for a node's attribute lock before giving up.
    pub lock_timeout_ms: u64,
    pub lock_poll_ms: u64,

    /// Sessions older than this are removed by `UploadStore::clean_expired`.
    pub upload_expiration_secs: i64,
    /// Attempts made to publish a lifecycle event before reporting failure.
    pub publish_retries: u32,
    /// Size of the CLI's blocking thread pool that storage calls run on.
    pub max_concurrency: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            root: PathBuf::from("spacefs_data"),
            treesize_accounting: true,
            treetime_accounting: true,
            disable_versioning: false,
            async_postprocessing: false,
            lock_timeout_ms: 5_000,
            lock_poll_ms: 10,
            upload_expiration_secs: 86_400,
            publish_retries: 3,
            max_concurrency: 5,
        }
    }
}

/// Partial options read from a file or the environment. Unset values inherit.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OptionsOverride {
    pub root: Option<PathBuf>,
    pub treesize_accounting: Option<bool>,
    pub treetime_accounting: Option<bool>,
    pub disable_versioning: Option<bool>,
    pub async_postprocessing: Option<bool>,
    pub lock_timeout_ms: Option<u64>,
    pub lock_poll_ms: Option<u64>,
    pub upload_expiration_secs: Option<i64>,
    pub publish_retries: Option<u32>,
    pub max_concurrency: Option<usize>,
}

impl Options {
    pub fn with_root<P: AsRef<Path>>(root: P) -> Self {
        Self { root: root.as_ref().to_path_buf(), ..Default::default() }
    }

    /// Build effective options from a base plus an override layer.
    pub fn from_layers(base: &Options, ov: &OptionsOverride) -> Self {
        Self {
            root: ov.root.clone().unwrap_or_else(|| base.root.clone()),
            treesize_accounting: ov.treesize_accounting.unwrap_or(base.treesize_accounting),
            treetime_accounting: ov.treetime_accounting.unwrap_or(base.treetime_accounting),
            disable_versioning: ov.disable_versioning.unwrap_or(base.disable_versioning),
            async_postprocessing: ov.async_postprocessing.unwrap_or(base.async_postprocessing),
            lock_timeout_ms: ov.lock_timeout_ms.unwrap_or(base.lock_timeout_ms),
            lock_poll_ms: ov.lock_poll_ms.unwrap_or(base.lock_poll_ms).max(1),
            upload_expiration_secs: ov.upload_expiration_secs.unwrap_or(base.upload_expiration_secs),
            publish_retries: ov.publish_retries.unwrap_or(base.publish_retries).max(1),
            max_concurrency: ov.max_concurrency.unwrap_or(base.max_concurrency),
        }
    }

    /// Load an override layer from a JSON file and apply it on top of `self`.
    pub fn with_json_file<P: AsRef<Path>>(self, path: P) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        let ov: OptionsOverride = serde_json::from_slice(&bytes)
            .map_err(|e| Error::invalid(format!("config {}: {}", path.as_ref().display(), e)))?;
        Ok(Options::from_layers(&self, &ov))
    }

    /// Apply `SPACEFS_*` environment overrides.
    pub fn with_env_overrides(self) -> Result<Self> {
        let ov = overrides_from_vars(|k| std::env::var(k).ok())?;
        Ok(Options::from_layers(&self, &ov))
    }

    pub fn lock_timeout(&self) -> std::time::Duration { std::time::Duration::from_millis(self.lock_timeout_ms) }
    pub fn lock_poll(&self) -> std::time::Duration { std::time::Duration::from_millis(self.lock_poll_ms.max(1)) }
}

fn parse_bool(key: &str, v: &str) -> Result<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::invalid(format!("{}: expected boolean, got '{}'", key, v))),
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, v: &str) -> Result<T> {
    v.trim().parse::<T>().map_err(|_| Error::invalid(format!("{}: expected number, got '{}'", key, v)))
}

pub(crate) fn overrides_from_vars<F: Fn(&str) -> Option<String>>(get: F) -> Result<OptionsOverride> {
    let mut ov = OptionsOverride::default();
    if let Some(v) = get("SPACEFS_ROOT") { ov.root = Some(PathBuf::from(v)); }
    if let Some(v) = get("SPACEFS_TREESIZE_ACCOUNTING") { ov.treesize_accounting = Some(parse_bool("SPACEFS_TREESIZE_ACCOUNTING", &v)?); }
    if let Some(v) = get("SPACEFS_TREETIME_ACCOUNTING") { ov.treetime_accounting = Some(parse_bool("SPACEFS_TREETIME_ACCOUNTING", &v)?); }
    if let Some(v) = get("SPACEFS_DISABLE_VERSIONING") { ov.disable_versioning = Some(parse_bool("SPACEFS_DISABLE_VERSIONING", &v)?); }
    if let Some(v) = get("SPACEFS_ASYNC_POSTPROCESSING") { ov.async_postprocessing = Some(parse_bool("SPACEFS_ASYNC_POSTPROCESSING", &v)?); }
    if let Some(v) = get("SPACEFS_LOCK_TIMEOUT_MS") { ov.lock_timeout_ms = Some(parse_num("SPACEFS_LOCK_TIMEOUT_MS", &v)?); }
    if let Some(v) = get("SPACEFS_UPLOAD_EXPIRATION_SECS") { ov.upload_expiration_secs = Some(parse_num("SPACEFS_UPLOAD_EXPIRATION_SECS", &v)?); }
    if let Some(v) = get("SPACEFS_PUBLISH_RETRIES") { ov.publish_retries = Some(parse_num("SPACEFS_PUBLISH_RETRIES", &v)?); }
    if let Some(v) = get("SPACEFS_MAX_CONCURRENCY") { ov.max_concurrency = Some(parse_num("SPACEFS_MAX_CONCURRENCY", &v)?); }
    Ok(ov)
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod config_tests;
