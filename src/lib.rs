pub mod error;
pub mod config;
pub mod identity;
pub mod paths;
pub mod metadata;
pub mod node;
pub mod lookup;
pub mod permissions;
pub mod blobstore;
pub mod tree;
pub mod events;
pub mod metrics;
pub mod upload;
pub mod fs;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::{Error, Result};
pub use fs::Filesystem;
