//! Export destinations for run output.
//!
//! [`Exporter`] is the seam; [`LocalDirExporter`] is the shipped
//! destination and [`archive`] builds the single-file bundle archive.

pub mod archive;
pub mod local;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::ArtifactBundle;

pub use archive::{archive_name, pack, unpack, ArchiveEntry, ArchiveError, ArchiveManifest};
pub use local::LocalDirExporter;

/// Errors from an export destination.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("artifact name {0:?} escapes the export root")]
    UnsafeName(String),

    #[error("destination rejected the export: {0}")]
    Rejected(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ExportError>;

/// A destination for run output.
///
/// Destinations are independent: one failing never prevents the orchestrator
/// from trying the others.
#[async_trait]
pub trait Exporter: Send + Sync {
    /// Short label used in logs and in the run report.
    fn name(&self) -> &str;

    /// Store every artifact of the bundle.
    async fn export_bundle(&self, bundle: &ArtifactBundle) -> Result<()>;

    /// Store a pre-built archive of the bundle under `name`.
    async fn export_archive(&self, name: &str, bytes: &[u8]) -> Result<()>;
}

/// Reject names that are absolute or climb out of the destination root.
pub(crate) fn check_relative_name(name: &str) -> Result<()> {
    let unsafe_name = name.is_empty()
        || name.starts_with('/')
        || name.contains('\\')
        || name.split('/').any(|part| part == ".." || part.is_empty());
    if unsafe_name {
        return Err(ExportError::UnsafeName(name.to_string()));
    }
    Ok(())
}
