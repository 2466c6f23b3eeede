//! Export to a directory on the node.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use super::{check_relative_name, ExportError, Exporter, Result};
use crate::domain::ArtifactBundle;

/// Writes run output below a local directory.
///
/// Layout:
/// - `<root>/<run_id>/<unit>/<local name>` for every artifact
/// - `<root>/<archive name>` for the archive
///
/// Every file is written to a temporary sibling first and renamed into place,
/// so readers never observe a half-written artifact. An artifact whose name
/// would land outside the run directory is skipped; the rest of the bundle is
/// still written.
#[derive(Debug, Clone)]
pub struct LocalDirExporter {
    root: PathBuf,
}

impl LocalDirExporter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory that holds the artifacts of `run_id`.
    ///
    /// Run ids are free text; every character that could change the path
    /// structure is replaced with `_`.
    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        let dir: String = run_id
            .chars()
            .map(|c| if matches!(c, '/' | '\\') { '_' } else { c })
            .collect();
        match dir.as_str() {
            "" | "." => self.root.join("_"),
            ".." => self.root.join("__"),
            _ => self.root.join(dir),
        }
    }
}

#[async_trait]
impl Exporter for LocalDirExporter {
    fn name(&self) -> &str {
        "local"
    }

    async fn export_bundle(&self, bundle: &ArtifactBundle) -> Result<()> {
        let run_dir = self.run_dir(bundle.run_id.as_str());
        let bundle = bundle.clone();
        tokio::task::spawn_blocking(move || {
            let mut written = 0;
            for artifact in bundle.artifacts() {
                if let Err(e) = check_relative_name(&artifact.name) {
                    warn!(artifact = %artifact.name, error = %e, "artifact skipped");
                    continue;
                }
                write_atomic(&run_dir.join(&artifact.name), &artifact.content)?;
                written += 1;
            }
            debug!(dir = %run_dir.display(), artifacts = written, "bundle written");
            Ok::<_, ExportError>(())
        })
        .await
        .map_err(|e| ExportError::Io(std::io::Error::other(e)))?
    }

    async fn export_archive(&self, name: &str, bytes: &[u8]) -> Result<()> {
        check_relative_name(name)?;
        let path = self.root.join(name);
        let bytes = bytes.to_vec();
        tokio::task::spawn_blocking(move || write_atomic(&path, &bytes))
            .await
            .map_err(|e| ExportError::Io(std::io::Error::other(e)))?
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| ExportError::UnsafeName(path.display().to_string()))?;
    fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
