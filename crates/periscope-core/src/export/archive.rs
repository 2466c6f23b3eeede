//! Single-file archive of a run bundle.
//!
//! The archive is a gzip-compressed JSON manifest. Each entry carries the
//! artifact's name, size, SHA-256 and hex-encoded content, so a consumer can
//! verify integrity without unpacking to disk.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{Artifact, ArtifactBundle, RunId};

/// File extension of archives produced by [`pack`].
pub const ARCHIVE_EXTENSION: &str = "json.gz";

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("archive compression error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt archive entry {name}: {reason}")]
    Corrupt { name: String, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub name: String,
    pub size: usize,
    pub sha256: String,
    pub content_hex: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchiveManifest {
    pub run_id: RunId,
    pub node: String,
    pub artifacts: Vec<ArchiveEntry>,
}

/// Archive name for a node: `<node>.json.gz`.
pub fn archive_name(node: &str) -> String {
    format!("{node}.{ARCHIVE_EXTENSION}")
}

/// Build the compressed archive of `bundle`.
pub fn pack(bundle: &ArtifactBundle) -> Result<Vec<u8>, ArchiveError> {
    let manifest = ArchiveManifest {
        run_id: bundle.run_id.clone(),
        node: bundle.node.clone(),
        artifacts: bundle
            .artifacts()
            .iter()
            .map(|a| ArchiveEntry {
                name: a.name.clone(),
                size: a.len(),
                sha256: a.sha256(),
                content_hex: hex::encode(&a.content),
            })
            .collect(),
    };

    let json = serde_json::to_vec(&manifest)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    Ok(encoder.finish()?)
}

/// Decode an archive produced by [`pack`], verifying every entry.
pub fn unpack(bytes: &[u8]) -> Result<ArtifactBundle, ArchiveError> {
    let mut json = Vec::new();
    GzDecoder::new(bytes).read_to_end(&mut json)?;
    let manifest: ArchiveManifest = serde_json::from_slice(&json)?;

    let mut artifacts = Vec::with_capacity(manifest.artifacts.len());
    for entry in manifest.artifacts {
        let content = hex::decode(&entry.content_hex).map_err(|e| ArchiveError::Corrupt {
            name: entry.name.clone(),
            reason: e.to_string(),
        })?;
        let artifact = Artifact {
            name: entry.name,
            content,
        };
        if artifact.len() != entry.size || artifact.sha256() != entry.sha256 {
            return Err(ArchiveError::Corrupt {
                name: artifact.name,
                reason: "size or digest mismatch".to_string(),
            });
        }
        artifacts.push(artifact);
    }
    Ok(ArtifactBundle::new(manifest.run_id, manifest.node, artifacts))
}
