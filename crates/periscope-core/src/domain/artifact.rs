//! Artifacts produced by diagnosis units and the per-run bundle.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::run::RunId;

/// Separator between a unit's namespace and the artifact's local name.
pub const NAMESPACE_SEPARATOR: char = '/';

/// Turn a unit-chosen local name into a plain relative path.
///
/// Empty and `.` segments are dropped, `..` removes the previous segment
/// (never climbing above the unit's namespace) and backslashes become `_`.
/// A name with nothing left becomes `_`.
pub fn normalize_local_name(local_name: &str) -> String {
    let cleaned = local_name.replace('\\', "_");
    let mut parts: Vec<&str> = Vec::new();
    for part in cleaned.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            part => parts.push(part),
        }
    }
    if parts.is_empty() {
        "_".to_string()
    } else {
        parts.join("/")
    }
}

/// A named blob of diagnostic output.
///
/// `name` is always `"<unit>/<local name>"`; units never choose the prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub content: Vec<u8>,
}

impl Artifact {
    pub(crate) fn namespaced(unit: &str, local_name: &str, content: Vec<u8>) -> Self {
        Self {
            name: format!("{unit}{NAMESPACE_SEPARATOR}{local_name}"),
            content,
        }
    }

    /// The unit namespace this artifact belongs to.
    pub fn namespace(&self) -> &str {
        self.name
            .split_once(NAMESPACE_SEPARATOR)
            .map(|(ns, _)| ns)
            .unwrap_or(&self.name)
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// SHA-256 of the content, lowercase hex.
    pub fn sha256(&self) -> String {
        hex::encode(Sha256::digest(&self.content))
    }
}

/// Everything one run produced, in unit registration order.
///
/// Built once during collection and read-only afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactBundle {
    pub run_id: RunId,
    /// Node the bundle was collected on.
    pub node: String,
    artifacts: Vec<Artifact>,
}

impl ArtifactBundle {
    pub fn new(run_id: RunId, node: impl Into<String>, artifacts: Vec<Artifact>) -> Self {
        Self {
            run_id,
            node: node.into(),
            artifacts,
        }
    }

    pub fn artifacts(&self) -> &[Artifact] {
        &self.artifacts
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.artifacts.iter().map(Artifact::len).sum()
    }

    pub fn get(&self, name: &str) -> Option<&Artifact> {
        self.artifacts.iter().find(|a| a.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.artifacts.iter().map(|a| a.name.as_str())
    }
}
