//! Node log file collection.

use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;

use crate::domain::{UnitError, UnitResult};
use crate::scheduler::{DiagnosisUnit, UnitContext};

/// Copies a list of files into artifacts named after their path.
///
/// `/var/log/syslog` becomes `<unit>/var/log/syslog`. Files that do not exist
/// on this node are skipped, since the default list covers several distros.
/// Files that exist but cannot be read are reported after every other file
/// has been copied.
#[derive(Debug, Clone)]
pub struct FileCollector {
    name: String,
    files: Vec<PathBuf>,
}

impl FileCollector {
    pub fn new(name: impl Into<String>, files: Vec<PathBuf>) -> Self {
        Self {
            name: name.into(),
            files,
        }
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }
}

#[async_trait]
impl DiagnosisUnit for FileCollector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &UnitContext) -> UnitResult<()> {
        let mut failures = Vec::new();

        for path in &self.files {
            if ctx.is_cancelled() {
                return Err(UnitError::Cancelled);
            }
            match tokio::fs::read(path).await {
                Ok(content) => {
                    debug!(file = %path.display(), bytes = content.len(), "file collected");
                    ctx.emit(&path.to_string_lossy(), content);
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    debug!(file = %path.display(), "file not present; skipped");
                }
                Err(e) => failures.push(format!("{}: {e}", path.display())),
            }
        }

        match UnitError::from_failures(&failures, self.files.len()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
