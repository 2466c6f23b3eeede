//! Wiring checks run before any unit is started.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::domain::{CoreError, Result};

/// A prerequisite whose absence invalidates the whole run.
#[async_trait]
pub trait Preflight: Send + Sync {
    /// Fails with [`CoreError::Wiring`] when the prerequisite is missing.
    async fn check(&self) -> Result<()>;
}

/// Always passes. For local runs outside a cluster.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPreflight;

#[async_trait]
impl Preflight for NoPreflight {
    async fn check(&self) -> Result<()> {
        Ok(())
    }
}

/// Requires the mounted service-account token and CA bundle.
#[derive(Debug, Clone)]
pub struct ServiceAccountPreflight {
    dir: PathBuf,
}

impl ServiceAccountPreflight {
    pub const REQUIRED_FILES: [&'static str; 2] = ["token", "ca.crt"];

    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl Preflight for ServiceAccountPreflight {
    async fn check(&self) -> Result<()> {
        for file in Self::REQUIRED_FILES {
            let path = self.dir.join(file);
            let found = tokio::fs::metadata(&path)
                .await
                .map(|meta| meta.is_file() && meta.len() > 0)
                .unwrap_or(false);
            if !found {
                return Err(CoreError::Wiring(format!(
                    "service account credential {} is missing or empty",
                    path.display()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_service_account_preflight() {
        let dir = tempfile::tempdir().unwrap();
        let preflight = ServiceAccountPreflight::new(dir.path());

        let err = preflight.check().await.unwrap_err();
        assert!(err.to_string().contains("token"));

        std::fs::write(dir.path().join("token"), "eyJ...").unwrap();
        std::fs::write(dir.path().join("ca.crt"), "").unwrap();
        let err = preflight.check().await.unwrap_err();
        assert!(matches!(err, CoreError::Wiring(msg) if msg.contains("ca.crt")));

        std::fs::write(dir.path().join("ca.crt"), "-----BEGIN CERTIFICATE-----").unwrap();
        preflight.check().await.unwrap();
    }

    #[tokio::test]
    async fn test_no_preflight_passes() {
        NoPreflight.check().await.unwrap();
    }
}
