//! On-disk certificate artifact storage
//!
//! Layout: one directory per domain under the storage root, holding
//! `cert.pem`, `key.pem` and `chain.pem`. Account credentials live at the
//! root as `account.json`.

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{info, warn};

use crate::error::AcmeError;

const CERT_FILE: &str = "cert.pem";
const KEY_FILE: &str = "key.pem";
const CHAIN_FILE: &str = "chain.pem";
const CREDENTIALS_FILE: &str = "account.json";

/// Paths of a saved artifact set
#[derive(Debug, Clone)]
pub struct SavedArtifacts {
    pub cert_path: String,
    pub key_path: String,
    pub chain_path: String,
}

/// Artifact store rooted at a configured directory
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding one domain's artifacts
    pub fn domain_dir(&self, domain: &str) -> PathBuf {
        self.root.join(domain)
    }

    fn path_string(path: &Path) -> String {
        path.to_string_lossy().into_owned()
    }

    /// Write the artifact set for a domain, restricting the key file
    pub async fn save(
        &self,
        domain: &str,
        cert_pem: &str,
        key_pem: &str,
        chain_pem: &str,
    ) -> Result<SavedArtifacts, AcmeError> {
        let dir = self.domain_dir(domain);
        fs::create_dir_all(&dir).await?;

        let cert_path = dir.join(CERT_FILE);
        let key_path = dir.join(KEY_FILE);
        let chain_path = dir.join(CHAIN_FILE);

        fs::write(&cert_path, cert_pem).await?;
        fs::write(&key_path, key_pem).await?;
        fs::write(&chain_path, chain_pem).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600)).await?;
        }

        info!(domain = %domain, dir = %dir.display(), "Certificate artifacts saved");

        Ok(SavedArtifacts {
            cert_path: Self::path_string(&cert_path),
            key_path: Self::path_string(&key_path),
            chain_path: Self::path_string(&chain_path),
        })
    }

    /// Remove a domain's artifact directory
    pub async fn remove_domain(&self, domain: &str) -> Result<(), AcmeError> {
        let dir = self.domain_dir(domain);
        if fs::try_exists(&dir).await? {
            fs::remove_dir_all(&dir).await?;
            info!(domain = %domain, "Removed certificate artifacts");
        }
        Ok(())
    }

    /// Remove artifact directories for domains with no active record.
    ///
    /// Returns the number of directories removed.
    pub async fn cleanup_orphans(&self, active_domains: &[String]) -> Result<usize, AcmeError> {
        if !fs::try_exists(&self.root).await? {
            return Ok(0);
        }

        let mut removed = 0;
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if active_domains.iter().any(|d| d == &name) {
                continue;
            }
            match fs::remove_dir_all(entry.path()).await {
                Ok(()) => {
                    info!(domain = %name, "Removed orphan artifact directory");
                    removed += 1;
                }
                Err(err) => {
                    warn!(domain = %name, error = %err, "Failed to remove orphan artifact directory");
                }
            }
        }
        Ok(removed)
    }

    /// Remove stale `*.tmp` files under the storage root.
    ///
    /// Returns the number of files removed.
    pub async fn cleanup_temp_files(&self) -> Result<usize, AcmeError> {
        if !fs::try_exists(&self.root).await? {
            return Ok(0);
        }

        let mut removed = 0;
        let mut dirs = vec![self.root.clone()];
        while let Some(dir) = dirs.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    dirs.push(path);
                } else if path.extension().is_some_and(|ext| ext == "tmp") {
                    match fs::remove_file(&path).await {
                        Ok(()) => removed += 1,
                        Err(err) => {
                            warn!(path = %path.display(), error = %err, "Failed to remove temp file");
                        }
                    }
                }
            }
        }
        Ok(removed)
    }

    /// Stored account credentials, if any
    pub async fn load_credentials_json(&self) -> Result<Option<String>, AcmeError> {
        let path = self.root.join(CREDENTIALS_FILE);
        if !fs::try_exists(&path).await? {
            return Ok(None);
        }
        Ok(Some(fs::read_to_string(&path).await?))
    }

    /// Persist account credentials for reuse across restarts
    pub async fn save_credentials_json(&self, json: &str) -> Result<(), AcmeError> {
        fs::create_dir_all(&self.root).await?;
        let path = self.root.join(CREDENTIALS_FILE);
        fs::write(&path, json).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).await?;
        }

        Ok(())
    }
}
