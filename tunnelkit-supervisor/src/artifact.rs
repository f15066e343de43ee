//! Artifact cache: where the tunnel executable lives and whether it is usable

use crate::classifier;
use crate::config::{ArtifactConfig, RuntimeConfig};
use crate::download::Fetcher;
use crate::error::{Result, SupervisorError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Resolved location of one artifact version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactDescriptor {
    /// Requested version, `None` for the default build
    pub version: Option<String>,
    /// Remote location
    pub source_url: String,
    /// Local cache location
    pub cache_path: PathBuf,
}

impl ArtifactDescriptor {
    /// Compute the descriptor for a version selector.
    ///
    /// # Errors
    ///
    /// Rejects selectors that are blank or would escape the cache directory.
    pub fn resolve(config: &ArtifactConfig, version: Option<&str>) -> Result<Self> {
        let file_name = match version {
            None => format!("{}.{}", config.file_stem, config.extension),
            Some(v) => {
                if v.trim().is_empty() || v.contains(['/', '\\']) || v.contains("..") {
                    return Err(SupervisorError::Config(format!(
                        "Invalid tunnel version: {:?}",
                        v
                    )));
                }
                format!("{}-{}.{}", config.file_stem, v, config.extension)
            }
        };

        Ok(Self {
            version: version.map(str::to_string),
            source_url: format!("{}/{}", config.base_url.trim_end_matches('/'), file_name),
            cache_path: config.cache_dir.join(file_name),
        })
    }
}

/// Keeps a valid copy of the tunnel artifact on disk
#[derive(Clone)]
pub struct ArtifactCache {
    config: ArtifactConfig,
    runtime: RuntimeConfig,
    fetcher: Arc<dyn Fetcher>,
}

impl ArtifactCache {
    pub fn new(config: ArtifactConfig, runtime: RuntimeConfig, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            config,
            runtime,
            fetcher,
        }
    }

    pub fn descriptor(&self, version: Option<&str>) -> Result<ArtifactDescriptor> {
        ArtifactDescriptor::resolve(&self.config, version)
    }

    /// Whether the cached file is present and passes its self-check.
    pub async fn validate(&self, artifact: &ArtifactDescriptor) -> bool {
        let path = &artifact.cache_path;
        let size = match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => return false,
        };
        if size < self.config.min_size {
            warn!(path = %path.display(), size, "Cached artifact looks truncated");
            return false;
        }

        let check = Command::new(&self.runtime.program)
            .args(&self.runtime.launch_args)
            .arg(path)
            .args(&self.config.self_check_args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = match timeout(self.config.self_check_timeout, check).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                warn!(path = %path.display(), "Artifact self-check could not run: {}", e);
                return false;
            }
            Err(_) => {
                warn!(path = %path.display(), "Artifact self-check timed out");
                return false;
            }
        };

        if !output.status.success() {
            warn!(path = %path.display(), status = ?output.status, "Artifact self-check failed");
            return false;
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if let Some(fault) = stderr.lines().find_map(classifier::fault_of) {
            warn!(path = %path.display(), "Artifact self-check reported: {}", fault);
            return false;
        }

        true
    }

    /// Make sure a valid artifact for `version` is cached, fetching it if needed.
    ///
    /// # Errors
    ///
    /// [`SupervisorError::ArtifactUnavailable`] when the fetch fails. Fetches are not
    /// retried.
    pub async fn ensure(&self, version: Option<&str>) -> Result<ArtifactDescriptor> {
        let artifact = self.descriptor(version)?;

        if self.validate(&artifact).await {
            debug!(path = %artifact.cache_path.display(), "Using cached tunnel artifact");
            return Ok(artifact);
        }

        if let Some(dir) = artifact.cache_path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }

        info!(
            url = %artifact.source_url,
            path = %artifact.cache_path.display(),
            "Fetching tunnel artifact"
        );
        self.fetcher
            .fetch(&artifact.source_url, &artifact.cache_path)
            .await
            .map_err(|e| SupervisorError::ArtifactUnavailable(e.to_string()))?;

        Ok(artifact)
    }
}
