//! Artifact download

use async_trait::async_trait;
use futures::StreamExt;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Why a download failed
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The server answered with a client or server error
    #[error("Could not download {url}, statusCode: {status}")]
    Status { url: String, status: u16 },

    /// The server answered with nothing
    #[error("Could not download {url}, empty response body")]
    Empty { url: String },

    /// Connection or transfer failure
    #[error("Could not download {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// Writing the destination failed
    #[error("Could not write {}: {source}", .path.display())]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Retrieves a remote file into a local path.
///
/// Implementations must leave no partial or empty file at `destination` when
/// they fail.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str, destination: &Path) -> Result<(), FetchError>;
}

/// Streaming HTTP(S) fetcher
#[derive(Debug, Clone, Default)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a preconfigured client (proxies, timeouts, ...)
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str, destination: &Path) -> Result<(), FetchError> {
        let network = |source| FetchError::Network {
            url: url.to_string(),
            source,
        };
        let io = |source| FetchError::Io {
            path: destination.to_path_buf(),
            source,
        };

        info!(%url, "Downloading tunnel artifact");
        let response = self.client.get(url).send().await.map_err(network)?;

        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        // Stream into a sibling temp file; it is deleted on drop unless persisted.
        let dir = destination
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let staging = tempfile::Builder::new()
            .prefix(".download-")
            .tempfile_in(dir)
            .map_err(io)?;
        let mut file = tokio::fs::File::from_std(staging.reopen().map_err(io)?);

        let mut written: u64 = 0;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(network)?;
            file.write_all(&chunk).await.map_err(io)?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(io)?;
        file.sync_all().await.map_err(io)?;
        drop(file);

        if written == 0 {
            return Err(FetchError::Empty {
                url: url.to_string(),
            });
        }

        make_executable(staging.path()).map_err(io)?;
        staging.persist(destination).map_err(|e| io(e.error))?;

        debug!(bytes = written, path = %destination.display(), "Download complete");
        Ok(())
    }
}

#[cfg(unix)]
fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::get;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn leftovers(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect()
    }

    #[tokio::test]
    async fn downloads_body_to_destination() {
        let base = serve(Router::new().route("/tunnel.jar", get(|| async { "jar-bytes" }))).await;
        let dir = tempfile::TempDir::new().unwrap();
        let dest = dir.path().join("tunnel.jar");

        HttpFetcher::new()
            .fetch(&format!("{}/tunnel.jar", base), &dest)
            .await
            .unwrap();

        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "jar-bytes");
        assert_eq!(leftovers(dir.path()), vec!["tunnel.jar"]);
    }

    #[tokio::test]
    async fn error_status_leaves_nothing_behind() {
        let base = serve(Router::new()).await;
        let dir = tempfile::TempDir::new().unwrap();
        let dest = dir.path().join("tunnel-wrong.jar");
        let url = format!("{}/tunnel-wrong.jar", base);

        let err = HttpFetcher::new().fetch(&url, &dest).await.unwrap_err();

        assert!(matches!(err, FetchError::Status { status: 404, .. }));
        assert_eq!(
            err.to_string(),
            format!("Could not download {}, statusCode: 404", url)
        );
        assert!(leftovers(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn server_error_is_reported() {
        let base = serve(Router::new().route(
            "/tunnel.jar",
            get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
        ))
        .await;
        let dir = tempfile::TempDir::new().unwrap();
        let dest = dir.path().join("tunnel.jar");

        let err = HttpFetcher::new()
            .fetch(&format!("{}/tunnel.jar", base), &dest)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 500, .. }));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn empty_body_is_rejected() {
        let base = serve(Router::new().route("/tunnel.jar", get(|| async { "" }))).await;
        let dir = tempfile::TempDir::new().unwrap();
        let dest = dir.path().join("tunnel.jar");

        let err = HttpFetcher::new()
            .fetch(&format!("{}/tunnel.jar", base), &dest)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Empty { .. }));
        assert!(leftovers(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn unreachable_host_is_a_network_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let dest = dir.path().join("tunnel.jar");
        // Port 9 (discard) is not expected to accept HTTP on loopback.
        let err = HttpFetcher::new()
            .fetch("http://127.0.0.1:9/tunnel.jar", &dest)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Network { .. }));
        assert!(!dest.exists());
    }
}
