//! Resource fetching for the `url` parameter and external entities.
//!
//! A location is one of:
//! - `http://` / `https://` URL, fetched with a single GET
//! - `file://` URL
//! - anything that does not parse as a URL, taken as a filesystem path
//!   relative to the working directory

use crate::xml::EntityLoader;
use bytes::Bytes;
use std::path::PathBuf;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::debug;
use url::Url;

/// Fetch failures
#[derive(Debug)]
pub enum FetchError {
    /// Scheme other than http, https or file
    UnsupportedScheme(String),
    /// `file://` URL that does not map to a local path
    InvalidFileUrl(String),
    /// Connection, TLS or protocol failure
    Request(reqwest::Error),
    /// Server answered with a non-success status
    Status { location: String, status: u16 },
    /// Local file could not be read
    File(PathBuf, std::io::Error),
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchError::UnsupportedScheme(scheme) => {
                write!(f, "Unsupported scheme '{}'", scheme)
            }
            FetchError::InvalidFileUrl(location) => write!(f, "Invalid file URL '{}'", location),
            FetchError::Request(e) => write!(f, "Request failed: {}", e),
            FetchError::Status { location, status } => {
                write!(f, "Failed to open stream '{}': HTTP status {}", location, status)
            }
            FetchError::File(path, e) => {
                write!(f, "Failed to open stream '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for FetchError {}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        FetchError::Request(e)
    }
}

/// Where a location points to
#[derive(Debug, Clone, PartialEq, Eq)]
enum Resource {
    Http(Url),
    File(PathBuf),
}

fn classify(location: &str) -> Result<Resource, FetchError> {
    let url = match Url::parse(location) {
        Ok(url) => url,
        Err(_) => return Ok(Resource::File(PathBuf::from(location))),
    };

    match url.scheme() {
        "http" | "https" => Ok(Resource::Http(url)),
        "file" => url
            .to_file_path()
            .map(Resource::File)
            .map_err(|_| FetchError::InvalidFileUrl(location.to_string())),
        // Windows drive letters parse as a one-letter scheme
        scheme if scheme.len() == 1 => Ok(Resource::File(PathBuf::from(location))),
        scheme => Err(FetchError::UnsupportedScheme(scheme.to_string())),
    }
}

/// Shared fetcher. Cloning is cheap; the HTTP connection pool is shared.
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: reqwest::Client,
}

impl Fetcher {
    /// Build a fetcher. Without a timeout a hung remote blocks its request
    /// until the peer gives up.
    pub fn new(timeout: Option<Duration>, user_agent: &str) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder().user_agent(user_agent);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Fetcher {
            client: builder.build()?,
        })
    }

    /// Fetch the full content behind a location. Single attempt, no retry.
    pub async fn fetch(&self, location: &str) -> Result<Bytes, FetchError> {
        match classify(location)? {
            Resource::Http(url) => {
                debug!(url = %url, "Fetching over HTTP");
                let response = self.client.get(url).send().await?;
                let status = response.status();
                if !status.is_success() {
                    return Err(FetchError::Status {
                        location: location.to_string(),
                        status: status.as_u16(),
                    });
                }
                Ok(response.bytes().await?)
            }
            Resource::File(path) => {
                debug!(path = %path.display(), "Reading local file");
                tokio::fs::read(&path)
                    .await
                    .map(Bytes::from)
                    .map_err(|e| FetchError::File(path, e))
            }
        }
    }
}

/// Synchronous entity loader backed by a `Fetcher`.
///
/// Blocks on the runtime handle, so it must run on a blocking thread
/// (`tokio::task::spawn_blocking`), never on a runtime worker.
pub struct BlockingEntityLoader {
    fetcher: Fetcher,
    handle: Handle,
}

impl BlockingEntityLoader {
    pub fn new(fetcher: Fetcher, handle: Handle) -> Self {
        BlockingEntityLoader { fetcher, handle }
    }
}

impl EntityLoader for BlockingEntityLoader {
    fn load(
        &mut self,
        system_id: &str,
        _public_id: Option<&str>,
    ) -> Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>> {
        let bytes = self.handle.block_on(self.fetcher.fetch(system_id))?;
        Ok(bytes.to_vec())
    }
}

/// Loopback HTTP server for tests that need a real remote
#[cfg(test)]
pub(crate) mod test_server {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve fixed bodies by path until the runtime shuts down. Unknown
    /// paths get a 404. Returns the base URL.
    pub async fn serve(routes: &'static [(&'static str, &'static str)]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut request = Vec::new();
                    let mut chunk = [0u8; 1024];
                    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                        match stream.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => request.extend_from_slice(&chunk[..n]),
                        }
                    }

                    let head = String::from_utf8_lossy(&request);
                    let path = head.split(' ').nth(1).unwrap_or("");
                    let response = match routes.iter().find(|(route, _)| *route == path) {
                        Some((_, body)) => format!(
                            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            body.len(),
                            body
                        ),
                        None => "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                            .to_string(),
                    };
                    let _ = stream.write_all(response.as_bytes()).await;
                });
            }
        });

        format!("http://{}", addr)
    }
}
