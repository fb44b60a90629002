//! Remote buffer tiers: read folders, read servers and a single write server.
//!
//! A read folder holds files named by the hex checksum of their content. Writers may hold a
//! folder-wide `.LOCK` file or a per-buffer `<hex>.LOCK` file while a file is incomplete.
//!
//! A buffer server answers `GET <url>/has` with a JSON list of booleans for a JSON list of
//! hex checksums, `GET <url>/<hex>` with the buffer, and accepts `PUT <url>/<hex>`.
//!
//! Every buffer obtained remotely is verified against its checksum before it is returned.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use backon::{BackoffBuilder, ExponentialBuilder};
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use url::Url;

use crate::{
    checksum::{Buffer, Checksum},
    config::RemoteConfig,
};

/// GET requests per buffer and server, the first download included.
const SERVER_GET_ATTEMPTS: usize = 2;

/// Error reaching a remote tier.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RemoteError {
    #[error("Cannot connect to buffer server {0}")]
    Connect(Url),
    #[error("Buffer server {url} answered {status}")]
    Status { url: Url, status: u16 },
    #[error("Invalid buffer server url {0}")]
    InvalidUrl(Url),
    #[error("Buffer server request failed: {0}")]
    Http(String),
    #[error("Reading {}: {message}", .path.display())]
    Io { path: PathBuf, message: String },
}

impl From<reqwest::Error> for RemoteError {
    fn from(value: reqwest::Error) -> Self {
        Self::Http(value.to_string())
    }
}

impl RemoteError {
    fn is_transient(&self) -> bool {
        match self {
            RemoteError::Connect(_) | RemoteError::Http(_) => true,
            RemoteError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

#[derive(Debug, Default)]
struct Tiers {
    read_folders: Vec<PathBuf>,
    read_servers: Vec<Url>,
    write_server: Option<Url>,
}

/// Access to the remote tiers. Clones share state.
#[derive(Debug, Clone)]
pub struct RemoteBufferLayer {
    inner: Arc<Inner>,
}

#[derive(derive_more::Debug)]
struct Inner {
    #[debug(skip)]
    http_client: reqwest::Client,
    config: RemoteConfig,
    tiers: RwLock<Tiers>,
    /// Checksums a read server is known to hold.
    #[debug("{} known", known.lock().len())]
    known: Mutex<HashSet<Checksum>>,
    /// Checksums sent to the write server.
    #[debug("{} written", written.lock().len())]
    written: Mutex<HashSet<Checksum>>,
}

impl RemoteBufferLayer {
    /// Creates the layer with the read tiers of `config`.
    ///
    /// The write server is not probed; use [`RemoteBufferLayer::set_write_server`] for that.
    pub fn new(config: RemoteConfig) -> Self {
        let tiers = Tiers {
            read_folders: config.read_folders.iter().map(|f| absolute(f)).collect(),
            read_servers: config.read_servers.clone(),
            write_server: None,
        };
        Self {
            inner: Arc::new(Inner {
                http_client: reqwest::Client::new(),
                config,
                tiers: RwLock::new(tiers),
                known: Default::default(),
                written: Default::default(),
            }),
        }
    }

    /// Creates the layer and connects the configured write server.
    pub async fn from_config(config: RemoteConfig) -> Result<Self, RemoteError> {
        let write_server = config.write_server.clone();
        let layer = Self::new(config);
        layer.set_write_server(write_server).await?;
        Ok(layer)
    }

    pub fn read_folders(&self) -> Vec<PathBuf> {
        self.inner.tiers.read().read_folders.clone()
    }

    pub fn set_read_folders(&self, folders: Vec<PathBuf>) {
        let folders: Vec<PathBuf> = folders.iter().map(|f| absolute(f)).collect();
        let mut tiers = self.inner.tiers.write();
        if tiers.read_folders.iter().any(|old| !folders.contains(old)) {
            self.inner.known.lock().clear();
        }
        tiers.read_folders = folders;
    }

    pub fn add_read_folder(&self, folder: impl AsRef<Path>) {
        self.inner
            .tiers
            .write()
            .read_folders
            .push(absolute(folder.as_ref()));
    }

    pub fn set_read_servers(&self, servers: Vec<Url>) {
        let mut tiers = self.inner.tiers.write();
        if servers.is_empty() || tiers.read_servers.iter().any(|old| !servers.contains(old)) {
            self.inner.known.lock().clear();
        }
        tiers.read_servers = servers;
    }

    pub fn add_read_server(&self, server: Url) {
        self.inner.tiers.write().read_servers.push(server);
    }

    pub fn write_server(&self) -> Option<Url> {
        self.inner.tiers.read().write_server.clone()
    }

    /// Sets the one write server, after probing that it is reachable.
    ///
    /// Changing the server forgets which buffers were written.
    pub async fn set_write_server(&self, server: Option<Url>) -> Result<(), RemoteError> {
        if server == self.write_server() {
            return Ok(());
        }
        let Some(server) = server else {
            self.inner.tiers.write().write_server = None;
            return Ok(());
        };
        self.probe(&server).await?;
        let mut tiers = self.inner.tiers.write();
        if tiers.write_server.is_some() {
            self.inner.written.lock().clear();
        }
        tiers.write_server = Some(server);
        Ok(())
    }

    /// Sends a `has` request for a dummy checksum until the server answers.
    async fn probe(&self, server: &Url) -> Result<(), RemoteError> {
        let config = &self.inner.config;
        let dummy = Checksum::from_bytes([b'0'; 32]);
        for trial in 0..config.connect_trials.max(1) {
            let request = self
                .has_request(server, &[dummy])?
                .timeout(config.probe_timeout)
                .send()
                .await;
            match request {
                Ok(_) => return Ok(()),
                Err(err) if err.is_connect() || err.is_timeout() => {
                    debug!(%server, trial, "write server not reachable");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(RemoteError::Connect(server.clone()))
    }

    /// True if a write server is configured.
    pub fn can_write(&self) -> bool {
        self.inner.tiers.read().write_server.is_some()
    }

    /// True if the buffer is known to be available remotely, without asking anyone.
    pub fn is_known(&self, checksum: &Checksum) -> bool {
        self.inner.known.lock().contains(checksum) || self.inner.written.lock().contains(checksum)
    }

    /// Asks the read folders and servers whether they hold the buffer.
    pub async fn remote_has_checksum(&self, checksum: &Checksum) -> bool {
        let (folders, servers) = {
            let tiers = self.inner.tiers.read();
            (tiers.read_folders.clone(), tiers.read_servers.clone())
        };
        for folder in folders {
            if tokio::fs::try_exists(folder.join(checksum.to_hex()))
                .await
                .unwrap_or(false)
            {
                self.inner.known.lock().insert(*checksum);
                return true;
            }
        }
        for server in servers {
            if self.server_has(&server, checksum).await == Some(true) {
                self.inner.known.lock().insert(*checksum);
                return true;
            }
        }
        false
    }

    /// True if the buffer is known to be remote, or some remote tier reports it.
    pub async fn can_read_buffer(&self, checksum: &Checksum) -> bool {
        self.is_known(checksum) || self.remote_has_checksum(checksum).await
    }

    /// Gets a buffer from the read folders, then from the read servers.
    ///
    /// Failures are logged and yield `None`.
    pub async fn get_buffer(&self, checksum: &Checksum) -> Option<Buffer> {
        let (folders, servers) = {
            let tiers = self.inner.tiers.read();
            (tiers.read_folders.clone(), tiers.read_servers.clone())
        };
        for folder in folders {
            match self.get_file_buffer(&folder, checksum).await {
                Ok(Some(buffer)) => return Some(buffer),
                Ok(None) => {}
                Err(err) => {
                    let folder = folder.display();
                    warn!(%checksum, %folder, ?err, "failed to read buffer folder");
                }
            }
        }
        for server in servers {
            if let Some(buffer) = self.server_get(&server, checksum).await {
                self.inner.known.lock().insert(*checksum);
                return Some(buffer);
            }
        }
        None
    }

    /// Reads `<directory>/<hex>`, waiting for lock files to disappear if needed.
    pub async fn get_file_buffer(
        &self,
        directory: &Path,
        checksum: &Checksum,
    ) -> Result<Option<Buffer>, RemoteError> {
        let filename = directory.join(checksum.to_hex());
        if let Some(buffer) = read_verified(&filename, checksum).await? {
            return Ok(Some(buffer));
        }
        let global_lock = directory.join(".LOCK");
        let lock = PathBuf::from(format!("{}.LOCK", filename.display()));
        let config = &self.inner.config;
        let start = Instant::now();
        loop {
            let locked = exists(&global_lock).await || exists(&lock).await;
            if !locked {
                break;
            }
            trace!(%checksum, "waiting for lock in {}", directory.display());
            tokio::time::sleep(config.lock_poll_interval).await;
            if start.elapsed() > config.lock_timeout {
                return Ok(None);
            }
        }
        let buffer = read_verified(&filename, checksum).await?;
        if buffer.is_none() && exists(&filename).await {
            debug!(%checksum, "{} has the wrong checksum", filename.display());
        }
        Ok(buffer)
    }

    fn endpoint(&self, server: &Url, segment: &str) -> Result<Url, RemoteError> {
        let mut url = server.clone();
        url.path_segments_mut()
            .map_err(|_| RemoteError::InvalidUrl(server.clone()))?
            .pop_if_empty()
            .push(segment);
        Ok(url)
    }

    fn has_request(
        &self,
        server: &Url,
        checksums: &[Checksum],
    ) -> Result<reqwest::RequestBuilder, RemoteError> {
        let url = self.endpoint(server, "has")?;
        let body: Vec<String> = checksums.iter().map(Checksum::to_hex).collect();
        let body = serde_json::to_string(&body).map_err(|e| RemoteError::Http(e.to_string()))?;
        Ok(self.inner.http_client.get(url).body(body))
    }

    /// Asks a buffer server whether it holds a buffer. `None` if the answer is unusable.
    pub async fn server_has(&self, server: &Url, checksum: &Checksum) -> Option<bool> {
        let request = self.has_request(server, &[*checksum]).ok()?;
        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                debug!(%server, ?err, "has request failed");
                return None;
            }
        };
        if response.status().is_client_error() || response.status().is_server_error() {
            return None;
        }
        let payload = response.bytes().await.ok()?;
        match serde_json::from_slice::<Vec<bool>>(&payload) {
            Ok(answer) if answer.len() == 1 => Some(answer[0]),
            _ => {
                warn!(%server, "malformed has response");
                None
            }
        }
    }

    /// Downloads a buffer from a server.
    ///
    /// A buffer with the wrong checksum is downloaded again once, in case it was being
    /// replaced; if the content still does not match, it is rejected.
    pub async fn server_get(&self, server: &Url, checksum: &Checksum) -> Option<Buffer> {
        let url = self.endpoint(server, &checksum.to_hex()).ok()?;
        for _ in 0..SERVER_GET_ATTEMPTS {
            let response = match self.inner.http_client.get(url.clone()).send().await {
                Ok(response) => response,
                Err(err) => {
                    debug!(%server, ?err, "get request failed");
                    return None;
                }
            };
            if response.status().is_client_error() || response.status().is_server_error() {
                return None;
            }
            let payload = response.bytes().await.ok()?;
            let actual = Checksum::new(&payload);
            if actual == *checksum {
                return Some(Buffer::with_checksum(payload, actual));
            }
            debug!(%server, %checksum, %actual, "downloaded buffer has the wrong checksum");
        }
        warn!(%server, %checksum, "server has the wrong checksum");
        None
    }

    /// Uploads a buffer to the write server, unless it was written before or the server
    /// already has it.
    pub async fn write_buffer(
        &self,
        checksum: &Checksum,
        buffer: &Buffer,
    ) -> Result<(), RemoteError> {
        let Some(server) = self.write_server() else {
            return Ok(());
        };
        if !self.inner.written.lock().insert(*checksum) {
            return Ok(());
        }
        if self.server_has(&server, checksum).await == Some(true) {
            return Ok(());
        }
        let url = self.endpoint(&server, &checksum.to_hex())?;
        let mut backoff = ExponentialBuilder::new()
            .with_min_delay(Duration::from_millis(10))
            .with_max_delay(Duration::from_secs(2))
            .with_jitter()
            .with_max_times(self.inner.config.write_retries)
            .build();
        loop {
            match self.put(&url, buffer).await {
                Ok(()) => {
                    debug!(%checksum, "buffer written to {server}");
                    return Ok(());
                }
                Err(err) if err.is_transient() => {
                    let Some(delay) = backoff.next() else {
                        self.inner.written.lock().remove(checksum);
                        return Err(err);
                    };
                    debug!(%checksum, ?err, ?delay, "retrying buffer write");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    self.inner.written.lock().remove(checksum);
                    return Err(err);
                }
            }
        }
    }

    async fn put(&self, url: &Url, buffer: &Buffer) -> Result<(), RemoteError> {
        let response = self
            .inner
            .http_client
            .put(url.clone())
            .body(buffer.bytes().clone())
            .send()
            .await
            .map_err(|err| {
                if err.is_connect() {
                    RemoteError::Connect(url.clone())
                } else {
                    err.into()
                }
            })?;
        if !response.status().is_success() {
            return Err(RemoteError::Status {
                url: url.clone(),
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }

    /// The file holding the buffer in one of the read folders.
    pub async fn get_filename(&self, checksum: &Checksum) -> Option<PathBuf> {
        for folder in self.read_folders() {
            let filename = folder.join(checksum.to_hex());
            if exists(&filename).await {
                return Some(filename);
            }
        }
        None
    }

    /// The directory where a deep buffer is deployed, `<folder>/deployed/<hex>`.
    pub async fn get_directory(&self, checksum: &Checksum) -> Option<PathBuf> {
        for folder in self.read_folders() {
            let dirname = folder.join("deployed").join(checksum.to_hex());
            if exists(&dirname).await {
                return Some(dirname);
            }
        }
        None
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

async fn read_verified(
    filename: &Path,
    checksum: &Checksum,
) -> Result<Option<Buffer>, RemoteError> {
    let data = match tokio::fs::read(filename).await {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(RemoteError::Io {
                path: filename.to_path_buf(),
                message: err.to_string(),
            })
        }
    };
    let buffer = Buffer::new(data);
    if buffer.verify(checksum) {
        Ok(Some(Buffer::with_checksum(buffer.bytes().clone(), *checksum)))
    } else {
        Ok(None)
    }
}
