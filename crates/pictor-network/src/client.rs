//! Signed object-storage client with resumable downloads

use crate::signing::{canonical_query_string, uri_encode_path, RequestSigner};
use crate::{NetworkError, ObjectStoreConfig, Result};
use chrono::Utc;
use pictor_core::{part_path, sha256_file};
use reqwest::{header, Client, RequestBuilder, Response, StatusCode};
use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs::{self, File};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// One object to fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadJob {
    /// Object key within the bucket
    pub key: String,
    /// Final local path
    pub destination: PathBuf,
    /// Expected byte length, if known
    pub expected_size: Option<u64>,
    /// Expected hex SHA-256, if known
    pub expected_sha256: Option<String>,
}

impl DownloadJob {
    /// Create a job
    pub fn new(key: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            key: key.into(),
            destination: destination.into(),
            expected_size: None,
            expected_sha256: None,
        }
    }

    /// Require a byte length
    pub fn with_expected_size(mut self, size: u64) -> Self {
        self.expected_size = Some(size);
        self
    }

    /// Require a content hash
    pub fn with_expected_sha256(mut self, sha256: impl Into<String>) -> Self {
        self.expected_sha256 = Some(sha256.into());
        self
    }
}

/// Download progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchProgress {
    /// Bytes on disk so far
    pub bytes_received: u64,
    /// Total size, once known
    pub bytes_expected: Option<u64>,
}

struct ProgressThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl ProgressThrottle {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    fn ready(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

struct Transfer {
    received: u64,
    expected: Option<u64>,
    throttle: ProgressThrottle,
}

impl Transfer {
    fn progress(&self) -> FetchProgress {
        FetchProgress {
            bytes_received: self.received,
            bytes_expected: self.expected,
        }
    }
}

/// Handle to a download running on the tokio runtime
#[derive(Debug)]
pub struct DownloadTask {
    key: String,
    cancel: CancellationToken,
    handle: JoinHandle<Result<PathBuf>>,
}

impl DownloadTask {
    /// Object key being fetched
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Cancel the download; the partial file is removed
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that cancels this download
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the download to finish
    pub async fn join(self) -> Result<PathBuf> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(NetworkError::Task(e.to_string())),
        }
    }
}

/// Client for one bucket of an S3-compatible store
#[derive(Clone, Debug)]
pub struct ObjectStoreClient {
    client: Client,
    config: ObjectStoreConfig,
    signer: RequestSigner,
    host: String,
}

impl ObjectStoreClient {
    /// Create a client
    pub fn new(config: ObjectStoreConfig) -> Result<Self> {
        let base = Url::parse(&config.endpoint)?;
        let host = match (base.host_str(), base.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(NetworkError::InvalidUrl(format!(
                    "endpoint has no host: {}",
                    config.endpoint
                )))
            }
        };

        let client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| NetworkError::Configuration(e.to_string()))?;

        let signer = RequestSigner::new(
            config.access_key.clone(),
            config.secret_key.clone(),
            config.region.clone(),
        );

        Ok(Self {
            client,
            config,
            signer,
            host,
        })
    }

    /// Client configuration
    pub fn config(&self) -> &ObjectStoreConfig {
        &self.config
    }

    /// Download an object to `job.destination`.
    ///
    /// Bytes stream into `<destination>.part`; transient failures resume
    /// from the bytes already on disk after a fixed backoff. The partial
    /// file is removed on failure or cancellation, and renamed over the
    /// destination on success. `progress` is called at most once per
    /// progress interval plus once on completion, never after cancellation.
    pub async fn download(
        &self,
        job: &DownloadJob,
        progress: &mut (dyn FnMut(FetchProgress) + Send),
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let part = part_path(&job.destination);
        if let Some(parent) = job.destination.parent() {
            fs::create_dir_all(parent).await?;
        }

        if let Err(e) = self.download_to_part(job, &part, progress, cancel).await {
            remove_partial(&part).await;
            match e {
                NetworkError::Cancelled => debug!(key = %job.key, "Download cancelled"),
                ref e => warn!(key = %job.key, "Download failed: {}", e),
            }
            return Err(e);
        }

        if let Err(e) = fs::rename(&part, &job.destination).await {
            remove_partial(&part).await;
            return Err(e.into());
        }

        info!(
            key = %job.key,
            path = %job.destination.display(),
            "Download complete"
        );
        Ok(job.destination.clone())
    }

    /// Start a download on the runtime
    pub fn spawn_download(
        &self,
        job: DownloadJob,
        mut progress: impl FnMut(FetchProgress) + Send + 'static,
    ) -> DownloadTask {
        let client = self.clone();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let key = job.key.clone();

        let handle = tokio::spawn(async move { client.download(&job, &mut progress, &token).await });

        DownloadTask {
            key,
            cancel,
            handle,
        }
    }

    /// List object keys starting with `prefix`
    pub async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let canonical_uri = format!("/{}", uri_encode_path(&self.config.bucket));
        let mut query = BTreeMap::new();
        query.insert("list-type".to_string(), "2".to_string());
        query.insert("prefix".to_string(), prefix.to_string());

        let response = self.signed_get(&canonical_uri, &query)?.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NetworkError::Http {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        let body = response.text().await?;
        let keys = parse_list_keys(&body);
        debug!(prefix, count = keys.len(), "Listed keys");
        Ok(keys)
    }

    fn object_path(&self, key: &str) -> String {
        uri_encode_path(&format!("/{}/{}", self.config.bucket, key.trim_start_matches('/')))
    }

    fn signed_get(
        &self,
        canonical_uri: &str,
        query: &BTreeMap<String, String>,
    ) -> Result<RequestBuilder> {
        let mut url = format!("{}{}", self.config.endpoint, canonical_uri);
        if !query.is_empty() {
            url.push('?');
            url.push_str(&canonical_query_string(query));
        }
        let url = Url::parse(&url)?;

        let signed = self
            .signer
            .sign("GET", &self.host, canonical_uri, query, Utc::now())?;

        Ok(self
            .client
            .get(url)
            .header("x-amz-date", signed.amz_date)
            .header("x-amz-content-sha256", signed.content_sha256)
            .header(header::AUTHORIZATION, signed.authorization))
    }

    async fn download_to_part(
        &self,
        job: &DownloadJob,
        part: &Path,
        progress: &mut (dyn FnMut(FetchProgress) + Send),
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut file = File::create(part).await?;
        let mut transfer = Transfer {
            received: 0,
            expected: job.expected_size,
            throttle: ProgressThrottle::new(self.config.progress_interval),
        };
        let mut failures = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(NetworkError::Cancelled);
            }

            let before = transfer.received;
            match self
                .fetch_attempt(&job.key, &mut file, &mut transfer, progress, cancel)
                .await
            {
                Ok(()) => break,
                Err(e) if e.is_retryable() => {
                    if transfer.received > before {
                        failures = 0;
                    }
                    failures += 1;
                    if failures > self.config.retry.max_retries {
                        return Err(NetworkError::RetriesExhausted(format!("{}: {}", job.key, e)));
                    }

                    warn!(
                        key = %job.key,
                        attempt = failures,
                        received = transfer.received,
                        "Download interrupted, resuming: {}",
                        e
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(NetworkError::Cancelled),
                        _ = tokio::time::sleep(self.config.retry.backoff) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if cancel.is_cancelled() {
            return Err(NetworkError::Cancelled);
        }
        if transfer.expected.is_none() {
            transfer.expected = Some(transfer.received);
        }
        progress(transfer.progress());

        let actual_size = fs::metadata(part).await?.len();
        if let Some(expected) = job.expected_size {
            if actual_size != expected {
                return Err(NetworkError::SizeMismatch {
                    key: job.key.clone(),
                    expected,
                    actual: actual_size,
                });
            }
        }

        if let Some(ref expected) = job.expected_sha256 {
            let path = part.to_path_buf();
            let actual = tokio::task::spawn_blocking(move || sha256_file(&path))
                .await
                .map_err(|e| NetworkError::Task(e.to_string()))??;
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(NetworkError::ChecksumMismatch {
                    key: job.key.clone(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        Ok(())
    }

    /// One GET, appending to `file` from `transfer.received`
    async fn fetch_attempt(
        &self,
        key: &str,
        file: &mut File,
        transfer: &mut Transfer,
        progress: &mut (dyn FnMut(FetchProgress) + Send),
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut request = self.signed_get(&self.object_path(key), &BTreeMap::new())?;
        if transfer.received > 0 {
            request = request.header(header::RANGE, format!("bytes={}-", transfer.received));
        }

        let mut response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(NetworkError::Cancelled),
            response = request.send() => response?,
        };

        match response.status() {
            StatusCode::OK => {
                if transfer.received > 0 {
                    debug!(key, "Server ignored range request, restarting from zero");
                    file.set_len(0).await?;
                    file.seek(SeekFrom::Start(0)).await?;
                    transfer.received = 0;
                }
                if transfer.expected.is_none() {
                    transfer.expected = response.content_length();
                }
            }
            StatusCode::PARTIAL_CONTENT => {
                if transfer.expected.is_none() {
                    transfer.expected = content_range_total(&response)
                        .or_else(|| response.content_length().map(|len| len + transfer.received));
                }
            }
            StatusCode::RANGE_NOT_SATISFIABLE => {
                debug!(key, received = transfer.received, "Range not satisfiable, treating as complete");
                return Ok(());
            }
            StatusCode::NOT_FOUND => return Err(NetworkError::NotFound(key.to_string())),
            status => {
                return Err(NetworkError::Http {
                    status: status.as_u16(),
                    message: response.text().await.unwrap_or_default(),
                })
            }
        }

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(NetworkError::Cancelled),
                chunk = response.chunk() => chunk?,
            };
            let Some(chunk) = chunk else {
                break;
            };

            file.write_all(&chunk).await?;
            transfer.received += chunk.len() as u64;

            if transfer.throttle.ready() && !cancel.is_cancelled() {
                progress(transfer.progress());
            }
        }

        if let Some(expected) = transfer.expected {
            if transfer.received < expected {
                return Err(NetworkError::Connection(format!(
                    "body ended after {} of {} bytes",
                    transfer.received, expected
                )));
            }
        }

        Ok(())
    }
}

async fn remove_partial(part: &Path) {
    match fs::remove_file(part).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %part.display(), "Failed to remove partial download: {}", e),
    }
}

fn content_range_total(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(header::CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.rsplit('/').next())
        .and_then(|total| total.parse().ok())
}

/// Extract `<Key>` entries from a ListObjectsV2 response body
fn parse_list_keys(body: &str) -> Vec<String> {
    let mut keys = Vec::new();
    let mut rest = body;
    while let Some(start) = rest.find("<Key>") {
        rest = &rest[start + "<Key>".len()..];
        let Some(end) = rest.find("</Key>") else {
            break;
        };
        keys.push(unescape_xml(&rest[..end]));
        rest = &rest[end + "</Key>".len()..];
    }
    keys
}

fn unescape_xml(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find('&') {
        out.push_str(&rest[..start]);
        rest = &rest[start..];
        let decoded = rest
            .find(';')
            .and_then(|end| decode_entity(&rest[1..end]).map(|c| (c, end)));
        match decoded {
            Some((c, end)) => {
                out.push(c);
                rest = &rest[end + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn decode_entity(entity: &str) -> Option<char> {
    match entity {
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "amp" => Some('&'),
        _ => {
            let code = match entity.strip_prefix("#x").or_else(|| entity.strip_prefix("#X")) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => entity.strip_prefix('#')?.parse().ok()?,
            };
            char::from_u32(code)
        }
    }
}
