//! Master-file fetch, snapshot storage and the staging/permanent upsert sink.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use reqwest::header::CONTENT_TYPE;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

pub mod sink;

pub use sink::{MemoryUpsertSink, PgUpsertSink, SinkError, UpsertSink};

pub const CRATE_NAME: &str = "cslb-storage";

pub const SOURCE_ID: &str = "cslb";

pub const DEFAULT_API_URL: &str =
    "https://www.cslb.ca.gov/onlineservices/DataPortalAPI/GetbyClassification.asmx?op=GetMasterFile";

pub const SOAP_ACTION: &str = "http://CSLB.Ca.gov/GetMasterFile";

const ENVELOPE_PREFIX: &str = concat!(
    r#"<?xml version="1.0" encoding="utf-8"?>"#,
    r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/" "#,
    r#"xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" "#,
    r#"xmlns:xsd="http://www.w3.org/2001/XMLSchema">"#,
    r#"<soap:Body><GetMasterFileResponse xmlns="http://CSLB.Ca.gov/"><GetMasterFileResult>"#,
);

const ENVELOPE_SUFFIX: &str =
    "</GetMasterFileResult></GetMasterFileResponse></soap:Body></soap:Envelope>";

#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub content_hash: String,
    pub path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Decoded master files kept on disk so later stages can be re-run without
/// another remote fetch.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// `<root>/<source>/<YYYYmmdd_HHMMSS>_<hash prefix>.csv`; names sort by fetch time.
    pub fn snapshot_path(&self, fetched_at: DateTime<Utc>, content_hash: &str) -> PathBuf {
        let stamp = fetched_at.format("%Y%m%d_%H%M%S");
        self.root
            .join(SOURCE_ID)
            .join(format!("{stamp}_{}.csv", hash_prefix(content_hash)))
    }

    /// An earlier snapshot with the same content, whatever its fetch time.
    async fn find_by_hash(&self, dir: &Path, content_hash: &str) -> anyhow::Result<Option<PathBuf>> {
        let suffix = format!("_{}.csv", hash_prefix(content_hash));
        let mut entries = fs::read_dir(dir)
            .await
            .with_context(|| format!("reading {}", dir.display()))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("reading {}", dir.display()))?
        {
            let path = entry.path();
            let matches = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.ends_with(&suffix));
            if matches {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }

    /// Writes via a temp file and rename so a partially written snapshot is
    /// never visible under its final name. Content already on disk is not
    /// written again; the existing file is renamed to the new fetch time.
    pub async fn persist(
        &self,
        fetched_at: DateTime<Utc>,
        bytes: &[u8],
    ) -> anyhow::Result<StoredSnapshot> {
        let content_hash = Self::sha256_hex(bytes);
        let path = self.snapshot_path(fetched_at, &content_hash);
        let parent = path
            .parent()
            .map(Path::to_path_buf)
            .with_context(|| format!("snapshot path {} has no parent", path.display()))?;

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating snapshot directory {}", parent.display()))?;

        let stored = |deduplicated| StoredSnapshot {
            content_hash: content_hash.clone(),
            path: path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        if let Some(existing) = self.find_by_hash(&parent, &content_hash).await? {
            if existing != path {
                fs::rename(&existing, &path).await.with_context(|| {
                    format!(
                        "renaming snapshot {} -> {}",
                        existing.display(),
                        path.display()
                    )
                })?;
            }
            return Ok(stored(true));
        }

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp snapshot {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp snapshot {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp snapshot {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "renaming temp snapshot {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            });
        }
        Ok(stored(false))
    }

    pub async fn latest(&self) -> anyhow::Result<Option<PathBuf>> {
        let dir = self.root.join(SOURCE_ID);
        if !fs::try_exists(&dir)
            .await
            .with_context(|| format!("checking {}", dir.display()))?
        {
            return Ok(None);
        }

        let mut entries = fs::read_dir(&dir)
            .await
            .with_context(|| format!("reading {}", dir.display()))?;
        let mut newest: Option<PathBuf> = None;
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("reading {}", dir.display()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("csv") {
                continue;
            }
            if newest.as_ref().map_or(true, |n| path.file_name() > n.file_name()) {
                newest = Some(path);
            }
        }
        Ok(newest)
    }
}

fn hash_prefix(content_hash: &str) -> &str {
    &content_hash[..content_hash.len().min(12)]
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("response envelope {0} does not match the GetMasterFile framing")]
    EnvelopeMismatch(&'static str),
    #[error("payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Strips the SOAP framing and base64-decodes the file it wraps. Byte
/// sequences that are not UTF-8 become U+FFFD instead of failing the file.
pub fn decode_master_file(body: &[u8]) -> Result<String, DecodeError> {
    let body = body.trim_ascii();
    let inner = body
        .strip_prefix(ENVELOPE_PREFIX.as_bytes())
        .ok_or(DecodeError::EnvelopeMismatch("prefix"))?;
    let inner = inner
        .strip_suffix(ENVELOPE_SUFFIX.as_bytes())
        .ok_or(DecodeError::EnvelopeMismatch("suffix"))?;

    let compact: Vec<u8> = inner
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    let bytes = STANDARD.decode(compact)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

pub fn master_file_request_body(token: &str) -> String {
    format!(
        concat!(
            r#"<?xml version="1.0" encoding="utf-8"?>"#,
            r#"<soap:Envelope xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" "#,
            r#"xmlns:xsd="http://www.w3.org/2001/XMLSchema" "#,
            r#"xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">"#,
            r#"<soap:Body><GetMasterFile xmlns="http://CSLB.Ca.gov/">"#,
            "<fileType>CSV</fileType><Token>{}</Token>",
            "</GetMasterFile></soap:Body></soap:Envelope>"
        ),
        xml_escape(token)
    )
}

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            // The master file runs to hundreds of megabytes.
            timeout: Duration::from_secs(300),
            user_agent: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("snapshot {} does not exist", .0.display())]
    SnapshotMissing(PathBuf),
    #[error("persisting snapshot: {0:#}")]
    Persist(anyhow::Error),
}

impl FetchError {
    /// Network and protocol failures, as opposed to payload or local-disk problems.
    pub fn is_transport(&self) -> bool {
        matches!(self, FetchError::Request(_) | FetchError::HttpStatus { .. })
    }
}

/// Issues the `GetMasterFile` SOAP call. Failures are returned as-is; there is
/// no retry because the service rate-limits repeat downloads.
#[derive(Debug)]
pub struct MasterFileClient {
    client: reqwest::Client,
    api_url: String,
}

impl MasterFileClient {
    pub fn new(api_url: impl Into<String>, config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            api_url: api_url.into(),
        })
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Returns the raw response body, still enveloped.
    pub async fn fetch_master_file(&self, token: &str) -> Result<Vec<u8>, FetchError> {
        let span = info_span!("http_fetch", source_id = SOURCE_ID, url = %self.api_url);
        self.post_master_file_request(token).instrument(span).await
    }

    async fn post_master_file_request(&self, token: &str) -> Result<Vec<u8>, FetchError> {
        let resp = self
            .client
            .post(&self.api_url)
            .header(CONTENT_TYPE, "text/xml; charset=utf-8")
            .header("SOAPAction", SOAP_ACTION)
            .body(master_file_request_body(token))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }

        let body = resp.bytes().await?.to_vec();
        info!(status = status.as_u16(), bytes = body.len(), "master file response received");
        Ok(body)
    }
}

/// Where a run gets its tabular snapshot from.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    fn describe(&self) -> String;

    /// Returns the path of a decoded CSV snapshot on local disk.
    async fn fetch_snapshot(&self) -> Result<PathBuf, FetchError>;
}

pub struct RemoteMasterFile {
    client: MasterFileClient,
    token: String,
    store: SnapshotStore,
}

impl RemoteMasterFile {
    pub fn new(
        client: MasterFileClient,
        token: impl Into<String>,
        store: SnapshotStore,
    ) -> anyhow::Result<Self> {
        let token = token.into();
        if token.trim().is_empty() {
            anyhow::bail!("no API token configured for the master file service");
        }
        Ok(Self {
            client,
            token,
            store,
        })
    }
}

#[async_trait]
impl SnapshotSource for RemoteMasterFile {
    fn describe(&self) -> String {
        format!("remote master file at {}", self.client.api_url())
    }

    async fn fetch_snapshot(&self) -> Result<PathBuf, FetchError> {
        let fetched_at = Utc::now();
        let body = self.client.fetch_master_file(&self.token).await?;
        let text = decode_master_file(&body)?;
        let stored = self
            .store
            .persist(fetched_at, text.as_bytes())
            .await
            .map_err(FetchError::Persist)?;
        info!(
            path = %stored.path.display(),
            bytes = stored.byte_size,
            sha256 = %stored.content_hash,
            deduplicated = stored.deduplicated,
            "master file snapshot saved"
        );
        Ok(stored.path)
    }
}

/// A snapshot persisted by an earlier run.
#[derive(Debug, Clone)]
pub struct LocalSnapshot {
    path: PathBuf,
}

impl LocalSnapshot {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SnapshotSource for LocalSnapshot {
    fn describe(&self) -> String {
        format!("local snapshot {}", self.path.display())
    }

    async fn fetch_snapshot(&self) -> Result<PathBuf, FetchError> {
        match fs::try_exists(&self.path).await {
            Ok(true) => Ok(self.path.clone()),
            _ => Err(FetchError::SnapshotMissing(self.path.clone())),
        }
    }
}
