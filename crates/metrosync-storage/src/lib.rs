//! Audit log persistence + HTTP fetch utilities for metrosync.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use metrosync_core::{AuditEntry, AuditStatus, UpsertAction};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "metrosync-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Replace `path` with `bytes` using a sibling temp file and an atomic rename.
///
/// Readers only ever observe the previous file or the complete new one.
pub async fn write_atomically(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

/// Where and what a flush wrote.
#[derive(Debug, Clone)]
pub struct PersistedLog {
    pub path: PathBuf,
    pub content_hash: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AuditSummary {
    pub processed: usize,
    pub created: usize,
    pub updated: usize,
    pub failed: usize,
}

/// Append-only, in-order record of every upsert attempted during one run.
#[derive(Debug, Clone, Default)]
pub struct AuditLog {
    entries: Vec<AuditEntry>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, entry: AuditEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[AuditEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sequence ids are only unique within one cleaning pass, so this may
    /// return several entries.
    pub fn entries_by_sequence_id(&self, sequence_id: u64) -> Vec<&AuditEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.sequence_id == sequence_id)
            .collect()
    }

    pub fn summary(&self) -> AuditSummary {
        let mut summary = AuditSummary {
            processed: self.entries.len(),
            ..Default::default()
        };
        for entry in &self.entries {
            match (entry.status, entry.action) {
                (AuditStatus::Error, _) => summary.failed += 1,
                (AuditStatus::Success, Some(UpsertAction::Create)) => summary.created += 1,
                (AuditStatus::Success, Some(UpsertAction::Update)) => summary.updated += 1,
                (AuditStatus::Success, None) => {}
            }
        }
        summary
    }

    /// Serialize the whole log as a JSON array, replacing anything at `destination`.
    pub async fn flush(&self, destination: impl AsRef<Path>) -> anyhow::Result<PersistedLog> {
        let path = destination.as_ref();
        let bytes = serde_json::to_vec_pretty(&self.entries).context("serializing audit log")?;
        write_atomically(path, &bytes).await?;
        info!(
            path = %path.display(),
            entries = self.entries.len(),
            bytes = bytes.len(),
            "audit log saved"
        );
        Ok(PersistedLog {
            path: path.to_path_buf(),
            content_hash: sha256_hex(&bytes),
        })
    }

    pub async fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let data = fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let entries = serde_json::from_slice(&data)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self { entries })
    }
}

/// Throttling and server-side failures are worth another attempt.
pub fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

pub fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// Retry schedule for idempotent GETs: doubling from `base_delay`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Single attempt, used for non-idempotent CRM traffic.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt` (0-based), or `None` once retries are spent.
    pub fn retry_delay(&self, attempt: usize) -> Option<Duration> {
        if attempt >= self.max_retries {
            return None;
        }
        let exponent = u32::try_from(attempt).unwrap_or(u32::MAX);
        Some(
            self.base_delay
                .saturating_mul(2u32.saturating_pow(exponent))
                .min(self.max_delay),
        )
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            Self::Request(err) => err.status().map(|s| s.as_u16()),
            Self::Decode { .. } => None,
        }
    }
}

/// Shared `reqwest` client that retries idempotent GETs with capped backoff.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
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
            backoff: config.backoff,
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        bearer_token: Option<&str>,
        query: &[(&str, &str)],
    ) -> Result<T, FetchError> {
        let span = tracing::debug_span!("http_get", url);
        async move {
            let body = self.get_bytes(url, bearer_token, query).await?;
            serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
                url: url.to_string(),
                source,
            })
        }
        .instrument(span)
        .await
    }

    async fn get_bytes(
        &self,
        url: &str,
        bearer_token: Option<&str>,
        query: &[(&str, &str)],
    ) -> Result<Vec<u8>, FetchError> {
        let mut attempt = 0;
        loop {
            let mut request = self.client.get(url).query(query);
            if let Some(token) = bearer_token {
                request = request.bearer_auth(token);
            }

            let err = match request.send().await {
                Ok(resp) if resp.status().is_success() => {
                    return Ok(resp.bytes().await?.to_vec());
                }
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    let body = resp.text().await.unwrap_or_default();
                    FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                        body,
                    }
                }
                Err(err) => FetchError::Request(err),
            };

            let retryable = match &err {
                FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                    .map(is_retryable_status)
                    .unwrap_or(false),
                FetchError::Request(inner) => is_retryable_error(inner),
                FetchError::Decode { .. } => false,
            };
            match self.backoff.retry_delay(attempt).filter(|_| retryable) {
                Some(delay) => {
                    debug!(attempt, error = %err, ?delay, "retrying GET");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                None => return Err(err),
            }
        }
    }
}
