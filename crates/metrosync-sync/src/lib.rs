//! Sync pipeline orchestration: fetch, clean, upsert, persist the audit log.

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use metrosync_adapters::{
    CrmClient, GoogleSheetsSource, InMemoryCrm, JsonFileSource, RowSource, SalesforceClient,
    SalesforcePasswordCredentials, SalesforceSession, ServiceAccountKey, DEFAULT_API_VERSION,
};
use metrosync_core::MetroSchema;
use metrosync_storage::{AuditLog, HttpClientConfig, HttpFetcher};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info};
use uuid::Uuid;

mod clean;
mod upsert;

pub use clean::{clean, coerce_count, SchemaError};
pub use upsert::UpsertEngine;

pub const CRATE_NAME: &str = "metrosync-sync";

pub const DEFAULT_BATCH_SIZE: usize = 200;
pub const DEFAULT_AUDIT_LOG: &str = "salesforce_metro_logs.json";

#[derive(Debug, Clone)]
pub enum SalesforceAuth {
    Session(SalesforceSession),
    Password(SalesforcePasswordCredentials),
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub spreadsheet_id: String,
    pub worksheet: String,
    pub service_account_file: Option<PathBuf>,
    pub source_dir: Option<PathBuf>,
    pub batch_size: NonZeroUsize,
    pub audit_log_path: PathBuf,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub salesforce: Option<SalesforceAuth>,
    pub api_version: String,
    pub schema: MetroSchema,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from any key lookup. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| non_blank(&lookup, key);
        let require = |key: &str| get(key).with_context(|| format!("{key} must be set"));

        let source_dir = get("METROSYNC_SOURCE_DIR").map(PathBuf::from);
        let service_account_file = get("SERVICE_ACCOUNT_FILE").map(PathBuf::from);
        if source_dir.is_none() && service_account_file.is_none() {
            bail!("SERVICE_ACCOUNT_FILE must be set unless METROSYNC_SOURCE_DIR is used");
        }

        let batch_size = match get("METROSYNC_BATCH_SIZE") {
            Some(raw) => parse_batch_size(&raw)?,
            None => NonZeroUsize::new(DEFAULT_BATCH_SIZE).context("default batch size")?,
        };

        let salesforce = match (get("SF_INSTANCE_URL"), get("SF_ACCESS_TOKEN")) {
            (Some(instance_url), Some(access_token)) => Some(SalesforceAuth::Session(SalesforceSession {
                instance_url,
                access_token,
            })),
            _ if get("SF_USERNAME").is_some() => {
                Some(SalesforceAuth::Password(SalesforcePasswordCredentials {
                    username: require("SF_USERNAME")?,
                    password: require("SF_PASSWORD")?,
                    security_token: get("SF_SECURITY_TOKEN").unwrap_or_default(),
                    client_id: require("SF_CLIENT_ID")?,
                    client_secret: require("SF_CLIENT_SECRET")?,
                    domain: get("SF_DOMAIN").unwrap_or_else(|| "login".to_string()),
                }))
            }
            _ => None,
        };

        Ok(Self {
            spreadsheet_id: require("SPREADSHEET_ID")?,
            worksheet: require("WORKSHEET_GID")?,
            service_account_file,
            source_dir,
            batch_size,
            audit_log_path: audit_log_path_from_lookup(&lookup),
            http_timeout_secs: match get("METROSYNC_HTTP_TIMEOUT_SECS") {
                Some(raw) => raw
                    .parse()
                    .with_context(|| format!("METROSYNC_HTTP_TIMEOUT_SECS={raw:?} is not a number"))?,
                None => 20,
            },
            user_agent: get("METROSYNC_USER_AGENT").unwrap_or_else(|| "metrosync/0.1".to_string()),
            salesforce,
            api_version: get("SF_API_VERSION").unwrap_or_else(|| DEFAULT_API_VERSION.to_string()),
            schema: MetroSchema::default(),
        })
    }
}

fn non_blank(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// `METROSYNC_AUDIT_LOG`, or the default file name when unset or blank.
pub fn audit_log_path_from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> PathBuf {
    non_blank(lookup, "METROSYNC_AUDIT_LOG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_AUDIT_LOG))
}

pub fn audit_log_path_from_env() -> PathBuf {
    audit_log_path_from_lookup(&|key: &str| std::env::var(key).ok())
}

pub fn parse_batch_size(raw: &str) -> Result<NonZeroUsize> {
    let value: usize = raw
        .trim()
        .parse()
        .with_context(|| format!("batch size {raw:?} is not a number"))?;
    NonZeroUsize::new(value).context("batch size must be greater than zero")
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub fetched_records: usize,
    pub cleaned_rows: usize,
    pub processed: usize,
    pub created: usize,
    pub updated: usize,
    pub failed: usize,
    pub audit_log_path: String,
    pub audit_log_sha256: String,
}

/// CRM writes happened but the audit log could not be written. Holds the
/// log so the per-row outcomes survive.
#[derive(Debug, Error)]
#[error("audit log with {} entries could not be saved to {}", .log.len(), .path.display())]
pub struct UnsavedAuditLog {
    pub path: PathBuf,
    pub log: AuditLog,
    #[source]
    pub source: anyhow::Error,
}

#[derive(Debug, Clone)]
pub struct SyncRun {
    pub summary: SyncRunSummary,
    pub log: AuditLog,
}

pub struct SyncPipeline {
    config: SyncConfig,
    source: Box<dyn RowSource>,
    crm: Box<dyn CrmClient>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, source: Box<dyn RowSource>, crm: Box<dyn CrmClient>) -> Self {
        Self {
            config,
            source,
            crm,
        }
    }

    /// Fetch and clean first; nothing is written to the CRM unless both succeed.
    pub async fn run_once(&self) -> Result<SyncRun> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let config = &self.config;

        let records = self
            .source
            .fetch(&config.spreadsheet_id, &config.worksheet)
            .await
            .with_context(|| {
                format!(
                    "fetching table {} from {}",
                    config.worksheet, config.spreadsheet_id
                )
            })?;
        let rows = clean(&records, &config.schema)?;
        info!(%run_id, fetched = records.len(), cleaned = rows.len(), "source rows cleaned");

        let mut engine = UpsertEngine::new(&*self.crm, config.schema.clone());
        engine.process(&rows, config.batch_size).await;
        let log = engine.into_log();

        let counts = log.summary();
        let flushed = log.flush(&config.audit_log_path).await;
        let persisted = match flushed {
            Ok(persisted) => persisted,
            Err(source) => {
                error!(
                    %run_id,
                    path = %config.audit_log_path.display(),
                    processed = counts.processed,
                    failed = counts.failed,
                    error = %source,
                    "audit log not saved"
                );
                return Err(UnsavedAuditLog {
                    path: config.audit_log_path.clone(),
                    log,
                    source,
                }
                .into());
            }
        };
        let finished_at = Utc::now();

        Ok(SyncRun {
            summary: SyncRunSummary {
                run_id,
                started_at,
                finished_at,
                fetched_records: records.len(),
                cleaned_rows: rows.len(),
                processed: counts.processed,
                created: counts.created,
                updated: counts.updated,
                failed: counts.failed,
                audit_log_path: persisted.path.display().to_string(),
                audit_log_sha256: persisted.content_hash,
            },
            log,
        })
    }
}

pub fn build_row_source(config: &SyncConfig) -> Result<Box<dyn RowSource>> {
    if let Some(dir) = &config.source_dir {
        return Ok(Box::new(JsonFileSource::new(dir.clone())));
    }
    let key_path = config
        .service_account_file
        .as_ref()
        .context("SERVICE_ACCOUNT_FILE must be set")?;
    let key = ServiceAccountKey::from_file(key_path)?;
    let http = HttpFetcher::new(http_config(config))?;
    Ok(Box::new(GoogleSheetsSource::new(http, key)))
}

/// `dry_run` swaps Salesforce for an empty in-memory CRM.
pub async fn build_crm_client(config: &SyncConfig, dry_run: bool) -> Result<Box<dyn CrmClient>> {
    if dry_run {
        return Ok(Box::new(InMemoryCrm::new()));
    }
    let http = HttpFetcher::new(HttpClientConfig {
        backoff: metrosync_storage::BackoffPolicy::none(),
        ..http_config(config)
    })?
    .client()
    .clone();

    match &config.salesforce {
        Some(SalesforceAuth::Session(session)) => Ok(Box::new(SalesforceClient::new(
            http,
            session.clone(),
            config.api_version.clone(),
        ))),
        Some(SalesforceAuth::Password(credentials)) => {
            let client = SalesforceClient::login(http, credentials, config.api_version.clone())
                .await
                .context("authenticating with salesforce")?;
            Ok(Box::new(client))
        }
        None => bail!(
            "salesforce credentials missing: set SF_INSTANCE_URL + SF_ACCESS_TOKEN or SF_USERNAME/SF_PASSWORD/SF_CLIENT_ID/SF_CLIENT_SECRET"
        ),
    }
}

fn http_config(config: &SyncConfig) -> HttpClientConfig {
    HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        ..Default::default()
    }
}

pub async fn build_pipeline(config: SyncConfig, dry_run: bool) -> Result<SyncPipeline> {
    let source = build_row_source(&config)?;
    let crm = build_crm_client(&config, dry_run).await?;
    Ok(SyncPipeline::new(config, source, crm))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const BASE: [(&str, &str); 3] = [
        ("SPREADSHEET_ID", "sheet-123"),
        ("WORKSHEET_GID", "1234567"),
        ("SERVICE_ACCOUNT_FILE", "creds/service-account.json"),
    ];

    #[test]
    fn defaults_apply_when_optional_values_are_unset() {
        let config = SyncConfig::from_lookup(lookup(&BASE)).expect("config");
        assert_eq!(config.batch_size.get(), DEFAULT_BATCH_SIZE);
        assert_eq!(config.audit_log_path, PathBuf::from(DEFAULT_AUDIT_LOG));
        assert_eq!(config.api_version, DEFAULT_API_VERSION);
        assert_eq!(config.http_timeout_secs, 20);
        assert!(config.salesforce.is_none());
        assert!(config.source_dir.is_none());
    }

    #[test]
    fn session_credentials_take_precedence_over_password_flow() {
        let mut pairs = BASE.to_vec();
        pairs.extend([
            ("SF_INSTANCE_URL", "https://example.my.salesforce.com"),
            ("SF_ACCESS_TOKEN", "00D-token"),
            ("SF_USERNAME", "ops@example.com"),
        ]);
        let config = SyncConfig::from_lookup(lookup(&pairs)).expect("config");
        assert!(matches!(config.salesforce, Some(SalesforceAuth::Session(_))));
    }

    #[test]
    fn password_flow_requires_client_credentials() {
        let mut pairs = BASE.to_vec();
        pairs.extend([("SF_USERNAME", "ops@example.com"), ("SF_PASSWORD", "pw")]);
        let err = SyncConfig::from_lookup(lookup(&pairs)).unwrap_err();
        assert!(err.to_string().contains("SF_CLIENT_ID"));

        pairs.extend([
            ("SF_CLIENT_ID", "cid"),
            ("SF_CLIENT_SECRET", "secret"),
            ("SF_DOMAIN", "test"),
        ]);
        let config = SyncConfig::from_lookup(lookup(&pairs)).expect("config");
        match config.salesforce {
            Some(SalesforceAuth::Password(creds)) => {
                assert_eq!(creds.domain, "test");
                assert_eq!(creds.security_token, "");
            }
            other => panic!("unexpected auth {other:?}"),
        }
    }

    #[test]
    fn batch_size_must_be_positive() {
        let mut pairs = BASE.to_vec();
        pairs.push(("METROSYNC_BATCH_SIZE", "0"));
        assert!(SyncConfig::from_lookup(lookup(&pairs)).is_err());

        assert_eq!(parse_batch_size(" 25 ").unwrap().get(), 25);
        assert!(parse_batch_size("many").is_err());
    }

    #[test]
    fn a_row_source_must_be_configured() {
        let err = SyncConfig::from_lookup(lookup(&BASE[..2])).unwrap_err();
        assert!(err.to_string().contains("SERVICE_ACCOUNT_FILE"));

        let mut pairs = BASE[..2].to_vec();
        pairs.push(("METROSYNC_SOURCE_DIR", "fixtures"));
        let config = SyncConfig::from_lookup(lookup(&pairs)).expect("config");
        assert_eq!(config.source_dir, Some(PathBuf::from("fixtures")));
    }

    #[test]
    fn blank_values_count_as_unset() {
        let mut pairs = BASE.to_vec();
        pairs.push(("METROSYNC_AUDIT_LOG", "   "));
        let config = SyncConfig::from_lookup(lookup(&pairs)).expect("config");
        assert_eq!(config.audit_log_path, PathBuf::from(DEFAULT_AUDIT_LOG));
    }

    #[test]
    fn audit_log_path_treats_blank_as_unset() {
        let blank = lookup(&[("METROSYNC_AUDIT_LOG", "  ")]);
        assert_eq!(
            audit_log_path_from_lookup(&blank),
            PathBuf::from(DEFAULT_AUDIT_LOG)
        );
        let set = lookup(&[("METROSYNC_AUDIT_LOG", " logs/run.json ")]);
        assert_eq!(
            audit_log_path_from_lookup(&set),
            PathBuf::from("logs/run.json")
        );
    }

    #[tokio::test]
    async fn missing_salesforce_credentials_fail_unless_dry_run() {
        let config = SyncConfig::from_lookup(lookup(&BASE)).expect("config");
        assert!(build_crm_client(&config, true).await.is_ok());
        let err = build_crm_client(&config, false).await.err().expect("error");
        assert!(err.to_string().contains("salesforce credentials missing"));
    }
}
