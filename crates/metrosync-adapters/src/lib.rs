//! Row source + CRM client contracts and their implementations.

use async_trait::async_trait;
use metrosync_core::{CrmPayload, RawRecord};
use metrosync_storage::FetchError;
use serde_json::Value as JsonValue;
use thiserror::Error;

mod file;
mod memory;
mod salesforce;
mod sheets;

pub use file::JsonFileSource;
pub use memory::InMemoryCrm;
pub use salesforce::{
    escape_soql_literal, is_api_name, parse_rejection, SalesforceClient,
    SalesforcePasswordCredentials, SalesforceSession, DEFAULT_API_VERSION,
};
pub use sheets::{
    records_from_values, resolve_worksheet, GoogleSheetsSource, ServiceAccountKey,
    SheetProperties, SHEETS_SCOPES,
};

pub const CRATE_NAME: &str = "metrosync-adapters";

#[derive(Debug, Error)]
pub enum RowSourceError {
    #[error("table {table_id} not found in source {source_id}")]
    NotFound { source_id: String, table_id: String },
    #[error("malformed table data: {0}")]
    Malformed(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl RowSourceError {
    pub fn not_found(source_id: &str, table_id: &str) -> Self {
        Self::NotFound {
            source_id: source_id.to_string(),
            table_id: table_id.to_string(),
        }
    }
}

/// Failure reported by, or while talking to, the CRM. Recorded per row.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("{message} (http {status})")]
    Rejected { status: u16, message: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unexpected response: {0}")]
    Unexpected(String),
    #[error("invalid object type {0:?}")]
    InvalidObjectType(String),
}

/// Anything that can hand back the ordered records of one table.
#[async_trait]
pub trait RowSource: Send + Sync {
    async fn fetch(&self, source_id: &str, table_id: &str)
        -> Result<Vec<RawRecord>, RowSourceError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreatedRecord {
    pub id: String,
    pub response: JsonValue,
}

/// Authenticated CRM handle. Lookups are exact-match on the record name.
#[async_trait]
pub trait CrmClient: Send + Sync {
    async fn find(&self, object_type: &str, name: &str) -> Result<Option<String>, RemoteError>;

    async fn create(
        &self,
        object_type: &str,
        payload: &CrmPayload,
    ) -> Result<CreatedRecord, RemoteError>;

    async fn update(
        &self,
        object_type: &str,
        id: &str,
        payload: &CrmPayload,
    ) -> Result<JsonValue, RemoteError>;
}

#[async_trait]
impl<T: RowSource + ?Sized> RowSource for &T {
    async fn fetch(
        &self,
        source_id: &str,
        table_id: &str,
    ) -> Result<Vec<RawRecord>, RowSourceError> {
        (**self).fetch(source_id, table_id).await
    }
}

#[async_trait]
impl<T: CrmClient + ?Sized> CrmClient for &T {
    async fn find(&self, object_type: &str, name: &str) -> Result<Option<String>, RemoteError> {
        (**self).find(object_type, name).await
    }

    async fn create(
        &self,
        object_type: &str,
        payload: &CrmPayload,
    ) -> Result<CreatedRecord, RemoteError> {
        (**self).create(object_type, payload).await
    }

    async fn update(
        &self,
        object_type: &str,
        id: &str,
        payload: &CrmPayload,
    ) -> Result<JsonValue, RemoteError> {
        (**self).update(object_type, id, payload).await
    }
}
