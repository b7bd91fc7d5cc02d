//! Google Sheets row source authenticated with a service-account key.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{bail, Context};
use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use metrosync_core::RawRecord;
use metrosync_storage::HttpFetcher;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, error, instrument};

use crate::{RowSource, RowSourceError};

pub const SHEETS_SCOPES: [&str; 2] = [
    "https://www.googleapis.com/auth/spreadsheets.readonly",
    "https://www.googleapis.com/auth/drive.readonly",
];

const SHEETS_API_BASE: &str = "https://sheets.googleapis.com";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

/// The fields of a service-account JSON key that the token exchange needs.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

impl ServiceAccountKey {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading service account key {}", path.display()))?;
        serde_json::from_str(&data)
            .with_context(|| format!("parsing service account key {}", path.display()))
    }
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: String,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SheetProperties {
    #[serde(rename = "sheetId")]
    pub sheet_id: i64,
    pub title: String,
}

#[derive(Debug, Deserialize)]
struct SpreadsheetMeta {
    #[serde(default)]
    sheets: Vec<SheetEntry>,
}

#[derive(Debug, Deserialize)]
struct SheetEntry {
    properties: SheetProperties,
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<JsonValue>>,
}

/// Find a worksheet by numeric GID, or by title when the selector is not a number.
pub fn resolve_worksheet<'a>(
    sheets: &'a [SheetProperties],
    selector: &str,
) -> Option<&'a SheetProperties> {
    match selector.trim().parse::<i64>() {
        Ok(gid) => sheets.iter().find(|s| s.sheet_id == gid),
        Err(_) => sheets.iter().find(|s| s.title == selector),
    }
}

fn header_name(cell: &JsonValue) -> String {
    match cell {
        JsonValue::String(s) => s.clone(),
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}

/// Convert a row-major value grid into header-keyed records.
///
/// The first row is the header. Cells missing from short rows read as `""`;
/// columns with a blank header are dropped.
pub fn records_from_values(values: Vec<Vec<JsonValue>>) -> Result<Vec<RawRecord>, RowSourceError> {
    let mut rows = values.into_iter();
    let Some(header_row) = rows.next() else {
        return Ok(Vec::new());
    };

    let headers: Vec<String> = header_row.iter().map(header_name).collect();
    let mut seen = HashSet::new();
    for header in headers.iter().filter(|h| !h.is_empty()) {
        if !seen.insert(header.as_str()) {
            return Err(RowSourceError::Malformed(format!(
                "duplicate header {header:?}"
            )));
        }
    }

    Ok(rows
        .map(|row| {
            headers
                .iter()
                .enumerate()
                .filter(|(_, header)| !header.is_empty())
                .map(|(idx, header)| {
                    let cell = row
                        .get(idx)
                        .cloned()
                        .unwrap_or_else(|| JsonValue::String(String::new()));
                    (header.clone(), cell)
                })
                .collect::<RawRecord>()
        })
        .collect())
}

fn quoted_range(title: &str) -> String {
    format!("'{}'", title.replace('\'', "''"))
}

pub struct GoogleSheetsSource {
    http: HttpFetcher,
    key: ServiceAccountKey,
    api_base: String,
}

impl GoogleSheetsSource {
    pub fn new(http: HttpFetcher, key: ServiceAccountKey) -> Self {
        Self {
            http,
            key,
            api_base: SHEETS_API_BASE.to_string(),
        }
    }

    /// Point the values and metadata requests at another host.
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn signed_assertion(&self) -> anyhow::Result<String> {
        let now = Utc::now().timestamp();
        let claims = AssertionClaims {
            iss: &self.key.client_email,
            scope: SHEETS_SCOPES.join(" "),
            aud: &self.key.token_uri,
            iat: now,
            exp: now + 3600,
        };
        let encoding_key = EncodingKey::from_rsa_pem(self.key.private_key.as_bytes())
            .context("loading service account private key")?;
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &encoding_key)
            .context("signing service account assertion")
    }

    async fn access_token(&self) -> anyhow::Result<String> {
        let assertion = self.signed_assertion()?;
        let resp = self
            .http
            .client()
            .post(&self.key.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await
            .with_context(|| format!("requesting access token from {}", self.key.token_uri))?;
        let status = resp.status();
        let body = resp.text().await.context("reading token response")?;
        if !status.is_success() {
            bail!("google token exchange failed with http {status}: {body}");
        }
        let token: TokenResponse = serde_json::from_str(&body).context("parsing token response")?;
        Ok(token.access_token)
    }

    async fn worksheets(
        &self,
        token: &str,
        spreadsheet_id: &str,
        table_id: &str,
    ) -> Result<Vec<SheetProperties>, RowSourceError> {
        let url = format!(
            "{}/v4/spreadsheets/{}",
            self.api_base,
            urlencoding::encode(spreadsheet_id)
        );
        let meta: SpreadsheetMeta = match self
            .http
            .get_json(&url, Some(token), &[("fields", "sheets.properties(sheetId,title)")])
            .await
        {
            Ok(meta) => meta,
            Err(err) if err.status() == Some(404) => {
                error!(spreadsheet_id, "unable to open spreadsheet");
                return Err(RowSourceError::not_found(spreadsheet_id, table_id));
            }
            Err(err) => return Err(err.into()),
        };
        Ok(meta.sheets.into_iter().map(|s| s.properties).collect())
    }
}

#[async_trait]
impl RowSource for GoogleSheetsSource {
    #[instrument(level = "info", skip(self))]
    async fn fetch(
        &self,
        source_id: &str,
        table_id: &str,
    ) -> Result<Vec<RawRecord>, RowSourceError> {
        let token = self.access_token().await?;
        let sheets = self.worksheets(&token, source_id, table_id).await?;

        let Some(sheet) = resolve_worksheet(&sheets, table_id) else {
            error!(source_id, table_id, "worksheet not found in spreadsheet");
            return Err(RowSourceError::not_found(source_id, table_id));
        };

        let url = format!(
            "{}/v4/spreadsheets/{}/values/{}",
            self.api_base,
            urlencoding::encode(source_id),
            urlencoding::encode(&quoted_range(&sheet.title))
        );
        let range: ValueRange = self
            .http
            .get_json(
                &url,
                Some(token.as_str()),
                &[
                    ("valueRenderOption", "UNFORMATTED_VALUE"),
                    ("majorDimension", "ROWS"),
                ],
            )
            .await?;

        let records = records_from_values(range.values)?;
        debug!(title = %sheet.title, records = records.len(), "fetched worksheet");
        Ok(records)
    }
}
