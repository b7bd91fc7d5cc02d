//! Salesforce REST API client.
//!
//! Sessions come either pre-issued (instance URL + access token) or from the
//! OAuth2 username-password flow. CRM calls are never retried here: a failed
//! write is reported once and recorded by the caller.

use anyhow::{bail, Context};
use async_trait::async_trait;
use metrosync_core::CrmPayload;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, instrument};

use crate::{CreatedRecord, CrmClient, RemoteError};

pub const DEFAULT_API_VERSION: &str = "59.0";

#[derive(Debug, Clone)]
pub struct SalesforceSession {
    pub instance_url: String,
    pub access_token: String,
}

#[derive(Debug, Clone)]
pub struct SalesforcePasswordCredentials {
    pub username: String,
    pub password: String,
    pub security_token: String,
    pub client_id: String,
    pub client_secret: String,
    /// `login` for production, `test` for sandboxes.
    pub domain: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    instance_url: String,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(rename = "totalSize")]
    total_size: u64,
    #[serde(default)]
    records: Vec<QueryRecord>,
}

#[derive(Debug, Deserialize)]
struct QueryRecord {
    #[serde(rename = "Id")]
    id: String,
}

#[derive(Debug, Deserialize)]
struct ProviderError {
    message: String,
    #[serde(rename = "errorCode", default)]
    error_code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OAuthError {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SalesforceClient {
    http: reqwest::Client,
    session: SalesforceSession,
    api_version: String,
}

impl SalesforceClient {
    pub fn new(http: reqwest::Client, session: SalesforceSession, api_version: impl Into<String>) -> Self {
        let mut session = session;
        session.instance_url = session.instance_url.trim_end_matches('/').to_string();
        Self {
            http,
            session,
            api_version: api_version.into(),
        }
    }

    /// Exchange username, password and security token for a session.
    pub async fn login(
        http: reqwest::Client,
        credentials: &SalesforcePasswordCredentials,
        api_version: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let token_url = format!(
            "https://{}.salesforce.com/services/oauth2/token",
            credentials.domain
        );
        let password = format!("{}{}", credentials.password, credentials.security_token);
        let resp = http
            .post(&token_url)
            .form(&[
                ("grant_type", "password"),
                ("client_id", credentials.client_id.as_str()),
                ("client_secret", credentials.client_secret.as_str()),
                ("username", credentials.username.as_str()),
                ("password", password.as_str()),
            ])
            .send()
            .await
            .with_context(|| format!("requesting salesforce token from {token_url}"))?;

        let status = resp.status();
        let body = resp.text().await.context("reading salesforce token response")?;
        if !status.is_success() {
            bail!(
                "salesforce authentication failed: {}",
                parse_rejection(status.as_u16(), &body)
            );
        }
        let token: TokenResponse =
            serde_json::from_str(&body).context("parsing salesforce token response")?;
        debug!(instance_url = %token.instance_url, "salesforce session established");

        Ok(Self::new(
            http,
            SalesforceSession {
                instance_url: token.instance_url,
                access_token: token.access_token,
            },
            api_version,
        ))
    }

    pub fn instance_url(&self) -> &str {
        &self.session.instance_url
    }

    fn data_url(&self, path: &str) -> String {
        format!(
            "{}/services/data/v{}/{}",
            self.session.instance_url, self.api_version, path
        )
    }

    fn sobject_url(&self, object_type: &str, id: Option<&str>) -> Result<String, RemoteError> {
        if !is_api_name(object_type) {
            return Err(RemoteError::InvalidObjectType(object_type.to_string()));
        }
        Ok(match id {
            Some(id) => self.data_url(&format!(
                "sobjects/{object_type}/{}",
                urlencoding::encode(id)
            )),
            None => self.data_url(&format!("sobjects/{object_type}/")),
        })
    }
}

/// Salesforce object API names: a letter followed by letters, digits or underscores.
pub fn is_api_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Escape a value for use inside a single-quoted SOQL string literal.
pub fn escape_soql_literal(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{8}' => out.push_str("\\b"),
            '\u{c}' => out.push_str("\\f"),
            other => out.push(other),
        }
    }
    out
}

/// Turn an error body into a `RemoteError` carrying the provider's message.
pub fn parse_rejection(status: u16, body: &str) -> RemoteError {
    if let Ok(errors) = serde_json::from_str::<Vec<ProviderError>>(body) {
        if !errors.is_empty() {
            let message = errors
                .iter()
                .map(|e| match &e.error_code {
                    Some(code) => format!("{code}: {}", e.message),
                    None => e.message.clone(),
                })
                .collect::<Vec<_>>()
                .join("; ");
            return RemoteError::Rejected { status, message };
        }
    }
    if let Ok(err) = serde_json::from_str::<OAuthError>(body) {
        let message = match err.error_description {
            Some(description) => format!("{}: {description}", err.error),
            None => err.error,
        };
        return RemoteError::Rejected { status, message };
    }
    let trimmed = body.trim();
    let message = if trimmed.is_empty() {
        "empty response body".to_string()
    } else {
        trimmed.to_string()
    };
    RemoteError::Rejected { status, message }
}

fn transport(err: reqwest::Error) -> RemoteError {
    RemoteError::Transport(err.to_string())
}

async fn read_json(resp: reqwest::Response) -> Result<JsonValue, RemoteError> {
    let status = resp.status();
    let body = resp.text().await.map_err(transport)?;
    if !status.is_success() {
        return Err(parse_rejection(status.as_u16(), &body));
    }
    if body.trim().is_empty() {
        return Ok(json!({ "status": status.as_u16() }));
    }
    serde_json::from_str(&body).map_err(|e| RemoteError::Unexpected(e.to_string()))
}

#[async_trait]
impl CrmClient for SalesforceClient {
    #[instrument(level = "debug", skip(self))]
    async fn find(&self, object_type: &str, name: &str) -> Result<Option<String>, RemoteError> {
        if !is_api_name(object_type) {
            return Err(RemoteError::InvalidObjectType(object_type.to_string()));
        }
        let soql = format!(
            "SELECT Id FROM {object_type} WHERE Name = '{}' LIMIT 1",
            escape_soql_literal(name)
        );
        let resp = self
            .http
            .get(self.data_url("query/"))
            .query(&[("q", soql.as_str())])
            .bearer_auth(&self.session.access_token)
            .send()
            .await
            .map_err(transport)?;
        let body = read_json(resp).await?;
        let parsed: QueryResponse =
            serde_json::from_value(body).map_err(|e| RemoteError::Unexpected(e.to_string()))?;
        if parsed.total_size == 0 {
            return Ok(None);
        }
        Ok(parsed.records.into_iter().next().map(|r| r.id))
    }

    #[instrument(level = "debug", skip(self, payload), fields(name = %payload.name))]
    async fn create(
        &self,
        object_type: &str,
        payload: &CrmPayload,
    ) -> Result<CreatedRecord, RemoteError> {
        let url = self.sobject_url(object_type, None)?;
        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.session.access_token)
            .json(payload)
            .send()
            .await
            .map_err(transport)?;
        let response = read_json(resp).await?;
        let id = response
            .get("id")
            .and_then(JsonValue::as_str)
            .map(str::to_string)
            .ok_or_else(|| RemoteError::Unexpected(format!("create response without id: {response}")))?;
        Ok(CreatedRecord { id, response })
    }

    #[instrument(level = "debug", skip(self, payload), fields(name = %payload.name))]
    async fn update(
        &self,
        object_type: &str,
        id: &str,
        payload: &CrmPayload,
    ) -> Result<JsonValue, RemoteError> {
        let url = self.sobject_url(object_type, Some(id))?;
        let resp = self
            .http
            .patch(url)
            .bearer_auth(&self.session.access_token)
            .json(payload)
            .send()
            .await
            .map_err(transport)?;
        read_json(resp).await
    }
}
