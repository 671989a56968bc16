use crate::config::{CdnCredentials, Config};
use crate::normalize::CdnResource;
use anyhow::{Context, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use mime::Mime;
use reqwest::{StatusCode, header};
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

const USER_AGENT: &str = "wallpaper-gateway/0.3";
const ADMIN_API_BASE: &str = "https://api.cloudinary.com/v1_1";
const MAX_ADMIN_RESULTS: usize = 500;
const ERROR_SNIPPET_BYTES: usize = 200;

#[derive(Clone)]
pub struct CdnClient {
    client: reqwest::Client,
    config: Arc<Config>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ResourceListing {
    #[serde(default)]
    pub resources: Vec<CdnResource>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Error)]
pub enum CdnFetchError {
    #[error("upstream response too large")]
    TooLarge,
    #[error("upstream returned {status}: {detail}")]
    UpstreamStatus { status: StatusCode, detail: String },
    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),
}

impl CdnClient {
    pub fn new(config: Arc<Config>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.cdn_timeout)
            .connect_timeout(config.cdn_connect_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(USER_AGENT)
            .build()
            .context("build reqwest client")?;
        Ok(Self { client, config })
    }

    pub fn cloud_name(&self) -> Option<&str> {
        self.config.cdn.as_ref().map(|cdn| cdn.cloud_name.as_str())
    }

    /// Lists image resources from the admin API. Missing credentials return
    /// an empty listing with a warning so gallery pages degrade to "no
    /// results" instead of failing.
    pub async fn list_resources(
        &self,
        folder: Option<&str>,
        prefix: Option<&str>,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<ResourceListing> {
        let Some(cdn) = self.config.cdn.as_ref() else {
            warn!("cdn listing requested without credentials; returning empty result set");
            return Ok(ResourceListing::default());
        };
        let url = format!(
            "{ADMIN_API_BASE}/{}/resources/image/upload",
            cdn.cloud_name
        );
        let max_results = limit.clamp(1, MAX_ADMIN_RESULTS);
        let mut query: Vec<(&str, String)> = vec![
            ("max_results", max_results.to_string()),
            ("tags", "true".to_string()),
        ];
        if let Some(prefix) = effective_prefix(folder, prefix) {
            query.push(("prefix", prefix));
        }
        if let Some(cursor) = cursor {
            query.push(("next_cursor", cursor.to_string()));
        }
        let response = self
            .client
            .get(&url)
            .header(header::AUTHORIZATION, basic_auth_header(cdn))
            .query(&query)
            .send()
            .await
            .context("cdn resource listing request")?;
        let status = response.status();
        if !status.is_success() {
            let detail = error_snippet(response).await;
            return Err(CdnFetchError::UpstreamStatus { status, detail })
                .context("cdn resource listing");
        }
        let listing = response
            .json::<ResourceListing>()
            .await
            .context("parse cdn resource listing")?;
        Ok(listing)
    }

    /// Opens a passthrough stream from a delivery URL. The caller owns the
    /// response body; only status and size are validated here.
    pub async fn open_stream(&self, url: &str) -> Result<ProxiedUpstream, CdnFetchError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let detail = error_snippet(response).await;
            return Err(CdnFetchError::UpstreamStatus { status, detail });
        }
        if let Some(length) = response.content_length() {
            if length > self.config.max_proxy_bytes {
                return Err(CdnFetchError::TooLarge);
            }
        }
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<Mime>().ok());
        Ok(ProxiedUpstream {
            content_type,
            content_length: response.content_length(),
            response,
        })
    }
}

pub struct ProxiedUpstream {
    pub content_type: Option<Mime>,
    pub content_length: Option<u64>,
    pub response: reqwest::Response,
}

fn basic_auth_header(cdn: &CdnCredentials) -> String {
    let credentials = format!("{}:{}", cdn.api_key, cdn.api_secret);
    format!("Basic {}", BASE64.encode(credentials))
}

/// `folder` scopes the listing to a folder subtree; `prefix` narrows it
/// further within that folder (or stands alone as a bare public-id prefix).
fn effective_prefix(folder: Option<&str>, prefix: Option<&str>) -> Option<String> {
    let folder = folder
        .map(|value| value.trim().trim_matches('/'))
        .filter(|value| !value.is_empty());
    let prefix = prefix.map(str::trim).filter(|value| !value.is_empty());
    match (folder, prefix) {
        (Some(folder), Some(prefix)) => Some(format!("{folder}/{prefix}")),
        (Some(folder), None) => Some(format!("{folder}/")),
        (None, Some(prefix)) => Some(prefix.to_string()),
        (None, None) => None,
    }
}

async fn error_snippet(response: reqwest::Response) -> String {
    match response.text().await {
        Ok(body) => {
            let mut snippet: String = body
                .chars()
                .filter(|ch| !ch.is_control())
                .take(ERROR_SNIPPET_BYTES)
                .collect();
            if snippet.is_empty() {
                snippet.push_str("(empty body)");
            }
            snippet
        }
        Err(_) => "(unreadable body)".to_string(),
    }
}
