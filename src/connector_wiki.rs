//! Wiki connectors: self-hosted (token auth) and cloud (basic auth).
//!
//! Talks to a REST wiki exposing spaces, a date-filterable page search,
//! and a plain-text page representation:
//!
//! | call | purpose |
//! |------|---------|
//! | `GET /api/spaces?start&limit` | list spaces (locations) |
//! | `GET /api/search?space&updated_since&start&limit` | changed pages, newest first |
//! | `GET /api/pages/{id}?representation=text` | page body, author, avatar |
//!
//! The crawl fans out in three levels: `feed_new_documents` enqueues one
//! `crawl_space` task per selected space; `crawl_space` pages through the
//! server-side `updated_since` search (the incremental filter runs
//! upstream, not here) and enqueues one `crawl_page` task per hit;
//! `crawl_page` fetches and emits one document. Every task carries all the
//! ids it needs, so workers can run them in any order.
//!
//! All outbound calls go through the source's token bucket; HTTP 429 is
//! retried with backoff without failing the task. Author avatars are
//! fetched at search time with a 1 second budget and kept in a bounded
//! cache.
//!
//! The cloud variant reuses the whole crawl by delegation; it only changes
//! the config fields and the auth header.

use anyhow::Result;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use moka::future::Cache;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::connector::{required_str, Connector, ConnectorClass, SourceContext};
use crate::error::ConnectorError;
use crate::models::{ConfigField, DocumentKind, DocumentRecord, FieldKind, Location};
use crate::ratelimit::RateLimiter;

const PAGE_SIZE: usize = 200;
const RATE_LIMIT_RETRIES: u32 = 3;
const AVATAR_CACHE_SIZE: u64 = 512;
const AVATAR_TIMEOUT: Duration = Duration::from_secs(1);

// ============ Config and auth ============

#[derive(Debug, Clone, Deserialize)]
struct WikiConfig {
    url: String,
    token: String,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    locations_to_index: Vec<Location>,
}

impl WikiConfig {
    fn parse(config: &Value) -> Result<Self, ConnectorError> {
        let parsed: WikiConfig = serde_json::from_value(config.clone())
            .map_err(|err| ConnectorError::InvalidConfig(err.to_string()))?;
        if parsed.url.trim().is_empty() {
            return Err(ConnectorError::InvalidConfig("url is required".into()));
        }
        Ok(parsed)
    }

    fn base_url(&self) -> &str {
        self.url.trim_end_matches('/')
    }
}

/// Shared HTTP plumbing for both wiki variants.
#[derive(Clone)]
struct WikiApi {
    config: WikiConfig,
    client: reqwest::Client,
    limiter: Option<RateLimiter>,
}

impl WikiApi {
    fn new(config: WikiConfig, limiter: Option<RateLimiter>) -> Result<Self, ConnectorError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| ConnectorError::Other(err.into()))?;
        Ok(Self {
            config,
            client,
            limiter,
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.username {
            Some(username) => request.basic_auth(username, Some(&self.config.token)),
            None => request.bearer_auth(&self.config.token),
        }
    }

    /// GET a JSON payload, honoring the token bucket and retrying 429s.
    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ConnectorError> {
        let url = format!("{}{}", self.config.base_url(), path);
        let mut attempt = 0u32;

        loop {
            if let Some(limiter) = &self.limiter {
                limiter.acquire().await;
            }

            let response = self
                .authorize(self.client.get(&url).query(query))
                .send()
                .await?;
            let status = response.status();

            if status.as_u16() == 429 && attempt < RATE_LIMIT_RETRIES {
                let backoff = Duration::from_secs(1 << attempt);
                warn!(%url, attempt, "wiki rate-limited us, backing off");
                tokio::time::sleep(backoff).await;
                attempt += 1;
                continue;
            }
            if status.as_u16() == 401 || status.as_u16() == 403 {
                return Err(ConnectorError::InvalidConfig(
                    "wiki rejected the credentials".into(),
                ));
            }
            if !status.is_success() {
                return Err(ConnectorError::Transient(format!(
                    "wiki returned {} for {}",
                    status, url
                )));
            }
            return Ok(response.json().await?);
        }
    }

    async fn list_spaces(&self, start: usize, limit: usize) -> Result<Vec<Location>, ConnectorError> {
        let page: SpacesPage = self
            .get_json(
                "/api/spaces",
                &[("start", start.to_string()), ("limit", limit.to_string())],
            )
            .await?;
        Ok(page
            .results
            .into_iter()
            .map(|space| Location {
                value: space.key,
                label: space.name,
            })
            .collect())
    }

    async fn list_all_spaces(&self) -> Result<Vec<Location>, ConnectorError> {
        let mut spaces = Vec::new();
        let mut start = 0;
        loop {
            let batch = self.list_spaces(start, PAGE_SIZE).await?;
            if batch.is_empty() {
                break;
            }
            start += batch.len();
            spaces.extend(batch);
        }
        info!(count = spaces.len(), "listed wiki spaces");
        Ok(spaces)
    }
}

#[derive(Deserialize)]
struct SpacesPage {
    results: Vec<SpaceEntry>,
}

#[derive(Deserialize)]
struct SpaceEntry {
    key: String,
    name: String,
}

#[derive(Deserialize)]
struct SearchPage {
    results: Vec<SearchHit>,
}

#[derive(Deserialize)]
struct SearchHit {
    id: String,
}

#[derive(Deserialize)]
struct PageBody {
    id: String,
    title: String,
    body: String,
    url: String,
    updated: String,
    author: PageAuthor,
}

#[derive(Deserialize)]
struct PageAuthor {
    name: String,
    #[serde(default)]
    avatar_url: Option<String>,
}

// ============ Self-hosted class ============

pub struct WikiClass {
    avatars: Cache<String, Option<String>>,
}

impl WikiClass {
    pub fn new() -> Self {
        Self {
            avatars: Cache::new(AVATAR_CACHE_SIZE),
        }
    }

    async fn fetch_avatar(&self, config: &WikiConfig, image_url: &str) -> Option<String> {
        let key = format!("{}|{}", config.token, image_url);
        let token = config.token.clone();
        let url = image_url.to_string();

        self.avatars
            .get_with(key, async move {
                let client = reqwest::Client::builder()
                    .timeout(AVATAR_TIMEOUT)
                    .build()
                    .ok()?;
                let response = client.get(&url).bearer_auth(&token).send().await.ok()?;
                if !response.status().is_success() {
                    return None;
                }
                let bytes = response.bytes().await.ok()?;
                Some(format!("data:image/png;base64,{}", BASE64.encode(&bytes)))
            })
            .await
    }
}

impl Default for WikiClass {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConnectorClass for WikiClass {
    fn name(&self) -> &'static str {
        "wiki"
    }

    fn display_name(&self) -> &'static str {
        "Wiki Self-Hosted"
    }

    fn config_fields(&self) -> Vec<ConfigField> {
        vec![
            ConfigField::new("url")
                .with_label("Wiki URL")
                .with_placeholder("https://wiki.example.com"),
            ConfigField::new("token")
                .with_kind(FieldKind::Password)
                .with_label("Personal Access Token"),
        ]
    }

    fn has_prerequisites(&self) -> bool {
        true
    }

    fn rate_limit_per_second(&self) -> f64 {
        5.0
    }

    async fn validate_config(&self, config: &Value) -> Result<(), ConnectorError> {
        let parsed = WikiConfig::parse(config)?;
        let api = WikiApi::new(parsed, None)?;
        // One real listing call; a typo in the URL or token fails here,
        // not after the source is saved.
        match api.list_spaces(0, 1).await {
            Ok(_) => Ok(()),
            Err(ConnectorError::InvalidConfig(msg)) => Err(ConnectorError::InvalidConfig(msg)),
            Err(err) => Err(ConnectorError::InvalidConfig(err.to_string())),
        }
    }

    async fn list_locations(&self, config: &Value) -> Result<Vec<Location>, ConnectorError> {
        let api = WikiApi::new(WikiConfig::parse(config)?, None)?;
        api.list_all_spaces().await
    }

    async fn author_image(&self, config: &Value, image_url: &str) -> Option<String> {
        let parsed = WikiConfig::parse(config).ok()?;
        self.fetch_avatar(&parsed, image_url).await
    }

    fn build(&self, ctx: Arc<SourceContext>) -> Result<Box<dyn Connector>, ConnectorError> {
        let config = WikiConfig::parse(&ctx.config)?;
        let api = WikiApi::new(config, Some(ctx.limiter.clone()))?;
        Ok(Box::new(WikiConnector { ctx, api }))
    }
}

// ============ Cloud class (delegation) ============

/// The cloud-hosted wiki: same API and crawl, basic auth instead of a
/// bearer token. Delegates everything it can to [`WikiClass`].
pub struct WikiCloudClass {
    inner: WikiClass,
}

impl WikiCloudClass {
    pub fn new() -> Self {
        Self {
            inner: WikiClass::new(),
        }
    }
}

impl Default for WikiCloudClass {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConnectorClass for WikiCloudClass {
    fn name(&self) -> &'static str {
        "wiki_cloud"
    }

    fn display_name(&self) -> &'static str {
        "Wiki Cloud"
    }

    fn config_fields(&self) -> Vec<ConfigField> {
        vec![
            ConfigField::new("url")
                .with_label("Wiki URL")
                .with_placeholder("https://example.wikicloud.com"),
            ConfigField::new("token")
                .with_kind(FieldKind::Password)
                .with_label("API Token"),
            ConfigField::new("username").with_placeholder("user@example.com"),
        ]
    }

    fn has_prerequisites(&self) -> bool {
        true
    }

    fn rate_limit_per_second(&self) -> f64 {
        self.inner.rate_limit_per_second()
    }

    async fn validate_config(&self, config: &Value) -> Result<(), ConnectorError> {
        let parsed = WikiConfig::parse(config)?;
        if parsed.username.as_deref().unwrap_or("").is_empty() {
            return Err(ConnectorError::InvalidConfig("username is required".into()));
        }
        self.inner.validate_config(config).await
    }

    async fn list_locations(&self, config: &Value) -> Result<Vec<Location>, ConnectorError> {
        self.inner.list_locations(config).await
    }

    async fn author_image(&self, config: &Value, image_url: &str) -> Option<String> {
        self.inner.author_image(config, image_url).await
    }

    fn build(&self, ctx: Arc<SourceContext>) -> Result<Box<dyn Connector>, ConnectorError> {
        self.inner.build(ctx)
    }
}

// ============ Connector instance ============

pub struct WikiConnector {
    ctx: Arc<SourceContext>,
    api: WikiApi,
}

#[async_trait]
impl Connector for WikiConnector {
    async fn feed_new_documents(&self) -> Result<(), ConnectorError> {
        let spaces = if self.api.config.locations_to_index.is_empty() {
            self.api.list_all_spaces().await?
        } else {
            self.api.config.locations_to_index.clone()
        };

        info!(spaces = spaces.len(), "seeding wiki crawl");
        for space in spaces {
            self.ctx
                .enqueue(
                    "crawl_space",
                    json!({ "space": space.value, "label": space.label }),
                )
                .await?;
        }
        Ok(())
    }

    async fn dispatch(
        &self,
        method: &str,
        kwargs: &Map<String, Value>,
    ) -> Result<(), ConnectorError> {
        match method {
            "crawl_space" => {
                self.crawl_space(
                    required_str(kwargs, "space")?,
                    required_str(kwargs, "label")?,
                )
                .await
            }
            "crawl_page" => {
                self.crawl_page(
                    required_str(kwargs, "page_id")?,
                    required_str(kwargs, "label")?,
                )
                .await
            }
            other => Err(ConnectorError::UnknownMethod(other.to_string())),
        }
    }
}

impl WikiConnector {
    /// Page through the server-side date-filtered search and fan out one
    /// task per changed page.
    async fn crawl_space(&self, space: &str, label: &str) -> Result<(), ConnectorError> {
        let since = self.ctx.last_index_time().to_rfc3339();
        info!(space, %since, "crawling wiki space");

        let mut start = 0;
        loop {
            let page: SearchPage = self
                .api
                .get_json(
                    "/api/search",
                    &[
                        ("space", space.to_string()),
                        ("updated_since", since.clone()),
                        ("start", start.to_string()),
                        ("limit", PAGE_SIZE.to_string()),
                    ],
                )
                .await?;

            let batch = page.results.len();
            for hit in page.results {
                self.ctx
                    .enqueue("crawl_page", json!({ "page_id": hit.id, "label": label }))
                    .await?;
            }
            if batch < PAGE_SIZE {
                break;
            }
            start += batch;
        }
        Ok(())
    }

    /// Fetch one page and emit it. Pages the token cannot read are skipped,
    /// not retried; a broken page must not wedge the crawl.
    async fn crawl_page(&self, page_id: &str, label: &str) -> Result<(), ConnectorError> {
        let fetched: PageBody = match self
            .api
            .get_json(
                &format!("/api/pages/{}", page_id),
                &[("representation", "text".to_string())],
            )
            .await
        {
            Ok(fetched) => fetched,
            Err(ConnectorError::Transient(msg)) if msg.contains("404") => {
                warn!(page_id, "wiki page vanished, skipping");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let timestamp = DateTime::parse_from_rfc3339(&fetched.updated)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());

        self.ctx
            .emit(DocumentRecord {
                source_id: 0,
                external_id: fetched.id,
                kind: DocumentKind::Document,
                file_kind: None,
                title: fetched.title,
                content: fetched.body,
                author: fetched.author.name,
                author_image_url: fetched.author.avatar_url,
                location: label.to_string(),
                url: fetched.url,
                timestamp,
                status: None,
                is_active: None,
                children: Vec::new(),
            })
            .await?;
        Ok(())
    }
}
