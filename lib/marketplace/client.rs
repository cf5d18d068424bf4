use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use super::error::MarketplaceError;
use super::types::{ApiEnvelope, EventResource, ListingResource, TokenResponse};
use crate::event_engine::{Event, EventPage, EventQuery, PageResult};

pub type GlobalRateLimiter = Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>;

/// Page size assumed for the full-page heuristic when a response omits `meta.perPage`.
pub const DEFAULT_EVENTS_PER_PAGE: usize = 100;

/// Tokens are refreshed this long before they expire.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

const EVENTS_QUERY_PATH: &str = "/v1/integration_api/events/query";
const LISTINGS_QUERY_PATH: &str = "/v1/integration_api/listings/query";
const LISTINGS_UPDATE_PATH: &str = "/v1/integration_api/listings/update";
const TOKEN_PATH: &str = "/v1/auth/token";

/// Token bucket: one request per `period`, bursting up to `burst`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub period: Duration,
    pub burst: u32,
}

impl RateLimit {
    fn quota(&self) -> Result<Quota, MarketplaceError> {
        let burst = NonZeroU32::new(self.burst)
            .ok_or_else(|| MarketplaceError::Config("rate limit burst must be > 0".to_string()))?;
        Quota::with_period(self.period)
            .map(|quota| quota.allow_burst(burst))
            .ok_or_else(|| MarketplaceError::Config("rate limit period must be > 0".to_string()))
    }
}

/// Separate budgets for reads and writes, as the hosted API enforces them separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub query: RateLimit,
    pub command: RateLimit,
}

impl RateLimitConfig {
    pub fn development() -> Self {
        Self {
            query: RateLimit {
                period: Duration::from_secs(1),
                burst: 100,
            },
            command: RateLimit {
                period: Duration::from_secs(2),
                burst: 100,
            },
        }
    }

    pub fn production() -> Self {
        Self {
            query: RateLimit {
                period: Duration::from_millis(100),
                burst: 100,
            },
            command: RateLimit {
                period: Duration::from_millis(500),
                burst: 100,
            },
        }
    }

    pub fn for_environment(development: bool) -> Self {
        if development {
            Self::development()
        } else {
            Self::production()
        }
    }
}

#[derive(Debug, Clone)]
pub struct MarketplaceClientConfig {
    pub api_url: String,
    pub auth_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub rate_limits: RateLimitConfig,
    pub request_timeout: Duration,
}

/// Filters for the listings query endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListingQuery {
    pub page: Option<u32>,
    pub per_page: Option<u32>,
    pub ids: Vec<String>,
    pub states: Vec<String>,
    /// `pub_listingType` public data filter.
    pub listing_type: Option<String>,
    pub created_at_end: Option<DateTime<Utc>>,
    pub sort: Option<String>,
}

impl ListingQuery {
    pub fn with_page(&self, page: u32, per_page: u32) -> Self {
        Self {
            page: Some(page),
            per_page: Some(per_page),
            ..self.clone()
        }
    }

    pub fn with_ids(&self, ids: Vec<String>) -> Self {
        Self {
            ids,
            page: None,
            per_page: None,
            sort: None,
            ..self.clone()
        }
    }

    pub fn to_params(&self) -> Vec<(String, String)> {
        let mut params = Vec::new();
        if let Some(page) = self.page {
            params.push(("page".to_string(), page.to_string()));
        }
        if let Some(per_page) = self.per_page {
            params.push(("perPage".to_string(), per_page.to_string()));
        }
        if !self.ids.is_empty() {
            params.push(("ids".to_string(), self.ids.join(",")));
        }
        if !self.states.is_empty() {
            params.push(("states".to_string(), self.states.join(",")));
        }
        if let Some(listing_type) = &self.listing_type {
            params.push(("pub_listingType".to_string(), listing_type.clone()));
        }
        if let Some(created_at_end) = self.created_at_end {
            params.push((
                "createdAtEnd".to_string(),
                created_at_end.to_rfc3339_opts(SecondsFormat::Millis, true),
            ));
        }
        if let Some(sort) = &self.sort {
            params.push(("sort".to_string(), sort.clone()));
        }
        params
    }
}

struct CachedToken {
    access_token: String,
    refresh_at: Instant,
}

/// Integration API client shared by every script in the process.
///
/// Both limiters are process-wide, so concurrently running scripts and their retries all
/// draw from the same budgets.
pub struct MarketplaceClient {
    http: reqwest::Client,
    config: MarketplaceClientConfig,
    token: Mutex<Option<CachedToken>>,
    query_limiter: GlobalRateLimiter,
    command_limiter: GlobalRateLimiter,
}

impl MarketplaceClient {
    pub fn new(config: MarketplaceClientConfig) -> Result<Self, MarketplaceError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        let query_limiter = Arc::new(RateLimiter::direct(config.rate_limits.query.quota()?));
        let command_limiter = Arc::new(RateLimiter::direct(config.rate_limits.command.quota()?));
        Ok(Self {
            http,
            config,
            token: Mutex::new(None),
            query_limiter,
            command_limiter,
        })
    }

    pub fn config(&self) -> &MarketplaceClientConfig {
        &self.config
    }

    /// Queries the events feed from `query`, optionally restricted to `event_types`.
    pub async fn query_events(
        &self,
        query: &EventQuery,
        event_types: &[String],
    ) -> Result<EventPage, MarketplaceError> {
        let mut params = match query {
            EventQuery::StartAfter(sequence_id) => {
                vec![("startAfterSequenceId".to_string(), sequence_id.to_string())]
            }
            EventQuery::CreatedAtStart(start) => vec![(
                "createdAtStart".to_string(),
                start.to_rfc3339_opts(SecondsFormat::Millis, true),
            )],
        };
        if !event_types.is_empty() {
            params.push(("eventTypes".to_string(), event_types.join(",")));
        }

        let envelope: ApiEnvelope<Vec<EventResource>> =
            self.get_json(EVENTS_QUERY_PATH, &params, "events").await?;
        let per_page = envelope
            .meta
            .per_page
            .map_or(DEFAULT_EVENTS_PER_PAGE, |per_page| per_page as usize);

        Ok(EventPage {
            events: envelope.data.into_iter().map(Event::from).collect(),
            per_page,
        })
    }

    pub async fn query_listings(
        &self,
        query: &ListingQuery,
    ) -> Result<PageResult<ListingResource>, MarketplaceError> {
        let envelope: ApiEnvelope<Vec<ListingResource>> = self
            .get_json(LISTINGS_QUERY_PATH, &query.to_params(), "listings")
            .await?;
        let total_pages = envelope
            .meta
            .total_pages
            .unwrap_or_else(|| query.page.unwrap_or(1));
        Ok(PageResult {
            items: envelope.data,
            total_pages,
        })
    }

    /// Looks up one listing by id, subject to the filters in `base`.
    pub async fn show_listing(
        &self,
        listing_id: &str,
        base: &ListingQuery,
    ) -> Result<Option<ListingResource>, MarketplaceError> {
        let page = self
            .query_listings(&base.with_ids(vec![listing_id.to_string()]))
            .await?;
        Ok(page
            .items
            .into_iter()
            .find(|listing| listing.id() == listing_id))
    }

    /// Merges `public_data` into the listing's public data.
    pub async fn update_listing_public_data(
        &self,
        listing_id: &str,
        public_data: Value,
    ) -> Result<(), MarketplaceError> {
        let body = json!({ "id": listing_id, "publicData": public_data });
        let url = self.api_url(LISTINGS_UPDATE_PATH);
        self.send_authorized(&self.command_limiter, "listings/update", |token| {
            self.http.post(&url).bearer_auth(token).json(&body)
        })
        .await?;
        debug!(
            event = "listing_public_data_updated",
            listing_id,
            "listing public data updated"
        );
        Ok(())
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(String, String)],
        resource: &str,
    ) -> Result<T, MarketplaceError> {
        let url = self.api_url(path);
        let response = self
            .send_authorized(&self.query_limiter, resource, |token| {
                self.http.get(&url).bearer_auth(token).query(params)
            })
            .await?;
        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Sends an authenticated request, refreshing the token once if the API answers 401.
    async fn send_authorized<F>(
        &self,
        limiter: &GlobalRateLimiter,
        resource: &str,
        build: F,
    ) -> Result<reqwest::Response, MarketplaceError>
    where
        F: Fn(&str) -> RequestBuilder,
    {
        let mut refreshed = false;
        loop {
            limiter.until_ready().await;
            let token = self.access_token().await?;
            let response = build(&token).send().await?;
            let status = response.status();

            if status == StatusCode::UNAUTHORIZED && !refreshed {
                refreshed = true;
                self.invalidate_token().await;
                continue;
            }
            if !status.is_success() {
                return Err(MarketplaceError::UnexpectedStatus {
                    resource: resource.to_string(),
                    status: status.as_u16(),
                });
            }
            return Ok(response);
        }
    }

    async fn access_token(&self) -> Result<String, MarketplaceError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.access_token.clone());
            }
        }

        let fresh = self.request_token().await?;
        let access_token = fresh.access_token.clone();
        *cached = Some(fresh);
        Ok(access_token)
    }

    async fn invalidate_token(&self) {
        *self.token.lock().await = None;
    }

    async fn request_token(&self) -> Result<CachedToken, MarketplaceError> {
        let url = format!("{}{TOKEN_PATH}", self.config.auth_url.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .form(&[
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("grant_type", "client_credentials"),
                ("scope", "integ"),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(MarketplaceError::Auth(format!(
                "token endpoint answered {}",
                status.as_u16()
            )));
        }

        let body = response.bytes().await?;
        let token: TokenResponse = serde_json::from_slice(&body)?;
        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_REFRESH_MARGIN);
        info!(
            event = "marketplace_token_acquired",
            expires_in_secs = token.expires_in,
            "acquired integration API token"
        );
        Ok(CachedToken {
            access_token: token.access_token,
            refresh_at: Instant::now() + lifetime,
        })
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}{path}", self.config.api_url.trim_end_matches('/'))
    }
}
