use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::event_engine::{
    process_items_isolated, run_with_retry, BackfillSweep, Error, HandlerError, ItemOutcome,
    PageContext, PageProcessor, PageResult, PageSource, RetryPolicy, SourceError, SweepConfig,
    SweepReport, SweepStats,
};
use crate::marketplace::{ListingQuery, ListingResource, MarketplaceClient, MarketplaceError};

pub const SWEEP_NAME: &str = "normalizeKeywords";
pub const LISTINGS_PER_PAGE: u32 = 50;
/// Deepest page the listings query serves.
pub const MAX_PAGE: u32 = 100;
pub const ALLOWED_STATES: [&str; 2] = ["published", "pendingApproval"];
pub const LISTING_TYPE: &str = "product-listing";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizeSettings {
    pub per_page: u32,
    pub start_page: u32,
    pub max_page: u32,
    /// Listings updated concurrently within a page.
    pub concurrency: usize,
    /// Upper bound on `createdAt`, used to keep the sweep under the pagination cap.
    pub created_at_end: Option<DateTime<Utc>>,
    pub inter_page_delay: Duration,
    pub page_timeout: Option<Duration>,
    pub retry_policy: RetryPolicy,
}

impl Default for NormalizeSettings {
    fn default() -> Self {
        Self {
            per_page: LISTINGS_PER_PAGE,
            start_page: 1,
            max_page: MAX_PAGE,
            concurrency: 5,
            created_at_end: None,
            inter_page_delay: Duration::ZERO,
            page_timeout: Some(Duration::from_secs(120)),
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl NormalizeSettings {
    pub fn base_query(&self) -> ListingQuery {
        ListingQuery {
            states: ALLOWED_STATES.iter().map(|state| state.to_string()).collect(),
            listing_type: Some(LISTING_TYPE.to_string()),
            created_at_end: self.created_at_end,
            sort: Some("createdAt".to_string()),
            ..ListingQuery::default()
        }
    }

    pub fn sweep_config(&self) -> SweepConfig {
        SweepConfig {
            start_page: self.start_page,
            max_page: Some(self.max_page),
            page_timeout: self.page_timeout,
            inter_page_delay: self.inter_page_delay,
        }
    }
}

/// Splits a raw keywords string on whitespace and commas, dropping empty tokens.
pub fn parse_keywords(raw: &str) -> Vec<String> {
    raw.split(|c: char| c.is_whitespace() || c == ',')
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

/// Lowercases and drops case-insensitive duplicates, keeping first-seen order.
pub fn dedupe_keywords(keywords: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    keywords
        .iter()
        .map(|keyword| keyword.trim().to_lowercase())
        .filter(|keyword| !keyword.is_empty() && seen.insert(keyword.clone()))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeywordChange {
    NoKeywords,
    Unchanged,
    /// The normalized keywords, space-joined as stored in public data.
    Normalized(String),
}

pub fn normalize_keywords(raw: &str) -> KeywordChange {
    let existing = parse_keywords(raw);
    if existing.is_empty() {
        return KeywordChange::NoKeywords;
    }
    let normalized = dedupe_keywords(&existing);
    if normalized == existing {
        KeywordChange::Unchanged
    } else {
        KeywordChange::Normalized(normalized.join(" "))
    }
}

/// Writes a listing's normalized keywords.
pub trait ListingUpdater: Send + Sync {
    fn update_keywords<'a>(
        &'a self,
        listing_id: &'a str,
        keywords: &'a str,
    ) -> BoxFuture<'a, Result<(), HandlerError>>;
}

impl<T> ListingUpdater for Arc<T>
where
    T: ListingUpdater + ?Sized,
{
    fn update_keywords<'a>(
        &'a self,
        listing_id: &'a str,
        keywords: &'a str,
    ) -> BoxFuture<'a, Result<(), HandlerError>> {
        (**self).update_keywords(listing_id, keywords)
    }
}

impl ListingUpdater for MarketplaceClient {
    fn update_keywords<'a>(
        &'a self,
        listing_id: &'a str,
        keywords: &'a str,
    ) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async move {
            self.update_listing_public_data(listing_id, json!({ "keywords": keywords }))
                .await
                .map_err(|err| HandlerError {
                    retryable: err.is_retryable(),
                    message: err.to_string(),
                })
        })
    }
}

/// Published and pending product listings, oldest first.
pub struct ListingPageSource {
    client: Arc<MarketplaceClient>,
    base: ListingQuery,
    per_page: u32,
    retry_policy: RetryPolicy,
}

impl ListingPageSource {
    pub fn new(client: Arc<MarketplaceClient>, settings: &NormalizeSettings) -> Self {
        Self {
            client,
            base: settings.base_query(),
            per_page: settings.per_page,
            retry_policy: settings.retry_policy,
        }
    }
}

impl PageSource<ListingResource> for ListingPageSource {
    fn query_page<'a>(
        &'a self,
        page: u32,
    ) -> BoxFuture<'a, Result<PageResult<ListingResource>, SourceError>> {
        Box::pin(async move {
            let query = self.base.with_page(page, self.per_page);
            run_with_retry(
                &self.retry_policy,
                |_| self.client.query_listings(&query),
                MarketplaceError::is_retryable,
            )
            .await
            .map(|(result, _)| result)
            .map_err(|terminal| SourceError::from(terminal.error))
        })
    }

    fn fetch_one<'a>(
        &'a self,
        id: &'a str,
    ) -> BoxFuture<'a, Result<Option<ListingResource>, SourceError>> {
        Box::pin(async move {
            self.client
                .show_listing(id, &self.base)
                .await
                .map_err(SourceError::from)
        })
    }
}

/// Rewrites each listing's keywords into their normalized form, skipping listings that
/// are already normalized or have none.
pub struct KeywordNormalizer<U> {
    updater: U,
    concurrency: usize,
    retry_policy: RetryPolicy,
}

impl<U: ListingUpdater> KeywordNormalizer<U> {
    pub fn new(updater: U, concurrency: usize, retry_policy: RetryPolicy) -> Self {
        Self {
            updater,
            concurrency,
            retry_policy,
        }
    }

    async fn normalize_listing(&self, listing: &ListingResource) -> Result<ItemOutcome, HandlerError> {
        let original = listing.keywords();
        let normalized = match normalize_keywords(original) {
            KeywordChange::NoKeywords | KeywordChange::Unchanged => return Ok(ItemOutcome::Skipped),
            KeywordChange::Normalized(normalized) => normalized,
        };

        run_with_retry(
            &self.retry_policy,
            |_| self.updater.update_keywords(listing.id(), &normalized),
            |err: &HandlerError| err.retryable,
        )
        .await
        .map_err(|terminal| {
            warn!(
                event = "listing_keywords_update_failed",
                listing_id = listing.id(),
                attempts = terminal.attempts,
                error = %terminal.error,
                "failed to update listing keywords"
            );
            terminal.error
        })?;

        debug!(
            event = "listing_keywords_normalized",
            listing_id = listing.id(),
            before = parse_keywords(original).len(),
            after = parse_keywords(&normalized).len(),
            "listing keywords normalized"
        );
        Ok(ItemOutcome::Updated)
    }
}

impl<U: ListingUpdater> PageProcessor<ListingResource> for KeywordNormalizer<U> {
    fn process_page<'a>(
        &'a self,
        items: &'a [ListingResource],
        context: PageContext,
    ) -> BoxFuture<'a, SweepStats> {
        Box::pin(async move {
            let stats = process_items_isolated(items, self.concurrency, |listing| {
                self.normalize_listing(listing)
            })
            .await;
            info!(
                event = "normalize_keywords_page",
                page = context.page,
                total_pages = context.total_pages,
                processed = stats.processed,
                updated = stats.updated,
                skipped = stats.skipped,
                failed = stats.failed,
                last_created_at = ?items.last().and_then(|listing| listing.attributes.created_at),
                "normalized keywords page"
            );
            stats
        })
    }
}

/// Runs the keyword normalization, either over every matching listing or for `listing_id` only.
pub async fn run_normalize_keywords<S, U>(
    source: &S,
    processor: &KeywordNormalizer<U>,
    settings: &NormalizeSettings,
    listing_id: Option<&str>,
    cancel: CancellationToken,
) -> Result<SweepReport, Error>
where
    S: PageSource<ListingResource> + ?Sized,
    U: ListingUpdater,
{
    let sweep = BackfillSweep::new(SWEEP_NAME, settings.sweep_config()).with_cancellation(cancel);
    match listing_id {
        Some(listing_id) => {
            let stats = sweep.run_single(source, processor, listing_id).await?;
            Ok(SweepReport {
                stats,
                last_completed_page: Some(1),
                ..SweepReport::default()
            })
        }
        None => Ok(sweep.run(source, processor).await),
    }
}

/// Listing ids are UUIDs (`8-4-4-4-12` hex groups).
pub fn is_valid_listing_id(listing_id: &str) -> bool {
    let groups: Vec<&str> = listing_id.split('-').collect();
    groups.len() == 5
        && groups
            .iter()
            .zip([8, 4, 4, 4, 12])
            .all(|(group, len)| group.len() == len && group.chars().all(|c| c.is_ascii_hexdigit()))
}
