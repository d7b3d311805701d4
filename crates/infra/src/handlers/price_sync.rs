//! Price synchronization: refresh tracked products from the upstream price source.
//!
//! For every tracked product the handler fetches the current quote, compares it
//! with the last recorded price and records it when it changed. A product whose
//! fetch fails is counted and skipped; only a run where every fetch failed is
//! reported as an error (retryable, since the source is most likely down).

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use tracing::{debug, info, instrument, warn};

use pricekeep_core::{ExecutionError, JobPayload, JobType, JsonMap, ProgressUpdate};

use crate::jobs::{JobHandler, JobOutput, ProgressReporter};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedProduct {
    pub id: String,
    pub name: String,
    /// Identifier of the product at the price source.
    pub source_ref: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceQuote {
    pub product_id: String,
    pub price_cents: i64,
    pub currency: String,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum PriceFetchError {
    #[error("price source unreachable: {0}")]
    Unreachable(String),
    #[error("no price for {0}")]
    NotFound(String),
    #[error("price source returned HTTP {0}")]
    HttpStatus(u16),
    #[error("invalid price response: {0}")]
    Invalid(String),
}

/// The product catalog and its price history.
#[async_trait]
pub trait PriceCatalog: Send + Sync {
    /// Active tracked products, restricted to `ids` when given.
    async fn tracked_products(
        &self,
        ids: Option<&[String]>,
    ) -> Result<Vec<TrackedProduct>, ExecutionError>;

    async fn latest_price(&self, product_id: &str) -> Result<Option<i64>, ExecutionError>;

    async fn record_price(&self, quote: &PriceQuote) -> Result<(), ExecutionError>;
}

/// Upstream source of current prices.
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn fetch(&self, product: &TrackedProduct) -> Result<PriceQuote, PriceFetchError>;
}

#[derive(Debug, Default)]
struct SyncTally {
    changed: usize,
    unchanged: usize,
    failed: usize,
}

pub struct PriceSyncHandler {
    catalog: Arc<dyn PriceCatalog>,
    source: Arc<dyn PriceSource>,
}

impl PriceSyncHandler {
    pub fn new(catalog: Arc<dyn PriceCatalog>, source: Arc<dyn PriceSource>) -> Self {
        Self { catalog, source }
    }
}

#[async_trait]
impl JobHandler for PriceSyncHandler {
    fn job_type(&self) -> JobType {
        JobType::PriceSync
    }

    async fn execute(
        &self,
        payload: &JsonMap,
        report: &ProgressReporter,
    ) -> Result<JobOutput, ExecutionError> {
        let JobPayload::PriceSync(payload) = JobPayload::parse(JobType::PriceSync, payload)
            .map_err(|e| ExecutionError::fatal(e.to_string()))?
        else {
            return Err(ExecutionError::fatal("payload does not describe a price sync"));
        };

        report.running(2, "loading tracked products");
        let products = self
            .catalog
            .tracked_products(payload.product_ids.as_deref())
            .await?;
        let total = products.len();

        if total == 0 {
            report.finalizing(100, "nothing to sync");
            return Ok(JobOutput::new("no tracked products matched")
                .with_info("checked", 0)
                .with_info("dryRun", payload.dry_run));
        }

        let started = Instant::now();
        let mut tally = SyncTally::default();
        let mut last_error = None;

        for (i, product) in products.iter().enumerate() {
            match self.source.fetch(product).await {
                Ok(quote) => {
                    let previous = self.catalog.latest_price(&product.id).await?;
                    if previous == Some(quote.price_cents) {
                        tally.unchanged += 1;
                    } else {
                        tally.changed += 1;
                        debug!(
                            product_id = %product.id,
                            previous = ?previous,
                            current = quote.price_cents,
                            "price changed"
                        );
                        if !payload.dry_run {
                            self.catalog.record_price(&quote).await?;
                        }
                    }
                }
                Err(err) => {
                    warn!(product_id = %product.id, error = %err, "price fetch failed");
                    tally.failed += 1;
                    last_error = Some(err.to_string());
                }
            }

            let done = i + 1;
            let mut update = ProgressUpdate::new()
                .percent((5 + 90 * done / total) as u8)
                .step(format!("synced {done}/{total} products"));
            if done < total {
                update = update.estimated(started.elapsed() / done as u32 * (total - done) as u32);
            }
            report.report(update);
        }

        if tally.failed == total {
            warn!(
                failed = tally.failed,
                last_error = last_error.as_deref().unwrap_or_default(),
                "every price fetch failed"
            );
            return Err(ExecutionError::retryable("source unreachable"));
        }

        report.finalizing(100, "done");

        let mut summary = format!(
            "checked {total} products: {} changed, {} unchanged, {} failed",
            tally.changed, tally.unchanged, tally.failed
        );
        if payload.dry_run {
            summary.push_str(" (dry run)");
        }
        info!(
            checked = total,
            changed = tally.changed,
            failed = tally.failed,
            dry_run = payload.dry_run,
            "price sync finished"
        );

        Ok(JobOutput::new(summary)
            .with_info("checked", total)
            .with_info("changed", tally.changed)
            .with_info("unchanged", tally.unchanged)
            .with_info("failed", tally.failed)
            .with_info("dryRun", payload.dry_run))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PriceResponse {
    price_cents: i64,
    currency: String,
}

/// Fetches `GET {base_url}/prices/{source_ref}` returning
/// `{"priceCents": 199, "currency": "EUR"}`.
#[derive(Debug, Clone)]
pub struct HttpPriceSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPriceSource {
    pub fn new(base_url: impl Into<String>) -> Result<Self, PriceFetchError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| PriceFetchError::Unreachable(format!("failed to build HTTP client: {e}")))?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl PriceSource for HttpPriceSource {
    #[instrument(skip_all, fields(product_id = %product.id), err)]
    async fn fetch(&self, product: &TrackedProduct) -> Result<PriceQuote, PriceFetchError> {
        let url = format!("{}/prices/{}", self.base_url, product.source_ref);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| PriceFetchError::Unreachable(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(PriceFetchError::NotFound(product.source_ref.clone()));
        }
        if !status.is_success() {
            return Err(PriceFetchError::HttpStatus(status.as_u16()));
        }

        let body: PriceResponse = response
            .json()
            .await
            .map_err(|e| PriceFetchError::Invalid(e.to_string()))?;
        if body.price_cents < 0 {
            return Err(PriceFetchError::Invalid(format!(
                "negative price {} for {}",
                body.price_cents, product.source_ref
            )));
        }

        Ok(PriceQuote {
            product_id: product.id.clone(),
            price_cents: body.price_cents,
            currency: body.currency,
            observed_at: Utc::now(),
        })
    }
}

/// Stand-in used when no price source URL is configured; every fetch fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredPriceSource;

#[async_trait]
impl PriceSource for UnconfiguredPriceSource {
    async fn fetch(&self, _product: &TrackedProduct) -> Result<PriceQuote, PriceFetchError> {
        Err(PriceFetchError::Unreachable(
            "PRICE_SOURCE_URL is not configured".to_string(),
        ))
    }
}

/// Fixed prices keyed by `source_ref`; unknown refs are `NotFound`.
#[derive(Debug, Default)]
pub struct StaticPriceSource {
    prices: HashMap<String, i64>,
    currency: String,
}

impl StaticPriceSource {
    pub fn new(currency: impl Into<String>) -> Self {
        Self {
            prices: HashMap::new(),
            currency: currency.into(),
        }
    }

    pub fn with_price(mut self, source_ref: impl Into<String>, price_cents: i64) -> Self {
        self.prices.insert(source_ref.into(), price_cents);
        self
    }
}

#[async_trait]
impl PriceSource for StaticPriceSource {
    async fn fetch(&self, product: &TrackedProduct) -> Result<PriceQuote, PriceFetchError> {
        let price_cents = self
            .prices
            .get(&product.source_ref)
            .copied()
            .ok_or_else(|| PriceFetchError::NotFound(product.source_ref.clone()))?;
        Ok(PriceQuote {
            product_id: product.id.clone(),
            price_cents,
            currency: self.currency.clone(),
            observed_at: Utc::now(),
        })
    }
}

#[derive(Debug, Default)]
struct CatalogState {
    products: Vec<TrackedProduct>,
    history: HashMap<String, Vec<PriceQuote>>,
}

/// Catalog held in memory (single-process mode and tests).
#[derive(Debug, Default)]
pub struct InMemoryPriceCatalog {
    state: RwLock<CatalogState>,
}

impl InMemoryPriceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_product(self, product: TrackedProduct) -> Self {
        if let Ok(mut state) = self.state.write() {
            state.products.push(product);
        }
        self
    }

    /// Recorded quotes for `product_id`, oldest first.
    pub fn history(&self, product_id: &str) -> Vec<PriceQuote> {
        self.state
            .read()
            .ok()
            .and_then(|s| s.history.get(product_id).cloned())
            .unwrap_or_default()
    }
}

fn poisoned() -> ExecutionError {
    ExecutionError::fatal("price catalog lock poisoned")
}

#[async_trait]
impl PriceCatalog for InMemoryPriceCatalog {
    async fn tracked_products(
        &self,
        ids: Option<&[String]>,
    ) -> Result<Vec<TrackedProduct>, ExecutionError> {
        let state = self.state.read().map_err(|_| poisoned())?;
        Ok(state
            .products
            .iter()
            .filter(|p| ids.is_none_or(|ids| ids.contains(&p.id)))
            .cloned()
            .collect())
    }

    async fn latest_price(&self, product_id: &str) -> Result<Option<i64>, ExecutionError> {
        let state = self.state.read().map_err(|_| poisoned())?;
        Ok(state
            .history
            .get(product_id)
            .and_then(|h| h.last())
            .map(|q| q.price_cents))
    }

    async fn record_price(&self, quote: &PriceQuote) -> Result<(), ExecutionError> {
        let mut state = self.state.write().map_err(|_| poisoned())?;
        state
            .history
            .entry(quote.product_id.clone())
            .or_default()
            .push(quote.clone());
        Ok(())
    }
}

pub const PRICE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tracked_products (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL,
    source_ref  TEXT NOT NULL,
    active      BOOLEAN NOT NULL DEFAULT TRUE
);

CREATE TABLE IF NOT EXISTS price_observations (
    product_id  TEXT NOT NULL REFERENCES tracked_products (id),
    price_cents BIGINT NOT NULL CHECK (price_cents >= 0),
    currency    TEXT NOT NULL,
    observed_at TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS price_observations_product_time
    ON price_observations (product_id, observed_at DESC);
"#;

#[derive(Debug, Clone)]
pub struct PostgresPriceCatalog {
    pool: PgPool,
}

impl PostgresPriceCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the catalog tables (idempotent).
    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        sqlx::raw_sql(PRICE_SCHEMA).execute(&self.pool).await?;
        Ok(())
    }
}

fn db_error(operation: &str, err: sqlx::Error) -> ExecutionError {
    match err {
        sqlx::Error::Database(db_err) => {
            ExecutionError::fatal(format!("database error in {operation}: {}", db_err.message()))
        }
        other => ExecutionError::retryable(format!("sqlx error in {operation}: {other}")),
    }
}

#[async_trait]
impl PriceCatalog for PostgresPriceCatalog {
    #[instrument(skip_all, err)]
    async fn tracked_products(
        &self,
        ids: Option<&[String]>,
    ) -> Result<Vec<TrackedProduct>, ExecutionError> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, source_ref
            FROM tracked_products
            WHERE active AND ($1::text[] IS NULL OR id = ANY($1))
            ORDER BY id
            "#,
        )
        .bind(ids.map(<[String]>::to_vec))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("tracked_products", e))?;

        rows.iter()
            .map(|row| {
                Ok(TrackedProduct {
                    id: row.try_get("id").map_err(|e| db_error("tracked_products", e))?,
                    name: row.try_get("name").map_err(|e| db_error("tracked_products", e))?,
                    source_ref: row
                        .try_get("source_ref")
                        .map_err(|e| db_error("tracked_products", e))?,
                })
            })
            .collect()
    }

    async fn latest_price(&self, product_id: &str) -> Result<Option<i64>, ExecutionError> {
        let row = sqlx::query(
            r#"
            SELECT price_cents
            FROM price_observations
            WHERE product_id = $1
            ORDER BY observed_at DESC
            LIMIT 1
            "#,
        )
        .bind(product_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("latest_price", e))?;

        row.map(|r| r.try_get::<i64, _>("price_cents"))
            .transpose()
            .map_err(|e| db_error("latest_price", e))
    }

    async fn record_price(&self, quote: &PriceQuote) -> Result<(), ExecutionError> {
        sqlx::query(
            r#"
            INSERT INTO price_observations (product_id, price_cents, currency, observed_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(&quote.product_id)
        .bind(quote.price_cents)
        .bind(&quote.currency)
        .bind(quote.observed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("record_price", e))?;
        Ok(())
    }
}
