//! End-to-end ingestion runs: fetch, clean, then persist only if every
//! query succeeded.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::normalize::{clean_cities, clean_properties, clean_property_details};
use crate::orchestrator::{FetchOrchestrator, PropertyQuery};
use crate::provider::{ProviderClient, StayWindow};
use crate::queries::{location_queries, property_queries};
use crate::ratelimiter::RateLimiter;
use crate::store::{LocationQuery, UpsertStore, UpsertSummary, MAX_PAGE_SIZE};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IngestionReport {
    pub queries: usize,
    pub raw: usize,
    pub cleaned: usize,
    pub rejected: usize,
    pub duplicates: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub elapsed_ms: u64,
}

impl IngestionReport {
    fn record_upsert(&mut self, summary: UpsertSummary) {
        self.inserted = summary.inserted;
        self.updated = summary.updated;
        self.unchanged = summary.unchanged;
        self.skipped = summary.skipped;
        if summary.skipped > 0 {
            warn!(skipped = summary.skipped, "store skipped rows without identity");
        }
    }
}

const DEFAULT_DETAIL_LEAD_DAYS: u32 = 30;
const DEFAULT_DETAIL_STAY_NIGHTS: u32 = 1;

pub struct IngestionPipeline {
    orchestrator: FetchOrchestrator,
    store: Arc<dyn UpsertStore>,
    location_queries: Vec<String>,
    detail_lead_days: u32,
    detail_stay_nights: u32,
}

impl IngestionPipeline {
    pub fn new(orchestrator: FetchOrchestrator, store: Arc<dyn UpsertStore>) -> Self {
        Self {
            orchestrator,
            store,
            location_queries: location_queries(),
            detail_lead_days: DEFAULT_DETAIL_LEAD_DAYS,
            detail_stay_nights: DEFAULT_DETAIL_STAY_NIGHTS,
        }
    }

    /// Wires a client around the shared `limiter`. Fails before any request
    /// when credentials are missing.
    pub fn from_config(
        config: &AppConfig,
        limiter: RateLimiter,
        store: Arc<dyn UpsertStore>,
    ) -> AppResult<Self> {
        let client = ProviderClient::new(config, limiter)?;
        let mut pipeline = Self::new(FetchOrchestrator::new(client, config.concurrency), store);
        pipeline.detail_lead_days = config.detail_lead_days;
        pipeline.detail_stay_nights = config.detail_stay_nights;
        Ok(pipeline)
    }

    pub fn with_location_queries(mut self, queries: Vec<String>) -> Self {
        self.location_queries = queries;
        self
    }

    pub fn limiter(&self) -> &RateLimiter {
        self.orchestrator.client().limiter()
    }

    pub async fn run_ingestion(&self, cancel: &CancellationToken) -> AppResult<IngestionReport> {
        let started = Instant::now();
        let mut report = IngestionReport {
            queries: self.location_queries.len(),
            ..IngestionReport::default()
        };
        info!(queries = report.queries, "city ingestion started");

        let raw = self
            .orchestrator
            .process_queries(&self.location_queries, cancel)
            .await
            .inspect_err(|err| warn!(error = %err, "city fetch failed; skipping persistence"))?;
        report.raw = raw.len();

        let cleaned = clean_cities(raw);
        report.rejected = cleaned.rejected;
        report.duplicates = cleaned.duplicates;
        report.cleaned = cleaned.items.len();
        if cleaned.items.is_empty() {
            warn!(raw = report.raw, "no valid locations to store");
            return Err(AppError::EmptyIngestion);
        }

        let summary = self.store.upsert_locations(&cleaned.items).await?;
        report.record_upsert(summary);
        report.elapsed_ms = started.elapsed().as_millis() as u64;
        info!(?report, "city ingestion finished");
        Ok(report)
    }

    pub async fn run_property_ingestion(
        &self,
        cancel: &CancellationToken,
    ) -> AppResult<IngestionReport> {
        let started = Instant::now();
        let queries = self.collect_property_queries().await?;
        if queries.is_empty() {
            warn!("no stored locations to search listings for");
            return Err(AppError::EmptyIngestion);
        }

        let mut report = IngestionReport {
            queries: queries.len(),
            ..IngestionReport::default()
        };
        info!(queries = report.queries, "property ingestion started");

        let raw = self
            .orchestrator
            .process_property_queries(queries, cancel)
            .await
            .inspect_err(|err| warn!(error = %err, "property fetch failed; skipping persistence"))?;
        report.raw = raw.len();

        let cleaned = clean_properties(raw);
        report.rejected = cleaned.rejected;
        report.duplicates = cleaned.duplicates;
        report.cleaned = cleaned.items.len();
        if cleaned.items.is_empty() {
            warn!(raw = report.raw, "no valid properties to store");
            return Err(AppError::EmptyIngestion);
        }

        let summary = self.store.upsert_properties(&cleaned.items).await?;
        report.record_upsert(summary);
        report.elapsed_ms = started.elapsed().as_millis() as u64;
        info!(?report, "property ingestion finished");
        Ok(report)
    }

    /// Enriches every stored listing with details and photos. Dates are
    /// `detail_lead_days` from today (UTC).
    pub async fn run_detail_ingestion(
        &self,
        cancel: &CancellationToken,
    ) -> AppResult<IngestionReport> {
        let window = StayWindow::ahead(
            Utc::now().date_naive(),
            self.detail_lead_days,
            self.detail_stay_nights,
        );
        self.run_detail_ingestion_for(window, cancel).await
    }

    pub async fn run_detail_ingestion_for(
        &self,
        window: StayWindow,
        cancel: &CancellationToken,
    ) -> AppResult<IngestionReport> {
        let started = Instant::now();
        let property_ids = self.store.property_ids().await?;
        if property_ids.is_empty() {
            warn!("no stored listings to enrich");
            return Err(AppError::EmptyIngestion);
        }

        let mut report = IngestionReport {
            queries: property_ids.len(),
            ..IngestionReport::default()
        };
        info!(
            queries = report.queries,
            checkin = %window.checkin,
            checkout = %window.checkout,
            "detail ingestion started"
        );

        let raw = self
            .orchestrator
            .process_detail_queries(property_ids, window, cancel)
            .await
            .inspect_err(|err| warn!(error = %err, "detail fetch failed; skipping persistence"))?;
        report.raw = raw.len();

        let cleaned = clean_property_details(raw);
        report.rejected = cleaned.rejected;
        report.duplicates = cleaned.duplicates;
        report.cleaned = cleaned.items.len();
        if cleaned.items.is_empty() {
            warn!(raw = report.raw, "no usable property details to store");
            return Err(AppError::EmptyIngestion);
        }

        let summary = self.store.upsert_property_details(&cleaned.items).await?;
        report.record_upsert(summary);
        report.elapsed_ms = started.elapsed().as_millis() as u64;
        info!(?report, "detail ingestion finished");
        Ok(report)
    }

    async fn collect_property_queries(&self) -> AppResult<Vec<PropertyQuery>> {
        let mut queries = Vec::new();
        let mut page = 1;
        loop {
            let batch = self
                .store
                .list_locations(&LocationQuery {
                    page,
                    page_size: MAX_PAGE_SIZE,
                    ..LocationQuery::default()
                })
                .await?;
            for location in &batch.items {
                queries.extend(property_queries(&location.city_name).into_iter().map(|text| {
                    PropertyQuery {
                        city_id: location.id.clone(),
                        text,
                    }
                }));
            }
            if batch.items.is_empty() || !batch.has_more() {
                break;
            }
            page += 1;
        }
        Ok(queries)
    }
}

/// One-shot city ingestion against the configured provider and store.
pub async fn run_ingestion(
    config: &AppConfig,
    store: Arc<dyn UpsertStore>,
    cancel: &CancellationToken,
) -> AppResult<IngestionReport> {
    let limiter = RateLimiter::from_config(config);
    IngestionPipeline::from_config(config, limiter, store)?
        .run_ingestion(cancel)
        .await
}
