pub mod config;
pub mod db;
pub mod errors;
pub mod normalize;
pub mod orchestrator;
pub mod pipeline;
pub mod provider;
pub mod queries;
pub mod ratelimiter;
pub mod store;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{AppConfig, PublicAppConfig};
use crate::errors::AppResult;
use crate::pipeline::{IngestionPipeline, IngestionReport};
use crate::ratelimiter::RateLimiter;
use crate::store::{
    LocationPage, LocationQuery, LocationRecord, PropertyDetailsRecord, PropertyRecord, SqliteStore,
};

pub use crate::errors::AppError;

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub database_path: String,
    pub location_count: u64,
    pub rate_interval_ms: u64,
    pub rate_burst: u32,
    pub config: PublicAppConfig,
}

/// Process-wide wiring: one store and one rate limiter shared by every run.
pub struct AppState {
    config: AppConfig,
    db_path: PathBuf,
    store: Arc<SqliteStore>,
    limiter: RateLimiter,
}

impl AppState {
    pub fn initialize(config: AppConfig) -> AppResult<Self> {
        init_tracing();
        let db_path = PathBuf::from(&config.database_path);
        let store = Arc::new(SqliteStore::open(&db_path)?);
        let limiter = RateLimiter::from_config(&config);
        info!(
            path = %db_path.display(),
            interval_ms = config.rate_interval_ms,
            burst = config.rate_burst,
            "application state initialized"
        );
        Ok(Self {
            config,
            db_path,
            store,
            limiter,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn store(&self) -> Arc<SqliteStore> {
        Arc::clone(&self.store)
    }

    fn pipeline(&self) -> AppResult<IngestionPipeline> {
        IngestionPipeline::from_config(&self.config, self.limiter.clone(), self.store())
    }

    pub async fn run_ingestion(&self, cancel: &CancellationToken) -> AppResult<IngestionReport> {
        self.pipeline()?.run_ingestion(cancel).await
    }

    pub async fn run_property_ingestion(
        &self,
        cancel: &CancellationToken,
    ) -> AppResult<IngestionReport> {
        self.pipeline()?.run_property_ingestion(cancel).await
    }

    pub async fn run_detail_ingestion(
        &self,
        cancel: &CancellationToken,
    ) -> AppResult<IngestionReport> {
        self.pipeline()?.run_detail_ingestion(cancel).await
    }

    pub fn list_locations(&self, query: &LocationQuery) -> AppResult<LocationPage> {
        self.store.query_locations(query)
    }

    pub fn get_location(&self, id: &str) -> AppResult<Option<LocationRecord>> {
        self.store.get_location(id)
    }

    pub fn countries_and_cities(&self) -> AppResult<BTreeMap<String, Vec<String>>> {
        self.store.countries_and_cities()
    }

    pub fn properties_for_city(&self, city_id: &str) -> AppResult<Vec<PropertyRecord>> {
        self.store.properties_for_city(city_id)
    }

    pub fn property_details(&self, property_id: &str) -> AppResult<Option<PropertyDetailsRecord>> {
        self.store.property_details(property_id)
    }

    pub fn status(&self) -> AppResult<StatusReport> {
        Ok(StatusReport {
            database_path: self.db_path.to_string_lossy().to_string(),
            location_count: self.store.location_count()?,
            rate_interval_ms: self.limiter.interval().as_millis() as u64,
            rate_burst: self.limiter.burst(),
            config: self.config.public_profile(),
        })
    }
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,rental_ingest=debug"));
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init();
    });
}
