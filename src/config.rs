use std::time::Duration;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::debug;

const DEFAULT_PROVIDER_HOST: &str = "booking-com18.p.rapidapi.com";
const DEFAULT_PROVIDER_BASE_URL: &str = "https://booking-com18.p.rapidapi.com";
const MAX_CONCURRENCY: usize = 16;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub provider_api_key: Option<SecretString>,
    pub provider_host: String,
    pub provider_base_url: String,
    pub city_search_path: String,
    pub property_search_path: String,
    pub property_detail_path: String,
    pub property_photos_path: String,
    pub detail_lead_days: u32,
    pub detail_stay_nights: u32,
    pub city_query_limit: u32,
    pub rate_interval_ms: u64,
    pub rate_burst: u32,
    pub request_timeout_secs: u64,
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
    pub concurrency: usize,
    pub database_path: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub provider_host: String,
    pub provider_base_url: String,
    pub city_search_path: String,
    pub property_search_path: String,
    pub property_detail_path: String,
    pub property_photos_path: String,
    pub detail_lead_days: u32,
    pub detail_stay_nights: u32,
    pub city_query_limit: u32,
    pub rate_interval_ms: u64,
    pub rate_burst: u32,
    pub request_timeout_secs: u64,
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
    pub concurrency: usize,
    pub database_path: String,
    pub has_api_key: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self {
            provider_api_key: env::var("RAPIDAPI_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(SecretString::from),
            provider_host: parse_string("PROVIDER_HOST", DEFAULT_PROVIDER_HOST),
            provider_base_url: parse_string("PROVIDER_BASE_URL", DEFAULT_PROVIDER_BASE_URL),
            city_search_path: parse_string("CITY_SEARCH_PATH", "/api/v1/cities"),
            property_search_path: parse_string("PROPERTY_SEARCH_PATH", "/stays/auto-complete"),
            property_detail_path: parse_string("PROPERTY_DETAIL_PATH", "/stays/detail"),
            property_photos_path: parse_string("PROPERTY_PHOTOS_PATH", "/stays/get-photos"),
            detail_lead_days: parse_u32("DETAIL_LEAD_DAYS", 30),
            detail_stay_nights: parse_u32("DETAIL_STAY_NIGHTS", 1).max(1),
            city_query_limit: parse_u32("CITY_QUERY_LIMIT", 100),
            rate_interval_ms: parse_u64("PROVIDER_RATE_INTERVAL_MS", 12_000).max(1),
            rate_burst: parse_u32("PROVIDER_RATE_BURST", 1).max(1),
            request_timeout_secs: parse_u64("PROVIDER_TIMEOUT_SECS", 10).max(1),
            max_attempts: parse_u32("PROVIDER_MAX_ATTEMPTS", 3).max(1),
            retry_backoff_ms: parse_u64("PROVIDER_RETRY_BACKOFF_MS", 1_000),
            concurrency: parse_usize("INGEST_CONCURRENCY", 5).clamp(1, MAX_CONCURRENCY),
            database_path: parse_string("DATABASE_PATH", "rental-ingest.db"),
        }
    }

    /// Settings pointed at `base_url`, with no key and production pacing.
    pub fn for_provider(base_url: impl Into<String>) -> Self {
        Self {
            provider_api_key: None,
            provider_host: DEFAULT_PROVIDER_HOST.to_string(),
            provider_base_url: base_url.into(),
            city_search_path: "/api/v1/cities".to_string(),
            property_search_path: "/stays/auto-complete".to_string(),
            property_detail_path: "/stays/detail".to_string(),
            property_photos_path: "/stays/get-photos".to_string(),
            detail_lead_days: 30,
            detail_stay_nights: 1,
            city_query_limit: 100,
            rate_interval_ms: 12_000,
            rate_burst: 1,
            request_timeout_secs: 10,
            max_attempts: 3,
            retry_backoff_ms: 1_000,
            concurrency: 5,
            database_path: "rental-ingest.db".to_string(),
        }
    }

    pub fn rate_interval(&self) -> Duration {
        Duration::from_millis(self.rate_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            provider_host: self.provider_host.clone(),
            provider_base_url: self.provider_base_url.clone(),
            city_search_path: self.city_search_path.clone(),
            property_search_path: self.property_search_path.clone(),
            property_detail_path: self.property_detail_path.clone(),
            property_photos_path: self.property_photos_path.clone(),
            detail_lead_days: self.detail_lead_days,
            detail_stay_nights: self.detail_stay_nights,
            city_query_limit: self.city_query_limit,
            rate_interval_ms: self.rate_interval_ms,
            rate_burst: self.rate_burst,
            request_timeout_secs: self.request_timeout_secs,
            max_attempts: self.max_attempts,
            retry_backoff_ms: self.retry_backoff_ms,
            concurrency: self.concurrency,
            database_path: self.database_path.clone(),
            has_api_key: self.provider_api_key.is_some(),
        }
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_string(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_public_profile_without_secrets() {
        env::set_var("RAPIDAPI_KEY", "secret");
        env::set_var("DATABASE_PATH", "custom.db");
        env::set_var("INGEST_CONCURRENCY", "64");
        env::set_var("PROVIDER_RATE_INTERVAL_MS", "250");

        let config = AppConfig::from_env();
        let public = config.public_profile();

        assert_eq!(public.database_path, "custom.db");
        assert!(public.has_api_key);
        assert!(config.provider_api_key.is_some());
        assert_eq!(public.concurrency, MAX_CONCURRENCY);
        assert_eq!(config.rate_interval(), Duration::from_millis(250));
        let serialized = serde_json::to_string(&public).unwrap();
        assert!(!serialized.contains("secret"));
    }

    #[test]
    fn provider_defaults_follow_documented_budget() {
        let config = AppConfig::for_provider("http://127.0.0.1:9");
        assert_eq!(config.rate_interval(), Duration::from_secs(12));
        assert_eq!(config.rate_burst, 1);
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.max_attempts, 3);
        assert!(config.provider_api_key.is_none());
    }
}
