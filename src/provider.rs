use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{Days, NaiveDate};
use reqwest::{Client, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::ratelimiter::RateLimiter;

const HOST_HEADER: &str = "x-rapidapi-host";
const KEY_HEADER: &str = "x-rapidapi-key";

/// City entry as returned by the provider search. Every field may be missing.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawCityRecord {
    #[serde(rename = "city_id", default)]
    pub id: Option<String>,
    #[serde(rename = "city_name", default)]
    pub name: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
}

impl RawCityRecord {
    pub fn new(id: &str, name: &str, country: &str) -> Self {
        Self {
            id: Some(id.to_string()),
            name: Some(name.to_string()),
            country: Some(country.to_string()),
            latitude: None,
            longitude: None,
        }
    }
}

/// Listing entry from the stays search, before it is tied to a stored city.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawPropertyRecord {
    #[serde(rename = "dest_id", default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "city_name", alias = "city", default)]
    pub city_name: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub rating: Option<f64>,
}

/// `data` object of the stay detail endpoint. Only the fields kept for
/// enrichment are modelled.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawPropertyDetails {
    #[serde(rename = "hotel_id", default, deserialize_with = "string_or_number")]
    pub id: Option<String>,
    #[serde(rename = "hotel_name", default)]
    pub name: Option<String>,
    #[serde(rename = "accommodation_type_name", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub block_count: Option<u32>,
    #[serde(default)]
    pub rooms: Option<BTreeMap<String, RawRoom>>,
    #[serde(default)]
    pub facilities_block: Option<RawFacilitiesBlock>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawRoom {
    #[serde(default)]
    pub private_bathroom_count: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawFacilitiesBlock {
    #[serde(default)]
    pub facilities: Option<Vec<RawFacility>>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawFacility {
    #[serde(default)]
    pub name: Option<String>,
}

/// One tagged group from the photo endpoint.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawPhotoGroup {
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub images: Option<Vec<String>>,
}

/// Check-in and check-out dates the detail endpoint requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StayWindow {
    pub checkin: NaiveDate,
    pub checkout: NaiveDate,
}

impl StayWindow {
    pub fn starting(checkin: NaiveDate, nights: u32) -> Self {
        let checkout = checkin
            .checked_add_days(Days::new(u64::from(nights.max(1))))
            .unwrap_or(NaiveDate::MAX);
        Self { checkin, checkout }
    }

    pub fn ahead(today: NaiveDate, lead_days: u32, nights: u32) -> Self {
        let checkin = today
            .checked_add_days(Days::new(u64::from(lead_days)))
            .unwrap_or(today);
        Self::starting(checkin, nights)
    }

    /// `detail_lead_days` after `today`, for `detail_stay_nights`.
    pub fn from_config(config: &AppConfig, today: NaiveDate) -> Self {
        Self::ahead(today, config.detail_lead_days, config.detail_stay_nights)
    }
}

#[derive(Debug, Deserialize)]
struct DataEnvelope<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct ObjectEnvelope<T> {
    #[serde(default)]
    data: Option<T>,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<serde_json::Value>::deserialize(deserializer)? {
        Some(serde_json::Value::String(value)) => Some(value),
        Some(serde_json::Value::Number(value)) => Some(value.to_string()),
        _ => None,
    })
}

pub fn parse_city_response(body: &[u8]) -> AppResult<Vec<RawCityRecord>> {
    let envelope: DataEnvelope<RawCityRecord> = serde_json::from_slice(body)?;
    Ok(envelope.data)
}

pub fn parse_property_response(body: &[u8]) -> AppResult<Vec<RawPropertyRecord>> {
    let envelope: DataEnvelope<RawPropertyRecord> = serde_json::from_slice(body)?;
    Ok(envelope.data)
}

pub fn parse_detail_response(body: &[u8]) -> AppResult<Option<RawPropertyDetails>> {
    let envelope: ObjectEnvelope<RawPropertyDetails> = serde_json::from_slice(body)?;
    Ok(envelope.data)
}

pub fn parse_photo_response(body: &[u8]) -> AppResult<Vec<RawPhotoGroup>> {
    let envelope: DataEnvelope<RawPhotoGroup> = serde_json::from_slice(body)?;
    Ok(envelope.data)
}

/// HTTP access to the provider. Every call goes through the shared limiter.
#[derive(Clone)]
pub struct ProviderClient {
    http: Client,
    limiter: RateLimiter,
    api_key: SecretString,
    host: String,
    base_url: Url,
    city_search_path: String,
    property_search_path: String,
    property_detail_path: String,
    property_photos_path: String,
    city_query_limit: u32,
    max_attempts: u32,
    retry_backoff: Duration,
}

impl ProviderClient {
    /// Fails before any request is possible when the API key is absent.
    pub fn new(config: &AppConfig, limiter: RateLimiter) -> AppResult<Self> {
        let api_key = config
            .provider_api_key
            .clone()
            .ok_or(AppError::MissingCredentials("RAPIDAPI_KEY"))?;
        let base_url = Url::parse(&config.provider_base_url).map_err(|err| {
            AppError::Config(format!(
                "invalid provider base url {}: {err}",
                config.provider_base_url
            ))
        })?;
        let http = Client::builder()
            .timeout(config.request_timeout())
            .user_agent(concat!("rental-ingest/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            limiter,
            api_key,
            host: config.provider_host.clone(),
            base_url,
            city_search_path: config.city_search_path.clone(),
            property_search_path: config.property_search_path.clone(),
            property_detail_path: config.property_detail_path.clone(),
            property_photos_path: config.property_photos_path.clone(),
            city_query_limit: config.city_query_limit,
            max_attempts: config.max_attempts.max(1),
            retry_backoff: config.retry_backoff(),
        })
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn city_search_url(&self, query: &str) -> AppResult<Url> {
        let mut url = self.endpoint(&self.city_search_path)?;
        url.query_pairs_mut()
            .append_pair("query", query)
            .append_pair("limit", &self.city_query_limit.to_string());
        Ok(url)
    }

    pub fn property_search_url(&self, query: &str) -> AppResult<Url> {
        let mut url = self.endpoint(&self.property_search_path)?;
        url.query_pairs_mut().append_pair("query", query);
        Ok(url)
    }

    pub fn property_detail_url(&self, hotel_id: &str, window: &StayWindow) -> AppResult<Url> {
        let mut url = self.endpoint(&self.property_detail_path)?;
        url.query_pairs_mut()
            .append_pair("hotelId", hotel_id)
            .append_pair("checkinDate", &window.checkin.to_string())
            .append_pair("checkoutDate", &window.checkout.to_string())
            .append_pair("units", "metric");
        Ok(url)
    }

    pub fn property_photos_url(&self, hotel_id: &str) -> AppResult<Url> {
        let mut url = self.endpoint(&self.property_photos_path)?;
        url.query_pairs_mut().append_pair("hotelId", hotel_id);
        Ok(url)
    }

    fn endpoint(&self, path: &str) -> AppResult<Url> {
        let base = self.base_url.as_str().trim_end_matches('/');
        let path = path.trim_start_matches('/');
        Url::parse(&format!("{base}/{path}"))
            .map_err(|err| AppError::Config(format!("invalid provider endpoint {path}: {err}")))
    }

    /// One rate-limited GET. Non-2xx responses become [`AppError::Provider`].
    pub async fn fetch(&self, url: &Url, cancel: &CancellationToken) -> AppResult<Vec<u8>> {
        self.limiter.wait(cancel).await?;

        let request = self
            .http
            .get(url.clone())
            .header(HOST_HEADER, &self.host)
            .header(KEY_HEADER, self.api_key.expose_secret());

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AppError::Cancelled),
            response = request.send() => response?,
        };
        let status = response.status();
        let body = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AppError::Cancelled),
            body = response.bytes() => body?,
        };

        if !status.is_success() {
            return Err(AppError::Provider {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        debug!(url = %url.path(), status = status.as_u16(), bytes = body.len(), "provider call succeeded");
        Ok(body.to_vec())
    }

    /// [`fetch`](Self::fetch) with linear backoff on transient failures only.
    pub async fn fetch_with_retry(
        &self,
        url: &Url,
        cancel: &CancellationToken,
    ) -> AppResult<Vec<u8>> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.fetch(url, cancel).await {
                Ok(body) => return Ok(body),
                Err(err) if attempt < self.max_attempts && err.is_transient() => {
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        error = %err,
                        attempt,
                        max_attempts = self.max_attempts,
                        "provider call failed; retrying after {:?}",
                        delay
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(AppError::Cancelled),
                        _ = sleep(delay) => {}
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        self.retry_backoff * attempt
    }

    pub async fn search_cities(
        &self,
        query: &str,
        cancel: &CancellationToken,
    ) -> AppResult<Vec<RawCityRecord>> {
        let url = self.city_search_url(query)?;
        let body = self.fetch_with_retry(&url, cancel).await?;
        parse_city_response(&body)
    }

    pub async fn search_properties(
        &self,
        query: &str,
        cancel: &CancellationToken,
    ) -> AppResult<Vec<RawPropertyRecord>> {
        let url = self.property_search_url(query)?;
        let body = self.fetch_with_retry(&url, cancel).await?;
        parse_property_response(&body)
    }

    /// `Ok(None)` when the provider answers without a `data` object.
    pub async fn fetch_property_details(
        &self,
        hotel_id: &str,
        window: &StayWindow,
        cancel: &CancellationToken,
    ) -> AppResult<Option<RawPropertyDetails>> {
        let url = self.property_detail_url(hotel_id, window)?;
        let body = self.fetch_with_retry(&url, cancel).await?;
        parse_detail_response(&body)
    }

    pub async fn fetch_property_photos(
        &self,
        hotel_id: &str,
        cancel: &CancellationToken,
    ) -> AppResult<Vec<RawPhotoGroup>> {
        let url = self.property_photos_url(hotel_id)?;
        let body = self.fetch_with_retry(&url, cancel).await?;
        parse_photo_response(&body)
    }
}

#[cfg(test)]
mod tests {
    use httptest::matchers::{all_of, contains, request, url_decoded};
    use httptest::responders::{cycle, json_encoded, status_code};
    use httptest::{Expectation, Server};
    use secrecy::SecretString;
    use serde_json::json;

    use super::*;

    fn test_config(server: &Server) -> AppConfig {
        let mut config = AppConfig::for_provider(server.url_str(""));
        config.provider_api_key = Some(SecretString::from("test-key".to_string()));
        config.retry_backoff_ms = 5;
        config
    }

    fn fast_limiter() -> RateLimiter {
        RateLimiter::new(Duration::from_millis(1), 1)
    }

    #[test]
    fn refuses_to_start_without_credentials() {
        let config = AppConfig::for_provider("http://127.0.0.1:9");
        let err = ProviderClient::new(&config, fast_limiter()).err().unwrap();
        assert!(matches!(err, AppError::MissingCredentials(_)));
    }

    #[test]
    fn parses_noisy_city_payloads() {
        let body = br#"{"data":[{"city_id":"c1","city_name":"Paris","country":"France"},{"city_name":"Lyon"},{}]}"#;
        let records = parse_city_response(body).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].id.as_deref(), Some("c1"));
        assert_eq!(records[1].country, None);

        let empty = parse_city_response(br#"{"status":"ok"}"#).unwrap();
        assert!(empty.is_empty());
        assert!(parse_city_response(b"<html>").is_err());
    }

    #[tokio::test]
    async fn sends_identity_headers_and_query() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", "/api/v1/cities"),
                request::headers(contains(("x-rapidapi-key", "test-key"))),
                request::headers(contains(("x-rapidapi-host", "booking-com18.p.rapidapi.com"))),
                request::query(url_decoded(contains(("query", "New York")))),
                request::query(url_decoded(contains(("limit", "100")))),
            ])
            .respond_with(json_encoded(json!({
                "data": [{ "city_id": "ny", "city_name": "New York", "country": "USA" }]
            }))),
        );

        let client = ProviderClient::new(&test_config(&server), fast_limiter()).unwrap();
        let cities = client
            .search_cities("New York", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(cities, vec![RawCityRecord::new("ny", "New York", "USA")]);
    }

    #[tokio::test]
    async fn surfaces_status_and_body() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/api/v1/cities"))
                .respond_with(status_code(403).body("You are not subscribed")),
        );

        let client = ProviderClient::new(&test_config(&server), fast_limiter()).unwrap();
        let url = client.city_search_url("A").unwrap();
        let err = client
            .fetch_with_retry(&url, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            AppError::Provider { status, body } => {
                assert_eq!(status, 403);
                assert!(body.contains("not subscribed"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn retries_server_errors_up_to_the_bound() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/api/v1/cities"))
                .times(3)
                .respond_with(status_code(500).body("boom")),
        );

        let client = ProviderClient::new(&test_config(&server), fast_limiter()).unwrap();
        let url = client.city_search_url("B").unwrap();
        let err = client
            .fetch_with_retry(&url, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Provider { status: 500, .. }));
    }

    #[tokio::test]
    async fn recovers_after_transient_failure() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/api/v1/cities"))
                .times(2)
                .respond_with(cycle![
                    status_code(503),
                    json_encoded(json!({ "data": [] })),
                ]),
        );

        let client = ProviderClient::new(&test_config(&server), fast_limiter()).unwrap();
        let cities = client
            .search_cities("Q", &CancellationToken::new())
            .await
            .unwrap();
        assert!(cities.is_empty());
    }

    #[tokio::test]
    async fn does_not_retry_client_errors() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/stays/auto-complete"))
                .times(1)
                .respond_with(status_code(400)),
        );

        let client = ProviderClient::new(&test_config(&server), fast_limiter()).unwrap();
        let err = client
            .search_properties("Paris", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Provider { status: 400, .. }));
    }

    #[test]
    fn parses_detail_payloads_with_numeric_ids() {
        let body = br#"{"data":{
            "hotel_id": 74216,
            "hotel_name": "Marina Suites",
            "accommodation_type_name": "Apartment",
            "block_count": 2,
            "rooms": {"7421601": {"private_bathroom_count": 1}},
            "facilities_block": {"facilities": [{"name": "Free WiFi"}, {}]}
        }}"#;
        let details = parse_detail_response(body).unwrap().unwrap();
        assert_eq!(details.id.as_deref(), Some("74216"));
        assert_eq!(details.block_count, Some(2));
        assert_eq!(details.rooms.unwrap()["7421601"].private_bathroom_count, Some(1));
        let facilities = details.facilities_block.unwrap().facilities.unwrap();
        assert_eq!(facilities.len(), 2);
        assert_eq!(facilities[1].name, None);

        assert_eq!(parse_detail_response(br#"{"data":null}"#).unwrap(), None);
        assert_eq!(parse_detail_response(br#"{"status":false}"#).unwrap(), None);
    }

    #[test]
    fn stay_window_follows_configured_lead_time() {
        let config = AppConfig::for_provider("http://127.0.0.1:9");
        let today = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        let window = StayWindow::from_config(&config, today);
        assert_eq!(window.checkin, NaiveDate::from_ymd_opt(2025, 1, 31).unwrap());
        assert_eq!(window.checkout, NaiveDate::from_ymd_opt(2025, 2, 1).unwrap());
    }

    #[tokio::test]
    async fn requests_details_and_photos_by_hotel_id() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", "/stays/detail"),
                request::headers(contains(("x-rapidapi-key", "test-key"))),
                request::query(url_decoded(contains(("hotelId", "h1")))),
                request::query(url_decoded(contains(("checkinDate", "2025-03-01")))),
                request::query(url_decoded(contains(("checkoutDate", "2025-03-03")))),
                request::query(url_decoded(contains(("units", "metric")))),
            ])
            .respond_with(json_encoded(json!({
                "data": { "hotel_id": "h1", "accommodation_type_name": "Hotel" }
            }))),
        );
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", "/stays/get-photos"),
                request::query(url_decoded(contains(("hotelId", "h1")))),
            ])
            .respond_with(json_encoded(json!({
                "data": [{ "tag": "Room", "images": ["https://img/r1.jpg"] }]
            }))),
        );

        let client = ProviderClient::new(&test_config(&server), fast_limiter()).unwrap();
        let cancel = CancellationToken::new();
        let window = StayWindow::starting(NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(), 2);
        let details = client
            .fetch_property_details("h1", &window, &cancel)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(details.kind.as_deref(), Some("Hotel"));

        let photos = client.fetch_property_photos("h1", &cancel).await.unwrap();
        assert_eq!(photos[0].tag.as_deref(), Some("Room"));
    }

    #[tokio::test]
    async fn cancelled_limiter_wait_skips_the_call() {
        let server = Server::run();
        let client = ProviderClient::new(&test_config(&server), fast_limiter()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let url = client.city_search_url("A").unwrap();
        let err = client.fetch(&url, &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
    }
}
