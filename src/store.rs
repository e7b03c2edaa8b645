//! Idempotent persistence of cleaned locations, listings and listing details.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;
use tracing::{debug, warn};

use crate::db::{self, format_timestamp, parse_timestamp};
use crate::errors::{AppError, AppResult};
use crate::normalize::{CategorizedImages, Location, Property, PropertyDetails};

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertSummary {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: usize,
}

impl UpsertSummary {
    pub fn written(&self) -> usize {
        self.inserted + self.updated
    }

    fn record(&mut self, existed: bool, changed: usize) {
        match (existed, changed) {
            (false, _) => self.inserted += 1,
            (true, 0) => self.unchanged += 1,
            (true, _) => self.updated += 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocationQuery {
    pub page: u32,
    pub page_size: u32,
    pub country: Option<String>,
    pub name: Option<String>,
}

impl LocationQuery {
    pub fn page(page: u32) -> Self {
        Self {
            page,
            ..Self::default()
        }
    }

    fn normalized(&self) -> (u32, u32, Option<&str>, Option<&str>) {
        let page = self.page.max(1);
        let page_size = match self.page_size {
            0 => DEFAULT_PAGE_SIZE,
            size => size.min(MAX_PAGE_SIZE),
        };
        fn filter(value: &Option<String>) -> Option<&str> {
            value
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
        }
        (page, page_size, filter(&self.country), filter(&self.name))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationRecord {
    pub id: String,
    pub city_name: String,
    pub country: String,
    pub country_code: String,
    pub latitude: f64,
    pub longitude: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationPage {
    pub items: Vec<LocationRecord>,
    pub total_count: u64,
    pub page: u32,
    pub page_size: u32,
}

impl LocationPage {
    pub fn has_more(&self) -> bool {
        u64::from(self.page) * u64::from(self.page_size) < self.total_count
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropertyRecord {
    pub id: String,
    pub name: String,
    pub city_id: String,
    pub kind: Option<String>,
    pub rating: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropertyDetailsRecord {
    pub property_id: String,
    pub kind: Option<String>,
    pub bedrooms: Option<u32>,
    pub bathrooms: Option<u32>,
    pub amenities: Vec<String>,
    pub images: CategorizedImages,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Persistence seam used by the ingestion pipeline.
#[async_trait]
pub trait UpsertStore: Send + Sync {
    async fn upsert_locations(&self, locations: &[Location]) -> AppResult<UpsertSummary>;
    async fn upsert_properties(&self, properties: &[Property]) -> AppResult<UpsertSummary>;
    async fn upsert_property_details(&self, details: &[PropertyDetails]) -> AppResult<UpsertSummary>;
    async fn list_locations(&self, query: &LocationQuery) -> AppResult<LocationPage>;
    /// Ids of every stored listing, sorted.
    async fn property_ids(&self) -> AppResult<Vec<String>>;
}

#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Mutex<Connection>>,
}

const LOCATION_COLUMNS: &str =
    "id, city_name, country, country_code, latitude, longitude, created_at, updated_at";

impl SqliteStore {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    pub fn open<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let ctx = db::bootstrap(path)?;
        Ok(Self::new(Arc::new(Mutex::new(ctx.connection))))
    }

    pub fn in_memory() -> AppResult<Self> {
        Ok(Self::new(Arc::new(Mutex::new(db::open_in_memory()?))))
    }

    /// Inserts new ids, rewrites rows whose fields differ and leaves
    /// identical rows alone. `created_at` is only ever set on insert.
    pub fn upsert_locations_at(
        &self,
        locations: &[Location],
        now: DateTime<Utc>,
    ) -> AppResult<UpsertSummary> {
        let stamp = format_timestamp(now);
        let mut summary = UpsertSummary::default();
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        {
            let mut exists = tx.prepare("SELECT 1 FROM locations WHERE id = ?1")?;
            let mut upsert = tx.prepare(
                "INSERT INTO locations (id, city_name, country, country_code, latitude, longitude, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
                ON CONFLICT(id) DO UPDATE SET
                    city_name = excluded.city_name,
                    country = excluded.country,
                    country_code = excluded.country_code,
                    latitude = excluded.latitude,
                    longitude = excluded.longitude,
                    updated_at = excluded.updated_at
                WHERE locations.city_name IS NOT excluded.city_name
                    OR locations.country IS NOT excluded.country
                    OR locations.country_code IS NOT excluded.country_code
                    OR locations.latitude IS NOT excluded.latitude
                    OR locations.longitude IS NOT excluded.longitude",
            )?;

            for location in locations {
                if location.id.trim().is_empty() || location.city_name.trim().is_empty() {
                    warn!(?location, "skipping location without id or name");
                    summary.skipped += 1;
                    continue;
                }
                let existed = exists
                    .query_row([&location.id], |_| Ok(()))
                    .optional()?
                    .is_some();
                let changed = upsert.execute((
                    &location.id,
                    &location.city_name,
                    &location.country,
                    &location.country_code,
                    location.latitude,
                    location.longitude,
                    &stamp,
                ))?;
                summary.record(existed, changed);
            }
        }
        tx.commit()?;

        debug!(?summary, "locations upserted");
        Ok(summary)
    }

    pub fn upsert_properties_at(
        &self,
        properties: &[Property],
        now: DateTime<Utc>,
    ) -> AppResult<UpsertSummary> {
        let stamp = format_timestamp(now);
        let mut summary = UpsertSummary::default();
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        {
            let mut exists = tx.prepare("SELECT 1 FROM properties WHERE id = ?1")?;
            let mut upsert = tx.prepare(
                "INSERT INTO properties (id, name, city_id, kind, rating, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    city_id = excluded.city_id,
                    kind = excluded.kind,
                    rating = excluded.rating,
                    updated_at = excluded.updated_at
                WHERE properties.name IS NOT excluded.name
                    OR properties.city_id IS NOT excluded.city_id
                    OR properties.kind IS NOT excluded.kind
                    OR properties.rating IS NOT excluded.rating",
            )?;

            for property in properties {
                if property.id.trim().is_empty() || property.name.trim().is_empty() {
                    warn!(?property, "skipping property without id or name");
                    summary.skipped += 1;
                    continue;
                }
                let existed = exists
                    .query_row([&property.id], |_| Ok(()))
                    .optional()?
                    .is_some();
                let changed = upsert.execute((
                    &property.id,
                    &property.name,
                    &property.city_id,
                    property.kind.as_deref(),
                    property.rating,
                    &stamp,
                ))?;
                summary.record(existed, changed);
            }
        }
        tx.commit()?;

        debug!(?summary, "properties upserted");
        Ok(summary)
    }

    /// Amenities and images are stored as JSON text, so a reordered or
    /// extended list counts as a change.
    pub fn upsert_property_details_at(
        &self,
        details: &[PropertyDetails],
        now: DateTime<Utc>,
    ) -> AppResult<UpsertSummary> {
        let stamp = format_timestamp(now);
        let mut summary = UpsertSummary::default();
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        {
            let mut exists = tx.prepare("SELECT 1 FROM property_details WHERE property_id = ?1")?;
            let mut upsert = tx.prepare(
                "INSERT INTO property_details (property_id, kind, bedrooms, bathrooms, amenities, images, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
                ON CONFLICT(property_id) DO UPDATE SET
                    kind = excluded.kind,
                    bedrooms = excluded.bedrooms,
                    bathrooms = excluded.bathrooms,
                    amenities = excluded.amenities,
                    images = excluded.images,
                    updated_at = excluded.updated_at
                WHERE property_details.kind IS NOT excluded.kind
                    OR property_details.bedrooms IS NOT excluded.bedrooms
                    OR property_details.bathrooms IS NOT excluded.bathrooms
                    OR property_details.amenities IS NOT excluded.amenities
                    OR property_details.images IS NOT excluded.images",
            )?;

            for detail in details {
                if detail.property_id.trim().is_empty() {
                    warn!(?detail, "skipping property details without id");
                    summary.skipped += 1;
                    continue;
                }
                let amenities = serde_json::to_string(&detail.amenities)?;
                let images = serde_json::to_string(&detail.images)?;
                let existed = exists
                    .query_row([&detail.property_id], |_| Ok(()))
                    .optional()?
                    .is_some();
                let changed = upsert.execute((
                    &detail.property_id,
                    detail.kind.as_deref(),
                    detail.bedrooms,
                    detail.bathrooms,
                    &amenities,
                    &images,
                    &stamp,
                ))?;
                summary.record(existed, changed);
            }
        }
        tx.commit()?;

        debug!(?summary, "property details upserted");
        Ok(summary)
    }

    pub fn property_details(&self, property_id: &str) -> AppResult<Option<PropertyDetailsRecord>> {
        let conn = self.db.lock();
        let raw = conn
            .query_row(
                "SELECT property_id, kind, bedrooms, bathrooms, amenities, images, created_at, updated_at
                FROM property_details WHERE property_id = ?1",
                [property_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<u32>>(2)?,
                        row.get::<_, Option<u32>>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, String>(7)?,
                    ))
                },
            )
            .optional()?;

        raw.map(
            |(property_id, kind, bedrooms, bathrooms, amenities, images, created_at, updated_at)|
             -> AppResult<PropertyDetailsRecord> {
                Ok(PropertyDetailsRecord {
                    amenities: decode_json(&property_id, &amenities)?,
                    images: decode_json(&property_id, &images)?,
                    property_id,
                    kind,
                    bedrooms,
                    bathrooms,
                    created_at: parse_timestamp(&created_at)?,
                    updated_at: parse_timestamp(&updated_at)?,
                })
            },
        )
        .transpose()
    }

    pub fn list_property_ids(&self) -> AppResult<Vec<String>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare("SELECT id FROM properties ORDER BY id ASC")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    pub fn query_locations(&self, query: &LocationQuery) -> AppResult<LocationPage> {
        let (page, page_size, country, name) = query.normalized();
        let offset = i64::from(page - 1) * i64::from(page_size);
        let conn = self.db.lock();

        const FILTER: &str = "(?1 IS NULL OR LOWER(country) = LOWER(?1))
            AND (?2 IS NULL OR INSTR(LOWER(city_name), LOWER(?2)) > 0)";

        let total_count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM locations WHERE {FILTER}"),
            (country, name),
            |row| row.get(0),
        )?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {LOCATION_COLUMNS} FROM locations WHERE {FILTER}
            ORDER BY city_name COLLATE NOCASE ASC, id ASC
            LIMIT ?3 OFFSET ?4"
        ))?;
        let raw = stmt
            .query_map((country, name, i64::from(page_size), offset), RawLocationRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        let items = raw
            .into_iter()
            .map(RawLocationRow::into_record)
            .collect::<AppResult<Vec<_>>>()?;

        Ok(LocationPage {
            items,
            total_count: total_count.max(0) as u64,
            page,
            page_size,
        })
    }

    pub fn get_location(&self, id: &str) -> AppResult<Option<LocationRecord>> {
        let conn = self.db.lock();
        let raw = conn
            .query_row(
                &format!("SELECT {LOCATION_COLUMNS} FROM locations WHERE id = ?1"),
                [id],
                RawLocationRow::from_row,
            )
            .optional()?;
        raw.map(RawLocationRow::into_record).transpose()
    }

    /// Distinct city names per country, both sorted.
    pub fn countries_and_cities(&self) -> AppResult<BTreeMap<String, Vec<String>>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT country, city_name FROM locations
            ORDER BY country ASC, city_name ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for row in rows {
            let (country, city) = row?;
            grouped.entry(country).or_default().push(city);
        }
        Ok(grouped)
    }

    pub fn properties_for_city(&self, city_id: &str) -> AppResult<Vec<PropertyRecord>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT id, name, city_id, kind, rating, created_at, updated_at
            FROM properties WHERE city_id = ?1
            ORDER BY name COLLATE NOCASE ASC, id ASC",
        )?;
        let rows = stmt
            .query_map([city_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<f64>>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, name, city_id, kind, rating, created_at, updated_at)| {
                Ok(PropertyRecord {
                    id,
                    name,
                    city_id,
                    kind,
                    rating,
                    created_at: parse_timestamp(&created_at)?,
                    updated_at: parse_timestamp(&updated_at)?,
                })
            })
            .collect()
    }

    pub fn location_count(&self) -> AppResult<u64> {
        let conn = self.db.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM locations", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }
}

#[async_trait]
impl UpsertStore for SqliteStore {
    async fn upsert_locations(&self, locations: &[Location]) -> AppResult<UpsertSummary> {
        self.upsert_locations_at(locations, Utc::now())
    }

    async fn upsert_properties(&self, properties: &[Property]) -> AppResult<UpsertSummary> {
        self.upsert_properties_at(properties, Utc::now())
    }

    async fn upsert_property_details(&self, details: &[PropertyDetails]) -> AppResult<UpsertSummary> {
        self.upsert_property_details_at(details, Utc::now())
    }

    async fn list_locations(&self, query: &LocationQuery) -> AppResult<LocationPage> {
        self.query_locations(query)
    }

    async fn property_ids(&self) -> AppResult<Vec<String>> {
        self.list_property_ids()
    }
}

fn decode_json<T: serde::de::DeserializeOwned>(property_id: &str, raw: &str) -> AppResult<T> {
    serde_json::from_str(raw).map_err(|err| {
        AppError::Storage(format!("invalid stored details for {property_id:?}: {err}"))
    })
}

struct RawLocationRow {
    id: String,
    city_name: String,
    country: String,
    country_code: String,
    latitude: f64,
    longitude: f64,
    created_at: String,
    updated_at: String,
}

impl RawLocationRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            city_name: row.get(1)?,
            country: row.get(2)?,
            country_code: row.get(3)?,
            latitude: row.get(4)?,
            longitude: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    fn into_record(self) -> AppResult<LocationRecord> {
        Ok(LocationRecord {
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            id: self.id,
            city_name: self.city_name,
            country: self.country,
            country_code: self.country_code,
            latitude: self.latitude,
            longitude: self.longitude,
        })
    }
}
