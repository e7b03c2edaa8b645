//! Pure cleaning and deduplication of provider records.
//!
//! Nothing here touches the network or the store; rejected and duplicate
//! records are counted, not reported as errors.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::provider::{RawCityRecord, RawPhotoGroup, RawPropertyDetails, RawPropertyRecord};

/// Returned when a country name has no known ISO code.
pub const UNKNOWN_COUNTRY_CODE: &str = "XX";

const MAX_RATING: f64 = 10.0;

const BUILDING_TAG: &str = "property building";
const PROPERTY_TAG: &str = "property";
const ROOM_TAG: &str = "room";

/// Best-effort name to ISO 3166-1 alpha-2 table. Not exhaustive.
const COUNTRY_CODES: &[(&str, &str)] = &[
    ("argentina", "AR"),
    ("australia", "AU"),
    ("austria", "AT"),
    ("belgium", "BE"),
    ("brazil", "BR"),
    ("canada", "CA"),
    ("chile", "CL"),
    ("china", "CN"),
    ("colombia", "CO"),
    ("czech republic", "CZ"),
    ("czechia", "CZ"),
    ("denmark", "DK"),
    ("egypt", "EG"),
    ("finland", "FI"),
    ("france", "FR"),
    ("germany", "DE"),
    ("greece", "GR"),
    ("hungary", "HU"),
    ("india", "IN"),
    ("indonesia", "ID"),
    ("ireland", "IE"),
    ("israel", "IL"),
    ("italy", "IT"),
    ("japan", "JP"),
    ("malaysia", "MY"),
    ("mexico", "MX"),
    ("morocco", "MA"),
    ("netherlands", "NL"),
    ("new zealand", "NZ"),
    ("norway", "NO"),
    ("peru", "PE"),
    ("philippines", "PH"),
    ("poland", "PL"),
    ("portugal", "PT"),
    ("qatar", "QA"),
    ("russia", "RU"),
    ("saudi arabia", "SA"),
    ("singapore", "SG"),
    ("south africa", "ZA"),
    ("south korea", "KR"),
    ("spain", "ES"),
    ("sweden", "SE"),
    ("switzerland", "CH"),
    ("thailand", "TH"),
    ("turkey", "TR"),
    ("uae", "AE"),
    ("united arab emirates", "AE"),
    ("uk", "GB"),
    ("united kingdom", "GB"),
    ("usa", "US"),
    ("united states", "US"),
    ("united states of america", "US"),
    ("vietnam", "VN"),
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Location {
    pub id: String,
    pub city_name: String,
    pub country: String,
    pub country_code: String,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Property {
    pub id: String,
    pub name: String,
    pub city_id: String,
    pub kind: Option<String>,
    pub rating: Option<f64>,
}

/// A listing hit together with the stored city whose query produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct ScopedProperty {
    pub city_id: String,
    pub record: RawPropertyRecord,
}

/// Detail and photo payloads fetched for one stored listing.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DetailHit {
    pub property_id: String,
    pub details: Option<RawPropertyDetails>,
    pub photos: Vec<RawPhotoGroup>,
}

/// Image URLs grouped by the provider's photo tags.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CategorizedImages {
    #[serde(default)]
    pub building: Vec<String>,
    #[serde(default)]
    pub property: Vec<String>,
    #[serde(default)]
    pub room: Vec<String>,
}

impl CategorizedImages {
    pub fn is_empty(&self) -> bool {
        self.building.is_empty() && self.property.is_empty() && self.room.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropertyDetails {
    pub property_id: String,
    pub kind: Option<String>,
    pub bedrooms: Option<u32>,
    pub bathrooms: Option<u32>,
    pub amenities: Vec<String>,
    pub images: CategorizedImages,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cleaned<T> {
    pub items: Vec<T>,
    pub rejected: usize,
    pub duplicates: usize,
}

impl<T> Cleaned<T> {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
            rejected: 0,
            duplicates: 0,
        }
    }
}

/// Trims, rejects incomplete records, assigns stable ids and drops
/// case-insensitive `(name, country)` duplicates as well as repeated ids.
/// First occurrence wins.
pub fn clean_cities(raw: Vec<RawCityRecord>) -> Cleaned<Location> {
    let total = raw.len();
    let mut cleaned = Cleaned::with_capacity(total);
    let mut seen = HashSet::with_capacity(total);
    let mut seen_ids = HashSet::with_capacity(total);

    for record in raw {
        let (Some(name), Some(country)) = (non_blank(&record.name), non_blank(&record.country))
        else {
            trace!(?record, "rejecting city with blank name or country");
            cleaned.rejected += 1;
            continue;
        };

        let id = match non_blank(&record.id) {
            Some(id) => id.to_string(),
            None => slugify(&format!("{name}-{country}")),
        };
        if id.is_empty() {
            trace!(name, country, "rejecting city without a usable identifier");
            cleaned.rejected += 1;
            continue;
        }

        let key = (name.to_lowercase(), country.to_lowercase());
        if seen.contains(&key) || seen_ids.contains(&id) {
            trace!(name, country, id = %id, "dropping duplicate city");
            cleaned.duplicates += 1;
            continue;
        }
        seen.insert(key);
        seen_ids.insert(id.clone());

        cleaned.items.push(Location {
            id,
            city_name: name.to_string(),
            country: country.to_string(),
            country_code: country_code(country),
            latitude: record.latitude.unwrap_or(0.0),
            longitude: record.longitude.unwrap_or(0.0),
        });
    }

    debug!(
        total,
        kept = cleaned.items.len(),
        rejected = cleaned.rejected,
        duplicates = cleaned.duplicates,
        "cleaned city batch"
    );
    cleaned
}

/// Same discipline for listings, keyed by provider id. First occurrence wins.
pub fn clean_properties(raw: Vec<ScopedProperty>) -> Cleaned<Property> {
    let total = raw.len();
    let mut cleaned = Cleaned::with_capacity(total);
    let mut seen = HashSet::with_capacity(total);

    for ScopedProperty { city_id, record } in raw {
        let (Some(id), Some(name)) = (non_blank(&record.id), non_blank(&record.name)) else {
            cleaned.rejected += 1;
            continue;
        };
        if city_id.trim().is_empty() {
            cleaned.rejected += 1;
            continue;
        }
        if !seen.insert(id.to_string()) {
            cleaned.duplicates += 1;
            continue;
        }

        cleaned.items.push(Property {
            id: id.to_string(),
            name: name.to_string(),
            city_id: city_id.trim().to_string(),
            kind: non_blank(&record.kind).map(str::to_string),
            rating: record
                .rating
                .filter(|rating| rating.is_finite() && (0.0..=MAX_RATING).contains(rating)),
        });
    }

    debug!(
        total,
        kept = cleaned.items.len(),
        rejected = cleaned.rejected,
        duplicates = cleaned.duplicates,
        "cleaned property batch"
    );
    cleaned
}

/// Folds detail and photo payloads into one record per listing.
///
/// Hits with a blank id, or with neither details nor photos, are rejected.
/// Bathrooms come from the first room (by provider key) that reports a
/// private bathroom count. Amenities are deduped case-insensitively in
/// provider order. First occurrence of a listing wins.
pub fn clean_property_details(raw: Vec<DetailHit>) -> Cleaned<PropertyDetails> {
    let total = raw.len();
    let mut cleaned = Cleaned::with_capacity(total);
    let mut seen = HashSet::with_capacity(total);

    for hit in raw {
        let property_id = hit.property_id.trim();
        if property_id.is_empty() || (hit.details.is_none() && hit.photos.is_empty()) {
            trace!(property_id, "rejecting empty detail hit");
            cleaned.rejected += 1;
            continue;
        }
        if !seen.insert(property_id.to_string()) {
            cleaned.duplicates += 1;
            continue;
        }

        let details = hit.details.unwrap_or_default();
        let bathrooms = details
            .rooms
            .iter()
            .flatten()
            .find_map(|(_, room)| room.private_bathroom_count);
        let amenities = dedupe_labels(
            details
                .facilities_block
                .and_then(|block| block.facilities)
                .unwrap_or_default()
                .into_iter()
                .filter_map(|facility| facility.name),
        );

        cleaned.items.push(PropertyDetails {
            property_id: property_id.to_string(),
            kind: non_blank(&details.kind).map(str::to_string),
            bedrooms: details.block_count,
            bathrooms,
            amenities,
            images: categorize_images(hit.photos),
        });
    }

    debug!(
        total,
        kept = cleaned.items.len(),
        rejected = cleaned.rejected,
        duplicates = cleaned.duplicates,
        "cleaned property detail batch"
    );
    cleaned
}

/// Groups are matched on their tag, case-insensitively. Other tags are ignored.
pub fn categorize_images(groups: Vec<RawPhotoGroup>) -> CategorizedImages {
    let mut images = CategorizedImages::default();
    let mut seen = HashSet::new();
    for group in groups {
        let tag = group.tag.as_deref().map(str::trim).unwrap_or_default().to_lowercase();
        let bucket = match tag.as_str() {
            BUILDING_TAG => &mut images.building,
            PROPERTY_TAG => &mut images.property,
            ROOM_TAG => &mut images.room,
            _ => continue,
        };
        for url in group.images.unwrap_or_default() {
            let url = url.trim();
            if !url.is_empty() && seen.insert(url.to_string()) {
                bucket.push(url.to_string());
            }
        }
    }
    images
}

fn dedupe_labels(labels: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    labels
        .filter_map(|label| {
            let label = label.trim();
            (!label.is_empty() && seen.insert(label.to_lowercase())).then(|| label.to_string())
        })
        .collect()
}

/// Lower-case ASCII slug with single `-` separators and no edge separators.
pub fn slugify(value: &str) -> String {
    let mut slug = String::with_capacity(value.len());
    let mut pending_separator = false;
    for ch in value.chars().flat_map(char::to_lowercase) {
        if ch.is_ascii_alphanumeric() {
            if pending_separator && !slug.is_empty() {
                slug.push('-');
            }
            pending_separator = false;
            slug.push(ch);
        } else {
            pending_separator = true;
        }
    }
    slug
}

pub fn country_code(country: &str) -> String {
    let trimmed = country.trim();
    if trimmed.len() == 2 && trimmed.chars().all(|ch| ch.is_ascii_alphabetic()) {
        return trimmed.to_ascii_uppercase();
    }
    let lowered = trimmed.to_lowercase();
    COUNTRY_CODES
        .iter()
        .find(|(name, _)| *name == lowered)
        .map(|(_, code)| code.to_string())
        .unwrap_or_else(|| UNKNOWN_COUNTRY_CODE.to_string())
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn city(id: &str, name: &str, country: &str) -> RawCityRecord {
        RawCityRecord::new(id, name, country)
    }

    #[test]
    fn slugs_collapse_separators() {
        assert_eq!(slugify("New York-USA"), "new-york-usa");
        assert_eq!(slugify("  --Saint  Martin!!--France "), "saint-martin-france");
        assert_eq!(slugify("São Paulo-Brazil"), "s-o-paulo-brazil");
        assert_eq!(slugify("!!!"), "");
    }

    #[test]
    fn derives_ids_and_trims_fields() {
        let cleaned = clean_cities(vec![
            city("", " paris ", "France"),
            city("d1", "Dubai", "UAE"),
            city("   ", "New York", " USA "),
        ]);
        let ids: Vec<_> = cleaned.items.iter().map(|l| l.id.as_str()).collect();
        assert_eq!(ids, vec!["paris-france", "d1", "new-york-usa"]);
        assert_eq!(cleaned.items[0].city_name, "paris");
        assert_eq!(cleaned.items[2].country, "USA");
        assert_eq!(cleaned.items[1].country_code, "AE");
        assert_eq!(cleaned.items[0].latitude, 0.0);
    }

    #[test]
    fn never_emits_blank_identifiers_or_names() {
        let cleaned = clean_cities(vec![
            city("x", "", "France"),
            city("y", "Lyon", "   "),
            RawCityRecord::default(),
            city("", "!!!", "???"),
            city("", "Nice", "France"),
        ]);
        assert_eq!(cleaned.items.len(), 1);
        assert_eq!(cleaned.rejected, 4);
        assert!(cleaned
            .items
            .iter()
            .all(|l| !l.id.trim().is_empty() && !l.city_name.trim().is_empty()));
    }

    #[test]
    fn first_duplicate_wins_case_insensitively() {
        let cleaned = clean_cities(vec![
            city("first", "Berlin", "Germany"),
            city("second", "BERLIN ", "germany"),
            city("", "berlin", "GERMANY"),
        ]);
        assert_eq!(cleaned.items.len(), 1);
        assert_eq!(cleaned.items[0].id, "first");
        assert_eq!(cleaned.duplicates, 2);
    }

    #[test]
    fn colliding_identifiers_keep_the_first_city() {
        let cleaned = clean_cities(vec![
            city("", "St. Louis", "USA"),
            city("", "St Louis", "USA"),
            city("p7", "Lagos", "Nigeria"),
            city("p7", "Lagos", "Portugal"),
        ]);
        let ids: Vec<_> = cleaned.items.iter().map(|l| l.id.as_str()).collect();
        assert_eq!(ids, vec!["st-louis-usa", "p7"]);
        assert_eq!(cleaned.items[0].city_name, "St. Louis");
        assert_eq!(cleaned.items[1].country, "Nigeria");
        assert_eq!(cleaned.duplicates, 2);
    }

    #[test]
    fn keeps_provider_coordinates() {
        let mut record = city("", "Oslo", "Norway");
        record.latitude = Some(59.91);
        record.longitude = Some(10.75);
        let cleaned = clean_cities(vec![record]);
        assert_eq!(cleaned.items[0].latitude, 59.91);
        assert_eq!(cleaned.items[0].longitude, 10.75);
    }

    #[test]
    fn country_codes_fall_back_to_sentinel() {
        assert_eq!(country_code("France"), "FR");
        assert_eq!(country_code(" united kingdom "), "GB");
        assert_eq!(country_code("de"), "DE");
        assert_eq!(country_code("Atlantis"), UNKNOWN_COUNTRY_CODE);
        assert_eq!(country_code(""), UNKNOWN_COUNTRY_CODE);
    }

    #[test]
    fn cleans_properties_by_provider_id() {
        let hit = |id: &str, name: &str, rating: Option<f64>| ScopedProperty {
            city_id: "paris-france".into(),
            record: RawPropertyRecord {
                id: Some(id.into()),
                name: Some(name.into()),
                kind: Some("hotel".into()),
                rating,
                ..RawPropertyRecord::default()
            },
        };
        let cleaned = clean_properties(vec![
            hit("p1", " Hotel Lumiere ", Some(8.7)),
            hit("p1", "Hotel Lumiere (dup)", None),
            hit("p2", "", None),
            hit("p3", "Rive Gauche", Some(42.0)),
        ]);
        assert_eq!(cleaned.items.len(), 2);
        assert_eq!(cleaned.duplicates, 1);
        assert_eq!(cleaned.rejected, 1);
        assert_eq!(cleaned.items[0].name, "Hotel Lumiere");
        assert_eq!(cleaned.items[0].rating, Some(8.7));
        assert_eq!(cleaned.items[1].rating, None);
    }

    fn photo_group(tag: &str, urls: &[&str]) -> RawPhotoGroup {
        RawPhotoGroup {
            tag: Some(tag.into()),
            images: Some(urls.iter().map(|url| url.to_string()).collect()),
        }
    }

    #[test]
    fn folds_details_and_photos_per_listing() {
        let details: RawPropertyDetails = serde_json::from_value(serde_json::json!({
            "hotel_id": 9,
            "accommodation_type_name": " Apartment ",
            "block_count": 3,
            "rooms": {
                "b": { "private_bathroom_count": 2 },
                "a": {}
            },
            "facilities_block": { "facilities": [
                { "name": "Free WiFi" }, { "name": "free wifi" }, { "name": " " }, { "name": "Pool" }
            ] }
        }))
        .unwrap();
        let cleaned = clean_property_details(vec![DetailHit {
            property_id: " h9 ".into(),
            details: Some(details),
            photos: vec![
                photo_group("Property building", &["https://img/b1.jpg"]),
                photo_group("Room", &["https://img/r1.jpg", "https://img/r1.jpg"]),
                photo_group("Food", &["https://img/f1.jpg"]),
                photo_group("property", &["https://img/p1.jpg"]),
            ],
        }]);

        let item = &cleaned.items[0];
        assert_eq!(item.property_id, "h9");
        assert_eq!(item.kind.as_deref(), Some("Apartment"));
        assert_eq!(item.bedrooms, Some(3));
        assert_eq!(item.bathrooms, Some(2));
        assert_eq!(item.amenities, vec!["Free WiFi", "Pool"]);
        assert_eq!(item.images.building, vec!["https://img/b1.jpg"]);
        assert_eq!(item.images.property, vec!["https://img/p1.jpg"]);
        assert_eq!(item.images.room, vec!["https://img/r1.jpg"]);
    }

    #[test]
    fn rejects_empty_detail_hits_and_keeps_the_first_duplicate() {
        let cleaned = clean_property_details(vec![
            DetailHit {
                property_id: "h1".into(),
                photos: vec![photo_group("Room", &["https://img/1.jpg"])],
                ..DetailHit::default()
            },
            DetailHit {
                property_id: "h1".into(),
                photos: vec![photo_group("Room", &["https://img/2.jpg"])],
                ..DetailHit::default()
            },
            DetailHit {
                property_id: "h2".into(),
                ..DetailHit::default()
            },
            DetailHit {
                property_id: "  ".into(),
                details: Some(RawPropertyDetails::default()),
                ..DetailHit::default()
            },
        ]);
        assert_eq!(cleaned.items.len(), 1);
        assert_eq!(cleaned.items[0].images.room, vec!["https://img/1.jpg"]);
        assert_eq!(cleaned.items[0].bathrooms, None);
        assert!(cleaned.items[0].amenities.is_empty());
        assert_eq!(cleaned.rejected, 2);
        assert_eq!(cleaned.duplicates, 1);
    }
}
