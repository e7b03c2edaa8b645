//! Discovery queries. The provider only offers free-text search, so the
//! search space is bounded up front.

const COMMON_PREFIXES: &[&str] = &["new", "old", "north", "south", "east", "west", "central"];
const SEED_CITIES: &[&str] = &["New York", "London", "Tokyo", "Paris", "Dubai"];
const PROPERTY_QUERY_SUFFIXES: &[&str] = &["", " hotels", " accommodation"];

/// A–Z, then the common prefixes, then the seed city names.
pub fn location_queries() -> Vec<String> {
    let mut queries = Vec::with_capacity(26 + COMMON_PREFIXES.len() + SEED_CITIES.len());
    queries.extend(('A'..='Z').map(String::from));
    queries.extend(COMMON_PREFIXES.iter().map(|word| word.to_string()));
    queries.extend(SEED_CITIES.iter().map(|city| city.to_string()));
    queries
}

/// Listing searches for one city: the bare name plus two accommodation phrasings.
pub fn property_queries(city_name: &str) -> Vec<String> {
    let city_name = city_name.trim();
    if city_name.is_empty() {
        return Vec::new();
    }
    PROPERTY_QUERY_SUFFIXES
        .iter()
        .map(|suffix| format!("{city_name}{suffix}"))
        .collect()
}
