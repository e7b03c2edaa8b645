use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OpenFlags};
use tracing::info;

use crate::errors::{AppError, AppResult};

pub struct DatabaseContext {
    pub connection: Connection,
    pub path: PathBuf,
}

/// Opens (creating if needed) the database file and brings the schema up to date.
pub fn bootstrap<P: AsRef<Path>>(database_path: P) -> AppResult<DatabaseContext> {
    let db_path = database_path.as_ref();
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
    let connection = Connection::open_with_flags(db_path, flags)?;
    apply_pragmas(&connection)?;
    run_migrations(&connection)?;

    info!(
        target: "database_bootstrap",
        path = %db_path.display(),
        "database context established"
    );
    Ok(DatabaseContext {
        connection,
        path: db_path.to_path_buf(),
    })
}

pub fn open_in_memory() -> AppResult<Connection> {
    let connection = Connection::open_in_memory()?;
    connection.execute_batch("PRAGMA foreign_keys = ON;")?;
    run_migrations(&connection)?;
    Ok(connection)
}

fn apply_pragmas(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 5000;
        "#,
    )?;
    Ok(())
}

fn run_migrations(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS locations (
            id TEXT PRIMARY KEY,
            city_name TEXT NOT NULL,
            country TEXT NOT NULL,
            country_code TEXT NOT NULL DEFAULT 'XX',
            latitude REAL NOT NULL DEFAULT 0,
            longitude REAL NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS properties (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            city_id TEXT NOT NULL,
            kind TEXT,
            rating REAL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY (city_id) REFERENCES locations(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS property_details (
            property_id TEXT PRIMARY KEY,
            kind TEXT,
            bedrooms INTEGER,
            bathrooms INTEGER,
            amenities TEXT NOT NULL DEFAULT '[]',
            images TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY (property_id) REFERENCES properties(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_locations_country ON locations(country);
        CREATE INDEX IF NOT EXISTS idx_locations_city_name ON locations(city_name);
        CREATE INDEX IF NOT EXISTS idx_properties_city ON properties(city_id);
        "#,
    )?;
    Ok(())
}

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(raw: &str) -> AppResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|err| AppError::Storage(format!("invalid stored timestamp {raw:?}: {err}")))
}
