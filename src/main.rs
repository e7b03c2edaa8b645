//! rental-ingest: run provider ingestion and inspect the stored catalogue.

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use rental_ingest::config::AppConfig;
use rental_ingest::store::LocationQuery;
use rental_ingest::AppState;

#[derive(Parser, Debug)]
#[command(name = "rental-ingest", version, about)]
struct Cli {
    /// Overrides DATABASE_PATH.
    #[arg(long)]
    database: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Discover cities and upsert them.
    Cities,
    /// Search listings for every stored city and upsert them.
    Properties,
    /// Fetch details and photos for every stored listing.
    Details,
    /// Print one page of stored locations as JSON.
    List {
        #[arg(default_value_t = 1)]
        page: u32,
        country: Option<String>,
        name: Option<String>,
        #[arg(long, default_value_t = 20)]
        page_size: u32,
    },
    /// Print a single stored location.
    Show { id: String },
    /// Print stored listings for one city.
    Listings { city_id: String },
    /// Print stored details for one listing.
    Detail { property_id: String },
    /// Print cities grouped by country.
    Summary,
    /// Print configuration and store status.
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = AppConfig::from_env();
    if let Some(database) = cli.database {
        config.database_path = database;
    }
    let state = AppState::initialize(config).context("failed to initialize application state")?;

    match cli.command {
        Command::Cities => {
            let cancel = cancel_on_ctrl_c();
            let report = state
                .run_ingestion(&cancel)
                .await
                .context("city ingestion failed")?;
            print_json(&report)?;
        }
        Command::Properties => {
            let cancel = cancel_on_ctrl_c();
            let report = state
                .run_property_ingestion(&cancel)
                .await
                .context("property ingestion failed")?;
            print_json(&report)?;
        }
        Command::Details => {
            let cancel = cancel_on_ctrl_c();
            let report = state
                .run_detail_ingestion(&cancel)
                .await
                .context("detail ingestion failed")?;
            print_json(&report)?;
        }
        Command::List {
            page,
            country,
            name,
            page_size,
        } => {
            let page = state.list_locations(&LocationQuery {
                page,
                page_size,
                country,
                name,
            })?;
            print_json(&page)?;
        }
        Command::Show { id } => match state.get_location(&id)? {
            Some(location) => print_json(&location)?,
            None => anyhow::bail!("location {id} not found"),
        },
        Command::Listings { city_id } => print_json(&state.properties_for_city(&city_id)?)?,
        Command::Detail { property_id } => match state.property_details(&property_id)? {
            Some(details) => print_json(&details)?,
            None => anyhow::bail!("no details stored for {property_id}"),
        },
        Command::Summary => print_json(&state.countries_and_cities()?)?,
        Command::Status => print_json(&state.status()?)?,
    }
    Ok(())
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received, cancelling ingestion");
                token.cancel();
            }
            Err(err) => warn!(error = %err, "unable to listen for ctrl-c"),
        }
    });
    cancel
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
