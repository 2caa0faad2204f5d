//! validate-splits - Read-only split consistency checker
//!
//! Scans the royalty splits of released songs and prints a JSON summary of
//! every consistency failure, grouped by check name. Exits nonzero when any
//! failure is found so it can gate deploys and run under cron.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::Parser;
use crescendo_api::db::splits as splits_db;
use crescendo_api::splits::validate::validate_splits_for_songs;
use crescendo_common::config::resolve_database_path;
use crescendo_common::db::init::init_database;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "validate-splits", about = "Check royalty split consistency")]
struct Args {
    /// Path to the sqlite database file
    #[arg(long)]
    database: Option<String>,

    /// Only check songs released on or after this date (YYYY-MM-DD)
    #[arg(long)]
    start_date: Option<NaiveDate>,

    /// Only check songs released on or before this date (YYYY-MM-DD)
    #[arg(long)]
    end_date: Option<NaiveDate>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let db_path = resolve_database_path(args.database.as_deref(), "CRESCENDO_DATABASE")?;
    let db = init_database(&db_path)
        .await
        .context("Failed to open database")?;

    let song_ids = splits_db::song_ids_by_release_date(&db, args.start_date, args.end_date)
        .await
        .context("Failed to list songs")?;

    let report = validate_splits_for_songs(&db, &song_ids, true)
        .await
        .context("Validation failed")?;

    info!(
        songs_checked = report.songs_checked,
        failures = report.failures.len(),
        "Validation finished"
    );

    println!("{}", serde_json::to_string_pretty(&report.summary())?);

    if !report.is_clean() {
        std::process::exit(1);
    }

    Ok(())
}
