//! split-sweeps - Release-day split maintenance
//!
//! Runs the two recurring jobs over released songs: cancelling unconfirmed
//! first-revision splits (unclaimed share back to the owner) and expiring
//! stale invitations. Meant for cron on release days; both jobs are safe
//! to re-run.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::Parser;
use crescendo_api::notifier::{spawn_notifier, LogSink};
use crescendo_api::splits::{invitations, sweeps};
use crescendo_common::config::{load_config, resolve_database_path};
use crescendo_common::db::init::init_database;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "split-sweeps", about = "Run royalty split maintenance jobs")]
struct Args {
    /// Path to the sqlite database file
    #[arg(long)]
    database: Option<String>,

    /// Start of the release-date window (default: today)
    #[arg(long)]
    start_date: Option<NaiveDate>,

    /// End of the release-date window (default: today)
    #[arg(long)]
    end_date: Option<NaiveDate>,

    /// Skip the invitation expiry job
    #[arg(long)]
    no_expire_invites: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let db_path = resolve_database_path(args.database.as_deref(), "CRESCENDO_DATABASE")?;
    let db = init_database(&db_path)
        .await
        .context("Failed to open database")?;

    let summary = sweeps::cancel_pending_splits(&db, args.start_date, args.end_date)
        .await
        .context("Pending-split cancellation failed")?;
    info!(
        songs_cancelled = summary.songs_cancelled,
        splits_created = summary.splits_created,
        songs_backfilled = summary.songs_backfilled,
        "Pending-split sweep finished"
    );

    if !args.no_expire_invites {
        let config = load_config().context("Failed to load configuration")?;
        let notifier = spawn_notifier(Arc::new(LogSink));
        let expired =
            invitations::expire_invites(&db, &notifier, None, config.invite_expiration_days)
                .await
                .context("Invitation expiry failed")?;
        info!(expired, "Invitation expiry finished");
    }

    Ok(())
}
