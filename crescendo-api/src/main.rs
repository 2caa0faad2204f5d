//! crescendo-api - Royalty split and subscription backend
//!
//! HTTP service handling royalty split revisions, invitation confirmation,
//! and the Apple/Google subscription webhook receivers.

use anyhow::{Context, Result};
use clap::Parser;
use crescendo_api::api::{self, AppContext};
use crescendo_api::notifier::{spawn_notifier, LogSink};
use crescendo_api::subscriptions::google::verifier::{GooglePlayVerifier, PurchaseVerifier};
use crescendo_common::config::{load_config, Environment};
use crescendo_common::db::init::init_database;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

const DEFAULT_GOOGLE_API_URL: &str = "https://androidpublisher.googleapis.com/androidpublisher/v3";

#[derive(Parser, Debug)]
#[command(name = "crescendo-api", about = "Royalty split and subscription backend")]
struct Args {
    /// Port to listen on
    #[arg(long, env = "CRESCENDO_PORT")]
    port: Option<u16>,

    /// Path to the sqlite database file
    #[arg(long, env = "CRESCENDO_DATABASE")]
    database: Option<PathBuf>,

    /// Deployment environment (production or staging)
    #[arg(long, env = "CRESCENDO_ENVIRONMENT")]
    environment: Option<String>,

    /// Staging endpoint for forwarding sandbox Apple payloads
    #[arg(long, env = "CRESCENDO_STAGING_FORWARD_URL")]
    staging_forward_url: Option<String>,

    /// Base URL of the Google Play androidpublisher API
    #[arg(long, env = "GOOGLE_PLAY_API_URL", default_value = DEFAULT_GOOGLE_API_URL)]
    google_api_url: String,

    /// Android package name used for purchase verification
    #[arg(long, env = "GOOGLE_PLAY_PACKAGE", default_value = "com.crescendo.app")]
    google_package: String,
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

    info!("Starting crescendo-api v{}", env!("CARGO_PKG_VERSION"));

    // Config file first, CLI/env overrides on top
    let mut config = load_config().context("Failed to load configuration")?;
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(database) = args.database {
        config.database = database;
    }
    if let Some(environment) = &args.environment {
        config.environment = environment.parse()?;
    }
    if args.staging_forward_url.is_some() {
        config.staging_forward_url = args.staging_forward_url;
    }

    if config.environment == Environment::Production && config.staging_forward_url.is_none() {
        info!("No staging forward URL configured; sandbox Apple payloads will be dropped");
    }

    info!("Database path: {}", config.database.display());
    let db = init_database(&config.database)
        .await
        .context("Failed to initialize database")?;
    info!("✓ Database ready");

    let http = reqwest::Client::new();

    let notifier = spawn_notifier(Arc::new(LogSink));
    let verifier: Arc<dyn PurchaseVerifier> = Arc::new(GooglePlayVerifier::new(
        http.clone(),
        args.google_api_url,
        args.google_package,
    ));

    let ctx = AppContext {
        db,
        config: Arc::new(config),
        notifier,
        verifier,
        http,
    };

    api::run(ctx).await.context("HTTP server failed")?;

    Ok(())
}
