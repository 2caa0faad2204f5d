//! Database initialization
//!
//! Creates the schema on first run and opens existing databases untouched.
//! All DDL is idempotent (`CREATE TABLE IF NOT EXISTS`), so calling this
//! repeatedly is safe.

use crate::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::info;

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    // Create parent directory if it doesn't exist
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .connect(&db_url)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    // Enable foreign keys
    sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;

    // WAL allows concurrent readers while webhook handlers write
    sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;

    sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;

    create_users_table(&pool).await?;
    create_releases_table(&pool).await?;
    create_songs_table(&pool).await?;
    create_royalty_splits_table(&pool).await?;
    create_royalty_invitations_table(&pool).await?;
    create_subscription_plans_table(&pool).await?;
    create_payment_methods_table(&pool).await?;
    create_subscriptions_table(&pool).await?;
    create_payment_transactions_table(&pool).await?;
    create_subscription_changes_table(&pool).await?;

    Ok(pool)
}

async fn create_users_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            email TEXT,
            phone TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_releases_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS releases (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            status INTEGER NOT NULL DEFAULT 0,
            release_date TEXT,
            owner_user_id INTEGER NOT NULL REFERENCES users(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_songs_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS songs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            release_id INTEGER NOT NULL REFERENCES releases(id) ON DELETE CASCADE,
            name TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_royalty_splits_table(pool: &SqlitePool) -> Result<()> {
    // rate is a decimal string with four decimal places, e.g. "0.2500"
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS royalty_splits (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            song_id INTEGER NOT NULL REFERENCES songs(id) ON DELETE CASCADE,
            user_id INTEGER REFERENCES users(id),
            rate TEXT NOT NULL,
            revision INTEGER NOT NULL DEFAULT 1,
            status INTEGER NOT NULL DEFAULT 0,
            is_owner INTEGER NOT NULL DEFAULT 0,
            is_locked INTEGER NOT NULL DEFAULT 0,
            start_date TEXT,
            end_date TEXT,
            created TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_royalty_splits_song_revision
         ON royalty_splits(song_id, revision)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_royalty_invitations_table(pool: &SqlitePool) -> Result<()> {
    // SET NULL, not CASCADE: an EXPIRED invitation must outlive the splits
    // of the revision it belonged to
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS royalty_invitations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            split_id INTEGER UNIQUE REFERENCES royalty_splits(id) ON DELETE SET NULL,
            inviter_id INTEGER NOT NULL REFERENCES users(id),
            invitee_id INTEGER REFERENCES users(id),
            token TEXT UNIQUE,
            name TEXT NOT NULL,
            email TEXT,
            phone TEXT,
            status INTEGER NOT NULL DEFAULT 0,
            last_sent TIMESTAMP,
            created TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_subscription_plans_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS subscription_plans (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            apple_product_id TEXT,
            google_product_id TEXT,
            price TEXT NOT NULL,
            currency TEXT NOT NULL DEFAULT 'USD'
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_payment_methods_table(pool: &SqlitePool) -> Result<()> {
    // external_recurring_id is the provider recurring key:
    // Apple original_transaction_id or Google purchase token
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS payment_methods (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL REFERENCES users(id),
            method TEXT NOT NULL,
            external_recurring_id TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_payment_methods_recurring
         ON payment_methods(external_recurring_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_subscriptions_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS subscriptions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL REFERENCES users(id),
            plan_id INTEGER NOT NULL REFERENCES subscription_plans(id),
            payment_method_id INTEGER NOT NULL REFERENCES payment_methods(id),
            provider INTEGER NOT NULL,
            status INTEGER NOT NULL DEFAULT 0,
            valid_from TEXT NOT NULL,
            valid_until TEXT,
            grace_period_until TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_payment_transactions_table(pool: &SqlitePool) -> Result<()> {
    // The UNIQUE constraint on external_transaction_id is the backstop for
    // duplicate webhook delivery: handlers check first, the constraint
    // catches whatever races past the check.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS payment_transactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL REFERENCES users(id),
            subscription_id INTEGER NOT NULL REFERENCES subscriptions(id),
            plan_id INTEGER NOT NULL REFERENCES subscription_plans(id),
            amount TEXT NOT NULL,
            currency TEXT NOT NULL DEFAULT 'USD',
            category INTEGER NOT NULL DEFAULT 0,
            status INTEGER NOT NULL DEFAULT 0,
            external_transaction_id TEXT NOT NULL UNIQUE,
            paid_until TIMESTAMP,
            created TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_subscription_changes_table(pool: &SqlitePool) -> Result<()> {
    // Audit log: one row per status mutation, with the reason enum name
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS subscription_changes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            subscription_id INTEGER NOT NULL REFERENCES subscriptions(id),
            reason TEXT NOT NULL,
            changed_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
