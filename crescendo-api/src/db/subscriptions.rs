//! Subscription and payment transaction queries
//!
//! Lookups are keyed by the provider-assigned external ids: the recurring
//! id (Apple original_transaction_id / Google purchase token) locates the
//! payment method and its subscriptions, the external transaction id is the
//! webhook dedup key.

use crate::db::parse_decimal;
use crate::{Error, Result};
use chrono::{DateTime, NaiveDate, Utc};
use crescendo_common::db::models::{
    PaymentMethod, PaymentTransaction, Subscription, SubscriptionPlan, SubscriptionProvider,
    SubscriptionStatus, TransactionCategory, TransactionStatus,
};
use rust_decimal::Decimal;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

fn subscription_from_row(row: &SqliteRow) -> Result<Subscription> {
    let status_raw: i64 = row.get("status");
    let provider_raw: i64 = row.get("provider");

    Ok(Subscription {
        id: row.get("id"),
        user_id: row.get("user_id"),
        plan_id: row.get("plan_id"),
        payment_method_id: row.get("payment_method_id"),
        provider: SubscriptionProvider::from_i64(provider_raw)
            .ok_or_else(|| Error::InvalidState(format!("unknown provider {}", provider_raw)))?,
        status: SubscriptionStatus::from_i64(status_raw)
            .ok_or_else(|| Error::InvalidState(format!("unknown subscription status {}", status_raw)))?,
        valid_from: row.get("valid_from"),
        valid_until: row.get("valid_until"),
        grace_period_until: row.get("grace_period_until"),
    })
}

fn transaction_from_row(row: &SqliteRow) -> Result<PaymentTransaction> {
    let status_raw: i64 = row.get("status");
    let category_raw: i64 = row.get("category");

    Ok(PaymentTransaction {
        id: row.get("id"),
        user_id: row.get("user_id"),
        subscription_id: row.get("subscription_id"),
        plan_id: row.get("plan_id"),
        amount: parse_decimal(&row.get::<String, _>("amount"))?,
        currency: row.get("currency"),
        category: TransactionCategory::from_i64(category_raw)
            .ok_or_else(|| Error::InvalidState(format!("unknown category {}", category_raw)))?,
        status: TransactionStatus::from_i64(status_raw)
            .ok_or_else(|| Error::InvalidState(format!("unknown transaction status {}", status_raw)))?,
        external_transaction_id: row.get("external_transaction_id"),
        paid_until: row.get("paid_until"),
        created: row.get("created"),
    })
}

fn payment_method_from_row(row: &SqliteRow) -> PaymentMethod {
    PaymentMethod {
        id: row.get("id"),
        user_id: row.get("user_id"),
        method: row.get("method"),
        external_recurring_id: row.get("external_recurring_id"),
    }
}

// ============================================================================
// Payment transactions
// ============================================================================

pub async fn get_transaction_by_external_id(
    db: &SqlitePool,
    external_transaction_id: &str,
) -> Result<Option<PaymentTransaction>> {
    let row = sqlx::query("SELECT * FROM payment_transactions WHERE external_transaction_id = ?")
        .bind(external_transaction_id)
        .fetch_optional(db)
        .await?;

    row.as_ref().map(transaction_from_row).transpose()
}

/// Most recent local transaction matching any of the receipt's transaction
/// ids. Apple receipts carry the full history, so this anchors an
/// out-of-order notification to the subscription it belongs to.
pub async fn latest_transaction_by_external_ids(
    db: &SqlitePool,
    external_ids: &[String],
) -> Result<Option<PaymentTransaction>> {
    let mut latest: Option<PaymentTransaction> = None;

    for id in external_ids {
        if let Some(tx) = get_transaction_by_external_id(db, id).await? {
            latest = match latest {
                Some(prev) if prev.created >= tx.created => Some(prev),
                _ => Some(tx),
            };
        }
    }

    Ok(latest)
}

#[allow(clippy::too_many_arguments)]
pub async fn insert_transaction(
    db: &SqlitePool,
    user_id: i64,
    subscription_id: i64,
    plan_id: i64,
    amount: Decimal,
    currency: &str,
    category: TransactionCategory,
    status: TransactionStatus,
    external_transaction_id: &str,
    paid_until: Option<DateTime<Utc>>,
) -> Result<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO payment_transactions
            (user_id, subscription_id, plan_id, amount, currency, category,
             status, external_transaction_id, paid_until)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(user_id)
    .bind(subscription_id)
    .bind(plan_id)
    .bind(amount.to_string())
    .bind(currency)
    .bind(category.as_i64())
    .bind(status.as_i64())
    .bind(external_transaction_id)
    .bind(paid_until)
    .execute(db)
    .await?;

    Ok(result.last_insert_rowid())
}

pub async fn set_transaction_status(
    db: &SqlitePool,
    transaction_id: i64,
    status: TransactionStatus,
) -> Result<()> {
    sqlx::query("UPDATE payment_transactions SET status = ? WHERE id = ?")
        .bind(status.as_i64())
        .bind(transaction_id)
        .execute(db)
        .await?;

    Ok(())
}

pub async fn set_transaction_paid_until(
    db: &SqlitePool,
    transaction_id: i64,
    paid_until: DateTime<Utc>,
) -> Result<()> {
    sqlx::query("UPDATE payment_transactions SET paid_until = ? WHERE id = ?")
        .bind(paid_until)
        .bind(transaction_id)
        .execute(db)
        .await?;

    Ok(())
}

// ============================================================================
// Subscriptions
// ============================================================================

pub async fn get_subscription(db: &SqlitePool, id: i64) -> Result<Subscription> {
    let row = sqlx::query("SELECT * FROM subscriptions WHERE id = ?")
        .bind(id)
        .fetch_optional(db)
        .await?
        .ok_or_else(|| Error::NotFound(format!("subscription {}", id)))?;

    subscription_from_row(&row)
}

pub async fn insert_subscription(
    db: &SqlitePool,
    user_id: i64,
    plan_id: i64,
    payment_method_id: i64,
    provider: SubscriptionProvider,
    status: SubscriptionStatus,
    valid_from: NaiveDate,
    valid_until: Option<NaiveDate>,
) -> Result<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO subscriptions
            (user_id, plan_id, payment_method_id, provider, status, valid_from, valid_until)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(user_id)
    .bind(plan_id)
    .bind(payment_method_id)
    .bind(provider.as_i64())
    .bind(status.as_i64())
    .bind(valid_from)
    .bind(valid_until)
    .execute(db)
    .await?;

    Ok(result.last_insert_rowid())
}

/// Write a subscription state transition (status + validity window)
pub async fn update_subscription_state(
    db: &SqlitePool,
    id: i64,
    status: SubscriptionStatus,
    valid_until: Option<NaiveDate>,
    grace_period_until: Option<NaiveDate>,
) -> Result<()> {
    sqlx::query(
        "UPDATE subscriptions SET status = ?, valid_until = ?, grace_period_until = ?
         WHERE id = ?",
    )
    .bind(status.as_i64())
    .bind(valid_until)
    .bind(grace_period_until)
    .bind(id)
    .execute(db)
    .await?;

    Ok(())
}

pub async fn update_subscription_plan(db: &SqlitePool, id: i64, plan_id: i64) -> Result<()> {
    sqlx::query("UPDATE subscriptions SET plan_id = ? WHERE id = ?")
        .bind(plan_id)
        .bind(id)
        .execute(db)
        .await?;

    Ok(())
}

pub async fn insert_subscription_change(db: &SqlitePool, id: i64, reason: &str) -> Result<()> {
    sqlx::query("INSERT INTO subscription_changes (subscription_id, reason) VALUES (?, ?)")
        .bind(id)
        .bind(reason)
        .execute(db)
        .await?;

    Ok(())
}

/// All ACTIVE or GRACE_PERIOD subscriptions attached to the recurring id.
/// There should never be more than one; callers that cannot tolerate
/// duplicates use the singular lookup below.
pub async fn active_subscriptions_by_recurring_id(
    db: &SqlitePool,
    external_recurring_id: &str,
) -> Result<Vec<Subscription>> {
    let rows = sqlx::query(
        r#"
        SELECT sub.* FROM subscriptions sub
        JOIN payment_methods pm ON pm.id = sub.payment_method_id
        WHERE pm.external_recurring_id = ? AND sub.status IN (?, ?)
        "#,
    )
    .bind(external_recurring_id)
    .bind(SubscriptionStatus::Active.as_i64())
    .bind(SubscriptionStatus::GracePeriod.as_i64())
    .fetch_all(db)
    .await?;

    rows.iter().map(subscription_from_row).collect()
}

/// ACTIVE or GRACE_PERIOD subscription attached to the recurring id.
/// Errors if more than one matches; that is corrupt state worth surfacing.
pub async fn active_subscription_by_recurring_id(
    db: &SqlitePool,
    external_recurring_id: &str,
) -> Result<Option<Subscription>> {
    let mut subs = active_subscriptions_by_recurring_id(db, external_recurring_id).await?;

    if subs.len() > 1 {
        return Err(Error::InvalidState(format!(
            "multiple active subscriptions for recurring id {}",
            external_recurring_id
        )));
    }

    Ok(subs.pop())
}

/// Most relevant subscription for a recurring id across ACTIVE,
/// GRACE_PERIOD and EXPIRED. Used for comparisons only, never mutation:
/// ACTIVE beats GRACE_PERIOD beats EXPIRED, newer id breaks ties.
pub async fn handleable_subscription_by_recurring_id(
    db: &SqlitePool,
    external_recurring_id: &str,
) -> Result<Option<Subscription>> {
    let rows = sqlx::query(
        r#"
        SELECT sub.* FROM subscriptions sub
        JOIN payment_methods pm ON pm.id = sub.payment_method_id
        WHERE pm.external_recurring_id = ? AND sub.status IN (?, ?, ?)
        "#,
    )
    .bind(external_recurring_id)
    .bind(SubscriptionStatus::Active.as_i64())
    .bind(SubscriptionStatus::GracePeriod.as_i64())
    .bind(SubscriptionStatus::Expired.as_i64())
    .fetch_all(db)
    .await?;

    let mut subs = rows
        .iter()
        .map(subscription_from_row)
        .collect::<Result<Vec<_>>>()?;

    let rank = |s: SubscriptionStatus| match s {
        SubscriptionStatus::Active => 0,
        SubscriptionStatus::GracePeriod => 1,
        _ => 2,
    };
    subs.sort_by(|a, b| rank(a.status).cmp(&rank(b.status)).then(b.id.cmp(&a.id)));

    Ok(subs.into_iter().next())
}

// ============================================================================
// Payment methods and plans
// ============================================================================

pub async fn insert_payment_method(
    db: &SqlitePool,
    user_id: i64,
    method: &str,
    external_recurring_id: &str,
) -> Result<i64> {
    let result = sqlx::query(
        "INSERT INTO payment_methods (user_id, method, external_recurring_id) VALUES (?, ?, ?)",
    )
    .bind(user_id)
    .bind(method)
    .bind(external_recurring_id)
    .execute(db)
    .await?;

    Ok(result.last_insert_rowid())
}

pub async fn get_payment_method_by_recurring_id(
    db: &SqlitePool,
    external_recurring_id: &str,
) -> Result<Option<PaymentMethod>> {
    let row = sqlx::query("SELECT * FROM payment_methods WHERE external_recurring_id = ?")
        .bind(external_recurring_id)
        .fetch_optional(db)
        .await?;

    Ok(row.as_ref().map(payment_method_from_row))
}

fn plan_from_row(row: &SqliteRow) -> Result<SubscriptionPlan> {
    Ok(SubscriptionPlan {
        id: row.get("id"),
        name: row.get("name"),
        apple_product_id: row.get("apple_product_id"),
        google_product_id: row.get("google_product_id"),
        price: parse_decimal(&row.get::<String, _>("price"))?,
        currency: row.get("currency"),
    })
}

pub async fn get_plan_by_apple_product_id(
    db: &SqlitePool,
    product_id: &str,
) -> Result<Option<SubscriptionPlan>> {
    let row = sqlx::query("SELECT * FROM subscription_plans WHERE apple_product_id = ?")
        .bind(product_id)
        .fetch_optional(db)
        .await?;

    row.as_ref().map(plan_from_row).transpose()
}

pub async fn get_plan_by_google_product_id(
    db: &SqlitePool,
    product_id: &str,
) -> Result<Option<SubscriptionPlan>> {
    let row = sqlx::query("SELECT * FROM subscription_plans WHERE google_product_id = ?")
        .bind(product_id)
        .fetch_optional(db)
        .await?;

    row.as_ref().map(plan_from_row).transpose()
}
