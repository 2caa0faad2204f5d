//! Apple App Store server-to-server notification handling
//!
//! One POST per store event, dispatched on `notification_type`. Apple
//! retries on 404 and may deliver out of order, so every handler anchors on
//! transaction ids it already knows and treats replays as no-ops.

pub mod receipt;

mod cancel;
mod interactive;
mod renew;

use crate::db::subscriptions as db;
use crate::subscriptions::{Action, ChangeReason, Rule};
use crate::{Error, Result};
use chrono::Utc;
use crescendo_common::config::{Config, Environment};
use crescendo_common::db::models::{SubscriptionProvider, TransactionCategory, TransactionStatus};
use receipt::{AppleNotification, Receipt};
use sqlx::SqlitePool;
use tracing::{info, warn};

pub use receipt::is_payload_valid;

/// Handle one notification. `Ok(())` maps to 200; `Error::NotFound` to 404
/// (Apple retries later); other errors to 400.
pub async fn process_notification(
    db: &SqlitePool,
    config: &Config,
    http: &reqwest::Client,
    notification: &AppleNotification,
) -> Result<()> {
    if !is_payload_valid(notification) {
        return Err(Error::MalformedPayload(
            "unified_receipt.latest_receipt_info missing or empty".into(),
        ));
    }

    if is_sandbox(notification) && config.environment == Environment::Production {
        forward_to_staging(config, http, notification);
        return Ok(());
    }

    match notification.notification_type.as_str() {
        "INITIAL_BUY" => initial_buy(db, notification).await,
        "DID_RENEW" | "DID_RECOVER" | "RENEWAL" | "DID_FAIL_TO_RENEW" => {
            renew::handle(db, notification).await
        }
        "CANCEL" => cancel::handle(db, notification).await,
        "DID_CHANGE_RENEWAL_STATUS" => change_renewal_status(db, notification).await,
        "DID_CHANGE_RENEWAL_PREF" => change_renewal_pref(db, notification).await,
        "INTERACTIVE_RENEWAL" => interactive::handle(db, notification).await,
        other => {
            // Unknown types are acknowledged so Apple does not retry them
            warn!(notification_type = other, "No handler implemented, ignoring");
            Ok(())
        }
    }
}

fn is_sandbox(notification: &AppleNotification) -> bool {
    let top = notification.environment.as_deref();
    let inner = notification
        .unified_receipt
        .as_ref()
        .and_then(|u| u.environment.as_deref());

    top == Some("Sandbox") || inner == Some("Sandbox")
}

/// Fire-and-forget relay of sandbox traffic hitting production
fn forward_to_staging(config: &Config, http: &reqwest::Client, notification: &AppleNotification) {
    let Some(url) = config.staging_forward_url.clone() else {
        warn!("Sandbox payload received but no staging forward URL configured");
        return;
    };

    let http = http.clone();
    let body = notification.clone();

    tokio::spawn(async move {
        match http.post(&url).json(&body).send().await {
            Ok(resp) => info!(status = %resp.status(), "Forwarded sandbox payload to staging"),
            Err(e) => warn!(error = %e, "Failed to forward sandbox payload"),
        }
    });
}

/// Shared by the renewal-flavoured handlers: record the newest receipt
/// transaction as a RENEWAL row, priced from the plan.
pub(crate) async fn insert_renewal_transaction(
    db: &SqlitePool,
    user_id: i64,
    subscription_id: i64,
    plan: &crescendo_common::db::models::SubscriptionPlan,
    transaction_id: &str,
    paid_until: chrono::DateTime<Utc>,
) -> Result<i64> {
    db::insert_transaction(
        db,
        user_id,
        subscription_id,
        plan.id,
        plan.price,
        &plan.currency,
        TransactionCategory::Renewal,
        TransactionStatus::Approved,
        transaction_id,
        Some(paid_until),
    )
    .await
}

/// INITIAL_BUY: first purchase of the subscription group. The payment
/// method is registered by the in-app purchase endpoint; if the webhook
/// arrives first the 404 makes Apple retry after that endpoint has run.
async fn initial_buy(db: &SqlitePool, notification: &AppleNotification) -> Result<()> {
    let receipt = Receipt::parse(notification)?;
    let last = receipt.last_transaction();

    if db::get_transaction_by_external_id(db, &last.transaction_id)
        .await?
        .is_some()
    {
        info!(
            transaction_id = %last.transaction_id,
            "INITIAL_BUY already recorded, ignoring replay"
        );
        return Ok(());
    }

    let payment_method = db::get_payment_method_by_recurring_id(db, &last.original_transaction_id)
        .await?
        .ok_or_else(|| {
            Error::NotFound(format!(
                "payment method for original transaction {}",
                last.original_transaction_id
            ))
        })?;

    let plan = db::get_plan_by_apple_product_id(db, &last.product_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("plan for product {}", last.product_id)))?;

    let subscription_id = Action::create(
        db,
        payment_method.user_id,
        payment_method.id,
        &plan,
        SubscriptionProvider::Apple,
        None,
        ChangeReason::AppleInitialBuy,
    )
    .await?;

    db::insert_transaction(
        db,
        payment_method.user_id,
        subscription_id,
        plan.id,
        plan.price,
        &plan.currency,
        TransactionCategory::Initial,
        TransactionStatus::Approved,
        &last.transaction_id,
        Some(receipt.last_expires_date()?),
    )
    .await?;

    info!(subscription_id, transaction_id = %last.transaction_id, "INITIAL_BUY processed");
    Ok(())
}

/// DID_CHANGE_RENEWAL_STATUS: the customer toggled auto-renew
async fn change_renewal_status(db: &SqlitePool, notification: &AppleNotification) -> Result<()> {
    let receipt = Receipt::parse(notification)?;
    let pending = receipt.pending_renewal()?;
    let auto_renew = pending.auto_renew_status.as_deref().ok_or_else(|| {
        Error::MalformedPayload("missing auto_renew_status".into())
    })?;

    let last_payment = db::latest_transaction_by_external_ids(db, &receipt.all_tx_ids())
        .await?
        .ok_or_else(|| Error::NotFound("no known transaction in receipt".into()))?;
    let subscription = db::get_subscription(db, last_payment.subscription_id).await?;

    match auto_renew {
        "0" => {
            // Auto-renew off: access runs out with the last paid period
            let valid_until = last_payment
                .paid_until
                .map(|d| d.date_naive())
                .unwrap_or_else(|| Utc::now().date_naive());

            db::update_subscription_state(
                db,
                subscription.id,
                subscription.status,
                Some(valid_until),
                None,
            )
            .await?;
            db::insert_subscription_change(
                db,
                subscription.id,
                ChangeReason::AppleDidChangeRenewalStatus.as_str(),
            )
            .await?;
            info!(subscription_id = subscription.id, %valid_until, "Auto-renew disabled");
        }
        "1" => {
            let still_paid = last_payment
                .paid_until
                .map(|d| d > Utc::now())
                .unwrap_or(false);

            if still_paid && Rule::can_activate(Some(&subscription)) {
                Action::activate(db, subscription.id, ChangeReason::AppleDidChangeRenewalStatus)
                    .await?;
            } else {
                info!(
                    subscription_id = subscription.id,
                    "Auto-renew re-enabled, nothing to restore"
                );
            }
        }
        other => {
            return Err(Error::MalformedPayload(format!(
                "unexpected auto_renew_status '{}'",
                other
            )))
        }
    }

    Ok(())
}

/// DID_CHANGE_RENEWAL_PREF: plan change taking effect at the next renewal.
/// Recorded for audit; the renewal notification carries the actual change.
async fn change_renewal_pref(db: &SqlitePool, notification: &AppleNotification) -> Result<()> {
    let receipt = Receipt::parse(notification)?;

    let last_payment = db::latest_transaction_by_external_ids(db, &receipt.all_tx_ids())
        .await?
        .ok_or_else(|| Error::NotFound("no known transaction in receipt".into()))?;

    db::insert_subscription_change(
        db,
        last_payment.subscription_id,
        ChangeReason::AppleDidChangeRenewalPref.as_str(),
    )
    .await?;

    info!(
        subscription_id = last_payment.subscription_id,
        "Renewal preference change recorded"
    );
    Ok(())
}
