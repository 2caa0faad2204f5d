//! INTERACTIVE_RENEWAL: the customer renewed from the app or the App Store
//!
//! Two shapes: a plain interactive renewal of the existing subscription,
//! and an upgrade, where the newest receipt transaction is a purchase on a
//! different plan and the next-to-last transaction carries `is_upgraded`.
//! An upgrade creates a fresh subscription and retires the old one.

use super::insert_renewal_transaction;
use crate::db::subscriptions as db;
use crate::subscriptions::{Action, ChangeReason};
use crate::{Error, Result};
use chrono::Utc;
use crescendo_common::db::models::{
    PaymentTransaction, SubscriptionProvider, SubscriptionStatus, TransactionStatus,
};
use sqlx::SqlitePool;
use tracing::{info, warn};

use super::receipt::{AppleNotification, Receipt};

pub async fn handle(db: &SqlitePool, notification: &AppleNotification) -> Result<()> {
    let receipt = Receipt::parse(notification)?;

    let last_payment = db::latest_transaction_by_external_ids(db, &receipt.all_tx_ids())
        .await?
        .ok_or_else(|| {
            Error::MalformedPayload("unable to find any receipt transaction locally".into())
        })?;

    if receipt.is_upgraded() == Some("true") {
        return upgrade(db, &receipt, &last_payment).await;
    }

    let last = receipt.last_transaction();
    let plan = db::get_plan_by_apple_product_id(db, &last.product_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("plan for product {}", last.product_id)))?;

    let subscription = db::get_subscription(db, last_payment.subscription_id).await?;

    if db::get_transaction_by_external_id(db, &last.transaction_id)
        .await?
        .is_none()
    {
        insert_renewal_transaction(
            db,
            subscription.user_id,
            subscription.id,
            &plan,
            &last.transaction_id,
            receipt.last_expires_date()?,
        )
        .await?;
    }

    Action::activate(db, subscription.id, ChangeReason::AppleInteractiveRenewal).await?;
    if subscription.plan_id != plan.id {
        db::update_subscription_plan(db, subscription.id, plan.id).await?;
    }

    info!(
        subscription_id = subscription.id,
        plan = %plan.name,
        "INTERACTIVE_RENEWAL processed"
    );
    Ok(())
}

async fn upgrade(
    db: &SqlitePool,
    receipt: &Receipt,
    last_payment: &PaymentTransaction,
) -> Result<()> {
    let last = receipt.last_transaction();
    let plan = db::get_plan_by_apple_product_id(db, &last.product_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("plan for product {}", last.product_id)))?;

    let current = db::get_subscription(db, last_payment.subscription_id).await?;

    // Double-notification protection: the upgrade already went through
    if current.plan_id == plan.id && current.status == SubscriptionStatus::Active {
        info!(
            subscription_id = current.id,
            "Already upgraded, ignoring replay"
        );
        return Ok(());
    }

    let new_subscription_id = Action::create(
        db,
        current.user_id,
        current.payment_method_id,
        &plan,
        SubscriptionProvider::Apple,
        None,
        ChangeReason::AppleInteractiveRenewal,
    )
    .await?;

    insert_renewal_transaction(
        db,
        current.user_id,
        new_subscription_id,
        &plan,
        &last.transaction_id,
        receipt.last_expires_date()?,
    )
    .await?;

    expire_upgraded(db, receipt).await?;

    info!(
        subscription_id = new_subscription_id,
        plan = %plan.name,
        "Subscription upgraded"
    );
    Ok(())
}

/// Retire the subscription behind the superseded transaction: cancel its
/// payment as of now and expire the subscription as of today
async fn expire_upgraded(db: &SqlitePool, receipt: &Receipt) -> Result<()> {
    let Some(next_to_last) = receipt.next_to_last_transaction() else {
        return Ok(());
    };

    let Some(payment) =
        db::get_transaction_by_external_id(db, &next_to_last.transaction_id).await?
    else {
        warn!(
            transaction_id = %next_to_last.transaction_id,
            "Upgraded transaction not found locally"
        );
        return Ok(());
    };

    let now = Utc::now();
    db::set_transaction_paid_until(db, payment.id, now).await?;
    db::set_transaction_status(db, payment.id, TransactionStatus::Canceled).await?;

    Action::expire(
        db,
        payment.subscription_id,
        now.date_naive(),
        ChangeReason::AppleInteractiveRenewal,
    )
    .await
}
