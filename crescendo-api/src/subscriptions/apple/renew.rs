//! DID_RENEW / DID_RECOVER / RENEWAL / DID_FAIL_TO_RENEW
//!
//! The first three all mean a successful auto-renew charge: record the new
//! transaction (once) and make sure the subscription is ACTIVE.
//! DID_FAIL_TO_RENEW means the charge failed; `is_in_billing_retry_period`
//! decides between keeping the subscription alive until the end of the paid
//! period and expiring it outright.

use super::insert_renewal_transaction;
use crate::db::subscriptions as db;
use crate::subscriptions::{Action, ChangeReason};
use crate::{Error, Result};
use crescendo_common::db::models::{PaymentTransaction, Subscription};
use sqlx::SqlitePool;
use tracing::info;

use super::receipt::{AppleNotification, Receipt};

pub async fn handle(db: &SqlitePool, notification: &AppleNotification) -> Result<()> {
    let receipt = Receipt::parse(notification)?;

    let last_payment = db::latest_transaction_by_external_ids(db, &receipt.all_tx_ids())
        .await?
        .ok_or_else(|| Error::NotFound("no known transaction in receipt".into()))?;
    let subscription = db::get_subscription(db, last_payment.subscription_id).await?;

    if notification.notification_type == "DID_FAIL_TO_RENEW" {
        return failed_to_renew(db, &receipt, &last_payment, &subscription).await;
    }

    let last = receipt.last_transaction();
    let plan = db::get_plan_by_apple_product_id(db, &last.product_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("plan for product {}", last.product_id)))?;

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

    // ACTIVE with open validity; a plan change per DID_CHANGE_RENEWAL_PREF
    // materializes here with the first renewal on the new plan
    Action::activate(db, subscription.id, ChangeReason::AppleRenew).await?;
    if subscription.plan_id != plan.id {
        db::update_subscription_plan(db, subscription.id, plan.id).await?;
    }

    info!(
        subscription_id = subscription.id,
        notification_type = %notification.notification_type,
        "Renewal processed"
    );
    Ok(())
}

async fn failed_to_renew(
    db: &SqlitePool,
    receipt: &Receipt,
    last_payment: &PaymentTransaction,
    subscription: &Subscription,
) -> Result<()> {
    let pending = receipt.pending_renewal()?;
    let retrying = pending.is_in_billing_retry_period.as_deref();

    let valid_until = last_payment
        .paid_until
        .map(|d| d.date_naive())
        .ok_or_else(|| Error::InvalidState("last transaction has no paid_until".into()))?;

    match retrying {
        Some("1") => {
            // Apple keeps retrying the charge; access runs until the end of
            // the already-paid period
            db::update_subscription_state(
                db,
                subscription.id,
                subscription.status,
                Some(valid_until),
                subscription.grace_period_until,
            )
            .await?;
            db::insert_subscription_change(
                db,
                subscription.id,
                ChangeReason::AppleFailedToRenew.as_str(),
            )
            .await?;
            info!(
                subscription_id = subscription.id,
                %valid_until,
                "Renewal failed, in billing retry period"
            );
        }
        Some("0") => {
            Action::expire(db, subscription.id, valid_until, ChangeReason::AppleFailedToRenew)
                .await?;
        }
        _ => {
            return Err(Error::MalformedPayload(
                "missing is_in_billing_retry_period".into(),
            ))
        }
    }

    Ok(())
}
