//! Per-notification-type handlers
//!
//! Each handler receives the verified purchase state and may assume it is
//! current. Handlers are idempotent: Pub/Sub redelivers on FAIL and can
//! duplicate on SUCCESS, so every mutation checks the local state first.

use crate::db::subscriptions as db;
use crate::subscriptions::{Action, ChangeReason, Rule};
use crate::{Error, Result};
use chrono::Utc;
use crescendo_common::db::models::{
    Subscription, SubscriptionProvider, SubscriptionStatus, TransactionCategory,
    TransactionStatus,
};
use sqlx::SqlitePool;
use tracing::info;

use super::verifier::PurchaseSubscription;

/// Everything a handler needs about one notification
pub struct HandlerArgs {
    pub purchase_token: String,
    pub google_subscription_id: String,
    pub purchase: PurchaseSubscription,
}

fn payment_status(purchase: &PurchaseSubscription) -> TransactionStatus {
    match purchase.payment_state {
        Some(0) | Some(3) => TransactionStatus::Pending,
        _ => TransactionStatus::Approved,
    }
}

/// Record the purchase's order as a RENEWAL transaction. Unacknowledged
/// purchases are priced at zero until the acknowledge flow completes.
async fn new_transaction(
    db: &SqlitePool,
    subscription: &Subscription,
    args: &HandlerArgs,
) -> Result<i64> {
    let plan = get_plan(db, args).await?;
    let price = if args.purchase.acknowledged {
        args.purchase.price_amount
    } else {
        rust_decimal::Decimal::ZERO
    };

    let id = db::insert_transaction(
        db,
        subscription.user_id,
        subscription.id,
        plan.id,
        price,
        &args.purchase.price_currency_code,
        TransactionCategory::Renewal,
        payment_status(&args.purchase),
        &args.purchase.order_id,
        Some(args.purchase.expiry_date),
    )
    .await?;

    info!(transaction_id = id, order_id = %args.purchase.order_id, "Transaction created");
    Ok(id)
}

async fn get_plan(
    db: &SqlitePool,
    args: &HandlerArgs,
) -> Result<crescendo_common::db::models::SubscriptionPlan> {
    db::get_plan_by_google_product_id(db, &args.google_subscription_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("plan for product {}", args.google_subscription_id)))
}

async fn get_handleable_subscription(db: &SqlitePool, args: &HandlerArgs) -> Result<Subscription> {
    db::handleable_subscription_by_recurring_id(db, &args.purchase_token)
        .await?
        .ok_or_else(|| {
            Error::NotFound(format!("subscription for token {}", args.purchase_token))
        })
}

/// RENEWED: renew the active subscription, recreate it if it expired while
/// Google had it PAUSED/ON_HOLD, or expire it when the reported expiry is
/// already past. The first RENEWED after a Play-side downgrade arrives on a
/// brand new purchase token and is routed to the downgrade flow instead.
pub async fn renewed(db: &SqlitePool, event_id: &str, args: &HandlerArgs) -> Result<()> {
    if is_downgrade_flow(db, args).await? {
        return downgrade(db, event_id, args).await;
    }

    let active = db::active_subscription_by_recurring_id(db, &args.purchase_token).await?;

    let Some(subscription) = active else {
        return renewed_new_subscription(db, event_id, args).await;
    };

    if args.purchase.expiry_date < Utc::now() {
        Action::expire(
            db,
            subscription.id,
            args.purchase.expiry_date.date_naive(),
            ChangeReason::RenewInPast,
        )
        .await?;
        info!(event_id, subscription_id = subscription.id, "RENEWED for past expiry, expired");
        return Ok(());
    }

    Action::activate(db, subscription.id, ChangeReason::GoogleRenew).await?;

    // Google occasionally redelivers RENEWED with the same order id;
    // update the existing row instead of duplicating it
    match db::get_transaction_by_external_id(db, &args.purchase.order_id).await? {
        Some(payment) => {
            db::set_transaction_paid_until(db, payment.id, args.purchase.expiry_date).await?;
        }
        None => {
            new_transaction(db, &subscription, args).await?;
        }
    }

    info!(event_id, subscription_id = subscription.id, "Subscription renewed");
    Ok(())
}

/// No active local subscription: it expired during a Google-side hold or
/// pause. The renewal charge starts a fresh one.
async fn renewed_new_subscription(db: &SqlitePool, event_id: &str, args: &HandlerArgs) -> Result<()> {
    if db::get_transaction_by_external_id(db, &args.purchase.order_id)
        .await?
        .is_some()
    {
        return Err(Error::InvalidState(format!(
            "transaction {} already exists without an active subscription",
            args.purchase.order_id
        )));
    }

    let payment_method = db::get_payment_method_by_recurring_id(db, &args.purchase_token)
        .await?
        .ok_or_else(|| {
            Error::NotFound(format!("payment method for token {}", args.purchase_token))
        })?;
    let plan = get_plan(db, args).await?;

    let subscription_id = Action::create(
        db,
        payment_method.user_id,
        payment_method.id,
        &plan,
        SubscriptionProvider::Google,
        None,
        ChangeReason::GoogleRenewNew,
    )
    .await?;

    let subscription = db::get_subscription(db, subscription_id).await?;
    new_transaction(db, &subscription, args).await?;

    info!(event_id, subscription_id, "Subscription recreated after hold/pause");
    Ok(())
}

/// Downgrades keep the subscription but issue a fresh purchase token that
/// links back to the replaced one. The token only shows up here, so a
/// linked token with no local payment method for the new one is the
/// downgrade's first renewal.
async fn is_downgrade_flow(db: &SqlitePool, args: &HandlerArgs) -> Result<bool> {
    if args.purchase.linked_purchase_token.is_none() {
        return Ok(false);
    }

    Ok(db::get_payment_method_by_recurring_id(db, &args.purchase_token)
        .await?
        .is_none())
}

/// Expire whatever still runs on the replaced token, register the new token
/// as a payment method and start a fresh subscription on the new plan.
async fn downgrade(db: &SqlitePool, event_id: &str, args: &HandlerArgs) -> Result<()> {
    let linked = args
        .purchase
        .linked_purchase_token
        .as_deref()
        .ok_or_else(|| Error::InvalidState("downgrade without a linked token".into()))?;

    // There should be exactly one; expire the full list regardless
    let today = Utc::now().date_naive();
    for subscription in db::active_subscriptions_by_recurring_id(db, linked).await? {
        Action::expire(db, subscription.id, today, ChangeReason::GoogleDowngradeExpire).await?;
        info!(event_id, subscription_id = subscription.id, "Expired by downgrade");
    }

    if db::get_transaction_by_external_id(db, &args.purchase.order_id)
        .await?
        .is_some()
    {
        return Err(Error::InvalidState(format!(
            "transaction {} already exists for a downgrade",
            args.purchase.order_id
        )));
    }

    let previous_method = db::get_payment_method_by_recurring_id(db, linked)
        .await?
        .ok_or_else(|| Error::NotFound(format!("payment method for token {}", linked)))?;

    let payment_method_id = db::insert_payment_method(
        db,
        previous_method.user_id,
        &previous_method.method,
        &args.purchase_token,
    )
    .await?;

    let plan = get_plan(db, args).await?;
    let subscription_id = Action::create(
        db,
        previous_method.user_id,
        payment_method_id,
        &plan,
        SubscriptionProvider::Google,
        None,
        ChangeReason::GoogleDowngradeNew,
    )
    .await?;

    let subscription = db::get_subscription(db, subscription_id).await?;
    new_transaction(db, &subscription, args).await?;

    info!(event_id, subscription_id, plan = %plan.name, "Subscription downgraded");
    Ok(())
}

/// CANCELED: auto-renew turned off. Access is kept until the expiry Google
/// reports; an expiry already in the past loses entitlement immediately.
pub async fn canceled(db: &SqlitePool, event_id: &str, args: &HandlerArgs) -> Result<()> {
    let payment = db::get_transaction_by_external_id(db, &args.purchase.order_id)
        .await?
        .ok_or_else(|| {
            Error::NotFound(format!("transaction {}", args.purchase.order_id))
        })?;
    let subscription = db::get_subscription(db, payment.subscription_id).await?;

    let expiry = args.purchase.expiry_date;
    let expiry_in_past = expiry < Utc::now();

    if subscription.status == SubscriptionStatus::Expired && expiry_in_past {
        // Google PAUSED maps to a local EXPIRED sub; a later cancel of the
        // paused subscription has nothing left to do
        info!(event_id, subscription_id = subscription.id, "Already expired, nothing to cancel");
        return Ok(());
    }

    if !Rule::can_cancel(&subscription) {
        return Err(Error::InvalidState(format!(
            "subscription {} cannot cancel from {:?}",
            subscription.id, subscription.status
        )));
    }

    db::set_transaction_paid_until(db, payment.id, expiry).await?;

    if expiry_in_past {
        Action::expire(
            db,
            subscription.id,
            expiry.date_naive(),
            ChangeReason::GoogleCanceledImmediately,
        )
        .await?;
        info!(event_id, subscription_id = subscription.id, "Canceled immediately");
    } else {
        Action::cancel(
            db,
            subscription.id,
            expiry.date_naive(),
            ChangeReason::GoogleCanceled,
        )
        .await?;
        info!(event_id, subscription_id = subscription.id, "Canceled at period end");
    }

    Ok(())
}

/// PURCHASED: the user-facing purchase endpoint creates the subscription;
/// the webhook only confirms it landed. A missing transaction means that
/// endpoint has not run yet, so FAIL and let Pub/Sub retry.
pub async fn purchased(db: &SqlitePool, event_id: &str, args: &HandlerArgs) -> Result<()> {
    match db::get_transaction_by_external_id(db, &args.purchase.order_id).await? {
        Some(_) => {
            info!(event_id, order_id = %args.purchase.order_id, "Purchase already recorded");
            Ok(())
        }
        None => Err(Error::NotFound(format!(
            "purchase {} not recorded yet",
            args.purchase.order_id
        ))),
    }
}

/// IN_GRACE_PERIOD: payment failed, Google grants extra days
pub async fn in_grace_period(db: &SqlitePool, event_id: &str, args: &HandlerArgs) -> Result<()> {
    let subscription = get_handleable_subscription(db, args).await?;

    if subscription.status == SubscriptionStatus::GracePeriod {
        info!(event_id, subscription_id = subscription.id, "Already in grace period");
        return Ok(());
    }

    Action::enter_grace_period(
        db,
        subscription.id,
        args.purchase.expiry_date.date_naive(),
        ChangeReason::GoogleGracePeriod,
    )
    .await?;

    info!(event_id, subscription_id = subscription.id, "Entered grace period");
    Ok(())
}

/// ON_HOLD / PAUSED / REVOKED / EXPIRED all end local entitlement
pub async fn expire(
    db: &SqlitePool,
    event_id: &str,
    args: &HandlerArgs,
    reason: ChangeReason,
) -> Result<()> {
    let subscription = get_handleable_subscription(db, args).await?;

    if !Rule::can_expire(Some(&subscription)) {
        info!(event_id, subscription_id = subscription.id, "Already inactive");
        return Ok(());
    }

    let today = Utc::now().date_naive();
    let reported = args.purchase.expiry_date.date_naive();
    let valid_until = reported.min(today);

    Action::expire(db, subscription.id, valid_until, reason).await?;
    info!(event_id, subscription_id = subscription.id, reason = reason.as_str(), "Expired");
    Ok(())
}

/// RECOVERED / RESTARTED: back from hold or voluntary resubscribe
pub async fn reactivate(
    db: &SqlitePool,
    event_id: &str,
    args: &HandlerArgs,
    reason: ChangeReason,
) -> Result<()> {
    let subscription = get_handleable_subscription(db, args).await?;

    if !Rule::can_activate(Some(&subscription)) {
        // Expired locally while Google held it; the renewal charge path
        // recreates the subscription
        return renewed(db, event_id, args).await;
    }

    Action::activate(db, subscription.id, reason).await?;

    if db::get_transaction_by_external_id(db, &args.purchase.order_id)
        .await?
        .is_none()
    {
        new_transaction(db, &subscription, args).await?;
    }

    info!(event_id, subscription_id = subscription.id, reason = reason.as_str(), "Reactivated");
    Ok(())
}
