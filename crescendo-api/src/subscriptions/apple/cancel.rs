//! CANCEL: Apple support refunded the subscription
//!
//! Single-transaction receipts are the simple case; multi-transaction
//! receipts need the actually-cancelled transaction picked out by its
//! cancellation date. A cancellation that is part of an upgrade is left to
//! INTERACTIVE_RENEWAL, which carries the replacement purchase.

use crate::db::subscriptions as db;
use crate::subscriptions::{Action, ChangeReason};
use crate::Result;
use chrono::Utc;
use crescendo_common::db::models::{PaymentTransaction, SubscriptionStatus, TransactionStatus};
use sqlx::SqlitePool;
use tracing::{info, warn};

use super::receipt::{parse_timestamp_ms, AppleNotification, Receipt, ReceiptInfo};

pub async fn handle(db: &SqlitePool, notification: &AppleNotification) -> Result<()> {
    let receipt = Receipt::parse(notification)?;

    let last = receipt.last_transaction();
    let last_is_cancelled = last.cancellation_date_ms.is_some();

    if last_is_cancelled && last.is_upgraded.is_some() {
        info!(
            transaction_id = %last.transaction_id,
            "Cancellation is an upgrade, INTERACTIVE_RENEWAL will handle it"
        );
        return Ok(());
    }

    if receipt.is_simple() {
        return cancel_transaction(db, &receipt, last).await;
    }

    // Complex case: anchor on the original purchase. A receipt whose
    // original transaction we never recorded usually means the INITIAL_BUY
    // webhook failed; acknowledge so Apple stops retrying a lost cause.
    let original = receipt.original_transaction();

    match db::get_transaction_by_external_id(db, &original.transaction_id).await? {
        Some(_) => {
            let Some(cancelled) = receipt.cancelled_txs().into_iter().next() else {
                warn!("CANCEL notification without a cancelled transaction");
                return Ok(());
            };
            cancel_transaction(db, &receipt, cancelled).await
        }
        None => {
            if db::latest_transaction_by_external_ids(db, &receipt.all_tx_ids())
                .await?
                .is_some()
            {
                warn!(
                    original_transaction_id = %original.transaction_id,
                    "CANCEL complex case with partial local history, not implemented"
                );
            } else {
                warn!(
                    original_transaction_id = %original.transaction_id,
                    "Unknown original transaction. Probably INITIAL_BUY failed"
                );
            }
            Ok(())
        }
    }
}

async fn cancel_transaction(
    db: &SqlitePool,
    receipt: &Receipt,
    cancelled: &ReceiptInfo,
) -> Result<()> {
    let Some(payment) =
        find_local_payment(db, receipt, &cancelled.transaction_id).await?
    else {
        warn!(
            transaction_id = %cancelled.transaction_id,
            "Unknown original transaction. Probably INITIAL_BUY failed"
        );
        return Ok(());
    };

    let cancellation_date = match cancelled.cancellation_date_ms.as_deref() {
        Some(ms) => parse_timestamp_ms(ms)?,
        None => Utc::now(),
    };

    db::set_transaction_status(db, payment.id, TransactionStatus::Canceled).await?;
    db::set_transaction_paid_until(db, payment.id, cancellation_date).await?;

    let subscription = db::get_subscription(db, payment.subscription_id).await?;

    if matches!(
        subscription.status,
        SubscriptionStatus::Expired | SubscriptionStatus::Error
    ) {
        info!(
            subscription_id = subscription.id,
            status = ?subscription.status,
            "Subscription already inactive, transaction cancelled only"
        );
        return Ok(());
    }

    Action::expire(
        db,
        subscription.id,
        cancellation_date.date_naive(),
        ChangeReason::AppleCanceled,
    )
    .await?;

    info!(
        subscription_id = subscription.id,
        transaction_id = %cancelled.transaction_id,
        "CANCEL processed"
    );
    Ok(())
}

/// The cancelled transaction id itself, falling back to the receipt's
/// original transaction id (older payments were keyed by it)
async fn find_local_payment(
    db: &SqlitePool,
    receipt: &Receipt,
    transaction_id: &str,
) -> Result<Option<PaymentTransaction>> {
    if let Some(payment) = db::get_transaction_by_external_id(db, transaction_id).await? {
        return Ok(Some(payment));
    }

    let original = receipt.original_transaction();
    db::get_transaction_by_external_id(db, &original.original_transaction_id).await
}
