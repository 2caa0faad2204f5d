//! Notification processor: verify, dispatch, map errors to the Pub/Sub
//! acknowledge contract

use crate::subscriptions::ChangeReason;
use crate::Result;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{info, warn};

use super::handlers::{self, HandlerArgs};
use super::verifier::PurchaseVerifier;
use super::{GoogleNotification, ProcessingResult, SubscriptionNotificationType};

/// Process one notification end to end. Never returns an error: failures
/// become `ProcessingResult::Fail` so the HTTP layer answers 500 and
/// Pub/Sub redelivers.
pub async fn process(
    db: &SqlitePool,
    verifier: &Arc<dyn PurchaseVerifier>,
    event_id: &str,
    notification: &GoogleNotification,
) -> Result<ProcessingResult> {
    let Some(data) = &notification.subscription_notification else {
        // Test notifications and one-time-product events carry no
        // subscriptionNotification; acknowledge them
        info!(event_id, "Not a subscription notification, ignoring");
        return Ok(ProcessingResult::Success);
    };

    let notification_type = SubscriptionNotificationType::from_i64(data.notification_type);

    let purchase = match verifier
        .verify_purchase_token(event_id, &data.subscription_id, &data.purchase_token)
        .await?
    {
        Some(p) => p,
        None => {
            warn!(event_id, "Purchase token verification failed");
            return Ok(ProcessingResult::Fail);
        }
    };

    info!(
        event_id,
        notification_type = ?notification_type,
        order_id = %purchase.order_id,
        country = %purchase.country_code,
        auto_renewing = purchase.auto_renewing,
        "Processing notification"
    );

    let args = HandlerArgs {
        purchase_token: data.purchase_token.clone(),
        google_subscription_id: data.subscription_id.clone(),
        purchase,
    };

    let outcome = dispatch(db, event_id, notification_type, &args).await;

    match outcome {
        Ok(()) => Ok(ProcessingResult::Success),
        Err(e) => {
            warn!(event_id, error = %e, "Notification handling failed");
            Ok(ProcessingResult::Fail)
        }
    }
}

async fn dispatch(
    db: &SqlitePool,
    event_id: &str,
    notification_type: SubscriptionNotificationType,
    args: &HandlerArgs,
) -> Result<()> {
    use SubscriptionNotificationType as T;

    match notification_type {
        T::Recovered => handlers::reactivate(db, event_id, args, ChangeReason::GoogleRecovered).await,
        T::Renewed => handlers::renewed(db, event_id, args).await,
        T::Canceled => handlers::canceled(db, event_id, args).await,
        T::Purchased => handlers::purchased(db, event_id, args).await,
        T::OnHold => handlers::expire(db, event_id, args, ChangeReason::GoogleOnHold).await,
        T::InGracePeriod => handlers::in_grace_period(db, event_id, args).await,
        T::Restarted => handlers::reactivate(db, event_id, args, ChangeReason::GoogleRestarted).await,
        T::Paused => handlers::expire(db, event_id, args, ChangeReason::GooglePaused).await,
        T::Revoked => handlers::expire(db, event_id, args, ChangeReason::GoogleRevoked).await,
        T::Expired => handlers::expire(db, event_id, args, ChangeReason::GoogleExpired).await,
        T::PriceChangeConfirmed | T::Deferred | T::PauseScheduleChanged | T::Unknown => {
            info!(event_id, ?notification_type, "Ignored notification type");
            Ok(())
        }
    }
}
