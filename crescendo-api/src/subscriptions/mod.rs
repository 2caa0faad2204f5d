//! Subscription state shared by the provider reconcilers
//!
//! `Action` mutates a subscription row in a fixed, provider-agnostic way and
//! records why in the `subscription_changes` audit table. `Rule` is the
//! matching set of pure predicates; handlers consult a Rule before firing an
//! Action so provider quirks (duplicate or out-of-order webhooks) cannot
//! push a subscription through an illegal transition.

pub mod apple;
pub mod google;

use crate::db::subscriptions as db;
use crate::Result;
use chrono::{NaiveDate, Utc};
use crescendo_common::db::models::{
    Subscription, SubscriptionPlan, SubscriptionProvider, SubscriptionStatus,
};
use sqlx::SqlitePool;
use tracing::info;

/// Why a subscription row changed. Stored as text in the audit table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeReason {
    GoogleExpired,
    GoogleCanceled,
    GoogleCanceledImmediately,
    GoogleRenew,
    GoogleRenewNew,
    GoogleRestarted,
    GoogleGracePeriod,
    GoogleRecovered,
    GooglePaused,
    GoogleOnHold,
    GoogleRevoked,
    GoogleDowngradeNew,
    GoogleDowngradeExpire,
    RenewInPast,
    AppleInitialBuy,
    AppleRenew,
    AppleFailedToRenew,
    AppleCanceled,
    AppleInteractiveRenewal,
    AppleDidChangeRenewalStatus,
    AppleDidChangeRenewalPref,
}

impl ChangeReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeReason::GoogleExpired => "GOOGLE_EXPIRED",
            ChangeReason::GoogleCanceled => "GOOGLE_CANCELED",
            ChangeReason::GoogleCanceledImmediately => "GOOGLE_CANCELED_IMMEDIATELY",
            ChangeReason::GoogleRenew => "GOOGLE_RENEW",
            ChangeReason::GoogleRenewNew => "GOOGLE_RENEW_NEW",
            ChangeReason::GoogleRestarted => "GOOGLE_RESTARTED",
            ChangeReason::GoogleGracePeriod => "GOOGLE_GRACE_PERIOD",
            ChangeReason::GoogleRecovered => "GOOGLE_RECOVERED",
            ChangeReason::GooglePaused => "GOOGLE_PAUSED",
            ChangeReason::GoogleOnHold => "GOOGLE_ON_HOLD",
            ChangeReason::GoogleRevoked => "GOOGLE_REVOKED",
            ChangeReason::GoogleDowngradeNew => "GOOGLE_DOWNGRADE_NEW",
            ChangeReason::GoogleDowngradeExpire => "GOOGLE_DOWNGRADE_EXPIRE",
            ChangeReason::RenewInPast => "RENEW_IN_PAST",
            ChangeReason::AppleInitialBuy => "APPLE_INITIAL_BUY",
            ChangeReason::AppleRenew => "APPLE_RENEW",
            ChangeReason::AppleFailedToRenew => "APPLE_FAILED_TO_RENEW",
            ChangeReason::AppleCanceled => "APPLE_CANCELED",
            ChangeReason::AppleInteractiveRenewal => "APPLE_INTERACTIVE_RENEWAL",
            ChangeReason::AppleDidChangeRenewalStatus => "APPLE_DID_CHANGE_RENEWAL_STATUS",
            ChangeReason::AppleDidChangeRenewalPref => "APPLE_DID_CHANGE_RENEWAL_PREF",
        }
    }
}

/// Subscription mutations, each audited
pub struct Action;

impl Action {
    /// New ACTIVE subscription starting today
    pub async fn create(
        db: &SqlitePool,
        user_id: i64,
        payment_method_id: i64,
        plan: &SubscriptionPlan,
        provider: SubscriptionProvider,
        valid_until: Option<NaiveDate>,
        reason: ChangeReason,
    ) -> Result<i64> {
        let id = db::insert_subscription(
            db,
            user_id,
            plan.id,
            payment_method_id,
            provider,
            SubscriptionStatus::Active,
            Utc::now().date_naive(),
            valid_until,
        )
        .await?;

        db::insert_subscription_change(db, id, reason.as_str()).await?;
        info!(subscription_id = id, reason = reason.as_str(), "Subscription created");
        Ok(id)
    }

    /// ACTIVE with open-ended validity
    pub async fn activate(db: &SqlitePool, subscription_id: i64, reason: ChangeReason) -> Result<()> {
        db::update_subscription_state(db, subscription_id, SubscriptionStatus::Active, None, None)
            .await?;
        db::insert_subscription_change(db, subscription_id, reason.as_str()).await?;
        info!(subscription_id, reason = reason.as_str(), "Subscription activated");
        Ok(())
    }

    /// Still ACTIVE but access ends at `valid_until` (cancel at period end)
    pub async fn cancel(
        db: &SqlitePool,
        subscription_id: i64,
        valid_until: NaiveDate,
        reason: ChangeReason,
    ) -> Result<()> {
        db::update_subscription_state(
            db,
            subscription_id,
            SubscriptionStatus::Active,
            Some(valid_until),
            None,
        )
        .await?;
        db::insert_subscription_change(db, subscription_id, reason.as_str()).await?;
        info!(subscription_id, reason = reason.as_str(), %valid_until, "Subscription canceled");
        Ok(())
    }

    pub async fn expire(
        db: &SqlitePool,
        subscription_id: i64,
        valid_until: NaiveDate,
        reason: ChangeReason,
    ) -> Result<()> {
        db::update_subscription_state(
            db,
            subscription_id,
            SubscriptionStatus::Expired,
            Some(valid_until),
            None,
        )
        .await?;
        db::insert_subscription_change(db, subscription_id, reason.as_str()).await?;
        info!(subscription_id, reason = reason.as_str(), %valid_until, "Subscription expired");
        Ok(())
    }

    pub async fn enter_grace_period(
        db: &SqlitePool,
        subscription_id: i64,
        grace_period_until: NaiveDate,
        reason: ChangeReason,
    ) -> Result<()> {
        db::update_subscription_state(
            db,
            subscription_id,
            SubscriptionStatus::GracePeriod,
            None,
            Some(grace_period_until),
        )
        .await?;
        db::insert_subscription_change(db, subscription_id, reason.as_str()).await?;
        info!(subscription_id, reason = reason.as_str(), "Subscription entered grace period");
        Ok(())
    }
}

/// Pure transition predicates
pub struct Rule;

impl Rule {
    pub fn can_activate(subscription: Option<&Subscription>) -> bool {
        matches!(
            subscription.map(|s| s.status),
            Some(
                SubscriptionStatus::Created
                    | SubscriptionStatus::Active
                    | SubscriptionStatus::GracePeriod
            )
        )
    }

    /// Cancelable: ACTIVE or in grace, and not already scheduled to end
    pub fn can_cancel(subscription: &Subscription) -> bool {
        matches!(
            subscription.status,
            SubscriptionStatus::Active | SubscriptionStatus::GracePeriod
        ) && subscription.valid_until.is_none()
    }

    pub fn can_expire(subscription: Option<&Subscription>) -> bool {
        matches!(
            subscription.map(|s| s.status),
            Some(SubscriptionStatus::Active | SubscriptionStatus::GracePeriod)
        )
    }
}
