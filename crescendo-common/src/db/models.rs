//! Database models and typed status enums
//!
//! Statuses are stored as small integers. The numeric values are part of the
//! on-disk format and must not be renumbered.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Royalty split lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SplitStatus {
    /// Waiting for the invited holder to confirm
    Pending,
    /// Counts toward the current 1.0 allocation
    Active,
    /// Superseded by a later revision, kept for audit
    Archived,
    /// Holder confirmed, revision not yet activated
    Confirmed,
}

impl SplitStatus {
    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            0 => Some(SplitStatus::Pending),
            1 => Some(SplitStatus::Active),
            3 => Some(SplitStatus::Archived),
            4 => Some(SplitStatus::Confirmed),
            _ => None,
        }
    }

    pub fn as_i64(self) -> i64 {
        match self {
            SplitStatus::Pending => 0,
            SplitStatus::Active => 1,
            SplitStatus::Archived => 3,
            SplitStatus::Confirmed => 4,
        }
    }
}

/// Royalty invitation lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvitationStatus {
    /// Row exists but the invite has not been sent yet
    Created,
    Pending,
    Accepted,
    Declined,
    Expired,
}

impl InvitationStatus {
    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            0 => Some(InvitationStatus::Created),
            1 => Some(InvitationStatus::Pending),
            2 => Some(InvitationStatus::Accepted),
            3 => Some(InvitationStatus::Declined),
            4 => Some(InvitationStatus::Expired),
            _ => None,
        }
    }

    pub fn as_i64(self) -> i64 {
        match self {
            InvitationStatus::Created => 0,
            InvitationStatus::Pending => 1,
            InvitationStatus::Accepted => 2,
            InvitationStatus::Declined => 3,
            InvitationStatus::Expired => 4,
        }
    }
}

/// Release delivery status (only the values the split engine cares about)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReleaseStatus {
    Submitted,
    Delivered,
    Released,
    Takedown,
}

impl ReleaseStatus {
    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            0 => Some(ReleaseStatus::Submitted),
            1 => Some(ReleaseStatus::Delivered),
            2 => Some(ReleaseStatus::Released),
            3 => Some(ReleaseStatus::Takedown),
            _ => None,
        }
    }

    pub fn as_i64(self) -> i64 {
        match self {
            ReleaseStatus::Submitted => 0,
            ReleaseStatus::Delivered => 1,
            ReleaseStatus::Released => 2,
            ReleaseStatus::Takedown => 3,
        }
    }

    /// Statuses for which royalty accounting is live
    pub fn is_released(self) -> bool {
        matches!(
            self,
            ReleaseStatus::Delivered | ReleaseStatus::Released | ReleaseStatus::Takedown
        )
    }
}

/// Subscription status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionStatus {
    /// Created, pending first payment
    Created,
    Active,
    /// Was not renewed or was canceled
    Expired,
    /// First payment failed
    Error,
    /// In expiry grace period due to a failed payment
    GracePeriod,
}

impl SubscriptionStatus {
    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            0 => Some(SubscriptionStatus::Created),
            1 => Some(SubscriptionStatus::Active),
            2 => Some(SubscriptionStatus::Expired),
            4 => Some(SubscriptionStatus::Error),
            6 => Some(SubscriptionStatus::GracePeriod),
            _ => None,
        }
    }

    pub fn as_i64(self) -> i64 {
        match self {
            SubscriptionStatus::Created => 0,
            SubscriptionStatus::Active => 1,
            SubscriptionStatus::Expired => 2,
            SubscriptionStatus::Error => 4,
            SubscriptionStatus::GracePeriod => 6,
        }
    }
}

/// Payment provider behind a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionProvider {
    Adyen,
    Apple,
    Google,
}

impl SubscriptionProvider {
    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            1 => Some(SubscriptionProvider::Adyen),
            2 => Some(SubscriptionProvider::Apple),
            3 => Some(SubscriptionProvider::Google),
            _ => None,
        }
    }

    pub fn as_i64(self) -> i64 {
        match self {
            SubscriptionProvider::Adyen => 1,
            SubscriptionProvider::Apple => 2,
            SubscriptionProvider::Google => 3,
        }
    }
}

/// Payment transaction status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    NotSent,
    Pending,
    Approved,
    Declined,
    Canceled,
    Error,
}

impl TransactionStatus {
    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            0 => Some(TransactionStatus::NotSent),
            1 => Some(TransactionStatus::Pending),
            2 => Some(TransactionStatus::Approved),
            3 => Some(TransactionStatus::Declined),
            4 => Some(TransactionStatus::Canceled),
            5 => Some(TransactionStatus::Error),
            _ => None,
        }
    }

    pub fn as_i64(self) -> i64 {
        match self {
            TransactionStatus::NotSent => 0,
            TransactionStatus::Pending => 1,
            TransactionStatus::Approved => 2,
            TransactionStatus::Declined => 3,
            TransactionStatus::Canceled => 4,
            TransactionStatus::Error => 5,
        }
    }
}

/// Why a payment happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionCategory {
    Unknown,
    Initial,
    Renewal,
    Retry,
}

impl TransactionCategory {
    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            0 => Some(TransactionCategory::Unknown),
            1 => Some(TransactionCategory::Initial),
            2 => Some(TransactionCategory::Renewal),
            3 => Some(TransactionCategory::Retry),
            _ => None,
        }
    }

    pub fn as_i64(self) -> i64 {
        match self {
            TransactionCategory::Unknown => 0,
            TransactionCategory::Initial => 1,
            TransactionCategory::Renewal => 2,
            TransactionCategory::Retry => 3,
        }
    }
}

/// A user that can hold royalty splits and subscriptions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

/// A release groups songs and carries the delivery status that gates
/// royalty accounting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Release {
    pub id: i64,
    pub status: ReleaseStatus,
    pub release_date: Option<NaiveDate>,
    pub owner_user_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Song {
    pub id: i64,
    pub release_id: i64,
    pub name: String,
}

/// A percentage-of-royalties claim by a user on a specific song
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoyaltySplit {
    pub id: i64,
    pub song_id: i64,
    /// None while the holder is an unregistered invitee
    pub user_id: Option<i64>,
    /// 0 < rate <= 1, four decimal places
    pub rate: Decimal,
    pub revision: i64,
    pub status: SplitStatus,
    pub is_owner: bool,
    pub is_locked: bool,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub created: DateTime<Utc>,
}

/// Pending ownership claim for a not-yet-registered (or unconfirmed) holder.
/// `split_id` goes NULL when the split is deleted; the row itself is kept as
/// an audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoyaltyInvitation {
    pub id: i64,
    pub split_id: Option<i64>,
    pub inviter_id: i64,
    pub invitee_id: Option<i64>,
    pub token: Option<String>,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub status: InvitationStatus,
    pub last_sent: Option<DateTime<Utc>>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionPlan {
    pub id: i64,
    pub name: String,
    pub apple_product_id: Option<String>,
    pub google_product_id: Option<String>,
    pub price: Decimal,
    pub currency: String,
}

/// Provider-side recurring payment identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentMethod {
    pub id: i64,
    pub user_id: i64,
    /// Short provider code, e.g. "AAPL" or "GOOG"
    pub method: String,
    /// Apple original_transaction_id / Google purchase token
    pub external_recurring_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: i64,
    pub user_id: i64,
    pub plan_id: i64,
    pub payment_method_id: i64,
    pub provider: SubscriptionProvider,
    pub status: SubscriptionStatus,
    pub valid_from: NaiveDate,
    /// None = renews indefinitely; Some = access ends at this date
    pub valid_until: Option<NaiveDate>,
    pub grace_period_until: Option<NaiveDate>,
}

/// One row per provider-reported payment event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentTransaction {
    pub id: i64,
    pub user_id: i64,
    pub subscription_id: i64,
    pub plan_id: i64,
    pub amount: Decimal,
    pub currency: String,
    pub category: TransactionCategory,
    pub status: TransactionStatus,
    /// Provider-assigned id, the webhook dedup key
    pub external_transaction_id: String,
    pub paid_until: Option<DateTime<Utc>>,
    pub created: DateTime<Utc>,
}
