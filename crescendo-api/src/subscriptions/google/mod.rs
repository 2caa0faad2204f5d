//! Google Play real-time developer notification handling
//!
//! Notifications arrive through a Pub/Sub push subscription. Each one names
//! a purchase token; the current purchase state is fetched from the Play
//! Developer API (behind the `PurchaseVerifier` trait) before any handler
//! runs, so handlers always act on Google's view, not the payload's.

pub mod handlers;
pub mod processor;
pub mod verifier;

use serde::{Deserialize, Serialize};

/// `notificationType` for subscription notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionNotificationType {
    Recovered,
    Renewed,
    Canceled,
    Purchased,
    OnHold,
    InGracePeriod,
    Restarted,
    PriceChangeConfirmed,
    Deferred,
    Paused,
    PauseScheduleChanged,
    Revoked,
    Expired,
    Unknown,
}

impl SubscriptionNotificationType {
    pub fn from_i64(v: i64) -> Self {
        match v {
            1 => Self::Recovered,
            2 => Self::Renewed,
            3 => Self::Canceled,
            4 => Self::Purchased,
            5 => Self::OnHold,
            6 => Self::InGracePeriod,
            7 => Self::Restarted,
            8 => Self::PriceChangeConfirmed,
            9 => Self::Deferred,
            10 => Self::Paused,
            11 => Self::PauseScheduleChanged,
            12 => Self::Revoked,
            13 => Self::Expired,
            _ => Self::Unknown,
        }
    }
}

/// Outcome reported back through the HTTP status: SUCCESS acknowledges the
/// Pub/Sub message, FAIL makes it redeliver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingResult {
    Fail,
    Success,
}

/// The notification body (after Pub/Sub envelope unwrapping)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GoogleNotification {
    #[serde(rename = "subscriptionNotification")]
    pub subscription_notification: Option<SubscriptionNotification>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SubscriptionNotification {
    #[serde(rename = "notificationType")]
    pub notification_type: i64,
    #[serde(rename = "purchaseToken")]
    pub purchase_token: String,
    #[serde(rename = "subscriptionId")]
    pub subscription_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notification_type_mapping() {
        assert_eq!(
            SubscriptionNotificationType::from_i64(2),
            SubscriptionNotificationType::Renewed
        );
        assert_eq!(
            SubscriptionNotificationType::from_i64(13),
            SubscriptionNotificationType::Expired
        );
        assert_eq!(
            SubscriptionNotificationType::from_i64(0),
            SubscriptionNotificationType::Unknown
        );
        assert_eq!(
            SubscriptionNotificationType::from_i64(99),
            SubscriptionNotificationType::Unknown
        );
    }

    #[test]
    fn notification_deserializes_from_camel_case() {
        let body = r#"{
            "version": "1.0",
            "packageName": "io.crescendo.android",
            "subscriptionNotification": {
                "notificationType": 2,
                "purchaseToken": "token-1",
                "subscriptionId": "pro_monthly"
            }
        }"#;

        let n: GoogleNotification = serde_json::from_str(body).unwrap();
        let sub = n.subscription_notification.unwrap();
        assert_eq!(sub.notification_type, 2);
        assert_eq!(sub.purchase_token, "token-1");
    }
}
