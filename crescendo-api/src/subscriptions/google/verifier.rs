//! Purchase token verification against the Play Developer API
//!
//! Behind a trait so the notification processor can be tested without
//! Google credentials. Verification failure returns None; the processor
//! maps that to FAIL and Pub/Sub redelivers later.

use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::warn;

/// Subscription purchase state as reported by Google
#[derive(Debug, Clone)]
pub struct PurchaseSubscription {
    pub order_id: String,
    pub expiry_date: DateTime<Utc>,
    /// 0 pending, 1 received, 2 free trial, 3 deferred; absent once the
    /// purchase is canceled or expired
    pub payment_state: Option<i64>,
    pub price_amount: Decimal,
    pub price_currency_code: String,
    pub country_code: String,
    pub auto_renewing: bool,
    /// Token of the purchase this one replaced; set on upgrade/downgrade
    pub linked_purchase_token: Option<String>,
    pub acknowledged: bool,
}

#[async_trait]
pub trait PurchaseVerifier: Send + Sync + 'static {
    /// Resolve a purchase token to its current state; None when Google
    /// rejects the token or the lookup fails
    async fn verify_purchase_token(
        &self,
        event_id: &str,
        google_subscription_id: &str,
        purchase_token: &str,
    ) -> Result<Option<PurchaseSubscription>>;
}

/// Raw wire shape: Google sends 64-bit values as strings
#[derive(Debug, Deserialize)]
struct PurchaseResponse {
    #[serde(rename = "orderId")]
    order_id: String,
    #[serde(rename = "expiryTimeMillis")]
    expiry_time_millis: String,
    #[serde(rename = "paymentState", default)]
    payment_state: Option<i64>,
    #[serde(rename = "priceAmountMicros", default)]
    price_amount_micros: Option<String>,
    #[serde(rename = "priceCurrencyCode", default)]
    price_currency_code: Option<String>,
    #[serde(rename = "countryCode", default)]
    country_code: Option<String>,
    #[serde(rename = "autoRenewing", default)]
    auto_renewing: bool,
    #[serde(rename = "linkedPurchaseToken", default)]
    linked_purchase_token: Option<String>,
    #[serde(rename = "acknowledgementState", default)]
    acknowledgement_state: i64,
}

fn parse_millis(ms: &str) -> Result<DateTime<Utc>> {
    let ms: i64 = ms
        .parse()
        .map_err(|_| Error::MalformedPayload(format!("bad millis '{}'", ms)))?;
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| Error::MalformedPayload(format!("millis out of range '{}'", ms)))
}

impl PurchaseResponse {
    fn into_purchase(self) -> Result<PurchaseSubscription> {
        let micros: i64 = self
            .price_amount_micros
            .as_deref()
            .unwrap_or("0")
            .parse()
            .unwrap_or(0);

        Ok(PurchaseSubscription {
            order_id: self.order_id,
            expiry_date: parse_millis(&self.expiry_time_millis)?,
            payment_state: self.payment_state,
            price_amount: Decimal::new(micros, 6),
            price_currency_code: self.price_currency_code.unwrap_or_default(),
            country_code: self.country_code.unwrap_or_default(),
            auto_renewing: self.auto_renewing,
            linked_purchase_token: self.linked_purchase_token,
            acknowledged: self.acknowledgement_state == 1,
        })
    }
}

/// HTTP verifier against the androidpublisher v3 endpoint
pub struct GooglePlayVerifier {
    http: reqwest::Client,
    base_url: String,
    package_name: String,
}

impl GooglePlayVerifier {
    pub fn new(http: reqwest::Client, base_url: String, package_name: String) -> Self {
        Self {
            http,
            base_url,
            package_name,
        }
    }
}

#[async_trait]
impl PurchaseVerifier for GooglePlayVerifier {
    async fn verify_purchase_token(
        &self,
        event_id: &str,
        google_subscription_id: &str,
        purchase_token: &str,
    ) -> Result<Option<PurchaseSubscription>> {
        let url = format!(
            "{}/applications/{}/purchases/subscriptions/{}/tokens/{}",
            self.base_url, self.package_name, google_subscription_id, purchase_token
        );

        let response = match self.http.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(event_id, error = %e, "Purchase verification request failed");
                return Ok(None);
            }
        };

        if !response.status().is_success() {
            warn!(
                event_id,
                status = %response.status(),
                "Purchase verification rejected"
            );
            return Ok(None);
        }

        let raw: PurchaseResponse = response
            .json()
            .await
            .map_err(|e| Error::Upstream(format!("bad verification response: {}", e)))?;

        Ok(Some(raw.into_purchase()?))
    }
}
