//! Apple server-to-server notification payloads
//!
//! The unified receipt carries the full transaction history of the
//! subscription group, newest purchase first after sorting. Apple sends
//! numbers as strings throughout; fields stay `String` here and are parsed
//! at the point of use.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppleNotification {
    pub notification_type: String,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub unified_receipt: Option<UnifiedReceipt>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UnifiedReceipt {
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub latest_receipt: Option<String>,
    #[serde(default)]
    pub latest_receipt_info: Option<Vec<ReceiptInfo>>,
    #[serde(default)]
    pub pending_renewal_info: Option<Vec<PendingRenewalInfo>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReceiptInfo {
    pub transaction_id: String,
    pub original_transaction_id: String,
    pub product_id: String,
    pub purchase_date_ms: String,
    #[serde(default)]
    pub expires_date_ms: Option<String>,
    #[serde(default)]
    pub cancellation_date_ms: Option<String>,
    /// "true" when this transaction was superseded by an upgrade
    #[serde(default)]
    pub is_upgraded: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PendingRenewalInfo {
    #[serde(default)]
    pub original_transaction_id: Option<String>,
    #[serde(default)]
    pub product_id: Option<String>,
    #[serde(default)]
    pub auto_renew_status: Option<String>,
    #[serde(default)]
    pub auto_renew_product_id: Option<String>,
    /// "1" while Apple keeps retrying the charge, "0" once it gave up
    #[serde(default)]
    pub is_in_billing_retry_period: Option<String>,
}

/// Millisecond epoch string -> UTC timestamp
pub fn parse_timestamp_ms(timestamp_ms: &str) -> Result<DateTime<Utc>> {
    let ms: i64 = timestamp_ms
        .parse()
        .map_err(|_| Error::MalformedPayload(format!("bad timestamp '{}'", timestamp_ms)))?;

    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| Error::MalformedPayload(format!("timestamp out of range '{}'", timestamp_ms)))
}

fn purchase_date_ms(info: &ReceiptInfo) -> i64 {
    info.purchase_date_ms.parse().unwrap_or(0)
}

/// Receipt transactions sorted newest purchase first
pub struct Receipt {
    pub txs: Vec<ReceiptInfo>,
    pub pending_renewals: Vec<PendingRenewalInfo>,
    pub latest_receipt: Option<String>,
}

impl Receipt {
    pub fn parse(notification: &AppleNotification) -> Result<Self> {
        let unified = notification
            .unified_receipt
            .as_ref()
            .ok_or_else(|| Error::MalformedPayload("missing unified_receipt".into()))?;

        let mut txs = unified
            .latest_receipt_info
            .clone()
            .ok_or_else(|| Error::MalformedPayload("missing latest_receipt_info".into()))?;

        if txs.is_empty() {
            return Err(Error::MalformedPayload("empty latest_receipt_info".into()));
        }

        txs.sort_by_key(|t| std::cmp::Reverse(purchase_date_ms(t)));

        Ok(Receipt {
            txs,
            pending_renewals: unified.pending_renewal_info.clone().unwrap_or_default(),
            latest_receipt: unified.latest_receipt.clone(),
        })
    }

    /// Newest transaction
    pub fn last_transaction(&self) -> &ReceiptInfo {
        &self.txs[0]
    }

    /// Oldest transaction (the original purchase)
    pub fn original_transaction(&self) -> &ReceiptInfo {
        &self.txs[self.txs.len() - 1]
    }

    pub fn next_to_last_transaction(&self) -> Option<&ReceiptInfo> {
        self.txs.get(1)
    }

    /// `is_upgraded` of the next-to-last transaction; set when the newest
    /// transaction is the replacement purchase of an upgrade
    pub fn is_upgraded(&self) -> Option<&str> {
        self.next_to_last_transaction()
            .and_then(|t| t.is_upgraded.as_deref())
    }

    pub fn all_tx_ids(&self) -> Vec<String> {
        self.txs.iter().map(|t| t.transaction_id.clone()).collect()
    }

    pub fn last_expires_date(&self) -> Result<DateTime<Utc>> {
        let ms = self
            .last_transaction()
            .expires_date_ms
            .as_deref()
            .ok_or_else(|| Error::MalformedPayload("missing expires_date_ms".into()))?;
        parse_timestamp_ms(ms)
    }

    pub fn pending_renewal(&self) -> Result<&PendingRenewalInfo> {
        self.pending_renewals
            .first()
            .ok_or_else(|| Error::MalformedPayload("missing pending_renewal_info".into()))
    }

    /// Transactions carrying a cancellation date
    pub fn cancelled_txs(&self) -> Vec<&ReceiptInfo> {
        self.txs
            .iter()
            .filter(|t| t.cancellation_date_ms.is_some())
            .collect()
    }

    /// Single-transaction receipt: the whole subscription is one purchase
    pub fn is_simple(&self) -> bool {
        self.txs.len() == 1
    }
}

/// The unified receipt must exist and carry at least one transaction
pub fn is_payload_valid(notification: &AppleNotification) -> bool {
    notification
        .unified_receipt
        .as_ref()
        .and_then(|u| u.latest_receipt_info.as_ref())
        .map(|info| !info.is_empty())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(id: &str, purchase_ms: i64) -> ReceiptInfo {
        ReceiptInfo {
            transaction_id: id.into(),
            original_transaction_id: "orig".into(),
            product_id: "pro_monthly".into(),
            purchase_date_ms: purchase_ms.to_string(),
            expires_date_ms: Some((purchase_ms + 2_592_000_000).to_string()),
            cancellation_date_ms: None,
            is_upgraded: None,
        }
    }

    fn notification(txs: Vec<ReceiptInfo>) -> AppleNotification {
        AppleNotification {
            notification_type: "DID_RENEW".into(),
            environment: Some("PROD".into()),
            unified_receipt: Some(UnifiedReceipt {
                environment: Some("Production".into()),
                latest_receipt: Some("receipt-blob".into()),
                latest_receipt_info: Some(txs),
                pending_renewal_info: Some(vec![]),
            }),
        }
    }

    #[test]
    fn transactions_sort_newest_first() {
        let receipt = Receipt::parse(&notification(vec![
            tx("old", 1_000),
            tx("new", 3_000),
            tx("mid", 2_000),
        ]))
        .unwrap();

        assert_eq!(receipt.last_transaction().transaction_id, "new");
        assert_eq!(receipt.original_transaction().transaction_id, "old");
        assert_eq!(
            receipt.next_to_last_transaction().unwrap().transaction_id,
            "mid"
        );
        assert_eq!(receipt.all_tx_ids(), vec!["new", "mid", "old"]);
    }

    #[test]
    fn empty_receipt_info_is_invalid() {
        let n = notification(vec![]);
        assert!(!is_payload_valid(&n));
        assert!(Receipt::parse(&n).is_err());
    }

    #[test]
    fn missing_unified_receipt_is_invalid() {
        let n = AppleNotification {
            notification_type: "CANCEL".into(),
            environment: None,
            unified_receipt: None,
        };
        assert!(!is_payload_valid(&n));
    }

    #[test]
    fn timestamp_parsing() {
        let ts = parse_timestamp_ms("1613675131000").unwrap();
        assert_eq!(ts.timestamp(), 1_613_675_131);
        assert!(parse_timestamp_ms("not-a-number").is_err());
    }
}
