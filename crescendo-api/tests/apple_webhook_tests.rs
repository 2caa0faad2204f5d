//! Integration tests for Apple server-to-server notification handling

use chrono::{DateTime, Duration, Utc};
use crescendo_api::db::subscriptions as subs_db;
use crescendo_api::subscriptions::apple::{self, receipt::AppleNotification};
use crescendo_api::Error;
use crescendo_common::config::Config;
use crescendo_common::db::init_database;
use crescendo_common::db::models::{SubscriptionStatus, TransactionCategory, TransactionStatus};
use sqlx::SqlitePool;
use tempfile::TempDir;

async fn test_db() -> (TempDir, SqlitePool) {
    let dir = tempfile::tempdir().unwrap();
    let pool = init_database(&dir.path().join("test.db")).await.unwrap();
    (dir, pool)
}

/// User + plan + payment method keyed by the Apple original transaction id
async fn seed_apple_customer(pool: &SqlitePool, original_tx_id: &str) {
    sqlx::query("INSERT INTO users (name, email) VALUES ('Listener', 'listener@example.com')")
        .execute(pool)
        .await
        .unwrap();
    sqlx::query(
        "INSERT INTO subscription_plans (name, apple_product_id, price, currency)
         VALUES ('Pro Monthly', 'pro_monthly', '9.99', 'USD')",
    )
    .execute(pool)
    .await
    .unwrap();
    sqlx::query(
        "INSERT INTO payment_methods (user_id, method, external_recurring_id)
         VALUES (1, 'AAPL', ?)",
    )
    .bind(original_tx_id)
    .execute(pool)
    .await
    .unwrap();
}

fn ms(dt: DateTime<Utc>) -> String {
    dt.timestamp_millis().to_string()
}

fn tx(
    id: &str,
    original: &str,
    purchased: DateTime<Utc>,
    expires: DateTime<Utc>,
) -> serde_json::Value {
    serde_json::json!({
        "transaction_id": id,
        "original_transaction_id": original,
        "product_id": "pro_monthly",
        "purchase_date_ms": ms(purchased),
        "expires_date_ms": ms(expires),
    })
}

fn notification(notification_type: &str, txs: Vec<serde_json::Value>) -> AppleNotification {
    serde_json::from_value(serde_json::json!({
        "notification_type": notification_type,
        "environment": "PROD",
        "unified_receipt": {
            "environment": "Production",
            "latest_receipt": "b64receipt",
            "latest_receipt_info": txs,
        }
    }))
    .unwrap()
}

async fn process(pool: &SqlitePool, notification: &AppleNotification) -> crescendo_api::Result<()> {
    let config = Config::default();
    let http = reqwest::Client::new();
    apple::process_notification(pool, &config, &http, notification).await
}

async fn count(pool: &SqlitePool, sql: &str) -> i64 {
    sqlx::query_scalar(sql).fetch_one(pool).await.unwrap()
}

#[tokio::test]
async fn initial_buy_creates_subscription_and_transaction() {
    let (_dir, pool) = test_db().await;
    seed_apple_customer(&pool, "orig-100").await;

    let now = Utc::now();
    let expires = now + Duration::days(30);
    let n = notification("INITIAL_BUY", vec![tx("tx-1", "orig-100", now, expires)]);

    process(&pool, &n).await.unwrap();

    let payment = subs_db::get_transaction_by_external_id(&pool, "tx-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payment.status, TransactionStatus::Approved);
    assert_eq!(payment.category, TransactionCategory::Initial);
    assert_eq!(
        payment.paid_until.map(|d| d.timestamp()),
        Some(expires.timestamp())
    );

    let subscription = subs_db::get_subscription(&pool, payment.subscription_id)
        .await
        .unwrap();
    assert_eq!(subscription.status, SubscriptionStatus::Active);
    assert_eq!(subscription.valid_until, None);

    let audits = count(
        &pool,
        "SELECT COUNT(*) FROM subscription_changes WHERE reason = 'APPLE_INITIAL_BUY'",
    )
    .await;
    assert_eq!(audits, 1);
}

#[tokio::test]
async fn initial_buy_replay_is_a_no_op() {
    let (_dir, pool) = test_db().await;
    seed_apple_customer(&pool, "orig-100").await;

    let now = Utc::now();
    let n = notification(
        "INITIAL_BUY",
        vec![tx("tx-1", "orig-100", now, now + Duration::days(30))],
    );

    process(&pool, &n).await.unwrap();
    process(&pool, &n).await.unwrap();

    assert_eq!(count(&pool, "SELECT COUNT(*) FROM payment_transactions").await, 1);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM subscriptions").await, 1);
}

#[tokio::test]
async fn initial_buy_before_payment_method_registration_is_retryable() {
    let (_dir, pool) = test_db().await;
    // No payment method seeded: the in-app purchase endpoint has not run yet

    let now = Utc::now();
    let n = notification(
        "INITIAL_BUY",
        vec![tx("tx-1", "orig-100", now, now + Duration::days(30))],
    );

    let result = process(&pool, &n).await;
    assert!(matches!(result, Err(Error::NotFound(_))));
}

#[tokio::test]
async fn unknown_notification_type_is_acknowledged() {
    let (_dir, pool) = test_db().await;
    seed_apple_customer(&pool, "orig-100").await;

    let now = Utc::now();
    let n = notification(
        "CONSUMPTION_REQUEST",
        vec![tx("tx-1", "orig-100", now, now + Duration::days(30))],
    );

    process(&pool, &n).await.unwrap();
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM subscriptions").await, 0);
}

#[tokio::test]
async fn empty_receipt_is_rejected() {
    let (_dir, pool) = test_db().await;

    let n: AppleNotification = serde_json::from_value(serde_json::json!({
        "notification_type": "DID_RENEW",
        "unified_receipt": { "latest_receipt_info": [] }
    }))
    .unwrap();

    let result = process(&pool, &n).await;
    assert!(matches!(result, Err(Error::MalformedPayload(_))));
}

#[tokio::test]
async fn sandbox_payload_on_production_is_acknowledged_without_processing() {
    let (_dir, pool) = test_db().await;
    seed_apple_customer(&pool, "orig-100").await;

    let now = Utc::now();
    let mut n = notification(
        "INITIAL_BUY",
        vec![tx("tx-1", "orig-100", now, now + Duration::days(30))],
    );
    n.environment = Some("Sandbox".to_string());

    process(&pool, &n).await.unwrap();
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM subscriptions").await, 0);
}

#[tokio::test]
async fn renewal_records_the_new_transaction_once() {
    let (_dir, pool) = test_db().await;
    seed_apple_customer(&pool, "orig-100").await;

    let first_purchase = Utc::now() - Duration::days(30);
    let renewal_purchase = Utc::now();
    let renewal_expires = Utc::now() + Duration::days(30);

    let initial = notification(
        "INITIAL_BUY",
        vec![tx("tx-1", "orig-100", first_purchase, renewal_purchase)],
    );
    process(&pool, &initial).await.unwrap();

    let renew = notification(
        "DID_RENEW",
        vec![
            tx("tx-1", "orig-100", first_purchase, renewal_purchase),
            tx("tx-2", "orig-100", renewal_purchase, renewal_expires),
        ],
    );
    process(&pool, &renew).await.unwrap();
    // Apple delivers renewals more than once; the second pass must not
    // duplicate the transaction
    process(&pool, &renew).await.unwrap();

    assert_eq!(count(&pool, "SELECT COUNT(*) FROM payment_transactions").await, 2);

    let payment = subs_db::get_transaction_by_external_id(&pool, "tx-2")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payment.category, TransactionCategory::Renewal);

    let subscription = subs_db::get_subscription(&pool, payment.subscription_id)
        .await
        .unwrap();
    assert_eq!(subscription.status, SubscriptionStatus::Active);
}

#[tokio::test]
async fn failed_renewal_with_retry_exhausted_expires_the_subscription() {
    let (_dir, pool) = test_db().await;
    seed_apple_customer(&pool, "orig-100").await;

    let paid_until = Utc::now() + Duration::days(3);
    let initial = notification(
        "INITIAL_BUY",
        vec![tx("tx-1", "orig-100", Utc::now() - Duration::days(27), paid_until)],
    );
    process(&pool, &initial).await.unwrap();

    let mut failed = notification(
        "DID_FAIL_TO_RENEW",
        vec![tx("tx-1", "orig-100", Utc::now() - Duration::days(27), paid_until)],
    );
    failed.unified_receipt.as_mut().unwrap().pending_renewal_info =
        serde_json::from_value(serde_json::json!([
            { "original_transaction_id": "orig-100", "is_in_billing_retry_period": "0" }
        ]))
        .unwrap();

    process(&pool, &failed).await.unwrap();

    let subscription = subs_db::get_subscription(&pool, 1).await.unwrap();
    assert_eq!(subscription.status, SubscriptionStatus::Expired);
    assert_eq!(subscription.valid_until, Some(paid_until.date_naive()));
}

#[tokio::test]
async fn failed_renewal_in_billing_retry_keeps_access_until_paid() {
    let (_dir, pool) = test_db().await;
    seed_apple_customer(&pool, "orig-100").await;

    let paid_until = Utc::now() + Duration::days(3);
    let initial = notification(
        "INITIAL_BUY",
        vec![tx("tx-1", "orig-100", Utc::now() - Duration::days(27), paid_until)],
    );
    process(&pool, &initial).await.unwrap();

    let mut failed = notification(
        "DID_FAIL_TO_RENEW",
        vec![tx("tx-1", "orig-100", Utc::now() - Duration::days(27), paid_until)],
    );
    failed.unified_receipt.as_mut().unwrap().pending_renewal_info =
        serde_json::from_value(serde_json::json!([
            { "original_transaction_id": "orig-100", "is_in_billing_retry_period": "1" }
        ]))
        .unwrap();

    process(&pool, &failed).await.unwrap();

    let subscription = subs_db::get_subscription(&pool, 1).await.unwrap();
    assert_eq!(subscription.status, SubscriptionStatus::Active);
    assert_eq!(subscription.valid_until, Some(paid_until.date_naive()));
}

#[tokio::test]
async fn interactive_renewal_records_the_missed_charge() {
    let (_dir, pool) = test_db().await;
    seed_apple_customer(&pool, "orig-100").await;

    let first_purchase = Utc::now() - Duration::days(30);
    let renewal_purchase = Utc::now();
    let renewal_expires = Utc::now() + Duration::days(30);

    let initial = notification(
        "INITIAL_BUY",
        vec![tx("tx-1", "orig-100", first_purchase, renewal_purchase)],
    );
    process(&pool, &initial).await.unwrap();

    let interactive = notification(
        "INTERACTIVE_RENEWAL",
        vec![
            tx("tx-1", "orig-100", first_purchase, renewal_purchase),
            tx("tx-2", "orig-100", renewal_purchase, renewal_expires),
        ],
    );
    process(&pool, &interactive).await.unwrap();

    let payment = subs_db::get_transaction_by_external_id(&pool, "tx-2")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payment.category, TransactionCategory::Renewal);

    let subscription = subs_db::get_subscription(&pool, payment.subscription_id)
        .await
        .unwrap();
    assert_eq!(subscription.status, SubscriptionStatus::Active);
    assert_eq!(subscription.valid_until, None);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM subscriptions").await, 1);
}

#[tokio::test]
async fn interactive_renewal_upgrade_replaces_the_subscription() {
    let (_dir, pool) = test_db().await;
    seed_apple_customer(&pool, "orig-100").await;
    sqlx::query(
        "INSERT INTO subscription_plans (name, apple_product_id, price, currency)
         VALUES ('Pro Yearly', 'pro_yearly', '99.99', 'USD')",
    )
    .execute(&pool)
    .await
    .unwrap();

    let first_purchase = Utc::now() - Duration::days(10);
    let upgrade_purchase = Utc::now();
    let upgrade_expires = Utc::now() + Duration::days(365);

    let initial = notification(
        "INITIAL_BUY",
        vec![tx("tx-1", "orig-100", first_purchase, first_purchase + Duration::days(30))],
    );
    process(&pool, &initial).await.unwrap();

    // The superseded transaction carries is_upgraded, the newest one the
    // new plan's purchase
    let mut superseded = tx("tx-1", "orig-100", first_purchase, first_purchase + Duration::days(30));
    superseded["is_upgraded"] = serde_json::Value::String("true".into());
    let mut replacement = tx("tx-2", "orig-100", upgrade_purchase, upgrade_expires);
    replacement["product_id"] = serde_json::Value::String("pro_yearly".into());

    let upgrade = notification("INTERACTIVE_RENEWAL", vec![superseded, replacement]);
    process(&pool, &upgrade).await.unwrap();

    let old_payment = subs_db::get_transaction_by_external_id(&pool, "tx-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(old_payment.status, TransactionStatus::Canceled);

    let old_subscription = subs_db::get_subscription(&pool, old_payment.subscription_id)
        .await
        .unwrap();
    assert_eq!(old_subscription.status, SubscriptionStatus::Expired);

    let new_payment = subs_db::get_transaction_by_external_id(&pool, "tx-2")
        .await
        .unwrap()
        .unwrap();
    let new_subscription = subs_db::get_subscription(&pool, new_payment.subscription_id)
        .await
        .unwrap();
    assert_ne!(new_subscription.id, old_subscription.id);
    assert_eq!(new_subscription.status, SubscriptionStatus::Active);
    assert_eq!(new_subscription.plan_id, 2);

    // Double-notification protection: a replay changes nothing
    process(&pool, &upgrade).await.unwrap();
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM subscriptions").await, 2);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM payment_transactions").await, 2);
}

#[tokio::test]
async fn disabling_auto_renew_schedules_the_expiry() {
    let (_dir, pool) = test_db().await;
    seed_apple_customer(&pool, "orig-100").await;

    let paid_until = Utc::now() + Duration::days(20);
    let initial = notification(
        "INITIAL_BUY",
        vec![tx("tx-1", "orig-100", Utc::now() - Duration::days(10), paid_until)],
    );
    process(&pool, &initial).await.unwrap();

    let mut toggled = notification(
        "DID_CHANGE_RENEWAL_STATUS",
        vec![tx("tx-1", "orig-100", Utc::now() - Duration::days(10), paid_until)],
    );
    toggled.unified_receipt.as_mut().unwrap().pending_renewal_info =
        serde_json::from_value(serde_json::json!([
            { "original_transaction_id": "orig-100", "auto_renew_status": "0" }
        ]))
        .unwrap();
    process(&pool, &toggled).await.unwrap();

    let subscription = subs_db::get_subscription(&pool, 1).await.unwrap();
    assert_eq!(subscription.status, SubscriptionStatus::Active);
    assert_eq!(subscription.valid_until, Some(paid_until.date_naive()));

    let audits = count(
        &pool,
        "SELECT COUNT(*) FROM subscription_changes
         WHERE reason = 'APPLE_DID_CHANGE_RENEWAL_STATUS'",
    )
    .await;
    assert_eq!(audits, 1);
}

#[tokio::test]
async fn re_enabling_auto_renew_restores_open_validity() {
    let (_dir, pool) = test_db().await;
    seed_apple_customer(&pool, "orig-100").await;

    let paid_until = Utc::now() + Duration::days(20);
    let receipt_txs =
        vec![tx("tx-1", "orig-100", Utc::now() - Duration::days(10), paid_until)];
    process(&pool, &notification("INITIAL_BUY", receipt_txs.clone()))
        .await
        .unwrap();

    let toggle = |status: &str| {
        let mut n = notification("DID_CHANGE_RENEWAL_STATUS", receipt_txs.clone());
        n.unified_receipt.as_mut().unwrap().pending_renewal_info =
            serde_json::from_value(serde_json::json!([
                { "original_transaction_id": "orig-100", "auto_renew_status": status }
            ]))
            .unwrap();
        n
    };

    process(&pool, &toggle("0")).await.unwrap();
    process(&pool, &toggle("1")).await.unwrap();

    let subscription = subs_db::get_subscription(&pool, 1).await.unwrap();
    assert_eq!(subscription.status, SubscriptionStatus::Active);
    assert_eq!(subscription.valid_until, None);
}

#[tokio::test]
async fn renewal_pref_change_only_writes_an_audit_row() {
    let (_dir, pool) = test_db().await;
    seed_apple_customer(&pool, "orig-100").await;

    let now = Utc::now();
    let receipt_txs = vec![tx("tx-1", "orig-100", now, now + Duration::days(30))];
    process(&pool, &notification("INITIAL_BUY", receipt_txs.clone()))
        .await
        .unwrap();

    process(&pool, &notification("DID_CHANGE_RENEWAL_PREF", receipt_txs))
        .await
        .unwrap();

    let subscription = subs_db::get_subscription(&pool, 1).await.unwrap();
    assert_eq!(subscription.status, SubscriptionStatus::Active);
    assert_eq!(subscription.valid_until, None);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM payment_transactions").await, 1);

    let audits = count(
        &pool,
        "SELECT COUNT(*) FROM subscription_changes
         WHERE reason = 'APPLE_DID_CHANGE_RENEWAL_PREF'",
    )
    .await;
    assert_eq!(audits, 1);
}

#[tokio::test]
async fn refund_after_expiry_cancels_only_the_transaction() {
    let (_dir, pool) = test_db().await;
    seed_apple_customer(&pool, "orig-100").await;

    let purchased = Utc::now() - Duration::days(40);
    let expired_at = Utc::now() - Duration::days(10);
    let initial = notification("INITIAL_BUY", vec![tx("tx-1", "orig-100", purchased, expired_at)]);
    process(&pool, &initial).await.unwrap();

    sqlx::query("UPDATE subscriptions SET status = 2, valid_until = ? WHERE id = 1")
        .bind(expired_at.date_naive())
        .execute(&pool)
        .await
        .unwrap();

    let mut refunded = tx("tx-1", "orig-100", purchased, expired_at);
    refunded["cancellation_date_ms"] = serde_json::Value::String(ms(Utc::now()));
    process(&pool, &notification("CANCEL", vec![refunded])).await.unwrap();

    let payment = subs_db::get_transaction_by_external_id(&pool, "tx-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payment.status, TransactionStatus::Canceled);

    // The subscription keeps its original expiry; no cancel audit is written
    let subscription = subs_db::get_subscription(&pool, 1).await.unwrap();
    assert_eq!(subscription.status, SubscriptionStatus::Expired);
    assert_eq!(subscription.valid_until, Some(expired_at.date_naive()));

    let audits = count(
        &pool,
        "SELECT COUNT(*) FROM subscription_changes WHERE reason = 'APPLE_CANCELED'",
    )
    .await;
    assert_eq!(audits, 0);
}

#[tokio::test]
async fn simple_refund_cancels_transaction_and_expires_subscription() {
    let (_dir, pool) = test_db().await;
    seed_apple_customer(&pool, "orig-100").await;

    let purchased = Utc::now() - Duration::days(5);
    let expires = Utc::now() + Duration::days(25);
    let initial = notification("INITIAL_BUY", vec![tx("tx-1", "orig-100", purchased, expires)]);
    process(&pool, &initial).await.unwrap();

    let cancellation = Utc::now();
    let mut refunded = tx("tx-1", "orig-100", purchased, expires);
    refunded["cancellation_date_ms"] = serde_json::Value::String(ms(cancellation));

    let cancel = notification("CANCEL", vec![refunded]);
    process(&pool, &cancel).await.unwrap();

    let payment = subs_db::get_transaction_by_external_id(&pool, "tx-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payment.status, TransactionStatus::Canceled);

    let subscription = subs_db::get_subscription(&pool, payment.subscription_id)
        .await
        .unwrap();
    assert_eq!(subscription.status, SubscriptionStatus::Expired);
    assert_eq!(subscription.valid_until, Some(cancellation.date_naive()));
}

#[tokio::test]
async fn refund_for_unknown_history_is_acknowledged() {
    let (_dir, pool) = test_db().await;
    seed_apple_customer(&pool, "orig-100").await;

    // Nothing was ever recorded for this subscription group
    let purchased = Utc::now() - Duration::days(60);
    let mut refunded = tx("tx-9", "orig-900", purchased, purchased + Duration::days(30));
    refunded["cancellation_date_ms"] = serde_json::Value::String(ms(Utc::now()));

    let cancel = notification("CANCEL", vec![refunded]);
    process(&pool, &cancel).await.unwrap();

    assert_eq!(count(&pool, "SELECT COUNT(*) FROM subscriptions").await, 0);
}
