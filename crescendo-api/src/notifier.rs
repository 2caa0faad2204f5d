//! Background notification queue
//!
//! Invite sends and analytics events are queued here rather than performed
//! inline, so a slow or failing delivery never blocks a request handler.
//! The worker retries with exponential backoff (10 * 2^attempt seconds) and
//! gives up after a capped number of attempts. Delivery is at-least-once.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

const MAX_ATTEMPTS: u32 = 5;
const BACKOFF_BASE_SECS: u64 = 10;

/// Events the worker delivers
#[derive(Debug, Clone)]
pub enum Notification {
    /// A royalty invite was sent (or re-sent) to a split holder
    RoyaltyInvite {
        invitation_id: i64,
        song_id: i64,
        name: String,
        email: Option<String>,
        phone: Option<String>,
        token: String,
    },
    /// Analytics event: a pending invite group expired and its revision
    /// was removed
    SplitInvitesExpired { user_id: i64, song_name: String },
}

/// Delivery backend. The production sink sends email/SMS and analytics;
/// tests swap in a recording stub.
#[async_trait]
pub trait NotificationSink: Send + Sync + 'static {
    async fn deliver(&self, notification: &Notification) -> Result<(), String>;
}

/// Default sink: logs the event. Outbound mail/SMS transport is owned by a
/// separate delivery service that tails these logs in production.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn deliver(&self, notification: &Notification) -> Result<(), String> {
        match notification {
            Notification::RoyaltyInvite {
                invitation_id,
                song_id,
                ..
            } => {
                info!(
                    invitation_id,
                    song_id, "Royalty invite queued for delivery"
                );
            }
            Notification::SplitInvitesExpired { user_id, song_name } => {
                info!(user_id, song_name = %song_name, "Split invites expired");
            }
        }
        Ok(())
    }
}

/// Cloneable handle for queueing notifications
#[derive(Clone)]
pub struct NotifierHandle {
    tx: mpsc::UnboundedSender<Notification>,
}

impl NotifierHandle {
    /// Queue a notification. Dropped silently if the worker has shut down;
    /// request handling must not fail because of that.
    pub fn send(&self, notification: Notification) {
        if self.tx.send(notification).is_err() {
            warn!("Notifier worker is gone, dropping notification");
        }
    }
}

/// Spawn the worker task and return its handle
pub fn spawn_notifier(sink: Arc<dyn NotificationSink>) -> NotifierHandle {
    let (tx, mut rx) = mpsc::unbounded_channel::<Notification>();

    tokio::spawn(async move {
        while let Some(notification) = rx.recv().await {
            deliver_with_retry(sink.as_ref(), &notification).await;
        }
    });

    NotifierHandle { tx }
}

async fn deliver_with_retry(sink: &dyn NotificationSink, notification: &Notification) {
    for attempt in 0..MAX_ATTEMPTS {
        match sink.deliver(notification).await {
            Ok(()) => return,
            Err(e) => {
                let delay = BACKOFF_BASE_SECS * 2u64.pow(attempt);
                warn!(
                    attempt,
                    delay_secs = delay,
                    error = %e,
                    "Notification delivery failed, backing off"
                );
                tokio::time::sleep(Duration::from_secs(delay)).await;
            }
        }
    }

    error!(?notification, "Notification dropped after {} attempts", MAX_ATTEMPTS);
}
