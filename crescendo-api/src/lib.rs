//! # Crescendo API service library
//!
//! Royalty-split lifecycle engine and subscription webhook reconciliation
//! for the Crescendo music-distribution backend.
//!
//! The two halves share one pattern: idempotent state mutation driven by
//! external events (user edits on one side, out-of-order and possibly
//! duplicated provider webhooks on the other), keyed by stable external ids.

pub mod api;
pub mod db;
pub mod error;
pub mod notifier;
pub mod splits;
pub mod subscriptions;

pub use error::{Error, Result};
