//! Service-local database queries
//!
//! Plain query functions over the shared pool; no ORM layer. Row decoding
//! is done by hand so the decimal TEXT columns stay exact.

pub mod splits;
pub mod subscriptions;
pub mod users;

use crate::{Error, Result};
use rust_decimal::Decimal;

/// Parse a decimal TEXT column
pub(crate) fn parse_decimal(s: &str) -> Result<Decimal> {
    s.parse::<Decimal>()
        .map_err(|e| Error::InvalidInput(format!("bad decimal '{}': {}", s, e)))
}
