//! Royalty split engine
//!
//! A song's splits are versioned in revisions. Exactly one revision is
//! ACTIVE at a time; edits create a new revision that sits PENDING until
//! every holder has confirmed, at which point it activates and the previous
//! revision is archived. Revisions chain by date: a new revision starts the
//! day after the previous one ends.

pub mod invitations;
pub mod revision;
pub mod sweeps;
pub mod validate;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Contact details for a split holder who has no user account yet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InviteDetails {
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

/// One requested split in a create/update call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitEntry {
    /// Known holder; None means the invite details identify them
    pub user_id: Option<i64>,
    pub rate: Decimal,
    pub invite: Option<InviteDetails>,
}
