//! Invitation token generation
//!
//! Tokens are random and unguessable; the database stores them verbatim and
//! looks invitations up by exact match. SHA-256 over random bytes keeps the
//! token URL-safe hex without leaking the RNG output directly.

use rand::RngCore;
use sha2::{Digest, Sha256};

/// Generate a fresh invitation token (64 hex chars)
pub fn generate_invite_token() -> String {
    let mut seed = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut seed);

    let mut hasher = Sha256::new();
    hasher.update(seed);
    hex::encode(hasher.finalize())
}
