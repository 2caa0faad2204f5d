//! Revision lifecycle: create, update, activate, archive
//!
//! Activation and archival are bulk moves guarded by a same-revision check.
//! A split set that spans revisions is corrupt input and is rejected before
//! any row is touched.

use crate::db::splits as db;
use crate::notifier::NotifierHandle;
use crate::splits::invitations::create_invite;
use crate::splits::SplitEntry;
use crate::{Error, Result};
use chrono::{Duration, Utc};
use crescendo_common::db::models::{RoyaltySplit, SplitStatus};
use rust_decimal::Decimal;
use sqlx::SqlitePool;
use tracing::info;

/// Absolute tolerance for the per-revision rate sum
pub const RATE_EPSILON: &str = "0.0001";

fn ensure_same_revision(splits: &[RoyaltySplit]) -> Result<()> {
    if let Some(first) = splits.first() {
        if splits
            .iter()
            .any(|s| s.revision != first.revision || s.song_id != first.song_id)
        {
            return Err(Error::MixedRevisions(first.song_id));
        }
    }
    Ok(())
}

fn revision_is_confirmed(splits: &[RoyaltySplit]) -> Result<bool> {
    ensure_same_revision(splits)?;
    Ok(splits.iter().all(|s| s.status == SplitStatus::Confirmed))
}

/// Activate one revision. Revision 1 activates with `start_date = NULL`
/// (valid since the beginning of accounting); later revisions start today.
pub async fn activate(db: &SqlitePool, splits: &[RoyaltySplit]) -> Result<u64> {
    ensure_same_revision(splits)?;
    let Some(first) = splits.first() else {
        return Ok(0);
    };

    let start_date = if first.revision == 1 {
        None
    } else {
        Some(Utc::now().date_naive())
    };

    info!(
        song_id = first.song_id,
        revision = first.revision,
        ?start_date,
        "Activated splits"
    );

    db::activate_revision(db, first.song_id, first.revision, start_date).await
}

/// Archive one ACTIVE revision with `end_date = yesterday`, so the
/// replacement starting today chains without overlap.
pub async fn archive(db: &SqlitePool, splits: &[RoyaltySplit]) -> Result<u64> {
    ensure_same_revision(splits)?;
    let Some(first) = splits.first() else {
        return Ok(0);
    };

    let yesterday = Utc::now().date_naive() - Duration::days(1);

    info!(
        song_id = first.song_id,
        revision = first.revision,
        end_date = %yesterday,
        "Archived splits"
    );

    db::archive_revision(db, first.song_id, first.revision, yesterday).await
}

fn validate_entries(entries: &[SplitEntry]) -> Result<()> {
    if entries.is_empty() {
        return Err(Error::InvalidInput("no splits given".into()));
    }

    let epsilon: Decimal = RATE_EPSILON.parse().unwrap_or_default();
    let mut sum = Decimal::ZERO;

    for entry in entries {
        if entry.rate <= Decimal::ZERO || entry.rate > Decimal::ONE {
            return Err(Error::InvalidInput(format!(
                "rate {} out of range (0, 1]",
                entry.rate
            )));
        }
        if entry.user_id.is_none() && entry.invite.is_none() {
            return Err(Error::InvalidInput(
                "split holder needs a user_id or invite details".into(),
            ));
        }
        sum += entry.rate;
    }

    if (sum - Decimal::ONE).abs() > epsilon {
        return Err(Error::InvalidInput(format!("rates sum to {}, not 1", sum)));
    }

    Ok(())
}

/// Write one revision of split rows. Holders who need no confirmation (the
/// inviter themself, or the release owner) start CONFIRMED; everyone else
/// starts PENDING with an invitation row.
async fn create_revision_rows(
    db: &SqlitePool,
    notifier: &NotifierHandle,
    song_id: i64,
    inviter_id: i64,
    entries: &[SplitEntry],
    revision: i64,
    start_date: Option<chrono::NaiveDate>,
    send_invite: bool,
) -> Result<()> {
    let owner_id = db::release_owner_for_song(db, song_id).await?;

    for entry in entries {
        let is_same_user = entry.user_id == Some(inviter_id);
        let is_owner = entry.user_id == Some(owner_id);

        let status = if is_same_user || is_owner {
            SplitStatus::Confirmed
        } else {
            SplitStatus::Pending
        };

        let split_id = db::insert_split(
            db, song_id, entry.user_id, entry.rate, revision, status, is_owner, start_date,
        )
        .await?;

        if is_same_user || is_owner {
            continue;
        }

        create_invite(
            db,
            notifier,
            song_id,
            inviter_id,
            entry.user_id,
            split_id,
            entry.invite.as_ref(),
            send_invite,
        )
        .await?;
    }

    Ok(())
}

/// First revision of splits for a song. Activates immediately when every
/// holder is already confirmed.
pub async fn create_splits(
    db: &SqlitePool,
    notifier: &NotifierHandle,
    song_id: i64,
    inviter_id: i64,
    entries: &[SplitEntry],
) -> Result<i64> {
    validate_entries(entries)?;

    if db::max_revision(db, song_id).await? > 0 {
        return Err(Error::InvalidState(format!(
            "splits already exist for song {}, use an update instead",
            song_id
        )));
    }

    let revision = 1;
    create_revision_rows(db, notifier, song_id, inviter_id, entries, revision, None, false)
        .await?;

    let new_splits: Vec<_> = db::get_splits_for_song(db, song_id)
        .await?
        .into_iter()
        .filter(|s| s.revision == revision)
        .collect();

    if revision_is_confirmed(&new_splits)? {
        activate(db, &new_splits).await?;
    }

    Ok(revision)
}

/// Replace a song's splits with a new revision. The new revision stays
/// PENDING until every invite is confirmed; `update_splits_state` then
/// swaps it in.
pub async fn update_splits(
    db: &SqlitePool,
    notifier: &NotifierHandle,
    song_id: i64,
    inviter_id: i64,
    entries: &[SplitEntry],
) -> Result<i64> {
    validate_entries(entries)?;

    if db::has_locked_splits(db, song_id).await? {
        return Err(Error::InvalidState(format!(
            "song {} has locked splits",
            song_id
        )));
    }

    let revision = db::max_revision(db, song_id).await? + 1;
    let start_date = Some(Utc::now().date_naive());

    create_revision_rows(
        db, notifier, song_id, inviter_id, entries, revision, start_date, true,
    )
    .await?;

    update_splits_state(db, song_id, revision).await?;

    Ok(revision)
}

/// Reconcile a song's revisions after the latest one changed.
///
/// If the latest revision is fully confirmed it activates and the previous
/// ACTIVE revision is archived (a same-day ACTIVE revision is deleted
/// instead of archived, otherwise its date range would be negative). Stale
/// pending revisions below the latest are removed and the latest revision
/// is renumbered to stay consecutive.
pub async fn update_splits_state(db: &SqlitePool, song_id: i64, latest_revision: i64) -> Result<()> {
    let today = Utc::now().date_naive();
    let all_splits = db::get_splits_for_song(db, song_id).await?;

    let new_splits: Vec<_> = all_splits
        .iter()
        .filter(|s| s.revision == latest_revision)
        .cloned()
        .collect();
    let existing: Vec<_> = all_splits
        .iter()
        .filter(|s| s.revision != latest_revision)
        .cloned()
        .collect();

    if !new_splits.is_empty() && revision_is_confirmed(&new_splits)? {
        activate(db, &new_splits).await?;

        let mut active_revisions: Vec<i64> = existing
            .iter()
            .filter(|s| s.status == SplitStatus::Active)
            .map(|s| s.revision)
            .collect();
        active_revisions.sort_unstable();
        active_revisions.dedup();

        for rev in active_revisions {
            let revision_splits: Vec<_> = existing
                .iter()
                .filter(|s| s.revision == rev && s.status == SplitStatus::Active)
                .cloned()
                .collect();

            if revision_splits.iter().all(|s| s.start_date == Some(today)) {
                // Activated earlier today and replaced again before the day
                // ended; archiving would produce end < start.
                for split in &revision_splits {
                    info!(split_id = split.id, song_id, "Deleted same-day active split");
                    db::delete_split(db, split.id).await?;
                }
            } else {
                archive(db, &revision_splits).await?;
            }
        }
    }

    for split in existing
        .iter()
        .filter(|s| matches!(s.status, SplitStatus::Pending | SplitStatus::Confirmed))
    {
        info!(split_id = split.id, song_id, "Deleted superseded inactive split");
        db::delete_split(db, split.id).await?;
    }

    // Renumber so revisions stay consecutive after deletions
    let remaining = db::get_splits_for_song(db, song_id).await?;
    let max_other = remaining
        .iter()
        .filter(|s| s.revision != latest_revision)
        .map(|s| s.revision)
        .max()
        .unwrap_or(0);

    let updated_revision = max_other + 1;
    if updated_revision != latest_revision {
        info!(song_id, latest_revision, updated_revision, "Renumbered revision");
        db::set_revision(db, song_id, latest_revision, updated_revision).await?;
    }

    Ok(())
}
