//! Maintenance sweeps over released songs
//!
//! Run on release day (or over a backfill window): royalties must never sit
//! unallocated once accounting starts, so splits that are still pending when
//! the release goes live are cancelled and their share returned to the
//! owner. Safe to re-run.

use crate::db::splits as db;
use crate::{Error, Result};
use chrono::{NaiveDate, Utc};
use crescendo_common::db::models::SplitStatus;
use rust_decimal::Decimal;
use sqlx::SqlitePool;
use tracing::info;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepSummary {
    /// Songs whose pending revision-1 splits were replaced
    pub songs_cancelled: usize,
    /// Splits written in replacement revisions
    pub splits_created: usize,
    /// Songs that had no splits at all and got a 100% owner split
    pub songs_backfilled: usize,
}

fn check_window(start_date: Option<NaiveDate>, end_date: Option<NaiveDate>) -> Result<()> {
    if start_date.is_some() != end_date.is_some() {
        return Err(Error::InvalidInput(
            "both start and end date must be specified or none of them".into(),
        ));
    }

    if let Some(end) = end_date {
        if end > Utc::now().date_naive() {
            return Err(Error::InvalidInput(
                "cannot cancel splits for releases that are not released; \
                 end date must be today or earlier"
                    .into(),
            ));
        }
    }

    Ok(())
}

/// Cancel unconfirmed revision-1 splits for songs released in the window
/// (default: today) and re-allocate the unclaimed share to the owner.
/// Songs without any splits get a 100% ACTIVE owner split.
pub async fn cancel_pending_splits(
    db: &SqlitePool,
    start_date: Option<NaiveDate>,
    end_date: Option<NaiveDate>,
) -> Result<SweepSummary> {
    check_window(start_date, end_date)?;

    let mut summary = SweepSummary::default();

    let song_ids = db::songs_with_unresolved_first_revision(db, start_date, end_date).await?;
    info!(count = song_ids.len(), "Songs with unresolved splits in window");

    for song_id in song_ids {
        if db::has_locked_splits(db, song_id).await? {
            info!(song_id, "Skipping song with locked splits");
            continue;
        }

        let splits: Vec<_> = db::get_splits_for_song(db, song_id)
            .await?
            .into_iter()
            .filter(|s| {
                s.revision == 1
                    && matches!(s.status, SplitStatus::Pending | SplitStatus::Confirmed)
            })
            .collect();

        if splits.is_empty() {
            continue;
        }

        // Confirmed non-owner shares survive; pending shares and the
        // owner's own share pool together into one owner split.
        let mut owner_rate = Decimal::ZERO;
        let mut owner_id: Option<i64> = None;
        let mut keep: Vec<(Option<i64>, Decimal)> = Vec::new();

        for split in &splits {
            if split.is_owner {
                owner_id = split.user_id;
            }

            if split.is_owner || split.status == SplitStatus::Pending {
                owner_rate += split.rate;
            } else {
                keep.push((split.user_id, split.rate));
            }
        }

        // Every split for the song goes, not just revision 1, in case stale
        // pending revisions were left behind.
        db::delete_splits_for_song(db, song_id).await?;

        for (user_id, rate) in &keep {
            db::insert_split(
                db,
                song_id,
                *user_id,
                *rate,
                1,
                SplitStatus::Active,
                false,
                None,
            )
            .await?;
            summary.splits_created += 1;
        }

        if owner_rate > Decimal::ZERO {
            let owner = match owner_id {
                Some(id) => id,
                None => db::release_owner_for_song(db, song_id).await?,
            };

            db::insert_split(
                db,
                song_id,
                Some(owner),
                owner_rate,
                1,
                SplitStatus::Active,
                true,
                None,
            )
            .await?;
            summary.splits_created += 1;
        }

        info!(song_id, owner_rate = %owner_rate, "Cancelled pending splits");
        summary.songs_cancelled += 1;
    }

    for song_id in db::released_songs_without_splits(db, start_date, end_date).await? {
        let owner = db::release_owner_for_song(db, song_id).await?;

        db::insert_split(
            db,
            song_id,
            Some(owner),
            Decimal::ONE,
            1,
            SplitStatus::Active,
            true,
            None,
        )
        .await?;

        info!(song_id, owner, "Created owner split for song without splits");
        summary.songs_backfilled += 1;
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_must_be_both_or_neither() {
        let today = Utc::now().date_naive();
        assert!(check_window(None, None).is_ok());
        assert!(check_window(Some(today), Some(today)).is_ok());
        assert!(check_window(Some(today), None).is_err());
        assert!(check_window(None, Some(today)).is_err());
    }

    #[test]
    fn future_end_date_is_rejected() {
        let today = Utc::now().date_naive();
        let tomorrow = today + chrono::Duration::days(1);
        assert!(check_window(Some(today), Some(tomorrow)).is_err());
    }
}
