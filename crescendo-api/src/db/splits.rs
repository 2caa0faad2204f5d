//! Royalty split and invitation queries
//!
//! Bulk revision transitions (activate/archive) are single UPDATE statements
//! with the revision in the WHERE clause, so the transition is atomic even
//! without row locks.

use crate::db::parse_decimal;
use crate::{Error, Result};
use chrono::{DateTime, NaiveDate, Utc};
use crescendo_common::db::models::{
    InvitationStatus, ReleaseStatus, RoyaltyInvitation, RoyaltySplit, SplitStatus,
};
use rust_decimal::Decimal;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

/// A split with the release context the validator needs
#[derive(Debug, Clone)]
pub struct SplitWithRelease {
    pub split: RoyaltySplit,
    pub release_id: i64,
    pub release_status: ReleaseStatus,
    pub release_date: Option<NaiveDate>,
    pub release_owner_id: i64,
}

fn split_from_row(row: &SqliteRow) -> Result<RoyaltySplit> {
    let status_raw: i64 = row.get("status");
    let status = SplitStatus::from_i64(status_raw)
        .ok_or_else(|| Error::InvalidState(format!("unknown split status {}", status_raw)))?;

    Ok(RoyaltySplit {
        id: row.get("id"),
        song_id: row.get("song_id"),
        user_id: row.get("user_id"),
        rate: parse_decimal(&row.get::<String, _>("rate"))?,
        revision: row.get("revision"),
        status,
        is_owner: row.get::<i64, _>("is_owner") != 0,
        is_locked: row.get::<i64, _>("is_locked") != 0,
        start_date: row.get("start_date"),
        end_date: row.get("end_date"),
        created: row.get("created"),
    })
}

fn invitation_from_row(row: &SqliteRow) -> Result<RoyaltyInvitation> {
    let status_raw: i64 = row.get("status");
    let status = InvitationStatus::from_i64(status_raw)
        .ok_or_else(|| Error::InvalidState(format!("unknown invitation status {}", status_raw)))?;

    Ok(RoyaltyInvitation {
        id: row.get("id"),
        split_id: row.get("split_id"),
        inviter_id: row.get("inviter_id"),
        invitee_id: row.get("invitee_id"),
        token: row.get("token"),
        name: row.get("name"),
        email: row.get("email"),
        phone: row.get("phone"),
        status,
        last_sent: row.get("last_sent"),
        created: row.get("created"),
        updated: row.get("updated"),
    })
}

/// All splits for one song, every revision, ordered by (revision, id)
pub async fn get_splits_for_song(db: &SqlitePool, song_id: i64) -> Result<Vec<RoyaltySplit>> {
    let rows = sqlx::query(
        "SELECT * FROM royalty_splits WHERE song_id = ? ORDER BY revision, id",
    )
    .bind(song_id)
    .fetch_all(db)
    .await?;

    rows.iter().map(split_from_row).collect()
}

/// Splits joined with release context for a set of songs
pub async fn get_splits_with_release(
    db: &SqlitePool,
    song_ids: &[i64],
) -> Result<Vec<SplitWithRelease>> {
    let mut out = Vec::new();

    for song_id in song_ids {
        let rows = sqlx::query(
            r#"
            SELECT rs.id, rs.song_id, rs.user_id, rs.rate, rs.revision, rs.status,
                   rs.is_owner, rs.is_locked, rs.start_date, rs.end_date, rs.created,
                   r.id AS release_id, r.status AS release_status,
                   r.release_date, r.owner_user_id
            FROM royalty_splits rs
            JOIN songs s ON s.id = rs.song_id
            JOIN releases r ON r.id = s.release_id
            WHERE rs.song_id = ?
            ORDER BY rs.revision, rs.id
            "#,
        )
        .bind(song_id)
        .fetch_all(db)
        .await?;

        for row in &rows {
            let release_status_raw: i64 = row.get("release_status");
            let release_status = ReleaseStatus::from_i64(release_status_raw).ok_or_else(|| {
                Error::InvalidState(format!("unknown release status {}", release_status_raw))
            })?;

            out.push(SplitWithRelease {
                split: split_from_row(row)?,
                release_id: row.get("release_id"),
                release_status,
                release_date: row.get("release_date"),
                release_owner_id: row.get("owner_user_id"),
            });
        }
    }

    Ok(out)
}

/// Song ids whose release date falls in the given range (both bounds
/// optional). Used by the validator CLI and the pending-split sweep.
pub async fn song_ids_by_release_date(
    db: &SqlitePool,
    start_date: Option<NaiveDate>,
    end_date: Option<NaiveDate>,
) -> Result<Vec<i64>> {
    let rows = match (start_date, end_date) {
        (Some(start), Some(end)) => {
            sqlx::query(
                "SELECT s.id FROM songs s JOIN releases r ON r.id = s.release_id
                 WHERE r.release_date >= ? AND r.release_date <= ? ORDER BY s.id",
            )
            .bind(start)
            .bind(end)
            .fetch_all(db)
            .await?
        }
        _ => {
            sqlx::query("SELECT id FROM songs ORDER BY id")
                .fetch_all(db)
                .await?
        }
    };

    Ok(rows.iter().map(|r| r.get::<i64, _>(0)).collect())
}

/// Insert one split row, returning its id
#[allow(clippy::too_many_arguments)]
pub async fn insert_split(
    db: &SqlitePool,
    song_id: i64,
    user_id: Option<i64>,
    rate: Decimal,
    revision: i64,
    status: SplitStatus,
    is_owner: bool,
    start_date: Option<NaiveDate>,
) -> Result<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO royalty_splits
            (song_id, user_id, rate, revision, status, is_owner, start_date)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(song_id)
    .bind(user_id)
    .bind(rate.to_string())
    .bind(revision)
    .bind(status.as_i64())
    .bind(is_owner as i64)
    .bind(start_date)
    .execute(db)
    .await?;

    Ok(result.last_insert_rowid())
}

/// Highest revision number present for a song (0 when no splits exist)
pub async fn max_revision(db: &SqlitePool, song_id: i64) -> Result<i64> {
    let max: Option<i64> =
        sqlx::query_scalar("SELECT MAX(revision) FROM royalty_splits WHERE song_id = ?")
            .bind(song_id)
            .fetch_one(db)
            .await?;

    Ok(max.unwrap_or(0))
}

pub async fn has_locked_splits(db: &SqlitePool, song_id: i64) -> Result<bool> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM royalty_splits WHERE song_id = ? AND is_locked = 1",
    )
    .bind(song_id)
    .fetch_one(db)
    .await?;

    Ok(count > 0)
}

/// Activate a whole revision: status -> ACTIVE with the given start date.
/// Atomic single UPDATE; the WHERE clause pins song and revision.
pub async fn activate_revision(
    db: &SqlitePool,
    song_id: i64,
    revision: i64,
    start_date: Option<NaiveDate>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE royalty_splits SET status = ?, start_date = ?
         WHERE song_id = ? AND revision = ?",
    )
    .bind(SplitStatus::Active.as_i64())
    .bind(start_date)
    .bind(song_id)
    .bind(revision)
    .execute(db)
    .await?;

    Ok(result.rows_affected())
}

/// Archive a whole revision: ACTIVE -> ARCHIVED with the given end date
pub async fn archive_revision(
    db: &SqlitePool,
    song_id: i64,
    revision: i64,
    end_date: NaiveDate,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE royalty_splits SET status = ?, end_date = ?
         WHERE song_id = ? AND revision = ? AND status = ?",
    )
    .bind(SplitStatus::Archived.as_i64())
    .bind(end_date)
    .bind(song_id)
    .bind(revision)
    .bind(SplitStatus::Active.as_i64())
    .execute(db)
    .await?;

    Ok(result.rows_affected())
}

pub async fn set_split_status(db: &SqlitePool, split_id: i64, status: SplitStatus) -> Result<()> {
    sqlx::query("UPDATE royalty_splits SET status = ? WHERE id = ?")
        .bind(status.as_i64())
        .bind(split_id)
        .execute(db)
        .await?;

    Ok(())
}

pub async fn set_split_user(db: &SqlitePool, split_id: i64, user_id: i64) -> Result<()> {
    sqlx::query("UPDATE royalty_splits SET user_id = ? WHERE id = ?")
        .bind(user_id)
        .bind(split_id)
        .execute(db)
        .await?;

    Ok(())
}

pub async fn get_split(db: &SqlitePool, split_id: i64) -> Result<RoyaltySplit> {
    let row = sqlx::query("SELECT * FROM royalty_splits WHERE id = ?")
        .bind(split_id)
        .fetch_optional(db)
        .await?
        .ok_or_else(|| Error::NotFound(format!("split {}", split_id)))?;

    split_from_row(&row)
}

/// Delete all splits of one revision (pending-split cleanup)
pub async fn delete_revision(db: &SqlitePool, song_id: i64, revision: i64) -> Result<u64> {
    let result = sqlx::query("DELETE FROM royalty_splits WHERE song_id = ? AND revision = ?")
        .bind(song_id)
        .bind(revision)
        .execute(db)
        .await?;

    Ok(result.rows_affected())
}

pub async fn delete_split(db: &SqlitePool, split_id: i64) -> Result<()> {
    sqlx::query("DELETE FROM royalty_splits WHERE id = ?")
        .bind(split_id)
        .execute(db)
        .await?;

    Ok(())
}

/// Delete every split for a song, all revisions
pub async fn delete_splits_for_song(db: &SqlitePool, song_id: i64) -> Result<u64> {
    let result = sqlx::query("DELETE FROM royalty_splits WHERE song_id = ?")
        .bind(song_id)
        .execute(db)
        .await?;

    Ok(result.rows_affected())
}

/// Renumber a whole revision (used after stale revisions were removed)
pub async fn set_revision(
    db: &SqlitePool,
    song_id: i64,
    from_revision: i64,
    to_revision: i64,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE royalty_splits SET revision = ? WHERE song_id = ? AND revision = ?",
    )
    .bind(to_revision)
    .bind(song_id)
    .bind(from_revision)
    .execute(db)
    .await?;

    Ok(result.rows_affected())
}

// ============================================================================
// Invitations
// ============================================================================

#[allow(clippy::too_many_arguments)]
pub async fn insert_invitation(
    db: &SqlitePool,
    split_id: i64,
    inviter_id: i64,
    invitee_id: Option<i64>,
    token: Option<&str>,
    name: &str,
    email: Option<&str>,
    phone: Option<&str>,
    status: InvitationStatus,
    last_sent: Option<DateTime<Utc>>,
) -> Result<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO royalty_invitations
            (split_id, inviter_id, invitee_id, token, name, email, phone, status, last_sent)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(split_id)
    .bind(inviter_id)
    .bind(invitee_id)
    .bind(token)
    .bind(name)
    .bind(email)
    .bind(phone)
    .bind(status.as_i64())
    .bind(last_sent)
    .execute(db)
    .await?;

    Ok(result.last_insert_rowid())
}

pub async fn get_invitation_by_token(
    db: &SqlitePool,
    token: &str,
) -> Result<Option<RoyaltyInvitation>> {
    let row = sqlx::query("SELECT * FROM royalty_invitations WHERE token = ?")
        .bind(token)
        .fetch_optional(db)
        .await?;

    row.as_ref().map(invitation_from_row).transpose()
}

pub async fn get_invitation_for_split(
    db: &SqlitePool,
    split_id: i64,
) -> Result<Option<RoyaltyInvitation>> {
    let row = sqlx::query("SELECT * FROM royalty_invitations WHERE split_id = ?")
        .bind(split_id)
        .fetch_optional(db)
        .await?;

    row.as_ref().map(invitation_from_row).transpose()
}

pub async fn update_invitation_status(
    db: &SqlitePool,
    invitation_id: i64,
    status: InvitationStatus,
    invitee_id: Option<i64>,
) -> Result<()> {
    sqlx::query(
        "UPDATE royalty_invitations
         SET status = ?, invitee_id = COALESCE(?, invitee_id), updated = CURRENT_TIMESTAMP
         WHERE id = ?",
    )
    .bind(status.as_i64())
    .bind(invitee_id)
    .bind(invitation_id)
    .execute(db)
    .await?;

    Ok(())
}

/// PENDING invitations sent before the cutoff, attached to a
/// pending/confirmed split of the latest (>1) revision of a released song.
pub async fn expirable_invitations(
    db: &SqlitePool,
    cutoff: DateTime<Utc>,
) -> Result<Vec<RoyaltyInvitation>> {
    let rows = sqlx::query(
        r#"
        SELECT ri.* FROM royalty_invitations ri
        JOIN royalty_splits rs ON rs.id = ri.split_id
        JOIN songs s ON s.id = rs.song_id
        JOIN releases r ON r.id = s.release_id
        WHERE ri.status = ?
          AND ri.last_sent IS NOT NULL AND ri.last_sent < ?
          AND rs.status IN (?, ?)
          AND r.status IN (?, ?, ?)
          AND rs.revision > 1
          AND rs.revision = (
              SELECT MAX(revision) FROM royalty_splits WHERE song_id = rs.song_id
          )
        "#,
    )
    .bind(InvitationStatus::Pending.as_i64())
    .bind(cutoff)
    .bind(SplitStatus::Pending.as_i64())
    .bind(SplitStatus::Confirmed.as_i64())
    .bind(ReleaseStatus::Delivered.as_i64())
    .bind(ReleaseStatus::Released.as_i64())
    .bind(ReleaseStatus::Takedown.as_i64())
    .fetch_all(db)
    .await?;

    rows.iter().map(invitation_from_row).collect()
}

pub async fn release_id_for_song(db: &SqlitePool, song_id: i64) -> Result<i64> {
    sqlx::query_scalar("SELECT release_id FROM songs WHERE id = ?")
        .bind(song_id)
        .fetch_optional(db)
        .await?
        .ok_or_else(|| Error::NotFound(format!("song {}", song_id)))
}

pub async fn song_name(db: &SqlitePool, song_id: i64) -> Result<String> {
    sqlx::query_scalar("SELECT name FROM songs WHERE id = ?")
        .bind(song_id)
        .fetch_optional(db)
        .await?
        .ok_or_else(|| Error::NotFound(format!("song {}", song_id)))
}

/// Release owner (the payee that backs `is_owner` splits) for a song
pub async fn release_owner_for_song(db: &SqlitePool, song_id: i64) -> Result<i64> {
    sqlx::query_scalar(
        "SELECT r.owner_user_id FROM releases r
         JOIN songs s ON s.release_id = r.id WHERE s.id = ?",
    )
    .bind(song_id)
    .fetch_optional(db)
    .await?
    .ok_or_else(|| Error::NotFound(format!("song {}", song_id)))
}

/// Songs of released releases in the date window that have no splits at all
pub async fn released_songs_without_splits(
    db: &SqlitePool,
    start_date: Option<NaiveDate>,
    end_date: Option<NaiveDate>,
) -> Result<Vec<i64>> {
    let (start, end) = window_or_today(start_date, end_date);

    let rows = sqlx::query(
        r#"
        SELECT s.id FROM songs s
        JOIN releases r ON r.id = s.release_id
        WHERE r.status IN (?, ?, ?)
          AND r.release_date >= ? AND r.release_date <= ?
          AND NOT EXISTS (SELECT 1 FROM royalty_splits rs WHERE rs.song_id = s.id)
        ORDER BY s.id
        "#,
    )
    .bind(ReleaseStatus::Delivered.as_i64())
    .bind(ReleaseStatus::Released.as_i64())
    .bind(ReleaseStatus::Takedown.as_i64())
    .bind(start)
    .bind(end)
    .fetch_all(db)
    .await?;

    Ok(rows.iter().map(|r| r.get::<i64, _>(0)).collect())
}

/// Songs of released releases in the window with revision-1 splits still
/// pending or confirmed
pub async fn songs_with_unresolved_first_revision(
    db: &SqlitePool,
    start_date: Option<NaiveDate>,
    end_date: Option<NaiveDate>,
) -> Result<Vec<i64>> {
    let (start, end) = window_or_today(start_date, end_date);

    let rows = sqlx::query(
        r#"
        SELECT DISTINCT rs.song_id FROM royalty_splits rs
        JOIN songs s ON s.id = rs.song_id
        JOIN releases r ON r.id = s.release_id
        WHERE rs.revision = 1
          AND rs.status IN (?, ?)
          AND r.status IN (?, ?, ?)
          AND r.release_date >= ? AND r.release_date <= ?
        ORDER BY rs.song_id
        "#,
    )
    .bind(SplitStatus::Pending.as_i64())
    .bind(SplitStatus::Confirmed.as_i64())
    .bind(ReleaseStatus::Delivered.as_i64())
    .bind(ReleaseStatus::Released.as_i64())
    .bind(ReleaseStatus::Takedown.as_i64())
    .bind(start)
    .bind(end)
    .fetch_all(db)
    .await?;

    Ok(rows.iter().map(|r| r.get::<i64, _>(0)).collect())
}

fn window_or_today(
    start_date: Option<NaiveDate>,
    end_date: Option<NaiveDate>,
) -> (NaiveDate, NaiveDate) {
    let today = Utc::now().date_naive();
    match (start_date, end_date) {
        (Some(s), Some(e)) => (s, e),
        _ => (today, today),
    }
}
