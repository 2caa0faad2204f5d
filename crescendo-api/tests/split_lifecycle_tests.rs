//! Integration tests for the royalty split revision lifecycle

use chrono::{Duration, NaiveDate, Utc};
use crescendo_api::db::splits as splits_db;
use crescendo_api::notifier::{spawn_notifier, LogSink, NotifierHandle};
use crescendo_api::splits::{invitations, revision, sweeps, InviteDetails, SplitEntry};
use crescendo_api::Error;
use crescendo_common::db::init_database;
use crescendo_common::db::models::{InvitationStatus, ReleaseStatus, SplitStatus};
use rust_decimal::Decimal;
use sqlx::SqlitePool;
use std::sync::Arc;
use tempfile::TempDir;

async fn test_db() -> (TempDir, SqlitePool, NotifierHandle) {
    let dir = tempfile::tempdir().unwrap();
    let pool = init_database(&dir.path().join("test.db")).await.unwrap();
    let notifier = spawn_notifier(Arc::new(LogSink));
    (dir, pool, notifier)
}

async fn seed_user(pool: &SqlitePool, name: &str) -> i64 {
    sqlx::query("INSERT INTO users (name, email) VALUES (?, ?)")
        .bind(name)
        .bind(format!("{}@example.com", name.to_lowercase()))
        .execute(pool)
        .await
        .unwrap()
        .last_insert_rowid()
}

async fn seed_song(
    pool: &SqlitePool,
    owner_id: i64,
    status: ReleaseStatus,
    release_date: Option<NaiveDate>,
) -> i64 {
    let release_id = sqlx::query(
        "INSERT INTO releases (status, release_date, owner_user_id) VALUES (?, ?, ?)",
    )
    .bind(status.as_i64())
    .bind(release_date)
    .bind(owner_id)
    .execute(pool)
    .await
    .unwrap()
    .last_insert_rowid();

    sqlx::query("INSERT INTO songs (release_id, name) VALUES (?, 'Test Song')")
        .bind(release_id)
        .execute(pool)
        .await
        .unwrap()
        .last_insert_rowid()
}

fn rate(s: &str) -> Decimal {
    s.parse().unwrap()
}

fn entry(user_id: i64, r: &str) -> SplitEntry {
    SplitEntry {
        user_id: Some(user_id),
        rate: rate(r),
        invite: None,
    }
}

#[tokio::test]
async fn first_revision_activates_when_owner_holds_everything() {
    let (_dir, pool, notifier) = test_db().await;
    let owner = seed_user(&pool, "Owner").await;
    let song = seed_song(&pool, owner, ReleaseStatus::Submitted, None).await;

    let rev = revision::create_splits(&pool, &notifier, song, owner, &[entry(owner, "1.0")])
        .await
        .unwrap();
    assert_eq!(rev, 1);

    let splits = splits_db::get_splits_for_song(&pool, song).await.unwrap();
    assert_eq!(splits.len(), 1);
    assert_eq!(splits[0].status, SplitStatus::Active);
    assert_eq!(splits[0].start_date, None);
    assert!(splits[0].is_owner);
}

#[tokio::test]
async fn first_revision_with_invitee_stays_unactivated() {
    let (_dir, pool, notifier) = test_db().await;
    let owner = seed_user(&pool, "Owner").await;
    let song = seed_song(&pool, owner, ReleaseStatus::Submitted, None).await;

    let entries = vec![
        entry(owner, "0.6"),
        SplitEntry {
            user_id: None,
            rate: rate("0.4"),
            invite: Some(InviteDetails {
                name: "Session Player".into(),
                email: Some("player@example.com".into()),
                phone: None,
            }),
        },
    ];

    revision::create_splits(&pool, &notifier, song, owner, &entries)
        .await
        .unwrap();

    let splits = splits_db::get_splits_for_song(&pool, song).await.unwrap();
    assert_eq!(splits.len(), 2);

    let owner_split = splits.iter().find(|s| s.is_owner).unwrap();
    let invited_split = splits.iter().find(|s| !s.is_owner).unwrap();
    assert_eq!(owner_split.status, SplitStatus::Confirmed);
    assert_eq!(invited_split.status, SplitStatus::Pending);

    // First-revision invites are not sent yet: no token, no last_sent
    let invitation = splits_db::get_invitation_for_split(&pool, invited_split.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(invitation.status, InvitationStatus::Created);
    assert!(invitation.token.is_none());
    assert!(invitation.last_sent.is_none());
}

#[tokio::test]
async fn confirming_the_last_invite_swaps_revisions() {
    let (_dir, pool, notifier) = test_db().await;
    let owner = seed_user(&pool, "Owner").await;
    let collaborator = seed_user(&pool, "Collaborator").await;
    let song = seed_song(&pool, owner, ReleaseStatus::Submitted, None).await;

    revision::create_splits(&pool, &notifier, song, owner, &[entry(owner, "1.0")])
        .await
        .unwrap();

    let rev = revision::update_splits(
        &pool,
        &notifier,
        song,
        owner,
        &[entry(owner, "0.5"), entry(collaborator, "0.5")],
    )
    .await
    .unwrap();
    assert_eq!(rev, 2);

    let splits = splits_db::get_splits_for_song(&pool, song).await.unwrap();
    let pending = splits
        .iter()
        .find(|s| s.revision == 2 && s.status == SplitStatus::Pending)
        .unwrap();

    // Update-flow invites go out immediately
    let invitation = splits_db::get_invitation_for_split(&pool, pending.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(invitation.status, InvitationStatus::Pending);
    assert!(invitation.last_sent.is_some());
    let token = invitation.token.clone().unwrap();

    invitations::confirm_invitation(&pool, &token, collaborator, 30)
        .await
        .unwrap();

    let today = Utc::now().date_naive();
    let yesterday = today - Duration::days(1);
    let splits = splits_db::get_splits_for_song(&pool, song).await.unwrap();

    for s in splits.iter().filter(|s| s.revision == 2) {
        assert_eq!(s.status, SplitStatus::Active);
        assert_eq!(s.start_date, Some(today));
    }
    for s in splits.iter().filter(|s| s.revision == 1) {
        assert_eq!(s.status, SplitStatus::Archived);
        assert_eq!(s.end_date, Some(yesterday));
        assert_eq!(s.start_date, None);
    }

    let invitation = splits_db::get_invitation_for_split(&pool, pending.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(invitation.status, InvitationStatus::Accepted);
    assert_eq!(invitation.invitee_id, Some(collaborator));
}

#[tokio::test]
async fn same_day_replacement_deletes_instead_of_archiving() {
    let (_dir, pool, notifier) = test_db().await;
    let owner = seed_user(&pool, "Owner").await;
    let song = seed_song(&pool, owner, ReleaseStatus::Submitted, None).await;

    revision::create_splits(&pool, &notifier, song, owner, &[entry(owner, "1.0")])
        .await
        .unwrap();

    // Second revision activates today (owner-only, confirmed immediately)
    revision::update_splits(&pool, &notifier, song, owner, &[entry(owner, "1.0")])
        .await
        .unwrap();

    // Third edit the same day: revision 2 is deleted, not archived, and the
    // replacement is renumbered back down to stay consecutive
    revision::update_splits(&pool, &notifier, song, owner, &[entry(owner, "1.0")])
        .await
        .unwrap();

    let splits = splits_db::get_splits_for_song(&pool, song).await.unwrap();
    let mut revisions: Vec<i64> = splits.iter().map(|s| s.revision).collect();
    revisions.sort_unstable();
    revisions.dedup();
    assert_eq!(revisions, vec![1, 2]);

    let today = Utc::now().date_naive();
    let active: Vec<_> = splits
        .iter()
        .filter(|s| s.status == SplitStatus::Active)
        .collect();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].revision, 2);
    assert_eq!(active[0].start_date, Some(today));
}

#[tokio::test]
async fn locked_splits_reject_updates() {
    let (_dir, pool, notifier) = test_db().await;
    let owner = seed_user(&pool, "Owner").await;
    let song = seed_song(&pool, owner, ReleaseStatus::Submitted, None).await;

    revision::create_splits(&pool, &notifier, song, owner, &[entry(owner, "1.0")])
        .await
        .unwrap();

    sqlx::query("UPDATE royalty_splits SET is_locked = 1 WHERE song_id = ?")
        .bind(song)
        .execute(&pool)
        .await
        .unwrap();

    let result =
        revision::update_splits(&pool, &notifier, song, owner, &[entry(owner, "1.0")]).await;
    assert!(matches!(result, Err(Error::InvalidState(_))));
}

#[tokio::test]
async fn bad_rate_sums_are_rejected() {
    let (_dir, pool, notifier) = test_db().await;
    let owner = seed_user(&pool, "Owner").await;
    let song = seed_song(&pool, owner, ReleaseStatus::Submitted, None).await;

    let result =
        revision::create_splits(&pool, &notifier, song, owner, &[entry(owner, "0.8")]).await;
    assert!(matches!(result, Err(Error::InvalidInput(_))));

    // Within the tolerance is fine
    let entries = vec![entry(owner, "0.6667"), entry(owner, "0.3333")];
    assert!(revision::create_splits(&pool, &notifier, song, owner, &entries)
        .await
        .is_ok());
}

#[tokio::test]
async fn stale_invites_expire_and_drop_their_revision() {
    let (_dir, pool, notifier) = test_db().await;
    let owner = seed_user(&pool, "Owner").await;
    let invitee = seed_user(&pool, "Invitee").await;
    let today = Utc::now().date_naive();
    let song = seed_song(&pool, owner, ReleaseStatus::Released, Some(today)).await;

    // Active first revision, stale pending second revision
    splits_db::insert_split(
        &pool,
        song,
        Some(owner),
        rate("1.0"),
        1,
        SplitStatus::Active,
        true,
        None,
    )
    .await
    .unwrap();
    let stale_split = splits_db::insert_split(
        &pool,
        song,
        Some(invitee),
        rate("1.0"),
        2,
        SplitStatus::Pending,
        false,
        Some(today),
    )
    .await
    .unwrap();
    splits_db::insert_invitation(
        &pool,
        stale_split,
        owner,
        Some(invitee),
        Some("stale-token"),
        "Invitee",
        None,
        None,
        InvitationStatus::Pending,
        Some(Utc::now() - Duration::days(40)),
    )
    .await
    .unwrap();

    let expired = invitations::expire_invites(&pool, &notifier, None, 30)
        .await
        .unwrap();
    assert_eq!(expired, 1);

    // The EXPIRED invitation survives the revision delete as an audit
    // record, detached from its split
    let invitation = splits_db::get_invitation_by_token(&pool, "stale-token")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(invitation.status, InvitationStatus::Expired);
    assert_eq!(invitation.split_id, None);

    // Second revision is gone; the active revision is untouched
    let splits = splits_db::get_splits_for_song(&pool, song).await.unwrap();
    assert_eq!(splits.len(), 1);
    assert_eq!(splits[0].revision, 1);
    assert_eq!(splits[0].status, SplitStatus::Active);
}

#[tokio::test]
async fn fresh_invites_survive_the_expiry_sweep() {
    let (_dir, pool, notifier) = test_db().await;
    let owner = seed_user(&pool, "Owner").await;
    let invitee = seed_user(&pool, "Invitee").await;
    let today = Utc::now().date_naive();
    let song = seed_song(&pool, owner, ReleaseStatus::Released, Some(today)).await;

    splits_db::insert_split(
        &pool,
        song,
        Some(owner),
        rate("1.0"),
        1,
        SplitStatus::Active,
        true,
        None,
    )
    .await
    .unwrap();
    let fresh_split = splits_db::insert_split(
        &pool,
        song,
        Some(invitee),
        rate("1.0"),
        2,
        SplitStatus::Pending,
        false,
        Some(today),
    )
    .await
    .unwrap();
    splits_db::insert_invitation(
        &pool,
        fresh_split,
        owner,
        Some(invitee),
        Some("fresh-token"),
        "Invitee",
        None,
        None,
        InvitationStatus::Pending,
        Some(Utc::now() - Duration::days(1)),
    )
    .await
    .unwrap();

    let expired = invitations::expire_invites(&pool, &notifier, None, 30)
        .await
        .unwrap();
    assert_eq!(expired, 0);

    let splits = splits_db::get_splits_for_song(&pool, song).await.unwrap();
    assert_eq!(splits.len(), 2);
}

#[tokio::test]
async fn release_day_sweep_pools_pending_shares_into_the_owner() {
    let (_dir, pool, _notifier) = test_db().await;
    let owner = seed_user(&pool, "Owner").await;
    let confirmed = seed_user(&pool, "Confirmed").await;
    let pending = seed_user(&pool, "Pending").await;
    let today = Utc::now().date_naive();
    let song = seed_song(&pool, owner, ReleaseStatus::Released, Some(today)).await;

    splits_db::insert_split(
        &pool,
        song,
        Some(owner),
        rate("0.4"),
        1,
        SplitStatus::Confirmed,
        true,
        None,
    )
    .await
    .unwrap();
    splits_db::insert_split(
        &pool,
        song,
        Some(confirmed),
        rate("0.3"),
        1,
        SplitStatus::Confirmed,
        false,
        None,
    )
    .await
    .unwrap();
    splits_db::insert_split(
        &pool,
        song,
        Some(pending),
        rate("0.3"),
        1,
        SplitStatus::Pending,
        false,
        None,
    )
    .await
    .unwrap();

    let summary = sweeps::cancel_pending_splits(&pool, None, None).await.unwrap();
    assert_eq!(summary.songs_cancelled, 1);
    assert_eq!(summary.splits_created, 2);

    let splits = splits_db::get_splits_for_song(&pool, song).await.unwrap();
    assert_eq!(splits.len(), 2);
    assert!(splits.iter().all(|s| s.status == SplitStatus::Active));

    let owner_split = splits.iter().find(|s| s.is_owner).unwrap();
    assert_eq!(owner_split.user_id, Some(owner));
    assert_eq!(owner_split.rate, rate("0.7"));

    let kept = splits.iter().find(|s| !s.is_owner).unwrap();
    assert_eq!(kept.user_id, Some(confirmed));
    assert_eq!(kept.rate, rate("0.3"));
}

#[tokio::test]
async fn release_day_sweep_backfills_songs_without_splits() {
    let (_dir, pool, _notifier) = test_db().await;
    let owner = seed_user(&pool, "Owner").await;
    let today = Utc::now().date_naive();
    let song = seed_song(&pool, owner, ReleaseStatus::Released, Some(today)).await;

    let summary = sweeps::cancel_pending_splits(&pool, None, None).await.unwrap();
    assert_eq!(summary.songs_backfilled, 1);

    let splits = splits_db::get_splits_for_song(&pool, song).await.unwrap();
    assert_eq!(splits.len(), 1);
    assert_eq!(splits[0].user_id, Some(owner));
    assert_eq!(splits[0].rate, Decimal::ONE);
    assert_eq!(splits[0].status, SplitStatus::Active);
    assert!(splits[0].is_owner);
}

#[tokio::test]
async fn locked_songs_are_skipped_by_the_sweep() {
    let (_dir, pool, _notifier) = test_db().await;
    let owner = seed_user(&pool, "Owner").await;
    let pending = seed_user(&pool, "Pending").await;
    let today = Utc::now().date_naive();
    let song = seed_song(&pool, owner, ReleaseStatus::Released, Some(today)).await;

    splits_db::insert_split(
        &pool,
        song,
        Some(owner),
        rate("0.5"),
        1,
        SplitStatus::Confirmed,
        true,
        None,
    )
    .await
    .unwrap();
    splits_db::insert_split(
        &pool,
        song,
        Some(pending),
        rate("0.5"),
        1,
        SplitStatus::Pending,
        false,
        None,
    )
    .await
    .unwrap();
    sqlx::query("UPDATE royalty_splits SET is_locked = 1 WHERE song_id = ? AND is_owner = 1")
        .bind(song)
        .execute(&pool)
        .await
        .unwrap();

    let summary = sweeps::cancel_pending_splits(&pool, None, None).await.unwrap();
    assert_eq!(summary.songs_cancelled, 0);

    let splits = splits_db::get_splits_for_song(&pool, song).await.unwrap();
    assert_eq!(splits.len(), 2);
}
