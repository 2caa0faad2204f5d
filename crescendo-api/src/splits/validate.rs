//! Split integrity validator
//!
//! Runs named checks over every revision of a song's splits and reports
//! failures. It never auto-corrects: a failing song needs manual review
//! because royalties may already have been paid against the bad data.

use crate::db::splits::{self as db, SplitWithRelease};
use crate::Result;
use chrono::{Duration, Utc};
use crescendo_common::db::models::SplitStatus;
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Check {
    InvalidRate,
    OwnerIsNotMainPrimaryArtist,
    NoActiveRevision,
    IncorrectTimeseries,
    IncorrectStatuses,
    MultipleIsOwner,
    SameUserSplit,
    IncorrectRevisionOrder,
}

impl Check {
    pub const ALL: [Check; 8] = [
        Check::InvalidRate,
        Check::OwnerIsNotMainPrimaryArtist,
        Check::NoActiveRevision,
        Check::IncorrectTimeseries,
        Check::IncorrectStatuses,
        Check::MultipleIsOwner,
        Check::SameUserSplit,
        Check::IncorrectRevisionOrder,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Check::InvalidRate => "INVALID_RATE",
            Check::OwnerIsNotMainPrimaryArtist => "OWNER_IS_NOT_MAIN_PRIMARY_ARTIST",
            Check::NoActiveRevision => "NO_ACTIVE_REVISION",
            Check::IncorrectTimeseries => "INCORRECT_TIMESERIES",
            Check::IncorrectStatuses => "INCORRECT_STATUSES",
            Check::MultipleIsOwner => "MULTIPLE_IS_OWNER",
            Check::SameUserSplit => "SAME_USER_SPLIT",
            Check::IncorrectRevisionOrder => "INCORRECT_REVISION_ORDER",
        }
    }

    fn run(self, data: &[SplitWithRelease]) -> bool {
        match self {
            Check::InvalidRate => revision_rate_is_valid(data),
            Check::OwnerIsNotMainPrimaryArtist => is_owner_is_release_owner(data),
            Check::NoActiveRevision => has_active_revision_for_released_release(data),
            Check::IncorrectTimeseries => has_correct_timeseries(data),
            Check::IncorrectStatuses => has_correct_statuses(data),
            Check::MultipleIsOwner => does_not_have_multiple_is_owner(data),
            Check::SameUserSplit => does_not_have_multiple_splits_for_same_user(data),
            Check::IncorrectRevisionOrder => revision_order_is_correct(data),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Failure {
    pub check: Check,
    pub song_id: i64,
    pub release_id: i64,
}

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub songs_checked: usize,
    pub failures: Vec<Failure>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Failures grouped by check name, for the CLI's JSON output
    pub fn summary(&self) -> BTreeMap<&'static str, Vec<String>> {
        let mut out = BTreeMap::new();
        for f in &self.failures {
            out.entry(f.check.as_str())
                .or_insert_with(Vec::new)
                .push(format!("song_id: {}, release_id: {}", f.song_id, f.release_id));
        }
        out
    }
}

/// Run every check against the given songs' splits
pub async fn validate_splits_for_songs(
    db: &SqlitePool,
    song_ids: &[i64],
    log_errors: bool,
) -> Result<ValidationReport> {
    let splits = db::get_splits_with_release(db, song_ids).await?;

    let mut by_song: HashMap<i64, Vec<SplitWithRelease>> = HashMap::new();
    for s in splits {
        by_song.entry(s.split.song_id).or_default().push(s);
    }

    let mut report = ValidationReport {
        songs_checked: by_song.len(),
        ..Default::default()
    };

    let mut song_ids_sorted: Vec<_> = by_song.keys().copied().collect();
    song_ids_sorted.sort_unstable();

    for song_id in song_ids_sorted {
        let data = &by_song[&song_id];
        for check in Check::ALL {
            if !check.run(data) {
                let failure = Failure {
                    check,
                    song_id,
                    release_id: data[0].release_id,
                };

                if log_errors {
                    error!(
                        song_id,
                        release_id = failure.release_id,
                        check = check.as_str(),
                        "Split validation failure"
                    );
                }

                report.failures.push(failure);
            }
        }
    }

    Ok(report)
}

// ============================================================================
// Checks (pure functions over one song's splits)
// ============================================================================

fn rate_epsilon() -> Decimal {
    Decimal::new(1, 4) // 0.0001
}

fn group_by_revision(data: &[SplitWithRelease]) -> BTreeMap<i64, Vec<&SplitWithRelease>> {
    let mut grouped: BTreeMap<i64, Vec<&SplitWithRelease>> = BTreeMap::new();
    for s in data {
        grouped.entry(s.split.revision).or_default().push(s);
    }
    grouped
}

/// Rates across all revisions average to exactly 1.0 per revision
fn revision_rate_is_valid(data: &[SplitWithRelease]) -> bool {
    let combined: Decimal = data.iter().map(|s| s.split.rate).sum();
    let revisions = data
        .iter()
        .map(|s| s.split.revision)
        .collect::<BTreeSet<_>>()
        .len();

    if revisions == 0 {
        return true;
    }

    let per_revision = combined / Decimal::from(revisions as i64);
    (per_revision - Decimal::ONE).abs() <= rate_epsilon()
}

/// `is_owner` marks exactly the release owner's split
fn is_owner_is_release_owner(data: &[SplitWithRelease]) -> bool {
    for s in data {
        let owner = Some(s.release_owner_id);
        if s.split.is_owner && s.split.user_id != owner {
            return false;
        }
        if !s.split.is_owner && s.split.user_id == owner {
            return false;
        }
    }
    true
}

/// Released releases must have a fully ACTIVE latest revision (or
/// next-to-latest, while the latest is still pending confirmation)
fn has_active_revision_for_released_release(data: &[SplitWithRelease]) -> bool {
    let Some(first) = data.first() else {
        return true;
    };

    let released = first.release_status.is_released()
        && matches!(first.release_date, Some(d) if d <= Utc::now().date_naive());
    if !released {
        return true;
    }

    let max_revision = data.iter().map(|s| s.split.revision).max().unwrap_or(0);

    let top_is_pending = data.iter().any(|s| {
        s.split.revision == max_revision
            && matches!(s.split.status, SplitStatus::Pending | SplitStatus::Confirmed)
    });

    let active_revision = if top_is_pending {
        if max_revision == 1 {
            return false;
        }
        max_revision - 1
    } else {
        max_revision
    };

    data.iter()
        .filter(|s| s.split.revision == active_revision)
        .all(|s| s.split.status == SplitStatus::Active)
}

/// Each revision shares one (start, end) pair; the series starts open,
/// ends open, and consecutive revisions chain with start = prev end + 1 day
fn has_correct_timeseries(data: &[SplitWithRelease]) -> bool {
    let revisions: BTreeSet<i64> = data.iter().map(|s| s.split.revision).collect();

    let unique_dates: BTreeSet<(i64, Option<chrono::NaiveDate>, Option<chrono::NaiveDate>)> = data
        .iter()
        .map(|s| (s.split.revision, s.split.start_date, s.split.end_date))
        .collect();

    if unique_dates.len() != revisions.len() {
        return false;
    }

    let series: Vec<_> = unique_dates.into_iter().collect();

    let Some((_, first_start, _)) = series.first() else {
        return true;
    };
    let Some((_, _, last_end)) = series.last() else {
        return true;
    };

    if first_start.is_some() || last_end.is_some() {
        return false;
    }

    for window in series.windows(2) {
        let (_, start, _) = window[1];
        let (_, _, prev_end) = window[0];

        match (start, prev_end) {
            // A freshly pending revision leaves the previous end open
            (_, None) => {}
            (Some(start), Some(prev_end)) => {
                if start - Duration::days(1) != prev_end {
                    return false;
                }
            }
            (None, Some(_)) => return false,
        }
    }

    true
}

// Allowed (previous, current, next) revision-status triples. Pending and
// confirmed normalize to pending before the lookup.
const VALID_REVISION_STATUS_RULES: [(
    Option<SplitStatus>,
    SplitStatus,
    Option<SplitStatus>,
); 10] = [
    (None, SplitStatus::Pending, None),
    (None, SplitStatus::Active, None),
    (None, SplitStatus::Active, Some(SplitStatus::Pending)),
    (None, SplitStatus::Archived, Some(SplitStatus::Active)),
    (None, SplitStatus::Archived, Some(SplitStatus::Archived)),
    (
        Some(SplitStatus::Archived),
        SplitStatus::Archived,
        Some(SplitStatus::Active),
    ),
    (
        Some(SplitStatus::Archived),
        SplitStatus::Active,
        Some(SplitStatus::Pending),
    ),
    (
        Some(SplitStatus::Archived),
        SplitStatus::Archived,
        Some(SplitStatus::Archived),
    ),
    (Some(SplitStatus::Active), SplitStatus::Pending, None),
    (Some(SplitStatus::Archived), SplitStatus::Active, None),
];

/// Single status per revision (pending+confirmed counts as pending) and the
/// per-revision (prev, current, next) triple matches the allowed table
fn has_correct_statuses(data: &[SplitWithRelease]) -> bool {
    let grouped = group_by_revision(data);
    let mut status_by_revision: BTreeMap<i64, SplitStatus> = BTreeMap::new();

    for (revision, splits) in &grouped {
        let statuses: BTreeSet<SplitStatus> = splits.iter().map(|s| s.split.status).collect();

        let normalized = if statuses.len() == 1 {
            *statuses.iter().next().unwrap_or(&SplitStatus::Pending)
        } else if statuses
            == BTreeSet::from([SplitStatus::Pending, SplitStatus::Confirmed])
        {
            SplitStatus::Pending
        } else {
            return false;
        };

        status_by_revision.insert(*revision, normalized);
    }

    if !status_by_revision.contains_key(&1) {
        return false;
    }

    // The triple lookup assumes consecutive numbering; gaps are invalid
    let revisions: Vec<i64> = status_by_revision.keys().copied().collect();
    if revisions != (1..=revisions.len() as i64).collect::<Vec<_>>() {
        return false;
    }

    let last = revisions.len() as i64;

    for (&revision, &status) in &status_by_revision {
        let previous = if revision > 1 {
            status_by_revision.get(&(revision - 1)).copied()
        } else {
            None
        };
        let next = if revision < last {
            status_by_revision.get(&(revision + 1)).copied()
        } else {
            None
        };

        if !VALID_REVISION_STATUS_RULES.contains(&(previous, status, next)) {
            return false;
        }
    }

    true
}

fn does_not_have_multiple_is_owner(data: &[SplitWithRelease]) -> bool {
    group_by_revision(data)
        .values()
        .all(|splits| splits.iter().filter(|s| s.split.is_owner).count() <= 1)
}

fn does_not_have_multiple_splits_for_same_user(data: &[SplitWithRelease]) -> bool {
    for splits in group_by_revision(data).values() {
        let users: Vec<i64> = splits.iter().filter_map(|s| s.split.user_id).collect();
        let distinct: BTreeSet<i64> = users.iter().copied().collect();
        if users.len() != distinct.len() {
            return false;
        }
    }
    true
}

fn revision_order_is_correct(data: &[SplitWithRelease]) -> bool {
    let revisions: Vec<i64> = data
        .iter()
        .map(|s| s.split.revision)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    match revisions.first() {
        Some(1) => revisions == (1..=revisions.len() as i64).collect::<Vec<_>>(),
        _ => false,
    }
}
