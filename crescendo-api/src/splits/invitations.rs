//! Royalty invitation workflow
//!
//! Every PENDING split is backed by one invitation row. The invite carries
//! contact details for holders without an account; the token is only minted
//! when the invite is actually sent, and confirmation is only accepted
//! within the expiry window after the last send.

use crate::db::splits as db;
use crate::notifier::{Notification, NotifierHandle};
use crate::splits::revision::update_splits_state;
use crate::splits::InviteDetails;
use crate::{Error, Result};
use chrono::{Duration, Utc};
use crescendo_common::db::models::{InvitationStatus, RoyaltyInvitation, SplitStatus};
use crescendo_common::token::generate_invite_token;
use sqlx::SqlitePool;
use tracing::info;
use uuid::Uuid;


/// Create the invitation row for a freshly created PENDING split.
///
/// `send` mints a token, stamps `last_sent` and queues the delivery; when
/// false the row stays CREATED with no token (first-revision invites are
/// sent later, together with the release flow).
#[allow(clippy::too_many_arguments)]
pub async fn create_invite(
    db: &SqlitePool,
    notifier: &NotifierHandle,
    song_id: i64,
    inviter_id: i64,
    invitee_id: Option<i64>,
    split_id: i64,
    details: Option<&InviteDetails>,
    send: bool,
) -> Result<i64> {
    let (name, email, phone) = match (invitee_id, details) {
        (_, Some(d)) => (d.name.clone(), d.email.clone(), d.phone.clone()),
        (Some(user_id), None) => {
            let user = crate::db::users::get_user(db, user_id).await?;
            (user.name, user.email, user.phone)
        }
        (None, None) => {
            return Err(Error::InvalidInput(
                "invite needs a user or contact details".into(),
            ))
        }
    };

    let token = if send { Some(generate_invite_token()) } else { None };
    let status = if send {
        InvitationStatus::Pending
    } else {
        InvitationStatus::Created
    };
    let last_sent = if send { Some(Utc::now()) } else { None };

    let invitation_id = db::insert_invitation(
        db,
        split_id,
        inviter_id,
        invitee_id,
        token.as_deref(),
        &name,
        email.as_deref(),
        phone.as_deref(),
        status,
        last_sent,
    )
    .await?;

    if let Some(token) = token {
        notifier.send(Notification::RoyaltyInvite {
            invitation_id,
            song_id,
            name,
            email,
            phone,
            token,
        });
    }

    Ok(invitation_id)
}

fn is_confirmable(invitation: &RoyaltyInvitation, expiration_days: i64) -> bool {
    if invitation.status != InvitationStatus::Pending {
        return false;
    }
    match invitation.last_sent {
        Some(sent) => Utc::now() - sent <= Duration::days(expiration_days),
        None => false,
    }
}

/// Confirm an invitation by token, binding the authenticated user to the
/// split. May cascade into activating the revision when this was the last
/// outstanding confirmation.
pub async fn confirm_invitation(
    db: &SqlitePool,
    token: &str,
    user_id: i64,
    expiration_days: i64,
) -> Result<()> {
    let invitation = db::get_invitation_by_token(db, token)
        .await?
        .ok_or_else(|| Error::InvalidInput("invalid invite token".into()))?;

    if !is_confirmable(&invitation, expiration_days) {
        return Err(Error::InvalidInput("invite is expired or already used".into()));
    }

    let split_id = invitation
        .split_id
        .ok_or_else(|| Error::InvalidInput("invite no longer has a split".into()))?;
    let split = db::get_split(db, split_id).await?;

    if split.status != SplitStatus::Pending {
        return Err(Error::InvalidInput("split is not awaiting confirmation".into()));
    }

    db::set_split_user(db, split.id, user_id).await?;
    db::set_split_status(db, split.id, SplitStatus::Confirmed).await?;
    db::update_invitation_status(db, invitation.id, InvitationStatus::Accepted, Some(user_id))
        .await?;

    info!(
        invitation_id = invitation.id,
        split_id = split.id,
        user_id,
        "Invitation accepted"
    );

    update_splits_state(db, split.song_id, split.revision).await
}

/// Expire stale PENDING invitations and drop their never-confirmed
/// revisions. Only touches the latest (>1) revision of released songs;
/// the first revision is handled by the pending-split sweep instead.
pub async fn expire_invites(
    db: &SqlitePool,
    notifier: &NotifierHandle,
    release_ids: Option<&[i64]>,
    expiration_days: i64,
) -> Result<usize> {
    let job_id = Uuid::new_v4().simple().to_string();
    let cutoff = Utc::now() - Duration::days(expiration_days);

    let invitations = db::expirable_invitations(db, cutoff).await?;
    let mut expired = 0;

    for invitation in invitations {
        let Some(split_id) = invitation.split_id else {
            continue;
        };
        let split = db::get_split(db, split_id).await?;

        if let Some(ids) = release_ids {
            let release_id = db::release_id_for_song(db, split.song_id).await?;
            if !ids.contains(&release_id) {
                continue;
            }
        }

        let revision_splits: Vec<_> = db::get_splits_for_song(db, split.song_id)
            .await?
            .into_iter()
            .filter(|s| s.revision == split.revision)
            .collect();

        info!(
            job_id = %job_id,
            inviter_id = invitation.inviter_id,
            song_id = split.song_id,
            revision = split.revision,
            deleted_split_ids = ?revision_splits.iter().map(|s| s.id).collect::<Vec<_>>(),
            "Expired inactive splits processed"
        );

        for s in &revision_splits {
            info!(
                job_id = %job_id,
                split_id = s.id,
                rate = %s.rate,
                status = ?s.status,
                song_id = s.song_id,
                user_id = ?s.user_id,
                revision = s.revision,
                is_owner = s.is_owner,
                is_locked = s.is_locked,
                "Deleted split details"
            );
        }

        db::update_invitation_status(db, invitation.id, InvitationStatus::Expired, None).await?;
        db::delete_revision(db, split.song_id, split.revision).await?;

        let song_name = db::song_name(db, split.song_id).await?;
        notifier.send(Notification::SplitInvitesExpired {
            user_id: invitation.inviter_id,
            song_name,
        });

        expired += 1;
    }

    Ok(expired)
}
