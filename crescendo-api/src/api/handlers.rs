//! HTTP request handlers

use crate::api::server::AppContext;
use crate::db::splits as splits_db;
use crate::error::Error;
use crate::splits::{invitations, revision, SplitEntry};
use crate::subscriptions::apple;
use crate::subscriptions::apple::receipt::AppleNotification;
use crate::subscriptions::google::{processor, GoogleNotification, ProcessingResult};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use base64::Engine as _;
use crescendo_common::db::models::{InvitationStatus, SplitStatus};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: String,
    module: String,
    version: String,
}

#[derive(Debug, Serialize)]
pub struct SplitInfo {
    id: i64,
    user_id: Option<i64>,
    rate: Decimal,
    revision: i64,
    status: SplitStatus,
    is_owner: bool,
    invitation_status: Option<InvitationStatus>,
    invitee_name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SplitsResponse {
    song_id: i64,
    splits: Vec<SplitInfo>,
}

#[derive(Debug, Deserialize)]
pub struct PutSplitsRequest {
    /// The user performing the edit; becomes the inviter on new invites
    pub user_id: i64,
    pub splits: Vec<SplitEntry>,
}

#[derive(Debug, Serialize)]
pub struct PutSplitsResponse {
    song_id: i64,
    revision: i64,
}

#[derive(Debug, Deserialize)]
pub struct ConfirmRequest {
    pub token: String,
    pub user_id: i64,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    error: String,
}

fn error_response(message: impl Into<String>) -> Json<ErrorResponse> {
    Json(ErrorResponse {
        error: message.into(),
    })
}

/// Error to HTTP status for the user-facing split endpoints
fn split_error_status(e: &Error) -> StatusCode {
    match e {
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::InvalidInput(_) | Error::InvalidState(_) | Error::MalformedPayload(_) => {
            StatusCode::BAD_REQUEST
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Error to HTTP status for webhook endpoints. 404 asks the provider to
/// retry later (out-of-order delivery); infrastructure failures are 500 so
/// the provider retries those too; everything else is a payload problem.
fn webhook_error_status(e: &Error) -> StatusCode {
    match e {
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Database(_) | Error::Io(_) | Error::Common(_) | Error::Upstream(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        _ => StatusCode::BAD_REQUEST,
    }
}

// ============================================================================
// Handlers
// ============================================================================

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        module: "crescendo-api".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

pub async fn get_splits(
    State(ctx): State<AppContext>,
    Path(song_id): Path<i64>,
) -> Result<Json<SplitsResponse>, (StatusCode, Json<ErrorResponse>)> {
    let splits = splits_db::get_splits_for_song(&ctx.db, song_id)
        .await
        .map_err(|e| (split_error_status(&e), error_response(e.to_string())))?;

    if splits.is_empty() {
        return Err((
            StatusCode::NOT_FOUND,
            error_response(format!("no splits for song {}", song_id)),
        ));
    }

    let mut infos = Vec::with_capacity(splits.len());
    for split in splits {
        let invitation = splits_db::get_invitation_for_split(&ctx.db, split.id)
            .await
            .map_err(|e| (split_error_status(&e), error_response(e.to_string())))?;

        infos.push(SplitInfo {
            id: split.id,
            user_id: split.user_id,
            rate: split.rate,
            revision: split.revision,
            status: split.status,
            is_owner: split.is_owner,
            invitation_status: invitation.as_ref().map(|i| i.status),
            invitee_name: invitation.map(|i| i.name),
        });
    }

    Ok(Json(SplitsResponse {
        song_id,
        splits: infos,
    }))
}

pub async fn put_splits(
    State(ctx): State<AppContext>,
    Path(song_id): Path<i64>,
    Json(request): Json<PutSplitsRequest>,
) -> Result<Json<PutSplitsResponse>, (StatusCode, Json<ErrorResponse>)> {
    let has_splits = splits_db::max_revision(&ctx.db, song_id)
        .await
        .map_err(|e| (split_error_status(&e), error_response(e.to_string())))?
        > 0;

    let result = if has_splits {
        revision::update_splits(
            &ctx.db,
            &ctx.notifier,
            song_id,
            request.user_id,
            &request.splits,
        )
        .await
    } else {
        revision::create_splits(
            &ctx.db,
            &ctx.notifier,
            song_id,
            request.user_id,
            &request.splits,
        )
        .await
    };

    match result {
        Ok(revision) => {
            info!(song_id, revision, "Splits replaced");
            Ok(Json(PutSplitsResponse { song_id, revision }))
        }
        Err(e) => {
            warn!(song_id, error = %e, "Split update rejected");
            Err((split_error_status(&e), error_response(e.to_string())))
        }
    }
}

pub async fn confirm_invitation(
    State(ctx): State<AppContext>,
    Json(request): Json<ConfirmRequest>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    match invitations::confirm_invitation(
        &ctx.db,
        &request.token,
        request.user_id,
        ctx.config.invite_expiration_days,
    )
    .await
    {
        Ok(()) => Ok(StatusCode::ACCEPTED),
        Err(e) => {
            warn!(error = %e, "Invitation confirm rejected");
            Err((split_error_status(&e), error_response(e.to_string())))
        }
    }
}

pub async fn apple_webhook(
    State(ctx): State<AppContext>,
    Json(notification): Json<AppleNotification>,
) -> StatusCode {
    let correlation_id = Uuid::new_v4();

    match apple::process_notification(&ctx.db, &ctx.config, &ctx.http, &notification).await {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            let status = webhook_error_status(&e);
            error!(
                %correlation_id,
                notification_type = %notification.notification_type,
                error = %e,
                "Apple notification failed"
            );
            status
        }
    }
}

/// Accepts either the raw notification body or a Pub/Sub push envelope
/// with the notification base64-encoded in `message.data`
#[derive(Debug, Deserialize)]
pub struct PubSubEnvelope {
    message: PubSubMessage,
}

#[derive(Debug, Deserialize)]
struct PubSubMessage {
    data: String,
}

fn decode_google_body(body: &serde_json::Value) -> Result<GoogleNotification, Error> {
    if let Ok(envelope) = serde_json::from_value::<PubSubEnvelope>(body.clone()) {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(&envelope.message.data)
            .map_err(|e| Error::MalformedPayload(format!("bad base64 data: {}", e)))?;

        return serde_json::from_slice(&decoded)
            .map_err(|e| Error::MalformedPayload(format!("bad notification json: {}", e)));
    }

    serde_json::from_value(body.clone())
        .map_err(|e| Error::MalformedPayload(format!("bad notification body: {}", e)))
}

pub async fn google_webhook(
    State(ctx): State<AppContext>,
    Json(body): Json<serde_json::Value>,
) -> StatusCode {
    let event_id = Uuid::new_v4().simple().to_string();

    let notification = match decode_google_body(&body) {
        Ok(n) => n,
        Err(e) => {
            warn!(event_id, error = %e, "Malformed Google notification");
            return StatusCode::BAD_REQUEST;
        }
    };

    match processor::process(&ctx.db, &ctx.verifier, &event_id, &notification).await {
        Ok(ProcessingResult::Success) => StatusCode::OK,
        Ok(ProcessingResult::Fail) => StatusCode::INTERNAL_SERVER_ERROR,
        Err(e) => {
            error!(event_id, error = %e, "Google notification failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
