use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use ledgerdesk_types::api::{Claims, MarkReadRequest, SendMessageRequest};

use crate::auth::AppState;
use crate::error::MessagingError;

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    pub limit: Option<u32>,
    /// Cursor: `created_at` of the oldest message of the previous page.
    pub before: Option<DateTime<Utc>>,
}

/// GET /conversations/{id}/messages: newest first. Clients reverse for display.
pub async fn get_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<MessageQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, MessagingError> {
    state.messaging.authorize(conversation_id, claims.sub).await?;
    let messages = state
        .messaging
        .fetch_messages(conversation_id, query.limit, query.before)
        .await?;
    Ok(Json(messages))
}

pub async fn send_message(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, MessagingError> {
    let message = state
        .messaging
        .send_message(conversation_id, claims.sub, &req.content, req.attachments)
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

/// PUT /conversations/{id}/read: move the caller's read marker.
pub async fn mark_read(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<MarkReadRequest>,
) -> Result<impl IntoResponse, MessagingError> {
    state.messaging.authorize(conversation_id, claims.sub).await?;
    state
        .messaging
        .mark_read(conversation_id, claims.sub, req.message_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
