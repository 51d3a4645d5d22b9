use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use uuid::Uuid;

use ledgerdesk_types::api::{Claims, CreateConversationRequest, UnreadResponse};

use crate::auth::AppState;
use crate::error::MessagingError;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    /// Optional search filter over participant names and group titles.
    pub q: Option<String>,
}

/// GET /conversations: all conversations of the caller, newest activity first.
pub async fn list_conversations(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, MessagingError> {
    let conversations = match query.q.as_deref() {
        Some(q) => state.messaging.search_conversations(claims.sub, q).await?,
        None => state.messaging.list_conversations(claims.sub).await?,
    };
    Ok(Json(conversations))
}

pub async fn create_conversation(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateConversationRequest>,
) -> Result<impl IntoResponse, MessagingError> {
    let conversation = state
        .messaging
        .create_conversation(claims.sub, &req.participant_ids, req.is_group, req.title)
        .await?;
    Ok((StatusCode::CREATED, Json(conversation)))
}

pub async fn unread_count(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, MessagingError> {
    state.messaging.authorize(conversation_id, claims.sub).await?;
    let unread = state.messaging.unread_count(conversation_id, claims.sub).await?;
    Ok(Json(UnreadResponse {
        conversation_id,
        unread,
    }))
}

/// GET /stats: messaging KPIs for the dashboard.
pub async fn stats(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, MessagingError> {
    Ok(Json(state.messaging.communication_stats(claims.sub).await?))
}
