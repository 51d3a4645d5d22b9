use axum::{
    Extension, Json,
    extract::{Path, State},
    response::IntoResponse,
};
use uuid::Uuid;

use ledgerdesk_types::api::Claims;

use crate::auth::AppState;
use crate::error::MessagingError;

pub async fn get_me(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, MessagingError> {
    Ok(Json(state.messaging.get_user_profile(claims.sub).await?))
}

pub async fn get_profile(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Extension(_claims): Extension<Claims>,
) -> Result<impl IntoResponse, MessagingError> {
    Ok(Json(state.messaging.get_user_profile(user_id).await?))
}
