use std::sync::Arc;

use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use jsonwebtoken::{EncodingKey, Header, encode};
use tracing::{error, info};
use uuid::Uuid;

use ledgerdesk_types::api::{AuthResponse, Claims, LoginRequest, RegisterRequest};

use crate::messaging::Messaging;

/// Token lifetime.
const TOKEN_TTL_DAYS: i64 = 30;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub messaging: Messaging,
    pub jwt_secret: String,
}

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    // Validate input
    let email = req.email.trim().to_lowercase();
    if email.len() < 3 || email.len() > 254 || !email.contains('@') {
        return Err(StatusCode::BAD_REQUEST);
    }
    if req.password.len() < 8 {
        return Err(StatusCode::BAD_REQUEST);
    }
    let full_name = req.full_name.trim().to_string();
    if full_name.is_empty() || full_name.chars().count() > 100 {
        return Err(StatusCode::BAD_REQUEST);
    }

    let db = state.messaging.db().clone();

    // Check if email is taken
    let lookup = email.clone();
    if tokio::task::spawn_blocking({
        let db = db.clone();
        move || db.get_user_by_email(&lookup)
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
    .is_some()
    {
        return Err(StatusCode::CONFLICT);
    }

    // Hash password with Argon2id
    let salt = SaltString::generate(&mut OsRng);
    let password_hash = Argon2::default()
        .hash_password(req.password.as_bytes(), &salt)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .to_string();

    let user_id = Uuid::new_v4();

    let (uid, em, name) = (user_id.to_string(), email.clone(), full_name.clone());
    tokio::task::spawn_blocking(move || db.create_user(&uid, &em, &password_hash, &name))
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .map_err(|e| {
            // A concurrent registration can still hit the UNIQUE constraint.
            error!("create_user failed for {}: {}", email, e);
            StatusCode::CONFLICT
        })?;

    let profile = state
        .messaging
        .get_user_profile(user_id)
        .await
        .map_err(|e| e.status())?;

    let token = create_token(&state.jwt_secret, user_id, &email)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    info!("Registered {} ({})", email, user_id);

    Ok((
        StatusCode::CREATED,
        Json(AuthResponse {
            user_id,
            token,
            profile,
        }),
    ))
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let email = req.email.trim().to_lowercase();
    let db = state.messaging.db().clone();
    let lookup = email.clone();
    let user = tokio::task::spawn_blocking(move || db.get_user_by_email(&lookup))
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::UNAUTHORIZED)?;

    // Verify password
    let parsed_hash =
        PasswordHash::new(&user.password).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Argon2::default()
        .verify_password(req.password.as_bytes(), &parsed_hash)
        .map_err(|_| StatusCode::UNAUTHORIZED)?;

    let user_id: Uuid = user.id.parse().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    // `create_user` writes both rows, so a missing profile means the user row
    // was inserted outside the API. Give it a blank-named one instead of failing.
    let profile = state
        .messaging
        .ensure_profile(user_id, &user.email, "")
        .await
        .map_err(|e| e.status())?;

    let token = create_token(&state.jwt_secret, user_id, &user.email)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(Json(AuthResponse {
        user_id,
        token,
        profile,
    }))
}

pub fn create_token(secret: &str, user_id: Uuid, username: &str) -> anyhow::Result<String> {
    let claims = Claims {
        sub: user_id,
        username: username.to_string(),
        exp: (chrono::Utc::now() + chrono::Duration::days(TOKEN_TTL_DAYS)).timestamp() as usize,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;

    Ok(token)
}
