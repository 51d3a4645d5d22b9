pub mod auth;
pub mod conversations;
pub mod error;
pub mod gateway;
pub mod messages;
pub mod messaging;
pub mod middleware;
pub mod profiles;

use axum::{
    Router, middleware as axum_middleware,
    routing::{get, post, put},
};

pub use auth::{AppState, AppStateInner};
pub use error::MessagingError;
pub use messaging::Messaging;

/// All HTTP and WebSocket routes. Cross-cutting layers (CORS, tracing) are
/// added by the binary.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/health", get(health))
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .route("/gateway", get(gateway::ws_upgrade));

    let protected_routes = Router::new()
        .route("/profiles/me", get(profiles::get_me))
        .route("/profiles/{user_id}", get(profiles::get_profile))
        .route(
            "/conversations",
            get(conversations::list_conversations).post(conversations::create_conversation),
        )
        .route(
            "/conversations/{conversation_id}/messages",
            get(messages::get_messages).post(messages::send_message),
        )
        .route("/conversations/{conversation_id}/read", put(messages::mark_read))
        .route("/conversations/{conversation_id}/unread", get(conversations::unread_count))
        .route("/stats", get(conversations::stats))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::require_auth,
        ));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}
