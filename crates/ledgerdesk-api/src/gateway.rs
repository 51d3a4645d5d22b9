//! WebSocket gateway: pushes realtime changes to browser clients.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::{
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{info, trace, warn};
use uuid::Uuid;

use ledgerdesk_realtime::Subscription;
use ledgerdesk_types::api::Claims;
use ledgerdesk_types::events::{Change, GatewayCommand, GatewayEvent, Topic};

use crate::auth::AppState;
use crate::messaging::Messaging;
use crate::middleware::verify_token;

/// Server sends a Ping every 15 seconds; two missed Pongs drop the connection.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
pub struct GatewayQuery {
    /// Browsers cannot set headers on a WebSocket handshake, so the bearer
    /// token travels in the query string.
    pub token: String,
}

/// GET /gateway?token=...: validates the token before upgrading.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<GatewayQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(claims) = verify_token(&state.jwt_secret, &query.token) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };

    let messaging = state.messaging.clone();
    ws.on_upgrade(move |socket| handle_connection(socket, messaging, claims))
}

/// Per-connection conversation subscriptions. Dropping an entry cancels it.
struct ConversationWatch {
    _messages: Subscription,
    _reads: Subscription,
}

async fn handle_connection(socket: WebSocket, messaging: Messaging, claims: Claims) {
    let user_id = claims.sub;
    let username = claims.username;
    let (mut sender, mut receiver) = socket.split();

    info!("{} ({}) connected to gateway", username, user_id);

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<GatewayEvent>();
    let _ = out_tx.send(GatewayEvent::Ready {
        user_id,
        username: username.clone(),
    });

    // New conversations that include this user.
    let directory_tx = out_tx.clone();
    let directory = messaging.subscribe_to_directory(user_id, move |conversation_id| {
        let _ = directory_tx.send(GatewayEvent::ConversationCreate { conversation_id });
    });

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward queued events -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                event = out_rx.recv() => {
                    let Some(event) = event else { break };
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Failed to encode gateway event: {}", e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from client
    let username_recv = username.clone();
    let mut recv_task = tokio::spawn(async move {
        let mut watches: HashMap<Uuid, ConversationWatch> = HashMap::new();

        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => {
                        handle_command(&messaging, user_id, cmd, &mut watches, &out_tx).await;
                    }
                    Err(e) => {
                        warn!(
                            "{} ({}) bad command: {} -- raw: {}",
                            username_recv,
                            user_id,
                            e,
                            text.chars().take(200).collect::<String>()
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    directory.cancel();
    info!("{} ({}) disconnected from gateway", username, user_id);
}

async fn handle_command(
    messaging: &Messaging,
    user_id: Uuid,
    cmd: GatewayCommand,
    watches: &mut HashMap<Uuid, ConversationWatch>,
    out: &mpsc::UnboundedSender<GatewayEvent>,
) {
    match cmd {
        GatewayCommand::Subscribe { conversation_ids } => {
            for conversation_id in conversation_ids {
                if watches.contains_key(&conversation_id) {
                    continue;
                }
                if let Err(e) = messaging.authorize(conversation_id, user_id).await {
                    trace!("{} may not watch {}: {}", user_id, conversation_id, e);
                    let _ = out.send(GatewayEvent::Error {
                        reason: format!("cannot subscribe to {}: {}", conversation_id, e),
                    });
                    continue;
                }
                watches.insert(conversation_id, watch_conversation(messaging, conversation_id, out));
            }
            info!("{} watching {} conversations", user_id, watches.len());
            let _ = out.send(GatewayEvent::Subscribed {
                conversation_ids: watches.keys().copied().collect(),
            });
        }

        GatewayCommand::Unsubscribe { conversation_ids } => {
            for conversation_id in &conversation_ids {
                watches.remove(conversation_id);
            }
            let _ = out.send(GatewayEvent::Subscribed {
                conversation_ids: watches.keys().copied().collect(),
            });
        }
    }
}

fn watch_conversation(
    messaging: &Messaging,
    conversation_id: Uuid,
    out: &mpsc::UnboundedSender<GatewayEvent>,
) -> ConversationWatch {
    let message_tx = out.clone();
    let messages = messaging.subscribe_to_messages(conversation_id, move |message| {
        let _ = message_tx.send(GatewayEvent::MessageCreate { message });
    });

    let read_tx = out.clone();
    let reads = messaging.feed().register(
        Topic::Conversation(conversation_id),
        |change| matches!(change, Change::ReadPositionUpdated { .. }),
        move |change| {
            let read_tx = read_tx.clone();
            async move {
                if let Change::ReadPositionUpdated {
                    conversation_id,
                    user_id,
                    message_id,
                } = change
                {
                    let _ = read_tx.send(GatewayEvent::ReadPositionUpdate {
                        conversation_id,
                        user_id,
                        message_id,
                    });
                }
            }
        },
    );

    ConversationWatch {
        _messages: messages,
        _reads: reads,
    }
}
