//! Realtime gateway connection: routes pushed messages to per-conversation
//! listeners, plus read receipts and new-conversation notices to hooks.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tracing::{debug, info, warn};
use uuid::Uuid;

use ledgerdesk_types::events::{GatewayCommand, GatewayEvent};
use ledgerdesk_types::models::Message;

use crate::error::{ClientError, Result};

/// Handle for one listener registered with [`Gateway::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// A participant moved their read pointer in a subscribed conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadPosition {
    pub conversation_id: Uuid,
    pub user_id: Uuid,
    pub message_id: Uuid,
}

type Callback = Arc<dyn Fn(Message) + Send + Sync>;
type ReadHook = Arc<dyn Fn(ReadPosition) + Send + Sync>;
type DirectoryHook = Arc<dyn Fn(Uuid) + Send + Sync>;

struct Listener {
    conversation_id: Uuid,
    callback: Callback,
}

#[derive(Default)]
struct Registry {
    listeners: HashMap<u64, Listener>,
    /// Conversations whose `Subscribe` is still unanswered, with the later
    /// listeners waiting on the same answer.
    pending: HashMap<Uuid, Vec<oneshot::Sender<bool>>>,
}

#[derive(Default)]
struct Hooks {
    read_position: Option<ReadHook>,
    conversation_created: Option<DirectoryHook>,
}

#[derive(Default)]
struct Shared {
    registry: Mutex<Registry>,
    /// One entry per command in flight; the server answers each with `Subscribed`.
    acks: Mutex<VecDeque<oneshot::Sender<Vec<Uuid>>>>,
    hooks: Mutex<Hooks>,
}

impl Shared {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn acks(&self) -> MutexGuard<'_, VecDeque<oneshot::Sender<Vec<Uuid>>>> {
        self.acks.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn hooks(&self) -> MutexGuard<'_, Hooks> {
        self.hooks.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Settle an in-flight subscription. On refusal every listener for the
    /// conversation is dropped; waiters learn the outcome either way.
    fn settle(&self, conversation_id: Uuid, accepted: bool) {
        let waiters = {
            let mut registry = self.registry();
            if !accepted {
                registry
                    .listeners
                    .retain(|_, l| l.conversation_id != conversation_id);
            }
            registry.pending.remove(&conversation_id).unwrap_or_default()
        };
        for waiter in waiters {
            let _ = waiter.send(accepted);
        }
    }

    fn dispatch(&self, event: GatewayEvent) {
        match event {
            GatewayEvent::MessageCreate { message } => {
                let callbacks: Vec<Callback> = self
                    .registry()
                    .listeners
                    .values()
                    .filter(|l| l.conversation_id == message.conversation_id)
                    .map(|l| l.callback.clone())
                    .collect();
                for callback in callbacks {
                    callback(message.clone());
                }
            }
            GatewayEvent::ReadPositionUpdate {
                conversation_id,
                user_id,
                message_id,
            } => {
                let hook = self.hooks().read_position.clone();
                if let Some(hook) = hook {
                    hook(ReadPosition {
                        conversation_id,
                        user_id,
                        message_id,
                    });
                }
            }
            GatewayEvent::ConversationCreate { conversation_id } => {
                let hook = self.hooks().conversation_created.clone();
                if let Some(hook) = hook {
                    hook(conversation_id);
                }
            }
            GatewayEvent::Subscribed { conversation_ids } => {
                if let Some(ack) = self.acks().pop_front() {
                    let _ = ack.send(conversation_ids);
                }
            }
            GatewayEvent::Ready { user_id, username } => {
                info!("Gateway ready for {} ({})", username, user_id);
            }
            GatewayEvent::Error { reason } => warn!("Gateway error: {}", reason),
        }
    }
}

/// Settles a pending subscription as refused if the subscribing future is
/// dropped before the server answers.
struct PendingGuard<'a> {
    shared: &'a Shared,
    conversation_id: Uuid,
    armed: bool,
}

impl PendingGuard<'_> {
    fn finish(mut self, accepted: bool) {
        self.armed = false;
        self.shared.settle(self.conversation_id, accepted);
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.settle(self.conversation_id, false);
        }
    }
}

enum Admission {
    /// Already confirmed by the server.
    Active,
    /// This call sends the `Subscribe`.
    First,
    /// Another call's `Subscribe` is in flight.
    Waiting(oneshot::Receiver<bool>),
}

/// A live gateway connection. Dropping it closes the socket.
pub struct Gateway {
    commands: mpsc::UnboundedSender<GatewayCommand>,
    shared: Arc<Shared>,
    next_id: AtomicU64,
    task: JoinHandle<()>,
}

impl Gateway {
    pub async fn connect(url: &str) -> Result<Self> {
        let (stream, _) = connect_async(url).await?;
        let (mut ws_tx, mut ws_rx) = stream.split();
        let (commands, mut command_rx) = mpsc::unbounded_channel::<GatewayCommand>();
        let shared = Arc::new(Shared::default());
        let dispatch = shared.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    command = command_rx.recv() => {
                        let Some(command) = command else { break };
                        let text = match serde_json::to_string(&command) {
                            Ok(text) => text,
                            Err(e) => {
                                warn!("Failed to encode gateway command: {}", e);
                                continue;
                            }
                        };
                        if ws_tx.send(WsMessage::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    frame = ws_rx.next() => match frame {
                        Some(Ok(WsMessage::Text(text))) => {
                            match serde_json::from_str::<GatewayEvent>(&text) {
                                Ok(event) => dispatch.dispatch(event),
                                Err(e) => warn!("Bad gateway event: {}", e),
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("Gateway read failed: {}", e);
                            break;
                        }
                    },
                }
            }
            // Wake anyone still waiting on an acknowledgement.
            dispatch.acks().clear();
            debug!("Gateway connection closed");
        });

        Ok(Self {
            commands,
            shared,
            next_id: AtomicU64::new(1),
            task,
        })
    }

    pub fn is_connected(&self) -> bool {
        !self.task.is_finished()
    }

    /// Call `callback` for every message created in `conversation_id` from now
    /// on. Resolves once the server has confirmed the subscription; if it
    /// refuses, every listener for that conversation is removed.
    pub async fn subscribe<F>(&self, conversation_id: Uuid, callback: F) -> Result<ListenerId>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let admission = {
            let mut registry = self.shared.registry();
            let admission = if let Some(waiters) = registry.pending.get_mut(&conversation_id) {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                Admission::Waiting(rx)
            } else if registry
                .listeners
                .values()
                .any(|l| l.conversation_id == conversation_id)
            {
                Admission::Active
            } else {
                registry.pending.insert(conversation_id, Vec::new());
                Admission::First
            };
            registry.listeners.insert(
                id,
                Listener {
                    conversation_id,
                    callback: Arc::new(callback),
                },
            );
            admission
        };

        match admission {
            Admission::Active => {}
            Admission::Waiting(rx) => {
                if !rx.await.unwrap_or(false) {
                    self.shared.registry().listeners.remove(&id);
                    return Err(ClientError::Refused(conversation_id));
                }
            }
            Admission::First => {
                let guard = PendingGuard {
                    shared: &self.shared,
                    conversation_id,
                    armed: true,
                };
                let acked = self
                    .command(GatewayCommand::Subscribe {
                        conversation_ids: vec![conversation_id],
                    })
                    .await;
                let accepted = matches!(&acked, Ok(ids) if ids.contains(&conversation_id));
                guard.finish(accepted);
                if !accepted {
                    acked?;
                    return Err(ClientError::Refused(conversation_id));
                }
            }
        }

        Ok(ListenerId(id))
    }

    /// Remove a listener. The server subscription is dropped with the last
    /// listener for that conversation.
    pub fn unsubscribe(&self, listener: ListenerId) {
        let conversation_id = {
            let mut registry = self.shared.registry();
            let Some(removed) = registry.listeners.remove(&listener.0) else {
                return;
            };
            if registry
                .listeners
                .values()
                .any(|l| l.conversation_id == removed.conversation_id)
            {
                return;
            }
            removed.conversation_id
        };

        // Nobody waits on this acknowledgement.
        let (ack_tx, _) = oneshot::channel();
        self.enqueue(
            GatewayCommand::Unsubscribe {
                conversation_ids: vec![conversation_id],
            },
            ack_tx,
        );
    }

    /// Read receipts for subscribed conversations. Replaces any earlier hook.
    pub fn on_read_position<F>(&self, hook: F)
    where
        F: Fn(ReadPosition) + Send + Sync + 'static,
    {
        self.shared.hooks().read_position = Some(Arc::new(hook));
    }

    /// Conversations the signed-in user was just added to. Replaces any
    /// earlier hook.
    pub fn on_conversation_created<F>(&self, hook: F)
    where
        F: Fn(Uuid) + Send + Sync + 'static,
    {
        self.shared.hooks().conversation_created = Some(Arc::new(hook));
    }

    pub fn listener_count(&self) -> usize {
        self.shared.registry().listeners.len()
    }

    /// Drop every listener and hook, then close the connection.
    pub fn close(self) {
        self.shared.registry().listeners.clear();
        *self.shared.hooks() = Hooks::default();
        self.task.abort();
    }

    async fn command(&self, command: GatewayCommand) -> Result<Vec<Uuid>> {
        let (ack_tx, ack_rx) = oneshot::channel();
        if !self.enqueue(command, ack_tx) {
            return Err(ClientError::Gateway(tungstenite::Error::AlreadyClosed));
        }
        ack_rx
            .await
            .map_err(|_| ClientError::Gateway(tungstenite::Error::ConnectionClosed))
    }

    /// Queue the ack and the command under one lock so acks line up with
    /// the server's replies.
    fn enqueue(&self, command: GatewayCommand, ack: oneshot::Sender<Vec<Uuid>>) -> bool {
        let mut acks = self.shared.acks();
        if self.commands.send(command).is_err() {
            return false;
        }
        acks.push_back(ack);
        true
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.task.abort();
    }
}
