//! The signed-in user and everything tied to their token.

use tracing::{debug, info};
use uuid::Uuid;

use ledgerdesk_types::api::AuthResponse;
use ledgerdesk_types::models::{CommunicationStats, Conversation, Message, UserProfile};

use crate::error::{ClientError, Result};
use crate::gateway::{Gateway, ListenerId, ReadPosition};
use crate::http::HttpBackend;
use crate::thread::ThreadState;

struct SignedIn {
    user_id: Uuid,
    token: String,
    profile: UserProfile,
    /// Opened on the first watch.
    gateway: Option<Gateway>,
    listeners: Vec<ListenerId>,
}

/// Explicit application session. Created signed out; `sign_in` or `register`
/// attaches a user, `sign_out` tears down every realtime listener it opened.
pub struct Session {
    http: HttpBackend,
    current: Option<SignedIn>,
}

impl Session {
    pub fn new(http: HttpBackend) -> Self {
        Self { http, current: None }
    }

    pub fn http(&self) -> &HttpBackend {
        &self.http
    }

    pub fn is_signed_in(&self) -> bool {
        self.current.is_some()
    }

    pub fn user_id(&self) -> Result<Uuid> {
        Ok(self.signed_in()?.user_id)
    }

    pub fn token(&self) -> Result<&str> {
        Ok(&self.signed_in()?.token)
    }

    pub fn profile(&self) -> Result<&UserProfile> {
        Ok(&self.signed_in()?.profile)
    }

    /// Log in, then load the profile (the server creates it on first login).
    /// Any previous user is signed out first.
    pub async fn sign_in(&mut self, email: &str, password: &str) -> Result<&UserProfile> {
        let auth = self.http.login(email, password).await?;
        let profile = self.http.my_profile(&auth.token).await?;
        self.attach(auth, profile);
        self.profile()
    }

    pub async fn register(&mut self, email: &str, password: &str, full_name: &str) -> Result<&UserProfile> {
        let auth = self.http.register(email, password, full_name).await?;
        let profile = auth.profile.clone();
        self.attach(auth, profile);
        self.profile()
    }

    pub async fn refresh_profile(&mut self) -> Result<&UserProfile> {
        let token = self.token()?.to_string();
        let profile = self.http.my_profile(&token).await?;
        let current = self.signed_in_mut()?;
        current.profile = profile;
        Ok(&current.profile)
    }

    /// Cancel every listener, close the gateway and forget the token.
    /// Returns false if nobody was signed in.
    pub fn sign_out(&mut self) -> bool {
        let Some(current) = self.current.take() else {
            return false;
        };

        if let Some(gateway) = current.gateway {
            for listener in &current.listeners {
                gateway.unsubscribe(*listener);
            }
            gateway.close();
        }
        info!("Signed out {}", current.user_id);
        true
    }

    fn attach(&mut self, auth: AuthResponse, profile: UserProfile) {
        self.sign_out();
        info!("Signed in as {} ({})", profile.email, auth.user_id);
        self.current = Some(SignedIn {
            user_id: auth.user_id,
            token: auth.token,
            profile,
            gateway: None,
            listeners: Vec::new(),
        });
    }

    fn signed_in(&self) -> Result<&SignedIn> {
        self.current.as_ref().ok_or(ClientError::NotSignedIn)
    }

    fn signed_in_mut(&mut self) -> Result<&mut SignedIn> {
        self.current.as_mut().ok_or(ClientError::NotSignedIn)
    }

    // -- Realtime --

    /// The signed-in user's gateway, opened (or reopened) on demand. Listeners
    /// and hooks belong to one connection and are lost when it is replaced.
    async fn gateway(&mut self) -> Result<&Gateway> {
        let url = self.http.gateway_url(self.token()?);
        let current = self.signed_in_mut()?;

        let reconnect = current.gateway.as_ref().is_none_or(|g| !g.is_connected());
        if reconnect {
            debug!("Opening gateway for {}", current.user_id);
            current.gateway = Some(Gateway::connect(&url).await?);
            current.listeners.clear();
        }
        current.gateway.as_ref().ok_or(ClientError::NotSignedIn)
    }

    /// Deliver new messages in `conversation_id` to `callback` until
    /// [`Session::unwatch`] or sign-out.
    pub async fn watch<F>(&mut self, conversation_id: Uuid, callback: F) -> Result<ListenerId>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        let listener = self.gateway().await?.subscribe(conversation_id, callback).await?;
        self.signed_in_mut()?.listeners.push(listener);
        Ok(listener)
    }

    /// Read receipts from conversations being watched.
    pub async fn on_read_position<F>(&mut self, hook: F) -> Result<()>
    where
        F: Fn(ReadPosition) + Send + Sync + 'static,
    {
        self.gateway().await?.on_read_position(hook);
        Ok(())
    }

    /// Conversations other users start with this user.
    pub async fn on_conversation_created<F>(&mut self, hook: F) -> Result<()>
    where
        F: Fn(Uuid) + Send + Sync + 'static,
    {
        self.gateway().await?.on_conversation_created(hook);
        Ok(())
    }

    pub fn unwatch(&mut self, listener: ListenerId) {
        let Some(current) = self.current.as_mut() else {
            return;
        };
        current.listeners.retain(|l| *l != listener);
        if let Some(gateway) = &current.gateway {
            gateway.unsubscribe(listener);
        }
    }

    pub fn active_watches(&self) -> usize {
        self.current.as_ref().map_or(0, |c| c.listeners.len())
    }

    // -- REST passthroughs --

    pub async fn conversations(&self) -> Result<Vec<Conversation>> {
        self.http.list_conversations(self.token()?).await
    }

    pub async fn search(&self, query: &str) -> Result<Vec<Conversation>> {
        self.http.search_conversations(self.token()?, query).await
    }

    pub async fn start_conversation(&self, other_user_id: Uuid) -> Result<Conversation> {
        self.http
            .create_conversation(self.token()?, vec![other_user_id], false, None)
            .await
    }

    pub async fn stats(&self) -> Result<CommunicationStats> {
        self.http.communication_stats(self.token()?).await
    }

    // -- Thread helpers --

    /// Load the newest page of a conversation into a fresh [`ThreadState`],
    /// picking up the caller's read pointer.
    pub async fn open_thread(&self, conversation: &Conversation, limit: Option<u32>) -> Result<ThreadState> {
        let user_id = self.user_id()?;
        let page = self
            .http
            .fetch_messages(self.token()?, conversation.id, limit, None)
            .await?;

        let mut thread = ThreadState::new(conversation.id);
        thread.load(page);
        thread.set_last_read(
            conversation
                .participant(user_id)
                .and_then(|p| p.last_read_message_id),
        );
        Ok(thread)
    }

    /// Optimistic send: the entry shows as pending, then is confirmed with the
    /// stored message or rolled back if the server rejects it.
    pub async fn send_in_thread(&self, thread: &mut ThreadState, content: &str) -> Result<Message> {
        let user_id = self.user_id()?;
        let temp_id = thread.begin_send(user_id, content);

        match self
            .http
            .send_message(self.token()?, thread.conversation_id(), content, Vec::new())
            .await
        {
            Ok(message) => {
                thread.confirm(temp_id, message.clone());
                Ok(message)
            }
            Err(e) => {
                thread.reject(temp_id);
                Err(e)
            }
        }
    }

    /// Move the read pointer to the newest message from someone else, if any.
    pub async fn mark_thread_read(&self, thread: &mut ThreadState) -> Result<Option<Uuid>> {
        let user_id = self.user_id()?;
        let Some(message_id) = thread.latest_unread_from_others(user_id) else {
            return Ok(None);
        };

        self.http
            .mark_read(self.token()?, thread.conversation_id(), message_id)
            .await?;
        thread.set_last_read(Some(message_id));
        Ok(Some(message_id))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.sign_out();
    }
}
