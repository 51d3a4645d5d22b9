//! REST calls against a ledgerdesk server.

use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use ledgerdesk_types::api::{
    AuthResponse, CreateConversationRequest, LoginRequest, MarkReadRequest, RegisterRequest,
    SendMessageRequest, UnreadResponse,
};
use ledgerdesk_types::models::{CommunicationStats, Conversation, Message, NewAttachment, UserProfile};

use crate::error::{ClientError, Result};

/// Stateless wrapper around the REST surface. Authenticated calls take the
/// bearer token explicitly; [`crate::Session`] supplies it.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn register(&self, email: &str, password: &str, full_name: &str) -> Result<AuthResponse> {
        let body = RegisterRequest {
            email: email.to_string(),
            password: password.to_string(),
            full_name: full_name.to_string(),
        };
        send_json(self.client.post(self.url("/auth/register")).json(&body)).await
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<AuthResponse> {
        let body = LoginRequest {
            email: email.to_string(),
            password: password.to_string(),
        };
        send_json(self.client.post(self.url("/auth/login")).json(&body)).await
    }

    pub async fn my_profile(&self, token: &str) -> Result<UserProfile> {
        send_json(self.client.get(self.url("/profiles/me")).bearer_auth(token)).await
    }

    pub async fn profile(&self, token: &str, user_id: Uuid) -> Result<UserProfile> {
        let url = self.url(&format!("/profiles/{}", user_id));
        send_json(self.client.get(url).bearer_auth(token)).await
    }

    pub async fn list_conversations(&self, token: &str) -> Result<Vec<Conversation>> {
        send_json(self.client.get(self.url("/conversations")).bearer_auth(token)).await
    }

    pub async fn search_conversations(&self, token: &str, query: &str) -> Result<Vec<Conversation>> {
        let request = self
            .client
            .get(self.url("/conversations"))
            .query(&[("q", query)])
            .bearer_auth(token);
        send_json(request).await
    }

    pub async fn create_conversation(
        &self,
        token: &str,
        participant_ids: Vec<Uuid>,
        is_group: bool,
        title: Option<String>,
    ) -> Result<Conversation> {
        let body = CreateConversationRequest {
            participant_ids,
            is_group,
            title,
        };
        let request = self.client.post(self.url("/conversations")).json(&body).bearer_auth(token);
        send_json(request).await
    }

    /// Newest first, at most `limit` messages, optionally strictly older than `before`.
    pub async fn fetch_messages(
        &self,
        token: &str,
        conversation_id: Uuid,
        limit: Option<u32>,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>> {
        let mut params: Vec<(&str, String)> = Vec::new();
        if let Some(limit) = limit {
            params.push(("limit", limit.to_string()));
        }
        if let Some(before) = before {
            params.push(("before", before.to_rfc3339_opts(SecondsFormat::Micros, true)));
        }

        let url = self.url(&format!("/conversations/{}/messages", conversation_id));
        send_json(self.client.get(url).query(&params).bearer_auth(token)).await
    }

    pub async fn send_message(
        &self,
        token: &str,
        conversation_id: Uuid,
        content: &str,
        attachments: Vec<NewAttachment>,
    ) -> Result<Message> {
        let body = SendMessageRequest {
            content: content.to_string(),
            attachments,
        };
        let url = self.url(&format!("/conversations/{}/messages", conversation_id));
        send_json(self.client.post(url).json(&body).bearer_auth(token)).await
    }

    pub async fn mark_read(&self, token: &str, conversation_id: Uuid, message_id: Uuid) -> Result<()> {
        let url = self.url(&format!("/conversations/{}/read", conversation_id));
        let request = self
            .client
            .put(url)
            .json(&MarkReadRequest { message_id })
            .bearer_auth(token);
        send(request).await?;
        Ok(())
    }

    pub async fn unread_count(&self, token: &str, conversation_id: Uuid) -> Result<usize> {
        let url = self.url(&format!("/conversations/{}/unread", conversation_id));
        let response: UnreadResponse = send_json(self.client.get(url).bearer_auth(token)).await?;
        Ok(response.unread)
    }

    pub async fn communication_stats(&self, token: &str) -> Result<CommunicationStats> {
        send_json(self.client.get(self.url("/stats")).bearer_auth(token)).await
    }

    /// WebSocket URL of the realtime gateway for `token`.
    pub fn gateway_url(&self, token: &str) -> String {
        let ws_base = self
            .base_url
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        format!("{}/gateway?token={}", ws_base, token)
    }
}

async fn send(request: RequestBuilder) -> Result<Response> {
    let response = request.send().await?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    // Error bodies are `{"error": ".."}` from the service layer, empty from auth.
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&text)
        .ok()
        .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
        .unwrap_or(text);
    debug!("Request failed with {}: {}", status, message);
    Err(ClientError::Status { status, message })
}

async fn send_json<T: DeserializeOwned>(request: RequestBuilder) -> Result<T> {
    Ok(send(request).await?.json().await?)
}
