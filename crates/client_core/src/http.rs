use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{header::COOKIE, Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use shared::domain::{
    Actor, ActorId, ConversationKey, GenderTag, Message, MessageId, MessageTarget, ProfileFields,
    RoomId, TenantId,
};
use tracing::{debug, info};

use crate::{config::ClientSettings, HistorySource, SessionSource};

const SESSION_COOKIE: &str = "better-auth.session_token";

#[derive(Debug, Deserialize)]
struct SessionEnvelope {
    user: Option<SessionUser>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionUser {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    gender: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    is_anonymous: Option<bool>,
}

impl SessionUser {
    fn into_actor(self) -> Actor {
        Actor {
            id: ActorId::new(self.id),
            display_name: self
                .name
                .filter(|name| !name.trim().is_empty())
                .unwrap_or_else(|| "User".to_string()),
            gender: self
                .gender
                .as_deref()
                .map(GenderTag::from_tag)
                .unwrap_or_default(),
            status_text: self.status.filter(|status| !status.is_empty()),
            avatar_ref: self.image,
            is_anonymous: self.is_anonymous.unwrap_or(false),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UpdateUserRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    gender: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<&'a str>,
}

/// Session lookups against the auth endpoints of the chat server.
pub struct HttpSessionSource {
    http: Client,
    server_url: String,
    session_token: Option<String>,
    backup_path: String,
}

impl HttpSessionSource {
    pub fn new(
        server_url: impl Into<String>,
        session_token: Option<String>,
        backup_path: impl Into<String>,
    ) -> Self {
        Self {
            http: Client::new(),
            server_url: server_url.into().trim_end_matches('/').to_string(),
            session_token,
            backup_path: backup_path.into(),
        }
    }

    pub fn from_settings(settings: &ClientSettings) -> Self {
        Self::new(
            settings.server_url.clone(),
            settings.session_token.clone(),
            settings.backup_session_path.clone(),
        )
    }

    fn with_cookie(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.session_token {
            Some(token) => request.header(COOKIE, format!("{SESSION_COOKIE}={token}")),
            None => request,
        }
    }

    async fn fetch_session(&self, path: &str) -> Result<Option<Actor>> {
        let url = format!("{}{path}", self.server_url);
        let response = self
            .with_cookie(self.http.get(&url))
            .send()
            .await
            .with_context(|| format!("session request to {url} failed"))?;
        if matches!(
            response.status(),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND
        ) {
            debug!(status = %response.status(), path, "identity: no session");
            return Ok(None);
        }
        let envelope: Option<SessionEnvelope> = response
            .error_for_status()?
            .json()
            .await
            .with_context(|| format!("malformed session payload from {url}"))?;
        Ok(envelope
            .and_then(|envelope| envelope.user)
            .map(SessionUser::into_actor))
    }
}

#[async_trait]
impl SessionSource for HttpSessionSource {
    async fn authoritative_session(&self) -> Result<Option<Actor>> {
        if self.session_token.is_none() {
            return Ok(None);
        }
        self.fetch_session("/api/auth/get-session").await
    }

    async fn backup_session(&self) -> Result<Option<Actor>> {
        self.fetch_session(&self.backup_path).await
    }

    async fn update_profile(&self, fields: &ProfileFields) -> Result<()> {
        let body = UpdateUserRequest {
            name: fields.display_name.as_deref(),
            gender: fields.gender.map(|gender| gender.as_str()),
            status: fields.status_text.as_deref(),
            image: fields.avatar_ref.as_deref(),
        };
        self.with_cookie(
            self.http
                .post(format!("{}/api/auth/update-user", self.server_url)),
        )
        .json(&body)
        .send()
        .await?
        .error_for_status()
        .context("profile update rejected")?;
        info!("identity: profile update sent");
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryMessage {
    id: String,
    text: String,
    sender_id: String,
    sender_alias: String,
    #[serde(default)]
    sender_gender: Option<String>,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    image_url: Option<String>,
    #[serde(default)]
    recipient_id: Option<String>,
    #[serde(default)]
    room_id: Option<String>,
    #[serde(default)]
    tenant_id: Option<String>,
}

impl HistoryMessage {
    fn into_message(self, key: &ConversationKey) -> Message {
        let target = match (self.room_id, self.recipient_id, key) {
            (Some(room_id), _, _) => MessageTarget::Room(RoomId::new(room_id)),
            (None, Some(recipient_id), _) => MessageTarget::Direct(ActorId::new(recipient_id)),
            (None, None, ConversationKey::Room(room_id)) => MessageTarget::Room(room_id.clone()),
            (None, None, ConversationKey::Direct(peer_id)) => {
                MessageTarget::Direct(peer_id.clone())
            }
        };
        Message {
            id: MessageId::new(self.id),
            target,
            sender_id: ActorId::new(self.sender_id),
            sender_alias: self.sender_alias,
            sender_gender: self
                .sender_gender
                .as_deref()
                .map(GenderTag::from_tag)
                .unwrap_or_default(),
            text: self.text,
            image_ref: self.image_url,
            timestamp: self.timestamp,
            tenant_id: self.tenant_id.map(TenantId::new),
        }
    }
}

/// Server message history over the REST API.
pub struct HttpHistorySource {
    http: Client,
    server_url: String,
    tenant_slug: String,
}

impl HttpHistorySource {
    pub fn new(server_url: impl Into<String>, tenant_slug: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            server_url: server_url.into().trim_end_matches('/').to_string(),
            tenant_slug: tenant_slug.into(),
        }
    }

    pub fn from_settings(settings: &ClientSettings) -> Self {
        Self::new(settings.server_url.clone(), settings.tenant_slug.clone())
    }
}

#[async_trait]
impl HistorySource for HttpHistorySource {
    async fn fetch_history(
        &self,
        key: &ConversationKey,
        local_actor_id: &ActorId,
        limit: u32,
    ) -> Result<Vec<Message>> {
        let limit = limit.to_string();
        let request = match key {
            ConversationKey::Room(room_id) => self
                .http
                .get(format!("{}/api/messages", self.server_url))
                .query(&[
                    ("tenant", self.tenant_slug.as_str()),
                    ("roomId", room_id.as_str()),
                    ("limit", limit.as_str()),
                ]),
            ConversationKey::Direct(peer_id) => self
                .http
                .get(format!("{}/api/messages/private", self.server_url))
                .query(&[
                    ("tenant", self.tenant_slug.as_str()),
                    ("peerId", peer_id.as_str()),
                    ("userId", local_actor_id.as_str()),
                    ("limit", limit.as_str()),
                ]),
        };
        let history: Vec<HistoryMessage> = request
            .send()
            .await
            .with_context(|| format!("history request for {key} failed"))?
            .error_for_status()?
            .json()
            .await
            .with_context(|| format!("malformed history payload for {key}"))?;
        debug!(conversation = %key, count = history.len(), "sync: fetched server history");
        Ok(history
            .into_iter()
            .map(|message| message.into_message(key))
            .collect())
    }
}

#[cfg(test)]
#[path = "tests/http_tests.rs"]
mod tests;
