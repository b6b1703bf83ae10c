use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Duration;
use shared::domain::{
    Actor, ActorId, ConversationKey, Message, MessageId, PresenceSnapshot, ProfileFields,
};
use storage::DirectConversation;

mod cache;
pub mod config;
pub mod connection;
pub mod directory;
pub mod engine;
pub mod error;
pub mod http;
pub mod identity;
pub mod presence;
pub mod sync;
pub mod transport;

pub use config::{load_settings, ClientSettings};
pub use connection::{ConnectionManager, ConnectionState};
pub use engine::{ChatEngine, UiCommand};
pub use error::SyncError;
pub use http::{HttpHistorySource, HttpSessionSource};
pub use identity::IdentityResolver;
pub use presence::PresenceTracker;
pub use sync::{ConversationView, MessageSynchronizer};
pub use transport::{Backoff, DisconnectReason, Transport, TransportEvent, WsTransport};

/// Persistence collaborator for messages and the local actor record.
#[async_trait]
pub trait LocalCache: Send + Sync {
    async fn save(&self, message: &Message, is_room_scoped: bool) -> Result<()>;
    async fn query(
        &self,
        key: &ConversationKey,
        retention: Duration,
        limit: u32,
    ) -> Result<Vec<Message>>;
    async fn delete(&self, message_id: &MessageId) -> Result<bool>;
    async fn delete_conversation(&self, key: &ConversationKey) -> Result<u64>;
    async fn purge_older_than(&self, retention: Duration) -> Result<u64>;
    async fn clear_all(&self) -> Result<()>;
    async fn list_direct_conversations(
        &self,
        local_actor_id: &ActorId,
        retention: Duration,
    ) -> Result<Vec<DirectConversation>>;
    async fn load_actor(&self) -> Result<Option<Actor>>;
    async fn store_actor(&self, actor: &Actor) -> Result<()>;
    async fn clear_actor(&self) -> Result<()>;
}

/// Authoritative and backup session lookups plus profile writes.
#[async_trait]
pub trait SessionSource: Send + Sync {
    async fn authoritative_session(&self) -> Result<Option<Actor>>;
    async fn backup_session(&self) -> Result<Option<Actor>>;
    async fn update_profile(&self, fields: &ProfileFields) -> Result<()>;
}

/// Used when no session backend is configured: every lookup is empty.
pub struct MissingSessionSource;

#[async_trait]
impl SessionSource for MissingSessionSource {
    async fn authoritative_session(&self) -> Result<Option<Actor>> {
        Ok(None)
    }

    async fn backup_session(&self) -> Result<Option<Actor>> {
        Ok(None)
    }

    async fn update_profile(&self, _fields: &ProfileFields) -> Result<()> {
        Err(anyhow!("session backend is unavailable"))
    }
}

/// Server-side message history for a conversation.
#[async_trait]
pub trait HistorySource: Send + Sync {
    async fn fetch_history(
        &self,
        key: &ConversationKey,
        local_actor_id: &ActorId,
        limit: u32,
    ) -> Result<Vec<Message>>;
}

pub struct MissingHistorySource;

#[async_trait]
impl HistorySource for MissingHistorySource {
    async fn fetch_history(
        &self,
        key: &ConversationKey,
        _local_actor_id: &ActorId,
        _limit: u32,
    ) -> Result<Vec<Message>> {
        Err(anyhow!("history backend is unavailable for {key}"))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    ViewChanged {
        key: ConversationKey,
        messages: Vec<Message>,
    },
    PresenceChanged(PresenceSnapshot),
    UnreadChanged {
        key: ConversationKey,
        count: u32,
        total: u32,
    },
    ConversationsChanged,
    ConnectionChanged(ConnectionState),
    IdentityChanged(Option<Actor>),
    SendRejected {
        retry_after_ms: Option<u64>,
        reason: String,
    },
    Error(String),
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
