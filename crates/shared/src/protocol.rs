use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    domain::{ActorId, ActorSummary, ConversationKey, Message, MessageId, RoomId, TenantId},
    error::ApiError,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientRequest {
    /// Identify handshake binding the connection to an actor and tenant.
    Join {
        actor: ActorSummary,
        tenant_slug: String,
    },
    Send {
        message: Message,
        tenant_slug: String,
    },
    DeleteMessage {
        message_id: MessageId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<RoomId>,
        tenant_slug: String,
    },
}

impl ClientRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::Send { .. } => "send",
            Self::DeleteMessage { .. } => "delete_message",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityAck {
    pub id: ActorId,
    pub alias: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<TenantId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Issued only for actors without a prior confirmed id.
    IdentityAssigned(IdentityAck),
    IdentityConfirmed(IdentityAck),
    Message {
        message: Message,
    },
    MessageDeleted {
        message_id: MessageId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_key: Option<ConversationKey>,
    },
    Presence {
        online_actors: Vec<ActorSummary>,
        online_ids: Vec<ActorId>,
        #[serde(default)]
        room_counts: BTreeMap<RoomId, u32>,
    },
    RateLimited {
        retry_after_ms: u64,
    },
    Error(ApiError),
}
