use std::{fmt, str::FromStr};

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

id_newtype!(ActorId);
id_newtype!(RoomId);
id_newtype!(TenantId);
id_newtype!(MessageId);

impl MessageId {
    /// Client-side ids are UUID v4 so an optimistic message and its server echo
    /// share one identity.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenderTag {
    Male,
    Female,
    #[default]
    Other,
}

impl GenderTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Male => "male",
            Self::Female => "female",
            Self::Other => "other",
        }
    }

    /// Lenient parse; unknown tags map to `Other`.
    pub fn from_tag(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "male" => Self::Male,
            "female" => Self::Female,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: ActorId,
    pub display_name: String,
    #[serde(default)]
    pub gender: GenderTag,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_ref: Option<String>,
    #[serde(default)]
    pub is_anonymous: bool,
}

impl Actor {
    pub fn anonymous(id: ActorId, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            gender: GenderTag::Other,
            status_text: None,
            avatar_ref: None,
            is_anonymous: true,
        }
    }

    pub fn summary(&self) -> ActorSummary {
        ActorSummary {
            id: self.id.clone(),
            display_name: self.display_name.clone(),
            gender: self.gender,
            status_text: self.status_text.clone(),
            avatar_ref: self.avatar_ref.clone(),
        }
    }
}

/// Public projection of an actor as seen by other participants.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActorSummary {
    pub id: ActorId,
    pub display_name: String,
    #[serde(default)]
    pub gender: GenderTag,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_ref: Option<String>,
}

/// Partial profile edit; `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<GenderTag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_ref: Option<String>,
}

impl ProfileFields {
    pub fn is_empty(&self) -> bool {
        self.display_name.is_none()
            && self.gender.is_none()
            && self.status_text.is_none()
            && self.avatar_ref.is_none()
    }

    pub fn apply_to(&self, actor: &mut Actor) {
        if let Some(name) = &self.display_name {
            actor.display_name = name.clone();
        }
        if let Some(gender) = self.gender {
            actor.gender = gender;
        }
        if let Some(status) = &self.status_text {
            actor.status_text = Some(status.clone());
        }
        if let Some(avatar) = &self.avatar_ref {
            actor.avatar_ref = Some(avatar.clone());
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoomKind {
    #[default]
    Standard,
    Announcement,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub tenant_id: TenantId,
    pub name: String,
    #[serde(default)]
    pub kind: RoomKind,
}

/// Partition key for messages, cache rows, and unread counters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ConversationKey {
    Room(RoomId),
    Direct(ActorId),
}

impl ConversationKey {
    pub fn room(id: impl Into<String>) -> Self {
        Self::Room(RoomId::new(id))
    }

    pub fn direct(peer: impl Into<String>) -> Self {
        Self::Direct(ActorId::new(peer))
    }

    pub fn is_room(&self) -> bool {
        matches!(self, Self::Room(_))
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Room(id) => write!(f, "room:{id}"),
            Self::Direct(id) => write!(f, "direct:{id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid conversation key '{0}': expected room:<id> or direct:<id>")]
pub struct ParseConversationKeyError(pub String);

impl FromStr for ConversationKey {
    type Err = ParseConversationKeyError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.split_once(':') {
            Some(("room", id)) if !id.is_empty() => Ok(Self::room(id)),
            Some(("direct", id)) if !id.is_empty() => Ok(Self::direct(id)),
            _ => Err(ParseConversationKeyError(raw.to_string())),
        }
    }
}

/// Where a message is addressed on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageTarget {
    Room(RoomId),
    Direct(ActorId),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub target: MessageTarget,
    pub sender_id: ActorId,
    pub sender_alias: String,
    #[serde(default)]
    pub sender_gender: GenderTag,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_ref: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<TenantId>,
}

impl Message {
    /// Millisecond precision, the resolution the local cache stores.
    pub fn normalized(mut self) -> Self {
        self.timestamp = truncate_to_millis(self.timestamp);
        self
    }

    pub fn is_room_scoped(&self) -> bool {
        matches!(self.target, MessageTarget::Room(_))
    }

    /// Conversation this message belongs to from the viewpoint of a local
    /// actor; `is_self` decides whether an actor id refers to that actor.
    pub fn conversation_key_for(&self, is_self: impl Fn(&ActorId) -> bool) -> ConversationKey {
        match &self.target {
            MessageTarget::Room(room_id) => ConversationKey::Room(room_id.clone()),
            MessageTarget::Direct(recipient) => {
                if is_self(&self.sender_id) {
                    ConversationKey::Direct(recipient.clone())
                } else {
                    ConversationKey::Direct(self.sender_id.clone())
                }
            }
        }
    }

    /// Sort key: ascending timestamp, ties broken by id.
    pub fn order_key(&self) -> (DateTime<Utc>, &str) {
        (self.timestamp, self.id.as_str())
    }

    pub fn sender_summary(&self) -> ActorSummary {
        ActorSummary {
            id: self.sender_id.clone(),
            display_name: self.sender_alias.clone(),
            gender: self.sender_gender,
            status_text: None,
            avatar_ref: None,
        }
    }
}

pub fn truncate_to_millis(timestamp: DateTime<Utc>) -> DateTime<Utc> {
    timestamp.trunc_subsecs(3)
}

/// Full online set for a tenant, replaced on every broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceSnapshot {
    pub online_actors: Vec<ActorSummary>,
    pub online_actor_ids: std::collections::BTreeSet<ActorId>,
    pub room_occupancy: std::collections::BTreeMap<RoomId, u32>,
}

impl PresenceSnapshot {
    pub fn is_online(&self, actor_id: &ActorId) -> bool {
        self.online_actor_ids.contains(actor_id)
    }

    pub fn occupancy(&self, room_id: &RoomId) -> u32 {
        self.room_occupancy.get(room_id).copied().unwrap_or(0)
    }
}
