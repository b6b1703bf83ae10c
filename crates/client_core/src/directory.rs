use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use shared::domain::{ActorId, ActorSummary, ConversationKey, Message};

use crate::error::SyncError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationEntry {
    pub key: ConversationKey,
    pub title: String,
    pub peer: Option<ActorSummary>,
    pub last_activity: Option<DateTime<Utc>>,
}

/// Conversations the local actor has open: joined rooms and direct chats.
#[derive(Debug, Default)]
pub struct ConversationDirectory {
    entries: BTreeMap<ConversationKey, ConversationEntry>,
}

impl ConversationDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> impl Iterator<Item = &ConversationEntry> {
        self.entries.values()
    }

    pub fn get(&self, key: &ConversationKey) -> Option<&ConversationEntry> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &ConversationKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Opens (or returns) the direct chat with `peer`.
    pub fn start_direct(
        &mut self,
        peer: &ActorSummary,
        is_self: impl Fn(&ActorId) -> bool,
    ) -> Result<ConversationKey, SyncError> {
        if peer.id.as_str().trim().is_empty() {
            return Err(SyncError::NoCounterpart("peer id is empty".into()));
        }
        if is_self(&peer.id) {
            return Err(SyncError::NoCounterpart(
                "cannot start a chat with yourself".into(),
            ));
        }
        let key = ConversationKey::Direct(peer.id.clone());
        let entry = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| ConversationEntry {
                key: key.clone(),
                title: peer.display_name.clone(),
                peer: Some(peer.clone()),
                last_activity: None,
            });
        // Newer summary wins.
        entry.title = peer.display_name.clone();
        entry.peer = Some(peer.clone());
        Ok(key)
    }

    /// Adds an entry with a default title if missing. Returns true when added.
    pub fn ensure(&mut self, key: &ConversationKey) -> bool {
        if self.entries.contains_key(key) {
            return false;
        }
        let title = match key {
            ConversationKey::Room(room_id) => format!("#{room_id}"),
            ConversationKey::Direct(peer_id) => peer_id.to_string(),
        };
        self.entries.insert(
            key.clone(),
            ConversationEntry {
                key: key.clone(),
                title,
                peer: None,
                last_activity: None,
            },
        );
        true
    }

    /// Records activity; a direct message from a peer creates or refreshes its
    /// entry. Returns true when the entry is new.
    pub fn note_message(
        &mut self,
        key: &ConversationKey,
        message: &Message,
        from_self: bool,
    ) -> bool {
        let added = self.ensure(key);
        if let Some(entry) = self.entries.get_mut(key) {
            if !key.is_room() && !from_self {
                let summary = message.sender_summary();
                entry.title = summary.display_name.clone();
                entry.peer = Some(summary);
            }
            if entry.last_activity.map_or(true, |seen| seen < message.timestamp) {
                entry.last_activity = Some(message.timestamp);
            }
        }
        added
    }

    pub fn hide(&mut self, key: &ConversationKey) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
