use std::collections::BTreeMap;

use shared::domain::{ConversationKey, PresenceSnapshot};

/// Presence snapshot plus per-conversation unread counters.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    snapshot: PresenceSnapshot,
    unread: BTreeMap<ConversationKey, u32>,
    focused: Option<ConversationKey>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> &PresenceSnapshot {
        &self.snapshot
    }

    /// Broadcasts carry the full online set, so the old one is dropped.
    pub fn apply_presence(&mut self, snapshot: PresenceSnapshot) {
        self.snapshot = snapshot;
    }

    /// Counts a received message. Returns true when a counter moved.
    pub fn on_message(&mut self, key: &ConversationKey, from_self: bool) -> bool {
        if from_self || self.focused.as_ref() == Some(key) {
            return false;
        }
        *self.unread.entry(key.clone()).or_insert(0) += 1;
        true
    }

    pub fn focus(&mut self, key: &ConversationKey) {
        self.focused = Some(key.clone());
        self.unread.remove(key);
    }

    pub fn blur(&mut self) {
        self.focused = None;
    }

    pub fn focused(&self) -> Option<&ConversationKey> {
        self.focused.as_ref()
    }

    pub fn unread(&self, key: &ConversationKey) -> u32 {
        self.unread.get(key).copied().unwrap_or(0)
    }

    pub fn unread_counters(&self) -> &BTreeMap<ConversationKey, u32> {
        &self.unread
    }

    pub fn total_unread(&self) -> u32 {
        self.unread.values().sum()
    }

    pub fn forget(&mut self, key: &ConversationKey) {
        self.unread.remove(key);
        if self.focused.as_ref() == Some(key) {
            self.focused = None;
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
