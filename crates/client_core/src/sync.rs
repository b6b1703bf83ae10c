use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use chrono::{Duration, Utc};
use shared::domain::{
    truncate_to_millis, Actor, ActorId, ActorSummary, ConversationKey, Message, MessageId,
    MessageTarget, TenantId,
};
use tracing::{debug, info, warn};

use crate::{error::SyncError, LocalCache};

/// In-memory message list for one conversation, kept sorted by
/// `(timestamp, id)` with at most one entry per id.
#[derive(Debug, Clone, Default)]
pub struct ConversationView {
    messages: Vec<Message>,
    ids: HashSet<MessageId>,
}

impl ConversationView {
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.ids.contains(id)
    }

    /// Inserts at the ordered position; returns false for a known id.
    pub fn insert(&mut self, message: Message) -> bool {
        if !self.ids.insert(message.id.clone()) {
            return false;
        }
        let position = self
            .messages
            .partition_point(|existing| existing.order_key() <= message.order_key());
        self.messages.insert(position, message);
        true
    }

    pub fn remove(&mut self, id: &MessageId) -> Option<Message> {
        if !self.ids.remove(id) {
            return None;
        }
        let position = self.messages.iter().position(|m| &m.id == id)?;
        Some(self.messages.remove(position))
    }

    fn retain_since(&mut self, cutoff: chrono::DateTime<Utc>) -> usize {
        let before = self.messages.len();
        let ids = &mut self.ids;
        self.messages.retain(|message| {
            let keep = message.timestamp >= cutoff;
            if !keep {
                ids.remove(&message.id);
            }
            keep
        });
        before - self.messages.len()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub inserted: usize,
    pub removed: usize,
}

impl ReconcileReport {
    pub fn changed(&self) -> bool {
        self.inserted > 0 || self.removed > 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub purged: u64,
    pub changed: Vec<ConversationKey>,
}

/// Cache-first message flow: optimistic sends, deduplicated receives,
/// server-authoritative deletes, and history reconciliation.
pub struct MessageSynchronizer {
    cache: Arc<dyn LocalCache>,
    views: HashMap<ConversationKey, ConversationView>,
    loaded: HashSet<ConversationKey>,
    // Optimistic sends not yet echoed by the server.
    pending: HashSet<MessageId>,
    // Ids that reached a view while its history fetch was in flight; the
    // server snapshot cannot contain them.
    in_flight: HashMap<ConversationKey, HashSet<MessageId>>,
    retention: Duration,
    history_limit: u32,
}

impl MessageSynchronizer {
    pub fn new(cache: Arc<dyn LocalCache>, retention: Duration, history_limit: u32) -> Self {
        Self {
            cache,
            views: HashMap::new(),
            loaded: HashSet::new(),
            pending: HashSet::new(),
            in_flight: HashMap::new(),
            retention,
            history_limit,
        }
    }

    pub fn history_limit(&self) -> u32 {
        self.history_limit
    }

    pub fn view(&self, key: &ConversationKey) -> Option<&ConversationView> {
        self.views.get(key)
    }

    pub fn messages(&self, key: &ConversationKey) -> Vec<Message> {
        self.views
            .get(key)
            .map(|view| view.messages().to_vec())
            .unwrap_or_default()
    }

    pub fn is_pending(&self, id: &MessageId) -> bool {
        self.pending.contains(id)
    }

    pub fn is_loaded(&self, key: &ConversationKey) -> bool {
        self.loaded.contains(key)
    }

    /// Builds a message with a fresh client id, writes it to the cache, then
    /// shows it. The caller hands the returned message to the wire.
    pub async fn send(
        &mut self,
        key: &ConversationKey,
        sender: &Actor,
        tenant_id: Option<TenantId>,
        text: &str,
        image_ref: Option<String>,
    ) -> Result<Message, SyncError> {
        let text = text.trim();
        let image_ref = image_ref.filter(|image| !image.trim().is_empty());
        if text.is_empty() && image_ref.is_none() {
            return Err(SyncError::Validation("message text is empty".into()));
        }

        let target = match key {
            ConversationKey::Room(room_id) => MessageTarget::Room(room_id.clone()),
            ConversationKey::Direct(peer_id) => {
                if peer_id == &sender.id {
                    return Err(SyncError::NoCounterpart(
                        "cannot send a direct message to yourself".into(),
                    ));
                }
                MessageTarget::Direct(peer_id.clone())
            }
        };
        let message = Message {
            id: MessageId::generate(),
            target,
            sender_id: sender.id.clone(),
            sender_alias: sender.display_name.clone(),
            sender_gender: sender.gender,
            text: text.to_string(),
            image_ref,
            timestamp: truncate_to_millis(Utc::now()),
            tenant_id,
        };

        if let Err(err) = self.cache.save(&message, key.is_room()).await {
            warn!(
                message_id = %message.id,
                conversation = %key,
                "sync: cache write failed, showing message anyway: {err:#}"
            );
        }
        self.views
            .entry(key.clone())
            .or_default()
            .insert(message.clone());
        self.pending.insert(message.id.clone());
        self.note_arrival(key, &message.id);
        debug!(message_id = %message.id, conversation = %key, "sync: optimistic send");
        Ok(message)
    }

    /// Returns true when the message was new and is now displayed.
    pub async fn on_message_received(&mut self, key: &ConversationKey, message: Message) -> bool {
        let message = message.normalized();
        let echoed = self.pending.remove(&message.id);
        self.note_arrival(key, &message.id);
        if self
            .views
            .get(key)
            .is_some_and(|view| view.contains(&message.id))
        {
            if echoed {
                debug!(message_id = %message.id, "sync: send confirmed by echo");
            }
            return false;
        }

        if let Err(err) = self.cache.save(&message, key.is_room()).await {
            warn!(
                message_id = %message.id,
                conversation = %key,
                "sync: cache write failed: {err:#}"
            );
        }
        self.views.entry(key.clone()).or_default().insert(message)
    }

    /// Marks a history fetch for `key` as started. Messages arriving before
    /// its result is reconciled are never treated as deleted upstream.
    pub fn begin_history_fetch(&mut self, key: &ConversationKey) {
        self.in_flight.insert(key.clone(), HashSet::new());
    }

    pub fn abandon_history_fetch(&mut self, key: &ConversationKey) {
        self.in_flight.remove(key);
    }

    fn note_arrival(&mut self, key: &ConversationKey, id: &MessageId) {
        if let Some(arrived) = self.in_flight.get_mut(key) {
            arrived.insert(id.clone());
        }
    }

    /// Applies a server delete. Without a key every view is searched. Returns
    /// the conversation whose view changed.
    pub async fn on_message_deleted(
        &mut self,
        message_id: &MessageId,
        key: Option<&ConversationKey>,
    ) -> Option<ConversationKey> {
        if let Err(err) = self.cache.delete(message_id).await {
            warn!(message_id = %message_id, "sync: cache delete failed: {err:#}");
        }
        self.pending.remove(message_id);

        match key {
            Some(key) => {
                let view = self.views.get_mut(key)?;
                view.remove(message_id).map(|_| key.clone())
            }
            None => self.views.iter_mut().find_map(|(key, view)| {
                view.remove(message_id).map(|_| key.clone())
            }),
        }
    }

    /// First open: seeds the view from the cache. Returns the view contents.
    pub async fn load(&mut self, key: &ConversationKey) -> Vec<Message> {
        match self.cache.query(key, self.retention, self.history_limit).await {
            Ok(cached) => {
                let view = self.views.entry(key.clone()).or_default();
                for message in cached {
                    view.insert(message);
                }
            }
            Err(err) => warn!(conversation = %key, "sync: cache read failed: {err:#}"),
        }
        self.loaded.insert(key.clone());
        self.messages(key)
    }

    /// Merges server history into a view. Cached messages the server no longer
    /// returns are removed only inside the window the history covers, and
    /// never when they are pending or arrived during the fetch.
    pub async fn reconcile_history(
        &mut self,
        key: &ConversationKey,
        history: Vec<Message>,
    ) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let arrived = self.in_flight.remove(key).unwrap_or_default();
        let history: Vec<Message> = history.into_iter().map(Message::normalized).collect();
        let (Some(window_start), Some(window_end)) = (
            history.iter().map(|m| m.timestamp).min(),
            history.iter().map(|m| m.timestamp).max(),
        ) else {
            return report;
        };
        let history_ids: HashSet<MessageId> = history.iter().map(|m| m.id.clone()).collect();

        for message in history {
            self.pending.remove(&message.id);
            if self
                .views
                .get(key)
                .is_some_and(|view| view.contains(&message.id))
            {
                continue;
            }
            if let Err(err) = self.cache.save(&message, key.is_room()).await {
                warn!(message_id = %message.id, "sync: cache write failed: {err:#}");
            }
            if self.views.entry(key.clone()).or_default().insert(message) {
                report.inserted += 1;
            }
        }

        let stale: Vec<MessageId> = self
            .views
            .get(key)
            .map(|view| {
                view.messages()
                    .iter()
                    .filter(|m| {
                        m.timestamp >= window_start
                            && m.timestamp <= window_end
                            && !history_ids.contains(&m.id)
                            && !self.pending.contains(&m.id)
                            && !arrived.contains(&m.id)
                    })
                    .map(|m| m.id.clone())
                    .collect()
            })
            .unwrap_or_default();

        for id in stale {
            if let Err(err) = self.cache.delete(&id).await {
                warn!(message_id = %id, "sync: cache delete failed: {err:#}");
            }
            if let Some(view) = self.views.get_mut(key) {
                if view.remove(&id).is_some() {
                    report.removed += 1;
                }
            }
        }

        if report.changed() {
            info!(
                conversation = %key,
                inserted = report.inserted,
                removed = report.removed,
                "sync: reconciled with server history"
            );
        }
        report
    }

    /// Retention sweep over the cache and every in-memory view.
    pub async fn sweep(&mut self) -> SweepReport {
        let purged = match self.cache.purge_older_than(self.retention).await {
            Ok(purged) => purged,
            Err(err) => {
                warn!("sync: retention sweep failed: {err:#}");
                0
            }
        };
        let cutoff = Utc::now() - self.retention;
        let mut changed = Vec::new();
        for (key, view) in self.views.iter_mut() {
            if view.retain_since(cutoff) > 0 {
                changed.push(key.clone());
            }
        }
        changed.sort();
        SweepReport { purged, changed }
    }

    /// Drops a conversation from memory and from the cache.
    pub async fn hide(&mut self, key: &ConversationKey) {
        if let Some(view) = self.views.remove(key) {
            for message in view.messages() {
                self.pending.remove(&message.id);
            }
        }
        self.loaded.remove(key);
        self.in_flight.remove(key);
        if let Err(err) = self.cache.delete_conversation(key).await {
            warn!(conversation = %key, "sync: cache delete failed: {err:#}");
        }
    }

    /// Seeds direct-conversation views from the cache. Returns each peer with
    /// the best summary the cached messages offer.
    pub async fn restore_direct(
        &mut self,
        local_actor_id: &ActorId,
    ) -> Vec<(ActorId, Option<ActorSummary>)> {
        let conversations = match self
            .cache
            .list_direct_conversations(local_actor_id, self.retention)
            .await
        {
            Ok(conversations) => conversations,
            Err(err) => {
                warn!("sync: failed to restore direct conversations: {err:#}");
                return Vec::new();
            }
        };

        let mut peers = Vec::with_capacity(conversations.len());
        for conversation in conversations {
            let summary = conversation
                .messages
                .iter()
                .rev()
                .find(|m| m.sender_id == conversation.peer_id)
                .map(Message::sender_summary);
            let view = self
                .views
                .entry(ConversationKey::Direct(conversation.peer_id.clone()))
                .or_default();
            for message in conversation.messages {
                view.insert(message);
            }
            peers.push((conversation.peer_id, summary));
        }
        peers
    }

    pub fn clear_memory(&mut self) {
        self.views.clear();
        self.loaded.clear();
        self.pending.clear();
        self.in_flight.clear();
    }

    /// Logout: memory and cached messages both go.
    pub async fn clear(&mut self) {
        self.clear_memory();
        if let Err(err) = self.cache.clear_all().await {
            warn!("sync: failed to clear message cache: {err:#}");
        }
    }
}

#[cfg(test)]
#[path = "tests/sync_tests.rs"]
mod tests;
