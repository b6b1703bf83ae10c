#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use shared::{
    domain::{
        truncate_to_millis, Actor, ActorId, ActorSummary, ConversationKey, GenderTag, Message,
        MessageId, MessageTarget, ProfileFields,
    },
    protocol::ClientRequest,
};
use storage::{DirectConversation, Storage};

use crate::{error::SyncError, transport::Transport, HistorySource, LocalCache, SessionSource};

#[derive(Debug, Default)]
pub struct FakeWire {
    pub connected: bool,
    pub opened: Vec<String>,
    pub closed: u32,
    pub reconnect_requests: u32,
    pub sent: Vec<ClientRequest>,
}

/// Recording transport; clones share one wire so tests can inspect it after
/// handing a boxed copy to the manager.
#[derive(Clone, Default)]
pub struct FakeTransport {
    wire: Arc<Mutex<FakeWire>>,
}

impl FakeTransport {
    pub fn set_connected(&self, connected: bool) {
        self.wire.lock().unwrap().connected = connected;
    }

    pub fn opened(&self) -> Vec<String> {
        self.wire.lock().unwrap().opened.clone()
    }

    pub fn closed(&self) -> u32 {
        self.wire.lock().unwrap().closed
    }

    pub fn reconnect_requests(&self) -> u32 {
        self.wire.lock().unwrap().reconnect_requests
    }

    pub fn sent(&self) -> Vec<ClientRequest> {
        self.wire.lock().unwrap().sent.clone()
    }

    pub fn joins(&self) -> Vec<ActorSummary> {
        self.sent()
            .into_iter()
            .filter_map(|request| match request {
                ClientRequest::Join { actor, .. } => Some(actor),
                _ => None,
            })
            .collect()
    }

    pub fn sent_messages(&self) -> Vec<Message> {
        self.sent()
            .into_iter()
            .filter_map(|request| match request {
                ClientRequest::Send { message, .. } => Some(message),
                _ => None,
            })
            .collect()
    }
}

impl Transport for FakeTransport {
    fn open(&mut self, endpoint: &str) -> Result<(), SyncError> {
        self.wire.lock().unwrap().opened.push(endpoint.to_string());
        Ok(())
    }

    fn send(&mut self, request: &ClientRequest) -> Result<(), SyncError> {
        let mut wire = self.wire.lock().unwrap();
        if !wire.connected {
            return Err(SyncError::Transport("fake transport is offline".into()));
        }
        wire.sent.push(request.clone());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.wire.lock().unwrap().connected
    }

    fn reconnect_now(&mut self) {
        self.wire.lock().unwrap().reconnect_requests += 1;
    }

    fn close(&mut self) {
        let mut wire = self.wire.lock().unwrap();
        wire.closed += 1;
        wire.connected = false;
    }
}

#[derive(Default)]
pub struct ScriptedSessions {
    pub authoritative: Mutex<Option<Actor>>,
    pub authoritative_fails: Mutex<bool>,
    pub backup: Mutex<Option<Actor>>,
    pub profile_updates: Mutex<Vec<ProfileFields>>,
}

impl ScriptedSessions {
    pub fn with_authoritative(actor: Actor) -> Self {
        let sessions = Self::default();
        *sessions.authoritative.lock().unwrap() = Some(actor);
        sessions
    }

    pub fn with_backup(actor: Actor) -> Self {
        let sessions = Self::default();
        *sessions.backup.lock().unwrap() = Some(actor);
        sessions
    }
}

#[async_trait]
impl SessionSource for ScriptedSessions {
    async fn authoritative_session(&self) -> Result<Option<Actor>> {
        if *self.authoritative_fails.lock().unwrap() {
            return Err(anyhow!("session endpoint unreachable"));
        }
        Ok(self.authoritative.lock().unwrap().clone())
    }

    async fn backup_session(&self) -> Result<Option<Actor>> {
        Ok(self.backup.lock().unwrap().clone())
    }

    async fn update_profile(&self, fields: &ProfileFields) -> Result<()> {
        self.profile_updates.lock().unwrap().push(fields.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct ScriptedHistory {
    pub responses: Mutex<HashMap<ConversationKey, Vec<Message>>>,
    pub requests: Mutex<Vec<ConversationKey>>,
}

impl ScriptedHistory {
    pub fn respond(&self, key: ConversationKey, messages: Vec<Message>) {
        self.responses.lock().unwrap().insert(key, messages);
    }
}

#[async_trait]
impl HistorySource for ScriptedHistory {
    async fn fetch_history(
        &self,
        key: &ConversationKey,
        _local_actor_id: &ActorId,
        _limit: u32,
    ) -> Result<Vec<Message>> {
        self.requests.lock().unwrap().push(key.clone());
        Ok(self
            .responses
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .unwrap_or_default())
    }
}

/// Every write fails; reads come back empty.
pub struct FailingCache;

#[async_trait]
impl LocalCache for FailingCache {
    async fn save(&self, _message: &Message, _is_room_scoped: bool) -> Result<()> {
        Err(anyhow!("disk full"))
    }

    async fn query(
        &self,
        _key: &ConversationKey,
        _retention: Duration,
        _limit: u32,
    ) -> Result<Vec<Message>> {
        Err(anyhow!("disk full"))
    }

    async fn delete(&self, _message_id: &MessageId) -> Result<bool> {
        Err(anyhow!("disk full"))
    }

    async fn delete_conversation(&self, _key: &ConversationKey) -> Result<u64> {
        Err(anyhow!("disk full"))
    }

    async fn purge_older_than(&self, _retention: Duration) -> Result<u64> {
        Err(anyhow!("disk full"))
    }

    async fn clear_all(&self) -> Result<()> {
        Err(anyhow!("disk full"))
    }

    async fn list_direct_conversations(
        &self,
        _local_actor_id: &ActorId,
        _retention: Duration,
    ) -> Result<Vec<DirectConversation>> {
        Err(anyhow!("disk full"))
    }

    async fn load_actor(&self) -> Result<Option<Actor>> {
        Ok(None)
    }

    async fn store_actor(&self, _actor: &Actor) -> Result<()> {
        Err(anyhow!("disk full"))
    }

    async fn clear_actor(&self) -> Result<()> {
        Err(anyhow!("disk full"))
    }
}

pub async fn memory_cache() -> Arc<Storage> {
    Arc::new(Storage::new("sqlite::memory:").await.expect("in-memory cache"))
}

pub fn confirmed_actor(id: &str, name: &str) -> Actor {
    Actor {
        is_anonymous: false,
        ..Actor::anonymous(ActorId::new(id), name)
    }
}

pub fn room_message(id: &str, room: &str, sender: &str, text: &str, age_secs: i64) -> Message {
    Message {
        id: MessageId::new(id),
        target: MessageTarget::Room(shared::domain::RoomId::new(room)),
        sender_id: ActorId::new(sender),
        sender_alias: sender.to_string(),
        sender_gender: GenderTag::Other,
        text: text.to_string(),
        image_ref: None,
        timestamp: truncate_to_millis(Utc::now() - Duration::seconds(age_secs)),
        tenant_id: None,
    }
}

pub fn direct_message(
    id: &str,
    sender: &str,
    recipient: &str,
    text: &str,
    age_secs: i64,
) -> Message {
    Message {
        target: MessageTarget::Direct(ActorId::new(recipient)),
        ..room_message(id, "unused", sender, text, age_secs)
    }
}
