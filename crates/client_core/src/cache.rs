use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Duration;
use shared::domain::{Actor, ActorId, ConversationKey, Message, MessageId};
use storage::{DirectConversation, Storage, CURRENT_ACTOR_KEY};

use crate::LocalCache;

#[async_trait]
impl LocalCache for Storage {
    async fn save(&self, message: &Message, is_room_scoped: bool) -> Result<()> {
        self.save_message(message, is_room_scoped).await
    }

    async fn query(
        &self,
        key: &ConversationKey,
        retention: Duration,
        limit: u32,
    ) -> Result<Vec<Message>> {
        self.query_conversation(key, retention, limit).await
    }

    async fn delete(&self, message_id: &MessageId) -> Result<bool> {
        self.delete_message(message_id).await
    }

    async fn delete_conversation(&self, key: &ConversationKey) -> Result<u64> {
        Storage::delete_conversation(self, key).await
    }

    async fn purge_older_than(&self, retention: Duration) -> Result<u64> {
        Storage::purge_older_than(self, retention).await
    }

    async fn clear_all(&self) -> Result<()> {
        Storage::clear_all(self).await
    }

    async fn list_direct_conversations(
        &self,
        local_actor_id: &ActorId,
        retention: Duration,
    ) -> Result<Vec<DirectConversation>> {
        Storage::list_direct_conversations(self, local_actor_id, retention).await
    }

    async fn load_actor(&self) -> Result<Option<Actor>> {
        let Some(raw) = self.get_setting(CURRENT_ACTOR_KEY).await? else {
            return Ok(None);
        };
        let actor = serde_json::from_str(&raw).context("persisted actor record is malformed")?;
        Ok(Some(actor))
    }

    async fn store_actor(&self, actor: &Actor) -> Result<()> {
        let raw = serde_json::to_string(actor)?;
        self.set_setting(CURRENT_ACTOR_KEY, &raw).await
    }

    async fn clear_actor(&self) -> Result<()> {
        self.delete_setting(CURRENT_ACTOR_KEY).await
    }
}
