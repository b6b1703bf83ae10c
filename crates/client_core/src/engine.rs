use std::{collections::BTreeMap, sync::Arc, time::Duration as StdDuration};

use anyhow::{anyhow, Result};
use shared::{
    domain::{
        Actor, ActorId, ActorSummary, ConversationKey, Message, MessageId, MessageTarget,
        PresenceSnapshot, ProfileFields, TenantId,
    },
    protocol::{ClientRequest, IdentityAck, ServerEvent},
};
use storage::Storage;
use tokio::{
    sync::{broadcast, mpsc},
    time::MissedTickBehavior,
};
use tracing::{debug, info, warn};

use crate::{
    config::ClientSettings,
    connection::{ConnectionManager, ConnectionState},
    directory::{ConversationDirectory, ConversationEntry},
    error::SyncError,
    http::{HttpHistorySource, HttpSessionSource},
    identity::IdentityResolver,
    presence::PresenceTracker,
    sync::MessageSynchronizer,
    transport::{Transport, TransportEvent, WsTransport},
    ClientEvent, HistorySource, LocalCache, SessionSource,
};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Input from the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum UiCommand {
    /// Re-run identity resolution, e.g. after an auth redirect.
    SessionChanged,
    Login(Actor),
    OpenConversation(ConversationKey),
    Send {
        key: ConversationKey,
        text: String,
        image_ref: Option<String>,
    },
    Focus(ConversationKey),
    Blur,
    HideConversation(ConversationKey),
    StartChat(ActorSummary),
    UpdateProfile(ProfileFields),
    RequestDelete {
        key: ConversationKey,
        message_id: MessageId,
    },
    Foregrounded,
    Logout,
}

#[derive(Debug)]
struct HistoryResult {
    epoch: u64,
    key: ConversationKey,
    result: Result<Vec<Message>, String>,
}

/// The client's single mutable context. Every handler runs to completion
/// before the next input is taken.
pub struct ChatEngine {
    tenant_slug: String,
    tenant_id: Option<TenantId>,
    sweep_interval: StdDuration,
    identity: IdentityResolver,
    connection: ConnectionManager,
    sync: MessageSynchronizer,
    presence: PresenceTracker,
    directory: ConversationDirectory,
    history: Arc<dyn HistorySource>,
    events: broadcast::Sender<ClientEvent>,
    history_tx: mpsc::UnboundedSender<HistoryResult>,
    history_rx: Option<mpsc::UnboundedReceiver<HistoryResult>>,
    // Bumped on logout or actor switch; history results from older epochs are dropped.
    session_epoch: u64,
    reported_state: ConnectionState,
}

impl ChatEngine {
    pub fn new(
        settings: &ClientSettings,
        cache: Arc<dyn LocalCache>,
        sessions: Arc<dyn SessionSource>,
        history: Arc<dyn HistorySource>,
        transport: Box<dyn Transport>,
    ) -> Result<Self> {
        let endpoint = settings.websocket_url()?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (history_tx, history_rx) = mpsc::unbounded_channel();
        Ok(Self {
            tenant_slug: settings.tenant_slug.clone(),
            tenant_id: None,
            sweep_interval: settings.sweep_interval(),
            identity: IdentityResolver::new(sessions, cache.clone()),
            connection: ConnectionManager::new(transport, endpoint, settings.tenant_slug.clone()),
            sync: MessageSynchronizer::new(cache, settings.retention(), settings.history_limit),
            presence: PresenceTracker::new(),
            directory: ConversationDirectory::new(),
            history,
            events,
            history_tx,
            history_rx: Some(history_rx),
            session_epoch: 0,
            reported_state: ConnectionState::Idle,
        })
    }

    /// Production wiring: sqlite cache, http collaborators, websocket transport.
    pub async fn from_settings(
        settings: &ClientSettings,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>)> {
        let storage = Arc::new(Storage::new(&settings.database_url).await?);
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let transport = WsTransport::new(transport_tx, settings.backoff());
        let engine = Self::new(
            settings,
            storage,
            Arc::new(HttpSessionSource::from_settings(settings)),
            Arc::new(HttpHistorySource::from_settings(settings)),
            Box::new(transport),
        )?;
        Ok((engine, transport_rx))
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn current_actor(&self) -> Option<&Actor> {
        self.identity.current()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn tenant_id(&self) -> Option<&TenantId> {
        self.tenant_id.as_ref()
    }

    pub fn current_view(&self, key: &ConversationKey) -> Vec<Message> {
        self.sync.messages(key)
    }

    pub fn presence_snapshot(&self) -> &PresenceSnapshot {
        self.presence.snapshot()
    }

    pub fn unread_counters(&self) -> &BTreeMap<ConversationKey, u32> {
        self.presence.unread_counters()
    }

    pub fn total_unread(&self) -> u32 {
        self.presence.total_unread()
    }

    pub fn conversations(&self) -> Vec<ConversationEntry> {
        self.directory.entries().cloned().collect()
    }

    /// Drives the engine until the command channel closes.
    pub async fn run(
        &mut self,
        mut commands: mpsc::Receiver<UiCommand>,
        mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Result<()> {
        let mut history_rx = self
            .history_rx
            .take()
            .ok_or_else(|| anyhow!("chat engine is already running"))?;
        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.session_changed().await;
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(event) = transport_events.recv() => self.handle_transport_event(event).await,
                Some(result) = history_rx.recv() => self.on_history_result(result).await,
                _ = sweep.tick() => self.sweep().await,
            }
        }

        self.history_rx = Some(history_rx);
        info!("engine: command channel closed, stopping");
        Ok(())
    }

    pub async fn handle_command(&mut self, command: UiCommand) {
        let outcome = match command {
            UiCommand::SessionChanged => {
                self.session_changed().await;
                Ok(())
            }
            UiCommand::Login(actor) => {
                self.login(actor).await;
                Ok(())
            }
            UiCommand::OpenConversation(key) => {
                self.open_conversation(&key).await;
                Ok(())
            }
            UiCommand::Send {
                key,
                text,
                image_ref,
            } => self.send(&key, &text, image_ref).await.map(|_| ()),
            UiCommand::Focus(key) => {
                self.focus(&key);
                Ok(())
            }
            UiCommand::Blur => {
                self.blur();
                Ok(())
            }
            UiCommand::HideConversation(key) => {
                self.hide_conversation(&key).await;
                Ok(())
            }
            UiCommand::StartChat(peer) => self.start_chat(&peer).await.map(|_| ()),
            UiCommand::UpdateProfile(fields) => self.update_profile(&fields).await.map(|_| ()),
            UiCommand::RequestDelete { key, message_id } => {
                self.request_delete(&key, &message_id)
            }
            UiCommand::Foregrounded => {
                self.foregrounded();
                Ok(())
            }
            UiCommand::Logout => {
                self.logout().await;
                Ok(())
            }
        };

        if let Err(err) = outcome {
            if err.is_user_visible() {
                self.publish(ClientEvent::Error(err.to_string()));
            } else {
                warn!("engine: command failed: {err}");
            }
        }
    }

    /// Resolves the actor and binds the connection to it.
    pub async fn session_changed(&mut self) -> Option<Actor> {
        match self.identity.resolve().await {
            Some(actor) => {
                self.bind_actor(&actor).await;
                Some(actor)
            }
            None => {
                if self.connection.is_initialized() {
                    info!("engine: session ended, tearing down");
                    self.reset_session().await;
                }
                self.publish(ClientEvent::IdentityChanged(None));
                None
            }
        }
    }

    pub async fn login(&mut self, actor: Actor) -> Actor {
        let actor = self.identity.login(actor).await;
        self.bind_actor(&actor).await;
        actor
    }

    pub async fn open_conversation(&mut self, key: &ConversationKey) -> Vec<Message> {
        if self.directory.ensure(key) {
            self.publish(ClientEvent::ConversationsChanged);
        }
        let messages = if self.sync.is_loaded(key) {
            self.sync.messages(key)
        } else {
            let messages = self.sync.load(key).await;
            self.spawn_history_fetch(key);
            messages
        };
        self.publish(ClientEvent::ViewChanged {
            key: key.clone(),
            messages: messages.clone(),
        });
        messages
    }

    pub async fn send(
        &mut self,
        key: &ConversationKey,
        text: &str,
        image_ref: Option<String>,
    ) -> Result<Message, SyncError> {
        let actor = self
            .identity
            .current()
            .cloned()
            .ok_or(SyncError::NotLoggedIn)?;
        let message = self
            .sync
            .send(key, &actor, self.tenant_id.clone(), text, image_ref)
            .await?;

        if self.directory.note_message(key, &message, true) {
            self.publish(ClientEvent::ConversationsChanged);
        }
        self.publish_view(key);
        self.connection.emit(ClientRequest::Send {
            message: message.clone(),
            tenant_slug: self.tenant_slug.clone(),
        });
        Ok(message)
    }

    pub fn focus(&mut self, key: &ConversationKey) {
        self.presence.focus(key);
        self.publish_unread(key);
    }

    pub fn blur(&mut self) {
        self.presence.blur();
    }

    pub async fn hide_conversation(&mut self, key: &ConversationKey) {
        self.sync.hide(key).await;
        self.presence.forget(key);
        self.directory.hide(key);
        info!(conversation = %key, "engine: conversation hidden");
        self.publish(ClientEvent::ConversationsChanged);
        self.publish_unread(key);
    }

    pub async fn start_chat(&mut self, peer: &ActorSummary) -> Result<ConversationKey, SyncError> {
        if self.identity.current().is_none() {
            return Err(SyncError::NotLoggedIn);
        }
        let identity = &self.identity;
        let key = self.directory.start_direct(peer, |id| identity.is_self(id))?;
        self.publish(ClientEvent::ConversationsChanged);
        self.open_conversation(&key).await;
        Ok(key)
    }

    pub async fn update_profile(&mut self, fields: &ProfileFields) -> Result<Actor, SyncError> {
        let actor = self.identity.update_profile(fields).await?;
        self.connection.reidentify(&actor.summary());
        self.publish(ClientEvent::IdentityChanged(Some(actor.clone())));
        Ok(actor)
    }

    /// Asks the server to delete a message. The local copy stays until the
    /// server broadcasts the deletion.
    pub fn request_delete(
        &mut self,
        key: &ConversationKey,
        message_id: &MessageId,
    ) -> Result<(), SyncError> {
        if self.identity.current().is_none() {
            return Err(SyncError::NotLoggedIn);
        }
        let room_id = match key {
            ConversationKey::Room(room_id) => Some(room_id.clone()),
            ConversationKey::Direct(_) => None,
        };
        self.connection.emit(ClientRequest::DeleteMessage {
            message_id: message_id.clone(),
            room_id,
            tenant_slug: self.tenant_slug.clone(),
        });
        Ok(())
    }

    pub fn foregrounded(&mut self) {
        self.connection.on_foregrounded();
        self.publish_connection_state();
    }

    pub async fn logout(&mut self) {
        info!("engine: logging out");
        self.reset_session().await;
        self.identity.forget().await;
        self.publish(ClientEvent::IdentityChanged(None));
    }

    pub async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => self.connection.on_connected(),
            TransportEvent::Reconnected { attempt } => self.connection.on_reconnected(attempt),
            TransportEvent::Disconnected { reason } => self.connection.on_disconnected(reason),
            TransportEvent::ConnectError(err) => self.connection.on_connect_error(&err),
            TransportEvent::Server(event) => self.handle_server_event(event).await,
        }
        self.publish_connection_state();
    }

    async fn handle_server_event(&mut self, event: ServerEvent) {
        if self.identity.current().is_none() {
            debug!("engine: dropping server event without a local actor");
            return;
        }
        match event {
            ServerEvent::IdentityAssigned(ack) => self.on_identity_assigned(ack).await,
            ServerEvent::IdentityConfirmed(ack) => {
                self.connection.on_identity_ack(&ack, false);
                self.learn_tenant(&ack);
            }
            ServerEvent::Message { message } => self.on_message(message).await,
            ServerEvent::MessageDeleted {
                message_id,
                conversation_key,
            } => {
                if let Some(key) = self
                    .sync
                    .on_message_deleted(&message_id, conversation_key.as_ref())
                    .await
                {
                    self.publish_view(&key);
                }
            }
            ServerEvent::Presence {
                online_actors,
                online_ids,
                room_counts,
            } => {
                self.presence.apply_presence(PresenceSnapshot {
                    online_actors,
                    online_actor_ids: online_ids.into_iter().collect(),
                    room_occupancy: room_counts,
                });
                self.publish(ClientEvent::PresenceChanged(
                    self.presence.snapshot().clone(),
                ));
            }
            ServerEvent::RateLimited { retry_after_ms } => {
                warn!(retry_after_ms, "engine: server is rate limiting sends");
                self.publish(ClientEvent::SendRejected {
                    retry_after_ms: Some(retry_after_ms),
                    reason: "rate limited".into(),
                });
            }
            ServerEvent::Error(error) => {
                warn!(code = ?error.code, "engine: server rejected request: {}", error.message);
                let rejection = SyncError::ServerRejection(error.to_string());
                self.publish(ClientEvent::Error(rejection.to_string()));
            }
        }
    }

    async fn on_identity_assigned(&mut self, ack: IdentityAck) {
        let allowed = self.identity.can_promote();
        if let Some(new_id) = self.connection.on_identity_ack(&ack, allowed) {
            match self.identity.promote(new_id, &ack.alias).await {
                Ok(actor) => self.publish(ClientEvent::IdentityChanged(Some(actor))),
                Err(err) => warn!("engine: promotion failed: {err}"),
            }
        }
        self.learn_tenant(&ack);
    }

    async fn on_message(&mut self, message: Message) {
        let message = message.normalized();
        let identity = &self.identity;
        let key = message.conversation_key_for(|id| identity.is_self(id));
        let from_self = identity.is_self(&message.sender_id);
        if let ConversationKey::Direct(peer_id) = &key {
            if !from_self && !self.is_addressed_to_self(&message) {
                debug!(peer_id = %peer_id, "engine: ignoring direct message for another actor");
                return;
            }
        }

        let displayed = self.sync.on_message_received(&key, message.clone()).await;
        if !displayed {
            return;
        }
        if self.directory.note_message(&key, &message, from_self) {
            self.publish(ClientEvent::ConversationsChanged);
        }
        self.publish_view(&key);
        if self.presence.on_message(&key, from_self) {
            self.publish_unread(&key);
        }
    }

    fn is_addressed_to_self(&self, message: &Message) -> bool {
        match &message.target {
            MessageTarget::Direct(recipient) => self.identity.is_self(recipient),
            MessageTarget::Room(_) => true,
        }
    }

    async fn on_history_result(&mut self, result: HistoryResult) {
        if result.epoch != self.session_epoch {
            debug!(conversation = %result.key, "engine: dropping stale history result");
            return;
        }
        match result.result {
            Ok(history) => {
                let report = self.sync.reconcile_history(&result.key, history).await;
                if report.changed() {
                    self.publish_view(&result.key);
                }
            }
            Err(err) => {
                self.sync.abandon_history_fetch(&result.key);
                warn!(
                    conversation = %result.key,
                    "engine: history fetch failed, keeping cached view: {err}"
                );
            }
        }
    }

    pub async fn sweep(&mut self) {
        let report = self.sync.sweep().await;
        for key in &report.changed {
            self.publish_view(key);
        }
    }

    async fn bind_actor(&mut self, actor: &Actor) {
        let previous = self.connection.last_initialized_actor_id().cloned();
        match self.connection.ensure_connected(&actor.summary()) {
            Ok(true) => {
                if previous.is_some_and(|previous| previous != actor.id) {
                    // Another actor's cached conversations must not surface.
                    self.sync.clear().await;
                    self.clear_memory();
                }
                self.restore_conversations(&actor.id).await;
            }
            Ok(false) => {}
            Err(err) => warn!(actor_id = %actor.id, "engine: could not start connection: {err}"),
        }
        self.publish(ClientEvent::IdentityChanged(Some(actor.clone())));
        self.publish_connection_state();
    }

    async fn restore_conversations(&mut self, actor_id: &ActorId) {
        let peers = self.sync.restore_direct(actor_id).await;
        if peers.is_empty() {
            return;
        }
        for (peer_id, summary) in peers {
            let key = ConversationKey::Direct(peer_id);
            self.directory.ensure(&key);
            if let Some(summary) = summary {
                let identity = &self.identity;
                if let Err(err) = self
                    .directory
                    .start_direct(&summary, |id| identity.is_self(id))
                {
                    debug!(conversation = %key, "engine: skipping restored entry: {err}");
                }
            }
        }
        self.publish(ClientEvent::ConversationsChanged);
    }

    async fn reset_session(&mut self) {
        self.connection.teardown();
        self.sync.clear().await;
        self.clear_memory();
        self.tenant_id = None;
        self.publish_connection_state();
    }

    fn clear_memory(&mut self) {
        self.sync.clear_memory();
        self.presence.reset();
        self.directory.clear();
        self.session_epoch += 1;
        self.publish(ClientEvent::ConversationsChanged);
    }

    fn learn_tenant(&mut self, ack: &IdentityAck) {
        if let Some(tenant_id) = &ack.tenant_id {
            if self.tenant_id.as_ref() != Some(tenant_id) {
                debug!(tenant_id = %tenant_id, "engine: tenant id learned from server");
                self.tenant_id = Some(tenant_id.clone());
            }
        }
    }

    fn spawn_history_fetch(&mut self, key: &ConversationKey) {
        let Some(actor) = self.identity.current() else {
            return;
        };
        let local_actor_id = actor.id.clone();
        self.sync.begin_history_fetch(key);
        let history = Arc::clone(&self.history);
        let tx = self.history_tx.clone();
        let key = key.clone();
        let limit = self.sync.history_limit();
        let epoch = self.session_epoch;
        tokio::spawn(async move {
            let result = history
                .fetch_history(&key, &local_actor_id, limit)
                .await
                .map_err(|err| format!("{err:#}"));
            let _ = tx.send(HistoryResult { epoch, key, result });
        });
    }

    fn publish(&self, event: ClientEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn publish_view(&self, key: &ConversationKey) {
        self.publish(ClientEvent::ViewChanged {
            key: key.clone(),
            messages: self.sync.messages(key),
        });
    }

    fn publish_unread(&self, key: &ConversationKey) {
        self.publish(ClientEvent::UnreadChanged {
            key: key.clone(),
            count: self.presence.unread(key),
            total: self.presence.total_unread(),
        });
    }

    fn publish_connection_state(&mut self) {
        let state = self.connection.state();
        if state != self.reported_state {
            self.reported_state = state;
            self.publish(ClientEvent::ConnectionChanged(state));
        }
    }

    /// Waits for the next history result and applies it.
    #[cfg(test)]
    async fn apply_next_history_result(&mut self) -> bool {
        let Some(rx) = self.history_rx.as_mut() else {
            return false;
        };
        let next = rx.recv().await;
        match next {
            Some(result) => {
                self.on_history_result(result).await;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
#[path = "tests/engine_tests.rs"]
mod tests;
