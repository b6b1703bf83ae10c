use std::collections::VecDeque;

use shared::{
    domain::{ActorId, ActorSummary},
    protocol::{ClientRequest, IdentityAck},
};
use tracing::{debug, info, warn};

use crate::{
    error::SyncError,
    transport::{DisconnectReason, Transport},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Identifying,
    Active,
    Recovering,
    Closed,
}

impl ConnectionState {
    pub fn is_online(&self) -> bool {
        matches!(self, Self::Identifying | Self::Active)
    }
}

/// Owns the transport for the lifetime of a login and drives the identify
/// handshake on every (re)connect.
pub struct ConnectionManager {
    transport: Box<dyn Transport>,
    endpoint: String,
    tenant_slug: String,
    state: ConnectionState,
    initialized: bool,
    // Distinct from `identity`: only a new actor id may trigger a fresh connection.
    last_initialized_actor_id: Option<ActorId>,
    identity: Option<ActorSummary>,
    outbound: VecDeque<ClientRequest>,
}

impl ConnectionManager {
    pub fn new(
        transport: Box<dyn Transport>,
        endpoint: impl Into<String>,
        tenant_slug: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            endpoint: endpoint.into(),
            tenant_slug: tenant_slug.into(),
            state: ConnectionState::Idle,
            initialized: false,
            last_initialized_actor_id: None,
            identity: None,
            outbound: VecDeque::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn tenant_slug(&self) -> &str {
        &self.tenant_slug
    }

    pub fn identity(&self) -> Option<&ActorSummary> {
        self.identity.as_ref()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn last_initialized_actor_id(&self) -> Option<&ActorId> {
        self.last_initialized_actor_id.as_ref()
    }

    pub fn queued_requests(&self) -> usize {
        self.outbound.len()
    }

    /// Opens the transport for `actor` unless a connection was already set up
    /// for the same actor id. Returns whether a new connection was started.
    pub fn ensure_connected(&mut self, actor: &ActorSummary) -> Result<bool, SyncError> {
        if self.initialized && self.last_initialized_actor_id.as_ref() == Some(&actor.id) {
            // Alias or profile edits only refresh the ref.
            self.identity = Some(actor.clone());
            return Ok(false);
        }

        if self.initialized {
            info!(
                previous_actor_id = ?self.last_initialized_actor_id,
                actor_id = %actor.id,
                "connection: actor changed, replacing connection"
            );
            self.teardown();
        }

        self.state = ConnectionState::Connecting;
        self.identity = Some(actor.clone());
        if let Err(err) = self.transport.open(&self.endpoint) {
            warn!(actor_id = %actor.id, "connection: failed to open transport: {err}");
            self.state = ConnectionState::Idle;
            self.identity = None;
            return Err(err);
        }
        self.initialized = true;
        self.last_initialized_actor_id = Some(actor.id.clone());
        info!(
            actor_id = %actor.id,
            endpoint = %self.endpoint,
            "connection: connecting"
        );
        Ok(true)
    }

    pub fn on_connected(&mut self) {
        if !self.initialized {
            return;
        }
        self.state = ConnectionState::Identifying;
        self.send_join();
    }

    pub fn on_reconnected(&mut self, attempt: u32) {
        if !self.initialized {
            return;
        }
        info!(attempt, "connection: reconnected, re-identifying");
        self.state = ConnectionState::Identifying;
        self.send_join();
    }

    pub fn on_disconnected(&mut self, reason: DisconnectReason) {
        if !self.initialized || self.state == ConnectionState::Closed {
            return;
        }
        warn!(?reason, "connection: transport dropped");
        self.state = ConnectionState::Recovering;
        if reason.is_server_forced() {
            self.transport.reconnect_now();
        }
    }

    pub fn on_connect_error(&mut self, err: &str) {
        debug!(state = ?self.state, "connection: connect attempt failed: {err}");
    }

    /// App returned to the foreground.
    pub fn on_foregrounded(&mut self) {
        if !self.initialized {
            return;
        }
        if self.transport.is_connected() {
            debug!("connection: foregrounded while connected, re-identifying");
            self.send_join();
        } else {
            self.state = ConnectionState::Recovering;
            self.transport.reconnect_now();
        }
    }

    /// Handles `identityAssigned` / `identityConfirmed`. When the server hands
    /// out a different id and `promotion_allowed` is set, the identity ref is
    /// swapped in place and the new id is returned.
    pub fn on_identity_ack(
        &mut self,
        ack: &IdentityAck,
        promotion_allowed: bool,
    ) -> Option<ActorId> {
        if !self.initialized {
            return None;
        }
        let mut promoted = None;
        if let Some(identity) = self.identity.as_mut() {
            if identity.id != ack.id {
                if promotion_allowed {
                    info!(
                        previous_actor_id = %identity.id,
                        actor_id = %ack.id,
                        "connection: identity promoted"
                    );
                    identity.id = ack.id.clone();
                    if !ack.alias.trim().is_empty() {
                        identity.display_name = ack.alias.clone();
                    }
                    self.last_initialized_actor_id = Some(ack.id.clone());
                    promoted = Some(ack.id.clone());
                } else {
                    warn!(
                        actor_id = %identity.id,
                        offered_id = %ack.id,
                        "connection: ignoring identity change"
                    );
                }
            }
        }

        self.state = ConnectionState::Active;
        if promoted.is_some() {
            // Register presence under the new id.
            self.send_join();
        }
        self.flush();
        promoted
    }

    /// Sends now when active, otherwise queues until the next identify ack.
    pub fn emit(&mut self, request: ClientRequest) {
        if self.state == ConnectionState::Active && self.transport.is_connected() {
            if let Err(err) = self.transport.send(&request) {
                warn!(kind = request.kind(), "connection: send failed, queueing: {err}");
                self.outbound.push_back(request);
            }
            return;
        }
        debug!(kind = request.kind(), state = ?self.state, "connection: queueing request");
        self.outbound.push_back(request);
    }

    /// Re-sends the identify handshake with an edited profile.
    pub fn reidentify(&mut self, actor: &ActorSummary) {
        if let Some(identity) = self.identity.as_ref() {
            if identity.id != actor.id {
                warn!(
                    actor_id = %identity.id,
                    offered_id = %actor.id,
                    "connection: refusing to re-identify as another actor"
                );
                return;
            }
        }
        self.identity = Some(actor.clone());
        if matches!(
            self.state,
            ConnectionState::Identifying | ConnectionState::Active
        ) {
            self.send_join();
        }
    }

    /// Logout: closes the transport for good and forgets everything.
    pub fn teardown(&mut self) {
        self.transport.close();
        self.state = ConnectionState::Closed;
        self.initialized = false;
        self.last_initialized_actor_id = None;
        self.identity = None;
        let dropped = self.outbound.len();
        self.outbound.clear();
        info!(dropped_requests = dropped, "connection: closed");
    }

    fn send_join(&mut self) {
        let Some(actor) = self.identity.clone() else {
            return;
        };
        let join = ClientRequest::Join {
            actor,
            tenant_slug: self.tenant_slug.clone(),
        };
        if let Err(err) = self.transport.send(&join) {
            warn!("connection: failed to send join: {err}");
        }
    }

    fn flush(&mut self) {
        while let Some(request) = self.outbound.pop_front() {
            if let Err(err) = self.transport.send(&request) {
                warn!(kind = request.kind(), "connection: flush interrupted: {err}");
                self.outbound.push_front(request);
                break;
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
