use std::sync::Arc;

use shared::domain::{Actor, ActorId, ProfileFields};
use tracing::{info, warn};

use crate::{error::SyncError, LocalCache, SessionSource};

/// Decides which actor this client is, and keeps the persisted record in step.
pub struct IdentityResolver {
    sessions: Arc<dyn SessionSource>,
    cache: Arc<dyn LocalCache>,
    current: Option<Actor>,
    // Ids this actor held before a server-side promotion.
    former_ids: Vec<ActorId>,
    promoted: bool,
}

impl IdentityResolver {
    pub fn new(sessions: Arc<dyn SessionSource>, cache: Arc<dyn LocalCache>) -> Self {
        Self {
            sessions,
            cache,
            current: None,
            former_ids: Vec::new(),
            promoted: false,
        }
    }

    pub fn current(&self) -> Option<&Actor> {
        self.current.as_ref()
    }

    /// Resolution order: authoritative session, persisted anonymous record,
    /// backup session. A persisted confirmed record without a live session is
    /// stale and is discarded together with the message cache.
    pub async fn resolve(&mut self) -> Option<Actor> {
        let session_lookup_failed = match self.sessions.authoritative_session().await {
            Ok(Some(actor)) => {
                info!(actor_id = %actor.id, "identity: resolved from session");
                self.persist(&actor).await;
                self.adopt(actor.clone());
                return Some(actor);
            }
            Ok(None) => false,
            Err(err) => {
                warn!("identity: session lookup failed: {err:#}");
                true
            }
        };

        match self.cache.load_actor().await {
            Ok(Some(actor)) if actor.is_anonymous => {
                info!(actor_id = %actor.id, "identity: resolved from local record");
                self.adopt(actor.clone());
                return Some(actor);
            }
            Ok(Some(actor)) if session_lookup_failed => {
                // Cannot tell a logged-out session from an unreachable server.
                warn!(
                    actor_id = %actor.id,
                    "identity: keeping confirmed record while the session is unverifiable"
                );
            }
            Ok(Some(actor)) => {
                warn!(
                    actor_id = %actor.id,
                    "identity: discarding confirmed record without session"
                );
                if let Err(err) = self.cache.clear_actor().await {
                    warn!("identity: failed to clear actor record: {err:#}");
                }
                if let Err(err) = self.cache.clear_all().await {
                    warn!("identity: failed to clear message cache: {err:#}");
                }
            }
            Ok(None) => {}
            Err(err) => {
                warn!("identity: unreadable actor record, discarding: {err:#}");
                if let Err(err) = self.cache.clear_actor().await {
                    warn!("identity: failed to clear actor record: {err:#}");
                }
            }
        }

        match self.sessions.backup_session().await {
            Ok(Some(actor)) => {
                info!(actor_id = %actor.id, "identity: resolved from backup session");
                self.persist(&actor).await;
                self.adopt(actor.clone());
                return Some(actor);
            }
            Ok(None) => {}
            Err(err) => warn!("identity: backup session lookup failed: {err:#}"),
        }

        self.current = None;
        None
    }

    /// Explicit login, e.g. an anonymous alias entered by the user.
    pub async fn login(&mut self, actor: Actor) -> Actor {
        self.persist(&actor).await;
        self.adopt(actor.clone());
        actor
    }

    pub fn can_promote(&self) -> bool {
        !self.promoted && self.current.as_ref().is_some_and(|actor| actor.is_anonymous)
    }

    /// Replaces a provisional id with the server-assigned one. Allowed once per
    /// anonymous actor.
    pub async fn promote(&mut self, new_id: ActorId, alias: &str) -> Result<Actor, SyncError> {
        if !self.can_promote() {
            return Err(SyncError::IdentityConflict(format!(
                "promotion to {new_id} refused"
            )));
        }
        let Some(actor) = self.current.as_mut() else {
            return Err(SyncError::NotLoggedIn);
        };
        if actor.id == new_id {
            return Ok(actor.clone());
        }

        let previous = std::mem::replace(&mut actor.id, new_id);
        if !alias.trim().is_empty() {
            actor.display_name = alias.to_string();
        }
        let promoted = actor.clone();
        info!(previous_actor_id = %previous, actor_id = %promoted.id, "identity: promoted");
        self.former_ids.push(previous);
        self.promoted = true;
        self.persist(&promoted).await;
        Ok(promoted)
    }

    /// Applies a profile edit locally (last write wins) and forwards it to the
    /// session backend for confirmed actors.
    pub async fn update_profile(&mut self, fields: &ProfileFields) -> Result<Actor, SyncError> {
        let Some(actor) = self.current.as_mut() else {
            return Err(SyncError::NotLoggedIn);
        };
        if let Some(name) = &fields.display_name {
            if name.trim().is_empty() {
                return Err(SyncError::Validation("display name cannot be empty".into()));
            }
        }
        fields.apply_to(actor);
        let updated = actor.clone();
        self.persist(&updated).await;

        if !updated.is_anonymous && !fields.is_empty() {
            if let Err(err) = self.sessions.update_profile(fields).await {
                warn!(actor_id = %updated.id, "identity: profile sync failed: {err:#}");
            }
        }
        Ok(updated)
    }

    pub async fn forget(&mut self) {
        if let Err(err) = self.cache.clear_actor().await {
            warn!("identity: failed to clear actor record: {err:#}");
        }
        self.current = None;
        self.former_ids.clear();
        self.promoted = false;
    }

    /// True for the current id and any id held before promotion.
    pub fn is_self(&self, id: &ActorId) -> bool {
        self.current.as_ref().is_some_and(|actor| &actor.id == id) || self.former_ids.contains(id)
    }

    fn adopt(&mut self, actor: Actor) {
        let same_actor = self
            .current
            .as_ref()
            .is_some_and(|current| current.id == actor.id);
        if !same_actor {
            self.former_ids.clear();
            self.promoted = false;
        }
        self.current = Some(actor);
    }

    async fn persist(&self, actor: &Actor) {
        if let Err(err) = self.cache.store_actor(actor).await {
            warn!(actor_id = %actor.id, "identity: failed to persist actor record: {err:#}");
        }
    }
}

#[cfg(test)]
#[path = "tests/identity_tests.rs"]
mod tests;
