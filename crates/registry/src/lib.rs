use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{domain::UserId, error::CoreError, protocol::ServerEvent};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

/// Resolves a presented credential to an identity; the registry itself never
/// inspects credentials.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, credential: &str) -> Result<UserId, CoreError>;
}

pub struct MissingIdentityVerifier;

#[async_trait]
impl IdentityVerifier for MissingIdentityVerifier {
    async fn verify(&self, _credential: &str) -> Result<UserId, CoreError> {
        Err(CoreError::Authentication(
            "identity verifier is unavailable".to_string(),
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelHandle(u64);

pub type EventSender = mpsc::UnboundedSender<ServerEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<ServerEvent>;

struct Binding {
    handle: ChannelHandle,
    bound_at: DateTime<Utc>,
    sender: EventSender,
}

/// Identity to live-channel map. Bindings are ephemeral and never persisted;
/// a disconnect unbinds.
pub struct ChannelRegistry {
    verifier: Box<dyn IdentityVerifier>,
    bindings: RwLock<HashMap<UserId, Vec<Binding>>>,
    next_handle: AtomicU64,
}

#[derive(Debug)]
pub struct BoundChannel {
    pub identity: UserId,
    pub handle: ChannelHandle,
    pub bound_at: DateTime<Utc>,
    pub events: EventReceiver,
}

impl ChannelRegistry {
    pub fn new(verifier: Box<dyn IdentityVerifier>) -> Self {
        Self {
            verifier,
            bindings: RwLock::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Verifies the credential and binds a fresh channel for the resolved
    /// identity; nothing is ever bound for an unverified credential.
    pub async fn bind(&self, credential: &str) -> Result<BoundChannel, CoreError> {
        let identity = self.verifier.verify(credential).await?;
        let handle = ChannelHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let bound_at = Utc::now();
        let (sender, events) = mpsc::unbounded_channel();

        let went_online = {
            let mut bindings = self.bindings.write().await;
            let entry = bindings.entry(identity.clone()).or_default();
            let was_offline = entry.is_empty();
            entry.push(Binding {
                handle,
                bound_at,
                sender,
            });
            was_offline
        };

        info!(identity = %identity, handle = handle.0, "channel bound");
        if went_online {
            self.broadcast_presence(&identity, true).await;
        }

        Ok(BoundChannel {
            identity,
            handle,
            bound_at,
            events,
        })
    }

    /// Idempotent; called on disconnect for any reason.
    pub async fn unbind(&self, handle: ChannelHandle) {
        let went_offline = {
            let mut bindings = self.bindings.write().await;
            let mut owner = None;
            for (identity, channels) in bindings.iter_mut() {
                let before = channels.len();
                channels.retain(|binding| binding.handle != handle);
                if channels.len() != before && channels.is_empty() {
                    owner = Some(identity.clone());
                }
            }
            if let Some(identity) = &owner {
                bindings.remove(identity);
            }
            owner
        };

        debug!(handle = handle.0, "channel unbound");
        if let Some(identity) = went_offline {
            self.broadcast_presence(&identity, false).await;
        }
    }

    /// Pushes `event` to every channel currently bound to `identity` and
    /// returns the number reached; zero is a silent no-op.
    pub async fn send(&self, identity: &UserId, event: ServerEvent) -> usize {
        self.send_filtered(identity, None, event).await
    }

    /// Pushes to every channel of `identity` except the one named.
    pub async fn send_except(
        &self,
        identity: &UserId,
        excluded: ChannelHandle,
        event: ServerEvent,
    ) -> usize {
        self.send_filtered(identity, Some(excluded), event).await
    }

    async fn send_filtered(
        &self,
        identity: &UserId,
        excluded: Option<ChannelHandle>,
        event: ServerEvent,
    ) -> usize {
        let senders: Vec<EventSender> = {
            let bindings = self.bindings.read().await;
            match bindings.get(identity) {
                Some(channels) => channels
                    .iter()
                    .filter(|binding| Some(binding.handle) != excluded)
                    .map(|binding| binding.sender.clone())
                    .collect(),
                None => Vec::new(),
            }
        };

        if senders.is_empty() {
            debug!(identity = %identity, "delivery unavailable: no bound channel");
            return 0;
        }

        let mut delivered = 0;
        for sender in senders {
            // A closed receiver means the transport is tearing down and its
            // unbind has not landed yet; tolerated, not an error.
            if sender.send(event.clone()).is_ok() {
                delivered += 1;
            } else {
                warn!(identity = %identity, "dropped event for closing channel");
            }
        }
        delivered
    }

    pub async fn is_online(&self, identity: &UserId) -> bool {
        let bindings = self.bindings.read().await;
        bindings
            .get(identity)
            .map(|channels| !channels.is_empty())
            .unwrap_or(false)
    }

    pub async fn bound_channel_count(&self, identity: &UserId) -> usize {
        let bindings = self.bindings.read().await;
        bindings.get(identity).map(Vec::len).unwrap_or(0)
    }

    /// Presence fan-out to every other bound identity, fired on the first
    /// bind and last unbind for an identity.
    async fn broadcast_presence(&self, identity: &UserId, online: bool) {
        let timestamp = Utc::now();
        let event = if online {
            ServerEvent::UserOnline {
                user_id: identity.clone(),
                timestamp,
            }
        } else {
            ServerEvent::UserOffline {
                user_id: identity.clone(),
                timestamp,
            }
        };

        let senders: Vec<EventSender> = {
            let bindings = self.bindings.read().await;
            bindings
                .iter()
                .filter(|(other, _)| *other != identity)
                .flat_map(|(_, channels)| channels.iter().map(|binding| binding.sender.clone()))
                .collect()
        };

        for sender in senders {
            let _ = sender.send(event.clone());
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
