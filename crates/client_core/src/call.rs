use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::{
    domain::{CallId, CallState, UserId},
    error::CoreError,
    protocol::{
        CallAnswerPayload, CallEndPayload, CallEndReason, CallOfferPayload, CallRejectPayload,
        ClientFrame, IceCandidatePayload,
    },
};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

pub const DEFAULT_RING_TIMEOUT: Duration = Duration::from_secs(30);

/// Media backend for one peer connection; SDP and candidate payloads are
/// opaque to the coordinator.
#[async_trait]
pub trait MediaSession: Send + Sync {
    async fn acquire_media(&self, is_video: bool) -> Result<()>;
    async fn create_offer(&self) -> Result<String>;
    async fn create_answer(&self, remote_offer: &str) -> Result<String>;
    async fn apply_remote_answer(&self, sdp: &str) -> Result<()>;
    async fn add_remote_candidate(&self, candidate: &serde_json::Value) -> Result<()>;
    async fn close(&self);
}

pub struct MissingMediaSession;

#[async_trait]
impl MediaSession for MissingMediaSession {
    async fn acquire_media(&self, _is_video: bool) -> Result<()> {
        Err(anyhow!("media backend is unavailable"))
    }

    async fn create_offer(&self) -> Result<String> {
        Err(anyhow!("media backend is unavailable"))
    }

    async fn create_answer(&self, _remote_offer: &str) -> Result<String> {
        Err(anyhow!("media backend is unavailable"))
    }

    async fn apply_remote_answer(&self, _sdp: &str) -> Result<()> {
        Err(anyhow!("media backend is unavailable"))
    }

    async fn add_remote_candidate(&self, _candidate: &serde_json::Value) -> Result<()> {
        Err(anyhow!("media backend is unavailable"))
    }

    async fn close(&self) {}
}

#[async_trait]
pub trait SignalingOutbound: Send + Sync {
    async fn relay(&self, frame: ClientFrame) -> Result<()>;
}

pub struct MissingSignalingOutbound;

#[async_trait]
impl SignalingOutbound for MissingSignalingOutbound {
    async fn relay(&self, _frame: ClientFrame) -> Result<()> {
        Err(anyhow!("signaling transport is unavailable"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallTransition {
    pub call_id: CallId,
    pub peer: UserId,
    pub state: CallState,
}

struct ActiveCall {
    call_id: CallId,
    peer: UserId,
    is_video: bool,
    pending_offer: Option<CallOfferPayload>,
}

struct Progress {
    state: CallState,
    call: Option<ActiveCall>,
}

impl Progress {
    fn matches(&self, call_id: CallId) -> bool {
        self.call
            .as_ref()
            .map(|call| call.call_id == call_id)
            .unwrap_or(false)
    }
}

/// Client-side lifecycle of the one call this session may have in flight.
/// Out-of-order local operations are refused, stale remote frames are
/// dropped.
pub struct CallCoordinator {
    media: Arc<dyn MediaSession>,
    outbound: Arc<dyn SignalingOutbound>,
    ring_timeout: Duration,
    inner: Mutex<Progress>,
    transitions: broadcast::Sender<CallTransition>,
}

impl CallCoordinator {
    pub fn new(
        media: Arc<dyn MediaSession>,
        outbound: Arc<dyn SignalingOutbound>,
        ring_timeout: Duration,
    ) -> Arc<Self> {
        let (transitions, _) = broadcast::channel(64);
        Arc::new(Self {
            media,
            outbound,
            ring_timeout,
            inner: Mutex::new(Progress {
                state: CallState::Idle,
                call: None,
            }),
            transitions,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallTransition> {
        self.transitions.subscribe()
    }

    pub async fn state(&self) -> CallState {
        self.inner.lock().await.state
    }

    pub async fn active_call_id(&self) -> Option<CallId> {
        self.inner
            .lock()
            .await
            .call
            .as_ref()
            .map(|call| call.call_id)
    }

    pub async fn initiate(self: &Arc<Self>, peer: UserId, is_video: bool) -> Result<CallId> {
        let mut inner = self.inner.lock().await;
        if !matches!(inner.state, CallState::Idle) && !inner.state.is_terminal() {
            return Err(CoreError::InvalidCallState {
                operation: "initiate",
                state: inner.state,
            }
            .into());
        }

        let call_id = CallId::fresh();
        inner.state = CallState::Calling;
        inner.call = Some(ActiveCall {
            call_id,
            peer: peer.clone(),
            is_video,
            pending_offer: None,
        });
        self.emit(call_id, &peer, CallState::Calling);

        if let Err(err) = self.setup_outgoing(call_id, &peer, is_video).await {
            self.fail_in_place(&mut inner).await;
            return Err(err);
        }
        drop(inner);

        self.spawn_ring_timer(call_id);
        Ok(call_id)
    }

    async fn setup_outgoing(&self, call_id: CallId, peer: &UserId, is_video: bool) -> Result<()> {
        self.media.acquire_media(is_video).await?;
        let sdp = self.media.create_offer().await?;
        self.outbound
            .relay(ClientFrame::CallOffer {
                to: peer.clone(),
                offer: CallOfferPayload {
                    call_id,
                    sdp,
                    is_video,
                },
            })
            .await
    }

    fn spawn_ring_timer(self: &Arc<Self>, call_id: CallId) {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(coordinator.ring_timeout).await;
            let mut inner = coordinator.inner.lock().await;
            if inner.state != CallState::Calling || !inner.matches(call_id) {
                return;
            }
            debug!(%call_id, "ring timeout, call failed");
            if let Some(call) = &inner.call {
                let _ = coordinator
                    .outbound
                    .relay(ClientFrame::CallEnded {
                        to: call.peer.clone(),
                        end: CallEndPayload {
                            call_id,
                            reason: CallEndReason::Timeout,
                        },
                    })
                    .await;
            }
            coordinator.fail_in_place(&mut inner).await;
        });
    }

    /// A busy session declines the new call without disturbing the one in
    /// flight.
    pub async fn on_remote_offer(&self, from: UserId, offer: CallOfferPayload) {
        let mut inner = self.inner.lock().await;
        if !matches!(inner.state, CallState::Idle) && !inner.state.is_terminal() {
            debug!(%from, call_id = %offer.call_id, "busy, declining inbound call");
            let _ = self
                .outbound
                .relay(ClientFrame::CallRejected {
                    to: from,
                    reject: CallRejectPayload {
                        call_id: offer.call_id,
                    },
                })
                .await;
            return;
        }

        let call_id = offer.call_id;
        inner.state = CallState::Incoming;
        inner.call = Some(ActiveCall {
            call_id,
            peer: from.clone(),
            is_video: offer.is_video,
            pending_offer: Some(offer),
        });
        self.emit(call_id, &from, CallState::Incoming);
    }

    pub async fn accept(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.state != CallState::Incoming {
            return Err(CoreError::InvalidCallState {
                operation: "accept",
                state: inner.state,
            }
            .into());
        }

        let (call_id, peer, is_video, offer) = {
            let call = inner
                .call
                .as_mut()
                .ok_or_else(|| anyhow!("incoming state without call context"))?;
            let offer = call
                .pending_offer
                .take()
                .ok_or_else(|| anyhow!("incoming call without a stored offer"))?;
            (call.call_id, call.peer.clone(), call.is_video, offer)
        };

        let answered = async {
            self.media.acquire_media(is_video).await?;
            let sdp = self.media.create_answer(&offer.sdp).await?;
            self.outbound
                .relay(ClientFrame::CallAnswer {
                    to: peer.clone(),
                    answer: CallAnswerPayload { call_id, sdp },
                })
                .await
        }
        .await;

        if let Err(err) = answered {
            let _ = self
                .outbound
                .relay(ClientFrame::CallEnded {
                    to: peer,
                    end: CallEndPayload {
                        call_id,
                        reason: CallEndReason::Failure,
                    },
                })
                .await;
            self.fail_in_place(&mut inner).await;
            return Err(err);
        }

        inner.state = CallState::Connected;
        self.emit(call_id, &peer, CallState::Connected);
        Ok(())
    }

    pub async fn reject(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.state != CallState::Incoming {
            return Err(CoreError::InvalidCallState {
                operation: "reject",
                state: inner.state,
            }
            .into());
        }
        let (call_id, peer) = match &inner.call {
            Some(call) => (call.call_id, call.peer.clone()),
            None => return Err(anyhow!("incoming state without call context")),
        };

        let _ = self
            .outbound
            .relay(ClientFrame::CallRejected {
                to: peer.clone(),
                reject: CallRejectPayload { call_id },
            })
            .await;
        inner.state = CallState::Ended;
        self.emit(call_id, &peer, CallState::Ended);
        Ok(())
    }

    pub async fn end(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if !matches!(
            inner.state,
            CallState::Calling | CallState::Incoming | CallState::Connected
        ) {
            return Err(CoreError::InvalidCallState {
                operation: "end",
                state: inner.state,
            }
            .into());
        }
        let (call_id, peer) = match &inner.call {
            Some(call) => (call.call_id, call.peer.clone()),
            None => return Err(anyhow!("active state without call context")),
        };

        let _ = self
            .outbound
            .relay(ClientFrame::CallEnded {
                to: peer.clone(),
                end: CallEndPayload {
                    call_id,
                    reason: CallEndReason::Hangup,
                },
            })
            .await;
        self.media.close().await;
        inner.state = CallState::Ended;
        self.emit(call_id, &peer, CallState::Ended);
        Ok(())
    }

    pub async fn on_remote_answer(&self, answer: CallAnswerPayload) {
        let mut inner = self.inner.lock().await;
        if inner.state != CallState::Calling || !inner.matches(answer.call_id) {
            debug!(call_id = %answer.call_id, state = %inner.state, "stale answer dropped");
            return;
        }
        let peer = match &inner.call {
            Some(call) => call.peer.clone(),
            None => return,
        };

        if let Err(err) = self.media.apply_remote_answer(&answer.sdp).await {
            warn!(call_id = %answer.call_id, %err, "failed to apply remote answer");
            let _ = self
                .outbound
                .relay(ClientFrame::CallEnded {
                    to: peer,
                    end: CallEndPayload {
                        call_id: answer.call_id,
                        reason: CallEndReason::Failure,
                    },
                })
                .await;
            self.fail_in_place(&mut inner).await;
            return;
        }

        inner.state = CallState::Connected;
        self.emit(answer.call_id, &peer, CallState::Connected);
    }

    /// Forwards a locally gathered candidate to the peer; valid while a call
    /// is in flight, no state change.
    pub async fn relay_ice_candidate(&self, candidate: serde_json::Value) -> Result<()> {
        let inner = self.inner.lock().await;
        if !matches!(
            inner.state,
            CallState::Calling | CallState::Incoming | CallState::Connected
        ) {
            return Err(CoreError::InvalidCallState {
                operation: "relay_ice_candidate",
                state: inner.state,
            }
            .into());
        }
        let (call_id, peer) = match &inner.call {
            Some(call) => (call.call_id, call.peer.clone()),
            None => return Err(anyhow!("active state without call context")),
        };

        self.outbound
            .relay(ClientFrame::CallIceCandidate {
                to: peer,
                candidate: IceCandidatePayload { call_id, candidate },
            })
            .await
    }

    pub async fn on_remote_ice(&self, candidate: IceCandidatePayload) {
        let inner = self.inner.lock().await;
        let active = matches!(
            inner.state,
            CallState::Calling | CallState::Incoming | CallState::Connected
        );
        if !active || !inner.matches(candidate.call_id) {
            debug!(call_id = %candidate.call_id, "stale ICE candidate dropped");
            return;
        }
        if let Err(err) = self.media.add_remote_candidate(&candidate.candidate).await {
            warn!(call_id = %candidate.call_id, %err, "failed to add remote candidate");
        }
    }

    pub async fn on_remote_end(&self, end: CallEndPayload) {
        let mut inner = self.inner.lock().await;
        if inner.state.is_terminal() || !inner.matches(end.call_id) {
            return;
        }
        let peer = match &inner.call {
            Some(call) => call.peer.clone(),
            None => return,
        };

        self.media.close().await;
        inner.state = match end.reason {
            CallEndReason::Hangup => CallState::Ended,
            CallEndReason::Timeout | CallEndReason::Failure => CallState::Failed,
        };
        self.emit(end.call_id, &peer, inner.state);
    }

    pub async fn on_remote_reject(&self, reject: CallRejectPayload) {
        let mut inner = self.inner.lock().await;
        if inner.state != CallState::Calling || !inner.matches(reject.call_id) {
            return;
        }
        let peer = match &inner.call {
            Some(call) => call.peer.clone(),
            None => return,
        };

        self.media.close().await;
        inner.state = CallState::Ended;
        self.emit(reject.call_id, &peer, CallState::Ended);
    }

    /// Transport loss fails the local call without any outbound frame.
    pub async fn on_transport_failed(&self) {
        let mut inner = self.inner.lock().await;
        if !matches!(
            inner.state,
            CallState::Calling | CallState::Incoming | CallState::Connected
        ) {
            return;
        }
        self.fail_in_place(&mut inner).await;
    }

    async fn fail_in_place(&self, inner: &mut Progress) {
        self.media.close().await;
        inner.state = CallState::Failed;
        if let Some(call) = &inner.call {
            self.emit(call.call_id, &call.peer, CallState::Failed);
        }
    }

    fn emit(&self, call_id: CallId, peer: &UserId, state: CallState) {
        let _ = self.transitions.send(CallTransition {
            call_id,
            peer: peer.clone(),
            state,
        });
    }
}

#[cfg(test)]
#[path = "tests/call_tests.rs"]
mod tests;
