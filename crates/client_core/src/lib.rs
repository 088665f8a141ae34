use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use shared::{
    domain::{MessageId, ThreadId, UserId},
    protocol::{ClientFrame, MessagePayload, ServerEvent, ThreadSummary},
};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::warn;
use url::Url;

mod call;
pub use call::{
    CallCoordinator, CallTransition, MediaSession, MissingMediaSession, MissingSignalingOutbound,
    SignalingOutbound, DEFAULT_RING_TIMEOUT,
};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("server refused request: {0}")]
    Http(String),
    #[error("websocket handshake failed: {0}")]
    Handshake(String),
}

/// Events surfaced to the presentation layer.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Server(ServerEvent),
    CallStateChanged(CallTransition),
    Error(String),
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    user_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    user_id: UserId,
    token: String,
}

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    receiver_id: &'a UserId,
    body: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    temp_id: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct MarkReadRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    message_id: Option<MessageId>,
}

#[derive(Debug, Deserialize)]
struct MarkReadResponse {
    count: i64,
}

/// Outbound signaling over the session's live websocket. Frames are queued
/// into the writer task; a torn-down socket surfaces as a transport failure
/// on the call, not as an error here.
struct WsSignaling {
    frames: mpsc::UnboundedSender<ClientFrame>,
}

#[async_trait]
impl SignalingOutbound for WsSignaling {
    async fn relay(&self, frame: ClientFrame) -> Result<()> {
        self.frames
            .send(frame)
            .map_err(|_| anyhow!("signaling channel closed"))
    }
}

/// One authenticated connection to the coordination server: HTTP for the
/// durable surfaces, a websocket for pushes and call signaling, and a single
/// call coordinator (the call lifecycle is one-at-a-time per session).
pub struct RealtimeSession {
    http: reqwest::Client,
    server_url: String,
    token: String,
    identity: UserId,
    call: Arc<CallCoordinator>,
    events: broadcast::Sender<ClientEvent>,
}

impl RealtimeSession {
    /// Logs in, opens the websocket and spawns the event pump. The returned
    /// session is ready for messaging and calls.
    pub async fn connect(
        server_url: &str,
        user_id: &str,
        media: Arc<dyn MediaSession>,
    ) -> Result<Arc<Self>> {
        let http = reqwest::Client::new();
        let login: LoginResponse = http
            .post(format!("{server_url}/login"))
            .json(&LoginRequest { user_id })
            .send()
            .await?
            .error_for_status()
            .map_err(|e| SessionError::Http(e.to_string()))?
            .json()
            .await?;

        let ws_url = websocket_url(server_url, &login.token)?;
        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|e| SessionError::Handshake(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<ClientFrame>();
        let (events, _) = broadcast::channel(1024);

        let call = CallCoordinator::new(
            media,
            Arc::new(WsSignaling { frames: frame_tx }),
            DEFAULT_RING_TIMEOUT,
        );

        let session = Arc::new(Self {
            http,
            server_url: server_url.to_string(),
            token: login.token,
            identity: login.user_id,
            call: Arc::clone(&call),
            events,
        });

        // Writer: drains queued frames into the socket.
        tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(%err, "failed to encode outbound frame");
                        continue;
                    }
                };
                if ws_writer.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        });

        // Forward call state changes alongside server events.
        {
            let session = Arc::clone(&session);
            let mut transitions = call.subscribe();
            tokio::spawn(async move {
                while let Ok(transition) = transitions.recv().await {
                    let _ = session
                        .events
                        .send(ClientEvent::CallStateChanged(transition));
                }
            });
        }

        // Reader: dispatches pushes; call signaling feeds the coordinator.
        {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                while let Some(message) = ws_reader.next().await {
                    match message {
                        Ok(Message::Text(text)) => {
                            match serde_json::from_str::<ServerEvent>(&text) {
                                Ok(event) => session.dispatch(event).await,
                                Err(err) => {
                                    let _ = session.events.send(ClientEvent::Error(format!(
                                        "invalid server event: {err}"
                                    )));
                                }
                            }
                        }
                        Ok(Message::Close(_)) => break,
                        Ok(_) => {}
                        Err(err) => {
                            let _ = session
                                .events
                                .send(ClientEvent::Error(format!("websocket failed: {err}")));
                            break;
                        }
                    }
                }
                session.call.on_transport_failed().await;
            });
        }

        Ok(session)
    }

    pub fn identity(&self) -> &UserId {
        &self.identity
    }

    pub fn call(&self) -> &Arc<CallCoordinator> {
        &self.call
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    async fn dispatch(&self, event: ServerEvent) {
        match &event {
            ServerEvent::CallOffer { from, payload, .. } => {
                self.call.on_remote_offer(from.clone(), payload.clone()).await;
            }
            ServerEvent::CallAnswer { payload, .. } => {
                self.call.on_remote_answer(payload.clone()).await;
            }
            ServerEvent::CallIceCandidate { payload, .. } => {
                self.call.on_remote_ice(payload.clone()).await;
            }
            ServerEvent::CallEnded { payload, .. } => {
                self.call.on_remote_end(payload.clone()).await;
            }
            ServerEvent::CallRejected { payload, .. } => {
                self.call.on_remote_reject(payload.clone()).await;
            }
            _ => {}
        }
        let _ = self.events.send(ClientEvent::Server(event));
    }

    pub async fn send_message(
        &self,
        receiver: &UserId,
        body: &str,
        temp_id: Option<&str>,
    ) -> Result<MessagePayload> {
        let message: MessagePayload = self
            .http
            .post(format!("{}/messages", self.server_url))
            .bearer_auth(&self.token)
            .json(&SendMessageRequest {
                receiver_id: receiver,
                body,
                temp_id,
            })
            .send()
            .await?
            .error_for_status()
            .map_err(|e| SessionError::Http(e.to_string()))?
            .json()
            .await?;
        Ok(message)
    }

    pub async fn fetch_threads(&self) -> Result<Vec<ThreadSummary>> {
        let threads = self
            .http
            .get(format!("{}/threads", self.server_url))
            .bearer_auth(&self.token)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| SessionError::Http(e.to_string()))?
            .json()
            .await?;
        Ok(threads)
    }

    pub async fn fetch_messages(
        &self,
        thread_id: &ThreadId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<MessagePayload>> {
        let mut request = self
            .http
            .get(format!(
                "{}/threads/{}/messages",
                self.server_url, thread_id
            ))
            .bearer_auth(&self.token)
            .query(&[("limit", limit)]);
        if let Some(before) = before {
            request = request.query(&[("before", before.0)]);
        }
        let messages = request
            .send()
            .await?
            .error_for_status()
            .map_err(|e| SessionError::Http(e.to_string()))?
            .json()
            .await?;
        Ok(messages)
    }

    /// Marks the whole thread (or one message) read; returns how many
    /// messages actually transitioned.
    pub async fn mark_read(
        &self,
        thread_id: &ThreadId,
        message_id: Option<MessageId>,
    ) -> Result<i64> {
        let response: MarkReadResponse = self
            .http
            .post(format!("{}/threads/{}/read", self.server_url, thread_id))
            .bearer_auth(&self.token)
            .json(&MarkReadRequest { message_id })
            .send()
            .await?
            .error_for_status()
            .map_err(|e| SessionError::Http(e.to_string()))?
            .json()
            .await?;
        Ok(response.count)
    }

    pub async fn edit_message(&self, message_id: MessageId, body: &str) -> Result<MessagePayload> {
        let message = self
            .http
            .patch(format!("{}/messages/{}", self.server_url, message_id.0))
            .bearer_auth(&self.token)
            .json(&serde_json::json!({ "body": body }))
            .send()
            .await?
            .error_for_status()
            .map_err(|e| SessionError::Http(e.to_string()))?
            .json()
            .await?;
        Ok(message)
    }

    pub async fn delete_message(&self, message_id: MessageId) -> Result<()> {
        self.http
            .delete(format!("{}/messages/{}", self.server_url, message_id.0))
            .bearer_auth(&self.token)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| SessionError::Http(e.to_string()))?;
        Ok(())
    }
}

fn websocket_url(server_url: &str, token: &str) -> Result<Url> {
    let mut url = Url::parse(server_url)
        .with_context(|| format!("invalid server url '{server_url}'"))?
        .join("/ws")?;
    match url.scheme() {
        "http" => url
            .set_scheme("ws")
            .map_err(|_| anyhow!("cannot derive ws scheme"))?,
        "https" => url
            .set_scheme("wss")
            .map_err(|_| anyhow!("cannot derive wss scheme"))?,
        other => return Err(anyhow!("unsupported server url scheme '{other}'")),
    }
    url.query_pairs_mut().append_pair("token", token);
    Ok(url)
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
