use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use registry::{BoundChannel, ChannelHandle, ChannelRegistry};
use serde::{Deserialize, Serialize};
use server_api::{
    delete_message, edit_message, list_messages, list_threads, mark_as_read, relay_friend_event,
    send_message, ApiContext, FriendEventNotice, NewMessage, DEFAULT_PAGE_SIZE,
};
use shared::{
    domain::{MessageId, ThreadId, UserId},
    error::{ApiError, CoreError, ErrorCode},
    protocol::{ClientFrame, MessagePayload, ServerEvent, ThreadSummary},
};
use storage::Storage;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{debug, error, info, warn};

mod auth;
mod config;

use auth::{mint_token, AuthConfig, TokenVerifier};
use config::{load_settings, prepare_database_url};

struct AppState {
    api: ApiContext,
    auth: AuthConfig,
    verifier: TokenVerifier,
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    user_id: UserId,
}

#[derive(Debug, Serialize)]
struct LoginResponse {
    user_id: UserId,
    token: String,
}

#[derive(Debug, Deserialize)]
struct ListMessagesQuery {
    limit: Option<u32>,
    before: Option<MessageId>,
}

#[derive(Debug, Deserialize)]
struct MarkReadRequest {
    #[serde(default)]
    message_id: Option<MessageId>,
}

#[derive(Debug, Serialize)]
struct MarkReadResponse {
    count: i64,
}

#[derive(Debug, Deserialize)]
struct EditMessageRequest {
    body: String,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let auth = AuthConfig {
        secret: settings.auth_secret,
        ttl_seconds: settings.auth_ttl_seconds,
    };
    let registry = Arc::new(ChannelRegistry::new(Box::new(TokenVerifier::new(&auth))));
    let verifier = TokenVerifier::new(&auth);
    let api = ApiContext { storage, registry };

    let state = AppState {
        api,
        auth,
        verifier,
    };
    let app = build_router(Arc::new(state), settings.max_body_bytes);

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/login", post(login))
        .route("/threads", get(http_list_threads))
        .route("/threads/:thread_id/messages", get(http_list_messages))
        .route("/threads/:thread_id/read", post(http_mark_read))
        .route("/messages", post(http_send_message))
        .route(
            "/messages/:message_id",
            axum::routing::patch(http_edit_message).delete(http_delete_message),
        )
        .route("/friends/notify", post(http_friend_notify))
        .route("/ws", get(ws_handler))
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .with_state(state)
}

fn error_response(error: CoreError) -> (StatusCode, Json<ApiError>) {
    let api_error = ApiError::from(error);
    let status = match api_error.code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(api_error))
}

/// Resolves the bearer token on an HTTP request to a verified identity. Every
/// surface except `/login` requires it.
async fn bearer_identity(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<UserId, (StatusCode, Json<ApiError>)> {
    use registry::IdentityVerifier;

    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| {
            error_response(CoreError::Authentication(
                "missing bearer token".to_string(),
            ))
        })?;
    state.verifier.verify(token).await.map_err(error_response)
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, (StatusCode, Json<ApiError>)> {
    let identity = req.user_id;
    if identity.as_str().trim().is_empty() || identity.as_str().contains('_') {
        return Err(error_response(CoreError::InvalidArgument(
            "user id must be non-empty and must not contain '_'".to_string(),
        )));
    }

    let token = mint_token(&state.auth, &identity)
        .map_err(|e| error_response(CoreError::Storage(e)))?;
    Ok(Json(LoginResponse {
        user_id: identity,
        token,
    }))
}

async fn http_list_threads(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<ThreadSummary>>, (StatusCode, Json<ApiError>)> {
    let caller = bearer_identity(&state, &headers).await?;
    let threads = list_threads(&state.api, &caller)
        .await
        .map_err(error_response)?;
    Ok(Json(threads))
}

async fn http_list_messages(
    State(state): State<Arc<AppState>>,
    Path(thread_id): Path<String>,
    Query(q): Query<ListMessagesQuery>,
    headers: HeaderMap,
) -> Result<Json<Vec<MessagePayload>>, (StatusCode, Json<ApiError>)> {
    let caller = bearer_identity(&state, &headers).await?;
    let limit = q.limit.unwrap_or(DEFAULT_PAGE_SIZE);
    let messages = list_messages(
        &state.api,
        &caller,
        &ThreadId::new(thread_id),
        limit,
        q.before,
    )
    .await
    .map_err(error_response)?;
    Ok(Json(messages))
}

async fn http_mark_read(
    State(state): State<Arc<AppState>>,
    Path(thread_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<MarkReadRequest>,
) -> Result<Json<MarkReadResponse>, (StatusCode, Json<ApiError>)> {
    let caller = bearer_identity(&state, &headers).await?;
    let count = mark_as_read(&state.api, &caller, &ThreadId::new(thread_id), req.message_id)
        .await
        .map_err(error_response)?;
    Ok(Json(MarkReadResponse { count }))
}

async fn http_send_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<NewMessage>,
) -> Result<Json<MessagePayload>, (StatusCode, Json<ApiError>)> {
    let sender = bearer_identity(&state, &headers).await?;
    let message = send_message(&state.api, &sender, req, None)
        .await
        .map_err(error_response)?;
    Ok(Json(message))
}

async fn http_edit_message(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<MessageId>,
    headers: HeaderMap,
    Json(req): Json<EditMessageRequest>,
) -> Result<Json<MessagePayload>, (StatusCode, Json<ApiError>)> {
    let sender = bearer_identity(&state, &headers).await?;
    let message = edit_message(&state.api, &sender, message_id, req.body)
        .await
        .map_err(error_response)?;
    Ok(Json(message))
}

async fn http_delete_message(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<MessageId>,
    headers: HeaderMap,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    let sender = bearer_identity(&state, &headers).await?;
    delete_message(&state.api, &sender, message_id)
        .await
        .map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Relationship mutations land here from the friend-graph surface; the caller
/// can only notify on its own behalf.
async fn http_friend_notify(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(notice): Json<FriendEventNotice>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    let caller = bearer_identity(&state, &headers).await?;
    if notice.actor.user_id != caller {
        return Err(error_response(CoreError::ThreadAccessDenied(
            "friend event actor must match the caller".to_string(),
        )));
    }
    relay_friend_event(&state.api.registry, notice).await;
    Ok(StatusCode::NO_CONTENT)
}

/// The credential is verified and the channel bound *before* the upgrade is
/// accepted, so an unauthenticated socket never exists.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<WsQuery>,
) -> Response {
    match state.api.registry.bind(&q.token).await {
        Ok(bound) => {
            let registry = Arc::clone(&state.api.registry);
            let handle = bound.handle;
            ws.on_failed_upgrade(move |_| {
                release_binding(registry, handle);
            })
            .on_upgrade(move |socket| ws_connection(state, bound, socket))
            .into_response()
        }
        Err(err) => error_response(err).into_response(),
    }
}

/// A handshake that never completes skips the connection task entirely, so
/// the binding made before the upgrade has to be released here.
fn release_binding(
    registry: Arc<ChannelRegistry>,
    handle: ChannelHandle,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move { registry.unbind(handle).await })
}

async fn ws_connection(
    state: Arc<AppState>,
    bound: BoundChannel,
    socket: axum::extract::ws::WebSocket,
) {
    use axum::extract::ws::Message;
    use futures::{SinkExt, StreamExt};

    let BoundChannel {
        identity,
        handle,
        mut events,
        ..
    } = bound;
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(identity = %identity, %err, "failed to encode event");
                        continue;
                    }
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientFrame>(&text) {
                            Ok(frame) => {
                                route_frame(&state.api.registry, &identity, frame).await;
                            }
                            Err(err) => {
                                let reply = ServerEvent::Error(ApiError::new(
                                    ErrorCode::Validation,
                                    format!("unrecognized frame: {err}"),
                                ));
                                let text = match serde_json::to_string(&reply) {
                                    Ok(text) => text,
                                    Err(_) => continue,
                                };
                                if sink.send(Message::Text(text)).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    state.api.registry.unbind(handle).await;
}

/// Fans a signaling frame out to the addressee. `from` is always the bound
/// identity of the sending channel, never a field of the frame.
async fn route_frame(registry: &ChannelRegistry, from: &UserId, frame: ClientFrame) {
    let (to, event) = match frame {
        ClientFrame::CallOffer { to, offer } => (
            to.clone(),
            ServerEvent::CallOffer {
                from: from.clone(),
                to,
                payload: offer,
            },
        ),
        ClientFrame::CallAnswer { to, answer } => (
            to.clone(),
            ServerEvent::CallAnswer {
                from: from.clone(),
                to,
                payload: answer,
            },
        ),
        ClientFrame::CallIceCandidate { to, candidate } => (
            to.clone(),
            ServerEvent::CallIceCandidate {
                from: from.clone(),
                to,
                payload: candidate,
            },
        ),
        ClientFrame::CallEnded { to, end } => (
            to.clone(),
            ServerEvent::CallEnded {
                from: from.clone(),
                to,
                payload: end,
            },
        ),
        ClientFrame::CallRejected { to, reject } => (
            to.clone(),
            ServerEvent::CallRejected {
                from: from.clone(),
                to,
                payload: reject,
            },
        ),
    };

    let delivered = registry.send(&to, event).await;
    if delivered == 0 {
        debug!(%from, %to, "signaling peer offline, frame dropped");
    }
}
