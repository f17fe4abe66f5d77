use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{
        ws::rejection::WebSocketUpgradeRejection, Path, Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tracing::{error, info, warn};

use lifecycle::ApiContext;
use shared::{
    domain::{ConversationId, MessageId, SessionId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{ClientCommand, ServerEvent},
};
use storage::Storage;

mod auth;
mod config;
mod dispatch;
mod rooms;
mod timers;

use auth::AuthKeys;
use config::{load_settings, prepare_database_url};
use dispatch::dispatch;
use rooms::Rooms;
use timers::TimerRegistry;

pub struct AppState {
    ctx: ApiContext,
    rooms: Rooms,
    timers: Arc<TimerRegistry>,
    auth: AuthKeys,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserQuery {
    user_id: i64,
}

#[derive(Debug, Deserialize)]
struct ListMessagesQuery {
    limit: Option<u32>,
    before: Option<i64>,
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

    let state = Arc::new(AppState {
        ctx: ApiContext { storage },
        rooms: Rooms::new(settings.room_buffer),
        timers: TimerRegistry::new(),
        auth: AuthKeys::from_secret(&settings.auth_secret),
    });
    let app = build_router(state);

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/commands", post(http_command))
        .route("/conversations", get(http_list_conversations))
        .route(
            "/conversations/:conversation_id/messages",
            get(http_list_messages),
        )
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

fn error_status(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::CircuitOpen | ErrorCode::Transient => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: ApiError) -> (StatusCode, Json<ApiError>) {
    (error_status(err.code), Json(err))
}

/// Command submission with the resulting event as the acknowledgment body.
/// This is the offline sync engine's replay target: a replayed command with
/// a known client reference acks with the original result.
async fn http_command(
    State(state): State<Arc<AppState>>,
    Json(cmd): Json<ClientCommand>,
) -> Result<Json<Option<ServerEvent>>, (StatusCode, Json<ApiError>)> {
    let event = dispatch(&state, None, cmd).await.map_err(error_response)?;
    Ok(Json(event))
}

async fn http_list_conversations(
    State(state): State<Arc<AppState>>,
    Query(q): Query<UserQuery>,
) -> Result<Json<Vec<shared::protocol::ConversationRecord>>, (StatusCode, Json<ApiError>)> {
    let conversations = lifecycle::list_conversations(&state.ctx, UserId(q.user_id))
        .await
        .map_err(error_response)?;
    Ok(Json(conversations))
}

async fn http_list_messages(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<i64>,
    Query(q): Query<ListMessagesQuery>,
) -> Result<Json<Vec<shared::protocol::MessageRecord>>, (StatusCode, Json<ApiError>)> {
    let limit = q.limit.unwrap_or(100).clamp(1, 100);
    let messages = lifecycle::list_messages(
        &state.ctx,
        ConversationId(conversation_id),
        limit,
        q.before.map(MessageId),
    )
    .await
    .map_err(error_response)?;
    Ok(Json(messages))
}

/// Authentication happens once here, at the handshake. A missing or invalid
/// credential rejects the upgrade; no per-message re-authentication follows.
/// The upgrade extractor is deferred behind the token check so a bad
/// credential always maps to 401, never to an upgrade rejection.
async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<WsQuery>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let token = match q.token {
        Some(token) => token,
        None => {
            return error_response(ApiError::new(
                ErrorCode::Unauthorized,
                "missing credential",
            ))
            .into_response()
        }
    };
    let user_id = match state.auth.verify(&token) {
        Ok(user_id) => user_id,
        Err(err) => return error_response(err).into_response(),
    };
    match ws {
        Ok(ws) => ws.on_upgrade(move |socket| ws_connection(state, socket, user_id)),
        Err(rejection) => rejection.into_response(),
    }
}

async fn ws_connection(
    state: Arc<AppState>,
    socket: axum::extract::ws::WebSocket,
    user_id: UserId,
) {
    use axum::extract::ws::Message;
    use futures::{SinkExt, StreamExt};

    let (mut sender, mut receiver) = socket.split();
    let (session_id, mut events_rx) = state.rooms.register_session().await;
    info!(session_id = session_id.0, user_id = user_id.0, "session connected");

    let send_task = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = receiver.next().await {
        let Message::Text(text) = msg else { continue };
        let cmd: ClientCommand = match serde_json::from_str(&text) {
            Ok(cmd) => cmd,
            Err(parse_err) => {
                warn!(session_id = session_id.0, %parse_err, "unparseable command");
                state
                    .rooms
                    .send_to(
                        session_id,
                        ServerEvent::Error(ApiError::validation(format!(
                            "unparseable command: {parse_err}"
                        ))),
                    )
                    .await;
                continue;
            }
        };
        if let Err(err) = handle_socket_command(&state, session_id, cmd).await {
            // Reported to the triggering session only; the room's broadcast
            // loop keeps running for everyone else.
            state.rooms.send_to(session_id, ServerEvent::Error(err)).await;
        }
    }

    state.rooms.unregister_session(session_id).await;
    send_task.abort();
    info!(session_id = session_id.0, "session disconnected");
}

async fn handle_socket_command(
    state: &Arc<AppState>,
    session_id: SessionId,
    cmd: ClientCommand,
) -> Result<(), ApiError> {
    dispatch(state, Some(session_id), cmd).await.map(|_| ())
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
