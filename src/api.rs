use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;

use crate::{
    config::{save_config, validate_server_config, ServerConfig},
    console::{LogEntry, LogLevel},
    error::PanelError,
    server::{Operation, Server, ServerStats, ServerStatus},
    state::AppState,
};

const CONSOLE_BACKLOG: usize = 100;

#[derive(Serialize)]
pub struct ServerView {
    #[serde(flatten)]
    pub server: Server,
    pub uptime: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending: Option<Operation>,
}

impl ServerView {
    fn new(server: Server, pending: Option<Operation>) -> Self {
        let uptime = server.uptime(Utc::now()).to_string();
        Self {
            server,
            uptime,
            pending,
        }
    }
}

fn view(state: &AppState, server: Server) -> ServerView {
    let pending = state.lifecycle.pending_action(&server.id);
    ServerView::new(server, pending)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub total_servers: usize,
    pub online_servers: usize,
    pub total_players: u32,
}

#[derive(Serialize)]
struct ApiError {
    error: String,
}

#[derive(Deserialize)]
pub struct AppendLog {
    pub level: LogLevel,
    pub message: String,
}

#[derive(Deserialize)]
pub struct CommandRequest {
    pub command: String,
}

#[derive(Serialize)]
struct HistoryStep {
    /// What the input line should now show; absent means leave it alone.
    #[serde(skip_serializing_if = "Option::is_none")]
    command: Option<String>,
}

fn err_response(status: StatusCode, msg: impl Into<String>) -> Response {
    (status, Json(ApiError { error: msg.into() })).into_response()
}

fn panel_error(e: PanelError) -> Response {
    let status = match &e {
        PanelError::NotFound(_) => StatusCode::NOT_FOUND,
        PanelError::AlreadyExists(_)
        | PanelError::InvalidTransition { .. }
        | PanelError::NotRunning(_) => StatusCode::CONFLICT,
        PanelError::OperationTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        PanelError::OperationFailed { .. } => StatusCode::BAD_GATEWAY,
        PanelError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
    };
    err_response(status, e.to_string())
}

pub async fn summary(State(state): State<AppState>) -> impl IntoResponse {
    let servers = state.registry.list();
    Json(Summary {
        total_servers: servers.len(),
        online_servers: servers
            .iter()
            .filter(|s| s.status == ServerStatus::Online)
            .count(),
        total_players: servers.iter().map(|s| s.players).sum(),
    })
}

pub async fn list_servers(State(state): State<AppState>) -> impl IntoResponse {
    let result: Vec<ServerView> = state
        .registry
        .list()
        .into_iter()
        .map(|server| view(&state, server))
        .collect();
    Json(result)
}

pub async fn get_server(Path(id): Path<String>, State(state): State<AppState>) -> Response {
    match state.registry.get(&id) {
        Ok(server) => Json(view(&state, server)).into_response(),
        Err(e) => panel_error(e),
    }
}

/// Persists the new server list first; the registry only changes once the
/// config is on disk.
pub async fn create_server(
    State(state): State<AppState>,
    Json(input): Json<ServerConfig>,
) -> Response {
    if let Err(e) = validate_server_config(&input) {
        return panel_error(PanelError::InvalidConfig(e));
    }

    let mut config = state.config.write().await;
    if state.registry.contains(&input.id) {
        return panel_error(PanelError::AlreadyExists(input.id));
    }
    let mut updated = config.clone();
    updated.servers.push(input.clone());
    if let Err(e) = save_config(&state.config_path, &updated).await {
        tracing::error!("Failed to save config while adding '{}': {:#}", input.id, e);
        return err_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    }
    *config = updated;

    let server = match state.registry.insert(Server::from_config(&input)) {
        Ok(server) => server,
        Err(e) => return panel_error(e),
    };
    drop(config);

    tracing::info!("Added server '{}'", server.id);
    (StatusCode::CREATED, Json(view(&state, server))).into_response()
}

pub async fn delete_server(Path(id): Path<String>, State(state): State<AppState>) -> Response {
    let mut config = state.config.write().await;
    if !state.registry.contains(&id) {
        return panel_error(PanelError::NotFound(id));
    }
    let mut updated = config.clone();
    updated.servers.retain(|s| s.id != id);
    if let Err(e) = save_config(&state.config_path, &updated).await {
        tracing::error!("Failed to save config while removing '{}': {:#}", id, e);
        return err_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    }
    *config = updated;

    if let Err(e) = state.lifecycle.remove_server(&id) {
        return panel_error(e);
    }
    drop(config);

    tracing::info!("Removed server '{}'", id);
    StatusCode::NO_CONTENT.into_response()
}

fn accepted(state: &AppState, result: Result<Server, PanelError>) -> Response {
    match result {
        Ok(server) => (StatusCode::ACCEPTED, Json(view(state, server))).into_response(),
        Err(e) => panel_error(e),
    }
}

pub async fn start_server_handler(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    accepted(&state, state.lifecycle.start(&id))
}

pub async fn stop_server_handler(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    accepted(&state, state.lifecycle.stop(&id))
}

pub async fn restart_server_handler(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    accepted(&state, state.lifecycle.restart(&id))
}

pub async fn report_stats(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(stats): Json<ServerStats>,
) -> Response {
    match state.lifecycle.report_stats(&id, stats) {
        Ok(server) => Json(view(&state, server)).into_response(),
        Err(e) => panel_error(e),
    }
}

pub async fn console_logs(Path(id): Path<String>, State(state): State<AppState>) -> Response {
    match state.consoles.logs(&id).await {
        Ok(logs) => Json(logs).into_response(),
        Err(e) => panel_error(e),
    }
}

/// Output lines fed in by whatever runs the server.
pub async fn append_console_log(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(input): Json<AppendLog>,
) -> Response {
    match state
        .consoles
        .append_log(&id, LogEntry::new(input.level, input.message))
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => panel_error(e),
    }
}

pub async fn clear_console_logs(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    match state.consoles.clear_logs(&id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => panel_error(e),
    }
}

pub async fn export_console_logs(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    match state.consoles.export_logs(&id).await {
        Ok((file_name, text)) => (
            [
                (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{}\"", file_name.replace('"', "")),
                ),
            ],
            text,
        )
            .into_response(),
        Err(e) => panel_error(e),
    }
}

pub async fn submit_command(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(input): Json<CommandRequest>,
) -> Response {
    match state.consoles.submit_command(&id, &input.command).await {
        Ok(Some(entry)) => (StatusCode::ACCEPTED, Json(entry)).into_response(),
        Ok(None) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => panel_error(e),
    }
}

pub async fn console_history(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    match state.consoles.history(&id).await {
        Ok(history) => Json(history).into_response(),
        Err(e) => panel_error(e),
    }
}

pub async fn history_older(Path(id): Path<String>, State(state): State<AppState>) -> Response {
    match state.consoles.history_older(&id).await {
        Ok(command) => Json(HistoryStep { command }).into_response(),
        Err(e) => panel_error(e),
    }
}

pub async fn history_newer(Path(id): Path<String>, State(state): State<AppState>) -> Response {
    match state.consoles.history_newer(&id).await {
        Ok(command) => Json(HistoryStep { command }).into_response(),
        Err(e) => panel_error(e),
    }
}

pub async fn console_ws(
    ws: WebSocketUpgrade,
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_console_ws(socket, id, state))
}

fn entry_message(entry: &LogEntry) -> Option<Message> {
    serde_json::to_string(entry)
        .ok()
        .map(|json| Message::Text(json.into()))
}

async fn handle_console_ws(mut socket: WebSocket, id: String, state: AppState) {
    let (backlog, mut console_rx) = match state.consoles.follow(&id, CONSOLE_BACKLOG).await {
        Ok(follow) => follow,
        Err(e) => {
            let _ = socket.send(Message::Text(e.to_string().into())).await;
            return;
        }
    };

    for entry in &backlog {
        if let Some(msg) = entry_message(entry) {
            if socket.send(msg).await.is_err() {
                return;
            }
        }
    }

    loop {
        tokio::select! {
            msg = console_rx.recv() => {
                match msg {
                    Ok(entry) => {
                        if let Some(msg) = entry_message(&entry) {
                            if socket.send(msg).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("Console viewer for '{}' lagged by {} lines", id, skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            ws_msg = socket.recv() => {
                match ws_msg {
                    Some(Ok(Message::Text(text))) => {
                        #[derive(Deserialize)]
                        struct WsCommand {
                            #[serde(rename = "type")]
                            kind: String,
                            data: String,
                        }
                        if let Ok(cmd) = serde_json::from_str::<WsCommand>(&text) {
                            if cmd.kind == "command" {
                                // Failures already land in the log stream.
                                let _ = state.consoles.submit_command(&id, &cmd.data).await;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    _ => {}
                }
            }
        }
    }
}

pub async fn events_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_events_ws(socket, state))
}

async fn handle_events_ws(socket: WebSocket, state: AppState) {
    let mut events_rx = state.registry.events().subscribe();
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            event = events_rx.recv() => {
                match event {
                    Ok(event) => {
                        let Ok(json) = serde_json::to_string(&event) else {
                            continue;
                        };
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("Event subscriber lagged by {} events", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
        }
    }
}
