// Copyright (C) 2026 MineClaw Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    net::SocketAddr,
    pin::Pin,
    process::Stdio,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::Context;
use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use chrono::Utc;
use mineclaw_common::{
    ChatMessage, InboundChatEvent, Position, SessionId, SessionStatus,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    process::{Child, ChildStdin, Command},
    sync::{Mutex, mpsc, oneshot},
    time::{MissedTickBehavior, interval},
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};
use uuid::Uuid;

const AVAILABILITY_POLL_INTERVAL: Duration = Duration::from_secs(5);
const AVAILABILITY_PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const COMMAND_SETTLE_DELAY: Duration = Duration::from_millis(500);
const MAX_CHAT_BUFFER: usize = 200;
const MAX_CHAT_MESSAGE_LEN: usize = 500;
const MAX_WAIT_SECONDS: f64 = 30.0;
const WALK_CLOSE_RANGE: f64 = 10.0;
const AI_CHAT_PREFIX: &str = "!ai ";

#[derive(Clone)]
struct AppState {
    sessions: Arc<Mutex<HashMap<SessionId, SessionRecord>>>,
    server_available: Arc<AtomicBool>,
    chat: Arc<Mutex<ChatBuffer>>,
    connector: Arc<dyn WorldConnector>,
    chat_relay: Arc<dyn ChatRelay>,
    capabilities: Capabilities,
}

struct SessionRecord {
    username: String,
    status: SessionStatus,
    session: Arc<dyn WorldSession>,
    /// Serializes world-mutating commands per session: at most one in-flight
    /// command may touch the connection handle at a time.
    command_gate: Arc<Mutex<()>>,
    events: tokio::task::JoinHandle<()>,
}

/// Feature set of this manager instance. The historical deployments are
/// configurations of the same binary rather than separate codebases.
#[derive(Debug, Clone)]
struct Capabilities {
    chat_buffer: bool,
    creative_actions: bool,
    walk_to_fallback: bool,
    auto_reconnect: bool,
    reconnect_delay: Duration,
}

impl Capabilities {
    fn from_env() -> Self {
        Self {
            chat_buffer: parse_bool_env("BOT_MANAGER_CHAT_BUFFER", true),
            creative_actions: parse_bool_env("BOT_MANAGER_CREATIVE_ACTIONS", false),
            walk_to_fallback: parse_bool_env("BOT_MANAGER_WALK_TO_FALLBACK", true),
            auto_reconnect: parse_bool_env("BOT_MANAGER_AUTO_RECONNECT", false),
            reconnect_delay: Duration::from_millis(
                std::env::var("BOT_MANAGER_RECONNECT_DELAY_MS")
                    .ok()
                    .and_then(|value| value.parse::<u64>().ok())
                    .unwrap_or(10_000),
            ),
        }
    }
}

fn parse_bool_env(var_name: &str, default: bool) -> bool {
    std::env::var(var_name)
        .ok()
        .map(|value| matches!(value.trim(), "1" | "true" | "TRUE" | "yes"))
        .unwrap_or(default)
}

/// Asynchronous lifecycle events emitted by a live game connection.
#[derive(Debug, Clone)]
enum SessionEvent {
    Joined,
    Kicked { reason: String },
    Ended,
    Died,
    Chat { sender: String, message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionVitals {
    position: Position,
    health: f64,
    food: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ItemStack {
    name: String,
    count: u32,
    slot: u32,
}

/// Pathfinder movement parameters applied once per ready transition.
#[derive(Debug, Clone, Serialize)]
struct MovementProfile {
    can_dig: bool,
    allow_towers: bool,
    can_open_doors: bool,
    allow_free_motion: bool,
    allow_parkour: bool,
}

impl Default for MovementProfile {
    fn default() -> Self {
        Self {
            can_dig: true,
            allow_towers: true,
            can_open_doors: true,
            allow_free_motion: false,
            allow_parkour: true,
        }
    }
}

/// Factory for live game connections. Lifecycle events for the connection are
/// delivered on the channel handed to `connect`.
#[async_trait]
trait WorldConnector: Send + Sync {
    async fn connect(
        &self,
        username: &str,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> anyhow::Result<Arc<dyn WorldSession>>;
}

/// One live connection to the game world. All world behavior (pathfinding,
/// digging, inventory manipulation) is delegated through this seam; the
/// manager only translates catalog calls onto it.
#[async_trait]
trait WorldSession: Send + Sync {
    async fn vitals(&self) -> anyhow::Result<SessionVitals>;
    async fn observe(&self) -> anyhow::Result<Value>;
    async fn look_around(&self) -> anyhow::Result<Value>;
    async fn player_position(&self, player_name: &str) -> anyhow::Result<Option<Position>>;
    async fn navigate_to(&self, x: f64, y: f64, z: f64, range: f64) -> anyhow::Result<()>;
    async fn stop_navigation(&self) -> anyhow::Result<()>;
    async fn dig(&self, position: Position) -> anyhow::Result<()>;
    async fn place_block(&self, position: Position, block_name: &str) -> anyhow::Result<()>;
    async fn scan_blocks(
        &self,
        block_type: &str,
        max_distance: u32,
        max_count: u32,
    ) -> anyhow::Result<Vec<Position>>;
    async fn inventory(&self) -> anyhow::Result<Vec<ItemStack>>;
    async fn collect_items(&self, max_distance: f64) -> anyhow::Result<u32>;
    async fn equip_item(&self, item_name: &str, slot: &str) -> anyhow::Result<()>;
    async fn send_chat(&self, message: &str) -> anyhow::Result<()>;
    async fn run_command(&self, command: &str) -> anyhow::Result<()>;
    async fn fly_to(&self, x: f64, y: f64, z: f64) -> anyhow::Result<()>;
    async fn configure_movement(&self, profile: &MovementProfile) -> anyhow::Result<()>;
    async fn respawn(&self) -> anyhow::Result<()>;
    async fn close(&self);
}

/// Outbound leg of the chat bridge as seen from the game side: forwards
/// `!ai`-prefixed player chat to the configured webhook.
#[async_trait]
trait ChatRelay: Send + Sync {
    fn is_configured(&self) -> bool;
    async fn forward(&self, event: &InboundChatEvent) -> anyhow::Result<()>;
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "bot_manager_service=debug,tower_http=info".to_string()),
        )
        .init();

    let game_host = std::env::var("MC_HOST")
        .ok()
        .unwrap_or_else(|| "localhost".to_string());
    let game_port = std::env::var("MC_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(25565);
    let game_addr = format!("{game_host}:{game_port}");

    let connector = Arc::new(DriverConnector::from_env(game_host, game_port));
    let chat_relay = Arc::new(WebhookChatRelay::from_env());
    if !chat_relay.is_configured() {
        info!("chat relay is not configured; in-game !ai messages will not be forwarded");
    }

    let capabilities = Capabilities::from_env();
    info!(
        chat_buffer = capabilities.chat_buffer,
        creative_actions = capabilities.creative_actions,
        walk_to_fallback = capabilities.walk_to_fallback,
        auto_reconnect = capabilities.auto_reconnect,
        %game_addr,
        "bot-manager capabilities loaded"
    );

    let state = AppState {
        sessions: Arc::new(Mutex::new(HashMap::new())),
        server_available: Arc::new(AtomicBool::new(false)),
        chat: Arc::new(Mutex::new(ChatBuffer::new(MAX_CHAT_BUFFER))),
        connector,
        chat_relay,
        capabilities,
    };

    tokio::spawn(run_availability_poller(
        game_addr,
        state.server_available.clone(),
    ));

    let app = build_router(state);
    let bind_addr = parse_bind_addr("BOT_MANAGER_BIND", "127.0.0.1:3001")?;
    info!(%bind_addr, "bot-manager-service listening");
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/health", get(health))
        .route("/spawn", post(spawn_handler))
        .route("/despawn/{id}", delete(despawn_handler))
        .route("/bots", get(list_bots_handler))
        .route("/bots/{id}", get(get_bot_handler))
        .route("/bots/{id}/execute", post(execute_handler))
        .route("/bots/{id}/observe", get(observe_handler))
        .route("/bots/{id}/tools", get(tools_handler));

    if state.capabilities.chat_buffer {
        router = router.route("/chat", get(chat_handler));
    }
    if state.capabilities.walk_to_fallback {
        router = router.route("/bots/{id}/walk-to", post(walk_to_handler));
    }

    router
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

fn parse_bind_addr(var_name: &str, default: &str) -> anyhow::Result<SocketAddr> {
    let value = std::env::var(var_name)
        .ok()
        .unwrap_or_else(|| default.to_string());
    value.parse().context(format!("invalid {var_name}"))
}

// ---------------------------------------------------------------------------
// Availability poller
// ---------------------------------------------------------------------------

async fn probe_game_server(addr: &str) -> bool {
    matches!(
        tokio::time::timeout(AVAILABILITY_PROBE_TIMEOUT, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

/// Process-lifetime liveness loop for the upstream game server. The flag it
/// maintains is only an admission check for `spawn`; existing sessions are
/// unaffected by it going false.
async fn run_availability_poller(addr: String, flag: Arc<AtomicBool>) {
    let mut ticker = interval(AVAILABILITY_POLL_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let available = probe_game_server(&addr).await;
        let was_available = flag.swap(available, Ordering::SeqCst);
        if available && !was_available {
            info!(%addr, "game server is available");
        }
        if !available && was_available {
            warn!(%addr, "game server is no longer reachable");
        }
    }
}

// ---------------------------------------------------------------------------
// Chat buffer
// ---------------------------------------------------------------------------

/// Bounded FIFO of recent in-game chat. Upstream slash-commands never enter
/// the buffer.
struct ChatBuffer {
    entries: VecDeque<ChatMessage>,
    capacity: usize,
}

impl ChatBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity,
        }
    }

    fn push(&mut self, sender: &str, message: &str) {
        if sender.is_empty() || message.is_empty() || message.starts_with('/') {
            return;
        }
        self.entries.push_back(ChatMessage {
            sender: sender.to_string(),
            message: message.to_string(),
            timestamp: Utc::now(),
        });
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn recent(&self, limit: usize) -> Vec<ChatMessage> {
        self.entries.iter().rev().take(limit).cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// Session lifecycle
// ---------------------------------------------------------------------------

/// Opens a connection for `username` and registers the record under
/// `session_id` with status `spawning`. Used by the spawn handler and by
/// auto-reconnect replacements. Boxed because the reconnect path re-enters
/// this function through the event pump, making the future type recursive.
fn connect_session<'a>(
    state: &'a AppState,
    session_id: &'a str,
    username: &'a str,
) -> Pin<Box<dyn Future<Output = Result<(), ApiError>> + Send + 'a>> {
    Box::pin(async move {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = state
            .connector
            .connect(username, events_tx)
            .await
            .map_err(|error| {
                ApiError::bad_gateway(format!("failed to open game connection: {error}"))
            })?;

        // The registry lock is held across spawning the pump, so the pump's
        // first event cannot observe a missing record.
        let mut sessions = state.sessions.lock().await;
        let pump = tokio::spawn(run_session_events(
            state.clone(),
            session_id.to_string(),
            username.to_string(),
            session.clone(),
            events_rx,
        ));
        sessions.insert(
            session_id.to_string(),
            SessionRecord {
                username: username.to_string(),
                status: SessionStatus::Spawning,
                session,
                command_gate: Arc::new(Mutex::new(())),
                events: pump,
            },
        );
        Ok(())
    })
}

/// Per-session event pump. Runs until the connection is over or the session
/// is despawned.
async fn run_session_events(
    state: AppState,
    session_id: String,
    username: String,
    session: Arc<dyn WorldSession>,
    mut events_rx: mpsc::UnboundedReceiver<SessionEvent>,
) {
    let mut joined_once = false;
    while let Some(event) = events_rx.recv().await {
        match event {
            SessionEvent::Joined => {
                if !joined_once {
                    joined_once = true;
                    if let Err(error) = session.configure_movement(&MovementProfile::default()).await
                    {
                        warn!(%session_id, %username, %error, "failed to configure movement profile");
                    }
                }
                let mut sessions = state.sessions.lock().await;
                if let Some(record) = sessions.get_mut(&session_id)
                    && record.status == SessionStatus::Spawning
                {
                    record.status = SessionStatus::Ready;
                    info!(%session_id, %username, "bot joined the world");
                }
            }
            SessionEvent::Died => {
                info!(%session_id, %username, "bot died, respawning in place");
                if let Err(error) = session.respawn().await {
                    warn!(%session_id, %username, %error, "respawn request failed");
                }
            }
            SessionEvent::Kicked { reason } => {
                warn!(%session_id, %username, %reason, "bot was kicked");
                handle_disconnect(&state, &session_id, &username).await;
                break;
            }
            SessionEvent::Ended => {
                info!(%session_id, %username, "bot connection ended");
                handle_disconnect(&state, &session_id, &username).await;
                break;
            }
            SessionEvent::Chat { sender, message } => {
                handle_chat_event(&state, session.as_ref(), &sender, &message).await;
            }
        }
    }
}

/// Marks the record disconnected (terminal for this session instance) and,
/// when auto-reconnect is on, schedules a replacement session under a fresh
/// id. The disconnected record stays visible until explicitly despawned.
async fn handle_disconnect(state: &AppState, session_id: &str, username: &str) {
    let still_present = {
        let mut sessions = state.sessions.lock().await;
        match sessions.get_mut(session_id) {
            Some(record) => {
                record.status = SessionStatus::Disconnected;
                true
            }
            None => false,
        }
    };

    if still_present && state.capabilities.auto_reconnect {
        tokio::spawn(run_reconnect(
            state.clone(),
            session_id.to_string(),
            username.to_string(),
        ));
    }
}

async fn run_reconnect(state: AppState, old_session_id: String, username: String) {
    loop {
        tokio::time::sleep(state.capabilities.reconnect_delay).await;

        // Stop once the disconnected record has been despawned: the operator
        // no longer wants this identity online.
        let still_wanted = {
            let sessions = state.sessions.lock().await;
            sessions
                .get(&old_session_id)
                .map(|record| record.status == SessionStatus::Disconnected)
                .unwrap_or(false)
        };
        if !still_wanted {
            return;
        }

        if !state.server_available.load(Ordering::SeqCst) {
            debug!(%username, "skipping reconnect attempt; game server unavailable");
            continue;
        }

        let new_session_id = Uuid::new_v4().to_string();
        match connect_session(&state, &new_session_id, &username).await {
            Ok(()) => {
                info!(
                    old_session_id = %old_session_id,
                    new_session_id = %new_session_id,
                    %username,
                    "spawned replacement session after disconnect"
                );
                return;
            }
            Err(error) => {
                warn!(%username, error = %error.message, "reconnect attempt failed");
            }
        }
    }
}

async fn handle_chat_event(
    state: &AppState,
    session: &dyn WorldSession,
    sender: &str,
    message: &str,
) {
    if sender.is_empty() {
        return;
    }

    if state.capabilities.chat_buffer {
        let mut chat = state.chat.lock().await;
        chat.push(sender, message);
    }

    let Some(text) = message.strip_prefix(AI_CHAT_PREFIX) else {
        return;
    };
    if is_managed_username(state, sender).await {
        return;
    }
    if !state.chat_relay.is_configured() {
        debug!(%sender, "chat relay not configured, skipping forwarding");
        return;
    }

    let position = session.player_position(sender).await.ok().flatten();
    let event = InboundChatEvent {
        player: sender.to_string(),
        message: text.to_string(),
        position,
    };
    info!(player = %event.player, "forwarding chat message to webhook");
    if let Err(error) = state.chat_relay.forward(&event).await {
        warn!(player = %event.player, %error, "failed to forward chat message");
    }
}

async fn is_managed_username(state: &AppState, username: &str) -> bool {
    let sessions = state.sessions.lock().await;
    sessions.values().any(|record| record.username == username)
}

async fn session_is_ready(state: &AppState, session_id: &str) -> bool {
    let sessions = state.sessions.lock().await;
    sessions
        .get(session_id)
        .map(|record| record.status == SessionStatus::Ready)
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// HTTP handlers
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SpawnRequest {
    #[serde(default)]
    username: Option<String>,
}

#[derive(Debug, Serialize)]
struct SpawnResponse {
    id: SessionId,
    username: String,
    status: SessionStatus,
}

#[derive(Debug, Serialize)]
struct DespawnResponse {
    success: bool,
}

#[derive(Debug, Serialize)]
struct BotSummary {
    id: SessionId,
    username: String,
    status: SessionStatus,
    position: Option<Position>,
}

#[derive(Debug, Serialize)]
struct BotDetail {
    id: SessionId,
    username: String,
    status: SessionStatus,
    position: Option<Position>,
    health: Option<f64>,
    food: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ExecuteRequest {
    #[serde(default)]
    tool: Option<String>,
    #[serde(default)]
    input: Option<Value>,
}

#[derive(Debug, Serialize)]
struct ExecuteResponse {
    result: Value,
    bot_state: Option<BotStateSnapshot>,
}

#[derive(Debug, Serialize)]
struct BotStateSnapshot {
    position: Position,
    health: f64,
    food: f64,
}

#[derive(Debug, Deserialize)]
struct ChatQuery {
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct ChatResponse {
    messages: Vec<ChatMessage>,
    total: usize,
}

#[derive(Debug, Deserialize)]
struct WalkToRequest {
    #[serde(default)]
    x: Option<f64>,
    #[serde(default)]
    y: Option<f64>,
    #[serde(default)]
    z: Option<f64>,
    #[serde(default)]
    timeout: Option<f64>,
}

#[derive(Debug, Serialize)]
struct WalkToResponse {
    success: bool,
    method: &'static str,
}

async fn health() -> Json<Value> {
    Json(json!({"ok": true, "service": "bot-manager-service"}))
}

async fn spawn_handler(
    State(state): State<AppState>,
    Json(request): Json<SpawnRequest>,
) -> Result<Json<SpawnResponse>, ApiError> {
    if !state.server_available.load(Ordering::SeqCst) {
        return Err(ApiError::service_unavailable(
            "game server is not available yet",
        ));
    }

    let username = request
        .username
        .as_deref()
        .map(str::trim)
        .unwrap_or_default();
    if username.is_empty() {
        return Err(ApiError::bad_request("missing 'username' field"));
    }

    let session_id = Uuid::new_v4().to_string();
    connect_session(&state, &session_id, username).await?;
    info!(%session_id, %username, "bot spawning");

    Ok(Json(SpawnResponse {
        id: session_id,
        username: username.to_string(),
        status: SessionStatus::Spawning,
    }))
}

async fn despawn_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<DespawnResponse>, ApiError> {
    let record = {
        let mut sessions = state.sessions.lock().await;
        sessions
            .remove(&session_id)
            .ok_or_else(|| ApiError::not_found("bot not found"))?
    };

    record.events.abort();
    // Close failures are swallowed: the record is gone either way.
    record.session.close().await;
    info!(%session_id, username = %record.username, "bot despawned");
    Ok(Json(DespawnResponse { success: true }))
}

async fn list_bots_handler(State(state): State<AppState>) -> Json<Vec<BotSummary>> {
    let snapshot: Vec<(SessionId, String, SessionStatus, Arc<dyn WorldSession>)> = {
        let sessions = state.sessions.lock().await;
        sessions
            .iter()
            .map(|(id, record)| {
                (
                    id.clone(),
                    record.username.clone(),
                    record.status,
                    record.session.clone(),
                )
            })
            .collect()
    };

    let mut list = Vec::with_capacity(snapshot.len());
    for (id, username, status, session) in snapshot {
        let position = if status == SessionStatus::Ready {
            session.vitals().await.ok().map(|vitals| vitals.position)
        } else {
            None
        };
        list.push(BotSummary {
            id,
            username,
            status,
            position,
        });
    }
    Json(list)
}

async fn get_bot_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<BotDetail>, ApiError> {
    let (username, status, session) = {
        let sessions = state.sessions.lock().await;
        let record = sessions
            .get(&session_id)
            .ok_or_else(|| ApiError::not_found("bot not found"))?;
        (
            record.username.clone(),
            record.status,
            record.session.clone(),
        )
    };

    let vitals = if status == SessionStatus::Ready {
        session.vitals().await.ok()
    } else {
        None
    };

    Ok(Json(BotDetail {
        id: session_id,
        username,
        status,
        position: vitals.as_ref().map(|v| v.position),
        health: vitals.as_ref().map(|v| v.health),
        food: vitals.as_ref().map(|v| v.food),
    }))
}

async fn execute_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<ExecuteRequest>,
) -> Result<Json<ExecuteResponse>, ApiError> {
    let tool = request
        .tool
        .as_deref()
        .map(str::trim)
        .filter(|tool| !tool.is_empty())
        .ok_or_else(|| ApiError::bad_request("missing 'tool' field"))?;

    let command = parse_tool_command(tool, request.input.unwrap_or_else(|| json!({})))?;
    if command.requires_creative() && !state.capabilities.creative_actions {
        return Err(ApiError::bad_request(format!(
            "tool '{tool}' is not enabled on this manager"
        )));
    }

    let (username, status, session, gate) = {
        let sessions = state.sessions.lock().await;
        let record = sessions
            .get(&session_id)
            .ok_or_else(|| ApiError::not_found("bot not found"))?;
        (
            record.username.clone(),
            record.status,
            record.session.clone(),
            record.command_gate.clone(),
        )
    };

    // Not-ready sessions never reach the underlying action; the caller still
    // gets a well-formed result payload rather than a transport error.
    let mut ready = status == SessionStatus::Ready;
    let result = if !ready {
        json!({"error": "bot is not ready"})
    } else {
        let _in_flight = gate.lock().await;
        // The session may have dropped out of ready while this command was
        // queued behind the gate.
        ready = session_is_ready(&state, &session_id).await;
        if !ready {
            json!({"error": "bot is not ready"})
        } else {
            match run_tool(session.as_ref(), &username, &command).await {
                Ok(value) => value,
                Err(error) => json!({"error": error.to_string()}),
            }
        }
    };

    let bot_state = if ready {
        session
            .vitals()
            .await
            .ok()
            .map(|vitals| BotStateSnapshot {
                position: vitals.position,
                health: vitals.health,
                food: vitals.food,
            })
    } else {
        None
    };

    Ok(Json(ExecuteResponse { result, bot_state }))
}

async fn observe_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let (status, session) = {
        let sessions = state.sessions.lock().await;
        let record = sessions
            .get(&session_id)
            .ok_or_else(|| ApiError::not_found("bot not found"))?;
        (record.status, record.session.clone())
    };

    if status != SessionStatus::Ready {
        return Err(ApiError::service_unavailable("bot is not ready"));
    }

    let observation = session
        .observe()
        .await
        .map_err(|error| ApiError::bad_gateway(format!("observation failed: {error}")))?;
    Ok(Json(observation))
}

async fn tools_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Vec<Value>>, ApiError> {
    {
        let sessions = state.sessions.lock().await;
        if !sessions.contains_key(&session_id) {
            return Err(ApiError::not_found("bot not found"));
        }
    }
    Ok(Json(tool_definitions(&state.capabilities)))
}

async fn chat_handler(
    State(state): State<AppState>,
    Query(query): Query<ChatQuery>,
) -> Json<ChatResponse> {
    let limit = query.limit.unwrap_or(20).clamp(1, MAX_CHAT_BUFFER);
    let chat = state.chat.lock().await;
    Json(ChatResponse {
        messages: chat.recent(limit),
        total: chat.len(),
    })
}

async fn walk_to_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<WalkToRequest>,
) -> Result<Json<WalkToResponse>, ApiError> {
    let (username, status, session, gate) = {
        let sessions = state.sessions.lock().await;
        let record = sessions
            .get(&session_id)
            .ok_or_else(|| ApiError::not_found("bot not found"))?;
        (
            record.username.clone(),
            record.status,
            record.session.clone(),
            record.command_gate.clone(),
        )
    };
    if status != SessionStatus::Ready {
        return Err(ApiError::service_unavailable("bot is not ready"));
    }

    let (Some(x), Some(y), Some(z)) = (request.x, request.y, request.z) else {
        return Err(ApiError::bad_request("missing x, y, or z coordinates"));
    };

    let _in_flight = gate.lock().await;

    // Readiness can lapse while queued behind the gate.
    if !session_is_ready(&state, &session_id).await {
        return Err(ApiError::service_unavailable("bot is not ready"));
    }

    let vitals = session
        .vitals()
        .await
        .map_err(|error| ApiError::bad_gateway(format!("failed to read position: {error}")))?;

    // Far targets get a head-start teleport to the 10-block ring so the
    // bounded navigation only has to cover the close range.
    let target = Position::new(x.round() as i64, y.round() as i64, z.round() as i64);
    let distance = vitals.position.horizontal_distance_to(&target);
    if distance > WALK_CLOSE_RANGE {
        let dx = (target.x - vitals.position.x) as f64;
        let dz = (target.z - vitals.position.z) as f64;
        let ratio = WALK_CLOSE_RANGE / distance;
        let near_x = (x - dx * ratio).round() as i64;
        let near_z = (z - dz * ratio).round() as i64;
        if let Err(error) = session
            .run_command(&format!("/tp {username} {near_x} {y} {near_z}"))
            .await
        {
            warn!(%session_id, %error, "pre-teleport failed; walking the full distance");
        }
        tokio::time::sleep(COMMAND_SETTLE_DELAY).await;
    }

    let timeout = Duration::from_secs_f64(request.timeout.unwrap_or(10.0).max(1.0));
    let mut method = "walked";
    let walked = tokio::time::timeout(timeout, session.navigate_to(x, y, z, 1.0)).await;
    if !matches!(walked, Ok(Ok(()))) {
        // Halt in-progress movement before substituting a direct teleport.
        if let Err(error) = session.stop_navigation().await {
            debug!(%session_id, %error, "failed to stop navigation");
        }
        session
            .run_command(&format!("/tp {username} {x} {y} {z}"))
            .await
            .map_err(|error| {
                ApiError::bad_gateway(format!("teleport fallback failed: {error}"))
            })?;
        tokio::time::sleep(COMMAND_SETTLE_DELAY).await;
        method = "teleported";
    }

    Ok(Json(WalkToResponse {
        success: true,
        method,
    }))
}

// ---------------------------------------------------------------------------
// Command dispatcher
// ---------------------------------------------------------------------------

/// Closed action catalog. Every variant maps one catalog entry onto session
/// calls; unknown tool names are a deserialization failure, not a runtime
/// lookup miss.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "tool", content = "input", rename_all = "snake_case")]
enum ToolCommand {
    NavigateTo {
        x: f64,
        y: f64,
        z: f64,
        #[serde(default = "default_nav_range")]
        range: f64,
    },
    NavigateToPlayer {
        player_name: String,
        #[serde(default = "default_player_range")]
        range: f64,
    },
    LookAround {},
    GetPosition {},
    CheckInventory {},
    ScanNearbyBlocks {
        block_type: String,
        #[serde(default = "default_scan_distance")]
        max_distance: u32,
        #[serde(default = "default_scan_count")]
        max_count: u32,
    },
    MineType {
        block_type: String,
        #[serde(default = "default_mine_count")]
        count: u32,
        #[serde(default = "default_mine_distance")]
        max_distance: u32,
    },
    PlaceBlock {
        x: i64,
        y: i64,
        z: i64,
        block_name: String,
    },
    Chat {
        message: String,
    },
    Wait {
        #[serde(default = "default_wait_seconds")]
        seconds: f64,
    },
    CollectNearbyItems {
        #[serde(default = "default_collect_distance")]
        max_distance: f64,
    },
    EquipItem {
        item_name: String,
        #[serde(default = "default_equip_slot")]
        slot: String,
    },
    FlyTo {
        x: f64,
        y: f64,
        z: f64,
    },
    Teleport {
        x: f64,
        y: f64,
        z: f64,
    },
    GiveItem {
        item: String,
        #[serde(default = "default_give_count")]
        count: u32,
    },
}

fn default_nav_range() -> f64 {
    1.0
}
fn default_player_range() -> f64 {
    2.0
}
fn default_scan_distance() -> u32 {
    32
}
fn default_scan_count() -> u32 {
    10
}
fn default_mine_count() -> u32 {
    1
}
fn default_mine_distance() -> u32 {
    64
}
fn default_wait_seconds() -> f64 {
    2.0
}
fn default_collect_distance() -> f64 {
    16.0
}
fn default_equip_slot() -> String {
    "hand".to_string()
}
fn default_give_count() -> u32 {
    1
}

impl ToolCommand {
    fn requires_creative(&self) -> bool {
        matches!(
            self,
            Self::FlyTo { .. } | Self::Teleport { .. } | Self::GiveItem { .. }
        )
    }
}

fn parse_tool_command(tool: &str, input: Value) -> Result<ToolCommand, ApiError> {
    serde_json::from_value(json!({"tool": tool, "input": input}))
        .map_err(|error| ApiError::bad_request(format!("invalid tool request: {error}")))
}

/// Executes one catalog action. Errors from the underlying connection are
/// returned as `Err` and converted to `{"error": ..}` payloads by the
/// caller; they never escape as transport faults.
async fn run_tool(
    session: &dyn WorldSession,
    username: &str,
    command: &ToolCommand,
) -> anyhow::Result<Value> {
    match command {
        ToolCommand::NavigateTo { x, y, z, range } => {
            session.navigate_to(*x, *y, *z, *range).await?;
            let vitals = session.vitals().await?;
            let p = vitals.position;
            Ok(json!({
                "success": true,
                "message": format!("Arrived at ({}, {}, {})", p.x, p.y, p.z)
            }))
        }
        ToolCommand::NavigateToPlayer { player_name, range } => {
            let Some(position) = session.player_position(player_name).await? else {
                anyhow::bail!("player {player_name} not found or not visible");
            };
            session
                .navigate_to(
                    position.x as f64,
                    position.y as f64,
                    position.z as f64,
                    *range,
                )
                .await?;
            Ok(json!({
                "success": true,
                "message": format!("Arrived near {player_name}")
            }))
        }
        ToolCommand::LookAround {} => session.look_around().await,
        ToolCommand::GetPosition {} => {
            let vitals = session.vitals().await?;
            let p = vitals.position;
            Ok(json!({"x": p.x, "y": p.y, "z": p.z}))
        }
        ToolCommand::CheckInventory {} => {
            let items = session.inventory().await?;
            let message = if items.is_empty() {
                "Inventory is empty".to_string()
            } else {
                format!("{} item stacks in inventory", items.len())
            };
            Ok(json!({"inventory": items, "message": message}))
        }
        ToolCommand::ScanNearbyBlocks {
            block_type,
            max_distance,
            max_count,
        } => {
            let blocks = session
                .scan_blocks(block_type, *max_distance, *max_count)
                .await?;
            let count = blocks.len();
            Ok(json!({
                "blocks": blocks,
                "count": count,
                "message": format!("Found {count} {block_type} within {max_distance} blocks")
            }))
        }
        ToolCommand::MineType {
            block_type,
            count,
            max_distance,
        } => mine_type(session, block_type, *count, *max_distance).await,
        ToolCommand::PlaceBlock {
            x,
            y,
            z,
            block_name,
        } => {
            session
                .place_block(Position::new(*x, *y, *z), block_name)
                .await?;
            Ok(json!({
                "success": true,
                "message": format!("Placed {block_name} at ({x}, {y}, {z})")
            }))
        }
        ToolCommand::Chat { message } => {
            let sanitized = sanitize_chat_message(message)?;
            session.send_chat(&sanitized).await?;
            Ok(json!({"success": true, "message": format!("Sent: {sanitized}")}))
        }
        ToolCommand::Wait { seconds } => {
            let wait = seconds.clamp(0.0, MAX_WAIT_SECONDS);
            tokio::time::sleep(Duration::from_secs_f64(wait)).await;
            Ok(json!({"success": true, "message": format!("Waited {wait} seconds")}))
        }
        ToolCommand::CollectNearbyItems { max_distance } => {
            let collected = session.collect_items(*max_distance).await?;
            Ok(json!({
                "success": true,
                "message": format!("Collected {collected} item(s)")
            }))
        }
        ToolCommand::EquipItem { item_name, slot } => {
            session.equip_item(item_name, slot).await?;
            Ok(json!({
                "success": true,
                "message": format!("Equipped {item_name} to {slot}")
            }))
        }
        ToolCommand::FlyTo { x, y, z } => {
            session.fly_to(*x, *y, *z).await?;
            Ok(json!({"success": true, "message": format!("Flew to ({x}, {y}, {z})")}))
        }
        ToolCommand::Teleport { x, y, z } => {
            session
                .run_command(&format!("/tp {username} {x} {y} {z}"))
                .await?;
            tokio::time::sleep(COMMAND_SETTLE_DELAY).await;
            Ok(json!({"success": true, "message": format!("Teleported to ({x}, {y}, {z})")}))
        }
        ToolCommand::GiveItem { item, count } => {
            session
                .run_command(&format!("/give {username} {item} {count}"))
                .await?;
            tokio::time::sleep(COMMAND_SETTLE_DELAY).await;
            Ok(json!({"success": true, "message": format!("Gave {count}x {item}")}))
        }
    }
}

/// Mines up to `count` blocks of a type. Not transactional: a failure
/// mid-sequence reports the number actually completed.
async fn mine_type(
    session: &dyn WorldSession,
    block_type: &str,
    count: u32,
    max_distance: u32,
) -> anyhow::Result<Value> {
    let mut mined = 0u32;
    for _ in 0..count {
        let step = async {
            let found = session.scan_blocks(block_type, max_distance, 1).await?;
            let Some(target) = found.first().copied() else {
                return Ok(None);
            };
            session
                .navigate_to(target.x as f64, target.y as f64, target.z as f64, 2.0)
                .await?;
            session.dig(target).await?;
            anyhow::Ok(Some(target))
        };

        match step.await {
            Ok(Some(_)) => mined += 1,
            Ok(None) => break,
            Err(error) => {
                return Ok(json!({
                    "mined": mined,
                    "error": format!("stopped after {mined} block(s): {error}")
                }));
            }
        }
    }

    Ok(json!({
        "success": mined > 0,
        "mined": mined,
        "message": format!("Mined {mined} {block_type}")
    }))
}

fn sanitize_chat_message(message: &str) -> anyhow::Result<String> {
    if message.is_empty() {
        anyhow::bail!("message must be a non-empty string");
    }
    let mut sanitized: String = message.chars().take(MAX_CHAT_MESSAGE_LEN).collect();
    // Server commands are not sendable through the chat tool.
    if sanitized.starts_with('/') {
        sanitized.replace_range(0..1, ".");
    }
    Ok(sanitized)
}

fn tool_definitions(capabilities: &Capabilities) -> Vec<Value> {
    let mut tools = vec![
        json!({
            "name": "navigate_to",
            "description": "Walk to a specific position using A* pathfinding.",
            "input_schema": {
                "type": "object",
                "properties": {
                    "x": {"type": "number", "description": "X coordinate"},
                    "y": {"type": "number", "description": "Y coordinate"},
                    "z": {"type": "number", "description": "Z coordinate"},
                    "range": {"type": "number", "description": "How close to get (default 1)", "default": 1}
                },
                "required": ["x", "y", "z"]
            }
        }),
        json!({
            "name": "navigate_to_player",
            "description": "Walk to a specific player's current position.",
            "input_schema": {
                "type": "object",
                "properties": {
                    "player_name": {"type": "string", "description": "The player's username"},
                    "range": {"type": "number", "description": "How close to get (default 2)", "default": 2}
                },
                "required": ["player_name"]
            }
        }),
        json!({
            "name": "look_around",
            "description": "Get a description of the bot's surroundings: nearby blocks, entities, players, and position.",
            "input_schema": {"type": "object", "properties": {}}
        }),
        json!({
            "name": "get_position",
            "description": "Get the bot's current position coordinates.",
            "input_schema": {"type": "object", "properties": {}}
        }),
        json!({
            "name": "check_inventory",
            "description": "Check the bot's current inventory contents.",
            "input_schema": {"type": "object", "properties": {}}
        }),
        json!({
            "name": "scan_nearby_blocks",
            "description": "Scan the area around the bot for specific block types. Returns positions of matching blocks.",
            "input_schema": {
                "type": "object",
                "properties": {
                    "block_type": {"type": "string", "description": "Block name to search for like 'oak_log', 'crafting_table', 'diamond_ore'"},
                    "max_distance": {"type": "integer", "description": "Max search distance (default 32)", "default": 32},
                    "max_count": {"type": "integer", "description": "Max blocks to return (default 10)", "default": 10}
                },
                "required": ["block_type"]
            }
        }),
        json!({
            "name": "mine_type",
            "description": "Find and mine a number of blocks of the specified type. The bot pathfinds to each block and mines it.",
            "input_schema": {
                "type": "object",
                "properties": {
                    "block_type": {"type": "string", "description": "Block name like 'oak_log', 'stone', 'diamond_ore'"},
                    "count": {"type": "integer", "description": "How many to mine (default 1)", "default": 1},
                    "max_distance": {"type": "integer", "description": "Max search distance (default 64)", "default": 64}
                },
                "required": ["block_type"]
            }
        }),
        json!({
            "name": "place_block",
            "description": "Place a block from inventory at the specified position.",
            "input_schema": {
                "type": "object",
                "properties": {
                    "x": {"type": "integer", "description": "X coordinate to place at"},
                    "y": {"type": "integer", "description": "Y coordinate to place at"},
                    "z": {"type": "integer", "description": "Z coordinate to place at"},
                    "block_name": {"type": "string", "description": "Name of the block to place (must be in inventory)"}
                },
                "required": ["x", "y", "z", "block_name"]
            }
        }),
        json!({
            "name": "chat",
            "description": "Send a chat message in-game.",
            "input_schema": {
                "type": "object",
                "properties": {
                    "message": {"type": "string", "description": "Message to send"}
                },
                "required": ["message"]
            }
        }),
        json!({
            "name": "wait",
            "description": "Wait for a specified number of seconds (max 30).",
            "input_schema": {
                "type": "object",
                "properties": {
                    "seconds": {"type": "number", "description": "Seconds to wait (max 30)", "default": 2}
                },
                "required": ["seconds"]
            }
        }),
        json!({
            "name": "collect_nearby_items",
            "description": "Walk around and pick up dropped items near the bot.",
            "input_schema": {
                "type": "object",
                "properties": {
                    "max_distance": {"type": "number", "description": "Max distance to search (default 16)", "default": 16}
                }
            }
        }),
        json!({
            "name": "equip_item",
            "description": "Equip an item from inventory to hand, head, torso, legs, or feet.",
            "input_schema": {
                "type": "object",
                "properties": {
                    "item_name": {"type": "string", "description": "Item name to equip"},
                    "slot": {"type": "string", "description": "Where to equip: 'hand', 'off-hand', 'head', 'torso', 'legs', 'feet'", "default": "hand"}
                },
                "required": ["item_name"]
            }
        }),
    ];

    if capabilities.creative_actions {
        tools.push(json!({
            "name": "fly_to",
            "description": "Fly to a specific position using creative mode flight.",
            "input_schema": {
                "type": "object",
                "properties": {
                    "x": {"type": "number", "description": "X coordinate"},
                    "y": {"type": "number", "description": "Y coordinate"},
                    "z": {"type": "number", "description": "Z coordinate"}
                },
                "required": ["x", "y", "z"]
            }
        }));
        tools.push(json!({
            "name": "teleport",
            "description": "Instantly teleport to a position using /tp command.",
            "input_schema": {
                "type": "object",
                "properties": {
                    "x": {"type": "number", "description": "X coordinate"},
                    "y": {"type": "number", "description": "Y coordinate"},
                    "z": {"type": "number", "description": "Z coordinate"}
                },
                "required": ["x", "y", "z"]
            }
        }));
        tools.push(json!({
            "name": "give_item",
            "description": "Give items to the bot using /give command (creative/op).",
            "input_schema": {
                "type": "object",
                "properties": {
                    "item": {"type": "string", "description": "Item name like 'diamond', 'stone', 'oak_planks'"},
                    "count": {"type": "integer", "description": "Number of items (default 1)", "default": 1}
                },
                "required": ["item"]
            }
        }));
    }

    tools
}

// ---------------------------------------------------------------------------
// Driver-backed world connection
// ---------------------------------------------------------------------------

/// Production connector: one external game-client driver process per session
/// (`node <script> --host .. --port .. --username ..`), speaking
/// newline-delimited JSON over stdin/stdout. All pathfinding and world
/// interaction lives in the driver; this side only translates requests and
/// routes events.
#[derive(Clone)]
struct DriverConnector {
    node_bin: String,
    driver_script: String,
    game_host: String,
    game_port: u16,
    request_timeout: Duration,
}

impl DriverConnector {
    fn from_env(game_host: String, game_port: u16) -> Self {
        Self {
            node_bin: std::env::var("NODE_BIN")
                .ok()
                .unwrap_or_else(|| "node".to_string()),
            driver_script: std::env::var("BOT_DRIVER_SCRIPT")
                .ok()
                .unwrap_or_else(|| "driver/bot-driver.js".to_string()),
            game_host,
            game_port,
            request_timeout: Duration::from_millis(
                std::env::var("DRIVER_REQUEST_TIMEOUT_MS")
                    .ok()
                    .and_then(|value| value.parse::<u64>().ok())
                    .unwrap_or(30_000),
            ),
        }
    }
}

#[async_trait]
impl WorldConnector for DriverConnector {
    async fn connect(
        &self,
        username: &str,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> anyhow::Result<Arc<dyn WorldSession>> {
        let mut child = Command::new(&self.node_bin)
            .arg(&self.driver_script)
            .arg("--host")
            .arg(&self.game_host)
            .arg("--port")
            .arg(self.game_port.to_string())
            .arg("--username")
            .arg(username)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .context("failed to spawn game-client driver process")?;

        let stdin = child.stdin.take().context("driver stdin unavailable")?;
        let stdout = child.stdout.take().context("driver stdout unavailable")?;

        let pending: Arc<std::sync::Mutex<HashMap<u64, oneshot::Sender<DriverReply>>>> =
            Arc::new(std::sync::Mutex::new(HashMap::new()));
        let reader_pending = pending.clone();

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let value: Value = match serde_json::from_str(&line) {
                    Ok(value) => value,
                    Err(error) => {
                        debug!(%error, "driver emitted a non-json line");
                        continue;
                    }
                };

                if value.get("reply_to").is_some() {
                    match serde_json::from_value::<DriverReply>(value) {
                        Ok(reply) => {
                            let waiter = reader_pending
                                .lock()
                                .unwrap_or_else(std::sync::PoisonError::into_inner)
                                .remove(&reply.reply_to);
                            if let Some(tx) = waiter {
                                let _ = tx.send(reply);
                            }
                        }
                        Err(error) => debug!(%error, "driver reply was malformed"),
                    }
                    continue;
                }

                let Some(event) = parse_driver_event(&value) else {
                    continue;
                };
                if events.send(event).is_err() {
                    break;
                }
            }
        });

        Ok(Arc::new(DriverSession {
            stdin: Mutex::new(stdin),
            child: std::sync::Mutex::new(Some(child)),
            pending,
            next_id: AtomicU64::new(1),
            request_timeout: self.request_timeout,
        }))
    }
}

#[derive(Debug, Deserialize)]
struct DriverReply {
    reply_to: u64,
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

fn parse_driver_event(value: &Value) -> Option<SessionEvent> {
    let event = value.get("event")?.as_str()?;
    match event {
        "joined" => Some(SessionEvent::Joined),
        "kicked" => Some(SessionEvent::Kicked {
            reason: value
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        }),
        "end" => Some(SessionEvent::Ended),
        "death" => Some(SessionEvent::Died),
        "chat" => {
            let sender = value.get("sender")?.as_str()?.to_string();
            let message = value.get("message")?.as_str()?.to_string();
            Some(SessionEvent::Chat { sender, message })
        }
        _ => None,
    }
}

struct DriverSession {
    stdin: Mutex<ChildStdin>,
    child: std::sync::Mutex<Option<Child>>,
    pending: Arc<std::sync::Mutex<HashMap<u64, oneshot::Sender<DriverReply>>>>,
    next_id: AtomicU64,
    request_timeout: Duration,
}

impl DriverSession {
    async fn request(&self, op: &str, params: Value) -> anyhow::Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(id, tx);

        let line = serde_json::to_string(&json!({"id": id, "op": op, "params": params}))?;
        {
            let mut stdin = self.stdin.lock().await;
            stdin
                .write_all(line.as_bytes())
                .await
                .context("failed to write driver request")?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await?;
        }

        let reply = match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => {
                anyhow::bail!("driver connection closed while waiting for '{op}'")
            }
            Err(_) => {
                self.pending
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .remove(&id);
                anyhow::bail!("driver request '{op}' timed out")
            }
        };

        if reply.ok {
            Ok(reply.result.unwrap_or(Value::Null))
        } else {
            anyhow::bail!(
                "{}",
                reply
                    .error
                    .unwrap_or_else(|| format!("driver request '{op}' failed"))
            )
        }
    }
}

#[async_trait]
impl WorldSession for DriverSession {
    async fn vitals(&self) -> anyhow::Result<SessionVitals> {
        let raw = self.request("vitals", json!({})).await?;
        serde_json::from_value(raw).context("driver returned malformed vitals")
    }

    async fn observe(&self) -> anyhow::Result<Value> {
        self.request("observe", json!({})).await
    }

    async fn look_around(&self) -> anyhow::Result<Value> {
        self.request("look_around", json!({})).await
    }

    async fn player_position(&self, player_name: &str) -> anyhow::Result<Option<Position>> {
        let raw = self
            .request("player_position", json!({"player_name": player_name}))
            .await?;
        if raw.is_null() {
            return Ok(None);
        }
        serde_json::from_value(raw)
            .map(Some)
            .context("driver returned malformed player position")
    }

    async fn navigate_to(&self, x: f64, y: f64, z: f64, range: f64) -> anyhow::Result<()> {
        self.request(
            "navigate_to",
            json!({"x": x, "y": y, "z": z, "range": range}),
        )
        .await?;
        Ok(())
    }

    async fn stop_navigation(&self) -> anyhow::Result<()> {
        self.request("stop_navigation", json!({})).await?;
        Ok(())
    }

    async fn dig(&self, position: Position) -> anyhow::Result<()> {
        self.request(
            "dig",
            json!({"x": position.x, "y": position.y, "z": position.z}),
        )
        .await?;
        Ok(())
    }

    async fn place_block(&self, position: Position, block_name: &str) -> anyhow::Result<()> {
        self.request(
            "place_block",
            json!({
                "x": position.x,
                "y": position.y,
                "z": position.z,
                "block_name": block_name
            }),
        )
        .await?;
        Ok(())
    }

    async fn scan_blocks(
        &self,
        block_type: &str,
        max_distance: u32,
        max_count: u32,
    ) -> anyhow::Result<Vec<Position>> {
        let raw = self
            .request(
                "scan_blocks",
                json!({
                    "block_type": block_type,
                    "max_distance": max_distance,
                    "max_count": max_count
                }),
            )
            .await?;
        serde_json::from_value(raw).context("driver returned malformed block list")
    }

    async fn inventory(&self) -> anyhow::Result<Vec<ItemStack>> {
        let raw = self.request("inventory", json!({})).await?;
        serde_json::from_value(raw).context("driver returned malformed inventory")
    }

    async fn collect_items(&self, max_distance: f64) -> anyhow::Result<u32> {
        let raw = self
            .request("collect_items", json!({"max_distance": max_distance}))
            .await?;
        serde_json::from_value(raw).context("driver returned malformed collect count")
    }

    async fn equip_item(&self, item_name: &str, slot: &str) -> anyhow::Result<()> {
        self.request("equip_item", json!({"item_name": item_name, "slot": slot}))
            .await?;
        Ok(())
    }

    async fn send_chat(&self, message: &str) -> anyhow::Result<()> {
        self.request("chat", json!({"message": message})).await?;
        Ok(())
    }

    async fn run_command(&self, command: &str) -> anyhow::Result<()> {
        self.request("run_command", json!({"command": command}))
            .await?;
        Ok(())
    }

    async fn fly_to(&self, x: f64, y: f64, z: f64) -> anyhow::Result<()> {
        self.request("fly_to", json!({"x": x, "y": y, "z": z}))
            .await?;
        Ok(())
    }

    async fn configure_movement(&self, profile: &MovementProfile) -> anyhow::Result<()> {
        self.request("set_movements", serde_json::to_value(profile)?)
            .await?;
        Ok(())
    }

    async fn respawn(&self) -> anyhow::Result<()> {
        self.request("respawn", json!({})).await?;
        Ok(())
    }

    async fn close(&self) {
        {
            let mut stdin = self.stdin.lock().await;
            let _ = stdin.write_all(b"{\"op\":\"quit\"}\n").await;
            let _ = stdin.flush().await;
        }
        let child = self
            .child
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(mut child) = child {
            let _ = child.start_kill();
        }
    }
}

// ---------------------------------------------------------------------------
// Webhook chat relay
// ---------------------------------------------------------------------------

struct WebhookChatRelay {
    client: reqwest::Client,
    webhook_url: Option<String>,
    webhook_token: Option<String>,
}

impl WebhookChatRelay {
    fn from_env() -> Self {
        Self {
            client: reqwest::Client::new(),
            webhook_url: std::env::var("OPENCLAW_WEBHOOK_URL")
                .ok()
                .filter(|value| !value.trim().is_empty()),
            webhook_token: std::env::var("OPENCLAW_WEBHOOK_TOKEN")
                .ok()
                .filter(|value| !value.trim().is_empty()),
        }
    }
}

#[async_trait]
impl ChatRelay for WebhookChatRelay {
    fn is_configured(&self) -> bool {
        self.webhook_url.is_some() && self.webhook_token.is_some()
    }

    async fn forward(&self, event: &InboundChatEvent) -> anyhow::Result<()> {
        let (Some(url), Some(token)) = (self.webhook_url.as_ref(), self.webhook_token.as_ref())
        else {
            anyhow::bail!("chat relay is not configured");
        };

        let response = self
            .client
            .post(url)
            .bearer_auth(token)
            .json(event)
            .send()
            .await
            .context("webhook request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("webhook returned {status}: {body}");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn service_unavailable(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: message.into(),
        }
    }

    fn bad_gateway(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_GATEWAY,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        warn!(status = %self.status, message = %self.message, "bot-manager request failed");
        (
            self.status,
            Json(json!({"error": self.message})),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct ScriptedSession {
        vitals: StdMutex<SessionVitals>,
        chats: StdMutex<Vec<String>>,
        commands: StdMutex<Vec<String>>,
        configure_calls: AtomicUsize,
        respawn_calls: AtomicUsize,
        stop_calls: AtomicUsize,
        closed: AtomicBool,
        navigate_forever: AtomicBool,
        navigate_error: StdMutex<Option<String>>,
        scan_results: StdMutex<VecDeque<Vec<Position>>>,
        dig_results: StdMutex<VecDeque<Result<(), String>>>,
        player_positions: StdMutex<HashMap<String, Position>>,
        observation: StdMutex<Value>,
    }

    impl Default for SessionVitals {
        fn default() -> Self {
            Self {
                position: Position::new(0, 64, 0),
                health: 20.0,
                food: 20.0,
            }
        }
    }

    impl ScriptedSession {
        fn set_position(&self, position: Position) {
            self.vitals.lock().unwrap().position = position;
        }
    }

    #[async_trait]
    impl WorldSession for ScriptedSession {
        async fn vitals(&self) -> anyhow::Result<SessionVitals> {
            Ok(self.vitals.lock().unwrap().clone())
        }

        async fn observe(&self) -> anyhow::Result<Value> {
            Ok(self.observation.lock().unwrap().clone())
        }

        async fn look_around(&self) -> anyhow::Result<Value> {
            Ok(json!({"nearby_players": []}))
        }

        async fn player_position(&self, player_name: &str) -> anyhow::Result<Option<Position>> {
            Ok(self
                .player_positions
                .lock()
                .unwrap()
                .get(player_name)
                .copied())
        }

        async fn navigate_to(&self, _x: f64, _y: f64, _z: f64, _range: f64) -> anyhow::Result<()> {
            if let Some(message) = self.navigate_error.lock().unwrap().clone() {
                anyhow::bail!(message);
            }
            if self.navigate_forever.load(Ordering::SeqCst) {
                // Simulates pathfinding that never completes.
                std::future::pending::<()>().await;
            }
            Ok(())
        }

        async fn stop_navigation(&self) -> anyhow::Result<()> {
            self.stop_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn dig(&self, _position: Position) -> anyhow::Result<()> {
            let next = self.dig_results.lock().unwrap().pop_front();
            match next {
                Some(Ok(())) | None => Ok(()),
                Some(Err(message)) => anyhow::bail!(message),
            }
        }

        async fn place_block(&self, _position: Position, _block_name: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn scan_blocks(
            &self,
            _block_type: &str,
            _max_distance: u32,
            _max_count: u32,
        ) -> anyhow::Result<Vec<Position>> {
            Ok(self
                .scan_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_default())
        }

        async fn inventory(&self) -> anyhow::Result<Vec<ItemStack>> {
            Ok(vec![])
        }

        async fn collect_items(&self, _max_distance: f64) -> anyhow::Result<u32> {
            Ok(0)
        }

        async fn equip_item(&self, _item_name: &str, _slot: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn send_chat(&self, message: &str) -> anyhow::Result<()> {
            self.chats.lock().unwrap().push(message.to_string());
            Ok(())
        }

        async fn run_command(&self, command: &str) -> anyhow::Result<()> {
            self.commands.lock().unwrap().push(command.to_string());
            Ok(())
        }

        async fn fly_to(&self, _x: f64, _y: f64, _z: f64) -> anyhow::Result<()> {
            Ok(())
        }

        async fn configure_movement(&self, _profile: &MovementProfile) -> anyhow::Result<()> {
            self.configure_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn respawn(&self) -> anyhow::Result<()> {
            self.respawn_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct ScriptedConnector {
        sessions: StdMutex<Vec<Arc<ScriptedSession>>>,
        event_senders: StdMutex<Vec<mpsc::UnboundedSender<SessionEvent>>>,
        usernames: StdMutex<Vec<String>>,
        // Fires Joined on the event channel before connect returns.
        join_on_connect: AtomicBool,
    }

    impl ScriptedConnector {
        fn session(&self, index: usize) -> Arc<ScriptedSession> {
            self.sessions.lock().unwrap()[index].clone()
        }

        fn send_event(&self, index: usize, event: SessionEvent) {
            let sender = self.event_senders.lock().unwrap()[index].clone();
            sender.send(event).unwrap();
        }

        fn connection_count(&self) -> usize {
            self.sessions.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl WorldConnector for ScriptedConnector {
        async fn connect(
            &self,
            username: &str,
            events: mpsc::UnboundedSender<SessionEvent>,
        ) -> anyhow::Result<Arc<dyn WorldSession>> {
            let session = Arc::new(ScriptedSession::default());
            self.sessions.lock().unwrap().push(session.clone());
            if self.join_on_connect.load(Ordering::SeqCst) {
                events.send(SessionEvent::Joined).unwrap();
            }
            self.event_senders.lock().unwrap().push(events);
            self.usernames.lock().unwrap().push(username.to_string());
            Ok(session)
        }
    }

    #[derive(Default)]
    struct RecordingRelay {
        forwarded: StdMutex<Vec<InboundChatEvent>>,
    }

    #[async_trait]
    impl ChatRelay for RecordingRelay {
        fn is_configured(&self) -> bool {
            true
        }

        async fn forward(&self, event: &InboundChatEvent) -> anyhow::Result<()> {
            self.forwarded.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    fn test_capabilities() -> Capabilities {
        Capabilities {
            chat_buffer: true,
            creative_actions: false,
            walk_to_fallback: true,
            auto_reconnect: false,
            reconnect_delay: Duration::from_millis(20),
        }
    }

    fn test_state(
        connector: Arc<ScriptedConnector>,
        relay: Arc<RecordingRelay>,
        capabilities: Capabilities,
    ) -> AppState {
        let state = AppState {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            server_available: Arc::new(AtomicBool::new(true)),
            chat: Arc::new(Mutex::new(ChatBuffer::new(MAX_CHAT_BUFFER))),
            connector,
            chat_relay: relay,
            capabilities,
        };
        state
    }

    fn default_state() -> (AppState, Arc<ScriptedConnector>, Arc<RecordingRelay>) {
        let connector = Arc::new(ScriptedConnector::default());
        let relay = Arc::new(RecordingRelay::default());
        let state = test_state(connector.clone(), relay.clone(), test_capabilities());
        (state, connector, relay)
    }

    async fn spawn_bot(state: &AppState, username: &str) -> SpawnResponse {
        spawn_handler(
            State(state.clone()),
            Json(SpawnRequest {
                username: Some(username.to_string()),
            }),
        )
        .await
        .unwrap()
        .0
    }

    async fn wait_for_status(state: &AppState, session_id: &str, status: SessionStatus) {
        for _ in 0..100 {
            {
                let sessions = state.sessions.lock().await;
                if let Some(record) = sessions.get(session_id)
                    && record.status == status
                {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session {session_id} never reached {status:?}");
    }

    async fn execute(
        state: &AppState,
        session_id: &str,
        tool: &str,
        input: Value,
    ) -> Result<ExecuteResponse, ApiError> {
        execute_handler(
            State(state.clone()),
            Path(session_id.to_string()),
            Json(ExecuteRequest {
                tool: Some(tool.to_string()),
                input: Some(input),
            }),
        )
        .await
        .map(|json| json.0)
    }

    #[tokio::test]
    async fn spawn_rejected_when_server_unavailable() {
        let (state, connector, _) = default_state();
        state.server_available.store(false, Ordering::SeqCst);

        let error = spawn_handler(
            State(state.clone()),
            Json(SpawnRequest {
                username: Some("Steve".to_string()),
            }),
        )
        .await
        .unwrap_err();

        assert_eq!(error.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(connector.connection_count(), 0);
        assert!(state.sessions.lock().await.is_empty());
    }

    #[tokio::test]
    async fn spawn_requires_username() {
        let (state, _, _) = default_state();

        let error = spawn_handler(State(state.clone()), Json(SpawnRequest { username: None }))
            .await
            .unwrap_err();
        assert_eq!(error.status, StatusCode::BAD_REQUEST);

        let error = spawn_handler(
            State(state.clone()),
            Json(SpawnRequest {
                username: Some("   ".to_string()),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(error.status, StatusCode::BAD_REQUEST);
        assert!(state.sessions.lock().await.is_empty());
    }

    #[tokio::test]
    async fn spawn_returns_spawning_and_join_makes_ready() {
        let (state, connector, _) = default_state();

        let response = spawn_bot(&state, "Steve").await;
        assert_eq!(response.status, SessionStatus::Spawning);
        assert_eq!(response.username, "Steve");

        let detail = get_bot_handler(State(state.clone()), Path(response.id.clone()))
            .await
            .unwrap()
            .0;
        assert_eq!(detail.status, SessionStatus::Spawning);
        assert!(detail.position.is_none());
        assert!(detail.health.is_none());

        connector.send_event(0, SessionEvent::Joined);
        wait_for_status(&state, &response.id, SessionStatus::Ready).await;

        let detail = get_bot_handler(State(state.clone()), Path(response.id.clone()))
            .await
            .unwrap()
            .0;
        assert_eq!(detail.status, SessionStatus::Ready);
        assert_eq!(detail.position, Some(Position::new(0, 64, 0)));
        assert_eq!(detail.health, Some(20.0));
        assert_eq!(detail.food, Some(20.0));
    }

    #[tokio::test]
    async fn movement_profile_is_configured_once_per_ready_transition() {
        let (state, connector, _) = default_state();
        let response = spawn_bot(&state, "Steve").await;

        connector.send_event(0, SessionEvent::Joined);
        connector.send_event(0, SessionEvent::Joined);
        wait_for_status(&state, &response.id, SessionStatus::Ready).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let session = connector.session(0);
        assert_eq!(session.configure_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn death_triggers_respawn_without_status_change() {
        let (state, connector, _) = default_state();
        let response = spawn_bot(&state, "Steve").await;
        connector.send_event(0, SessionEvent::Joined);
        wait_for_status(&state, &response.id, SessionStatus::Ready).await;

        connector.send_event(0, SessionEvent::Died);
        tokio::time::sleep(Duration::from_millis(30)).await;

        let session = connector.session(0);
        assert_eq!(session.respawn_calls.load(Ordering::SeqCst), 1);
        let sessions = state.sessions.lock().await;
        assert_eq!(
            sessions.get(&response.id).unwrap().status,
            SessionStatus::Ready
        );
    }

    #[tokio::test]
    async fn kick_marks_session_disconnected_and_commands_are_rejected() {
        let (state, connector, _) = default_state();
        let response = spawn_bot(&state, "Steve").await;
        connector.send_event(0, SessionEvent::Joined);
        wait_for_status(&state, &response.id, SessionStatus::Ready).await;

        connector.send_event(
            0,
            SessionEvent::Kicked {
                reason: "banned".to_string(),
            },
        );
        wait_for_status(&state, &response.id, SessionStatus::Disconnected).await;

        let result = execute(&state, &response.id, "chat", json!({"message": "hi"}))
            .await
            .unwrap();
        assert_eq!(result.result["error"], "bot is not ready");
        assert!(connector.session(0).chats.lock().unwrap().is_empty());

        // The record stays visible until an explicit despawn.
        let list = list_bots_handler(State(state.clone())).await.0;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].status, SessionStatus::Disconnected);
    }

    #[tokio::test]
    async fn command_queued_behind_the_gate_rechecks_readiness() {
        let (state, connector, _) = default_state();
        let response = spawn_bot(&state, "Steve").await;
        connector.send_event(0, SessionEvent::Joined);
        wait_for_status(&state, &response.id, SessionStatus::Ready).await;

        // Occupy the command gate with a long wait.
        let wait_state = state.clone();
        let wait_id = response.id.clone();
        let wait_task = tokio::spawn(async move {
            execute(&wait_state, &wait_id, "wait", json!({"seconds": 1.0})).await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        // This chat passes the first readiness check and queues on the gate.
        let chat_state = state.clone();
        let chat_id = response.id.clone();
        let chat_task = tokio::spawn(async move {
            execute(&chat_state, &chat_id, "chat", json!({"message": "late"})).await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        connector.send_event(
            0,
            SessionEvent::Kicked {
                reason: "banned".to_string(),
            },
        );
        wait_for_status(&state, &response.id, SessionStatus::Disconnected).await;

        wait_task.await.unwrap().unwrap();
        let result = chat_task.await.unwrap().unwrap();
        assert_eq!(result.result["error"], "bot is not ready");
        assert!(result.bot_state.is_none());
        assert!(connector.session(0).chats.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn walk_to_queued_behind_the_gate_rechecks_readiness() {
        let (state, connector, _) = default_state();
        let response = spawn_bot(&state, "Steve").await;
        connector.send_event(0, SessionEvent::Joined);
        wait_for_status(&state, &response.id, SessionStatus::Ready).await;

        let wait_state = state.clone();
        let wait_id = response.id.clone();
        let wait_task = tokio::spawn(async move {
            execute(&wait_state, &wait_id, "wait", json!({"seconds": 1.0})).await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let walk_state = state.clone();
        let walk_id = response.id.clone();
        let walk_task = tokio::spawn(async move {
            walk_to_handler(
                State(walk_state),
                Path(walk_id),
                Json(WalkToRequest {
                    x: Some(3.0),
                    y: Some(64.0),
                    z: Some(4.0),
                    timeout: None,
                }),
            )
            .await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        connector.send_event(0, SessionEvent::Ended);
        wait_for_status(&state, &response.id, SessionStatus::Disconnected).await;

        wait_task.await.unwrap().unwrap();
        let error = walk_task.await.unwrap().unwrap_err();
        assert_eq!(error.status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(connector.session(0).commands.lock().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn join_event_racing_the_registry_insert_is_not_lost() {
        let connector = Arc::new(ScriptedConnector::default());
        connector.join_on_connect.store(true, Ordering::SeqCst);
        let state = test_state(
            connector.clone(),
            Arc::new(RecordingRelay::default()),
            test_capabilities(),
        );

        // The join event is already queued when the pump starts; the record
        // must still observe the ready transition.
        for i in 0..20 {
            let response = spawn_bot(&state, &format!("Bot{i}")).await;
            wait_for_status(&state, &response.id, SessionStatus::Ready).await;
        }
    }

    #[tokio::test]
    async fn despawn_unknown_id_is_not_found_and_leaves_registry_alone() {
        let (state, _, _) = default_state();
        spawn_bot(&state, "Steve").await;

        let error = despawn_handler(State(state.clone()), Path("missing".to_string()))
            .await
            .unwrap_err();
        assert_eq!(error.status, StatusCode::NOT_FOUND);
        assert_eq!(state.sessions.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn despawn_closes_connection_and_removes_record() {
        let (state, connector, _) = default_state();
        let response = spawn_bot(&state, "Steve").await;

        let result = despawn_handler(State(state.clone()), Path(response.id.clone()))
            .await
            .unwrap()
            .0;
        assert!(result.success);
        assert!(connector.session(0).closed.load(Ordering::SeqCst));
        assert!(state.sessions.lock().await.is_empty());

        let error = despawn_handler(State(state.clone()), Path(response.id))
            .await
            .unwrap_err();
        assert_eq!(error.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn registry_count_tracks_spawns_minus_despawns() {
        let (state, _, _) = default_state();
        let a = spawn_bot(&state, "A").await;
        let _b = spawn_bot(&state, "B").await;
        let _c = spawn_bot(&state, "C").await;

        despawn_handler(State(state.clone()), Path(a.id)).await.unwrap();

        let list = list_bots_handler(State(state.clone())).await.0;
        assert_eq!(list.len(), 2);
    }

    #[tokio::test]
    async fn execute_unknown_session_is_not_found() {
        let (state, _, _) = default_state();
        let error = execute(&state, "missing", "chat", json!({"message": "hi"}))
            .await
            .unwrap_err();
        assert_eq!(error.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn execute_requires_tool_field() {
        let (state, _, _) = default_state();
        let response = spawn_bot(&state, "Steve").await;

        let error = execute_handler(
            State(state.clone()),
            Path(response.id),
            Json(ExecuteRequest {
                tool: None,
                input: None,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(error.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn execute_rejects_unknown_tool_names() {
        let (state, _, _) = default_state();
        let response = spawn_bot(&state, "Steve").await;

        let error = execute(&state, &response.id, "summon_dragon", json!({}))
            .await
            .unwrap_err();
        assert_eq!(error.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn execute_before_ready_never_reaches_the_action() {
        let (state, connector, _) = default_state();
        let response = spawn_bot(&state, "Steve").await;

        let result = execute(&state, &response.id, "chat", json!({"message": "hi"}))
            .await
            .unwrap();
        assert_eq!(result.result["error"], "bot is not ready");
        assert!(result.bot_state.is_none());
        assert!(connector.session(0).chats.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn execute_chat_sanitizes_commands_and_length() {
        let (state, connector, _) = default_state();
        let response = spawn_bot(&state, "Steve").await;
        connector.send_event(0, SessionEvent::Joined);
        wait_for_status(&state, &response.id, SessionStatus::Ready).await;

        execute(&state, &response.id, "chat", json!({"message": "/kill @a"}))
            .await
            .unwrap();
        let long: String = "x".repeat(600);
        execute(&state, &response.id, "chat", json!({"message": long}))
            .await
            .unwrap();

        let chats = connector.session(0).chats.lock().unwrap().clone();
        assert_eq!(chats[0], ".kill @a");
        assert_eq!(chats[1].len(), MAX_CHAT_MESSAGE_LEN);
    }

    #[tokio::test]
    async fn execute_converts_action_failures_into_error_payloads() {
        let (state, connector, _) = default_state();
        let response = spawn_bot(&state, "Steve").await;
        connector.send_event(0, SessionEvent::Joined);
        wait_for_status(&state, &response.id, SessionStatus::Ready).await;

        *connector.session(0).navigate_error.lock().unwrap() =
            Some("path obstructed".to_string());

        let result = execute(
            &state,
            &response.id,
            "navigate_to",
            json!({"x": 1.0, "y": 64.0, "z": 1.0}),
        )
        .await
        .unwrap();

        assert_eq!(result.result["error"], "path obstructed");
        // The caller still gets the live bot state alongside the failure.
        assert!(result.bot_state.is_some());
    }

    #[tokio::test]
    async fn mine_type_reports_partial_completion() {
        let (state, connector, _) = default_state();
        let response = spawn_bot(&state, "Steve").await;
        connector.send_event(0, SessionEvent::Joined);
        wait_for_status(&state, &response.id, SessionStatus::Ready).await;

        let session = connector.session(0);
        {
            let mut scans = session.scan_results.lock().unwrap();
            scans.push_back(vec![Position::new(1, 64, 0)]);
            scans.push_back(vec![Position::new(2, 64, 0)]);
            let mut digs = session.dig_results.lock().unwrap();
            digs.push_back(Ok(()));
            digs.push_back(Err("pickaxe broke".to_string()));
        }

        let result = execute(
            &state,
            &response.id,
            "mine_type",
            json!({"block_type": "stone", "count": 3}),
        )
        .await
        .unwrap();

        assert_eq!(result.result["mined"], 1);
        assert!(
            result.result["error"]
                .as_str()
                .unwrap()
                .contains("pickaxe broke")
        );
    }

    #[tokio::test]
    async fn mine_type_stops_when_no_blocks_remain() {
        let (state, connector, _) = default_state();
        let response = spawn_bot(&state, "Steve").await;
        connector.send_event(0, SessionEvent::Joined);
        wait_for_status(&state, &response.id, SessionStatus::Ready).await;

        let session = connector.session(0);
        session
            .scan_results
            .lock()
            .unwrap()
            .push_back(vec![Position::new(1, 64, 0)]);

        let result = execute(
            &state,
            &response.id,
            "mine_type",
            json!({"block_type": "oak_log", "count": 5}),
        )
        .await
        .unwrap();

        assert_eq!(result.result["mined"], 1);
        assert_eq!(result.result["success"], true);
    }

    #[tokio::test]
    async fn creative_actions_are_gated_by_capability() {
        let (state, connector, _) = default_state();
        let response = spawn_bot(&state, "Steve").await;
        connector.send_event(0, SessionEvent::Joined);
        wait_for_status(&state, &response.id, SessionStatus::Ready).await;

        let error = execute(
            &state,
            &response.id,
            "give_item",
            json!({"item": "diamond"}),
        )
        .await
        .unwrap_err();
        assert_eq!(error.status, StatusCode::BAD_REQUEST);

        let connector2 = Arc::new(ScriptedConnector::default());
        let mut capabilities = test_capabilities();
        capabilities.creative_actions = true;
        let state2 = test_state(
            connector2.clone(),
            Arc::new(RecordingRelay::default()),
            capabilities,
        );
        let response2 = spawn_bot(&state2, "Creative").await;
        connector2.send_event(0, SessionEvent::Joined);
        wait_for_status(&state2, &response2.id, SessionStatus::Ready).await;

        let result = execute(
            &state2,
            &response2.id,
            "give_item",
            json!({"item": "diamond", "count": 4}),
        )
        .await
        .unwrap();
        assert_eq!(result.result["success"], true);
        let commands = connector2.session(0).commands.lock().unwrap().clone();
        assert_eq!(commands, vec!["/give Creative diamond 4".to_string()]);
    }

    #[tokio::test]
    async fn tools_catalog_includes_creative_entries_only_when_enabled() {
        let (state, _, _) = default_state();
        let response = spawn_bot(&state, "Steve").await;

        let tools = tools_handler(State(state.clone()), Path(response.id.clone()))
            .await
            .unwrap()
            .0;
        assert!(tools.iter().all(|tool| tool["name"] != "give_item"));

        let mut capabilities = test_capabilities();
        capabilities.creative_actions = true;
        let connector = Arc::new(ScriptedConnector::default());
        let state = test_state(connector, Arc::new(RecordingRelay::default()), capabilities);
        let response = spawn_bot(&state, "Creative").await;
        let tools = tools_handler(State(state.clone()), Path(response.id))
            .await
            .unwrap()
            .0;
        assert!(tools.iter().any(|tool| tool["name"] == "give_item"));
        assert!(tools.iter().any(|tool| tool["name"] == "fly_to"));
        assert!(tools.iter().any(|tool| tool["name"] == "teleport"));

        let error = tools_handler(State(state.clone()), Path("missing".to_string()))
            .await
            .unwrap_err();
        assert_eq!(error.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn observe_requires_ready_session() {
        let (state, connector, _) = default_state();
        let response = spawn_bot(&state, "Steve").await;

        let error = observe_handler(State(state.clone()), Path(response.id.clone()))
            .await
            .unwrap_err();
        assert_eq!(error.status, StatusCode::SERVICE_UNAVAILABLE);

        let error = observe_handler(State(state.clone()), Path("missing".to_string()))
            .await
            .unwrap_err();
        assert_eq!(error.status, StatusCode::NOT_FOUND);

        connector.send_event(0, SessionEvent::Joined);
        wait_for_status(&state, &response.id, SessionStatus::Ready).await;
        *connector.session(0).observation.lock().unwrap() = json!({"weather": "clear"});

        let observation = observe_handler(State(state.clone()), Path(response.id))
            .await
            .unwrap()
            .0;
        assert_eq!(observation["weather"], "clear");
    }

    #[test]
    fn chat_buffer_caps_size_and_evicts_oldest() {
        let mut buffer = ChatBuffer::new(3);
        for i in 0..4 {
            buffer.push("player", &format!("message-{i}"));
        }

        assert_eq!(buffer.len(), 3);
        let recent = buffer.recent(10);
        assert_eq!(recent[0].message, "message-3");
        assert!(recent.iter().all(|entry| entry.message != "message-0"));
    }

    #[test]
    fn chat_buffer_filters_slash_commands_and_empty_senders() {
        let mut buffer = ChatBuffer::new(10);
        buffer.push("player", "/tp player 0 0 0");
        buffer.push("", "hello");
        buffer.push("player", "");
        buffer.push("player", "hello");

        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.recent(10)[0].message, "hello");
    }

    #[tokio::test]
    async fn chat_endpoint_returns_newest_first_with_total() {
        let (state, connector, _) = default_state();
        spawn_bot(&state, "Steve").await;
        connector.send_event(0, SessionEvent::Joined);

        for i in 0..5 {
            connector.send_event(
                0,
                SessionEvent::Chat {
                    sender: "Alice".to_string(),
                    message: format!("msg-{i}"),
                },
            );
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let response = chat_handler(
            State(state.clone()),
            Query(ChatQuery { limit: Some(2) }),
        )
        .await
        .0;
        assert_eq!(response.total, 5);
        assert_eq!(response.messages.len(), 2);
        assert_eq!(response.messages[0].message, "msg-4");
        assert_eq!(response.messages[1].message, "msg-3");
    }

    #[tokio::test]
    async fn chat_relay_forwards_prefixed_messages_from_players_only() {
        let (state, connector, relay) = default_state();
        let response = spawn_bot(&state, "Steve").await;
        connector.send_event(0, SessionEvent::Joined);
        wait_for_status(&state, &response.id, SessionStatus::Ready).await;

        connector
            .session(0)
            .player_positions
            .lock()
            .unwrap()
            .insert("Alice".to_string(), Position::new(5, 70, -2));

        connector.send_event(
            0,
            SessionEvent::Chat {
                sender: "Alice".to_string(),
                message: "!ai hello bot".to_string(),
            },
        );
        connector.send_event(
            0,
            SessionEvent::Chat {
                sender: "Alice".to_string(),
                message: "ordinary chatter".to_string(),
            },
        );
        // Bot usernames never get relayed, even with the prefix.
        connector.send_event(
            0,
            SessionEvent::Chat {
                sender: "Steve".to_string(),
                message: "!ai loop".to_string(),
            },
        );
        tokio::time::sleep(Duration::from_millis(50)).await;

        let forwarded = relay.forwarded.lock().unwrap().clone();
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].player, "Alice");
        assert_eq!(forwarded[0].message, "hello bot");
        assert_eq!(forwarded[0].position, Some(Position::new(5, 70, -2)));
    }

    #[tokio::test]
    async fn auto_reconnect_spawns_replacement_with_new_id() {
        let connector = Arc::new(ScriptedConnector::default());
        let mut capabilities = test_capabilities();
        capabilities.auto_reconnect = true;
        let state = test_state(
            connector.clone(),
            Arc::new(RecordingRelay::default()),
            capabilities,
        );

        let response = spawn_bot(&state, "Steve").await;
        connector.send_event(0, SessionEvent::Joined);
        wait_for_status(&state, &response.id, SessionStatus::Ready).await;

        connector.send_event(0, SessionEvent::Ended);
        wait_for_status(&state, &response.id, SessionStatus::Disconnected).await;

        for _ in 0..100 {
            if connector.connection_count() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(connector.connection_count(), 2);
        assert_eq!(
            connector.usernames.lock().unwrap().clone(),
            vec!["Steve".to_string(), "Steve".to_string()]
        );

        let sessions = state.sessions.lock().await;
        assert_eq!(sessions.len(), 2);
        let replacement = sessions
            .iter()
            .find(|(id, _)| *id != &response.id)
            .map(|(_, record)| record)
            .unwrap();
        assert_eq!(replacement.username, "Steve");
        assert_eq!(replacement.status, SessionStatus::Spawning);
    }

    #[tokio::test]
    async fn despawned_sessions_are_not_reconnected() {
        let connector = Arc::new(ScriptedConnector::default());
        let mut capabilities = test_capabilities();
        capabilities.auto_reconnect = true;
        let state = test_state(
            connector.clone(),
            Arc::new(RecordingRelay::default()),
            capabilities,
        );

        let response = spawn_bot(&state, "Steve").await;
        connector.send_event(0, SessionEvent::Joined);
        wait_for_status(&state, &response.id, SessionStatus::Ready).await;

        connector.send_event(0, SessionEvent::Ended);
        wait_for_status(&state, &response.id, SessionStatus::Disconnected).await;
        despawn_handler(State(state.clone()), Path(response.id))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(connector.connection_count(), 1);
        assert!(state.sessions.lock().await.is_empty());
    }

    #[tokio::test]
    async fn walk_to_validates_input_and_state() {
        let (state, connector, _) = default_state();
        let response = spawn_bot(&state, "Steve").await;

        let error = walk_to_handler(
            State(state.clone()),
            Path("missing".to_string()),
            Json(WalkToRequest {
                x: Some(1.0),
                y: Some(64.0),
                z: Some(1.0),
                timeout: None,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(error.status, StatusCode::NOT_FOUND);

        let error = walk_to_handler(
            State(state.clone()),
            Path(response.id.clone()),
            Json(WalkToRequest {
                x: Some(1.0),
                y: Some(64.0),
                z: Some(1.0),
                timeout: None,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(error.status, StatusCode::SERVICE_UNAVAILABLE);

        connector.send_event(0, SessionEvent::Joined);
        wait_for_status(&state, &response.id, SessionStatus::Ready).await;

        let error = walk_to_handler(
            State(state.clone()),
            Path(response.id),
            Json(WalkToRequest {
                x: Some(1.0),
                y: None,
                z: Some(1.0),
                timeout: None,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(error.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn walk_to_close_target_walks_without_teleporting() {
        let (state, connector, _) = default_state();
        let response = spawn_bot(&state, "Steve").await;
        connector.send_event(0, SessionEvent::Joined);
        wait_for_status(&state, &response.id, SessionStatus::Ready).await;

        let result = walk_to_handler(
            State(state.clone()),
            Path(response.id),
            Json(WalkToRequest {
                x: Some(3.0),
                y: Some(64.0),
                z: Some(4.0),
                timeout: None,
            }),
        )
        .await
        .unwrap()
        .0;

        assert!(result.success);
        assert_eq!(result.method, "walked");
        assert!(connector.session(0).commands.lock().unwrap().is_empty());
        assert_eq!(connector.session(0).stop_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn walk_to_far_target_gets_a_head_start_teleport() {
        let (state, connector, _) = default_state();
        let response = spawn_bot(&state, "Steve").await;
        connector.send_event(0, SessionEvent::Joined);
        wait_for_status(&state, &response.id, SessionStatus::Ready).await;
        connector.session(0).set_position(Position::new(0, 64, 0));

        let result = walk_to_handler(
            State(state.clone()),
            Path(response.id),
            Json(WalkToRequest {
                x: Some(100.0),
                y: Some(64.0),
                z: Some(0.0),
                timeout: None,
            }),
        )
        .await
        .unwrap()
        .0;

        assert_eq!(result.method, "walked");
        let commands = connector.session(0).commands.lock().unwrap().clone();
        assert_eq!(commands, vec!["/tp Steve 90 64 0".to_string()]);
    }

    #[tokio::test]
    async fn walk_to_times_out_into_stopped_navigation_and_teleport() {
        let (state, connector, _) = default_state();
        let response = spawn_bot(&state, "Steve").await;
        connector.send_event(0, SessionEvent::Joined);
        wait_for_status(&state, &response.id, SessionStatus::Ready).await;

        let session = connector.session(0);
        session.navigate_forever.store(true, Ordering::SeqCst);

        let result = walk_to_handler(
            State(state.clone()),
            Path(response.id),
            Json(WalkToRequest {
                x: Some(5.0),
                y: Some(64.0),
                z: Some(5.0),
                timeout: Some(1.0),
            }),
        )
        .await
        .unwrap()
        .0;

        assert!(result.success);
        assert_eq!(result.method, "teleported");
        assert_eq!(session.stop_calls.load(Ordering::SeqCst), 1);
        let commands = session.commands.lock().unwrap().clone();
        assert_eq!(commands, vec!["/tp Steve 5 64 5".to_string()]);
    }

    #[test]
    fn sanitize_chat_rejects_empty_and_escapes_commands() {
        assert!(sanitize_chat_message("").is_err());
        assert_eq!(sanitize_chat_message("/op me").unwrap(), ".op me");
        assert_eq!(sanitize_chat_message("hello").unwrap(), "hello");
        assert_eq!(
            sanitize_chat_message(&"a".repeat(700)).unwrap().len(),
            MAX_CHAT_MESSAGE_LEN
        );
    }

    #[test]
    fn driver_events_parse_into_session_events() {
        assert!(matches!(
            parse_driver_event(&json!({"event": "joined"})),
            Some(SessionEvent::Joined)
        ));
        assert!(matches!(
            parse_driver_event(&json!({"event": "kicked", "reason": "idle"})),
            Some(SessionEvent::Kicked { reason }) if reason == "idle"
        ));
        assert!(matches!(
            parse_driver_event(&json!({"event": "end"})),
            Some(SessionEvent::Ended)
        ));
        assert!(matches!(
            parse_driver_event(&json!({"event": "death"})),
            Some(SessionEvent::Died)
        ));
        assert!(matches!(
            parse_driver_event(&json!({"event": "chat", "sender": "A", "message": "m"})),
            Some(SessionEvent::Chat { .. })
        ));
        assert!(parse_driver_event(&json!({"event": "chat", "sender": "A"})).is_none());
        assert!(parse_driver_event(&json!({"event": "meteor"})).is_none());
        assert!(parse_driver_event(&json!({"reply_to": 4})).is_none());
    }

    #[tokio::test]
    async fn availability_probe_reflects_listener_state() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        assert!(probe_game_server(&addr).await);

        drop(listener);
        assert!(!probe_game_server(&addr).await);
    }

    #[tokio::test]
    async fn health_reports_service_name() {
        let payload = health().await.0;
        assert_eq!(payload["ok"], true);
        assert_eq!(payload["service"], "bot-manager-service");
    }
}
