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

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use mineclaw_common::{CHANNEL_ID, InboundChatEvent, InboundEnvelope, expand_env_vars};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};

const MAX_WEBHOOK_BODY_BYTES: usize = 64 * 1024;
const STATUS_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_WEBHOOK_PORT: u16 = 18790;

// ---------------------------------------------------------------------------
// Accounts & config
// ---------------------------------------------------------------------------

/// One bridged game deployment: where its control API lives and where this
/// service listens for its webhook events.
#[derive(Debug, Clone, Deserialize)]
struct BridgeAccount {
    account_id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    api_url: Option<String>,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default = "default_webhook_port")]
    webhook_port: u16,
    #[serde(default)]
    webhook_token: Option<String>,
}

fn default_enabled() -> bool {
    true
}

fn default_webhook_port() -> u16 {
    DEFAULT_WEBHOOK_PORT
}

impl BridgeAccount {
    fn from_env() -> Self {
        Self {
            account_id: "default".to_string(),
            name: None,
            enabled: true,
            api_url: std::env::var("MINECLAW_API_URL")
                .ok()
                .filter(|value| !value.trim().is_empty()),
            api_key: std::env::var("MINECLAW_API_KEY")
                .ok()
                .filter(|value| !value.trim().is_empty()),
            webhook_port: std::env::var("MINECLAW_WEBHOOK_PORT")
                .ok()
                .and_then(|value| value.parse::<u16>().ok())
                .unwrap_or(DEFAULT_WEBHOOK_PORT),
            webhook_token: std::env::var("MINECLAW_WEBHOOK_TOKEN")
                .ok()
                .filter(|value| !value.trim().is_empty()),
        }
    }

    fn is_configured(&self) -> bool {
        self.api_url.is_some() && self.api_key.is_some()
    }

    fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.account_id)
    }

    /// Base URL with trailing slashes removed, ready for path concatenation.
    fn api_base(&self) -> Option<String> {
        self.api_url
            .as_deref()
            .map(|url| url.trim_end_matches('/').to_string())
    }
}

#[derive(Debug, Deserialize)]
struct AccountsFile {
    #[serde(default)]
    accounts: Vec<AccountsFileEntry>,
}

#[derive(Debug, Deserialize)]
struct AccountsFileEntry {
    account_id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    api_url: Option<String>,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default = "default_webhook_port")]
    webhook_port: u16,
    #[serde(default)]
    webhook_token: Option<String>,
}

/// Default account from env plus any extra accounts from the optional YAML
/// file. `${VAR}` references in the file are expanded before parsing; a
/// broken file logs and falls back to the env account alone.
fn load_accounts() -> Vec<BridgeAccount> {
    let mut accounts = vec![BridgeAccount::from_env()];

    let Some(path) = std::env::var("BRIDGE_ACCOUNTS_CONFIG_PATH")
        .ok()
        .filter(|value| !value.trim().is_empty())
    else {
        return accounts;
    };

    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) => {
            warn!(%path, error = %err, "failed to read accounts config, using env account only");
            return accounts;
        }
    };

    let expanded = expand_env_vars(&raw);
    let parsed: AccountsFile = match serde_yaml::from_str(&expanded) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!(%path, error = %err, "failed to parse accounts config, using env account only");
            return accounts;
        }
    };

    for entry in parsed.accounts {
        if accounts
            .iter()
            .any(|account| account.account_id == entry.account_id)
        {
            warn!(account_id = %entry.account_id, "duplicate account id in config, skipping");
            continue;
        }
        accounts.push(BridgeAccount {
            account_id: entry.account_id,
            name: entry.name,
            enabled: entry.enabled,
            api_url: entry.api_url.filter(|value| !value.trim().is_empty()),
            api_key: entry.api_key.filter(|value| !value.trim().is_empty()),
            webhook_port: entry.webhook_port,
            webhook_token: entry.webhook_token.filter(|value| !value.trim().is_empty()),
        });
    }

    accounts
}

// ---------------------------------------------------------------------------
// Inbound pipeline
// ---------------------------------------------------------------------------

/// Hand-off point between the webhook listener and the host messaging
/// runtime. Submission is fire-and-forget: the webhook response does not
/// wait for runtime processing.
#[async_trait]
trait InboundPipeline: Send + Sync {
    async fn submit(&self, envelope: InboundEnvelope);
}

/// Production pipeline: queues envelopes onto an unbounded channel drained by
/// a forwarder task that POSTs each one to the runtime's inbound endpoint.
/// Delivery is at most once; a failed POST is logged and dropped.
struct RuntimeForwarder {
    queue: mpsc::UnboundedSender<InboundEnvelope>,
}

impl RuntimeForwarder {
    fn from_env(client: reqwest::Client) -> anyhow::Result<Self> {
        let inbound_url =
            std::env::var("OPENCLAW_INBOUND_URL").context("OPENCLAW_INBOUND_URL is not set")?;
        let inbound_token = std::env::var("OPENCLAW_INBOUND_TOKEN")
            .ok()
            .filter(|value| !value.trim().is_empty());

        let (queue, mut rx) = mpsc::unbounded_channel::<InboundEnvelope>();
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let mut request = client.post(&inbound_url).json(&envelope);
                if let Some(token) = inbound_token.as_ref() {
                    request = request.bearer_auth(token);
                }
                match request.send().await {
                    Ok(response) if response.status().is_success() => {
                        debug!(from = %envelope.from, "forwarded inbound message to runtime");
                    }
                    Ok(response) => {
                        warn!(
                            from = %envelope.from,
                            status = %response.status(),
                            "runtime rejected inbound message"
                        );
                    }
                    Err(err) => {
                        warn!(from = %envelope.from, error = %err, "failed to reach runtime");
                    }
                }
            }
        });

        Ok(Self { queue })
    }
}

#[async_trait]
impl InboundPipeline for RuntimeForwarder {
    async fn submit(&self, envelope: InboundEnvelope) {
        if self.queue.send(envelope).is_err() {
            error!("inbound forwarder task is gone, dropping message");
        }
    }
}

// ---------------------------------------------------------------------------
// Webhook listener
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct WebhookState {
    account: Arc<BridgeAccount>,
    pipeline: Arc<dyn InboundPipeline>,
}

fn build_webhook_router(state: WebhookState) -> Router {
    Router::new()
        .route("/health", get(webhook_health))
        .route("/webhook", post(webhook_handler))
        .layer(DefaultBodyLimit::max(MAX_WEBHOOK_BODY_BYTES))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn webhook_health() -> Json<Value> {
    Json(json!({"status": "ok", "channel": CHANNEL_ID}))
}

async fn webhook_handler(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    payload: Result<Json<InboundChatEvent>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    if let Some(expected) = state.account.webhook_token.as_deref() {
        let presented = bearer_token(&headers);
        if presented != Some(expected) {
            return Err(ApiError::unauthorized("invalid or missing bearer token"));
        }
    }

    let Json(event) = payload.map_err(|rejection| {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ApiError::payload_too_large("webhook body exceeds the 64 KiB limit")
        } else {
            ApiError::bad_request(format!("invalid webhook payload: {rejection}"))
        }
    })?;

    if event.player.trim().is_empty() || event.message.trim().is_empty() {
        return Err(ApiError::bad_request(
            "webhook payload requires non-empty 'player' and 'message'",
        ));
    }

    let envelope = InboundEnvelope::from_chat_event(&state.account.account_id, &event);
    info!(
        account_id = %state.account.account_id,
        player = %event.player,
        "accepted in-game message"
    );
    state.pipeline.submit(envelope).await;

    Ok(Json(json!({"success": true})))
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
struct SendOutcome {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct StatusProbe {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    server_online: Option<bool>,
}

#[derive(Debug, Serialize)]
struct OutboundChatBody<'a> {
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    target: Option<&'a str>,
}

/// Strips the channel/user routing prefix a host runtime may attach to
/// delivery targets. Empty targets mean broadcast.
fn normalize_target(target: Option<&str>) -> Option<String> {
    let raw = target?.trim();
    let stripped = raw
        .strip_prefix("mineclaw:")
        .or_else(|| raw.strip_prefix("user:"))
        .unwrap_or(raw)
        .trim();
    if stripped.is_empty() {
        None
    } else {
        Some(stripped.to_string())
    }
}

/// Posts one chat message to the account's control API. Failures come back
/// as a result value rather than an error; there are no retries.
async fn send_chat_message(
    client: &reqwest::Client,
    account: &BridgeAccount,
    text: &str,
    target: Option<&str>,
) -> SendOutcome {
    let (Some(base), Some(api_key)) = (account.api_base(), account.api_key.as_deref()) else {
        return SendOutcome {
            ok: false,
            error: Some(format!("account {} is not configured", account.label())),
        };
    };

    let target = normalize_target(target);
    let body = OutboundChatBody {
        message: text,
        target: target.as_deref(),
    };

    let response = client
        .post(format!("{base}/api/chat/send"))
        .bearer_auth(api_key)
        .json(&body)
        .send()
        .await;

    match response {
        Ok(response) if response.status().is_success() => SendOutcome {
            ok: true,
            error: None,
        },
        Ok(response) => {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            SendOutcome {
                ok: false,
                error: Some(format!("HTTP {}: {}", status.as_u16(), body)),
            }
        }
        Err(err) => SendOutcome {
            ok: false,
            error: Some(err.to_string()),
        },
    }
}

/// One bounded status probe against the account's control API.
async fn check_server_status(client: &reqwest::Client, account: &BridgeAccount) -> StatusProbe {
    let (Some(base), Some(api_key)) = (account.api_base(), account.api_key.as_deref()) else {
        return StatusProbe {
            ok: false,
            error: Some(format!("account {} is not configured", account.label())),
            server_online: None,
        };
    };

    let request = client
        .get(format!("{base}/api/status"))
        .bearer_auth(api_key)
        .send();

    let response = match tokio::time::timeout(STATUS_PROBE_TIMEOUT, request).await {
        Ok(Ok(response)) => response,
        Ok(Err(err)) => {
            return StatusProbe {
                ok: false,
                error: Some(err.to_string()),
                server_online: None,
            };
        }
        Err(_) => {
            return StatusProbe {
                ok: false,
                error: Some("status request timed out".to_string()),
                server_online: None,
            };
        }
    };

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return StatusProbe {
            ok: false,
            error: Some(format!("HTTP {}: {}", status.as_u16(), body)),
            server_online: None,
        };
    }

    let parsed: Value = match response.json().await {
        Ok(parsed) => parsed,
        Err(err) => {
            return StatusProbe {
                ok: false,
                error: Some(format!("malformed status response: {err}")),
                server_online: None,
            };
        }
    };

    StatusProbe {
        ok: true,
        error: None,
        server_online: parsed.get("server_online").and_then(Value::as_bool),
    }
}

// ---------------------------------------------------------------------------
// Control surface (outbound over HTTP, for the host runtime)
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct ControlState {
    client: reqwest::Client,
    accounts: Arc<Vec<BridgeAccount>>,
}

impl ControlState {
    fn resolve_account(&self, account_id: Option<&str>) -> Result<&BridgeAccount, ApiError> {
        let wanted = account_id.unwrap_or("default");
        self.accounts
            .iter()
            .find(|account| account.account_id == wanted)
            .ok_or_else(|| ApiError::not_found(format!("unknown account '{wanted}'")))
    }
}

#[derive(Debug, Deserialize)]
struct OutboundSendRequest {
    text: String,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    account_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OutboundStatusQuery {
    #[serde(default)]
    account_id: Option<String>,
}

fn build_control_router(state: ControlState) -> Router {
    Router::new()
        .route("/health", get(control_health))
        .route("/outbound/send", post(outbound_send_handler))
        .route("/outbound/status", get(outbound_status_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn control_health() -> Json<Value> {
    Json(json!({"ok": true, "service": "chat-bridge-service"}))
}

async fn outbound_send_handler(
    State(state): State<ControlState>,
    Json(request): Json<OutboundSendRequest>,
) -> Result<Json<SendOutcome>, ApiError> {
    if request.text.trim().is_empty() {
        return Err(ApiError::bad_request("missing 'text' field"));
    }
    let account = state.resolve_account(request.account_id.as_deref())?;
    let outcome = send_chat_message(
        &state.client,
        account,
        &request.text,
        request.target.as_deref(),
    )
    .await;
    if let Some(err) = outcome.error.as_deref() {
        warn!(account_id = %account.account_id, error = %err, "outbound send failed");
    }
    Ok(Json(outcome))
}

async fn outbound_status_handler(
    State(state): State<ControlState>,
    axum::extract::Query(query): axum::extract::Query<OutboundStatusQuery>,
) -> Result<Json<StatusProbe>, ApiError> {
    let account = state.resolve_account(query.account_id.as_deref())?;
    Ok(Json(check_server_status(&state.client, account).await))
}

// ---------------------------------------------------------------------------
// Startup
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "chat_bridge_service=debug,tower_http=info".to_string()),
        )
        .init();

    let client = reqwest::Client::new();
    let accounts = load_accounts();
    let pipeline: Arc<dyn InboundPipeline> = Arc::new(RuntimeForwarder::from_env(client.clone())?);

    for account in &accounts {
        if !account.enabled {
            info!(account_id = %account.account_id, "account disabled, skipping");
            continue;
        }
        if !account.is_configured() {
            warn!(
                account_id = %account.account_id,
                "account has no api_url/api_key, not starting its webhook listener"
            );
            continue;
        }
        if account.webhook_token.is_none() {
            warn!(
                account_id = %account.account_id,
                "no webhook token configured, the webhook endpoint is unauthenticated"
            );
        }

        let probe = check_server_status(&client, account).await;
        match probe.error.as_deref() {
            None => info!(
                account_id = %account.account_id,
                server_online = ?probe.server_online,
                "control API reachable"
            ),
            Some(err) => warn!(
                account_id = %account.account_id,
                error = %err,
                "control API not reachable at startup"
            ),
        }

        let bind_addr: SocketAddr = format!("127.0.0.1:{}", account.webhook_port)
            .parse()
            .context("invalid webhook bind address")?;
        let router = build_webhook_router(WebhookState {
            account: Arc::new(account.clone()),
            pipeline: pipeline.clone(),
        });
        let listener = tokio::net::TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("failed to bind webhook listener on {bind_addr}"))?;
        info!(account_id = %account.account_id, %bind_addr, "webhook listener started");
        tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, router).await {
                error!(error = %err, "webhook listener exited");
            }
        });
    }

    let control_state = ControlState {
        client,
        accounts: Arc::new(accounts),
    };
    let bind_addr = parse_bind_addr("CHAT_BRIDGE_BIND", "127.0.0.1:3002")?;
    info!(%bind_addr, "chat-bridge-service listening");
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, build_control_router(control_state)).await?;
    Ok(())
}

fn parse_bind_addr(var_name: &str, default: &str) -> anyhow::Result<SocketAddr> {
    let value = std::env::var(var_name)
        .ok()
        .unwrap_or_else(|| default.to_string());
    value.parse().context(format!("invalid {var_name}"))
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

    fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn payload_too_large(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::PAYLOAD_TOO_LARGE,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        warn!(status = %self.status, message = %self.message, "chat-bridge request failed");
        (self.status, Json(json!({"error": self.message}))).into_response()
    }
}
