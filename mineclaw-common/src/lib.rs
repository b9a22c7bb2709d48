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

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Identifier of the bridge channel as seen by the host messaging runtime.
pub const CHANNEL_ID: &str = "mineclaw";

pub type SessionId = String;

/// Block coordinates, rounded to whole blocks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Position {
    pub x: i64,
    pub y: i64,
    pub z: i64,
}

impl Position {
    pub fn new(x: i64, y: i64, z: i64) -> Self {
        Self { x, y, z }
    }

    /// 2-D (horizontal) distance, used for the walk-to close-range check.
    pub fn horizontal_distance_to(&self, other: &Position) -> f64 {
        let dx = (self.x - other.x) as f64;
        let dz = (self.z - other.z) as f64;
        (dx * dx + dz * dz).sqrt()
    }
}

/// Lifecycle state of one managed game session.
///
/// `disconnected` is terminal for the session instance: recovery always goes
/// through a fresh spawn that produces a new session id.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Spawning,
    Ready,
    Disconnected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub sender: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Payload the bot-manager's chat relay POSTs to the bridge webhook, and the
/// shape the bridge accepts on `POST /webhook`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundChatEvent {
    pub player: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeMetadata {
    pub player: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    pub position_info: String,
}

/// Channel-agnostic inbound envelope submitted to the host runtime's
/// inbound-event pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEnvelope {
    pub channel: String,
    pub account_id: String,
    pub from: String,
    pub from_label: String,
    pub text: String,
    pub metadata: EnvelopeMetadata,
}

impl InboundEnvelope {
    pub fn from_chat_event(account_id: &str, event: &InboundChatEvent) -> Self {
        let position_info = event
            .position
            .map(|p| format!(" (at {}, {}, {})", p.x, p.y, p.z))
            .unwrap_or_default();

        Self {
            channel: CHANNEL_ID.to_string(),
            account_id: account_id.to_string(),
            from: event.player.clone(),
            from_label: event.player.clone(),
            text: event.message.clone(),
            metadata: EnvelopeMetadata {
                player: event.player.clone(),
                position: event.position,
                position_info,
            },
        }
    }
}

/// Replace `${VAR_NAME}` patterns in a string with values from environment
/// variables. Unknown or unset variables are replaced with an empty string.
pub fn expand_env_vars(input: &str) -> String {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap();
    re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_default()
    })
    .into_owned()
}
