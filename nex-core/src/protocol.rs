//! WebSocket protocol types for nex communication
//!
//! Every frame in either direction is a JSON object of the shape
//! `{"event": "...", "args": ["...", ...]}`.
//!
//! Client → hub: `auth` (session token) and `media` (player control).
//! Hub → client: `stats` (telemetry snapshot) and `session expiring`.

use chrono::{DateTime, TimeZone};
use serde::{Deserialize, Serialize};

pub const EVENT_AUTH: &str = "auth";
pub const EVENT_MEDIA: &str = "media";
pub const EVENT_STATS: &str = "stats";
pub const EVENT_SESSION_EXPIRING: &str = "session expiring";

/// Application-level close codes layered on the WebSocket close frame
pub mod close_code {
    /// Bad signature, expired token or wrong token purpose
    pub const AUTH_FAILED: u16 = 4001;
    /// The session outlived its lifetime
    pub const TOKEN_EXPIRED: u16 = 4004;
}

/// A single frame on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub event: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Event {
    pub fn new(event: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            event: event.into(),
            args,
        }
    }

    /// Telemetry broadcast carrying an already serialized snapshot
    pub fn stats(snapshot: impl Into<String>) -> Self {
        Self::new(EVENT_STATS, vec![snapshot.into()])
    }

    /// Advisory notice that the session will be closed soon
    pub fn session_expiring<Tz>(at: DateTime<Tz>) -> Self
    where
        Tz: TimeZone,
        Tz::Offset: std::fmt::Display,
    {
        Self::new(
            EVENT_SESSION_EXPIRING,
            vec![format!("[{}]: Your Session will expire", at.format("%H:%M:%S"))],
        )
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Player control actions a client may request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaCommand {
    PlayPause,
    Next,
    Previous,
    /// Offset in milliseconds
    SetPosition(i64),
}

impl MediaCommand {
    /// Parse the `args` of a `media` event.
    ///
    /// Returns `None` for unknown actions and for `set_position` without a
    /// parseable integer offset.
    pub fn parse(args: &[String]) -> Option<Self> {
        match args.first()?.as_str() {
            "play_pause" => Some(Self::PlayPause),
            "next" => Some(Self::Next),
            "previous" => Some(Self::Previous),
            "set_position" => args.get(1)?.trim().parse().ok().map(Self::SetPosition),
            _ => None,
        }
    }
}

/// Inbound frames the hub acts on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    Auth { token: String },
    Media(MediaCommand),
}

impl ClientCommand {
    /// Interpret a decoded frame; anything unrecognized is `None`
    pub fn from_event(event: Event) -> Option<Self> {
        match event.event.as_str() {
            EVENT_AUTH => event
                .args
                .into_iter()
                .next()
                .map(|token| Self::Auth { token }),
            EVENT_MEDIA => MediaCommand::parse(&event.args).map(Self::Media),
            _ => None,
        }
    }

    /// Decode raw frame bytes. Malformed payloads yield `None`.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let event: Event = serde_json::from_slice(bytes).ok()?;
        Self::from_event(event)
    }
}
