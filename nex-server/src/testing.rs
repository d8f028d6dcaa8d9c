//! In-memory collaborators for unit tests

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use nex_core::MediaCommand;
use tokio::sync::Mutex;

use crate::media::CommandSink;
use crate::telemetry::{TelemetryError, TelemetrySource};

/// Counts snapshots; every snapshot is `{"tick":N}`
#[derive(Default)]
pub struct FakeTelemetry {
    calls: AtomicUsize,
    failing: bool,
}

impl FakeTelemetry {
    pub fn failing() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            failing: true,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TelemetrySource for FakeTelemetry {
    fn snapshot(&self) -> Result<String, TelemetryError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.failing {
            return Err(TelemetryError::NotReady);
        }
        Ok(format!("{{\"tick\":{n}}}"))
    }

    async fn collect_now(&self) -> Result<String, TelemetryError> {
        self.snapshot()
    }
}

/// Records every command it receives
#[derive(Default)]
pub struct FakeCommands {
    recorded: Mutex<Vec<MediaCommand>>,
}

impl FakeCommands {
    pub async fn recorded(&self) -> Vec<MediaCommand> {
        self.recorded.lock().await.clone()
    }
}

#[async_trait]
impl CommandSink for FakeCommands {
    async fn play_pause(&self) {
        self.recorded.lock().await.push(MediaCommand::PlayPause);
    }

    async fn next(&self) {
        self.recorded.lock().await.push(MediaCommand::Next);
    }

    async fn previous(&self) {
        self.recorded.lock().await.push(MediaCommand::Previous);
    }

    async fn set_position(&self, offset_ms: i64) {
        self.recorded.lock().await.push(MediaCommand::SetPosition(offset_ms));
    }
}

/// A player whose telemetry is cached like the real collector's.
///
/// Commands change the live state; `snapshot` keeps serving the value from
/// the last collection until `collect_now` runs.
pub struct FakePlayer {
    playing: AtomicBool,
    cached: std::sync::Mutex<String>,
}

impl FakePlayer {
    pub fn new() -> Self {
        Self {
            playing: AtomicBool::new(false),
            cached: std::sync::Mutex::new(Self::render(false)),
        }
    }

    fn render(playing: bool) -> String {
        format!("{{\"playing\":{playing}}}")
    }
}

#[async_trait]
impl TelemetrySource for FakePlayer {
    fn snapshot(&self) -> Result<String, TelemetryError> {
        Ok(self.cached.lock().unwrap().clone())
    }

    async fn collect_now(&self) -> Result<String, TelemetryError> {
        let fresh = Self::render(self.playing.load(Ordering::SeqCst));
        *self.cached.lock().unwrap() = fresh.clone();
        Ok(fresh)
    }
}

#[async_trait]
impl CommandSink for FakePlayer {
    async fn play_pause(&self) {
        self.playing.fetch_xor(true, Ordering::SeqCst);
    }

    async fn next(&self) {}

    async fn previous(&self) {}

    async fn set_position(&self, _offset_ms: i64) {}
}

/// Never finishes a command, like a wedged player
#[derive(Default)]
pub struct StuckCommands;

#[async_trait]
impl CommandSink for StuckCommands {
    async fn play_pause(&self) {
        std::future::pending::<()>().await;
    }

    async fn next(&self) {
        std::future::pending::<()>().await;
    }

    async fn previous(&self) {
        std::future::pending::<()>().await;
    }

    async fn set_position(&self, _offset_ms: i64) {
        std::future::pending::<()>().await;
    }
}
