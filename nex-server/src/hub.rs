//! Session hub
//!
//! One task owns the set of live sessions. Everything else talks to it over
//! a FIFO command channel through [`HubHandle`], so registration, removal,
//! broadcast and the expiry sweep never race each other.
//!
//! Every tick the hub:
//! 1. pulls one telemetry snapshot and fans it out to authenticated sessions
//! 2. closes sessions past their expiry and warns those about to expire
//!
//! A refresh request collects a new snapshot off the loop and fans it out
//! once it arrives, so clients see state newer than the last tick.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Utf8Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Instant, MissedTickBehavior};

use nex_core::config::SessionConfig;
use nex_core::Event;

use crate::session::{CloseReason, SessionId, SessionLink};
use crate::telemetry::TelemetrySource;

/// Timing knobs for the control loop
#[derive(Debug, Clone)]
pub struct HubSettings {
    pub tick_interval: Duration,
    /// Lifetime of a session, counted from registration
    pub session_ttl: Duration,
    /// Remaining lifetime at which the expiry notice is sent
    pub expiry_warning: Duration,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            session_ttl: Duration::from_secs(20 * 60),
            expiry_warning: Duration::from_secs(4 * 60),
        }
    }
}

impl From<&SessionConfig> for HubSettings {
    fn from(config: &SessionConfig) -> Self {
        Self {
            tick_interval: config.tick_interval(),
            session_ttl: config.session_ttl(),
            expiry_warning: config.expiry_warning(),
        }
    }
}

/// Point-in-time view of one session
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub id: SessionId,
    pub subject: Option<String>,
    pub authenticated: bool,
}

enum HubCommand {
    Register(SessionLink),
    Unregister {
        id: SessionId,
        close: Option<CloseReason>,
    },
    Authenticated {
        id: SessionId,
        subject: String,
    },
    Refresh,
    Inspect(oneshot::Sender<Vec<SessionSummary>>),
}

/// Cloneable entry point into the hub
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::UnboundedSender<HubCommand>,
}

impl HubHandle {
    pub fn register(&self, link: SessionLink) {
        self.send(HubCommand::Register(link));
    }

    /// Remove a session. Unknown or already removed ids are ignored.
    pub fn unregister(&self, id: SessionId, close: Option<CloseReason>) {
        self.send(HubCommand::Unregister { id, close });
    }

    /// Mark a session as authenticated so it starts receiving broadcasts
    pub fn authenticated(&self, id: SessionId, subject: String) {
        self.send(HubCommand::Authenticated { id, subject });
    }

    /// Broadcast a fresh snapshot now instead of waiting for the next tick
    pub fn refresh(&self) {
        self.send(HubCommand::Refresh);
    }

    /// Current sessions, as seen by the control loop
    pub async fn sessions(&self) -> Vec<SessionSummary> {
        let (tx, rx) = oneshot::channel();
        self.send(HubCommand::Inspect(tx));
        rx.await.unwrap_or_default()
    }

    fn send(&self, command: HubCommand) {
        if self.tx.send(command).is_err() {
            tracing::debug!("Hub is gone, dropping command");
        }
    }
}

struct Member {
    link: SessionLink,
    subject: Option<String>,
    authenticated: bool,
    expiry: Instant,
    warned: bool,
}

/// The control loop state. Only reachable through [`HubHandle`].
pub struct Hub {
    sessions: HashMap<SessionId, Member>,
    commands: mpsc::UnboundedReceiver<HubCommand>,
    telemetry: Arc<dyn TelemetrySource>,
    /// Snapshots collected on demand, delivered back into the loop
    fresh_tx: mpsc::UnboundedSender<String>,
    fresh_rx: mpsc::UnboundedReceiver<String>,
    settings: HubSettings,
}

impl Hub {
    /// Start the control loop on the current runtime
    pub fn spawn(telemetry: Arc<dyn TelemetrySource>, settings: HubSettings) -> HubHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let (fresh_tx, fresh_rx) = mpsc::unbounded_channel();

        let hub = Hub {
            sessions: HashMap::new(),
            commands: rx,
            telemetry,
            fresh_tx,
            fresh_rx,
            settings,
        };
        tokio::spawn(hub.run());

        HubHandle { tx }
    }

    async fn run(mut self) {
        let mut ticker = interval(self.settings.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                Some(snapshot) = self.fresh_rx.recv() => self.fan_out(snapshot),
                _ = ticker.tick() => {
                    self.broadcast();
                    self.sweep(Instant::now());
                }
            }
        }

        tracing::info!("All hub handles dropped, stopping");
    }

    fn handle(&mut self, command: HubCommand) {
        match command {
            HubCommand::Register(link) => {
                let id = link.id;
                self.sessions.insert(
                    id,
                    Member {
                        link,
                        subject: None,
                        authenticated: false,
                        expiry: Instant::now() + self.settings.session_ttl,
                        warned: false,
                    },
                );
                tracing::debug!(session = %id, total = self.sessions.len(), "Registered");
            }
            HubCommand::Unregister { id, close } => {
                if let Some(member) = self.sessions.remove(&id) {
                    member.link.close(close);
                    tracing::debug!(session = %id, total = self.sessions.len(), "Unregistered");
                }
            }
            HubCommand::Authenticated { id, subject } => {
                if let Some(member) = self.sessions.get_mut(&id) {
                    member.authenticated = true;
                    member.subject = Some(subject);
                }
            }
            HubCommand::Refresh => self.collect_fresh(),
            HubCommand::Inspect(reply) => {
                let summaries = self
                    .sessions
                    .values()
                    .map(|member| SessionSummary {
                        id: member.link.id,
                        subject: member.subject.clone(),
                        authenticated: member.authenticated,
                    })
                    .collect();
                let _ = reply.send(summaries);
            }
        }
    }

    /// Broadcast the cached snapshot
    fn broadcast(&mut self) {
        match self.telemetry.snapshot() {
            Ok(snapshot) => self.fan_out(snapshot),
            Err(e) => tracing::debug!("Skipping broadcast: {}", e),
        }
    }

    /// Collect a new snapshot off the loop; it is broadcast when it arrives
    fn collect_fresh(&self) {
        let telemetry = self.telemetry.clone();
        let fresh = self.fresh_tx.clone();
        tokio::spawn(async move {
            match telemetry.collect_now().await {
                Ok(snapshot) => {
                    let _ = fresh.send(snapshot);
                }
                Err(e) => tracing::debug!("Skipping refresh: {}", e),
            }
        });
    }

    /// Fan one snapshot out to every authenticated session
    fn fan_out(&mut self, snapshot: String) {
        let frame = match Event::stats(snapshot).to_json() {
            Ok(json) => Utf8Bytes::from(json),
            Err(e) => {
                tracing::warn!("Failed to serialize stats event: {}", e);
                return;
            }
        };

        let slow: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|member| member.authenticated)
            .filter(|member| member.link.try_enqueue(frame.clone()).is_err())
            .map(|member| member.link.id)
            .collect();

        for id in slow {
            self.evict(id);
        }
    }

    /// Close expired sessions and warn the ones about to expire
    fn sweep(&mut self, now: Instant) {
        let warning = self.settings.expiry_warning;
        let mut notice: Option<Utf8Bytes> = None;
        let mut expired = Vec::new();
        let mut slow = Vec::new();

        for (id, member) in self.sessions.iter_mut() {
            let remaining = member.expiry.saturating_duration_since(now);

            if remaining.is_zero() {
                expired.push(*id);
                continue;
            }

            if member.authenticated && !member.warned && remaining <= warning {
                member.warned = true;
                let frame = notice.get_or_insert_with(expiry_notice).clone();
                if member.link.try_enqueue(frame).is_err() {
                    slow.push(*id);
                }
            }
        }

        for id in expired {
            if let Some(member) = self.sessions.remove(&id) {
                tracing::info!(session = %id, "Session expired");
                member.link.close(Some(CloseReason::TokenExpired));
            }
        }

        for id in slow {
            self.evict(id);
        }
    }

    /// Drop a session whose queue is full or whose pump is gone.
    /// Runs inside the loop, so it removes directly.
    fn evict(&mut self, id: SessionId) {
        if let Some(member) = self.sessions.remove(&id) {
            tracing::warn!(session = %id, "Outbound queue full, dropping slow consumer");
            member.link.close(None);
        }
    }
}

fn expiry_notice() -> Utf8Bytes {
    let event = Event::session_expiring(chrono::Local::now());
    // Two plain strings always serialize
    Utf8Bytes::from(event.to_json().unwrap_or_default())
}
