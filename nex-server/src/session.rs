//! A single client connection
//!
//! Each session is split in two:
//! - [`SessionLink`]: held by the hub, used to enqueue frames and tear down
//! - two pumps: the inbound pump is the only reader of the transport, the
//!   outbound pump the only writer
//!
//! Nothing but the outbound pump touches the write half. Close frames are
//! requested through the hub and emitted by the outbound pump.

use std::fmt::Display;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use nex_core::protocol::close_code;
use nex_core::{AuthError, ClientCommand, TokenPurpose, TokenValidator};

use crate::hub::HubHandle;
use crate::media::{self, CommandSink};

pub type SessionId = Uuid;

/// Why the hub closed a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    AuthFailed,
    TokenExpired,
}

impl CloseReason {
    pub fn code(self) -> u16 {
        match self {
            CloseReason::AuthFailed => close_code::AUTH_FAILED,
            CloseReason::TokenExpired => close_code::TOKEN_EXPIRED,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            CloseReason::AuthFailed => "Authentication failed",
            CloseReason::TokenExpired => "Token expired",
        }
    }

    fn frame(self) -> CloseFrame {
        CloseFrame {
            code: self.code(),
            reason: self.reason().into(),
        }
    }
}

/// Hub-side half of a session
#[derive(Debug)]
pub struct SessionLink {
    pub id: SessionId,
    outbound: mpsc::Sender<Utf8Bytes>,
    close: oneshot::Sender<Option<CloseReason>>,
    cancel: CancellationToken,
}

impl SessionLink {
    /// Queue a pre-serialized frame without waiting
    pub fn try_enqueue(&self, frame: Utf8Bytes) -> Result<(), TrySendError<Utf8Bytes>> {
        self.outbound.try_send(frame)
    }

    /// Release the session.
    ///
    /// The outbound pump sends a close frame (with `reason`'s code if any),
    /// the inbound pump stops reading and the outbound queue is closed.
    /// Takes `self`, so it can only happen once per session.
    pub fn close(self, reason: Option<CloseReason>) {
        let _ = self.close.send(reason);
        self.cancel.cancel();
    }
}

/// Pump-side half of a session
pub struct SessionPorts {
    pub(crate) outbound: mpsc::Receiver<Utf8Bytes>,
    pub(crate) close: oneshot::Receiver<Option<CloseReason>>,
    pub(crate) cancel: CancellationToken,
}

/// Create both halves of a session with a bounded outbound queue
pub fn channel(id: SessionId, capacity: usize) -> (SessionLink, SessionPorts) {
    let (outbound_tx, outbound_rx) = mpsc::channel(capacity.max(1));
    let (close_tx, close_rx) = oneshot::channel();
    let cancel = CancellationToken::new();

    let link = SessionLink {
        id,
        outbound: outbound_tx,
        close: close_tx,
        cancel: cancel.clone(),
    };
    let ports = SessionPorts {
        outbound: outbound_rx,
        close: close_rx,
        cancel,
    };

    (link, ports)
}

/// Everything a session needs from the rest of the server
#[derive(Clone)]
pub struct SessionContext {
    pub hub: HubHandle,
    pub validator: Arc<dyn TokenValidator>,
    pub commands: Arc<dyn CommandSink>,
    pub outbound_capacity: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthState {
    Unauthenticated,
    Authenticated,
}

/// Register a new session with the hub and start both pumps.
///
/// `sink`/`stream` are the two halves of the upgraded transport.
pub fn spawn<S, R, E>(ctx: SessionContext, sink: S, stream: R) -> SessionId
where
    S: Sink<Message> + Send + Unpin + 'static,
    S::Error: Display,
    R: Stream<Item = Result<Message, E>> + Send + Unpin + 'static,
    E: Display + Send + 'static,
{
    let id = Uuid::new_v4();
    let (link, ports) = channel(id, ctx.outbound_capacity);

    ctx.hub.register(link);
    tracing::info!(session = %id, "New WebSocket connection");

    let cancel = ports.cancel.clone();
    tokio::spawn(outbound_pump(id, sink, ports));
    tokio::spawn(inbound_pump(id, stream, cancel, ctx));

    id
}

/// Sole writer of the transport
async fn outbound_pump<S>(id: SessionId, mut sink: S, ports: SessionPorts)
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let SessionPorts {
        mut outbound,
        mut close,
        cancel,
    } = ports;

    let frame = loop {
        tokio::select! {
            biased;

            reason = &mut close => break reason.ok().flatten().map(CloseReason::frame),

            next = outbound.recv() => match next {
                Some(text) => {
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        tracing::debug!(session = %id, "Write failed: {}", e);
                        cancel.cancel();
                        return;
                    }
                }
                None => break None,
            },
        }
    };

    if let Some(ref frame) = frame {
        tracing::debug!(session = %id, code = frame.code, "Closing session");
    }
    let _ = sink.send(Message::Close(frame)).await;
    let _ = sink.close().await;
    cancel.cancel();
}

/// Sole reader of the transport; runs the auth state machine
async fn inbound_pump<R, E>(id: SessionId, mut stream: R, cancel: CancellationToken, ctx: SessionContext)
where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let mut state = AuthState::Unauthenticated;

    let close = loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break None,
            msg = stream.next() => msg,
        };

        let command = match msg {
            Some(Ok(Message::Text(text))) => ClientCommand::decode(text.as_str().as_bytes()),
            Some(Ok(Message::Binary(bytes))) => ClientCommand::decode(&bytes),
            Some(Ok(Message::Close(_))) | None => {
                tracing::info!(session = %id, "Client disconnected");
                break None;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                tracing::debug!(session = %id, "Read failed: {}", e);
                break None;
            }
        };

        let Some(command) = command else {
            tracing::trace!(session = %id, "Ignoring unrecognized frame");
            continue;
        };

        match (state, command) {
            (_, ClientCommand::Auth { token }) => match authenticate(ctx.validator.as_ref(), &token) {
                Ok(subject) => {
                    if state == AuthState::Unauthenticated {
                        tracing::info!(session = %id, "Authenticated as {}", subject);
                    }
                    state = AuthState::Authenticated;
                    ctx.hub.authenticated(id, subject);
                }
                Err(e) => {
                    tracing::warn!(session = %id, "Authentication failed: {}", e);
                    break Some(CloseReason::AuthFailed);
                }
            },
            (AuthState::Unauthenticated, ClientCommand::Media(_)) => {
                tracing::trace!(session = %id, "Ignoring media command before auth");
            }
            (AuthState::Authenticated, ClientCommand::Media(command)) => {
                // A wedged player must not outlive the session
                tokio::select! {
                    _ = cancel.cancelled() => break None,
                    _ = media::dispatch(ctx.commands.as_ref(), command) => ctx.hub.refresh(),
                }
            }
        }
    };

    ctx.hub.unregister(id, close);
}

/// Accept only valid tokens minted for sessions
fn authenticate(validator: &dyn TokenValidator, token: &str) -> Result<String, AuthError> {
    let claims = validator.validate(token)?;

    if claims.purpose != TokenPurpose::Session {
        return Err(AuthError::WrongPurpose {
            expected: TokenPurpose::Session,
            got: claims.purpose,
        });
    }

    Ok(claims.sub)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
    use nex_core::{Claims, Event, MediaCommand};

    use crate::hub::{Hub, HubSettings};
    use crate::telemetry::TelemetrySource;
    use crate::testing::{FakeCommands, FakePlayer, FakeTelemetry, StuckCommands};

    struct FakeValidator;

    impl TokenValidator for FakeValidator {
        fn validate(&self, token: &str) -> Result<Claims, AuthError> {
            let purpose = match token {
                "session-token" => TokenPurpose::Session,
                "login-token" => TokenPurpose::Login,
                "expired-token" => return Err(AuthError::Expired),
                _ => return Err(AuthError::MalformedToken),
            };
            Ok(Claims {
                sub: "admin".to_string(),
                exp: u64::MAX,
                iat: 0,
                purpose,
            })
        }
    }

    struct Client {
        tx: UnboundedSender<Result<Message, std::io::Error>>,
        rx: UnboundedReceiver<Message>,
    }

    impl Client {
        fn send(&self, json: &str) {
            self.tx
                .unbounded_send(Ok(Message::Text(json.to_string().into())))
                .unwrap();
        }

        async fn next(&mut self) -> Option<Message> {
            self.rx.next().await
        }

        /// Drop anything already delivered
        fn drain(&mut self) {
            while let Ok(Some(_)) = self.rx.try_next() {}
        }
    }

    fn setup(tick: Duration) -> (HubHandle, Arc<FakeCommands>, Client) {
        let commands = Arc::new(FakeCommands::default());
        let (hub, client) = setup_with(tick, Arc::new(FakeTelemetry::default()), commands.clone());
        (hub, commands, client)
    }

    fn setup_with(
        tick: Duration,
        telemetry: Arc<dyn TelemetrySource>,
        commands: Arc<dyn CommandSink>,
    ) -> (HubHandle, Client) {
        let settings = HubSettings {
            tick_interval: tick,
            ..HubSettings::default()
        };
        let hub = Hub::spawn(telemetry, settings);
        let ctx = SessionContext {
            hub: hub.clone(),
            validator: Arc::new(FakeValidator),
            commands,
            outbound_capacity: 16,
        };

        let (client_tx, server_rx) = unbounded();
        let (server_tx, client_rx) = unbounded();
        spawn(ctx, server_tx, server_rx);

        (
            hub,
            Client {
                tx: client_tx,
                rx: client_rx,
            },
        )
    }

    fn expect_event(msg: Option<Message>) -> Event {
        match msg {
            Some(Message::Text(text)) => serde_json::from_str(text.as_str()).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    fn expect_close(msg: Option<Message>) -> u16 {
        match msg {
            Some(Message::Close(Some(frame))) => frame.code,
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    async fn wait_for_sessions(hub: &HubHandle, count: usize) {
        for _ in 0..100 {
            if hub.sessions().await.len() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("hub never reached {count} sessions");
    }

    #[tokio::test(start_paused = true)]
    async fn test_valid_auth_receives_stats() {
        let (hub, _, mut client) = setup(Duration::from_secs(1));

        client.send(r#"{"event":"auth","args":["session-token"]}"#);

        let event = expect_event(client.next().await);
        assert_eq!(event.event, "stats");
        assert_eq!(event.args.len(), 1);

        let sessions = hub.sessions().await;
        assert_eq!(sessions.len(), 1);
        assert!(sessions[0].authenticated);
        assert_eq!(sessions[0].subject.as_deref(), Some("admin"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_token_is_rejected_with_4001() {
        let (hub, _, mut client) = setup(Duration::from_secs(1));

        client.send(r#"{"event":"auth","args":["login-token"]}"#);

        assert_eq!(expect_close(client.next().await), 4001);
        assert!(client.next().await.is_none());
        wait_for_sessions(&hub, 0).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_and_malformed_tokens_are_rejected() {
        for token in ["expired-token", "garbage"] {
            let (_, _, mut client) = setup(Duration::from_secs(1));

            client.send(&format!(r#"{{"event":"auth","args":["{token}"]}}"#));

            assert_eq!(expect_close(client.next().await), 4001);
            assert!(client.next().await.is_none(), "no stats after close");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_frames_are_ignored() {
        let (_, _, mut client) = setup(Duration::from_secs(1));

        client.send("not json at all");
        client.send(r#"{"args":["session-token"]}"#);
        client.send(r#"{"event":"auth","args":["session-token"]}"#);

        assert_eq!(expect_event(client.next().await).event, "stats");
    }

    #[tokio::test(start_paused = true)]
    async fn test_media_before_auth_is_ignored() {
        let (hub, commands, client) = setup(Duration::from_secs(1));

        client.send(r#"{"event":"media","args":["play_pause"]}"#);
        tokio::time::sleep(Duration::from_millis(2500)).await;

        assert!(commands.recorded().await.is_empty());
        let sessions = hub.sessions().await;
        assert_eq!(sessions.len(), 1);
        assert!(!sessions[0].authenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_media_command_triggers_refresh() {
        // Natural ticks are an hour apart, so any stats frame is the refresh
        let (_hub, commands, mut client) = setup(Duration::from_secs(3600));

        client.send(r#"{"event":"auth","args":["session-token"]}"#);
        tokio::time::sleep(Duration::from_millis(50)).await;
        client.drain();

        let start = tokio::time::Instant::now();
        client.send(r#"{"event":"media","args":["play_pause"]}"#);

        assert_eq!(expect_event(client.next().await).event, "stats");
        assert!(start.elapsed() < Duration::from_secs(3600));
        assert_eq!(commands.recorded().await, vec![MediaCommand::PlayPause]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_carries_state_after_command() {
        let player = Arc::new(FakePlayer::new());
        let (_hub, mut client) = setup_with(Duration::from_secs(3600), player.clone(), player.clone());

        client.send(r#"{"event":"auth","args":["session-token"]}"#);
        tokio::time::sleep(Duration::from_millis(50)).await;
        client.drain();

        client.send(r#"{"event":"media","args":["play_pause"]}"#);

        let event = expect_event(client.next().await);
        assert_eq!(event.event, "stats");
        assert_eq!(event.args, vec![r#"{"playing":true}"#.to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_command_does_not_outlive_session() {
        let (hub, mut client) = setup_with(
            Duration::from_secs(3600),
            Arc::new(FakeTelemetry::default()),
            Arc::new(StuckCommands),
        );

        client.send(r#"{"event":"auth","args":["session-token"]}"#);
        client.send(r#"{"event":"media","args":["next"]}"#);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let id = hub.sessions().await[0].id;
        hub.unregister(id, None);

        for _ in 0..100 {
            if client.tx.is_closed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(client.tx.is_closed(), "inbound pump still reading");
        client.drain();
        wait_for_sessions(&hub, 0).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_position_is_dropped() {
        let (_hub, commands, mut client) = setup(Duration::from_secs(3600));

        client.send(r#"{"event":"auth","args":["session-token"]}"#);
        client.send(r#"{"event":"media","args":["set_position","soon"]}"#);
        client.send(r#"{"event":"media","args":["set_position","42000"]}"#);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(commands.recorded().await, vec![MediaCommand::SetPosition(42000)]);
        client.drain();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reauth_keeps_session() {
        let (hub, _, mut client) = setup(Duration::from_secs(1));

        client.send(r#"{"event":"auth","args":["session-token"]}"#);
        client.send(r#"{"event":"auth","args":["session-token"]}"#);

        assert_eq!(expect_event(client.next().await).event, "stats");
        assert_eq!(hub.sessions().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_close_unregisters() {
        let (hub, _, mut client) = setup(Duration::from_secs(1));
        wait_for_sessions(&hub, 1).await;

        client.tx.close_channel();

        wait_for_sessions(&hub, 0).await;
        assert!(matches!(client.next().await, Some(Message::Close(None))));
    }
}
