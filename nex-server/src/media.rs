//! Media player control via playerctl
//!
//! The hub only needs fire-and-forget commands ([`CommandSink`]). The
//! telemetry collector additionally reads per-player status from the same
//! controller.
//!
//! When the agent runs as root, players live in the desktop user's session,
//! so commands are wrapped in `runuser` with that user's runtime dir.

use std::process::{Command, Stdio};

use async_trait::async_trait;
use base64::Engine;

use nex_core::stats::AudioState;
use nex_core::MediaCommand;

/// Imperative player controls. Failures are logged, never returned.
#[async_trait]
pub trait CommandSink: Send + Sync {
    async fn play_pause(&self);
    async fn next(&self);
    async fn previous(&self);
    /// Absolute position in milliseconds
    async fn set_position(&self, offset_ms: i64);
}

/// Route a parsed client command to the sink
pub async fn dispatch(sink: &dyn CommandSink, command: MediaCommand) {
    tracing::debug!("Media command: {:?}", command);
    match command {
        MediaCommand::PlayPause => sink.play_pause().await,
        MediaCommand::Next => sink.next().await,
        MediaCommand::Previous => sink.previous().await,
        MediaCommand::SetPosition(offset) => sink.set_position(offset).await,
    }
}

/// The user owning the graphical session
#[derive(Debug, Clone)]
pub struct DesktopUser {
    pub uid: u32,
    pub name: String,
    /// Commands must be re-targeted from root into the user's session
    impersonate: bool,
}

impl DesktopUser {
    /// Work out whose session to talk to.
    ///
    /// `SUDO_UID`, then `PKEXEC_UID`, then our own uid. As plain root, the
    /// first `/run/user/<uid>` with uid >= 1000 wins, else 1000.
    pub fn detect() -> Self {
        // SAFETY: geteuid has no preconditions and cannot fail
        let euid = unsafe { libc::geteuid() };

        let uid = ["SUDO_UID", "PKEXEC_UID"]
            .iter()
            .find_map(|var| std::env::var(var).ok()?.parse().ok())
            .unwrap_or_else(|| if euid == 0 { first_runtime_uid() } else { euid });

        let name = std::fs::read_to_string("/etc/passwd")
            .ok()
            .and_then(|passwd| username_for_uid(&passwd, uid))
            .unwrap_or_else(|| format!("#{uid}"));

        Self {
            uid,
            name,
            impersonate: euid == 0 && uid != 0,
        }
    }

    /// Build a command for `program` that runs inside the user's session
    pub fn command(&self, program: &str) -> Command {
        let mut cmd = if self.impersonate {
            let mut cmd = Command::new("runuser");
            cmd.args(["-u", &self.name, "--", "env"])
                .arg(format!("XDG_RUNTIME_DIR=/run/user/{}", self.uid))
                .arg(program);
            cmd
        } else {
            Command::new(program)
        };
        cmd.stdin(Stdio::null()).stderr(Stdio::null());
        cmd
    }
}

fn first_runtime_uid() -> u32 {
    std::fs::read_dir("/run/user")
        .ok()
        .and_then(|entries| {
            entries
                .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse::<u32>().ok())
                .filter(|uid| *uid >= 1000)
                .min()
        })
        .unwrap_or(1000)
}

fn username_for_uid(passwd: &str, uid: u32) -> Option<String> {
    let uid = uid.to_string();
    passwd.lines().find_map(|line| {
        let mut fields = line.split(':');
        let name = fields.next()?;
        let _password = fields.next()?;
        (fields.next()? == uid).then(|| name.to_string())
    })
}

/// Run a blocking command, returning trimmed stdout on success
pub(crate) fn capture(mut cmd: Command) -> Option<String> {
    let output = cmd.output().ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// playerctl-backed controller
pub struct PlayerctlController {
    user: DesktopUser,
    art_route_prefix: String,
}

impl PlayerctlController {
    pub fn new(user: DesktopUser, art_route_prefix: impl Into<String>) -> Self {
        Self {
            user,
            art_route_prefix: art_route_prefix.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn user(&self) -> &DesktopUser {
        &self.user
    }

    fn playerctl(&self, args: &[&str]) -> Command {
        let mut cmd = self.user.command("playerctl");
        cmd.args(args);
        cmd
    }

    async fn run(&self, args: &[&str]) -> Option<String> {
        let mut cmd = tokio::process::Command::from(self.playerctl(args));
        cmd.kill_on_drop(true);

        match cmd.output().await {
            Ok(output) if output.status.success() => {
                Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
            }
            Ok(output) => {
                tracing::debug!("playerctl {:?} exited with {}", args, output.status);
                None
            }
            Err(e) => {
                tracing::debug!("Failed to run playerctl: {}", e);
                None
            }
        }
    }

    /// The player commands should go to
    async fn target_player(&self) -> Option<String> {
        let list = self.run(&["-l"]).await?;

        let mut best: Option<(i32, String)> = None;
        for player in list.lines().map(str::trim).filter(|p| !p.is_empty()) {
            let playing = self.run(&["-p", player, "status"]).await.as_deref() == Some("Playing");
            let score = player_score(player, playing);
            if best.as_ref().is_none_or(|(top, _)| score > *top) {
                best = Some((score, player.to_string()));
            }
        }

        best.map(|(_, player)| player)
    }

    async fn control(&self, action: &[&str]) {
        let Some(player) = self.target_player().await else {
            tracing::debug!("No media player to control");
            return;
        };

        let mut args = vec!["-p", player.as_str()];
        args.extend_from_slice(action);
        self.run(&args).await;
    }

    /// Status of every player with a current track. Blocking.
    pub fn audio_states(&self) -> Vec<AudioState> {
        let Some(list) = capture(self.playerctl(&["-l"])) else {
            return Vec::new();
        };

        let mut states = Vec::new();
        for player in list.lines().map(str::trim).filter(|p| !p.is_empty()) {
            let mut state = self.player_info(player);
            if state.title.is_empty() {
                continue;
            }
            state.id = format!("player{}", states.len() + 1);
            state.name = display_name(player);
            state.art_url = rewrite_art_url(&state.art_url, &self.art_route_prefix);
            states.push(state);
        }
        states
    }

    fn player_info(&self, player: &str) -> AudioState {
        let query = |args: &[&'static str]| self.query(player, args);

        let position = query(&["position"]).parse::<f64>().unwrap_or(0.0);
        let length_us = query(&["metadata", "mpris:length"]).parse::<i64>().unwrap_or(0);

        AudioState {
            playing: query(&["status"]) == "Playing",
            title: query(&["metadata", "title"]),
            artist: query(&["metadata", "artist"]),
            album: query(&["metadata", "album"]),
            art_url: query(&["metadata", "mpris:artUrl"]),
            timestamp: position as i64,
            duration: length_us / 1_000_000,
            ..Default::default()
        }
    }

    fn query(&self, player: &str, args: &[&str]) -> String {
        let mut full = vec!["-p", player];
        full.extend_from_slice(args);
        capture(self.playerctl(&full)).unwrap_or_default()
    }
}

#[async_trait]
impl CommandSink for PlayerctlController {
    async fn play_pause(&self) {
        self.control(&["play-pause"]).await;
    }

    async fn next(&self) {
        self.control(&["next"]).await;
    }

    async fn previous(&self) {
        self.control(&["previous"]).await;
    }

    async fn set_position(&self, offset_ms: i64) {
        let position = format_position(offset_ms);
        self.control(&["position", position.as_str()]).await;
    }
}

/// Prefer YouTube Music, then whatever is playing
fn player_score(player: &str, playing: bool) -> i32 {
    let mut score = 0;
    if player.contains("youtube_music") {
        score += 100;
    }
    if playing {
        score += 50;
    }
    score
}

fn display_name(player: &str) -> String {
    let lower = player.to_lowercase();
    let name = if player.contains("youtube_music") {
        "Youtube Music"
    } else if lower.contains("firefox") {
        "Firefox"
    } else if lower.contains("spotify") {
        "Spotify"
    } else if lower.contains("chrome") || lower.contains("chromium") {
        "Chrome"
    } else if lower.contains("vlc") {
        "VLC"
    } else {
        return player.to_string();
    };
    name.to_string()
}

/// Local art files are served back through the image route
fn rewrite_art_url(url: &str, prefix: &str) -> String {
    match url.strip_prefix("file://") {
        Some(path) => format!(
            "{}/{}",
            prefix,
            base64::engine::general_purpose::URL_SAFE.encode(path)
        ),
        None => url.to_string(),
    }
}

/// Milliseconds to playerctl's seconds argument. Negative offsets clamp to 0.
fn format_position(offset_ms: i64) -> String {
    let ms = offset_ms.max(0);
    format!("{}.{:03}", ms / 1000, ms % 1000)
}
