//! Host telemetry for the stats broadcast
//!
//! A background collector refreshes a [`SystemStats`] snapshot on its own
//! interval and publishes the serialized form through a watch channel. The
//! hub reads the latest value once per tick without blocking.
//!
//! After a media command the cached value is stale, so the collector also
//! takes on-demand requests. A request is answered by a round that starts
//! after the request arrived.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sysinfo::{Disks, Networks, System};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, MissedTickBehavior};

use nex_core::stats::NetworkStats;
use nex_core::SystemStats;

use crate::host;
use crate::media::PlayerctlController;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("No snapshot collected yet")]
    NotReady,

    #[error("Failed to serialize snapshot: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Telemetry collector stopped")]
    Stopped,
}

/// Produces serialized host snapshots
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    /// Latest snapshot, without waiting
    fn snapshot(&self) -> Result<String, TelemetryError>;

    /// A snapshot collected after this call was made
    async fn collect_now(&self) -> Result<String, TelemetryError>;
}

type Reply = oneshot::Sender<Result<String, TelemetryError>>;

/// Snapshot cache fed by a background collector
pub struct SystemTelemetry {
    latest: watch::Receiver<Option<String>>,
    requests: mpsc::UnboundedSender<Reply>,
}

impl SystemTelemetry {
    /// Start collecting every `refresh`
    pub fn spawn(refresh: Duration, media: Arc<PlayerctlController>) -> Self {
        let mut collector = Collector::new(media);
        Self::spawn_with(refresh, move || collector.collect_json())
    }

    fn spawn_with<F>(refresh: Duration, collect: F) -> Self
    where
        F: FnMut() -> Result<String, TelemetryError> + Send + 'static,
    {
        let (tx, rx) = watch::channel(None);
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        tokio::spawn(collect_loop(tx, req_rx, refresh, collect));
        Self {
            latest: rx,
            requests: req_tx,
        }
    }
}

#[async_trait]
impl TelemetrySource for SystemTelemetry {
    fn snapshot(&self) -> Result<String, TelemetryError> {
        self.latest.borrow().clone().ok_or(TelemetryError::NotReady)
    }

    async fn collect_now(&self) -> Result<String, TelemetryError> {
        let (reply, rx) = oneshot::channel();
        self.requests.send(reply).map_err(|_| TelemetryError::Stopped)?;
        rx.await.map_err(|_| TelemetryError::Stopped)?
    }
}

/// Main collection loop. Runs one round per tick, plus one per batch of
/// on-demand requests.
async fn collect_loop<F>(
    tx: watch::Sender<Option<String>>,
    mut requests: mpsc::UnboundedReceiver<Reply>,
    refresh: Duration,
    mut collect: F,
) where
    F: FnMut() -> Result<String, TelemetryError> + Send + 'static,
{
    let mut ticker = interval(refresh);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let mut waiting = Vec::new();
        tokio::select! {
            _ = ticker.tick() => {}
            request = requests.recv() => match request {
                Some(reply) => waiting.push(reply),
                // SystemTelemetry is gone
                None => return,
            },
        }
        while let Ok(reply) = requests.try_recv() {
            waiting.push(reply);
        }

        let result = tokio::task::spawn_blocking(move || {
            let json = collect();
            (collect, json)
        })
        .await;

        let json = match result {
            Ok((back, json)) => {
                collect = back;
                json
            }
            Err(e) => {
                tracing::error!("Telemetry collector died: {}", e);
                return;
            }
        };

        match json {
            Ok(json) => {
                for reply in waiting {
                    let _ = reply.send(Ok(json.clone()));
                }
                tx.send_replace(Some(json));
            }
            Err(e) => {
                tracing::warn!("{}", e);
                for reply in waiting {
                    let _ = reply.send(Err(TelemetryError::NotReady));
                }
            }
        }
    }
}

struct Collector {
    sys: System,
    media: Arc<PlayerctlController>,
}

impl Collector {
    fn new(media: Arc<PlayerctlController>) -> Self {
        Self {
            sys: System::new_all(),
            media,
        }
    }

    fn collect_json(&mut self) -> Result<String, TelemetryError> {
        let stats = self.collect();

        tracing::trace!(
            "Telemetry: CPU {:.1}%, RAM {}/{}MB, {} players",
            stats.cpu_absolute,
            stats.memory_bytes / 1024 / 1024,
            stats.memory_limit_bytes / 1024 / 1024,
            stats.audio.len()
        );

        Ok(serde_json::to_string(&stats)?)
    }

    fn collect(&mut self) -> SystemStats {
        self.sys.refresh_cpu_usage();
        self.sys.refresh_memory();

        let networks = Networks::new_with_refreshed_list();
        let network = networks
            .list()
            .iter()
            .filter(|(name, _)| name.as_str() != "lo")
            .fold(NetworkStats::default(), |acc, (_, data)| NetworkStats {
                rx_bytes: acc.rx_bytes + data.total_received(),
                tx_bytes: acc.tx_bytes + data.total_transmitted(),
            });

        let disks = Disks::new_with_refreshed_list();
        let (disk_bytes, disk_total) = disks
            .list()
            .iter()
            .find(|disk| disk.mount_point() == Path::new("/"))
            .map(|disk| {
                let total = disk.total_space();
                (total.saturating_sub(disk.available_space()), total)
            })
            .unwrap_or((0, 0));

        SystemStats {
            memory_bytes: self.sys.used_memory(),
            memory_limit_bytes: self.sys.total_memory(),
            swap_bytes: self.sys.used_swap(),
            swap_limit_bytes: self.sys.total_swap(),
            cpu_absolute: f64::from(self.sys.global_cpu_usage()),
            cpu_temp: host::cpu_temp(),
            network,
            uptime: System::uptime(),
            state: "running".to_string(),
            disk_bytes,
            disk_total,
            audio: self.media.audio_states(),
            wifi: host::wifi_state(),
            ip: host::local_ip(),
            battery: host::battery_state(),
            volume: host::volume(self.media.user()),
            backlight: host::backlight(),
        }
    }
}
