//! nex-server: host agent daemon
//!
//! - Issues login and session tokens over HTTP
//! - Streams host telemetry to authenticated WebSocket sessions
//! - Forwards media commands to the desktop's players

use std::net::SocketAddr;
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use nex_core::{Config, JwtAuth};
use nex_server::hub::{Hub, HubSettings};
use nex_server::media::{DesktopUser, PlayerctlController};
use nex_server::state::AppState;
use nex_server::telemetry::SystemTelemetry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration, writing defaults on first run
    let config = Config::load_or_init()?;

    // Initialize tracing
    let default_filter = if config.debug {
        "nex_server=debug,tower_http=debug"
    } else {
        "nex_server=info,tower_http=info"
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Initialize JWT auth
    let jwt_secret = match config.server.secret_bytes()? {
        Some(secret) => secret,
        None => {
            tracing::info!("Generated random JWT secret (will change on restart)");
            nex_core::auth::generate_secret().to_vec()
        }
    };
    let jwt_auth = JwtAuth::new(
        &jwt_secret,
        Some(config.session.login_ttl_secs),
        Some(config.session.session_ttl_secs),
    );

    if config.user.password_hash.is_none() {
        tracing::warn!("No password hash configured, logins will be refused");
    }

    // Media control runs in the desktop user's session
    let user = DesktopUser::detect();
    tracing::info!("Controlling media as {} (uid {})", user.name, user.uid);
    let media = Arc::new(PlayerctlController::new(
        user,
        config.telemetry.art_route_prefix.clone(),
    ));

    // Start telemetry collector and hub
    let telemetry = SystemTelemetry::spawn(
        std::time::Duration::from_millis(config.telemetry.refresh_interval_ms),
        media.clone(),
    );
    let hub = Hub::spawn(Arc::new(telemetry), HubSettings::from(&config.session));

    let addr = SocketAddr::from((
        config.server.listen_addr.parse::<std::net::IpAddr>()?,
        config.server.port,
    ));

    let state = AppState::new(jwt_auth, hub, media, config);
    let app = nex_server::app(state);

    // Start server
    tracing::info!("nex-server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}
