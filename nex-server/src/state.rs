//! Shared server state

use std::sync::Arc;

use nex_core::{Config, JwtAuth};

use crate::hub::HubHandle;
use crate::media::CommandSink;
use crate::session::SessionContext;

/// Shared application state, cloned into every handler
#[derive(Clone)]
pub struct AppState {
    /// Token issuer and validator
    pub auth: Arc<JwtAuth>,

    pub hub: HubHandle,

    /// Where session media commands go
    pub commands: Arc<dyn CommandSink>,

    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(auth: JwtAuth, hub: HubHandle, commands: Arc<dyn CommandSink>, config: Config) -> Self {
        Self {
            auth: Arc::new(auth),
            hub,
            commands,
            config: Arc::new(config),
        }
    }

    /// What a freshly upgraded session is wired to
    pub fn session_context(&self) -> SessionContext {
        SessionContext {
            hub: self.hub.clone(),
            validator: self.auth.clone(),
            commands: self.commands.clone(),
            outbound_capacity: self.config.session.outbound_capacity,
        }
    }
}
