use std::collections::HashSet;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::Backend;
use crate::constants::{
    desired_session_settings, session_setting_keys, REQUIRED_ENGINE_VERSION, REQUIRED_PLUGIN,
};
use crate::error::{Error, Result};
use crate::rpc::{DaemonClient, SessionSettings};

/// What the daemon reports about itself.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub version: String,
    pub plugins: HashSet<String>,
    /// Tuned session settings; only read once the cache plugin is enabled.
    pub settings: Option<SessionSettings>,
}

impl ServerInfo {
    async fn fetch(client: &dyn DaemonClient) -> Result<Self> {
        let version = client.get_engine_version().await?;
        let plugins: HashSet<String> = client.get_enabled_plugins().await?.into_iter().collect();
        let settings = if plugins.contains(REQUIRED_PLUGIN) {
            Some(client.get_session_settings(&session_setting_keys()).await?)
        } else {
            None
        };
        Ok(Self {
            version,
            plugins,
            settings,
        })
    }

    /// Fails unless the daemon can honor the piece and cache contracts.
    pub fn check(&self) -> Result<()> {
        if self.version != REQUIRED_ENGINE_VERSION {
            return Err(Error::Unsupported(format!(
                "engine version {} (need {})",
                self.version, REQUIRED_ENGINE_VERSION
            )));
        }
        if !self.plugins.contains(REQUIRED_PLUGIN) {
            return Err(Error::Unsupported(format!(
                "plugin {} is not enabled",
                REQUIRED_PLUGIN
            )));
        }
        Ok(())
    }

    /// Desired settings whose current value differs.
    pub fn drifted(&self) -> SessionSettings {
        let Some(current) = &self.settings else {
            return SessionSettings::new();
        };
        desired_session_settings()
            .into_iter()
            .filter(|(key, value)| current.get(*key) != Some(value))
            .map(|(key, value)| (key.to_string(), value))
            .collect()
    }
}

impl Backend {
    fn fetch_server_info(&self) -> BoxFuture<'static, Result<Arc<ServerInfo>>> {
        let client = Arc::clone(&self.client);
        async move { Ok(Arc::new(ServerInfo::fetch(client.as_ref()).await?)) }.boxed()
    }

    pub async fn server_info(&self) -> Result<Arc<ServerInfo>> {
        self.server_info.get(|| self.fetch_server_info()).await
    }

    /// Starts a fresh capability fetch and waits for it.
    pub async fn refresh_server_info(&self) -> Result<Arc<ServerInfo>> {
        self.server_info.refresh(|| self.fetch_server_info()).await
    }

    pub async fn validate(&self) -> Result<()> {
        self.server_info().await?.check()
    }

    /// Pushes session settings back to their tuned values in the background.
    pub fn prioritize(self: &Arc<Self>) -> JoinHandle<Result<()>> {
        let mut state = self.state.lock();
        if let Some(previous) = state.prioritize_task.take() {
            previous.abort();
        }

        let this = Arc::clone(self);
        let task = tokio::spawn(async move {
            let result = this.prioritize_once().await;
            if let Err(e) = &result {
                warn!("Updating session settings failed: {}", e);
            }
            result
        });
        state.prioritize_task = Some(task.abort_handle());
        task
    }

    pub async fn prioritize_once(&self) -> Result<()> {
        let server = self.server_info().await?;
        if server.settings.is_none() {
            debug!("Session settings not read; {} is not enabled", REQUIRED_PLUGIN);
            return Ok(());
        }

        let drifted = server.drifted();
        if drifted.is_empty() {
            return Ok(());
        }
        info!(
            "Updating session settings: {:?}",
            drifted.keys().collect::<Vec<_>>()
        );
        self.client.set_session_settings(drifted).await?;
        self.server_info.invalidate();
        Ok(())
    }
}
