use anyhow::Context as _;
use axum::Router;
use chatflow_domain::{EngineSettings, WorkflowLayout};
use std::net::SocketAddr;
use std::path::PathBuf;

pub mod backend;
pub mod catalog;
mod configurator;
pub mod engine;
pub mod mode_store;
pub mod server;

pub const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:5000";

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub backend_url: String,
    /// Where the workflow/relay toggles are kept. `None` keeps them in memory.
    pub state_path: Option<PathBuf>,
    pub settings: EngineSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            backend_url: DEFAULT_BACKEND_URL.to_owned(),
            state_path: None,
            settings: EngineSettings::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let mut out = Self::default();

        if let Some(url) = env_value("CHATFLOW_BACKEND_URL") {
            out.backend_url = url;
        }

        out.state_path = env_value("CHATFLOW_STATE_PATH").map(PathBuf::from);

        if let Some(layout) = env_value("CHATFLOW_WORKFLOW_LAYOUT") {
            match WorkflowLayout::parse(&layout) {
                Some(layout) => out.settings.layout = layout,
                None => tracing::warn!(value = %layout, "unknown CHATFLOW_WORKFLOW_LAYOUT, using tabs"),
            }
        }

        if let Some(ack) = env_value("CHATFLOW_SURFACE_ACK") {
            out.settings.require_surface_ack = !matches!(
                ack.to_ascii_lowercase().as_str(),
                "0" | "false" | "no" | "off"
            );
        }

        out
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
}

pub struct StartedServer {
    pub addr: SocketAddr,
    handle: Option<tokio::task::JoinHandle<anyhow::Result<()>>>,
}

impl StartedServer {
    pub async fn wait(self) -> anyhow::Result<()> {
        let mut this = self;
        let handle = this.handle.take().context("server task already consumed")?;

        handle
            .await
            .context("server task panicked")?
            .context("server failed")?;
        Ok(())
    }
}

impl Drop for StartedServer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

pub async fn start_server(addr: SocketAddr) -> anyhow::Result<StartedServer> {
    start_server_with_config(addr, ServerConfig::from_env()).await
}

pub async fn start_server_with_config(
    addr: SocketAddr,
    config: ServerConfig,
) -> anyhow::Result<StartedServer> {
    let app = server::router(config).await?;
    serve(addr, app).await
}

/// Serves an already assembled router, e.g. one built around a custom backend.
pub async fn serve(addr: SocketAddr, app: Router) -> anyhow::Result<StartedServer> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    let actual = listener.local_addr().context("failed to read local addr")?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.context("server failed")?;
        Ok(())
    });

    Ok(StartedServer {
        addr: actual,
        handle: Some(handle),
    })
}
