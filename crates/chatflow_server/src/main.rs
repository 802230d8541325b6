use anyhow::Context as _;
use std::net::SocketAddr;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let addr: SocketAddr = std::env::var("CHATFLOW_SERVER_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:8431".to_owned())
        .parse()
        .context("invalid CHATFLOW_SERVER_ADDR")?;

    let server = chatflow_server::start_server(addr).await?;
    tracing::info!(addr = %server.addr, "chatflow_server listening");
    server.wait().await?;
    Ok(())
}
