use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use messenger_server::{ChatServer, ServerConfig, ServerError, shutdown_signal};

/// TCP messenger server
#[derive(Parser)]
#[command(name = "messenger-server", version)]
struct Args {
    /// Address to listen on
    #[arg(long, env = "MESSENGER_HOST", default_value = "0.0.0.0")]
    host: IpAddr,

    /// Port to listen on
    #[arg(short, long, env = "MESSENGER_PORT", default_value_t = 8080)]
    port: u16,

    /// Directory for the shadow file and chat markers
    #[arg(long, env = "MESSENGER_DATA_DIR", default_value = "server_data")]
    data_dir: PathBuf,

    /// Failed logins before a connection is closed (0 disables the limit)
    #[arg(long, env = "MESSENGER_MAX_LOGIN_ATTEMPTS", default_value_t = 3)]
    max_login_attempts: u32,

    /// Messages queued for the processor before readers wait
    #[arg(long, env = "MESSENGER_INBOUND_CAPACITY", default_value_t = 256)]
    inbound_capacity: usize,

    /// Replies queued per client before they are dropped
    #[arg(long, env = "MESSENGER_OUTBOUND_CAPACITY", default_value_t = 64)]
    outbound_capacity: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = ServerConfig::default()
        .with_listen_addr(SocketAddr::new(args.host, args.port))
        .with_data_dir(args.data_dir)
        .with_max_login_attempts(args.max_login_attempts)
        .with_inbound_capacity(args.inbound_capacity)
        .with_outbound_capacity(args.outbound_capacity);

    let server = ChatServer::bind(config)
        .await
        .context("failed to start server")?;

    match server.run(shutdown_signal()).await {
        Ok(()) => Ok(()),
        Err(ServerError::Save(e)) => {
            // Exit normally anyway; the log is the only trace of the loss.
            tracing::error!(error = %e, "credentials were not persisted, recent registrations may be lost");
            Ok(())
        }
        Err(e) => Err(e).context("server failed"),
    }
}
