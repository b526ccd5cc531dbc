use anyhow::{Context, Result};
use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use tftp_engine::server::DEFAULT_PORT;
use tftp_engine::{RetryPolicy, Server, ServerConfig};

/// Serve files over TFTP from the working directory.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Address to listen on.
    server_ip: IpAddr,

    /// Port to listen on for requests.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Directory filenames are resolved against. Paths are not confined to it.
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Milliseconds to wait for each reply before retransmitting.
    #[arg(long, default_value_t = 1000)]
    timeout_ms: u64,

    /// Retransmissions allowed per packet before a transfer is abandoned.
    #[arg(long, default_value_t = 5)]
    retries: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let timeout = Duration::from_millis(cli.timeout_ms);
    let config = ServerConfig::new(cli.server_ip)
        .with_port(cli.port)
        .with_root(cli.root)
        .with_policy(
            RetryPolicy::default()
                .with_timeout(timeout)
                .with_max_retries(cli.retries)
                .with_linger(timeout),
        );

    let server = Server::bind(config)
        .with_context(|| format!("Failed to start server on {}:{}", cli.server_ip, cli.port))?;
    server.serve().await;
    Ok(())
}
