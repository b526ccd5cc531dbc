use anyhow::{Context, Result};
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use tftp_engine::{Client, Direction, RetryPolicy};

/// Read a file from, or write a file to, a TFTP server.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Address of the server.
    server_ip: IpAddr,

    /// Port the server listens on.
    server_port: u16,

    /// Name of the file on the server. Also used as the local name unless --local is given.
    filename: String,

    /// `r` to read the file from the server, `w` to write it to the server.
    mode: Direction,

    /// Local file to write to (r) or read from (w).
    #[arg(long)]
    local: Option<PathBuf>,

    /// Milliseconds to wait for each reply before retransmitting.
    #[arg(long, default_value_t = 1000)]
    timeout_ms: u64,

    /// Retransmissions allowed per packet before giving up.
    #[arg(long, default_value_t = 5)]
    retries: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let server = SocketAddr::new(cli.server_ip, cli.server_port);
    let local = cli.local.unwrap_or_else(|| PathBuf::from(&cli.filename));
    let timeout = Duration::from_millis(cli.timeout_ms);
    let policy = RetryPolicy::default()
        .with_timeout(timeout)
        .with_max_retries(cli.retries)
        .with_linger(timeout);

    let summary = Client::new(server)
        .with_policy(policy)
        .transfer(cli.mode, &cli.filename, &local)
        .await
        .with_context(|| {
            let verb = match cli.mode {
                Direction::Read => "reading",
                Direction::Write => "writing",
            };
            format!("{} '{}' on {} failed", verb, cli.filename, server)
        })?;

    println!(
        "Transferred {} bytes in {} blocks ({} retransmits)",
        summary.bytes, summary.blocks, summary.retransmits
    );
    Ok(())
}
