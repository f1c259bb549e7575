//! Minimal worker: binds to the master with the code it was launched with,
//! relays its stdin to the master line by line and prints whatever the
//! master sends back. Exits when stdin ends or the master closes.

use std::io;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use jobctl_common::JobCode;
use jobd_client::WorkerClient;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(name = "job-worker", version)]
#[command(about = "Connect to a jobd master and relay stdin to it")]
struct Cli {
    /// Comma-separated master addresses
    addresses: String,

    /// Master control port
    port: u16,

    /// Job code issued by the master
    code: String,

    /// Threads this copy may use
    #[arg(default_value_t = 1)]
    threads: u32,

    /// Seconds to wait for each connect and handshake step
    #[arg(long, default_value_t = 10)]
    timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    info!(
        "{}",
        jobctl_build_info::formatted_banner("job-worker", env!("CARGO_PKG_VERSION"))
    );

    let code: JobCode = cli.code.parse().context("invalid job code argument")?;
    let client = WorkerClient::connect(
        &cli.addresses,
        cli.port,
        code,
        Duration::from_secs(cli.timeout),
    )
    .await
    .with_context(|| format!("failed to bind to master on port {}", cli.port))?;
    info!(master = %client.master(), threads = cli.threads, "Worker ready");

    let (reader, mut writer) = client.into_stream().into_split();
    let mut from_master = reader;
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let mut buf = vec![0u8; 8192];

    writer
        .write_all(format!("worker {} ready ({} threads)\n", code, cli.threads).as_bytes())
        .await?;

    loop {
        tokio::select! {
            line = stdin.next_line() => match line? {
                Some(line) => {
                    writer.write_all(line.as_bytes()).await?;
                    writer.write_all(b"\n").await?;
                }
                None => {
                    debug!("stdin closed; ending session");
                    writer.shutdown().await?;
                    break;
                }
            },
            read = from_master.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    info!("Master closed the session");
                    break;
                }
                stdout.write_all(&buf[..n]).await?;
                stdout.flush().await?;
            }
        }
    }

    Ok(())
}
