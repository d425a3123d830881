// Ferry hub daemon: accept peers, route chat, mediate file transfers.

mod config;
mod hub;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::info;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_help() {
    println!("ferry-server {} — chat and file-transfer hub", VERSION);
    println!();
    println!("USAGE:");
    println!("    ferry-server [PORT]");
    println!();
    println!("ARGS:");
    println!("    PORT             Listen port (default: 8888)");
    println!();
    println!("OPTIONS:");
    println!("    -h, --help       Print this help message and exit");
    println!("    -V, --version    Print version and exit");
    println!();
    println!("DESCRIPTION:");
    println!("    Accepts peer connections over TCP, assigns each an 8-hex-char id,");
    println!("    relays chat (broadcast or directed) and forwards file transfers");
    println!("    chunk by chunk once the recipient accepts them.");
    println!();
    println!("    Stop with Ctrl+C or SIGTERM.");
    println!();
    println!("CONFIGURATION:");
    println!("    Config file (optional, first found wins):");
    println!("      ~/.config/ferry/server.toml");
    println!("      /etc/ferry/server.toml");
    println!();
    println!("    Example server.toml:");
    println!("      port = 8888");
    println!("      max_file_mb = 100");
    println!("      transfer_idle_secs = 300");
    println!();
    println!("ENVIRONMENT VARIABLES (override config file):");
    println!("    FERRY_PORT                  Listen port");
    println!("    FERRY_MAX_FILE_MB           Per-file size cap in MiB");
    println!("    FERRY_TRANSFER_IDLE_SECS    Idle seconds before a transfer is swept");
    println!("    FERRY_SWEEP_INTERVAL_SECS   Seconds between sweep runs");
}

fn main() -> anyhow::Result<()> {
    let mut port_arg: Option<u16> = None;
    if let Some(arg) = std::env::args().nth(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("ferry-server {}", VERSION);
                return Ok(());
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            other => match other.parse::<u16>() {
                Ok(p) => port_arg = Some(p),
                Err(_) => {
                    eprintln!("ferry-server: invalid port '{}'\n", other);
                    print_help();
                    std::process::exit(1);
                }
            },
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = config::load();
    let port = port_arg.unwrap_or(cfg.port);
    let opts = hub::HubOptions::from(&cfg);

    let rt = tokio::runtime::Runtime::new().context("failed to start runtime")?;
    rt.block_on(async {
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("failed to bind port {port}"))?;

        let shutdown = CancellationToken::new();
        let hub = hub::Hub::new(opts, shutdown.clone());
        let mut serve = tokio::spawn(hub.serve(listener));

        tokio::select! {
            res = &mut serve => {
                res.context("hub task failed")?.context("hub error")?;
                return Ok(());
            }
            res = shutdown_signal() => {
                res?;
                info!("shutdown signal received");
            }
        }
        shutdown.cancel();
        serve.await.context("hub task failed")?.context("hub error")?;
        Ok(())
    })
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.context("failed to wait for Ctrl+C")?;
    }
    Ok(())
}
