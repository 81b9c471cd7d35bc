use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tokio::sync::oneshot;
use tracing::{info, warn};

use via::conf::CredentialConfig;
use via::creds::TransportSecurity;
use via::ViaListener;

/// Transparent RPC proxy relaying streaming calls between cooperating
/// parties.
#[derive(Debug, Parser)]
#[command(name = "via", version)]
struct Args {
    /// Listen endpoint for the signup and forwarding services.
    #[arg(long, default_value = ":10031")]
    address: String,

    /// Path to the YAML credential config; omit to run insecure.
    #[arg(long, visible_alias = "tls")]
    ssl: Option<PathBuf>,
}

/// How long active calls get to finish after an interrupt.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let security = match &args.ssl {
        Some(path) => {
            let config = CredentialConfig::load(path)?;
            TransportSecurity::from_config(&config)?
        }
        None => TransportSecurity::insecure(),
    };

    let listener = ViaListener::bind(&args.address, security)
        .await
        .with_context(|| format!("failed to listen on {}", args.address))?;

    let (stop_tx, stop_rx) = oneshot::channel();
    let mut server = tokio::spawn(listener.serve_with_shutdown(async {
        let _ = stop_rx.await;
    }));

    tokio::select! {
        result = &mut server => result??,
        _ = interrupt() => {
            info!("interrupt received; draining active calls");
            let _ = stop_tx.send(());
            match tokio::time::timeout(SHUTDOWN_GRACE, server).await {
                Ok(result) => result??,
                Err(_) => warn!("calls still active after {SHUTDOWN_GRACE:?}; exiting anyway"),
            }
        }
    }

    info!("Shutting down VIA server.");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn interrupt() {
    let ctrl_c = signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
