//! ssh-tunnel
//!
//! Forwards a local TCP port to a destination reachable from an SSH server
//! (the equivalent of `ssh -N -L`).

use anyhow::{Context, Result};
use clap::Parser;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use ssh_tunnel::config::{parse_forward_spec, AppConfig, AuthMethod};
use ssh_tunnel::{SecureSession, SshSession, TunnelManager};

/// How often the SSH session is checked while forwarding.
const SESSION_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// ssh-tunnel - forward a local port through an SSH server
#[derive(Parser, Debug)]
#[command(name = "ssh-tunnel", version, about)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "ssh-tunnel.toml")]
    config: PathBuf,

    /// Generate default configuration and exit
    #[arg(long)]
    generate_config: bool,

    /// Forward as [bind_host:]bind_port:remote_host:remote_port
    #[arg(short = 'L', long = "local")]
    local: Option<String>,

    /// Override SSH server host
    #[arg(long)]
    host: Option<String>,

    /// Override SSH server port
    #[arg(short, long)]
    port: Option<u16>,

    /// Override login user
    #[arg(short, long)]
    user: Option<String>,

    /// Authenticate with this private key instead of the configured method
    #[arg(short, long)]
    identity: Option<PathBuf>,

    /// Authenticate with the keys held by the SSH agent ($SSH_AUTH_SOCK)
    #[arg(short = 'A', long, conflicts_with = "identity")]
    agent: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new(Level::DEBUG.to_string())
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // Handle --generate-config
    if cli.generate_config {
        let config = AppConfig::default();
        let content = toml::to_string_pretty(&config)?;
        println!("{}", content);
        return Ok(());
    }

    // Load configuration
    let mut config = AppConfig::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    // Apply CLI overrides
    if let Some(spec) = cli.local.as_deref() {
        config.tunnel.apply(parse_forward_spec(spec)?);
    }
    if let Some(host) = cli.host {
        config.ssh.host = host;
    }
    if let Some(port) = cli.port {
        config.ssh.port = port;
    }
    if let Some(user) = cli.user {
        config.ssh.user = user;
    }
    if let Some(identity) = cli.identity {
        config.ssh.auth = AuthMethod::Key;
        config.ssh.key_path = identity;
    }
    if cli.agent {
        config.ssh.auth = AuthMethod::Agent;
    }

    config.validate()?;

    let target = config.ssh.to_target()?;
    let session = Arc::new(
        SshSession::connect(&target)
            .await
            .context("Failed to establish SSH session")?,
    );

    let tunnel = TunnelManager::new(session.clone(), config.tunnel.to_options());
    let addr = match tunnel.start().await {
        Ok(addr) => addr,
        Err(e) => {
            let _ = session.disconnect().await;
            return Err(e).context("Failed to start tunnel");
        }
    };

    let options = tunnel.options();
    info!(
        "Forwarding {} -> {}:{} via {}",
        addr,
        options.remote_host,
        options.remote_port,
        session.label()
    );
    info!("Press Ctrl+C to stop");

    let exit = wait_for_exit(
        tokio::signal::ctrl_c(),
        || session.is_connected(),
        SESSION_CHECK_INTERVAL,
    )
    .await;
    match exit {
        Exit::Interrupted => info!("Interrupted, shutting down"),
        Exit::SessionLost => warn!("SSH session to {} closed", session.label()),
    }

    let stopped = tunnel.stop().await;
    if session.is_connected() {
        if let Err(e) = session.disconnect().await {
            warn!("{:#}", e);
        }
    }
    stopped.context("Failed to stop tunnel")?;

    info!("Stopped");
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum Exit {
    Interrupted,
    SessionLost,
}

/// Wait for an interrupt or for the session to drop, whichever comes first.
///
/// `interrupt` is polled across every session check, so a signal arriving
/// between checks is not lost.
async fn wait_for_exit<F>(interrupt: F, is_connected: impl Fn() -> bool, check_every: Duration) -> Exit
where
    F: Future<Output = std::io::Result<()>>,
{
    tokio::pin!(interrupt);
    let mut check = tokio::time::interval(check_every);
    loop {
        tokio::select! {
            res = &mut interrupt => {
                if let Err(e) = res {
                    warn!("Failed to listen for Ctrl+C: {}", e);
                }
                return Exit::Interrupted;
            }
            _ = check.tick() => {
                if !is_connected() {
                    return Exit::SessionLost;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::task::Poll;

    #[tokio::test]
    async fn test_interrupt_seen_across_session_checks() {
        let mut polls = 0;
        let interrupt = std::future::poll_fn(move |cx| {
            polls += 1;
            if polls >= 5 {
                Poll::Ready(Ok(()))
            } else {
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        });

        let exit = wait_for_exit(interrupt, || true, Duration::from_millis(1)).await;
        assert_eq!(exit, Exit::Interrupted);
    }

    #[tokio::test]
    async fn test_session_loss_ends_wait() {
        let connected = AtomicBool::new(true);
        let exit = tokio::join!(
            wait_for_exit(
                std::future::pending(),
                || connected.load(Ordering::SeqCst),
                Duration::from_millis(5),
            ),
            async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                connected.store(false, Ordering::SeqCst);
            },
        )
        .0;
        assert_eq!(exit, Exit::SessionLost);
    }
}
