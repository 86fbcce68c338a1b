// BlueChat Linux: discovery, one chat session at a time, stdin/stdout chat loop.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use bluechat_core::{ConnectionEvent, PeerDevice};
use bluechat_linux::{config, ChatController, ConnectionEvents};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "bluechat-linux")]
#[command(about = "Peer-to-peer chat with nearby devices")]
#[command(version)]
struct Args {
    /// Config file (default: ~/.config/bluechat/config.toml, then /etc/bluechat/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Wait for one incoming connection, then chat
    Listen,
    /// Connect to a peer at host:port, then chat
    Connect { address: String },
    /// Scan for nearby devices and list them with the paired devices
    Scan {
        #[arg(long, default_value = "12")]
        secs: u64,
    },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let cfg = match &args.config {
        Some(path) => config::load_from(path)?,
        None => config::load(),
    };

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let controller = ChatController::start(&cfg)
            .await
            .context("starting controller")?;
        tracing::info!(name = controller.local_name(), "bluechat started");
        let result = match args.command {
            Command::Listen => {
                let events = controller.start_server().await?;
                if let Some(addr) = controller.listening_addr() {
                    println!("waiting for a connection on {addr}");
                }
                chat(&controller, events).await
            }
            Command::Connect { address } => {
                let events = controller
                    .connect_to(&PeerDevice::new(None, address))
                    .await?;
                chat(&controller, events).await
            }
            Command::Scan { secs } => scan(&controller, Duration::from_secs(secs)).await,
        };
        controller.release().await;
        result
    })
}

async fn scan(controller: &ChatController, window: Duration) -> anyhow::Result<()> {
    controller.start_discovery().await?;
    let mut discovered = controller.subscribe_discovered();
    let deadline = tokio::time::sleep(window);
    let shutdown = shutdown_signal();
    tokio::pin!(deadline, shutdown);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = &mut shutdown => break,
            changed = discovered.changed() => {
                if changed.is_err() {
                    break;
                }
                if let Some(peer) = discovered.borrow_and_update().last() {
                    println!("found {} ({})", peer.display_name(), peer.address);
                }
            }
        }
    }
    controller.stop_discovery();
    println!("paired:");
    for peer in controller.subscribe_paired().borrow().iter() {
        println!("  {} ({})", peer.display_name(), peer.address);
    }
    Ok(())
}

async fn chat(controller: &ChatController, mut events: ConnectionEvents) -> anyhow::Result<()> {
    let mut errors = controller.subscribe_errors();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match &event {
                    ConnectionEvent::Established => println!("connected"),
                    ConnectionEvent::MessageReceived(m) => println!("{}: {}", m.sender_name, m.body),
                    ConnectionEvent::Failed(reason) => println!("error: {reason}"),
                }
                if event.is_terminal() {
                    break;
                }
            }
            line = lines.next_line(), if stdin_open => match line? {
                Some(text) if !text.trim().is_empty() => {
                    match controller.try_send_message(&text).await {
                        Ok(Some(_)) => {}
                        Ok(None) => println!("not connected"),
                        Err(e) => println!("error: {e}"),
                    }
                }
                Some(_) => {}
                None => stdin_open = false,
            },
            Ok(err) = errors.recv() => println!("notice: {err}"),
            _ = &mut shutdown => break,
        }
    }
    controller.close_connection().await;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
