//! Session channel binary.
//!
//! `serve` runs an echo gateway; `connect` opens a session, exchanges a few
//! payloads with the gateway and closes gracefully.

use anyhow::Context;
use bytes::Bytes;
use channel_session::{
    Channel, ChannelEvent, CloseState, Gateway, GatewayEvent, SessionClient,
};
use channel_wire::PacketCodec;
use clap::{Parser, Subcommand};
use std::{net::SocketAddr, path::PathBuf, time::Duration};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::ChannelConfig;
use logging::ChannelLogFormatter;

/// Session channel echo gateway and client
#[derive(Parser, Debug)]
#[command(name = "channel", version, about = "Session channel echo gateway and client")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Configuration file path
    #[arg(long, default_value = "channel.yaml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a gateway that echoes every payload back
    Serve {
        /// Listen address, e.g. 0.0.0.0:5000
        #[arg(long)]
        listen: Option<SocketAddr>,

        /// Reject creates without an issued binding token
        #[arg(long)]
        token_required: bool,

        /// Offline timeout, e.g. 20s
        #[arg(long)]
        offline_timeout: Option<humantime::Duration>,
    },
    /// Connect, send payloads, await their echoes and close
    Connect {
        /// Gateway address
        #[arg(long, default_value = "127.0.0.1:5000")]
        addr: SocketAddr,

        /// Binding token
        #[arg(long, default_value = "")]
        token: String,

        /// Number of payloads to send
        #[arg(long, default_value_t = 3)]
        count: u32,

        /// Payload text
        #[arg(long, default_value = "hello")]
        message: String,

        /// Pause between payloads, e.g. 100ms
        #[arg(long, default_value = "0s")]
        interval: humantime::Duration,
    },
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("channel={}", args.log_level).parse()?)
        .add_directive(format!("channel_session={}", args.log_level).parse()?)
        .add_directive(format!("channel_wire={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(true)
        .event_format(ChannelLogFormatter::new("channel".to_string()))
        .init();

    info!("Starting session channel v{}", env!("CARGO_PKG_VERSION"));

    let mut config = ChannelConfig::load_from_file(&args.config)?;

    match args.command {
        Command::Serve {
            listen,
            token_required,
            offline_timeout,
        } => {
            if let Some(listen) = listen {
                config.gateway.listen = listen;
            }
            if token_required {
                config.gateway.token_required = true;
            }
            if let Some(timeout) = offline_timeout {
                config.session.offline_timeout = timeout.into();
            }
            serve(&config).await
        }
        Command::Connect {
            addr,
            token,
            count,
            message,
            interval,
        } => connect(&config, addr, &token, count, message, interval.into()).await,
    }
}

async fn serve(config: &ChannelConfig) -> anyhow::Result<()> {
    let (gateway, mut events) =
        Gateway::start(config.gateway_settings(), PacketCodec::default()).await?;
    component_info!("gateway", "Echo gateway listening on {}", gateway.local_addr());

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(GatewayEvent::SessionOpened { session_id, tag, channel }) => {
                    component_info!("gateway", "Session {} opened (tag {:?})", session_id, tag);
                    tokio::spawn(echo(channel));
                }
                Some(GatewayEvent::SessionClosed { session_id, reason }) => {
                    component_info!("gateway", "Session {} closed: {}", session_id, reason);
                }
                Some(GatewayEvent::BindingTimedOut { tag }) => {
                    component_warn!("gateway", "Binding for {} timed out", tag);
                }
                None => break,
            },
            result = tokio::signal::ctrl_c() => {
                result.context("failed to listen for Ctrl+C")?;
                info!("Received SIGINT, closing sessions");
                break;
            }
        }
    }

    gateway.stop(false);
    gateway.join().await?;
    info!("Gateway shutdown complete");
    Ok(())
}

async fn echo(mut channel: Channel<Bytes>) {
    let session_id = channel.session_id();
    while let Some(event) = channel.recv().await {
        match event {
            ChannelEvent::Received(payload) => {
                component_debug!("echo", "Session {}: echoing {} bytes", session_id, payload.len());
                if channel.send(payload).is_err() {
                    break;
                }
            }
            ChannelEvent::CloseStateChanged(state) => {
                component_debug!("echo", "Session {}: close state {}", session_id, state);
            }
            ChannelEvent::Closed(_) => break,
        }
    }
}

async fn connect(
    config: &ChannelConfig,
    addr: SocketAddr,
    token: &str,
    count: u32,
    message: String,
    interval: Duration,
) -> anyhow::Result<()> {
    let client = SessionClient::new(PacketCodec::default(), config.client_settings());
    let mut channel = client
        .connect(addr, token)
        .await
        .with_context(|| format!("failed to create session at {}", addr))?;
    component_info!("client", "Session {} created at {}", channel.session_id(), addr);

    let payload = Bytes::from(message);
    let mut echoed = 0;
    for n in 0..count {
        channel.send(payload.clone())?;
        if !interval.is_zero() && n + 1 < count {
            tokio::time::sleep(interval).await;
        }
    }

    while echoed < count {
        match channel.recv().await {
            Some(ChannelEvent::Received(echo)) => {
                echoed += 1;
                component_info!(
                    "client",
                    "Echo {}/{}: {}",
                    echoed,
                    count,
                    String::from_utf8_lossy(&echo)
                );
            }
            Some(ChannelEvent::Closed(reason)) => {
                anyhow::bail!("session closed ({}) after {} of {} echoes", reason, echoed, count);
            }
            Some(ChannelEvent::CloseStateChanged(_)) => {}
            None => anyhow::bail!("session ended after {} of {} echoes", echoed, count),
        }
    }

    match channel.srtt() {
        Some(srtt) => component_info!("client", "Smoothed RTT {:?}", srtt),
        None => component_info!("client", "No RTT sample yet"),
    }

    channel.close();
    let mut states: Vec<CloseState> = Vec::new();
    while let Some(event) = channel.recv().await {
        match event {
            ChannelEvent::CloseStateChanged(state) => states.push(state),
            ChannelEvent::Closed(reason) => {
                component_info!("client", "Session closed ({}), states {:?}", reason, states);
                break;
            }
            ChannelEvent::Received(_) => {}
        }
    }
    Ok(())
}
