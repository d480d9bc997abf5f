//! Burrow client
//!
//! Connects to the tunnel broker, logs in, registers the configured
//! local service, and relays work-connection traffic to the local peer.
//! A fatal protocol failure tears the whole session down and reconnects
//! from scratch - the protocol has no in-place recovery.

use anyhow::{anyhow, Context, Result};
use burrow::clock::SystemClock;
use burrow::config::Config;
use burrow::relay::{EchoPeer, PeerRelay, TcpPeer};
use burrow::session::{
    read_frame, LoginIdentity, ProxyServiceSpec, Session, SessionConfig, TICK_MILLIS,
};
use burrow::status::LogIndicator;
use clap::Parser;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{error, info, warn};

/// Pause between reconnect attempts after a fatal session failure
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Burrow - reverse tunnel client
#[derive(Parser, Debug)]
#[command(name = "burrow-client")]
#[command(about = "Reverse tunnel client - expose a local service through a broker")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "burrow.toml")]
    config: String,

    /// Broker address (overrides config)
    #[arg(short, long)]
    server: Option<String>,

    /// Acknowledge relayed data locally instead of forwarding to the
    /// configured service
    #[arg(long)]
    echo: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(&args.config).context("Failed to load configuration")?;

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    info!("Burrow client v{}", burrow::VERSION);

    let broker_addr = args.server.clone().unwrap_or_else(|| {
        format!(
            "{}:{}",
            config.broker.server_addr, config.broker.server_port
        )
    });
    info!("Broker: {}", broker_addr);
    info!(
        "Service: {} -> {}:{} (remote port {})",
        config.proxy.proxy_name,
        config.proxy.local_address,
        config.proxy.local_port,
        config.proxy.remote_port
    );

    loop {
        match run_session(&broker_addr, &config, args.echo).await {
            Ok(()) => {
                info!("Session closed");
                break;
            }
            Err(e) => {
                // restart-on-fatal: reconnect with fresh protocol and
                // cipher state rather than repairing in place
                error!("Session failed: {e:#}");
                info!("Reconnecting in {}s...", RECONNECT_DELAY.as_secs());
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }

    Ok(())
}

/// Run one full session on one physical connection
async fn run_session(broker_addr: &str, config: &Config, echo: bool) -> Result<()> {
    let stream = TcpStream::connect(broker_addr)
        .await
        .context("Failed to connect to broker")?;
    stream.set_nodelay(true)?;
    info!("Connected to broker");

    let (mut read_half, write_half) = stream.into_split();

    let identity = match &config.broker.run_id {
        Some(run_id) => LoginIdentity::new(run_id.clone()),
        None => LoginIdentity::from_hardware().context("Failed to derive run_id")?,
    };

    let peer: Box<dyn PeerRelay> = if echo {
        Box::new(EchoPeer)
    } else {
        Box::new(TcpPeer::new(
            &config.proxy.local_address,
            config.proxy.local_port,
        ))
    };

    let session_config = SessionConfig {
        token: config.broker.auth_token.clone(),
        service: ProxyServiceSpec::from(&config.proxy),
        heartbeat_interval_ticks: u32::from(config.heartbeat.interval_secs) * 10,
        heartbeat_timeout_secs: i64::from(config.heartbeat.timeout_secs),
    };

    let mut session = Session::new(
        write_half,
        session_config,
        identity,
        Box::new(SystemClock),
        Box::new(LogIndicator::new()),
        peer,
    );

    session.start().await?;

    // Dedicated reader task: read_exact is not cancellation-safe inside
    // select!, so frames arrive whole over a channel instead.
    let (frame_tx, mut frame_rx) = tokio::sync::mpsc::channel(64);
    tokio::spawn(async move {
        loop {
            match read_frame(&mut read_half).await {
                Ok(frame) => {
                    if frame_tx.send(Ok(frame)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = frame_tx.send(Err(e)).await;
                    break;
                }
            }
        }
    });

    let mut ticker = tokio::time::interval(Duration::from_millis(TICK_MILLIS));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    // Single task owns the session: the dispatch path and the periodic
    // tick interleave here instead of sharing state across threads.
    loop {
        tokio::select! {
            msg = frame_rx.recv() => match msg {
                Some(Ok((hdr, payload))) => session.handle_frame(hdr, payload).await?,
                Some(Err(e)) => return Err(e.into()),
                None => return Err(anyhow!("broker connection closed")),
            },
            _ = ticker.tick() => {
                session.tick().await?;
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, closing session");
                return Ok(());
            }
        }
    }
}
