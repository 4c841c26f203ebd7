use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rtc_session::config::ConfigStore;
use rtc_session::engine::{EngineEventBus, LoopbackEngine};
use rtc_session::events::{EventKind, EventSubscription, SessionEvent};
use rtc_session::media::Track;
use rtc_session::router::EventRouter;
use rtc_session::session::{Session, SessionRegistry};
use rtc_session::signaling::{ConnectionState, MediaConstraints};

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// rtc-session command line arguments
#[derive(Parser, Debug)]
#[command(name = "rtc-session")]
#[command(version, about = "Negotiate two loopback peer sessions and report their state", long_about = None)]
struct CliArgs {
    /// Configuration file (default: $RTC_SESSION_CONFIG or ./rtc-session.toml)
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Local stream offered by the caller (repeatable)
    #[arg(short = 's', long = "stream", value_name = "ID", default_values_t = [String::from("camera")])]
    streams: Vec<String>,

    /// How long to wait for both peers to connect (seconds)
    #[arg(long, value_name = "SECS", default_value_t = 5)]
    timeout: u64,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting rtc-session v{}", env!("CARGO_PKG_VERSION"));

    let config_path = args.config.unwrap_or_else(get_config_path);
    let config_store = ConfigStore::new(&config_path).await?;
    let config = config_store.get();
    tracing::info!("Configuration: {}", config_store.path().display());

    // Shared engine queue and its router
    let bus = EngineEventBus::new();
    let router = EventRouter::new(bus.clone());
    let router_task = router.spawn()?;

    let engine = Arc::new(LoopbackEngine::new(bus, config.loopback.clone()));
    let registry = SessionRegistry::new(config.session.clone(), engine, router.clone());

    let caller = registry.create_session()?;
    let callee = registry.create_session()?;
    spawn_event_logger("caller", caller.subscribe_all());
    spawn_event_logger("callee", callee.subscribe_all());

    let mut caller_candidates = caller.subscribe([EventKind::IceCandidate]);
    let mut callee_candidates = callee.subscribe([EventKind::IceCandidate]);
    let caller_connected = wait_connected(caller.subscribe([EventKind::ConnectionStateChange]));
    let callee_connected = wait_connected(callee.subscribe([EventKind::ConnectionStateChange]));

    for stream in &args.streams {
        caller.add_track(&Track::audio(format!("{}-audio", stream)), stream)?;
    }

    // Offer/answer exchange
    let offer = caller.create_offer(MediaConstraints::default()).await?;
    caller.set_local_description(offer.clone()).await?;
    callee.set_remote_description(offer).await?;
    let answer = callee.create_answer(MediaConstraints::default()).await?;
    callee.set_local_description(answer.clone()).await?;
    caller.set_remote_description(answer).await?;

    let wait = Duration::from_secs(args.timeout);
    match tokio::time::timeout(wait, async { tokio::join!(caller_connected, callee_connected) }).await {
        Ok(_) => tracing::info!("Both peers connected"),
        Err(_) => anyhow::bail!("peers did not connect within {}s", args.timeout),
    }

    // Candidates were gathered while the descriptions were applied
    exchange_candidates(&mut caller_candidates, &callee).await;
    exchange_candidates(&mut callee_candidates, &caller).await;

    for info in registry.list_sessions() {
        tracing::info!("{}", serde_json::to_string(&info)?);
    }
    for stream in callee.remote_streams() {
        tracing::info!("Callee receives stream {}", stream.id());
    }
    match caller.get_stats(None).await? {
        Some(report) => tracing::info!("Caller stats: {}", serde_json::to_string(&report)?),
        None => tracing::info!("Caller stats unavailable"),
    }

    registry.close_all();
    tokio::time::sleep(Duration::from_millis(50)).await;
    tracing::info!(
        "Closed: caller={}, callee={}",
        caller.is_closed(),
        callee.is_closed()
    );

    router.shutdown();
    if let Err(e) = router_task.await {
        tracing::warn!("Router task failed: {}", e);
    }

    tracing::info!("rtc-session finished");
    Ok(())
}

fn spawn_event_logger(name: &'static str, mut events: EventSubscription) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => tracing::debug!("[{}] {}", name, json),
                Err(e) => tracing::warn!("[{}] unserializable event: {}", name, e),
            }
        }
    });
}

async fn wait_connected(mut events: EventSubscription) {
    while let Some(event) = events.recv().await {
        if let SessionEvent::ConnectionStateChange {
            state: ConnectionState::Connected,
        } = event
        {
            return;
        }
    }
}

/// Hand every queued local candidate of one peer to the other
async fn exchange_candidates(candidates: &mut EventSubscription, remote: &Session) {
    for event in candidates.drain() {
        if let SessionEvent::IceCandidate {
            candidate: Some(candidate),
        } = event
        {
            if let Err(e) = remote.add_ice_candidate(candidate).await {
                tracing::warn!("Session {}: candidate rejected: {}", remote.id(), e);
            }
        }
    }
}

fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "rtc_session=error",
        LogLevel::Warn => "rtc_session=warn",
        LogLevel::Info => "rtc_session=info",
        LogLevel::Verbose => "rtc_session=debug,rtc_session::engine=info",
        LogLevel::Debug => "rtc_session=debug",
        LogLevel::Trace => "rtc_session=trace",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}

/// Get the configuration file path
fn get_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("RTC_SESSION_CONFIG") {
        return PathBuf::from(path);
    }
    PathBuf::from("rtc-session.toml")
}
