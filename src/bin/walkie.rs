//! Walkie-talkie command line front end
//!
//! ```text
//! walkie scan [SECONDS]              list peers on both transports
//! walkie listen                      accept incoming calls
//! walkie call [--bluetooth] ADDRESS  call a peer
//! walkie config                      print the effective configuration
//! ```
//!
//! Raw PCM is captured from stdin and received audio is written to stdout,
//! so `arecord -f S16_LE -r 44100 | walkie call 192.168.1.7 | aplay ...`
//! makes a call. Logs go to stderr.

use anyhow::{bail, Result};
use crossbeam_channel::Receiver;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use walkie_link::{
    audio::{AudioEndpoints, ReaderSource, WriterSink},
    discovery::DiscoveryEvent,
    session::SessionEvent,
    transport::{DatagramTransport, StreamTransport, TcpRadio},
    AppConfig, CapabilityGate, Device, SessionManager, SessionState, TransportKind, Transports,
};

const STATS_INTERVAL: Duration = Duration::from_secs(5);

enum Command {
    Scan(Duration),
    Listen,
    Call(Device),
    Config,
}

impl Command {
    fn parse(mut args: impl Iterator<Item = String>) -> Result<Self> {
        let command = match args.next().as_deref() {
            Some("scan") => {
                let secs = match args.next() {
                    Some(secs) => secs.parse()?,
                    None => 10,
                };
                Command::Scan(Duration::from_secs(secs))
            }
            Some("listen") => Command::Listen,
            Some("call") => {
                let mut kind = TransportKind::NetworkP2P;
                let mut address = None;
                for arg in args.by_ref() {
                    match arg.as_str() {
                        "--bluetooth" | "-b" => kind = TransportKind::Bluetooth,
                        _ => address = Some(arg),
                    }
                }
                let Some(address) = address else {
                    bail!("usage: walkie call [--bluetooth] ADDRESS");
                };
                Command::Call(Device::new(None, address, kind))
            }
            Some("config") => Command::Config,
            _ => bail!("usage: walkie <scan [SECONDS] | listen | call [--bluetooth] ADDRESS | config>"),
        };
        Ok(command)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging; stdout carries audio
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let command = Command::parse(std::env::args().skip(1))?;
    let config = AppConfig::load()?;

    if let Command::Config = command {
        print!("{}", config.to_toml_string()?);
        return Ok(());
    }

    tracing::info!("Starting walkie as '{}'", config.stream.local_name);

    let gate = Arc::new(CapabilityGate::new(config.capabilities.granted.iter().copied()));
    let network = Arc::new(DatagramTransport::bind(
        config.network.clone(),
        &config.stream.local_name,
    )?);
    tracing::info!("Datagram transport on {}", network.local_addr()?);
    let bluetooth = Arc::new(StreamTransport::new(
        TcpRadio::new(&config.stream),
        config.stream.clone(),
        config.audio.chunk_size,
    ));

    let poll = config.session.poll_interval();
    let endpoints = match command {
        Command::Scan(_) => AudioEndpoints::silent(poll),
        _ => AudioEndpoints::new(
            ReaderSource::spawn(std::io::stdin(), config.audio.chunk_size, poll)?,
            WriterSink::new(std::io::stdout()),
        ),
    };

    let manager = Arc::new(SessionManager::new(
        &config,
        Transports::new(bluetooth, network),
        gate,
        endpoints,
    ));
    manager.start()?;

    let cancelled = Arc::new(AtomicBool::new(false));
    let worker = {
        let manager = Arc::clone(&manager);
        let cancelled = Arc::clone(&cancelled);
        tokio::task::spawn_blocking(move || run(command, &manager, &cancelled))
    };
    tokio::pin!(worker);

    let interrupted = tokio::select! {
        result = &mut worker => {
            result??;
            false
        }
        _ = tokio::signal::ctrl_c() => true,
    };
    if interrupted {
        tracing::info!("Interrupted, shutting down");
        cancelled.store(true, Ordering::SeqCst);
        worker.await??;
    }

    tokio::task::spawn_blocking(move || manager.shutdown()).await?;
    Ok(())
}

fn run(command: Command, manager: &SessionManager, cancelled: &AtomicBool) -> Result<()> {
    match command {
        Command::Scan(duration) => scan(manager, duration, cancelled),
        Command::Listen => listen(manager, cancelled),
        Command::Call(device) => call(manager, &device, cancelled),
        Command::Config => Ok(()),
    }
}

/// Print every roster change as a JSON line
fn scan(manager: &SessionManager, duration: Duration, cancelled: &AtomicBool) -> Result<()> {
    let (id, events) = manager.discovery().subscribe();
    manager.start_discovery()?;

    let deadline = Instant::now() + duration;
    while !cancelled.load(Ordering::Relaxed) && Instant::now() < deadline {
        match events.recv_timeout(Duration::from_millis(200)) {
            Ok(DiscoveryEvent::Roster(devices)) if !devices.is_empty() => {
                println!("{}", serde_json::to_string(&*devices)?);
            }
            Ok(DiscoveryEvent::TransportDisabled(kind)) => {
                tracing::warn!("{} discovery unavailable", kind);
            }
            _ => {}
        }
    }

    manager.discovery().unsubscribe(id);
    manager.stop_discovery();
    Ok(())
}

/// Accept every incoming call, one at a time
fn listen(manager: &SessionManager, cancelled: &AtomicBool) -> Result<()> {
    let (_, events) = manager.subscribe();
    tracing::info!("Waiting for calls");

    let mut last_stats = Instant::now();
    while !cancelled.load(Ordering::Relaxed) {
        match events.recv_timeout(Duration::from_millis(200)) {
            Ok(SessionEvent::IncomingRequest(requester)) => {
                tracing::info!("Answering {}", requester);
                if let Err(e) = manager.accept_pending() {
                    tracing::warn!("Could not answer {}: {}", requester, e);
                    manager.acknowledge_error();
                }
            }
            Ok(SessionEvent::AutoRejected { requester, .. }) => {
                tracing::info!("Turned away {} while busy", requester);
            }
            Ok(SessionEvent::Failed(reason)) => {
                tracing::warn!("Call ended: {}", reason);
                manager.acknowledge_error();
            }
            _ => {}
        }
        log_stats(manager, &mut last_stats);
    }
    Ok(())
}

/// Call one peer and stay on the line until either side hangs up
fn call(manager: &SessionManager, device: &Device, cancelled: &AtomicBool) -> Result<()> {
    let (_, events) = manager.subscribe();
    let session = manager.connect(device)?;
    tracing::info!("In call with {} (session {})", session.peer(), session.id());

    let mut last_stats = Instant::now();
    while !cancelled.load(Ordering::Relaxed) {
        if call_ended(&events) {
            break;
        }
        log_stats(manager, &mut last_stats);
    }

    tracing::info!("Final stats: {}", serde_json::to_string(&session.stats())?);
    Ok(())
}

/// True once the call is over
fn call_ended(events: &Receiver<SessionEvent>) -> bool {
    match events.recv_timeout(Duration::from_millis(200)) {
        Ok(SessionEvent::Failed(reason)) => {
            tracing::warn!("Call ended: {}", reason);
            true
        }
        Ok(SessionEvent::StateChanged(snapshot)) => snapshot.state == SessionState::Idle,
        _ => false,
    }
}

fn log_stats(manager: &SessionManager, last: &mut Instant) {
    if last.elapsed() < STATS_INTERVAL {
        return;
    }
    *last = Instant::now();
    if let Some(session) = manager.active_session() {
        match serde_json::to_string(&session.stats()) {
            Ok(stats) => tracing::info!("Session {} stats: {}", session.id(), stats),
            Err(e) => tracing::debug!("Could not encode stats: {}", e),
        }
    }
}
