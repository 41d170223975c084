//! SecureCast session CLI
//!
//! Drives the session machine from a terminal: manual copy-paste handshakes,
//! a brokered relay client, the relay server itself and an in-process demo.
//!
//! # Usage
//!
//! ```bash
//! # Device A: print an offer, then paste B's answer followed by a blank line
//! securecast offer --name Laptop
//!
//! # Device B: paste A's offer followed by a blank line, then copy the answer back
//! securecast answer --name Phone
//!
//! # Relay server and brokered clients
//! securecast relay --bind 0.0.0.0:8091
//! securecast connect --relay-url ws://relay.local:8091 --peer <device-id>
//!
//! # Two in-process devices exchanging messages and a screen track
//! securecast demo
//! ```
//!
//! Once a session is open every line typed on stdin is sent to all open
//! peers as a custom message. `/quit` ends the session.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use securecast_session::channels::ControlMessage;
use securecast_session::lifecycle::AppPhase;
use securecast_session::{
    BackgroundReconciler, BrokeredSignaling, ConnectionFactory, MemoryNetwork, MemoryRelay,
    RelayServer, RtcConnectionFactory, ScreenShare, SessionConfig, SessionEvent, SessionMachine,
    SignalingEnvelope, SyntheticCapture, WebSocketRelay,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a TOML session configuration
    #[arg(long, global = true, env = "SECURECAST_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter (e.g. "info", "securecast_session=debug")
    #[arg(long, global = true, env = "SECURECAST_LOG", default_value = "info")]
    log: String,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a manual offer and complete it with a pasted answer
    Offer {
        /// Name announced to the other device
        #[arg(long)]
        name: Option<String>,
    },

    /// Accept a pasted offer and print the answer
    Answer {
        #[arg(long)]
        name: Option<String>,
    },

    /// Register with a relay and optionally connect to a peer
    Connect {
        /// Relay endpoint (overrides relay_url from the config file)
        #[arg(long, env = "SECURECAST_RELAY_URL")]
        relay_url: Option<String>,

        /// Device id to offer a session to
        #[arg(long)]
        peer: Option<String>,

        #[arg(long)]
        name: Option<String>,
    },

    /// Run the WebSocket relay server
    Relay {
        #[arg(long, default_value = "0.0.0.0:8091", env = "SECURECAST_RELAY_BIND")]
        bind: SocketAddr,
    },

    /// Connect two in-process devices and exercise the session features
    Demo {
        /// Route signaling through an in-process relay instead of copy-paste
        #[arg(long)]
        brokered: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args.log, args.json_logs)?;

    let config = match &args.config {
        Some(path) => SessionConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => SessionConfig::default(),
    };

    match args.command {
        Command::Offer { name } => run_offer(with_name(config, name)).await,
        Command::Answer { name } => run_answer(with_name(config, name)).await,
        Command::Connect {
            relay_url,
            peer,
            name,
        } => run_connect(with_name(config, name), relay_url, peer).await,
        Command::Relay { bind } => run_relay(bind).await,
        Command::Demo { brokered } => run_demo(brokered).await,
    }
}

fn init_logging(filter: &str, json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_new(filter).context("Invalid log filter")?;
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init()?;
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()?;
    }
    Ok(())
}

fn with_name(mut config: SessionConfig, name: Option<String>) -> SessionConfig {
    if name.is_some() {
        config.device_name = name;
    }
    config
}

fn rtc_factory(config: &SessionConfig) -> Arc<dyn ConnectionFactory> {
    Arc::new(RtcConnectionFactory::new(config))
}

type StdinLines = Lines<BufReader<Stdin>>;

fn stdin_lines() -> StdinLines {
    BufReader::new(tokio::io::stdin()).lines()
}

/// Read a pasted blob up to the first blank line
async fn read_blob(lines: &mut StdinLines) -> anyhow::Result<String> {
    let mut blob = String::new();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            if blob.is_empty() {
                continue;
            }
            break;
        }
        blob.push_str(line);
    }
    if blob.is_empty() {
        bail!("stdin closed before anything was pasted");
    }
    Ok(blob)
}

async fn run_offer(config: SessionConfig) -> anyhow::Result<()> {
    let factory = rtc_factory(&config);
    let machine = SessionMachine::manual(config, factory)?;
    print_device(&machine);

    let offer = machine.create_offer().await?;
    println!("\n--- offer: copy everything below to the other device ---\n");
    println!("{}", offer);
    println!("\n--- paste the answer, then an empty line ---");

    let mut lines = stdin_lines();
    let answer = read_blob(&mut lines).await?;
    let peer_id = machine.complete_with_answer(&answer).await?;
    println!("Connected to {}", peer_id);

    chat(&machine, &mut lines).await;
    machine.shutdown().await;
    Ok(())
}

async fn run_answer(config: SessionConfig) -> anyhow::Result<()> {
    let factory = rtc_factory(&config);
    let machine = SessionMachine::manual(config, factory)?;
    print_device(&machine);

    println!("--- paste the offer, then an empty line ---");
    let mut lines = stdin_lines();
    let offer = read_blob(&mut lines).await?;
    let peer_id = SignalingEnvelope::decode(&offer)?.device_id;

    let answer = machine.accept_offer(&offer).await?;
    println!("\n--- answer: copy everything below to the other device ---\n");
    println!("{}", answer);
    println!();

    machine.wait_open(&peer_id).await?;
    println!("Connected to {}", peer_id);

    chat(&machine, &mut lines).await;
    machine.shutdown().await;
    Ok(())
}

async fn run_connect(
    mut config: SessionConfig,
    relay_url: Option<String>,
    peer: Option<String>,
) -> anyhow::Result<()> {
    if relay_url.is_some() {
        config.relay_url = relay_url;
    }
    let Some(url) = config.relay_url.clone() else {
        bail!("no relay url: pass --relay-url or set relay_url in the config file");
    };

    let factory = rtc_factory(&config);
    let signaling = BrokeredSignaling::start(config, factory, &WebSocketRelay::new(url)).await?;
    let machine = signaling.machine().clone();
    print_device(&machine);

    if let Some(peer) = peer {
        signaling.connect(&peer).await?;
        println!("Connected to {}", peer);
    } else {
        println!("Waiting for offers...");
    }

    let mut lines = stdin_lines();
    chat(&machine, &mut lines).await;
    signaling.shutdown().await;
    Ok(())
}

async fn run_relay(bind: SocketAddr) -> anyhow::Result<()> {
    let server = RelayServer::bind(bind).await?;
    let handle = server.start()?;
    info!("Relay listening on {}", handle.url());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Ctrl+C received, shutting down relay");
    handle.shutdown().await;
    Ok(())
}

fn print_device(machine: &SessionMachine) {
    let device = machine.local_device();
    println!("Device {} ({})", device.id, device.name);
}

fn print_event(prefix: &str, event: &SessionEvent) {
    match event {
        SessionEvent::Connected {
            peer_id,
            device_name,
        } => println!(
            "{}connected: {} ({})",
            prefix,
            peer_id,
            device_name.as_deref().unwrap_or("unnamed")
        ),
        SessionEvent::Disconnected { peer_id, reason } => println!(
            "{}disconnected: {} ({})",
            prefix,
            peer_id,
            reason.as_deref().unwrap_or("no reason")
        ),
        SessionEvent::StateChanged { .. } => {}
        SessionEvent::RemoteTrack { peer_id, track } => {
            println!("{}receiving {} from {}", prefix, track.kind, peer_id)
        }
        SessionEvent::RemoteTrackEnded { peer_id, track_id } => {
            println!("{}track {} from {} ended", prefix, track_id, peer_id)
        }
        SessionEvent::Error { peer_id, message } => println!(
            "{}error{}: {}",
            prefix,
            peer_id
                .as_deref()
                .map(|p| format!(" ({})", p))
                .unwrap_or_default(),
            message
        ),
    }
}

/// Print events and custom messages, and send stdin lines to every open peer
async fn chat(machine: &SessionMachine, lines: &mut StdinLines) {
    let mut events = machine.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            print_event("* ", &event);
        }
    });

    machine.on_message("custom_message", |peer_id, message| async move {
        if let ControlMessage::CustomMessage { message, .. } = message {
            println!("[{}] {}", peer_id, message);
        }
    });

    println!("Type a message and press enter; /quit to leave");
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to read stdin: {}", e);
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }

        let open = machine.list_open().await;
        if open.is_empty() {
            println!("No open sessions");
            continue;
        }
        for session in open {
            let peer_id = session.peer_id();
            if !machine.bus().send_custom(&peer_id, line).await {
                println!("Could not deliver to {}", peer_id);
            }
        }
    }

    printer.abort();
}

async fn run_demo(brokered: bool) -> anyhow::Result<()> {
    let network = MemoryNetwork::new();
    let mut config = SessionConfig::lan_preset();

    config.device_name = Some("Laptop".to_string());
    let laptop_config = config.clone();
    config.device_name = Some("Phone".to_string());
    let phone_config = config;

    if brokered {
        let relay = MemoryRelay::new();
        let laptop =
            BrokeredSignaling::start(laptop_config, Arc::new(network.clone()), &relay).await?;
        let phone = BrokeredSignaling::start(phone_config, Arc::new(network), &relay).await?;

        let phone_id = phone.machine().identity().device_id.clone();
        laptop.connect(&phone_id).await?;
        println!("Brokered session open between Laptop and Phone");

        demo_exchange(laptop.machine(), phone.machine()).await?;
        laptop.shutdown().await;
        phone.shutdown().await;
        return Ok(());
    }

    let laptop = SessionMachine::manual(laptop_config, Arc::new(network.clone()))?;
    let phone = SessionMachine::manual(phone_config, Arc::new(network))?;

    let offer = laptop.create_offer().await?;
    println!("Offer ({} bytes)", offer.len());
    let answer = phone.accept_offer(&offer).await?;
    println!("Answer ({} bytes)", answer.len());
    laptop.complete_with_answer(&answer).await?;
    phone.wait_open(&laptop.identity().device_id).await?;
    println!("Manual session open between Laptop and Phone");

    demo_exchange(&laptop, &phone).await?;
    laptop.shutdown().await;
    phone.shutdown().await;
    Ok(())
}

async fn demo_exchange(laptop: &SessionMachine, phone: &SessionMachine) -> anyhow::Result<()> {
    let laptop_id = laptop.identity().device_id.clone();
    let phone_id = phone.identity().device_id.clone();

    let mut phone_events = phone.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = phone_events.recv().await {
            print_event("phone * ", &event);
        }
    });

    let mut inbox = phone.bus().subscribe();
    laptop.bus().send_custom(&phone_id, "hello from the laptop").await;
    if let Ok(Ok(inbound)) = tokio::time::timeout(Duration::from_secs(2), inbox.recv()).await {
        println!("phone received {} from {}", inbound.message.kind(), inbound.peer_id);
    }

    let share = ScreenShare::new(
        Arc::new(SyntheticCapture::new()),
        laptop.negotiator().clone(),
    );
    share.start(&phone_id).await?;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let reconciler = BackgroundReconciler::for_machine(laptop);
    if let Some(status) = reconciler.on_transition(AppPhase::Background).await {
        println!("laptop backgrounded: {}", status.message());
    }
    reconciler.on_transition(AppPhase::Foreground).await;

    let status = reconciler.share_status().await;
    println!(
        "laptop sharing with {} device(s), capture {:?}",
        status.share_count,
        share.status()
    );

    share.stop(&phone_id).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    println!(
        "phone associations: {:?}",
        phone.negotiator().association(&laptop_id).await
    );
    Ok(())
}
