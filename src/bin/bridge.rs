use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use log::{info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};

use skyrelay::{
    AlertManager, BridgeConfig, ConditionKind, Disposition, EmergencyMessage, MessageIdGen,
    SerialPortLink, TransportChannel,
};

#[derive(Parser)]
#[command(name = "bridge")]
#[command(about = "Relay emergency alerts to the ground station over a serial radio link")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Serial port override
    #[arg(short, long)]
    port: Option<String>,

    /// Baud rate override
    #[arg(short, long)]
    baud: Option<u32>,

    /// Send a single test message and exit
    #[arg(short, long)]
    message: Option<String>,

    /// Emergency code for the test message (1=fire, 2=damage, 3=other)
    #[arg(short = 't', long, default_value = "3")]
    kind: u8,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn kind_from_code(code: u8) -> ConditionKind {
    match code {
        1 => ConditionKind::Fire,
        2 => ConditionKind::Damage,
        _ => ConditionKind::Person,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    info!("🚀 Starting emergency alert bridge");

    let mut config = match BridgeConfig::from_file(&args.config) {
        Ok(config) => {
            info!("✅ Loaded configuration from {:?}", args.config);
            config
        }
        Err(e) => {
            warn!(
                "Failed to load config from {:?}: {}. Using default configuration.",
                args.config, e
            );
            BridgeConfig::default()
        }
    };

    if let Some(port) = args.port {
        config.link.port = port;
    }
    if let Some(baud) = args.baud {
        config.link.baud_rate = baud;
    }
    info!(
        "📡 Radio link: {} at {} baud",
        config.link.port, config.link.baud_rate
    );

    let link = SerialPortLink::new(&config.link);
    let channel = Arc::new(TransportChannel::new(&config.link, Box::new(link)));

    if let Some(text) = args.message {
        return send_test_message(&channel, &text, args.kind).await;
    }

    if let Err(e) = channel.connect().await {
        warn!("Radio link not reachable yet, will keep retrying: {e:#}");
    }
    channel.start().await?;

    let mut manager = AlertManager::new(Arc::clone(&channel), config.alerts.clone());

    println!("============================================");
    println!("Emergency alert bridge is running");
    println!("  <code> <text>   raise an alert (1=fire, 2=damage, 3=other)");
    println!("  status          show link and alert state");
    println!("  exit            quit");
    println!("============================================");

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    let mut poll = tokio::time::interval(config.alerts.poll_interval());

    loop {
        tokio::select! {
            _ = poll.tick() => {
                manager.poll_retry().await;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, shutting down");
                break;
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if !handle_command(&mut manager, &channel, line.trim()).await? {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("failed to read console input: {e}");
                        break;
                    }
                }
            }
        }
    }

    channel.stop().await;
    println!("Bridge stopped");
    Ok(())
}

/// Returns false when the console asked to quit.
async fn handle_command(
    manager: &mut AlertManager,
    channel: &Arc<TransportChannel>,
    line: &str,
) -> Result<bool> {
    match line {
        "" => {}
        "exit" | "quit" => return Ok(false),
        "status" => {
            println!("{}", serde_json::to_string_pretty(&channel.status())?);
            match manager.active_alert() {
                Some(alert) => println!("{}", serde_json::to_string_pretty(&alert)?),
                None => println!("no active alert"),
            }
            for entry in channel.history().await.iter().rev().take(3) {
                println!(
                    "  [{}] message {} {}",
                    entry.timestamp, entry.message.message_id, entry.disposition
                );
            }
        }
        _ => {
            let (code, text) = match line.split_once(' ') {
                Some((code, text)) => (code.parse::<u8>().unwrap_or(3), text.trim()),
                None => (3, line),
            };
            match manager.on_detection(kind_from_code(code), text) {
                Disposition::Sent(id) => println!("queued as message {id}"),
                Disposition::Suppressed => println!("suppressed: same alert already outstanding"),
                Disposition::CooldownHeld => println!("held: cooldown for this kind not elapsed"),
                Disposition::QueueRejected => println!("rejected: outbound queue is full"),
            }
        }
    }
    Ok(true)
}

/// One-shot mode: queue a single message, give the worker a moment to
/// drain it, then exit.
async fn send_test_message(
    channel: &Arc<TransportChannel>,
    text: &str,
    code: u8,
) -> Result<()> {
    channel.connect().await?;
    channel.start().await?;

    let ids = MessageIdGen::new();
    let message = EmergencyMessage::new(text, kind_from_code(code), ids.next_id());
    let message_id = message.message_id;
    channel.enqueue(message)?;
    info!("Test message {message_id} queued");

    tokio::time::sleep(Duration::from_secs(2)).await;

    match channel.ack_status(message_id).await {
        Some(record) => info!("Message {message_id} status: {}", record.status),
        None => warn!("Message {message_id} was not sent yet (link down?)"),
    }

    channel.stop().await;
    Ok(())
}
