//! hdlcd-client - command-line client for the hdlcd daemon
//!
//! Opens a session on one device and monitors traffic, sends payloads,
//! exchanges hex lines with the peer or asks the daemon for a port reset.

use anyhow::{bail, Context};
use bytes::{Bytes, BytesMut};
use chrono::Local;
use clap::{Parser, Subcommand, ValueEnum};
use futures::{SinkExt, StreamExt};
use hdlcd_core::core::access::{AccessMode, PacketCodec, SessionHeader, SessionKind};
use hdlcd_core::core::hdlc::{ControlPacket, DataPacket, Direction, Packet};
use hdlcd_core::core::serial;
use std::process::ExitCode;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::codec::Framed;

/// Output format
#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// Human-readable text
    Text,
    /// JSON lines for scripting
    Json,
    /// Hex dump
    Hex,
}

/// Session kinds offered on the command line
#[derive(Debug, Clone, Copy, ValueEnum)]
enum MonitorKind {
    /// Payloads, read-only
    Payload,
    /// Link events only
    Control,
    /// Every frame as raw octets
    Raw,
    /// Every frame decoded to text
    Dissected,
}

impl From<MonitorKind> for SessionKind {
    fn from(kind: MonitorKind) -> Self {
        match kind {
            MonitorKind::Payload => SessionKind::Payload,
            MonitorKind::Control => SessionKind::Control,
            MonitorKind::Raw => SessionKind::Raw,
            MonitorKind::Dissected => SessionKind::Dissected,
        }
    }
}

/// hdlcd client
#[derive(Parser, Debug)]
#[command(
    name = "hdlcd-client",
    version,
    about = "Talk to serial devices served by hdlcd",
    long_about = None
)]
struct Cli {
    /// Daemon address
    #[arg(short, long, env = "HDLCD_SERVER", default_value = "127.0.0.1:5001")]
    server: String,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Quiet mode (errors only)
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List serial ports on this machine
    ListPorts,

    /// Print traffic of a device
    Monitor {
        /// Device path or name as served by the daemon
        #[arg(short, long)]
        device: String,

        /// What to watch
        #[arg(short, long, value_enum, default_value_t = MonitorKind::Payload)]
        kind: MonitorKind,

        /// Skip what the daemon sent to the peer
        #[arg(long)]
        no_sent: bool,

        /// Skip what the peer sent
        #[arg(long)]
        no_received: bool,

        /// Stop after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Send one payload, then print replies for a while
    Send {
        /// Device path or name as served by the daemon
        #[arg(short, long)]
        device: String,

        /// Payload as hex, e.g. 0102ff
        #[arg(long, conflicts_with = "text")]
        hex: Option<String>,

        /// Payload as text
        #[arg(long)]
        text: Option<String>,

        /// Send as unnumbered information (no retransmission)
        #[arg(long)]
        unreliable: bool,

        /// Milliseconds to wait for replies
        #[arg(short, long, default_value = "1000")]
        wait: u64,
    },

    /// Send hex lines from stdin, print received payloads as hex lines
    Exchange {
        /// Device path or name as served by the daemon
        #[arg(short, long)]
        device: String,

        /// Milliseconds to keep printing replies after stdin ends
        #[arg(short, long, default_value = "1000")]
        wait: u64,
    },

    /// Ask the daemon to close and reopen the device
    Reset {
        /// Device path or name as served by the daemon
        #[arg(short, long)]
        device: String,
    },

    /// Print the current port status of a device
    Status {
        /// Device path or name as served by the daemon
        #[arg(short, long)]
        device: String,
    },
}

type Session = Framed<TcpStream, PacketCodec>;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(&cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: &Cli) -> anyhow::Result<()> {
    match &cli.command {
        Commands::ListPorts => list_ports(cli),
        Commands::Monitor {
            device,
            kind,
            no_sent,
            no_received,
            timeout,
        } => {
            let header = SessionHeader::new(device.as_str(), (*kind).into()).deliver(!no_sent, !no_received);
            let session = open(cli, header).await?;
            monitor(cli, session, timeout.map(Duration::from_secs)).await
        }
        Commands::Send {
            device,
            hex,
            text,
            unreliable,
            wait,
        } => {
            let payload = match (hex, text) {
                (Some(hex), _) => Bytes::from(hex::decode(hex.replace(' ', "")).context("Invalid hex payload")?),
                (None, Some(text)) => Bytes::from(text.clone()),
                (None, None) => bail!("Nothing to send, use --hex or --text"),
            };
            let header = SessionHeader::payload(device.as_str(), AccessMode::ReadWrite);
            let mut session = open(cli, header).await?;
            session
                .send(Packet::Data(DataPacket {
                    payload,
                    reliable: !unreliable,
                    direction: Direction::Sent,
                }))
                .await?;
            monitor(cli, session, Some(Duration::from_millis(*wait))).await
        }
        Commands::Exchange { device, wait } => {
            let header = SessionHeader::payload(device.as_str(), AccessMode::ReadWrite);
            let session = open(cli, header).await?;
            exchange(cli, session, Duration::from_millis(*wait)).await
        }
        Commands::Reset { device } => {
            let mut session = open(cli, SessionHeader::new(device.as_str(), SessionKind::Control)).await?;
            session.send(ControlPacket::PortReset.into()).await?;
            // Echo round trip confirms the daemon has read the request
            session.send(ControlPacket::Echo.into()).await?;
            while let Some(packet) = session.next().await {
                let packet = packet?;
                if packet == Packet::Control(ControlPacket::Echo) {
                    break;
                }
                print_packet(cli, &packet);
            }
            if !cli.quiet {
                eprintln!("Reset requested.");
            }
            Ok(())
        }
        Commands::Status { device } => {
            let mut session = open(cli, SessionHeader::new(device.as_str(), SessionKind::Control)).await?;
            loop {
                match session.next().await {
                    Some(Ok(packet @ Packet::Control(ControlPacket::PortStatus(_)))) => {
                        print_packet(cli, &packet);
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return Err(err.into()),
                    None => bail!("Daemon closed the session"),
                }
            }
        }
    }
}

/// Connect and send the session header
async fn open(cli: &Cli, header: SessionHeader) -> anyhow::Result<Session> {
    let mut stream = TcpStream::connect(&cli.server)
        .await
        .with_context(|| format!("Cannot connect to {}", cli.server))?;
    stream.set_nodelay(true)?;

    let mut buf = BytesMut::new();
    header.encode(&mut buf)?;
    stream.write_all(&buf).await?;

    if !cli.quiet {
        eprintln!("Session {} on {} via {}", header.kind, header.device, cli.server);
    }
    Ok(Framed::new(stream, PacketCodec))
}

async fn monitor(cli: &Cli, mut session: Session, limit: Option<Duration>) -> anyhow::Result<()> {
    let deadline = limit.map(|limit| Instant::now() + limit);
    loop {
        let next = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, session.next()).await {
                Ok(next) => next,
                Err(_) => return Ok(()),
            },
            None => tokio::select! {
                next = session.next() => next,
                _ = tokio::signal::ctrl_c() => return Ok(()),
            },
        };
        match next {
            Some(Ok(packet)) => print_packet(cli, &packet),
            Some(Err(err)) => return Err(err.into()),
            None => {
                if !cli.quiet {
                    eprintln!("Daemon closed the session.");
                }
                return Ok(());
            }
        }
    }
}

async fn exchange(cli: &Cli, session: Session, linger: Duration) -> anyhow::Result<()> {
    let (mut sink, mut stream) = session.split();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut input_open = true;
    let mut deadline: Option<Instant> = None;
    loop {
        tokio::select! {
            line = lines.next_line(), if input_open => match line? {
                Some(line) => {
                    let line = line.trim();
                    if line.is_empty() || line.starts_with('#') {
                        continue;
                    }
                    let payload = hex::decode(line.replace(' ', ""))
                        .with_context(|| format!("Invalid hex line: {line}"))?;
                    sink.send(Packet::Data(DataPacket {
                        payload: payload.into(),
                        reliable: true,
                        direction: Direction::Sent,
                    }))
                    .await?;
                }
                None => {
                    input_open = false;
                    deadline = Some(Instant::now() + linger);
                }
            },
            packet = stream.next() => match packet {
                Some(Ok(Packet::Data(data))) => println!("{}", hex::encode(&data.payload)),
                Some(Ok(Packet::Control(control))) => {
                    if !cli.quiet {
                        eprintln!("-- {}", describe(&control));
                    }
                }
                Some(Err(err)) => return Err(err.into()),
                None => return Ok(()),
            },
            () = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                return Ok(());
            }
        }
    }
}

fn print_packet(cli: &Cli, packet: &Packet) {
    let now = Local::now();
    match cli.format {
        OutputFormat::Json => {
            let value = match packet {
                Packet::Data(data) => serde_json::json!({
                    "time": now.to_rfc3339(),
                    "type": "data",
                    "direction": data.direction,
                    "reliable": data.reliable,
                    "payload": hex::encode(&data.payload),
                }),
                Packet::Control(control) => serde_json::json!({
                    "time": now.to_rfc3339(),
                    "type": "control",
                    "control": format!("{control:?}"),
                }),
            };
            println!("{value}");
        }
        OutputFormat::Hex | OutputFormat::Text => {
            let stamp = now.format("%H:%M:%S%.3f");
            match packet {
                Packet::Data(data) => {
                    let arrow = match data.direction {
                        Direction::Received => "<<",
                        Direction::Sent => ">>",
                    };
                    let kind = if data.reliable { "I " } else { "UI" };
                    let body = match cli.format {
                        OutputFormat::Text if data.payload.is_ascii() => {
                            String::from_utf8_lossy(&data.payload).into_owned()
                        }
                        _ => hex_dump(&data.payload),
                    };
                    println!("{stamp} {arrow} {kind} {body}");
                }
                Packet::Control(control) => println!("{stamp} -- {}", describe(control)),
            }
        }
    }
}

fn describe(control: &ControlPacket) -> String {
    match control {
        ControlPacket::Connected => "connected".to_string(),
        ControlPacket::Disconnected(reason) => format!("disconnected ({reason})"),
        ControlPacket::PortStatus(status) => format!(
            "status alive={} connected={} flow_suspended={}",
            status.alive, status.connected, status.flow_suspended
        ),
        ControlPacket::Overflow { dropped } => format!("overflow, {dropped} packets dropped"),
        ControlPacket::Echo => "echo".to_string(),
        ControlPacket::KeepAlive => "keepalive".to_string(),
        ControlPacket::PortReset => "port reset".to_string(),
    }
}

fn hex_dump(data: &[u8]) -> String {
    data.iter()
        .map(|byte| format!("{byte:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn list_ports(cli: &Cli) -> anyhow::Result<()> {
    let ports = serial::list_ports()?;

    if ports.is_empty() {
        if !cli.quiet {
            println!("No serial ports found.");
        }
        return Ok(());
    }

    match cli.format {
        OutputFormat::Json => {
            let json: Vec<serde_json::Value> = ports
                .iter()
                .map(|p| {
                    serde_json::json!({
                        "name": p.port_name,
                        "type": format!("{:?}", p.port_type)
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        _ => {
            for port in &ports {
                println!("{} [{:?}]", port.port_name, port.port_type);
            }
        }
    }

    Ok(())
}
