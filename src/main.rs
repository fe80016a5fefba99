//! Kommandozeilen-Host für callbridge
//!
//! Befehle auf stdin: `call <adresse>`, `hangup`, `mute`, `unmute`, `quit`

use anyhow::Context;
use callbridge::config::{PhoneConfig, UrlStore, ENV_SIGNALING_URL};
use callbridge::session::PhoneEvent;
use callbridge::Phone;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Signaling-Server (ws:// oder wss://), sonst SIGNALING_URL oder die zuletzt benutzte URL
    #[arg(short, long)]
    url: Option<String>,

    /// Adresse, die angerufen wird sobald das lokale SDP bereit ist
    #[arg(short, long)]
    call: Option<String>,

    /// STUN/TURN Server (mehrfach angebbar)
    #[arg(long = "ice-server")]
    ice_servers: Vec<String>,

    /// Ton für `callTonePlay`
    #[arg(long)]
    tone: Option<String>,

    /// Keinen Ton abspielen lassen
    #[arg(long, default_value = "false")]
    no_tone: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    callbridge::init_logging();
    let args = Args::parse();

    let store = match UrlStore::open() {
        Ok(store) => Some(store),
        Err(e) => {
            tracing::warn!("Server URL will not be remembered: {}", e);
            None
        }
    };

    let stored = store
        .as_ref()
        .and_then(|s| s.load().map_err(|e| tracing::warn!("{}", e)).ok().flatten());
    let url = args
        .url
        .clone()
        .or_else(|| std::env::var(ENV_SIGNALING_URL).ok())
        .or(stored);

    let mut config = PhoneConfig::from_env_with_url(url)
        .context("Usage: callbridge --url wss://host/path")?
        .with_ice_servers(args.ice_servers.clone());
    if let Some(tone) = args.tone.clone() {
        config = config.with_tone(Some(tone));
    }
    if args.no_tone {
        config = config.with_tone(None);
    }

    if let Some(store) = &store {
        if let Err(e) = store.save(&config.signaling_url) {
            tracing::warn!("Failed to remember server URL: {}", e);
        }
    }

    let mut phone = Phone::new(config);
    let mut events = phone.subscribe();
    phone.connect().await.context("Failed to connect")?;

    let mut dial = args.call.clone();
    let mut commands = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let ready = matches!(event, PhoneEvent::ReadyToCall(true));
                    let lost = matches!(event, PhoneEvent::ReadyToCall(false)) && !phone.is_connected();
                    print_event(&event);

                    if ready {
                        if let Some(address) = dial.take() {
                            phone.place_call(address)?;
                        }
                    }
                    if lost {
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => tracing::warn!("Missed {} phone events", n),
                Err(RecvError::Closed) => break,
            },

            line = commands.next_line(), if stdin_open => match line? {
                Some(line) => {
                    if !run_command(&mut phone, line.trim())? {
                        break;
                    }
                }
                // stdin geschlossen, weiterlaufen bis Ctrl+C
                None => stdin_open = false,
            },

            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
        }
    }

    phone.disconnect();
    Ok(())
}

/// Führt einen stdin-Befehl aus, `false` beendet das Programm
fn run_command(phone: &mut Phone, line: &str) -> anyhow::Result<bool> {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("call"), Some(address)) => phone.place_call(address)?,
        (Some("hangup"), None) => phone.hangup()?,
        (Some("mute"), None) => phone.set_muted(true)?,
        (Some("unmute"), None) => phone.set_muted(false)?,
        (Some("quit"), None) => return Ok(false),
        (None, _) => {}
        _ => println!("commands: call <address> | hangup | mute | unmute | quit"),
    }
    Ok(true)
}

fn print_event(event: &PhoneEvent) {
    match event {
        PhoneEvent::Status(status) => println!("status: {}", status),
        PhoneEvent::ReadyToCall(ready) => println!("ready to call: {}", ready),
        PhoneEvent::LocalStream(info) => println!(
            "local audio: {} Hz, {} channel(s), track {}",
            info.sample_rate, info.channels, info.track_id
        ),
        PhoneEvent::RemoteStream(stream) => {
            println!("remote audio: {} ({})", stream.track_id, stream.mime_type)
        }
        PhoneEvent::CallStateChanged { session_id, state } => match session_id {
            Some(id) => println!("call {}: {:?}", id, state),
            None => println!("call: {:?}", state),
        },
        PhoneEvent::Error(error) => eprintln!("error: {}", error),
    }
}
