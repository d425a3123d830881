// Ferry peer client: line-oriented surface over the client core.

mod client;
mod config;

use std::path::PathBuf;

use anyhow::Context;
use client::{Command, Event};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

const VERSION: &str = env!("CARGO_PKG_VERSION");

const COMMANDS: &str = "\
commands:
    <text>               broadcast chat to every connected peer
    /msg <id> <text>     direct chat to one peer
    /send <id> <path>    offer a file to one peer
    /accept <n>          accept pending offer #n
    /reject <n>          reject pending offer #n
    /list                show pending offers and uploads
    /quit                leave";

fn print_help() {
    println!("ferry-client {} — chat and file transfer through a ferry hub", VERSION);
    println!();
    println!("USAGE:");
    println!("    ferry-client [ADDRESS]");
    println!();
    println!("ARGS:");
    println!("    ADDRESS          Hub address (default: 127.0.0.1:8888)");
    println!();
    println!("OPTIONS:");
    println!("    -h, --help       Print this help message and exit");
    println!("    -V, --version    Print version and exit");
    println!();
    println!("DESCRIPTION:");
    println!("    Connects to a ferry hub, joins the chat, and exchanges files with");
    println!("    other peers. Incoming files must be accepted before any data");
    println!("    flows; accepted files land in the storage directory.");
    println!();
    println!("{}", COMMANDS);
    println!();
    println!("CONFIGURATION:");
    println!("    Config file (optional, first found wins):");
    println!("      ~/.config/ferry/client.toml");
    println!("      /etc/ferry/client.toml");
    println!();
    println!("    Example client.toml:");
    println!("      server_addr = \"127.0.0.1:8888\"");
    println!("      name = \"alice\"");
    println!("      storage_dir = \"storage\"");
    println!();
    println!("ENVIRONMENT VARIABLES (override config file):");
    println!("    FERRY_SERVER_ADDR    Hub address");
    println!("    FERRY_NAME           Display name");
    println!("    FERRY_STORAGE_DIR    Download directory");
}

fn main() -> anyhow::Result<()> {
    let mut addr_arg: Option<String> = None;
    if let Some(arg) = std::env::args().nth(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("ferry-client {}", VERSION);
                return Ok(());
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            other if other.starts_with('-') => {
                eprintln!("ferry-client: unknown option '{}'\n", other);
                print_help();
                std::process::exit(1);
            }
            other => addr_arg = Some(other.to_owned()),
        }
    }

    // Logs go to stderr so they never tangle with the chat surface.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cfg = config::load();
    let opts = client::ClientOptions {
        server_addr: addr_arg.unwrap_or(cfg.server_addr),
        name: cfg.name,
        storage_dir: cfg.storage_dir,
        ..client::ClientOptions::default()
    };

    println!("connecting to {} as {}...", opts.server_addr, opts.name);

    let rt = tokio::runtime::Runtime::new().context("failed to start runtime")?;
    rt.block_on(async {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let mut session = tokio::spawn(client::run(opts, cmd_rx, event_tx));

        let stdin_tx = cmd_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match parse_line(&line) {
                    Ok(Some(cmd)) => {
                        let quitting = matches!(cmd, Command::Quit);
                        if stdin_tx.send(cmd).await.is_err() || quitting {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(msg) => println!("{msg}"),
                }
            }
        });

        let mut session_done = false;
        loop {
            tokio::select! {
                biased;
                event = event_rx.recv() => match event {
                    Some(event) => render_event(&event),
                    None => break,
                },
                res = &mut session, if !session_done => {
                    session_done = true;
                    res.context("client task failed")??;
                }
                _ = tokio::signal::ctrl_c(), if !session_done => {
                    let _ = cmd_tx.send(Command::Quit).await;
                }
            }
        }
        if !session_done {
            session.await.context("client task failed")??;
        }
        Ok(())
    })
}

fn parse_line(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    if !line.starts_with('/') {
        return Ok(Some(Command::Chat {
            target: None,
            content: line.to_owned(),
        }));
    }
    let mut parts = line.splitn(3, char::is_whitespace);
    let verb = parts.next().unwrap_or_default();
    match verb {
        "/msg" => {
            let (Some(id), Some(text)) = (parts.next(), parts.next()) else {
                return Err("usage: /msg <id> <text>".to_owned());
            };
            if id.is_empty() {
                return Err("usage: /msg <id> <text>".to_owned());
            }
            Ok(Some(Command::Chat {
                target: Some(id.to_owned()),
                content: text.to_owned(),
            }))
        }
        "/send" => {
            let (Some(id), Some(path)) = (parts.next(), parts.next()) else {
                return Err("usage: /send <id> <path>".to_owned());
            };
            if id.is_empty() {
                return Err("usage: /send <id> <path>".to_owned());
            }
            Ok(Some(Command::SendFile {
                target: id.to_owned(),
                path: PathBuf::from(path),
            }))
        }
        "/accept" | "/reject" => {
            let Some(n) = parts.next().and_then(|s| s.parse::<u32>().ok()) else {
                return Err(format!("usage: {verb} <n>"));
            };
            Ok(Some(if verb == "/accept" {
                Command::Accept(n)
            } else {
                Command::Reject(n)
            }))
        }
        "/list" => Ok(Some(Command::List)),
        "/quit" => Ok(Some(Command::Quit)),
        "/help" => Err(COMMANDS.to_owned()),
        other => Err(format!("unknown command '{other}' — /help for the list")),
    }
}

fn render_event(event: &Event) {
    match event {
        Event::Connected { peer_id } => println!("connected, your id is {peer_id}"),
        Event::Chat {
            sender,
            content,
            direct,
        } => {
            if *direct {
                println!("[{sender} → you] {content}");
            } else {
                println!("[{sender}] {content}");
            }
        }
        Event::Offer {
            ordinal,
            sender,
            file_name,
            size,
        } => println!(
            "incoming file #{ordinal}: {file_name} ({size} bytes) from {sender} — /accept {ordinal} or /reject {ordinal}"
        ),
        Event::OfferExpired { ordinal, file_name } => {
            println!("offer #{ordinal} ({file_name}) is gone")
        }
        Event::UploadStarted { file_name, .. } => println!("sending {file_name}..."),
        Event::UploadDone { file_name, bytes } => println!("sent {file_name} ({bytes} bytes)"),
        Event::DownloadDone {
            file_name,
            path,
            bytes,
        } => println!("saved {file_name} ({bytes} bytes) to {}", path.display()),
        Event::TransferFailed { file_name, reason } => {
            println!("transfer failed: {file_name}: {reason}")
        }
        Event::Listing { offers, uploads } => {
            if offers.is_empty() && uploads.is_empty() {
                println!("nothing pending");
            }
            for o in offers {
                println!(
                    "offer #{}: {} ({} bytes) from {}",
                    o.ordinal, o.file_name, o.size, o.sender
                );
            }
            for u in uploads {
                println!("upload: {} to {} ({})", u.file_name, u.target, u.state);
            }
        }
        Event::Notice(text) => println!("{text}"),
        Event::ServerError(description) => println!("server: {description}"),
        Event::Disconnected { reason } => println!("disconnected: {reason}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_broadcast_chat() {
        match parse_line("hello there").unwrap().unwrap() {
            Command::Chat { target, content } => {
                assert!(target.is_none());
                assert_eq!(content, "hello there");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn msg_requires_target_and_text() {
        match parse_line("/msg a1b2c3d4 hi you").unwrap().unwrap() {
            Command::Chat { target, content } => {
                assert_eq!(target.as_deref(), Some("a1b2c3d4"));
                assert_eq!(content, "hi you");
            }
            other => panic!("unexpected command: {other:?}"),
        }
        assert!(parse_line("/msg a1b2c3d4").is_err());
    }

    #[test]
    fn send_accept_reject_parse() {
        assert!(matches!(
            parse_line("/send a1b2c3d4 /tmp/x.bin").unwrap().unwrap(),
            Command::SendFile { .. }
        ));
        assert!(matches!(
            parse_line("/accept 2").unwrap().unwrap(),
            Command::Accept(2)
        ));
        assert!(matches!(
            parse_line("/reject 9").unwrap().unwrap(),
            Command::Reject(9)
        ));
        assert!(parse_line("/accept x").is_err());
    }

    #[test]
    fn blank_lines_do_nothing() {
        assert!(parse_line("   ").unwrap().is_none());
    }

    #[test]
    fn unknown_slash_command_is_an_error() {
        assert!(parse_line("/frobnicate").is_err());
    }
}
