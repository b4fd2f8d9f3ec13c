use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rchat_client::{Client, ClientError, Command, DEFAULT_SERVER, RelayClient, Reply};
use rchat_core::{ArqConfig, Notice, SessionError};

#[derive(Parser, Debug)]
#[command(author, version, about = "Reliable chat client over an HTTP relay")]
struct Args {
    /// Relay base URL.
    #[arg(long, default_value = DEFAULT_SERVER)]
    server: String,

    /// Name to connect as.
    #[arg(long)]
    user: String,

    /// Peer to talk to first.
    #[arg(long)]
    peer: Option<String>,

    /// TOML file with sliding-window settings.
    #[arg(long)]
    config: Option<PathBuf>,
}

const HELP: &str = "\
commands:
  <text>                send a message to the current peer
  /peer NAME            switch peer
  /file PATH            send a file to the current peer
  /save FILE SENDER     write a completed incoming file to disk
  /get FILE             download a file addressed to you from the relay
  /users                refresh the user list
  /status               show window counters
  /quit                 disconnect";

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging();

    let config = match &args.config {
        Some(path) => load_config(path).await?,
        None => ArqConfig::default(),
    };
    let relay = RelayClient::new(&args.server);
    info!("Connecting to {}", relay.base_url());

    let (client, mut notices) =
        Client::connect(relay, &args.user, config).context("Failed to start session")?;
    if let Some(peer) = &args.peer {
        client.select_peer(peer).await?;
    }

    let printer = tokio::spawn(async move {
        while let Some(notice) = notices.recv().await {
            if let Err(err) = show_notice(notice).await {
                warn!("{:#}", err);
            }
        }
    });

    println!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        if let Err(err) = handle_line(&client, line).await {
            match err.downcast_ref::<ClientError>() {
                Some(ClientError::Session(SessionError::WindowFull {
                    in_flight,
                    capacity,
                })) => println!("window full ({in_flight}/{capacity}), try again shortly"),
                _ => println!("error: {err:#}"),
            }
        }
    }

    client.disconnect().await?;
    printer.await.context("Notice printer panicked")?;
    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn load_config(path: &Path) -> Result<ArqConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    toml::from_str(&content).context("Failed to parse config file")
}

async fn handle_line(client: &Client, line: &str) -> Result<()> {
    let (command, rest) = match line.strip_prefix('/') {
        Some(cmd) => cmd.split_once(' ').unwrap_or((cmd, "")),
        None => {
            let seq = client.send_text(line).await?;
            println!("[sent #{seq}]");
            return Ok(());
        }
    };
    let rest = rest.trim();

    match command {
        "peer" => {
            client.select_peer(rest).await?;
            println!("now chatting with {rest}");
        }
        "file" => {
            let path = Path::new(rest);
            let bytes = tokio::fs::read(path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .context("File path has no usable name")?;
            let chunks = client.send_file(name, bytes).await?;
            println!("[uploading {name} in {chunks} chunks]");
        }
        "save" => {
            let (file_name, sender) = rest
                .split_once(' ')
                .context("usage: /save FILE SENDER")?;
            let command = Command::Assemble {
                file_name: file_name.to_string(),
                sender: sender.trim().to_string(),
            };
            if let Reply::File(bytes) = client.request(command).await? {
                tokio::fs::write(file_name, &bytes)
                    .await
                    .with_context(|| format!("Failed to write {file_name}"))?;
                println!("[saved {file_name}, {} bytes]", bytes.len());
            }
        }
        "get" => {
            client.request(Command::Download(rest.to_string())).await?;
        }
        "users" => {
            client.request(Command::RefreshUsers).await?;
        }
        "status" => {
            let status = client.status().await?;
            println!(
                "window {}/{} in flight (base {}, next {}), {} chunks queued, received up to {}",
                status.in_flight,
                status.capacity,
                status.base,
                status.next,
                status.queued_chunks,
                status.high_water
            );
        }
        _ => println!("{HELP}"),
    }
    Ok(())
}

async fn show_notice(notice: Notice) -> Result<()> {
    match notice {
        Notice::Connected { user } => println!("connected as {user}"),
        Notice::MessageReceived(segment) => match segment.payload {
            rchat_core::Payload::Text(text) => println!("{}: {}", segment.sender, text),
            rchat_core::Payload::FileChunk(chunk) => println!(
                "[{} chunk {}/{} from {}]",
                chunk.file_name,
                chunk.index + 1,
                chunk.total,
                segment.sender
            ),
        },
        Notice::FileReady {
            file_name, sender, ..
        } => println!("[{file_name} from {sender} is complete: /save {file_name} {sender}]"),
        Notice::FileDownloaded { file_name, bytes } => {
            let target = format!("downloaded_{file_name}");
            tokio::fs::write(&target, &bytes)
                .await
                .with_context(|| format!("Failed to write {target}"))?;
            println!("[downloaded {file_name} to {target}, {} bytes]", bytes.len());
        }
        Notice::PermanentSendFailure { seq, retries } => {
            println!("[message #{seq} failed after {retries} retries]")
        }
        Notice::TransportError {
            operation, reason, ..
        } => println!("[{operation:?} failed: {reason}]"),
        Notice::UsersUpdated(users) => println!("[online: {}]", users.join(", ")),
        Notice::Disconnected => println!("disconnected"),
    }
    Ok(())
}
