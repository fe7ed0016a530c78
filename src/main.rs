#![deny(dead_code)] // DO NOT REMOVE THIS EVER

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, LevelFilter};

mod utils;

use chinwag::chat::{AttachmentUpload, ChatController, ChatEvent, HttpUploader, RestTransport};
use chinwag::config::ChatConfig;
use chinwag::models::Role;

/// Command line arguments for the chinwag demo client
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "chinwag: a terminal client for the two-party chat service",
    long_about = "Lists your conversation partners, opens one room and keeps it in sync:\n\
    history over REST, your own sends optimistically, the rest over the live push channel.\n\
    Type a line to send it, /quit to leave."
)]
struct Args {
    /// REST base URL, e.g. https://chat.example.com
    #[arg(long, value_name = "URL")]
    base_url: String,

    /// Bearer credential; falls back to CHINWAG_TOKEN, then prompts
    #[arg(long, value_name = "TOKEN")]
    token: Option<String>,

    /// Local participant id (numeric)
    #[arg(long, value_name = "ID")]
    user_id: String,

    /// Which side of the relationship this session acts as
    #[arg(long, value_parser = parse_role, default_value = "seeker")]
    role: Role,

    /// Contact id to open directly instead of the first one listed
    #[arg(long, value_name = "ID")]
    contact: Option<i64>,

    /// File to attach to the next sent message
    #[arg(long, value_name = "PATH")]
    attach: Option<PathBuf>,
}

fn parse_role(raw: &str) -> Result<Role, String> {
    raw.parse()
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();

    let role = args.role;
    let wanted_contact = args.contact;
    let mut attachment = args.attach;

    let token = match args.token.or_else(|| std::env::var("CHINWAG_TOKEN").ok()) {
        Some(token) => token,
        None => {
            eprintln!("Enter bearer token:");
            utils::read_line()?
        }
    };

    let config = ChatConfig::new(args.base_url, token, args.user_id, role);
    let transport = RestTransport::new(&config).context("building the transport")?;
    let uploader = HttpUploader::new(&config).context("building the uploader")?;
    let (controller, mut events) =
        ChatController::new(config, Arc::new(transport), Arc::new(uploader));
    let controller = Arc::new(controller);

    info!("fetching contacts as {}", role);
    let contacts = controller.refresh_contacts().await?;
    if contacts.is_empty() {
        println!("No contacts for this role yet.");
        return Ok(());
    }
    for contact in &contacts {
        println!("{}", utils::format_contact(contact));
    }

    let contact = match wanted_contact {
        Some(id) => contacts
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .context("no contact with that id")?,
        None => contacts[0].clone(),
    };
    println!("\nOpening conversation with {} (#{})", contact.name, contact.id);

    let room_key = controller.open_room(&contact).await?;
    for message in controller.messages(&room_key).await {
        println!("{}", utils::format_message(&message));
    }

    // Tail events in the background while the prompt loop runs.
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ChatEvent::MessageAdded { message, .. } => {
                    println!("{}", utils::format_message(&message))
                }
                ChatEvent::MessageUpdated { message, .. } => {
                    println!("{}", utils::format_message(&message))
                }
                ChatEvent::RoomRefreshed { room_key } => {
                    info!("{} caught up after a reconnect", room_key)
                }
                ChatEvent::RoomState { room_key, state } => info!("{} -> {:?}", room_key, state),
                ChatEvent::ChannelLost { room_key } => {
                    error!("live updates for {} are gone; sends still work", room_key)
                }
            }
        }
    });

    loop {
        let line = tokio::task::spawn_blocking(utils::read_line).await??;
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        let upload = match attachment.take() {
            Some(path) => match AttachmentUpload::from_path(&path) {
                Ok(upload) => Some(upload),
                Err(e) => {
                    error!("skipping the attachment: {}", e);
                    None
                }
            },
            None => None,
        };
        match controller.send_message(&contact, Some(line.as_str()), upload).await {
            Ok(local_id) => info!("sent as {}", local_id),
            Err(e) => error!("send failed: {}", e),
        }
    }

    controller.close_room().await;
    printer.abort();
    Ok(())
}
