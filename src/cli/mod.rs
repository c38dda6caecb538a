//! Command-line interface parsing and handling
//!
//! This module handles parsing command-line arguments and executing the appropriate commands.

pub mod chat;
pub mod rooms;

use std::error::Error;
use std::io::Write as _;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::api::RoomClient;
use crate::auth::{Claims, KeyringCredentials, StaticCredentials};
use crate::cli::chat::run_chat;
use crate::cli::rooms::list_rooms;
use crate::core::config::Config;

#[derive(Parser)]
#[command(name = "charla")]
#[command(about = "A terminal chat client for charla servers")]
#[command(
    long_about = "Charla is a terminal client for real-time chat rooms. It keeps a WebSocket \
to the server, reconnects with exponential backoff when the link drops, and \
tracks who is online in the current room.\n\n\
Authentication:\n\
  Use 'charla auth' to store your bearer token securely in the system keyring.\n\n\
Environment Variables (fallback if no auth configured):\n\
  CHARLA_TOKEN       Bearer token for the chat server\n\
  CHARLA_SERVER_URL  Server base URL (defaults to http://localhost:8080)\n\n\
Chat commands:\n\
  /who              List users online in the room\n\
  /log              Toggle transcript pause/resume\n\
  /quit             Leave the chat"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Server base URL (overrides config and environment)
    #[arg(short = 's', long, global = true, value_name = "URL")]
    pub server: Option<String>,

    /// Bearer token to use instead of the keyring
    #[arg(short = 't', long, global = true, value_name = "TOKEN")]
    pub token: Option<String>,

    /// Write a chat transcript to the specified file
    #[arg(short = 'l', long, global = true)]
    pub log: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Store a bearer token in the system keyring
    Auth,
    /// Remove the stored bearer token
    Deauth,
    /// Join a room and chat (default)
    Chat {
        /// Room to join; defaults to the first public room
        room: Option<String>,
    },
    /// List public rooms on the server
    Rooms,
    /// Set configuration values
    Set {
        /// Configuration key to set
        key: String,
        /// Value to set for the key
        value: Option<String>,
    },
    /// Unset configuration values
    Unset {
        /// Configuration key to unset
        key: String,
    },
}

pub fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    tokio::runtime::Runtime::new()?.block_on(async_main())
}

async fn async_main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    match args.command.unwrap_or(Commands::Chat { room: None }) {
        Commands::Auth => {
            if let Err(e) = interactive_auth(&args.server).await {
                eprintln!("❌ Authentication failed: {e}");
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Deauth => {
            match KeyringCredentials::clear_token() {
                Ok(()) => println!("✅ Removed stored token"),
                Err(e) => {
                    eprintln!("❌ Deauthentication failed: {e}");
                    std::process::exit(1);
                }
            }
            Ok(())
        }
        Commands::Set { key, value } => {
            let mut config = Config::load()?;
            match key.as_str() {
                "server-url" => {
                    if let Some(val) = value {
                        config.server_url = Some(val.clone());
                        config.save()?;
                        println!("✅ Set server-url to: {val}");
                    } else {
                        println!(
                            "server-url: {}",
                            config.server_url.as_deref().unwrap_or("(default)")
                        );
                    }
                }
                _ => {
                    eprintln!("❌ Unknown config key: {key}");
                    std::process::exit(1);
                }
            }
            Ok(())
        }
        Commands::Unset { key } => {
            let mut config = Config::load()?;
            match key.as_str() {
                "server-url" => {
                    config.server_url = None;
                    config.save()?;
                    println!("✅ Unset server-url");
                }
                _ => {
                    eprintln!("❌ Unknown config key: {key}");
                    std::process::exit(1);
                }
            }
            Ok(())
        }
        Commands::Rooms => list_rooms(args.server, args.token).await,
        Commands::Chat { room } => run_chat(room, args.server, args.token, args.log).await,
    }
}

pub(crate) fn resolve_server_url(
    config: &Config,
    override_url: Option<&str>,
) -> String {
    match override_url {
        Some(url) => crate::utils::url::normalize_base_url(url),
        None => config.server_url(),
    }
}

pub(crate) fn credential_provider(
    token_flag: Option<String>,
) -> Arc<dyn crate::auth::CredentialProvider> {
    match token_flag {
        Some(token) => Arc::new(StaticCredentials::new(Some(token))),
        None => Arc::new(KeyringCredentials::new()),
    }
}

// The server accepts avatar indices 1 through 4.
fn parse_profile(input: &str) -> Result<u8, Box<dyn Error>> {
    let profile: u8 = input
        .trim()
        .parse()
        .map_err(|_| "profile picture must be a number between 1 and 4")?;
    if !(1..=4).contains(&profile) {
        return Err("profile picture must be between 1 and 4".into());
    }
    Ok(profile)
}

async fn interactive_auth(server_flag: &Option<String>) -> Result<(), Box<dyn Error>> {
    print!("Paste your bearer token: ");
    std::io::stdout().flush()?;
    let mut token = String::new();
    std::io::stdin().read_line(&mut token)?;
    let token = token.trim().to_string();
    if token.is_empty() {
        return Err("no token entered".into());
    }

    KeyringCredentials::store_token(&token)?;
    println!("✅ Token stored in keyring");

    // Accounts without name/profile claims are rejected by the chat
    // endpoint, so finish registration now if needed.
    let claims = Claims::from_token(&token);
    if claims.name.is_some() && claims.profile.is_some() {
        return Ok(());
    }

    println!("This account has not completed registration.");
    print!("Display name: ");
    std::io::stdout().flush()?;
    let mut name = String::new();
    std::io::stdin().read_line(&mut name)?;
    let name = name.trim().to_string();
    if name.is_empty() {
        return Err("no display name entered".into());
    }

    print!("Profile picture (1-4): ");
    std::io::stdout().flush()?;
    let mut profile = String::new();
    std::io::stdin().read_line(&mut profile)?;
    let profile = parse_profile(&profile)?;

    let config = Config::load()?;
    let server_url = resolve_server_url(&config, server_flag.as_deref());
    let api = RoomClient::new(&server_url, Arc::new(KeyringCredentials::new()))?;
    let response = api.register(&name, profile).await?;
    if !response.success {
        return Err(response
            .message
            .unwrap_or_else(|| "registration rejected".to_string())
            .into());
    }
    println!("✅ Registered as {name}");
    if response.requires_token_refresh {
        println!("⚠️  Your token predates registration. Obtain a fresh token and run 'charla auth' again.");
    }
    Ok(())
}
