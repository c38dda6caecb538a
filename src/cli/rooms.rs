use std::error::Error;

use crate::api::RoomClient;
use crate::cli::{credential_provider, resolve_server_url};
use crate::core::config::Config;

pub async fn list_rooms(
    server_flag: Option<String>,
    token_flag: Option<String>,
) -> Result<(), Box<dyn Error>> {
    let config = Config::load()?;
    let server_url = resolve_server_url(&config, server_flag.as_deref());
    let api = RoomClient::new(&server_url, credential_provider(token_flag))?;

    let rooms = api.public_rooms().await?;
    if rooms.is_empty() {
        println!("No public rooms on {server_url}");
        return Ok(());
    }

    println!("Public rooms on {server_url}:");
    for room in rooms {
        let name = room.room_name.as_deref().unwrap_or("(unnamed)");
        let last = room
            .last_message_sent
            .map(|ts| ts.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "  {:<24} {:<20} {:>3} members  last message: {}",
            room.id,
            name,
            room.member_ids.len(),
            last
        );
    }
    Ok(())
}
