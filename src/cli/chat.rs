//! Interactive chat loop: joins a room, prints incoming frames, and
//! relays stdin lines as messages.

use std::error::Error;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::warn;

use crate::api::RoomClient;
use crate::cli::{credential_provider, resolve_server_url};
use crate::core::config::Config;
use crate::core::connection::ConnectionManager;
use crate::core::frame::{
    InboundFrame, OutboundFrame, KIND_MESSAGE, KIND_PRESENCE_SNAPSHOT, KIND_USER_PRESENCE,
    STATUS_ONLINE,
};
use crate::core::transport::WebSocketFactory;
use crate::logging::TranscriptLog;

/// Upper bound on the initial connect, covering the full retry
/// schedule (1+2+4+8+16 s) with margin.
const CONNECT_WINDOW: Duration = Duration::from_secs(45);

pub async fn run_chat(
    room_flag: Option<String>,
    server_flag: Option<String>,
    token_flag: Option<String>,
    log_file: Option<String>,
) -> Result<(), Box<dyn Error>> {
    let config = Config::load()?;
    let server_url = resolve_server_url(&config, server_flag.as_deref());
    let credentials = credential_provider(token_flag);
    let mut transcript = TranscriptLog::new(log_file)?;

    // The connector declines silently on credential problems; surface
    // them here instead of waiting on a connection that will never open.
    match credentials.credential(false).await {
        Ok(Some(credential)) if credential.registration_complete() => {}
        Ok(Some(_)) => {
            return Err("account registration incomplete; run 'charla auth' to finish signup".into())
        }
        Ok(None) => return Err("no credential available; run 'charla auth' first".into()),
        Err(e) => return Err(format!("credential store error: {e}").into()),
    }

    let room_id = match room_flag {
        Some(room) => room,
        None => {
            let api = RoomClient::new(&server_url, credentials.clone())?;
            let rooms = api.public_rooms().await?;
            match rooms.into_iter().next() {
                Some(room) => room.id,
                None => return Err("no public rooms available; pass a room id".into()),
            }
        }
    };

    let manager = ConnectionManager::new(
        &server_url,
        credentials,
        std::sync::Arc::new(WebSocketFactory),
    );
    let mut subscription = manager.subscribe();
    let mut state = manager.connection_state();
    manager.connect().await;
    if !manager.is_connected() {
        eprintln!("* server unreachable, retrying...");
    }

    // Wait for the first successful open before joining the room. The
    // window outlasts the retry schedule, so a timeout means the
    // manager has given up.
    if !wait_until_connected(&mut state, CONNECT_WINDOW).await {
        manager.shutdown().await;
        return Err(format!("could not connect to {server_url}").into());
    }
    manager.send(&OutboundFrame::JoinRoom {
        room_id: room_id.clone(),
    })
    .await?;
    println!("Joined {room_id} on {server_url}. /quit to leave.");

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            frame = subscription.recv() => {
                match frame {
                    Some(frame) => render_frame(&frame, &transcript),
                    None => break,
                }
            }
            line = stdin.next_line() => {
                let line = match line? {
                    Some(line) => line,
                    None => break,
                };
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match trimmed {
                    "/quit" => break,
                    "/who" => {
                        let users = manager.online_users();
                        if users.is_empty() {
                            println!("* nobody else is online");
                        } else {
                            for user in users {
                                println!("* {} is online", user.name);
                            }
                        }
                    }
                    "/log" => match transcript.toggle() {
                        Ok(status) => println!("* {status}"),
                        Err(e) => eprintln!("* {e}"),
                    },
                    _ => {
                        let frame = OutboundFrame::Message {
                            content: trimmed.to_string(),
                            room_id: room_id.clone(),
                            reply_content: None,
                        };
                        if let Err(e) = manager.send(&frame).await {
                            eprintln!("* send failed: {e}");
                        }
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    manager.shutdown().await;
    println!("Left {room_id}.");
    Ok(())
}

async fn wait_until_connected(state: &mut watch::Receiver<bool>, window: Duration) -> bool {
    tokio::time::timeout(window, async {
        while !*state.borrow_and_update() {
            if state.changed().await.is_err() {
                return false;
            }
        }
        true
    })
    .await
    .unwrap_or(false)
}

fn render_frame(frame: &InboundFrame, transcript: &TranscriptLog) {
    let line = match frame.kind.as_str() {
        KIND_MESSAGE => match frame.message() {
            Ok(message) => Some(format!(
                "[{}] {}: {}",
                message.created_at.format("%H:%M"),
                message.sender_name,
                message.content
            )),
            Err(e) => {
                warn!(error = %e, "undisplayable message frame");
                None
            }
        },
        KIND_USER_PRESENCE => match frame.presence_user() {
            Ok(user) => {
                let verb = if frame.status.as_deref() == Some(STATUS_ONLINE) {
                    "joined"
                } else {
                    "left"
                };
                Some(format!("* {} {}", user.name, verb))
            }
            Err(e) => {
                warn!(error = %e, "undisplayable presence frame");
                None
            }
        },
        KIND_PRESENCE_SNAPSHOT => match frame.presence_snapshot() {
            Ok(snapshot) => Some(format!("* {} online", snapshot.users.len())),
            Err(_) => None,
        },
        _ => None,
    };

    if let Some(line) = line {
        println!("{line}");
        if let Err(e) = transcript.record(&line) {
            warn!(error = %e, "transcript write failed");
        }
    }
}
