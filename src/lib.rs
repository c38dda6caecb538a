//! Charla is a terminal client for real-time chat rooms.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`core`] owns the WebSocket lifecycle: the connection manager with
//!   its backoff-driven reconnect loop, presence tracking, the wire
//!   frame model, and persisted configuration.
//! - [`auth`] stores the bearer token in the system keyring and decodes
//!   the registration claims the server gates connections on.
//! - [`api`] is the REST client for the room and user endpoints that
//!   sit next to the WebSocket.
//! - [`cli`] parses arguments and runs the interactive chat loop.
//!
//! Runtime entrypoints live in the binary crate (`src/main.rs`) and route
//! through [`crate::cli::main`].

pub mod api;
pub mod auth;
pub mod cli;
pub mod core;
pub mod logging;
pub mod utils;
