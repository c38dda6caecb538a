//! Transport abstraction over the persistent server connection
//!
//! The connection manager never touches a socket directly: it asks a
//! [`TransportFactory`] for a write handle plus an event stream, which
//! keeps the manager testable with scripted transports. The production
//! factory speaks WebSocket via tokio-tungstenite.

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::error::Error as StdError;
use std::fmt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

/// Lifecycle events emitted by a live transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// One inbound text frame, undecoded.
    Message(String),
    /// The transport is gone; no further events will arrive.
    Closed { reason: Option<String> },
}

#[derive(Debug)]
pub enum TransportError {
    Connect(tokio_tungstenite::tungstenite::Error),
    Send(tokio_tungstenite::tungstenite::Error),
    /// The transport was closed out from under the writer.
    Closed,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Connect(source) => write!(f, "websocket connect failed: {}", source),
            TransportError::Send(source) => write!(f, "websocket send failed: {}", source),
            TransportError::Closed => write!(f, "transport closed"),
        }
    }
}

impl StdError for TransportError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            TransportError::Connect(source) | TransportError::Send(source) => Some(source),
            TransportError::Closed => None,
        }
    }
}

/// Write half of an open connection.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, text: String) -> Result<(), TransportError>;
    async fn close(&mut self);
}

/// Opens transports to a given endpoint URL.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn open(
        &self,
        url: &str,
    ) -> Result<(Box<dyn Transport>, mpsc::UnboundedReceiver<TransportEvent>), TransportError>;
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

struct WebSocketTransport {
    sink: WsSink,
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.sink
            .send(Message::Text(text.into()))
            .await
            .map_err(TransportError::Send)
    }

    async fn close(&mut self) {
        if let Err(error) = self.sink.close().await {
            debug!(error = %error, "websocket close handshake failed");
        }
    }
}

/// Production factory: one WebSocket per `open` call, with a reader task
/// forwarding text frames until the peer goes away.
pub struct WebSocketFactory;

#[async_trait]
impl TransportFactory for WebSocketFactory {
    async fn open(
        &self,
        url: &str,
    ) -> Result<(Box<dyn Transport>, mpsc::UnboundedReceiver<TransportEvent>), TransportError>
    {
        let (stream, _response) = connect_async(url).await.map_err(TransportError::Connect)?;
        let (sink, mut read) = stream.split();
        let (events, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(message) = read.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        if events.send(TransportEvent::Message(text.to_string())).is_err() {
                            // Receiver gone, the manager moved on.
                            return;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        let reason = frame.map(|f| f.reason.to_string());
                        let _ = events.send(TransportEvent::Closed { reason });
                        return;
                    }
                    Ok(_) => {}
                    Err(error) => {
                        warn!(error = %error, "websocket read error");
                        let _ = events.send(TransportEvent::Closed {
                            reason: Some(error.to_string()),
                        });
                        return;
                    }
                }
            }
            let _ = events.send(TransportEvent::Closed { reason: None });
        });

        Ok((Box::new(WebSocketTransport { sink }), rx))
    }
}
