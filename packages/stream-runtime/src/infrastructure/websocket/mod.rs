//! WebSocket Transport Adapter
//!
//! Implements the [`Connector`] port over `tokio-tungstenite` for `wss://`
//! endpoints. The dialed stream is split: the write half backs the
//! [`TransportSink`], the read half is pumped by a spawned task into the
//! transport event channel. Protocol pings are answered in the pump; text
//! frames surface as [`TransportEvent::Message`].

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::application::ports::{Connector, Dialed, TransportError, TransportEvent, TransportSink};

type WsWrite = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Capacity of the inbound transport event channel.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// WebSocket implementation of the transport port.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    /// Create a connector.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<Dialed, TransportError> {
        tracing::debug!(url = %url, "dialing websocket");
        let (stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::Dial(e.to_string()))?;

        let (write, read) = stream.split();
        let write = Arc::new(tokio::sync::Mutex::new(write));
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        tokio::spawn(pump(read, Arc::clone(&write), event_tx));

        Ok(Dialed {
            sink: Box::new(WebSocketSink { write }),
            events: event_rx,
        })
    }
}

/// Forward inbound frames to the transport event channel until the stream
/// ends or the receiver is dropped.
async fn pump(
    mut read: futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
    write: Arc<tokio::sync::Mutex<WsWrite>>,
    event_tx: mpsc::Sender<TransportEvent>,
) {
    while let Some(frame) = read.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                if event_tx
                    .send(TransportEvent::Message(text.to_string()))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Ok(Message::Ping(payload)) => {
                let mut write = write.lock().await;
                if let Err(error) = write.send(Message::Pong(payload)).await {
                    tracing::debug!(error = %error, "pong reply failed");
                }
            }
            Ok(Message::Close(frame)) => {
                let details = frame.map_or_else(
                    || "close frame".to_owned(),
                    |f| format!("close {}: {}", f.code, f.reason),
                );
                let _ = event_tx
                    .send(TransportEvent::Closed {
                        clean: true,
                        details,
                    })
                    .await;
                return;
            }
            Ok(_) => {
                // Pong and binary frames carry nothing for this runtime.
            }
            Err(error) => {
                let _ = event_tx
                    .send(TransportEvent::Error(TransportError::Receive(
                        error.to_string(),
                    )))
                    .await;
                let _ = event_tx
                    .send(TransportEvent::Closed {
                        clean: false,
                        details: error.to_string(),
                    })
                    .await;
                return;
            }
        }
    }

    let _ = event_tx
        .send(TransportEvent::Closed {
            clean: false,
            details: "websocket stream ended".to_owned(),
        })
        .await;
}

struct WebSocketSink {
    write: Arc<tokio::sync::Mutex<WsWrite>>,
}

#[async_trait]
impl TransportSink for WebSocketSink {
    async fn send(&mut self, data: String) -> Result<(), TransportError> {
        let mut write = self.write.lock().await;
        write
            .send(Message::Text(data.into()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let mut write = self.write.lock().await;
        write
            .close()
            .await
            .map_err(|e| TransportError::Close(e.to_string()))
    }
}
