//! Message transport to the sync server.
//!
//! A [`Link`] is one open connection seen as a pair of text channels: one
//! frame per message event in each direction. The connection is gone once
//! `incoming` yields `None`.

use crate::error::TransportError;
use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

/// An open connection.
#[derive(Debug)]
pub struct Link {
    pub outgoing: mpsc::UnboundedSender<String>,
    pub incoming: mpsc::UnboundedReceiver<String>,
}

impl Link {
    /// Both ends of an in-process link: `(client side, server side)`.
    pub fn pair() -> (Link, Link) {
        let (client_tx, server_rx) = mpsc::unbounded_channel();
        let (server_tx, client_rx) = mpsc::unbounded_channel();
        (
            Link {
                outgoing: client_tx,
                incoming: client_rx,
            },
            Link {
                outgoing: server_tx,
                incoming: server_rx,
            },
        )
    }
}

pub trait Transport: Send + Sync + 'static {
    /// Open a connection to `url`.
    fn open(&self, url: &str) -> BoxFuture<'static, Result<Link, TransportError>>;
}

/// WebSocket transport over `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketTransport;

impl Transport for WebSocketTransport {
    fn open(&self, url: &str) -> BoxFuture<'static, Result<Link, TransportError>> {
        let url = url.to_string();
        async move {
            let (stream, _) = tokio_tungstenite::connect_async(url.as_str())
                .await
                .map_err(|e| TransportError::Connect(e.to_string()))?;
            let (mut sink, mut source) = stream.split();

            let (outgoing, mut to_socket) = mpsc::unbounded_channel::<String>();
            let (from_socket, incoming) = mpsc::unbounded_channel::<String>();

            tokio::spawn(async move {
                while let Some(text) = to_socket.recv().await {
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        tracing::warn!("Failed to send WebSocket message: {}", e);
                        break;
                    }
                }
                let _ = sink.close().await;
            });

            tokio::spawn(async move {
                while let Some(frame) = source.next().await {
                    match frame {
                        Ok(Message::Text(text)) => {
                            if from_socket.send(text).is_err() {
                                break;
                            }
                        }
                        Ok(Message::Close(_)) => break,
                        Ok(_) => {}
                        Err(e) => {
                            tracing::debug!("WebSocket read failed: {}", e);
                            break;
                        }
                    }
                }
            });

            Ok(Link { outgoing, incoming })
        }
        .boxed()
    }
}
