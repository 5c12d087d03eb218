//! Observer-facing WebSocket server
//!
//! Each accepted connection gets one task that forwards inbound text frames
//! to the coordination task and drains an outbound queue of JSON messages.
//! Observers are identified by their remote socket address.

use crate::registry::ObserverChannel;
use crate::transport::server::ACCEPT_RETRY_DELAY;
use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

/// Events surfaced to the coordination task
#[derive(Debug)]
pub enum ObserverEvent {
    /// Handshake completed; `channel` delivers text to this observer
    Connected { address: String, channel: ObserverChannel },
    Message { address: String, text: String },
    Disconnected { address: String },
}

/// Listening observer server
pub struct ObserverServer {
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl ObserverServer {
    /// Bind the listener and start accepting observers
    pub async fn bind(addr: &str, events: mpsc::UnboundedSender<ObserverEvent>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind observer server on {}", addr))?;
        let local_addr = listener
            .local_addr()
            .context("Failed to read observer server address")?;

        let accept_task = tokio::spawn(accept_loop(listener, events));

        Ok(Self {
            local_addr,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting new observers
    ///
    /// Open sessions end when the registry drops their outbound channels.
    pub fn shutdown(self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(listener: TcpListener, events: mpsc::UnboundedSender<ObserverEvent>) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                log::error!("Failed to accept observer connection: {}", e);
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                continue;
            }
        };

        if events.is_closed() {
            log::warn!("Coordinator is gone, stop accepting observers");
            return;
        }

        tokio::spawn(serve_observer(stream, addr, events.clone()));
    }
}

async fn serve_observer(stream: TcpStream, addr: SocketAddr, events: mpsc::UnboundedSender<ObserverEvent>) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            log::warn!("WebSocket handshake with {} failed: {}", addr, e);
            return;
        }
    };
    let address = addr.to_string();
    log::info!("Observer {} connected", address);

    let (mut sink, mut stream) = ws.split();
    let (tx, mut outbox) = mpsc::unbounded_channel::<String>();

    if events
        .send(ObserverEvent::Connected {
            address: address.clone(),
            channel: tx,
        })
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            outgoing = outbox.recv() => {
                let Some(text) = outgoing else {
                    // Registry dropped this session
                    let _ = sink.close().await;
                    break;
                };
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    log::warn!("Failed to send to observer {}: {}", address, e);
                    break;
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let text = text.to_string();
                        if events.send(ObserverEvent::Message { address: address.clone(), text }).is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        log::debug!("Ignoring binary frame from observer {}", address);
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::warn!("Observer {} connection error: {}", address, e);
                        break;
                    }
                }
            }
        }
    }

    log::info!("Observer {} disconnected", address);
    let _ = events.send(ObserverEvent::Disconnected { address });
}
