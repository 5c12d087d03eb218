//! Worker-facing TCP server
//!
//! Accepts worker connections, splits each into a reader task (frame
//! reassembly) and a writer task (ordered outbound queue), and surfaces
//! connect/message/disconnect events to the coordination task over a channel.

use super::framing::{encode_frame, FrameDecoder};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};

/// Identity of one worker connection, unique for the lifetime of the process
pub type PeerId = u64;

/// Events surfaced to the coordination task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected { peer: PeerId, addr: SocketAddr },
    Message { peer: PeerId, payload: Vec<u8> },
    Disconnected { peer: PeerId },
}

/// Size of a single socket read
const READ_CHUNK: usize = 4096;

/// Back-off after a failed accept before trying again
pub(crate) const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

struct PeerEntry {
    addr: SocketAddr,
    outbox: mpsc::UnboundedSender<Vec<u8>>,
    reader: AbortHandle,
}

/// Shared handle for sending to connected workers
///
/// The peer table sits behind a mutex so a broadcast always reaches exactly
/// the peers registered at the moment it is issued, and each peer's frames
/// are queued whole and in submission order.
#[derive(Clone, Default)]
pub struct TransportHandle {
    peers: Arc<Mutex<HashMap<PeerId, PeerEntry>>>,
}

impl TransportHandle {
    /// Create a handle with no peers (also used when the listener failed to bind)
    pub fn new() -> Self {
        Self::default()
    }

    /// Frame and queue a payload for one peer
    pub fn send(&self, peer: PeerId, payload: &[u8]) -> Result<()> {
        let framed = encode_frame(payload);
        let peers = self.lock_peers();
        let entry = peers
            .get(&peer)
            .with_context(|| format!("Peer {} is not connected", peer))?;
        entry
            .outbox
            .send(framed)
            .map_err(|_| anyhow::anyhow!("Peer {} writer has stopped", peer))
    }

    /// Frame a payload once and queue it for every connected peer
    ///
    /// Returns the number of peers the frame was queued for.
    pub fn broadcast(&self, payload: &[u8]) -> usize {
        let framed = encode_frame(payload);
        let peers = self.lock_peers();
        let mut delivered = 0;
        for (peer, entry) in peers.iter() {
            if entry.outbox.send(framed.clone()).is_ok() {
                delivered += 1;
            } else {
                log::debug!("Peer {} ({}) writer closed, skipping", peer, entry.addr);
            }
        }
        delivered
    }

    /// Number of currently connected peers
    pub fn peer_count(&self) -> usize {
        self.lock_peers().len()
    }

    /// Force-close every peer connection
    ///
    /// Readers are aborted immediately; writers drain what is already queued
    /// and then shut the socket down.
    pub fn close_all(&self) {
        let drained: Vec<(PeerId, PeerEntry)> = self.lock_peers().drain().collect();
        for (peer, entry) in drained {
            log::debug!("Closing peer {} ({})", peer, entry.addr);
            entry.reader.abort();
        }
    }

    fn remove(&self, peer: PeerId) -> bool {
        self.lock_peers().remove(&peer).is_some()
    }

    fn lock_peers(&self) -> std::sync::MutexGuard<'_, HashMap<PeerId, PeerEntry>> {
        // A panic while holding the lock cannot leave the map half-updated
        self.peers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Listening worker transport
pub struct WorkerTransport {
    handle: TransportHandle,
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl WorkerTransport {
    /// Bind the listener and start accepting workers
    ///
    /// Bind failure is returned to the caller, which decides whether to run
    /// degraded. Accept failures after this point are logged and retried.
    pub async fn bind(addr: &str, events: mpsc::UnboundedSender<TransportEvent>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind worker transport on {}", addr))?;
        let local_addr = listener
            .local_addr()
            .context("Failed to read worker transport address")?;

        let handle = TransportHandle::new();
        let accept_task = tokio::spawn(accept_loop(listener, handle.clone(), events));

        Ok(Self {
            handle,
            local_addr,
            accept_task,
        })
    }

    /// Handle for sending to connected workers
    pub fn handle(&self) -> TransportHandle {
        self.handle.clone()
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and force-close all peers
    pub fn shutdown(self) {
        self.accept_task.abort();
        self.handle.close_all();
    }
}

async fn accept_loop(
    listener: TcpListener,
    handle: TransportHandle,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let next_peer = AtomicU64::new(1);

    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                log::error!("Failed to accept worker connection: {}", e);
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                continue;
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("Could not set TCP_NODELAY for {}: {}", addr, e);
        }

        if events.is_closed() {
            log::warn!("Coordinator is gone, stop accepting workers");
            return;
        }

        let peer = next_peer.fetch_add(1, Ordering::Relaxed);
        log::info!("Worker connection {} from {}", peer, addr);

        spawn_peer(peer, addr, stream, &handle, &events);
    }
}

fn spawn_peer(
    peer: PeerId,
    addr: SocketAddr,
    stream: TcpStream,
    handle: &TransportHandle,
    events: &mpsc::UnboundedSender<TransportEvent>,
) {
    let (read_half, write_half) = stream.into_split();
    let (outbox, inbox) = mpsc::unbounded_channel();

    tokio::spawn(write_loop(peer, write_half, inbox));

    // The reader announces the peer itself so Connected always precedes its
    // messages. Holding the table lock until the entry is in place means any
    // broadcast issued after Connected is observed already includes the peer.
    let mut peers = handle.lock_peers();
    let reader = tokio::spawn(read_loop(peer, addr, read_half, handle.clone(), events.clone()));
    peers.insert(
        peer,
        PeerEntry {
            addr,
            outbox,
            reader: reader.abort_handle(),
        },
    );
}

async fn read_loop(
    peer: PeerId,
    addr: SocketAddr,
    mut read_half: OwnedReadHalf,
    handle: TransportHandle,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    if events.send(TransportEvent::Connected { peer, addr }).is_err() {
        return;
    }

    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        let n = match read_half.read(&mut buf).await {
            Ok(0) => {
                log::info!("Worker connection {} closed by peer", peer);
                break;
            }
            Ok(n) => n,
            Err(e) => {
                log::warn!("Read error on worker connection {}: {}", peer, e);
                break;
            }
        };

        let (frames, errors) = decoder.push(&buf[..n]);
        for err in errors {
            log::warn!("Framing error on worker connection {}: {}", peer, err);
        }
        for payload in frames {
            if events.send(TransportEvent::Message { peer, payload }).is_err() {
                return;
            }
        }
    }

    // Only report peers that were not force-closed already
    if handle.remove(peer) {
        let _ = events.send(TransportEvent::Disconnected { peer });
    }
}

async fn write_loop(peer: PeerId, mut write_half: OwnedWriteHalf, mut inbox: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(framed) = inbox.recv().await {
        if let Err(e) = write_half.write_all(&framed).await {
            log::warn!("Write error on worker connection {}: {}", peer, e);
            break;
        }
        if let Err(e) = write_half.flush().await {
            log::warn!("Flush error on worker connection {}: {}", peer, e);
            break;
        }
    }
    let _ = write_half.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::framing::encode_frame;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
        timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for transport event")
            .expect("transport event channel closed")
    }

    #[tokio::test]
    async fn test_connect_message_disconnect() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = WorkerTransport::bind("127.0.0.1:0", tx).await.unwrap();

        let mut client = TcpStream::connect(transport.local_addr()).await.unwrap();
        let peer = match next_event(&mut rx).await {
            TransportEvent::Connected { peer, .. } => peer,
            other => panic!("Expected Connected, got {:?}", other),
        };

        // Split one frame across two writes
        let framed = encode_frame(b"report");
        client.write_all(&framed[..3]).await.unwrap();
        client.flush().await.unwrap();
        client.write_all(&framed[3..]).await.unwrap();

        assert_eq!(
            next_event(&mut rx).await,
            TransportEvent::Message { peer, payload: b"report".to_vec() }
        );

        drop(client);
        assert_eq!(next_event(&mut rx).await, TransportEvent::Disconnected { peer });
        assert_eq!(transport.handle().peer_count(), 0);

        transport.shutdown();
    }

    #[tokio::test]
    async fn test_broadcast_reaches_connected_peers_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = WorkerTransport::bind("127.0.0.1:0", tx).await.unwrap();
        let handle = transport.handle();

        let mut a = TcpStream::connect(transport.local_addr()).await.unwrap();
        next_event(&mut rx).await;
        let mut b = TcpStream::connect(transport.local_addr()).await.unwrap();
        next_event(&mut rx).await;

        assert_eq!(handle.broadcast(b"one"), 2);
        assert_eq!(handle.broadcast(b"two"), 2);

        let mut expected = encode_frame(b"one");
        expected.extend(encode_frame(b"two"));

        for client in [&mut a, &mut b] {
            let mut got = vec![0u8; expected.len()];
            timeout(WAIT, client.read_exact(&mut got)).await.unwrap().unwrap();
            assert_eq!(got, expected);
        }

        transport.shutdown();
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let first = WorkerTransport::bind("127.0.0.1:0", tx.clone()).await.unwrap();
        let taken = first.local_addr().to_string();

        let second = WorkerTransport::bind(&taken, tx).await;
        assert!(second.is_err());

        first.shutdown();
    }

    #[test]
    fn test_degraded_handle_broadcasts_to_nobody() {
        let handle = TransportHandle::new();
        assert_eq!(handle.broadcast(b"exit"), 0);
        assert!(handle.send(1, b"exit").is_err());
    }
}
