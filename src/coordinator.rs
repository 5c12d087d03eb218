//! Coordinator event loop
//!
//! Binds the worker transport and the observer server, then runs a single
//! task that owns the [`Dispatcher`] and feeds it transport events, observer
//! messages, operator lines and Ctrl-C, one at a time.

use crate::config::CoordinatorConfig;
use crate::dispatcher::{Command, Dispatcher, Flow};
use crate::observer::{ObserverEvent, ObserverServer};
use crate::relay::NotificationRelay;
use crate::transport::{TransportEvent, TransportHandle, WorkerTransport};
use anyhow::Result;
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

/// Coordinator built from a validated configuration
pub struct Coordinator {
    config: CoordinatorConfig,
    relay: NotificationRelay,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            config,
            relay: NotificationRelay::new(),
        }
    }

    /// Relay for subscribing to worker events before the coordinator starts
    pub fn relay_mut(&mut self) -> &mut NotificationRelay {
        &mut self.relay
    }

    /// Bind both servers and serve until `exit`
    pub async fn run(self) -> Result<()> {
        self.bind().await.serve().await
    }

    /// Bind the worker transport and the observer server
    ///
    /// A server that fails to bind is logged and left out; the coordinator
    /// keeps running with whatever is left.
    pub async fn bind(self) -> BoundCoordinator {
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (observer_tx, observer_rx) = mpsc::unbounded_channel();

        let worker_addr = self.config.network.worker_listen_addr();
        let transport = match WorkerTransport::bind(&worker_addr, transport_tx.clone()).await {
            Ok(transport) => {
                log::info!("Listening for workers on {}", transport.local_addr());
                Some(transport)
            }
            Err(e) => {
                log::error!("{:#}", e);
                log::warn!("Running without worker transport; directives will reach nobody");
                None
            }
        };

        let observer_addr = self.config.network.observer_listen_addr();
        let observers = match ObserverServer::bind(&observer_addr, observer_tx.clone()).await {
            Ok(server) => {
                log::info!("Listening for observers on {}", server.local_addr());
                Some(server)
            }
            Err(e) => {
                log::error!("{:#}", e);
                log::warn!("Running without observer server");
                None
            }
        };

        let handle = transport
            .as_ref()
            .map(WorkerTransport::handle)
            .unwrap_or_else(TransportHandle::new);
        let mut dispatcher = Dispatcher::new(&self.config, handle);
        *dispatcher.relay_mut() = self.relay;

        BoundCoordinator {
            config: self.config,
            dispatcher,
            transport,
            observers,
            transport_tx,
            transport_rx,
            observer_tx,
            observer_rx,
        }
    }
}

/// Coordinator with its servers bound, ready to serve
pub struct BoundCoordinator {
    config: CoordinatorConfig,
    dispatcher: Dispatcher<TransportHandle>,
    transport: Option<WorkerTransport>,
    observers: Option<ObserverServer>,
    // Senders are held so the receivers never report closed while a server is down
    transport_tx: mpsc::UnboundedSender<TransportEvent>,
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    observer_tx: mpsc::UnboundedSender<ObserverEvent>,
    observer_rx: mpsc::UnboundedReceiver<ObserverEvent>,
}

impl BoundCoordinator {
    pub fn worker_addr(&self) -> Option<SocketAddr> {
        self.transport.as_ref().map(WorkerTransport::local_addr)
    }

    pub fn observer_addr(&self) -> Option<SocketAddr> {
        self.observers.as_ref().map(ObserverServer::local_addr)
    }

    /// Process events until `exit`, then shut down
    pub async fn serve(mut self) -> Result<()> {
        let mut operator = if self.config.runtime.operator_input {
            Some(spawn_operator_reader())
        } else {
            None
        };

        loop {
            let flow = tokio::select! {
                Some(event) = self.transport_rx.recv() => {
                    self.dispatcher.handle_transport_event(event);
                    Flow::Continue
                }
                Some(event) = self.observer_rx.recv() => self.handle_observer_event(event),
                line = next_operator_line(&mut operator) => match line {
                    Some(line) => self.handle_operator_line(&line),
                    None => {
                        log::info!("Operator input closed");
                        operator = None;
                        Flow::Continue
                    }
                },
                signal = tokio::signal::ctrl_c() => {
                    if let Err(e) = signal {
                        log::error!("Failed to listen for Ctrl-C: {}", e);
                        Flow::Continue
                    } else {
                        log::info!("Interrupted, exiting");
                        self.dispatcher.handle_command(Command::Exit)
                    }
                }
            };

            if flow == Flow::Exit {
                break;
            }
        }

        self.shutdown().await;
        Ok(())
    }

    fn handle_observer_event(&mut self, event: ObserverEvent) -> Flow {
        match event {
            ObserverEvent::Connected { address, channel } => {
                let role = self.dispatcher.observer_connected(&address, channel);
                log::info!("Observer {} admitted as {:?}", address, role);
                Flow::Continue
            }
            ObserverEvent::Message { address, text } => self.dispatcher.handle_observer_message(&address, &text),
            ObserverEvent::Disconnected { address } => {
                self.dispatcher.observer_disconnected(&address);
                Flow::Continue
            }
        }
    }

    fn handle_operator_line(&mut self, line: &str) -> Flow {
        match Command::from_operator_line(line) {
            Ok(Some(command)) => self.dispatcher.handle_command(command),
            Ok(None) => Flow::Continue,
            Err(e) => {
                println!("{}. Commands: {}", e, Command::NAMES.join(", "));
                Flow::Continue
            }
        }
    }

    /// Wait for workers to leave (bounded by the shutdown timeout), then close everything
    async fn shutdown(mut self) {
        let timeout = self.config.runtime.shutdown_timeout();
        let pending = self.dispatcher.connected_peers();
        if pending > 0 {
            log::info!("Waiting up to {:?} for {} worker connections to close", timeout, pending);
        }

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        while self.dispatcher.connected_peers() > 0 {
            tokio::select! {
                _ = &mut deadline => {
                    log::warn!(
                        "Shutdown timeout, forcing {} worker connections closed",
                        self.dispatcher.connected_peers()
                    );
                    break;
                }
                Some(event) = self.transport_rx.recv() => self.dispatcher.handle_transport_event(event),
                Some(event) = self.observer_rx.recv() => {
                    self.handle_observer_event(event);
                }
            }
        }

        if let Some(transport) = self.transport.take() {
            transport.shutdown();
        }
        if let Some(observers) = self.observers.take() {
            observers.shutdown();
        }
        self.dispatcher.finish_shutdown();
        log::info!("Coordinator terminated");
    }
}

fn spawn_operator_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if tx.send(line).is_err() {
                        return;
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    log::error!("Failed to read operator input: {}", e);
                    return;
                }
            }
        }
    });
    rx
}

async fn next_operator_line(operator: &mut Option<mpsc::UnboundedReceiver<String>>) -> Option<String> {
    match operator {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{self, Directive, WorkerReport};
    use crate::transport::framing::{encode_frame, FrameDecoder};
    use futures::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::Message;

    fn local_config() -> CoordinatorConfig {
        let mut config = CoordinatorConfig::default();
        config.network.bind_address = "127.0.0.1".to_string();
        config.network.worker_port = 0;
        config.network.observer_port = 0;
        config.runtime.operator_input = false;
        config.runtime.shutdown_timeout_secs = 5;
        config
    }

    async fn read_directive(stream: &mut TcpStream, decoder: &mut FrameDecoder) -> Directive {
        let mut buf = [0u8; 1024];
        loop {
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "Coordinator closed the worker connection");
            let (frames, _) = decoder.push(&buf[..n]);
            if let Some(frame) = frames.first() {
                return protocol::decode_directive(frame).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_exit_from_controller_reaches_workers() {
        let bound = Coordinator::new(local_config()).bind().await;
        let worker_addr = bound.worker_addr().unwrap();
        let observer_addr = bound.observer_addr().unwrap();
        let served = tokio::spawn(bound.serve());

        let mut worker = TcpStream::connect(worker_addr).await.unwrap();
        let hello = protocol::encode_report(&WorkerReport::WorkerConnected {
            worker: "w1".to_string(),
        })
        .unwrap();
        worker.write_all(&encode_frame(&hello)).await.unwrap();

        let (mut ui, _) = tokio_tungstenite::connect_async(format!("ws://{}", observer_addr))
            .await
            .unwrap();
        let seen = timeout(Duration::from_secs(5), ui.next()).await.unwrap().unwrap().unwrap();
        let seen: Value = serde_json::from_str(seen.to_text().unwrap()).unwrap();
        assert_eq!(seen, json!({"type": "workerConnected", "worker": "w1"}));

        ui.send(Message::Text(r#"{"command":"exit"}"#.into())).await.unwrap();

        let mut decoder = FrameDecoder::new();
        let directive = timeout(Duration::from_secs(5), read_directive(&mut worker, &mut decoder))
            .await
            .unwrap();
        assert_eq!(directive, Directive::Exit);

        drop(worker);
        timeout(Duration::from_secs(5), served).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_forces_unresponsive_workers_after_timeout() {
        let mut config = local_config();
        config.runtime.shutdown_timeout_secs = 1;
        let bound = Coordinator::new(config).bind().await;
        let worker_addr = bound.worker_addr().unwrap();
        let observer_addr = bound.observer_addr().unwrap();
        let served = tokio::spawn(bound.serve());

        let mut worker = TcpStream::connect(worker_addr).await.unwrap();
        let hello = protocol::encode_report(&WorkerReport::WorkerConnected {
            worker: "stuck".to_string(),
        })
        .unwrap();
        worker.write_all(&encode_frame(&hello)).await.unwrap();

        let (mut ui, _) = tokio_tungstenite::connect_async(format!("ws://{}", observer_addr))
            .await
            .unwrap();
        timeout(Duration::from_secs(5), ui.next()).await.unwrap().unwrap().unwrap();
        ui.send(Message::Text(r#"{"command":"exit"}"#.into())).await.unwrap();

        let mut decoder = FrameDecoder::new();
        let directive = timeout(Duration::from_secs(5), read_directive(&mut worker, &mut decoder))
            .await
            .unwrap();
        assert_eq!(directive, Directive::Exit);

        // The worker ignores exit and keeps its socket open
        let started = std::time::Instant::now();
        timeout(Duration::from_secs(5), served).await.unwrap().unwrap().unwrap();
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(500), "returned after {:?}", waited);
        assert!(waited < Duration::from_secs(4), "returned after {:?}", waited);

        // Coordinator closed the connection from its side
        let mut buf = [0u8; 64];
        let n = timeout(Duration::from_secs(5), worker.read(&mut buf)).await.unwrap().unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_runs_degraded_when_ports_are_taken() {
        let first = Coordinator::new(local_config()).bind().await;

        let mut config = local_config();
        config.network.worker_port = first.worker_addr().unwrap().port();
        config.network.observer_port = first.observer_addr().unwrap().port();
        let second = Coordinator::new(config).bind().await;

        assert!(second.worker_addr().is_none());
        assert!(second.observer_addr().is_none());
    }
}
