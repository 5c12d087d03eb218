//! Command dispatcher
//!
//! Owns the coordinator's mutable state (registry, elite aggregator,
//! notification relay, GA options) and processes one command or one worker
//! report at a time.
//!
//! # State machine
//!
//! ```text
//!            prepare          run            pause
//!   Idle ──────────> Prepared ────> Running ─────────> Paused
//!                        │  ^          ^ │    run        │
//!                        │  │prepare   │ └──────┐ ┌─────┘
//!                        │  │          │ stop   v v stop
//!                        └──┴──────────┴─────> Stopped
//!
//!   any ── exit ──> ShuttingDown ── (workers gone / timeout) ──> Terminated
//! ```
//!
//! Commands whose precondition does not hold are logged and dropped.

use crate::config::CoordinatorConfig;
use crate::elite::{AggregationConfig, EliteAggregator};
use crate::protocol::{self, Directive, RunParams, WorkerReport};
use crate::registry::{ObserverChannel, ObserverRole, Registry};
use crate::relay::{EventKind, NotificationRelay};
use crate::transport::{PeerId, TransportEvent, TransportHandle};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Somewhere directives can be broadcast to
pub trait DirectiveSink {
    /// Queue an encoded directive for every connected worker
    ///
    /// Returns the number of recipients.
    fn broadcast(&self, payload: &[u8]) -> usize;
}

impl DirectiveSink for TransportHandle {
    fn broadcast(&self, payload: &[u8]) -> usize {
        TransportHandle::broadcast(self, payload)
    }
}

/// Command faults at the observer/operator boundary
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("undecodable command message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unknown command '{0}'")]
    Unknown(String),

    #[error("invalid payload for '{command}': {reason}")]
    InvalidPayload { command: String, reason: String },
}

/// Command envelope sent by observers: `{command, payload?}`
#[derive(Debug, Clone, Deserialize)]
pub struct CommandEnvelope {
    pub command: String,
    #[serde(default)]
    pub payload: Option<Value>,
}

/// Decoded operator command
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Merge these GA options and prepare every worker
    Prepare(Map<String, Value>),
    Run(RunParams),
    Pause,
    Stop,
    /// Worker-side run-state save
    Save(Option<String>),
    /// Worker-side run-state restore
    Restore(Option<String>),
    GetStatistics,
    GetBest,
    /// Save the global elite list (default file if none given)
    SaveElites(Option<PathBuf>),
    /// Restore the global elite list (default file if none given)
    RestoreElites(Option<PathBuf>),
    Exit,
}

impl Command {
    /// Command names accepted on every input path
    pub const NAMES: [&'static str; 11] = [
        "prepare", "run", "pause", "stop", "save", "restore", "get_st", "get_best", "save_e", "restore_e", "exit",
    ];

    /// Decode a JSON command message from an observer
    pub fn from_json(text: &str) -> Result<Self, CommandError> {
        let envelope: CommandEnvelope = serde_json::from_str(text)?;
        Self::from_envelope(envelope)
    }

    /// Decode a typed envelope
    pub fn from_envelope(envelope: CommandEnvelope) -> Result<Self, CommandError> {
        let CommandEnvelope { command, payload } = envelope;
        let payload = payload.filter(|p| !p.is_null());

        let filename = |payload: &Option<Value>| -> Result<Option<String>, CommandError> {
            match payload {
                None => Ok(None),
                Some(Value::String(name)) => Ok(Some(name.clone())),
                Some(Value::Object(map)) => match map.get("filename") {
                    None | Some(Value::Null) => Ok(None),
                    Some(Value::String(name)) => Ok(Some(name.clone())),
                    Some(other) => Err(CommandError::InvalidPayload {
                        command: command.clone(),
                        reason: format!("filename must be a string, got {}", other),
                    }),
                },
                Some(other) => Err(CommandError::InvalidPayload {
                    command: command.clone(),
                    reason: format!("expected an object, got {}", other),
                }),
            }
        };

        let cmd = match command.as_str() {
            "prepare" => match payload {
                None => Command::Prepare(Map::new()),
                Some(Value::Object(map)) => Command::Prepare(map),
                Some(other) => {
                    return Err(CommandError::InvalidPayload {
                        command: command.clone(),
                        reason: format!("expected an object, got {}", other),
                    })
                }
            },
            "run" => match payload {
                None => Command::Run(RunParams::default()),
                Some(value) => Command::Run(serde_json::from_value(value).map_err(|e| {
                    CommandError::InvalidPayload {
                        command: command.clone(),
                        reason: e.to_string(),
                    }
                })?),
            },
            "pause" => Command::Pause,
            "stop" => Command::Stop,
            "save" => Command::Save(filename(&payload)?),
            "restore" => Command::Restore(filename(&payload)?),
            "get_st" => Command::GetStatistics,
            "get_best" => Command::GetBest,
            "save_e" => Command::SaveElites(filename(&payload)?.map(PathBuf::from)),
            "restore_e" => Command::RestoreElites(filename(&payload)?.map(PathBuf::from)),
            "exit" => Command::Exit,
            _ => return Err(CommandError::Unknown(command.clone())),
        };
        Ok(cmd)
    }

    /// Decode a line typed on the operator console
    ///
    /// `name [filename]`; blank lines yield `None`.
    pub fn from_operator_line(line: &str) -> Result<Option<Self>, CommandError> {
        let mut tokens = line.split_whitespace();
        let Some(name) = tokens.next() else {
            return Ok(None);
        };
        let payload = tokens.next().map(|arg| Value::String(arg.to_string()));

        Self::from_envelope(CommandEnvelope {
            command: name.to_string(),
            payload,
        })
        .map(Some)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Prepare(_) => "prepare",
            Command::Run(_) => "run",
            Command::Pause => "pause",
            Command::Stop => "stop",
            Command::Save(_) => "save",
            Command::Restore(_) => "restore",
            Command::GetStatistics => "get_st",
            Command::GetBest => "get_best",
            Command::SaveElites(_) => "save_e",
            Command::RestoreElites(_) => "restore_e",
            Command::Exit => "exit",
        }
    }
}

/// Dispatcher state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Idle,
    Prepared,
    Running,
    Paused,
    Stopped,
    ShuttingDown,
    Terminated,
}

impl DispatcherState {
    fn is_closing(self) -> bool {
        matches!(self, DispatcherState::ShuttingDown | DispatcherState::Terminated)
    }
}

impl fmt::Display for DispatcherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Whether the coordinator should keep serving
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

/// Single-threaded command and report processor
pub struct Dispatcher<S: DirectiveSink> {
    state: DispatcherState,
    ga_options: Map<String, Value>,
    default_elites_file: PathBuf,
    registry: Registry,
    aggregator: EliteAggregator,
    relay: NotificationRelay,
    sink: S,
}

impl<S: DirectiveSink> Dispatcher<S> {
    pub fn new(config: &CoordinatorConfig, sink: S) -> Self {
        let mut ga_options = config.ga.clone();
        config.aggregation.write_ga_options(&mut ga_options);

        Self {
            state: DispatcherState::Idle,
            ga_options,
            default_elites_file: config.persistence.elites_file.clone(),
            registry: Registry::new(),
            aggregator: EliteAggregator::new(config.aggregation),
            relay: NotificationRelay::new(),
            sink,
        }
    }

    pub fn state(&self) -> DispatcherState {
        self.state
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn aggregator(&self) -> &EliteAggregator {
        &self.aggregator
    }

    pub fn relay_mut(&mut self) -> &mut NotificationRelay {
        &mut self.relay
    }

    pub fn ga_options(&self) -> &Map<String, Value> {
        &self.ga_options
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    // --- Commands ----------------------------------------------------------

    /// Apply one command
    pub fn handle_command(&mut self, command: Command) -> Flow {
        if self.state.is_closing() {
            log::warn!("Ignoring '{}' while {}", command.name(), self.state);
            return Flow::Exit;
        }

        log::info!("Process command {}", command.name());

        match command {
            Command::Prepare(payload) => self.prepare(payload),
            Command::Run(params) => {
                if self.require(
                    "run",
                    &[DispatcherState::Prepared, DispatcherState::Paused, DispatcherState::Stopped],
                ) {
                    self.broadcast(&Directive::Run(params));
                    self.state = DispatcherState::Running;
                }
            }
            Command::Pause => {
                if self.require("pause", &[DispatcherState::Running]) {
                    self.broadcast(&Directive::Pause);
                    self.state = DispatcherState::Paused;
                }
            }
            Command::Stop => {
                if self.require(
                    "stop",
                    &[DispatcherState::Prepared, DispatcherState::Running, DispatcherState::Paused],
                ) {
                    self.broadcast(&Directive::Stop);
                    self.state = DispatcherState::Stopped;
                }
            }
            Command::Save(name) => self.broadcast(&Directive::Save(name)),
            Command::Restore(name) => self.broadcast(&Directive::Restore(name)),
            Command::GetStatistics => self.broadcast(&Directive::Statistics),
            Command::GetBest => self.broadcast(&Directive::Best),
            Command::SaveElites(target) => {
                let target = target.unwrap_or_else(|| self.default_elites_file.clone());
                self.aggregator.request_save(target);
            }
            Command::RestoreElites(source) => {
                let source = source.unwrap_or_else(|| self.default_elites_file.clone());
                self.aggregator.request_restore(source);
            }
            Command::Exit => {
                self.broadcast(&Directive::Exit);
                self.state = DispatcherState::ShuttingDown;
                return Flow::Exit;
            }
        }

        Flow::Continue
    }

    fn prepare(&mut self, payload: Map<String, Value>) {
        if payload.is_empty() {
            log::warn!("Getting nothing in payload to prepare. Use current configuration.");
        }
        self.ga_options.extend(payload);

        let aggregation = AggregationConfig::from_ga_options(&self.ga_options);
        self.aggregator.reconfigure(aggregation);
        log::debug!("Prepare with options: {}", Value::Object(self.ga_options.clone()));

        self.broadcast(&Directive::Prepare(self.ga_options.clone()));
        self.state = DispatcherState::Prepared;
    }

    fn require(&self, command: &str, allowed: &[DispatcherState]) -> bool {
        if allowed.contains(&self.state) {
            return true;
        }
        log::warn!("Ignoring '{}': not allowed while {}", command, self.state);
        false
    }

    fn broadcast(&self, directive: &Directive) {
        match protocol::encode_directive(directive) {
            Ok(bytes) => {
                let recipients = self.sink.broadcast(&bytes);
                log::debug!("Directive '{}' sent to {} worker connections", directive.name(), recipients);
                if recipients == 0 {
                    log::warn!("Directive '{}' had no worker connections to go to", directive.name());
                }
            }
            Err(e) => log::error!("Failed to encode directive '{}': {}", directive.name(), e),
        }
    }

    // --- Observers ---------------------------------------------------------

    /// Admit an observer and replay the current worker set to it
    pub fn observer_connected(&mut self, address: &str, channel: ObserverChannel) -> ObserverRole {
        let role = self.registry.admit_observer(address, channel);

        for report in self.registry.snapshot_all() {
            match protocol::report_to_json(&report) {
                Ok(text) => self.registry.send_to_observer(address, &text),
                Err(e) => log::error!("Failed to encode replay for {}: {}", address, e),
            }
        }
        role
    }

    pub fn observer_disconnected(&mut self, address: &str) {
        self.registry.evict_observer(address);
    }

    /// Handle a text message from an observer
    ///
    /// Messages from anyone but the controller are dropped once a controller
    /// exists. Undecodable messages are logged and dropped.
    pub fn handle_observer_message(&mut self, address: &str, text: &str) -> Flow {
        if !self.registry.may_command(address) {
            log::debug!("Observer {} message is ignored (not controller)", address);
            return Flow::Continue;
        }

        match Command::from_json(text) {
            Ok(command) => self.handle_command(command),
            Err(e) => {
                log::error!("Observer {} sent a bad command: {}", address, e);
                Flow::Continue
            }
        }
    }

    // --- Workers -----------------------------------------------------------

    /// Handle an event from the worker transport
    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected { peer, addr } => {
                log::info!("Worker connection {} established from {}", peer, addr);
                self.registry.peer_connected(peer);
            }
            TransportEvent::Message { peer, payload } => self.handle_report(peer, &payload),
            TransportEvent::Disconnected { peer } => {
                for record in self.registry.on_transport_disconnect(peer) {
                    log::warn!("Worker {} lost with connection {}", record.id, peer);
                    self.relay.publish(EventKind::Disconnected, &json!({ "worker": record.id }));
                    self.forward(&WorkerReport::WorkerLost { worker: record.id });
                }
            }
        }
    }

    /// Decode and route one worker report
    pub fn handle_report(&mut self, peer: PeerId, payload: &[u8]) {
        let report = match protocol::decode_report(payload) {
            Ok(report) => report,
            Err(e) => {
                log::warn!("Discarding report from worker connection {}: {}", peer, e);
                return;
            }
        };
        log::debug!("Report from worker connection {}, type = {}", peer, report.kind());

        match &report {
            WorkerReport::WorkerConnected { worker } => {
                log::info!("Worker {} registered", worker);
                self.registry.register_worker(&report, Some(peer));
                match serde_json::to_value(&report) {
                    Ok(data) => {
                        self.relay.publish(EventKind::Connected, &data);
                    }
                    Err(e) => log::error!("Failed to encode event for worker {}: {}", worker, e),
                }
            }
            WorkerReport::WorkerLost { worker } => {
                log::info!("Worker {} lost", worker);
                if self.registry.unregister_worker(&report).is_some() {
                    self.relay.publish(EventKind::Disconnected, &json!({ "worker": worker }));
                }
            }
            WorkerReport::Statistics { result } => {
                self.relay.publish(EventKind::Message, &json!({ "statistics": result }));
            }
            WorkerReport::Best { result } => {
                self.relay.publish(EventKind::Message, &json!({ "best": result }));
            }
            WorkerReport::Save { result } => {
                log::info!("Worker saved run state: {}", result);
            }
            WorkerReport::GenerationResult { worker, result } => {
                if self.aggregator.is_enabled() {
                    let Some(elites) = &result.best_result else {
                        log::warn!("Worker {} sent no elites while elitism is enabled", worker);
                        return;
                    };
                    match self.aggregator.submit(worker, elites) {
                        Ok(outcome) => {
                            if let Some(set) = outcome.flushed {
                                self.broadcast(&Directive::Elites(set));
                            }
                        }
                        Err(e) => {
                            log::error!("Discarding elite submission from worker {}: {}", worker, e);
                            return;
                        }
                    }
                }
            }
        }

        self.forward(&report);
    }

    fn forward(&self, report: &WorkerReport) {
        match protocol::report_to_json(report) {
            Ok(text) => {
                self.registry.broadcast_to_observers(&text);
            }
            Err(e) => log::error!("Failed to encode {} report for observers: {}", report.kind(), e),
        }
    }

    // --- Shutdown ----------------------------------------------------------

    /// Transport connections still open
    pub fn connected_peers(&self) -> usize {
        self.registry.peer_count()
    }

    /// Drop all worker and observer state after the transports are closed
    pub fn finish_shutdown(&mut self) {
        self.registry.clear();
        self.state = DispatcherState::Terminated;
    }
}
