//! Worker protocol
//!
//! Defines the messages exchanged with workers inside transport frames.
//! Payloads are MessagePack (rmp-serde) with structs encoded as maps, so the
//! `type` / `command` tags survive the round trip and field names stay
//! readable when a report is re-encoded as JSON for observers.
//!
//! # Message Flow
//!
//! ```text
//! Coordinator                        Worker
//!     |                                 |
//!     |<------ workerConnected ---------|
//!     |------- prepare(options) ------->|
//!     |------- run(probabilities) ----->|
//!     |                                 |
//!     |<------ generationResult --------|   (repeats every generation)
//!     |------- elites(top K) ---------->|   (after every flush)
//!     |                                 |
//!     |------- exit ------------------->|
//!     |<------ workerLost --------------|
//! ```

use crate::elite::EliteEntry;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Version of the elite payload carried in `generationResult`
///
/// Increment this when the layout of `ElitePayload` changes.
pub const ELITE_PAYLOAD_VERSION: u32 = 1;

/// Protocol faults: undecodable or unencodable payloads
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to decode worker payload: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("failed to encode worker payload: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("failed to encode observer message: {0}")]
    Json(#[from] serde_json::Error),
}

/// Report sent by a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkerReport {
    /// A worker announced itself
    WorkerConnected { worker: String },

    /// A worker is going away
    WorkerLost { worker: String },

    /// Answer to a `statistics` directive
    Statistics { result: Value },

    /// Answer to a `best` directive
    Best { result: Value },

    /// Answer to a `save` directive (name of the worker-side save)
    Save { result: Value },

    /// Progress of one generation, optionally carrying the worker's elites
    GenerationResult { worker: String, result: GenerationResult },
}

impl WorkerReport {
    /// Short name of the report kind, as it appears in the `type` field
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerReport::WorkerConnected { .. } => "workerConnected",
            WorkerReport::WorkerLost { .. } => "workerLost",
            WorkerReport::Statistics { .. } => "statistics",
            WorkerReport::Best { .. } => "best",
            WorkerReport::Save { .. } => "save",
            WorkerReport::GenerationResult { .. } => "generationResult",
        }
    }

    /// Worker id carried by the report, if any
    pub fn worker_id(&self) -> Option<&str> {
        match self {
            WorkerReport::WorkerConnected { worker }
            | WorkerReport::WorkerLost { worker }
            | WorkerReport::GenerationResult { worker, .. } => Some(worker),
            _ => None,
        }
    }
}

/// Per-generation result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    /// Best fitness of the worker's population this generation
    pub best_fitness: f64,

    /// The worker's top candidates, present when elitism is enabled
    #[serde(default)]
    pub best_result: Option<ElitePayload>,
}

/// A worker's elite submission
///
/// `genomes` is the concatenation of `fitnesses.len()` genomes of exactly
/// `genome_size` bytes each, in the same order as `fitnesses`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElitePayload {
    pub version: u32,
    pub genome_size: usize,
    pub fitnesses: Vec<f64>,
    #[serde(with = "genome_bytes")]
    pub genomes: Vec<u8>,
}

impl ElitePayload {
    /// Build a payload from (fitness, genome) pairs
    ///
    /// All genomes are expected to have the same length.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (f64, &'a [u8])>) -> Self {
        let mut fitnesses = Vec::new();
        let mut genomes = Vec::new();
        let mut genome_size = 0;
        for (fitness, genome) in pairs {
            genome_size = genome.len();
            fitnesses.push(fitness);
            genomes.extend_from_slice(genome);
        }
        Self {
            version: ELITE_PAYLOAD_VERSION,
            genome_size,
            fitnesses,
            genomes,
        }
    }
}

/// Genome bytes as MessagePack `bin`
///
/// Decoding also takes a plain integer array, as older workers send.
pub mod genome_bytes {
    use serde::de::{Error, SeqAccess, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        deserializer.deserialize_byte_buf(GenomeVisitor)
    }

    struct GenomeVisitor;

    impl<'de> Visitor<'de> for GenomeVisitor {
        type Value = Vec<u8>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("genome bytes")
        }

        fn visit_bytes<E: Error>(self, v: &[u8]) -> Result<Vec<u8>, E> {
            Ok(v.to_vec())
        }

        fn visit_byte_buf<E: Error>(self, v: Vec<u8>) -> Result<Vec<u8>, E> {
            Ok(v)
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Vec<u8>, A::Error> {
            let mut bytes = Vec::with_capacity(seq.size_hint().unwrap_or(0).min(4096));
            while let Some(byte) = seq.next_element::<u8>()? {
                bytes.push(byte);
            }
            Ok(bytes)
        }
    }
}

/// Optional probability overrides for `run`
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RunParams {
    #[serde(default)]
    pub prob_mutation: Option<f64>,
    #[serde(default)]
    pub prob_crossover: Option<f64>,
}

/// Directive broadcast to every worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", content = "data", rename_all = "lowercase")]
pub enum Directive {
    /// Full GA option set
    Prepare(Map<String, Value>),
    Run(RunParams),
    Pause,
    Stop,
    /// Worker-side run-state save, passed through untouched
    Save(Option<String>),
    /// Worker-side run-state restore, passed through untouched
    Restore(Option<String>),
    Statistics,
    Best,
    /// Global elite set to seed future generations from
    Elites(Vec<EliteEntry>),
    Exit,
}

impl Directive {
    /// Name of the directive, as it appears in the `command` field
    pub fn name(&self) -> &'static str {
        match self {
            Directive::Prepare(_) => "prepare",
            Directive::Run(_) => "run",
            Directive::Pause => "pause",
            Directive::Stop => "stop",
            Directive::Save(_) => "save",
            Directive::Restore(_) => "restore",
            Directive::Statistics => "statistics",
            Directive::Best => "best",
            Directive::Elites(_) => "elites",
            Directive::Exit => "exit",
        }
    }
}

/// Encode a directive for the worker transport
pub fn encode_directive(directive: &Directive) -> Result<Vec<u8>, ProtocolError> {
    Ok(rmp_serde::to_vec_named(directive)?)
}

/// Decode a directive (worker side, and tests)
pub fn decode_directive(payload: &[u8]) -> Result<Directive, ProtocolError> {
    Ok(rmp_serde::from_slice(payload)?)
}

/// Encode a report (worker side, and tests)
pub fn encode_report(report: &WorkerReport) -> Result<Vec<u8>, ProtocolError> {
    Ok(rmp_serde::to_vec_named(report)?)
}

/// Decode a report received from a worker
///
/// The payload is only ever parsed as data; nothing in it is executed.
pub fn decode_report(payload: &[u8]) -> Result<WorkerReport, ProtocolError> {
    Ok(rmp_serde::from_slice(payload)?)
}

/// Render a report as JSON text for observers
pub fn report_to_json(report: &WorkerReport) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(report)?)
}
