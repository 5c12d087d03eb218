//! Cross-worker elite aggregation
//!
//! Every worker periodically submits its own top-K candidates. The aggregator
//! collects those submissions over a configurable number of rounds and then
//! merges them with the current global elite set into a new ranked top-K.
//!
//! # Round batching
//!
//! ```text
//! submission ──> (pending restore? read file) ──> validate ──> apply restore
//!                                                             buffer += K entries
//!                                                             round += 1
//!                                          round == every ──> sort(set ∪ buffer)
//!                                                             truncate to K
//!                                                             round = 0, broadcast
//!                                        (pending save?) ──> write set to disk
//! ```
//!
//! Workers run at their own pace, so batching over `every` submissions keeps
//! merge work and broadcast traffic bounded regardless of the worker count.
//!
//! # Example
//!
//! ```
//! use gaswarm::elite::{AggregationConfig, EliteAggregator, OptimizeDirection};
//! use gaswarm::protocol::ElitePayload;
//!
//! let config = AggregationConfig { top: 2, every: 2, optimize: OptimizeDirection::Max };
//! let mut aggregator = EliteAggregator::new(config);
//!
//! let a = ElitePayload::from_pairs([(5.0, &b"aa"[..]), (3.0, &b"ab"[..])]);
//! let b = ElitePayload::from_pairs([(9.0, &b"ba"[..]), (1.0, &b"bb"[..])]);
//!
//! assert!(aggregator.submit("A", &a).unwrap().flushed.is_none());
//! let flushed = aggregator.submit("B", &b).unwrap().flushed.unwrap();
//!
//! let ranked: Vec<(f64, &str)> = flushed.iter().map(|e| (e.fitness, e.worker.as_str())).collect();
//! assert_eq!(ranked, vec![(9.0, "B"), (5.0, "A")]);
//! ```

pub mod store;

use crate::protocol::{ElitePayload, ELITE_PAYLOAD_VERSION};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub use store::{load_snapshot, save_snapshot, EliteSnapshot};

/// Optimisation direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizeDirection {
    Max,
    Min,
}

impl Default for OptimizeDirection {
    fn default() -> Self {
        Self::Max
    }
}

impl OptimizeDirection {
    /// Ordering that puts the better fitness first
    fn rank(self, a: f64, b: f64) -> Ordering {
        match self {
            OptimizeDirection::Max => b.total_cmp(&a),
            OptimizeDirection::Min => a.total_cmp(&b),
        }
    }

    /// Value used for the `opt_for_max` GA option
    pub fn as_option(self) -> &'static str {
        match self {
            OptimizeDirection::Max => "max",
            OptimizeDirection::Min => "min",
        }
    }
}

/// Aggregation settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationConfig {
    /// Number of elites retained (K)
    #[serde(default)]
    pub top: usize,
    /// Worker submissions collected before each flush (R)
    #[serde(default)]
    pub every: usize,
    /// Optimisation direction
    #[serde(default)]
    pub optimize: OptimizeDirection,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            top: 0,
            every: 0,
            optimize: OptimizeDirection::Max,
        }
    }
}

impl AggregationConfig {
    /// Elitism is active only when both K and R are non-zero
    pub fn is_enabled(&self) -> bool {
        self.top > 0 && self.every > 0
    }

    /// Derive settings from the GA option object
    ///
    /// Reads `elitism_mode.top`, `elitism_mode.every` and `opt_for_max`
    /// (`"max"` unless it says `"min"`). Missing or malformed values count as 0.
    pub fn from_ga_options(options: &Map<String, Value>) -> Self {
        let elitism = options.get("elitism_mode");
        let read = |key: &str| {
            elitism
                .and_then(|e| e.get(key))
                .and_then(Value::as_u64)
                .unwrap_or(0) as usize
        };
        let optimize = match options.get("opt_for_max").and_then(Value::as_str) {
            Some("min") => OptimizeDirection::Min,
            _ => OptimizeDirection::Max,
        };

        Self {
            top: read("top"),
            every: read("every"),
            optimize,
        }
    }

    /// Write these settings into a GA option object
    pub fn write_ga_options(&self, options: &mut Map<String, Value>) {
        options.insert(
            "elitism_mode".to_string(),
            json!({ "top": self.top, "every": self.every }),
        );
        options.insert(
            "opt_for_max".to_string(),
            Value::String(self.optimize.as_option().to_string()),
        );
    }
}

/// One elite candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EliteEntry {
    pub fitness: f64,
    #[serde(with = "crate::protocol::genome_bytes")]
    pub genome: Vec<u8>,
    /// Worker that contributed this entry
    pub worker: String,
}

/// Elite payload invariant violations
///
/// Any of these discards the single offending report; aggregator state is
/// left exactly as it was.
#[derive(Debug, Error, PartialEq)]
pub enum AggregationError {
    #[error("elitism is disabled")]
    Disabled,

    #[error("unsupported elite payload version {got} (expected {expected})")]
    UnsupportedVersion { expected: u32, got: u32 },

    #[error("expected {expected} fitness values, got {got}")]
    FitnessCount { expected: usize, got: usize },

    #[error("genome size {got} does not match agreed size {expected}")]
    GenomeSize { expected: usize, got: usize },

    #[error("genome size {genome_size} is too large")]
    GenomeTooLarge { genome_size: usize },

    #[error("expected {expected} genome bytes, got {got}")]
    GenomeBytes { expected: usize, got: usize },

    #[error("fitness #{index} is NaN")]
    NanFitness { index: usize },
}

/// What a single submission changed
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SubmitOutcome {
    /// New elite set, when this submission completed a round batch
    pub flushed: Option<Vec<EliteEntry>>,
    /// Number of entries loaded, when a pending restore was serviced
    pub restored: Option<usize>,
    /// Target written, when a pending save was serviced
    pub saved: Option<PathBuf>,
}

/// Restore source read but not yet applied
struct LoadedElites {
    /// Ranked and cut to `top`
    entries: Vec<EliteEntry>,
    /// Entry count in the file
    loaded: usize,
}

/// Round-batched top-K merger
#[derive(Debug)]
pub struct EliteAggregator {
    config: AggregationConfig,

    /// Current global elite set, ranked and at most `top` long
    elites: Vec<EliteEntry>,

    /// Submissions since the last flush
    buffer: Vec<EliteEntry>,

    /// Submissions counted toward the next flush
    round: usize,

    pending_save: Option<PathBuf>,
    pending_restore: Option<PathBuf>,
}

impl EliteAggregator {
    pub fn new(config: AggregationConfig) -> Self {
        log::info!(
            "Elitism mode is {}, top({})/every({})",
            config.is_enabled(),
            config.top,
            config.every
        );
        Self {
            config,
            elites: Vec::new(),
            buffer: Vec::new(),
            round: 0,
            pending_save: None,
            pending_restore: None,
        }
    }

    pub fn config(&self) -> &AggregationConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.is_enabled()
    }

    /// Current global elite set
    pub fn elites(&self) -> &[EliteEntry] {
        &self.elites
    }

    /// Entries accumulated since the last flush
    pub fn buffered(&self) -> &[EliteEntry] {
        &self.buffer
    }

    pub fn round(&self) -> usize {
        self.round
    }

    pub fn pending_save(&self) -> Option<&Path> {
        self.pending_save.as_deref()
    }

    pub fn pending_restore(&self) -> Option<&Path> {
        self.pending_restore.as_deref()
    }

    /// Replace the configuration
    ///
    /// The current set is re-ranked for the new direction and cut to the new
    /// `top`; buffered submissions and the round counter carry over.
    pub fn reconfigure(&mut self, config: AggregationConfig) {
        if config != self.config {
            log::info!(
                "Elitism mode is {}, top({})/every({})",
                config.is_enabled(),
                config.top,
                config.every
            );
        }
        self.config = config;
        rank(&mut self.elites, config.optimize);
        self.elites.truncate(config.top);
    }

    /// Schedule a one-shot save of the elite set
    ///
    /// Returns false (and changes nothing) if a save is already pending.
    pub fn request_save(&mut self, target: PathBuf) -> bool {
        if let Some(pending) = &self.pending_save {
            log::warn!(
                "Elite list save to {} already pending, ignoring request for {}",
                pending.display(),
                target.display()
            );
            return false;
        }
        log::info!("Schedule save elite list to {}", target.display());
        self.pending_save = Some(target);
        true
    }

    /// Schedule a one-shot restore of the elite set
    ///
    /// Returns false (and changes nothing) if a restore is already pending.
    pub fn request_restore(&mut self, source: PathBuf) -> bool {
        if let Some(pending) = &self.pending_restore {
            log::warn!(
                "Elite list restore from {} already pending, ignoring request for {}",
                pending.display(),
                source.display()
            );
            return false;
        }
        log::info!("Schedule restore elite list from {}", source.display());
        self.pending_restore = Some(source);
        true
    }

    /// Fold one worker's submission into the aggregate
    pub fn submit(&mut self, worker: &str, payload: &ElitePayload) -> Result<SubmitOutcome, AggregationError> {
        if !self.is_enabled() {
            return Err(AggregationError::Disabled);
        }
        // A pending restore replaces held state, so the payload is checked
        // against the loaded entries rather than what is in memory
        let restored = self.load_pending_restore();
        self.validate(payload, restored.as_ref().map(|r| r.entries.as_slice()))?;

        let mut outcome = SubmitOutcome {
            restored: restored.map(|r| self.commit_restore(r)),
            ..Default::default()
        };

        for (fitness, genome) in payload
            .fitnesses
            .iter()
            .zip(payload.genomes.chunks_exact(payload.genome_size))
        {
            self.buffer.push(EliteEntry {
                fitness: *fitness,
                genome: genome.to_vec(),
                worker: worker.to_string(),
            });
        }

        self.round += 1;
        if self.round >= self.config.every {
            outcome.flushed = Some(self.flush());
        }

        outcome.saved = self.service_save();
        Ok(outcome)
    }

    fn validate(&self, payload: &ElitePayload, restored: Option<&[EliteEntry]>) -> Result<(), AggregationError> {
        let top = self.config.top;

        if payload.version != ELITE_PAYLOAD_VERSION {
            return Err(AggregationError::UnsupportedVersion {
                expected: ELITE_PAYLOAD_VERSION,
                got: payload.version,
            });
        }
        if payload.fitnesses.len() != top {
            return Err(AggregationError::FitnessCount {
                expected: top,
                got: payload.fitnesses.len(),
            });
        }

        // Once anything is held, every genome has to match its length
        let agreed = match restored {
            Some(entries) => entries.first(),
            None => self.elites.first().or_else(|| self.buffer.first()),
        }
        .map(|e| e.genome.len());
        if let Some(expected) = agreed {
            if payload.genome_size != expected {
                return Err(AggregationError::GenomeSize {
                    expected,
                    got: payload.genome_size,
                });
            }
        }
        if payload.genome_size == 0 {
            return Err(AggregationError::GenomeSize {
                expected: agreed.unwrap_or(1),
                got: 0,
            });
        }

        let Some(expected_bytes) = payload.genome_size.checked_mul(top) else {
            return Err(AggregationError::GenomeTooLarge {
                genome_size: payload.genome_size,
            });
        };
        if payload.genomes.len() != expected_bytes {
            return Err(AggregationError::GenomeBytes {
                expected: expected_bytes,
                got: payload.genomes.len(),
            });
        }

        if let Some(index) = payload.fitnesses.iter().position(|f| f.is_nan()) {
            return Err(AggregationError::NanFitness { index });
        }

        Ok(())
    }

    fn flush(&mut self) -> Vec<EliteEntry> {
        let mut merged = std::mem::take(&mut self.elites);
        merged.append(&mut self.buffer);
        rank(&mut merged, self.config.optimize);
        merged.truncate(self.config.top);

        log::debug!(
            "Elite flush: {} entries, best fitness {:?}",
            merged.len(),
            merged.first().map(|e| e.fitness)
        );

        self.elites = merged;
        self.round = 0;
        self.elites.clone()
    }

    /// Read the pending restore source without touching held state
    fn load_pending_restore(&self) -> Option<LoadedElites> {
        let source = self.pending_restore.as_ref()?;

        match load_snapshot(source) {
            Ok(snapshot) => {
                let loaded = snapshot.entries.len();
                let mut entries = snapshot.entries;
                rank(&mut entries, self.config.optimize);
                entries.truncate(self.config.top);
                Some(LoadedElites { entries, loaded })
            }
            Err(e) => {
                log::error!("Elite list restore failed (request kept): {:#}", e);
                None
            }
        }
    }

    fn commit_restore(&mut self, restored: LoadedElites) -> usize {
        let LoadedElites { entries, loaded } = restored;
        self.elites = entries;
        self.buffer.clear();
        self.round = self.config.every.min(loaded);

        if let Some(source) = self.pending_restore.take() {
            log::info!(
                "Elite list restored from {}, {} entries, round {}",
                source.display(),
                loaded,
                self.round
            );
        }
        loaded
    }

    fn service_save(&mut self) -> Option<PathBuf> {
        let target = self.pending_save.as_ref()?;

        let snapshot = EliteSnapshot::new(self.config.optimize, self.elites.clone());
        match save_snapshot(target, &snapshot) {
            Ok(()) => {
                log::info!("Elite list saved to {}", target.display());
                self.pending_save.take()
            }
            Err(e) => {
                log::error!("Elite list save failed (request kept): {:#}", e);
                None
            }
        }
    }
}

/// Stable sort, better fitness first; ties keep their existing order
fn rank(entries: &mut [EliteEntry], optimize: OptimizeDirection) {
    entries.sort_by(|a, b| optimize.rank(a.fitness, b.fitness));
}
