//! GASwarm - coordinator for distributed genetic-algorithm workers
//!
//! GASwarm sits between a pool of remote GA workers and a set of observers
//! (one controller, any number of viewers). It relays operator commands to
//! the workers, collects their progress reports, and merges the best
//! candidates of every worker into one globally ranked elite set.
//!
//! # Architecture
//!
//! - **Framed transport**: DLE-delimited MessagePack frames over TCP to workers
//! - **Registry**: connected workers and observer sessions
//! - **Elite aggregator**: round-batched top-K merge with save/restore
//! - **Dispatcher**: command state machine and report routing
//! - **Notification relay**: typed callbacks for embedding code
//! - **Coordinator**: single event loop that owns all of the above

pub mod config;
pub mod coordinator;
pub mod dispatcher;
pub mod elite;
pub mod observer;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod transport;

// Re-export commonly used types
pub use config::CoordinatorConfig;
pub use coordinator::Coordinator;
pub use elite::{AggregationConfig, EliteAggregator, EliteEntry};
pub use relay::NotificationRelay;
