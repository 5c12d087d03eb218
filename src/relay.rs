//! Notification relay
//!
//! Lets embedding code observe coordinator events without touching the
//! transport. Handlers subscribe to one of a fixed set of event names and
//! receive the event data as JSON.
//!
//! A failing handler (error or panic) is logged and skipped; the remaining
//! handlers still run and the publisher never sees the failure.

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// Event names a handler can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A worker registered
    Connected,
    /// A worker went away
    Disconnected,
    /// A worker answered a statistics or best query
    Message,
}

impl EventKind {
    pub const ALL: [EventKind; 3] = [EventKind::Connected, EventKind::Disconnected, EventKind::Message];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Connected => "connected",
            EventKind::Disconnected => "disconnected",
            EventKind::Message => "message",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| RelayError::UnknownEvent(s.to_string()))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("unknown event name '{0}' (expected connected, disconnected or message)")]
    UnknownEvent(String),

    #[error("no subscription {id} for event '{kind}'")]
    UnknownSubscription { kind: EventKind, id: SubscriptionId },
}

/// Event handler
pub type Handler = Arc<dyn Fn(&Value) -> anyhow::Result<()> + Send + Sync>;

/// Identifies one subscription, for `unsubscribe`
pub type SubscriptionId = u64;

/// Typed callback registry
#[derive(Default)]
pub struct NotificationRelay {
    handlers: HashMap<EventKind, Vec<(SubscriptionId, Handler)>>,
    next_id: SubscriptionId,
}

impl NotificationRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a handler by event name
    ///
    /// Unknown names are rejected.
    pub fn subscribe<F>(&mut self, name: &str, handler: F) -> Result<SubscriptionId, RelayError>
    where
        F: Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let kind: EventKind = name.parse()?;
        Ok(self.subscribe_kind(kind, Arc::new(handler)))
    }

    /// Subscribe a handler to an already-parsed event kind
    pub fn subscribe_kind(&mut self, kind: EventKind, handler: Handler) -> SubscriptionId {
        self.next_id += 1;
        let id = self.next_id;
        self.handlers.entry(kind).or_default().push((id, handler));
        id
    }

    /// Remove a subscription
    pub fn unsubscribe(&mut self, name: &str, id: SubscriptionId) -> Result<(), RelayError> {
        let kind: EventKind = name.parse()?;
        let handlers = self.handlers.entry(kind).or_default();
        let before = handlers.len();
        handlers.retain(|(sub, _)| *sub != id);

        if handlers.len() == before {
            return Err(RelayError::UnknownSubscription { kind, id });
        }
        Ok(())
    }

    /// Number of handlers subscribed to an event
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.handlers.get(&kind).map_or(0, Vec::len)
    }

    /// Invoke every handler subscribed to `kind`
    ///
    /// Returns how many handlers completed successfully.
    pub fn publish(&self, kind: EventKind, data: &Value) -> usize {
        let Some(handlers) = self.handlers.get(&kind) else {
            return 0;
        };

        let mut succeeded = 0;
        for (id, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(data))) {
                Ok(Ok(())) => succeeded += 1,
                Ok(Err(e)) => {
                    log::error!("Exception while executing '{}' callback {}: {:#}", kind, id, e);
                }
                Err(_) => {
                    log::error!("'{}' callback {} panicked", kind, id);
                }
            }
        }
        succeeded
    }
}

impl fmt::Debug for NotificationRelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: HashMap<&str, usize> = self
            .handlers
            .iter()
            .map(|(kind, handlers)| (kind.as_str(), handlers.len()))
            .collect();
        f.debug_struct("NotificationRelay").field("handlers", &counts).finish()
    }
}
