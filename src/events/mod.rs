//! System event bus for host lifecycle signals
//!
//! The embedding host (a container runtime, a platform supervisor, a
//! test) publishes lifecycle events here and the crawler reacts to
//! them: `Migrating` and `Aborting` trigger a pool pause followed by a
//! best-effort checkpoint, `PersistState` triggers a checkpoint alone.
//! The bus is an explicit object scoped to the crawler's lifetime
//! rather than a process-wide singleton; the crawler installs its
//! subscription when `run()` starts and drops it on return.

use std::fmt;

use tokio::sync::broadcast;

/// Default buffered capacity of the broadcast channel.
const DEFAULT_CAPACITY: usize = 64;

/// Lifecycle signal delivered to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SystemEvent {
    /// The process is about to be relocated to another host.
    Migrating,
    /// The process is being aborted by the supervisor.
    Aborting,
    /// Checkpoint now, without pausing work.
    PersistState,
}

impl fmt::Display for SystemEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Migrating => "MIGRATING",
            Self::Aborting => "ABORTING",
            Self::PersistState => "PERSIST_STATE",
        };
        write!(f, "{name}")
    }
}

/// Errors from publishing to the bus.
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    /// Nobody is listening; the event was dropped.
    #[error("no active subscribers")]
    NoSubscribers,
}

/// Broadcast bus carrying [`SystemEvent`]s to any number of
/// subscribers.
#[derive(Debug)]
pub struct EventBus {
    sender: broadcast::Sender<SystemEvent>,
}

impl EventBus {
    /// Create a bus able to buffer `capacity` undelivered events per
    /// subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to all future events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SystemEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to every current subscriber. Returns the number
    /// of subscribers that will receive it.
    pub fn publish(&self, event: SystemEvent) -> Result<usize, EventBusError> {
        self.sender
            .send(event)
            .map_err(|_| EventBusError::NoSubscribers)
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    #[must_use]
    pub fn has_subscribers(&self) -> bool {
        self.subscriber_count() > 0
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
