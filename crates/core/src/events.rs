//! Event System
//!
//! Pub/sub bus carrying build progress from the pipeline to whoever is
//! watching (the CLI, tests).

use std::path::PathBuf;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::RwLock;
use tracing::trace;

use crate::abi::Abi;
use crate::error::Stage;

/// Progress events emitted by the pipeline
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    StageStarted { stage: Stage },
    StageCompleted { stage: Stage, elapsed: Duration },
    /// A toolchain component is being downloaded
    ToolchainFetch { component: String, version: String },
    /// A dependency source is being fetched into the store
    DependencyFetch { name: String, version: String },
    /// A cached result was reused instead of doing the work
    CacheHit { stage: Stage, key: String },
    Compiling { dependency: String, abi: Abi },
    AbiFailed { abi: Abi, failures: usize },
    Warning { message: String },
    BuildCompleted { success: bool, artifact: Option<PathBuf> },
}

/// Subscriber handle for receiving events
#[derive(Clone)]
pub struct EventSubscription {
    receiver: Receiver<Event>,
}

impl EventSubscription {
    /// Receive the next event (blocking)
    pub fn recv(&self) -> Result<Event, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking)
    pub fn try_recv(&self) -> Result<Event, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Drain every event currently queued
    pub fn drain(&self) -> Vec<Event> {
        self.receiver.try_iter().collect()
    }

    /// Get an iterator over events; ends when the bus is dropped
    pub fn iter(&self) -> impl Iterator<Item = Event> + '_ {
        self.receiver.iter()
    }
}

/// Event bus for publish/subscribe pattern
pub struct EventBus {
    subscribers: RwLock<Vec<Sender<Event>>>,
}

impl EventBus {
    /// Create a new event bus
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> EventSubscription {
        let (sender, receiver) = unbounded();
        self.subscribers.write().push(sender);
        EventSubscription { receiver }
    }

    /// Emit an event to all subscribers, returning how many received it.
    /// Subscribers whose receiving end was dropped are removed.
    pub fn emit(&self, event: Event) -> usize {
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|sender| sender.send(event.clone()).is_ok());
        let delivered = subscribers.len();

        trace!("Event {:?} delivered to {} subscribers", event, delivered);
        delivered
    }

    /// Get the number of registered subscribers
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
