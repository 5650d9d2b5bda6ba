use crate::agent::{AgentId, Item, RateKind};
use crate::buffer::BufferId;
use crate::error::PipelineError;
use crate::pipeline::PipelineStatus;
use crossbeam::channel::{Sender, TrySendError};
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Notification pushed to observers. Delivery is fire-and-forget.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// The producer put an item into the stage-1 buffer
    Produced { item: Item, buffer: BufferId },
    /// A consumer transferred an item from the stage-1 buffer into its home buffer
    Moved {
        item: Item,
        consumer: AgentId,
        source: BufferId,
        dest: BufferId,
    },
    /// A consumer drained an item from its home buffer
    Consumed {
        item: Item,
        consumer: AgentId,
        buffer: BufferId,
    },
    /// A resize was applied or rejected
    Resized {
        buffer: BufferId,
        capacity: usize,
        success: bool,
    },
    /// A rate update was applied or rejected
    RateChanged {
        agent: AgentId,
        kind: RateKind,
        value: f64,
        success: bool,
    },
    /// A loop found an invalid rate and fell back to a default
    RateWarning {
        agent: AgentId,
        kind: RateKind,
        requested: f64,
        substituted: f64,
    },
    /// A loop iteration failed; the loop carries on
    LoopFault {
        agent: AgentId,
        kind: RateKind,
        error: PipelineError,
    },
    Started,
    Stopped,
    /// Periodic status published by the status loop
    Status(PipelineStatus),
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Produced { item, buffer } => {
                write!(f, "produced '{}' into buffer {}", item, buffer)
            }
            Event::Moved {
                item,
                consumer,
                source,
                dest,
            } => write!(
                f,
                "{} moved '{}' from buffer {} to buffer {}",
                consumer, item, source, dest
            ),
            Event::Consumed {
                item,
                consumer,
                buffer,
            } => write!(f, "{} consumed '{}' from buffer {}", consumer, item, buffer),
            Event::Resized {
                buffer,
                capacity,
                success: true,
            } => write!(f, "buffer {} resized to {}", buffer, capacity),
            Event::Resized {
                buffer, capacity, ..
            } => write!(f, "rejected resize of buffer {} to {}", buffer, capacity),
            Event::RateChanged {
                agent,
                kind,
                value,
                success: true,
            } => write!(f, "{} {} rate set to {}", agent, kind, value),
            Event::RateChanged {
                agent, kind, value, ..
            } => write!(f, "rejected {} {} rate {}", agent, kind, value),
            Event::RateWarning {
                agent,
                kind,
                requested,
                substituted,
            } => write!(
                f,
                "{} {} rate {} is invalid, using {}",
                agent, kind, requested, substituted
            ),
            Event::LoopFault { agent, kind, error } => {
                write!(f, "{} {} loop fault: {}", agent, kind, error)
            }
            Event::Started => write!(f, "pipeline started"),
            Event::Stopped => write!(f, "pipeline stopped"),
            Event::Status(status) => {
                write!(f, "status:")?;
                for buffer in &status.buffers {
                    write!(f, " {}", buffer)?;
                }
                Ok(())
            }
        }
    }
}

/// Receiver of pipeline events.
///
/// Called on agent threads; implementations must not block for long.
pub trait Observer: Send + Sync {
    /// Handle one event
    fn on_event(&self, event: &Event);

    /// True once the observer can no longer receive events; it is then
    /// removed from its [`ObserverSet`]
    fn is_closed(&self) -> bool {
        false
    }
}

impl<F> Observer for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn on_event(&self, event: &Event) {
        self(event)
    }
}

/// The observers attached to one pipeline
#[derive(Default)]
pub struct ObserverSet {
    observers: RwLock<Vec<Arc<dyn Observer>>>,
}

impl ObserverSet {
    /// Create an empty observer set
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an observer
    pub fn add(&self, observer: Arc<dyn Observer>) {
        self.observers.write().push(observer);
    }

    /// Number of attached observers
    pub fn len(&self) -> usize {
        self.observers.read().len()
    }

    /// Check if no observer is attached
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `event` to every observer, then drop the closed ones
    pub fn notify(&self, event: Event) {
        let mut any_closed = false;
        for observer in self.observers.read().iter() {
            observer.on_event(&event);
            any_closed |= observer.is_closed();
        }

        if any_closed {
            let mut observers = self.observers.write();
            let before = observers.len();
            observers.retain(|o| !o.is_closed());
            tracing::trace!(removed = before - observers.len(), "pruned closed observers");
        }
    }
}

impl fmt::Debug for ObserverSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverSet")
            .field("observers", &self.len())
            .finish()
    }
}

/// Forwards events into a crossbeam channel without ever blocking.
///
/// Closes itself the first time a send finds the receiver gone.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    sender: Sender<Event>,
    closed: Arc<AtomicBool>,
}

impl ChannelObserver {
    /// Create a new observer sending into `sender`
    pub fn new(sender: Sender<Event>) -> Self {
        Self {
            sender,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Observer for ChannelObserver {
    fn on_event(&self, event: &Event) {
        match self.sender.try_send(event.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => tracing::trace!("event channel full, dropping event"),
            Err(TrySendError::Disconnected(_)) => self.closed.store(true, Ordering::Relaxed),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}

/// Writes every event as one tracing record
#[derive(Debug, Clone, Copy, Default)]
pub struct LogObserver;

impl Observer for LogObserver {
    fn on_event(&self, event: &Event) {
        match event {
            Event::Produced { .. } | Event::Moved { .. } | Event::Consumed { .. } => {
                tracing::debug!(target: "staged_pipeline::events", "{}", event)
            }
            Event::Resized { success: false, .. }
            | Event::RateChanged { success: false, .. }
            | Event::RateWarning { .. } => {
                tracing::warn!(target: "staged_pipeline::events", "{}", event)
            }
            Event::LoopFault { .. } => {
                tracing::error!(target: "staged_pipeline::events", "{}", event)
            }
            _ => tracing::info!(target: "staged_pipeline::events", "{}", event),
        }
    }
}
