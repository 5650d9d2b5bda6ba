use crate::error::{PipelineError, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier of a buffer within a pipeline
pub type BufferId = u32;

/// Contract an item must satisfy before it may enter a buffer
pub trait Payload: Clone + Send + fmt::Debug + 'static {
    /// Check the item's shape, returning a description of the violation
    fn validate(&self) -> std::result::Result<(), String>;
}

/// Strings must hold exactly one character
impl Payload for String {
    fn validate(&self) -> std::result::Result<(), String> {
        let mut chars = self.chars();
        match (chars.next(), chars.next()) {
            (Some(_), None) => Ok(()),
            _ => Err(format!("expected exactly one character, got {:?}", self)),
        }
    }
}

impl Payload for char {
    fn validate(&self) -> std::result::Result<(), String> {
        Ok(())
    }
}

impl Payload for u64 {
    fn validate(&self) -> std::result::Result<(), String> {
        Ok(())
    }
}

struct State<T> {
    items: VecDeque<T>,
    capacity: usize,
}

/// A resizable FIFO queue with blocking put/get.
///
/// All state lives behind one mutex; `resize` takes the same lock as
/// `put`/`get`, so it is linearizable with them. Waiters always re-check
/// their condition after waking.
pub struct BoundedBuffer<T> {
    id: BufferId,
    state: Mutex<State<T>>,
    not_full: Condvar,
    not_empty: Condvar,
    block_count: AtomicU64,
}

impl<T: Payload> BoundedBuffer<T> {
    /// Create an empty buffer. A zero capacity is rejected.
    pub fn new(id: BufferId, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(PipelineError::config(format!(
                "buffer {} capacity must be positive",
                id
            )));
        }
        tracing::info!(buffer = id, capacity, "buffer initialized");
        Ok(Self {
            id,
            state: Mutex::new(State {
                items: VecDeque::new(),
                capacity,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            block_count: AtomicU64::new(0),
        })
    }

    /// Identifier of this buffer
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Append an item, blocking while the buffer is full.
    ///
    /// An item failing [`Payload::validate`] is rejected immediately with
    /// `InvalidItem` and the buffer is not touched.
    pub fn put(&self, item: T) -> Result<T> {
        item.validate().map_err(PipelineError::InvalidItem)?;

        let mut state = self.state.lock();
        if state.items.len() >= state.capacity {
            self.block_count.fetch_add(1, Ordering::Relaxed);
        }
        while state.items.len() >= state.capacity {
            tracing::trace!(buffer = self.id, "buffer full, put waiting");
            self.not_full.wait(&mut state);
        }

        state.items.push_back(item.clone());
        tracing::trace!(buffer = self.id, ?item, len = state.items.len(), "put");
        drop(state);
        self.not_empty.notify_all();
        Ok(item)
    }

    /// Remove the oldest item, blocking while the buffer is empty
    pub fn get(&self) -> T {
        let mut state = self.state.lock();
        if state.items.is_empty() {
            self.block_count.fetch_add(1, Ordering::Relaxed);
        }
        let item = loop {
            match state.items.pop_front() {
                Some(item) => break item,
                None => {
                    tracing::trace!(buffer = self.id, "buffer empty, get waiting");
                    self.not_empty.wait(&mut state);
                }
            }
        };
        tracing::trace!(buffer = self.id, ?item, len = state.items.len(), "get");
        drop(state);
        self.not_full.notify_all();
        item
    }

    /// Point-in-time hint that a put would not block
    pub fn can_put(&self) -> bool {
        let state = self.state.lock();
        state.items.len() < state.capacity
    }

    /// Point-in-time hint that a get would not block
    pub fn can_get(&self) -> bool {
        !self.state.lock().items.is_empty()
    }

    /// Change the capacity, keeping the oldest `new_capacity` items.
    ///
    /// Returns `false` without touching anything when `new_capacity` is zero.
    pub fn resize(&self, new_capacity: usize) -> bool {
        if new_capacity == 0 {
            tracing::warn!(buffer = self.id, "rejected resize to zero capacity");
            return false;
        }

        let mut state = self.state.lock();
        let dropped = state.items.len().saturating_sub(new_capacity);
        state.items.truncate(new_capacity);
        let old_capacity = state.capacity;
        state.capacity = new_capacity;
        drop(state);

        tracing::debug!(
            buffer = self.id,
            old_capacity,
            new_capacity,
            dropped,
            "buffer resized"
        );
        self.not_full.notify_all();
        self.not_empty.notify_all();
        true
    }

    /// Consistent view of length, capacity and contents
    pub fn snapshot(&self) -> BufferSnapshot<T> {
        let state = self.state.lock();
        BufferSnapshot {
            id: self.id,
            len: state.items.len(),
            capacity: state.capacity,
            items: state.items.iter().cloned().collect(),
        }
    }

    /// Current number of items
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Check if the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current capacity
    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    /// Number of put/get calls that had to wait
    pub fn block_count(&self) -> u64 {
        self.block_count.load(Ordering::Relaxed)
    }
}

impl<T: Payload> fmt::Debug for BoundedBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("BoundedBuffer")
            .field("id", &snapshot.id)
            .field("capacity", &snapshot.capacity)
            .field("items", &snapshot.items)
            .finish()
    }
}

/// A consistent copy of one buffer's state
#[derive(Debug, Clone, PartialEq)]
pub struct BufferSnapshot<T> {
    pub id: BufferId,
    pub len: usize,
    pub capacity: usize,
    pub items: Vec<T>,
}

impl<T> BufferSnapshot<T> {
    /// Fill level as a percentage (0-100)
    pub fn utilization(&self) -> u32 {
        ((self.len * 100) / self.capacity.max(1)).min(100) as u32
    }
}

impl<T: fmt::Display> fmt::Display for BufferSnapshot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Buffer{} [", self.id)?;
        for (i, item) in self.items.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", item)?;
        }
        write!(f, "] {}/{}", self.len, self.capacity)
    }
}
