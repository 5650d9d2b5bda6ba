use crate::buffer::BoundedBuffer;
use crate::error::{PipelineError, Result};
use crate::event::{Event, ObserverSet};
use crate::metrics::LoopMetrics;
use crate::rate::{validate_rate, AtomicRate, Pacing, RateLimiter, DEFAULT_RATE};
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Items flowing through the pipeline: single-character strings
pub type Item = String;

/// Identifies an agent for rate updates and events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentId {
    Producer,
    /// A consumer, numbered from 1
    Consumer(u8),
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentId::Producer => write!(f, "producer"),
            AgentId::Consumer(n) => write!(f, "consumer-{}", n),
        }
    }
}

/// Which operation a rate applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateKind {
    Produce,
    Move,
    Get,
}

impl fmt::Display for RateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateKind::Produce => write!(f, "produce"),
            RateKind::Move => write!(f, "move"),
            RateKind::Get => write!(f, "get"),
        }
    }
}

/// Synthesizes the items a producer puts
pub trait ItemSource: Send {
    fn next_item(&mut self) -> Item;
}

impl<F> ItemSource for F
where
    F: FnMut() -> Item + Send,
{
    fn next_item(&mut self) -> Item {
        self()
    }
}

/// Uniform draw from ASCII letters and digits
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomAlphanumeric;

impl ItemSource for RandomAlphanumeric {
    fn next_item(&mut self) -> Item {
        char::from(rand::thread_rng().sample(Alphanumeric)).to_string()
    }
}

/// Fills one destination buffer at its configured rate
pub struct Producer {
    destination: Arc<BoundedBuffer<Item>>,
    rate: AtomicRate,
    source: Mutex<Box<dyn ItemSource>>,
}

impl Producer {
    /// Create a new producer filling `destination` at `rate` items/second.
    ///
    /// Fails with `InvalidConfiguration` for a non-positive or non-finite rate.
    pub fn new(
        destination: Arc<BoundedBuffer<Item>>,
        rate: f64,
        source: Box<dyn ItemSource>,
    ) -> Result<Self> {
        let rate = validate_rate(rate)?;
        tracing::info!(buffer = destination.id(), rate, "producer initialized");
        Ok(Self {
            destination,
            rate: AtomicRate::new(rate),
            source: Mutex::new(source),
        })
    }

    /// Get the buffer this producer fills
    pub fn destination(&self) -> &Arc<BoundedBuffer<Item>> {
        &self.destination
    }

    /// Get the current produce rate
    pub fn rate(&self) -> f64 {
        self.rate.load()
    }

    /// Set the produce rate. An invalid value leaves the old rate in place.
    pub fn set_rate(&self, value: f64) -> Result<()> {
        self.rate.store(validate_rate(value)?);
        Ok(())
    }

    /// Synthesize one item and put it, blocking while the destination is full
    pub fn produce(&self) -> Result<Item> {
        let item = self.source.lock().next_item();
        let item = self.destination.put(item)?;
        tracing::debug!(buffer = self.destination.id(), %item, "producer put");
        Ok(item)
    }
}

impl fmt::Debug for Producer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("destination", &self.destination.id())
            .field("rate", &self.rate())
            .finish()
    }
}

/// Owns a home buffer; moves items into it from upstream and drains it
pub struct Consumer {
    id: AgentId,
    home: Arc<BoundedBuffer<Item>>,
    get_rate: AtomicRate,
    move_rate: AtomicRate,
}

impl Consumer {
    /// Create a new consumer numbered `index` that owns `home`
    pub fn new(
        index: u8,
        home: Arc<BoundedBuffer<Item>>,
        get_rate: f64,
        move_rate: f64,
    ) -> Result<Self> {
        let get_rate = validate_rate(get_rate)?;
        let move_rate = validate_rate(move_rate)?;
        tracing::info!(
            consumer = index,
            buffer = home.id(),
            get_rate,
            move_rate,
            "consumer initialized"
        );
        Ok(Self {
            id: AgentId::Consumer(index),
            home,
            get_rate: AtomicRate::new(get_rate),
            move_rate: AtomicRate::new(move_rate),
        })
    }

    pub fn id(&self) -> AgentId {
        self.id
    }

    /// Get the buffer this consumer owns
    pub fn home(&self) -> &Arc<BoundedBuffer<Item>> {
        &self.home
    }

    /// Current rate for `kind`; `None` for kinds a consumer does not run
    pub fn rate(&self, kind: RateKind) -> Option<f64> {
        match kind {
            RateKind::Get => Some(self.get_rate.load()),
            RateKind::Move => Some(self.move_rate.load()),
            RateKind::Produce => None,
        }
    }

    /// Set the get or move rate; a produce rate is rejected
    pub fn set_rate(&self, kind: RateKind, value: f64) -> Result<()> {
        let slot = match kind {
            RateKind::Get => &self.get_rate,
            RateKind::Move => &self.move_rate,
            RateKind::Produce => {
                return Err(PipelineError::config(format!(
                    "{} has no produce rate",
                    self.id
                )))
            }
        };
        slot.store(validate_rate(value)?);
        Ok(())
    }

    /// Take the oldest item from `source` and put it into the home buffer.
    ///
    /// The two buffers are used one after the other: the source lock is
    /// released before the home buffer is touched, so a consumer never
    /// holds or waits on two buffers at once.
    pub fn move_from(&self, source: &BoundedBuffer<Item>) -> Result<Item> {
        let item = source.get();
        let item = self.home.put(item)?;
        tracing::debug!(
            consumer = %self.id,
            source = source.id(),
            dest = self.home.id(),
            %item,
            "consumer moved"
        );
        Ok(item)
    }

    /// Drain one item from the home buffer, blocking while it is empty
    pub fn get(&self) -> Item {
        let item = self.home.get();
        tracing::debug!(consumer = %self.id, buffer = self.home.id(), %item, "consumer got");
        item
    }
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("id", &self.id)
            .field("home", &self.home.id())
            .field("get_rate", &self.get_rate.load())
            .field("move_rate", &self.move_rate.load())
            .finish()
    }
}

/// One rate-limited operation an agent loop repeats
pub trait LoopOperation: Send + 'static {
    /// Agent the loop belongs to
    fn agent(&self) -> AgentId;

    fn kind(&self) -> RateKind;

    /// Rate read fresh before every iteration
    fn rate(&self) -> f64;

    /// Perform the operation once and describe what happened
    fn step(&mut self) -> Result<Event>;
}

/// Producer loop body
pub struct ProduceOp {
    producer: Arc<Producer>,
}

impl ProduceOp {
    /// Create a new produce loop body
    pub fn new(producer: Arc<Producer>) -> Self {
        Self { producer }
    }
}

impl LoopOperation for ProduceOp {
    fn agent(&self) -> AgentId {
        AgentId::Producer
    }

    fn kind(&self) -> RateKind {
        RateKind::Produce
    }

    fn rate(&self) -> f64 {
        self.producer.rate()
    }

    fn step(&mut self) -> Result<Event> {
        let item = self.producer.produce()?;
        Ok(Event::Produced {
            item,
            buffer: self.producer.destination().id(),
        })
    }
}

/// Consumer transfer loop body
pub struct MoveOp {
    consumer: Arc<Consumer>,
    source: Arc<BoundedBuffer<Item>>,
}

impl MoveOp {
    /// Create a new loop body moving from `source` into the consumer's home
    pub fn new(consumer: Arc<Consumer>, source: Arc<BoundedBuffer<Item>>) -> Self {
        Self { consumer, source }
    }
}

impl LoopOperation for MoveOp {
    fn agent(&self) -> AgentId {
        self.consumer.id()
    }

    fn kind(&self) -> RateKind {
        RateKind::Move
    }

    fn rate(&self) -> f64 {
        self.consumer.rate(RateKind::Move).unwrap_or(DEFAULT_RATE)
    }

    fn step(&mut self) -> Result<Event> {
        let item = self.consumer.move_from(&self.source)?;
        Ok(Event::Moved {
            item,
            consumer: self.consumer.id(),
            source: self.source.id(),
            dest: self.consumer.home().id(),
        })
    }
}

/// Consumer drain loop body
pub struct GetOp {
    consumer: Arc<Consumer>,
}

impl GetOp {
    /// Create a new drain loop body
    pub fn new(consumer: Arc<Consumer>) -> Self {
        Self { consumer }
    }
}

impl LoopOperation for GetOp {
    fn agent(&self) -> AgentId {
        self.consumer.id()
    }

    fn kind(&self) -> RateKind {
        RateKind::Get
    }

    fn rate(&self) -> f64 {
        self.consumer.rate(RateKind::Get).unwrap_or(DEFAULT_RATE)
    }

    fn step(&mut self) -> Result<Event> {
        let item = self.consumer.get();
        Ok(Event::Consumed {
            item,
            consumer: self.consumer.id(),
            buffer: self.consumer.home().id(),
        })
    }
}

/// Drives a [`LoopOperation`] until the running flag is cleared.
///
/// Each iteration throttles, runs the operation once and publishes the
/// resulting event. Failed iterations are logged and reported; anything
/// other than an invalid item also backs off before the next iteration.
pub struct AgentLoop {
    running: Arc<AtomicBool>,
    limiter: RateLimiter,
    metrics: LoopMetrics,
    observers: Arc<ObserverSet>,
    fault_backoff: Duration,
}

impl AgentLoop {
    /// Create a new loop that runs while `running` is set
    pub fn new(
        running: Arc<AtomicBool>,
        observers: Arc<ObserverSet>,
        fault_backoff: Duration,
    ) -> Self {
        Self {
            running,
            limiter: RateLimiter::new(),
            metrics: LoopMetrics::new(),
            observers,
            fault_backoff,
        }
    }

    /// Get the metrics recorded so far
    pub fn metrics(&self) -> &LoopMetrics {
        &self.metrics
    }

    /// Run the loop on the calling thread. Returns once the running flag is
    /// observed false at an iteration boundary or during a throttle wait.
    pub fn run(&mut self, mut op: Box<dyn LoopOperation>) {
        let agent = op.agent();
        let kind = op.kind();
        let mut warned = false;
        tracing::info!(%agent, %kind, "loop started");

        while self.running.load(Ordering::Acquire) {
            let running = &self.running;
            match self
                .limiter
                .throttle_while(op.rate(), || running.load(Ordering::Acquire))
            {
                Pacing::Cancelled => break,
                Pacing::Substituted { requested } => {
                    if !warned {
                        tracing::warn!(%agent, %kind, requested, "invalid rate, using default");
                        self.observers.notify(Event::RateWarning {
                            agent,
                            kind,
                            requested,
                            substituted: DEFAULT_RATE,
                        });
                        warned = true;
                    }
                }
                Pacing::Paced => warned = false,
            }

            let start = Instant::now();
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| op.step()))
                .unwrap_or_else(|payload| Err(PipelineError::AgentLoopFault(panic_message(payload))));

            match outcome {
                Ok(event) => {
                    self.metrics.record_completed(start.elapsed());
                    self.observers.notify(event);
                }
                Err(error @ PipelineError::InvalidItem(_)) => {
                    self.metrics.record_invalid_item();
                    tracing::warn!(%agent, %kind, %error, "skipping invalid item");
                    self.observers.notify(Event::LoopFault { agent, kind, error });
                }
                Err(error) => {
                    self.metrics.record_fault();
                    let error = if matches!(error, PipelineError::AgentLoopFault(_)) {
                        error
                    } else {
                        PipelineError::AgentLoopFault(error.to_string())
                    };
                    tracing::error!(%agent, %kind, %error, "loop iteration failed");
                    self.observers.notify(Event::LoopFault { agent, kind, error });
                    thread::sleep(self.fault_backoff);
                }
            }
        }

        tracing::info!(%agent, %kind, "loop exited");
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", msg)
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("panicked: {}", msg)
    } else {
        "panicked".to_string()
    }
}
