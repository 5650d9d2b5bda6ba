use crate::agent::{
    AgentId, AgentLoop, Consumer, GetOp, Item, ItemSource, LoopOperation, MoveOp, ProduceOp,
    Producer, RandomAlphanumeric, RateKind,
};
use crate::buffer::{BoundedBuffer, BufferId, BufferSnapshot};
use crate::error::{PipelineError, Result};
use crate::event::{ChannelObserver, Event, Observer, ObserverSet};
use crate::metrics::{LoopMetrics, MetricsSnapshot};
use crate::rate::{validate_rate, Pacing, RateLimiter};
use crossbeam::channel::{unbounded, Receiver};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Id of the buffer the producer fills and both consumers move from
pub const STAGE1_BUFFER: BufferId = 1;

/// Number of consumers in the topology
pub const CONSUMER_COUNT: usize = 2;

/// Home buffer id of consumer `index` (1-based)
pub fn home_buffer_id(index: u8) -> BufferId {
    STAGE1_BUFFER + BufferId::from(index)
}

/// Tunables for a pipeline. Capacities and rates stay adjustable after build.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub stage1_capacity: usize,
    /// Home buffer capacity per consumer
    pub home_capacities: [usize; CONSUMER_COUNT],
    /// Producer rate in operations/second
    pub produce_rate: f64,
    pub get_rates: [f64; CONSUMER_COUNT],
    pub move_rates: [f64; CONSUMER_COUNT],
    /// Pause after a faulted loop iteration
    pub fault_backoff: Duration,
    /// How long `stop` waits for loops before detaching them
    pub stop_grace: Duration,
    /// Period of the status loop; `None` disables it
    pub status_interval: Option<Duration>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stage1_capacity: 8,
            home_capacities: [4, 4],
            produce_rate: 2.0,
            get_rates: [1.0, 1.0],
            move_rates: [2.0, 2.0],
            fault_backoff: Duration::from_millis(100),
            stop_grace: Duration::from_secs(2),
            status_interval: None,
        }
    }
}

impl PipelineConfig {
    /// Check every capacity and rate
    pub fn validate(&self) -> Result<()> {
        if self.stage1_capacity == 0 {
            return Err(PipelineError::config("stage-1 capacity must be positive"));
        }
        for (i, capacity) in self.home_capacities.iter().enumerate() {
            if *capacity == 0 {
                return Err(PipelineError::config(format!(
                    "consumer-{} home capacity must be positive",
                    i + 1
                )));
            }
        }
        validate_rate(self.produce_rate)?;
        for rate in self.get_rates.iter().chain(self.move_rates.iter()) {
            validate_rate(*rate)?;
        }
        if self.status_interval == Some(Duration::ZERO) {
            return Err(PipelineError::config("status interval must be positive"));
        }
        Ok(())
    }
}

/// Builder for constructing pipelines
pub struct PipelineBuilder {
    config: PipelineConfig,
    observers: Vec<Arc<dyn Observer>>,
    source: Option<Box<dyn ItemSource>>,
    invalid: Option<PipelineError>,
}

impl PipelineBuilder {
    /// Create a new builder starting from [`PipelineConfig::default`]
    pub fn new() -> Self {
        Self {
            config: PipelineConfig::default(),
            observers: Vec::new(),
            source: None,
            invalid: None,
        }
    }

    /// Replace the whole configuration
    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Capacity of the shared stage-1 buffer
    pub fn stage1_capacity(mut self, capacity: usize) -> Self {
        self.config.stage1_capacity = capacity;
        self
    }

    /// Home buffer capacity of consumer `consumer` (1-based)
    pub fn home_capacity(mut self, consumer: u8, capacity: usize) -> Self {
        if let Some(slot) = self.consumer_slot(consumer) {
            self.config.home_capacities[slot] = capacity;
        }
        self
    }

    /// Items per second the producer puts into stage 1
    pub fn produce_rate(mut self, rate: f64) -> Self {
        self.config.produce_rate = rate;
        self
    }

    /// Drain rate of consumer `consumer` (1-based)
    pub fn get_rate(mut self, consumer: u8, rate: f64) -> Self {
        if let Some(slot) = self.consumer_slot(consumer) {
            self.config.get_rates[slot] = rate;
        }
        self
    }

    /// Transfer rate of consumer `consumer` (1-based)
    pub fn move_rate(mut self, consumer: u8, rate: f64) -> Self {
        if let Some(slot) = self.consumer_slot(consumer) {
            self.config.move_rates[slot] = rate;
        }
        self
    }

    /// Pause after a loop fault before the next iteration
    pub fn fault_backoff(mut self, backoff: Duration) -> Self {
        self.config.fault_backoff = backoff;
        self
    }

    /// How long `stop` waits for loops before detaching them
    pub fn stop_grace(mut self, grace: Duration) -> Self {
        self.config.stop_grace = grace;
        self
    }

    /// Publish an `Event::Status` every `interval` while running
    pub fn status_interval(mut self, interval: Duration) -> Self {
        self.config.status_interval = Some(interval);
        self
    }

    /// Attach an observer before the pipeline is built
    pub fn with_observer(mut self, observer: impl Observer + 'static) -> Self {
        self.observers.push(Arc::new(observer));
        self
    }

    /// Replace the producer's default random item source
    pub fn item_source(mut self, source: impl ItemSource + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    fn consumer_slot(&mut self, consumer: u8) -> Option<usize> {
        let slot = usize::from(consumer).checked_sub(1).filter(|s| *s < CONSUMER_COUNT);
        if slot.is_none() && self.invalid.is_none() {
            self.invalid = Some(PipelineError::config(format!(
                "no consumer numbered {}",
                consumer
            )));
        }
        slot
    }

    /// Validate the configuration and build an idle pipeline
    pub fn build(self) -> Result<Pipeline> {
        if let Some(err) = self.invalid {
            return Err(err);
        }
        let config = self.config;
        config.validate()?;

        let stage1 = Arc::new(BoundedBuffer::new(STAGE1_BUFFER, config.stage1_capacity)?);
        let mut buffers = vec![Arc::clone(&stage1)];
        let mut consumers = Vec::with_capacity(CONSUMER_COUNT);
        for slot in 0..CONSUMER_COUNT {
            let index = slot as u8 + 1;
            let home = Arc::new(BoundedBuffer::new(
                home_buffer_id(index),
                config.home_capacities[slot],
            )?);
            buffers.push(Arc::clone(&home));
            consumers.push(Arc::new(Consumer::new(
                index,
                home,
                config.get_rates[slot],
                config.move_rates[slot],
            )?));
        }

        let source = self
            .source
            .unwrap_or_else(|| Box::new(RandomAlphanumeric) as Box<dyn ItemSource>);
        let producer = Arc::new(Producer::new(stage1, config.produce_rate, source)?);

        let observers = Arc::new(ObserverSet::new());
        for observer in self.observers {
            observers.add(observer);
        }

        Ok(Pipeline {
            topology: Arc::new(Topology {
                buffers,
                producer,
                consumers,
            }),
            observers,
            fault_backoff: config.fault_backoff,
            stop_grace: config.stop_grace,
            status_interval: config.status_interval,
            running: Arc::new(AtomicBool::new(false)),
            handles: Vec::new(),
            loops: Vec::new(),
        })
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Buffers and agents, shared with the status loop
struct Topology {
    buffers: Vec<Arc<BoundedBuffer<Item>>>,
    producer: Arc<Producer>,
    consumers: Vec<Arc<Consumer>>,
}

impl Topology {
    fn consumer(&self, index: u8) -> Option<&Arc<Consumer>> {
        self.consumers.iter().find(|c| c.id() == AgentId::Consumer(index))
    }

    fn rates(&self) -> Vec<RateSetting> {
        let mut rates = vec![RateSetting {
            agent: AgentId::Producer,
            kind: RateKind::Produce,
            value: self.producer.rate(),
        }];
        for consumer in &self.consumers {
            for kind in [RateKind::Move, RateKind::Get] {
                if let Some(value) = consumer.rate(kind) {
                    rates.push(RateSetting {
                        agent: consumer.id(),
                        kind,
                        value,
                    });
                }
            }
        }
        rates
    }

    fn status(&self, running: bool, loops: &[LoopEntry]) -> PipelineStatus {
        PipelineStatus {
            running,
            buffers: self.buffers.iter().map(|b| b.snapshot()).collect(),
            rates: self.rates(),
            loops: loops.iter().map(LoopEntry::status).collect(),
        }
    }
}

#[derive(Clone)]
struct LoopEntry {
    agent: AgentId,
    kind: RateKind,
    metrics: LoopMetrics,
}

impl LoopEntry {
    fn status(&self) -> LoopStatus {
        LoopStatus {
            agent: self.agent,
            kind: self.kind,
            metrics: self.metrics.snapshot(),
        }
    }
}

struct LoopHandle {
    name: String,
    handle: JoinHandle<()>,
}

/// Current rate of one agent operation
#[derive(Debug, Clone, PartialEq)]
pub struct RateSetting {
    pub agent: AgentId,
    pub kind: RateKind,
    pub value: f64,
}

/// Metrics of one agent loop from the current run
#[derive(Debug, Clone, PartialEq)]
pub struct LoopStatus {
    pub agent: AgentId,
    pub kind: RateKind,
    pub metrics: MetricsSnapshot,
}

/// Everything an observer needs to render the pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineStatus {
    pub running: bool,
    pub buffers: Vec<BufferSnapshot<Item>>,
    pub rates: Vec<RateSetting>,
    pub loops: Vec<LoopStatus>,
}

/// Outcome of [`Pipeline::stop`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopReport {
    /// Loops that exited within the grace period
    pub joined: usize,
    /// Loops still blocked in put/get when the grace period ran out
    pub detached: Vec<String>,
}

impl StopReport {
    pub fn is_clean(&self) -> bool {
        self.detached.is_empty()
    }
}

/// The staged producer/consumer pipeline.
///
/// Producer → stage-1 buffer → consumer moves → home buffers → consumer gets.
pub struct Pipeline {
    topology: Arc<Topology>,
    observers: Arc<ObserverSet>,
    fault_backoff: Duration,
    stop_grace: Duration,
    status_interval: Option<Duration>,
    running: Arc<AtomicBool>,
    handles: Vec<LoopHandle>,
    loops: Vec<LoopEntry>,
}

impl Pipeline {
    /// Start every agent loop. Returns `false` if already running.
    ///
    /// Each run gets a fresh running flag, so loops detached by an earlier
    /// `stop` can never resume.
    pub fn start(&mut self) -> Result<bool> {
        if self.is_running() {
            tracing::debug!("start ignored, pipeline already running");
            return Ok(false);
        }

        self.running = Arc::new(AtomicBool::new(true));
        self.loops.clear();
        self.observers.notify(Event::Started);

        let topology = Arc::clone(&self.topology);
        let stage1 = Arc::clone(&topology.buffers[0]);
        let mut ops: Vec<Box<dyn LoopOperation>> =
            vec![Box::new(ProduceOp::new(Arc::clone(&topology.producer)))];
        for consumer in &topology.consumers {
            ops.push(Box::new(MoveOp::new(Arc::clone(consumer), Arc::clone(&stage1))));
            ops.push(Box::new(GetOp::new(Arc::clone(consumer))));
        }

        for op in ops {
            if let Err(err) = self.spawn_loop(op) {
                self.stop();
                return Err(err);
            }
        }
        if let Some(interval) = self.status_interval {
            if let Err(err) = self.spawn_status_loop(interval) {
                self.stop();
                return Err(err);
            }
        }

        tracing::info!(loops = self.handles.len(), "pipeline started");
        Ok(true)
    }

    fn spawn_loop(&mut self, op: Box<dyn LoopOperation>) -> Result<()> {
        let name = format!("{}-{}", op.agent(), op.kind());
        let mut agent_loop = AgentLoop::new(
            Arc::clone(&self.running),
            Arc::clone(&self.observers),
            self.fault_backoff,
        );
        self.loops.push(LoopEntry {
            agent: op.agent(),
            kind: op.kind(),
            metrics: agent_loop.metrics().clone(),
        });

        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || agent_loop.run(op))
            .map_err(|e| PipelineError::ThreadError(e.to_string()))?;
        self.handles.push(LoopHandle { name, handle });
        Ok(())
    }

    fn spawn_status_loop(&mut self, interval: Duration) -> Result<()> {
        let running = Arc::clone(&self.running);
        let observers = Arc::clone(&self.observers);
        let topology = Arc::clone(&self.topology);
        let loops = self.loops.clone();
        let rate = 1.0 / interval.as_secs_f64();
        let name = "status".to_string();

        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let mut limiter = RateLimiter::new();
                // First report after one full interval
                limiter.throttle(rate);
                while running.load(Ordering::Acquire) {
                    if limiter.throttle_while(rate, || running.load(Ordering::Acquire))
                        == Pacing::Cancelled
                    {
                        break;
                    }
                    observers.notify(Event::Status(topology.status(true, &loops)));
                }
            })
            .map_err(|e| PipelineError::ThreadError(e.to_string()))?;
        self.handles.push(LoopHandle { name, handle });
        Ok(())
    }

    /// Clear the running flag and wait up to the grace period for loops to
    /// exit. Loops blocked in put/get past the grace period are detached.
    /// A no-op when not running.
    pub fn stop(&mut self) -> StopReport {
        if !self.is_running() {
            return StopReport::default();
        }
        self.running.store(false, Ordering::Release);

        let deadline = Instant::now() + self.stop_grace;
        while Instant::now() < deadline && self.handles.iter().any(|h| !h.handle.is_finished()) {
            thread::sleep(Duration::from_millis(10));
        }

        let mut report = StopReport::default();
        for LoopHandle { name, handle } in self.handles.drain(..) {
            if handle.is_finished() {
                if handle.join().is_err() {
                    tracing::error!(loop_name = %name, "loop thread panicked");
                }
                report.joined += 1;
            } else {
                tracing::warn!(loop_name = %name, "loop still blocked after stop, detaching");
                report.detached.push(name);
            }
        }

        tracing::info!(
            joined = report.joined,
            detached = report.detached.len(),
            "pipeline stopped"
        );
        self.observers.notify(Event::Stopped);
        report
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Change the capacity of buffer `id`, keeping its oldest items
    pub fn resize_buffer(&self, id: BufferId, capacity: usize) -> Result<()> {
        let result = match self.buffer(id) {
            None => Err(PipelineError::config(format!("no buffer with id {}", id))),
            Some(buffer) => {
                if buffer.resize(capacity) {
                    Ok(())
                } else {
                    Err(PipelineError::config(format!(
                        "buffer {} capacity must be positive, got {}",
                        id, capacity
                    )))
                }
            }
        };

        match &result {
            Ok(()) => tracing::info!(buffer = id, capacity, "buffer resized"),
            Err(err) => tracing::warn!(buffer = id, capacity, %err, "resize rejected"),
        }
        self.observers.notify(Event::Resized {
            buffer: id,
            capacity,
            success: result.is_ok(),
        });
        result
    }

    /// Change the rate of one agent operation; applies from its next iteration
    pub fn set_rate(&self, agent: AgentId, kind: RateKind, value: f64) -> Result<()> {
        let result = match agent {
            AgentId::Producer if kind == RateKind::Produce => {
                self.topology.producer.set_rate(value)
            }
            AgentId::Producer => Err(PipelineError::config(format!(
                "producer has no {} rate",
                kind
            ))),
            AgentId::Consumer(index) => match self.topology.consumer(index) {
                Some(consumer) => consumer.set_rate(kind, value),
                None => Err(PipelineError::config(format!("no consumer numbered {}", index))),
            },
        };

        match &result {
            Ok(()) => tracing::info!(%agent, %kind, value, "rate changed"),
            Err(err) => tracing::warn!(%agent, %kind, value, %err, "rate change rejected"),
        }
        self.observers.notify(Event::RateChanged {
            agent,
            kind,
            value,
            success: result.is_ok(),
        });
        result
    }

    /// Current rate of one agent operation
    pub fn rate(&self, agent: AgentId, kind: RateKind) -> Option<f64> {
        match agent {
            AgentId::Producer if kind == RateKind::Produce => Some(self.topology.producer.rate()),
            AgentId::Producer => None,
            AgentId::Consumer(index) => self.topology.consumer(index)?.rate(kind),
        }
    }

    pub fn buffer(&self, id: BufferId) -> Option<&Arc<BoundedBuffer<Item>>> {
        self.topology.buffers.iter().find(|b| b.id() == id)
    }

    pub fn stage1(&self) -> &Arc<BoundedBuffer<Item>> {
        &self.topology.buffers[0]
    }

    /// Snapshot of one buffer
    pub fn snapshot(&self, id: BufferId) -> Option<BufferSnapshot<Item>> {
        self.buffer(id).map(|b| b.snapshot())
    }

    /// Snapshots of all buffers, stage-1 first
    pub fn snapshots(&self) -> Vec<BufferSnapshot<Item>> {
        self.topology.buffers.iter().map(|b| b.snapshot()).collect()
    }

    pub fn status(&self) -> PipelineStatus {
        self.topology.status(self.is_running(), &self.loops)
    }

    /// Metrics of every loop from the current or most recent run
    pub fn loop_metrics(&self) -> Vec<LoopStatus> {
        self.loops.iter().map(LoopEntry::status).collect()
    }

    /// Number of attached observers
    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Attach an observer for every event from now on
    pub fn add_observer(&self, observer: Arc<dyn Observer>) {
        self.observers.add(observer);
    }

    /// Receive every event from now on
    pub fn subscribe(&self) -> Receiver<Event> {
        let (tx, rx) = unbounded();
        self.observers.add(Arc::new(ChannelObserver::new(tx)));
        rx
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop();
    }
}
