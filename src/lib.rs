//! A staged producer/consumer pipeline built on resizable bounded buffers.
//!
//! One producer fills a shared stage-1 buffer. Two consumers each run two
//! loops: `move` transfers items from the stage-1 buffer into the consumer's
//! own home buffer, and `get` drains the home buffer. Every loop runs on its
//! own thread at an independently adjustable rate, and buffer capacities can
//! be changed while the pipeline runs.
//!
//! # Features
//!
//! - Blocking FIFO buffers with live, atomic resize
//! - Cross-buffer move that never holds two buffer locks at once
//! - Per-loop rate limiting with live rate updates
//! - Fire-and-forget event stream and consistent state snapshots
//! - Per-loop metrics: completions, faults, blocked-wait percentiles
//!
//! # Example
//!
//! ```no_run
//! use staged_pipeline::{AgentId, LogObserver, PipelineBuilder, RateKind};
//! use std::time::Duration;
//!
//! let mut pipeline = PipelineBuilder::new()
//!     .stage1_capacity(8)
//!     .with_observer(LogObserver)
//!     .build()?;
//!
//! pipeline.start()?;
//! pipeline.set_rate(AgentId::Consumer(1), RateKind::Get, 4.0)?;
//! pipeline.resize_buffer(1, 12)?;
//! std::thread::sleep(Duration::from_secs(2));
//! let report = pipeline.stop();
//! println!("{} loops joined, {} detached", report.joined, report.detached.len());
//! # Ok::<(), staged_pipeline::PipelineError>(())
//! ```

pub mod agent;
pub mod buffer;
pub mod error;
pub mod event;
pub mod metrics;
pub mod pipeline;
pub mod rate;

// Re-exports for convenience
pub use agent::{
    AgentId, AgentLoop, Consumer, GetOp, Item, ItemSource, LoopOperation, MoveOp, ProduceOp,
    Producer, RandomAlphanumeric, RateKind,
};
pub use buffer::{BoundedBuffer, BufferId, BufferSnapshot, Payload};
pub use error::{PipelineError, Result};
pub use event::{ChannelObserver, Event, LogObserver, Observer, ObserverSet};
pub use metrics::{LoopMetrics, MetricsSnapshot, PercentileTracker};
pub use pipeline::{
    home_buffer_id, LoopStatus, Pipeline, PipelineBuilder, PipelineConfig, PipelineStatus,
    RateSetting, StopReport, CONSUMER_COUNT, STAGE1_BUFFER,
};
pub use rate::{AtomicRate, Pacing, RateLimiter, DEFAULT_RATE};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
