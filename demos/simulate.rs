//! Staged producer/consumer simulation
//!
//! Runs the pipeline for a few seconds while a "control panel" thread
//! resizes buffers and changes rates, printing buffer states as they change.
//!
//! Usage: RUST_LOG=info cargo run --example simulate

use staged_pipeline::{AgentId, Event, LogObserver, PipelineBuilder, RateKind, STAGE1_BUFFER};
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    println!("Staged Pipeline Simulation");
    println!("==========================");

    let mut pipeline = PipelineBuilder::new()
        .produce_rate(4.0)
        .status_interval(Duration::from_secs(1))
        .with_observer(LogObserver)
        .build()?;
    let events = pipeline.subscribe();

    pipeline.start()?;

    let started = Instant::now();
    let mut adjusted = false;
    while started.elapsed() < Duration::from_secs(6) {
        if let Ok(Event::Status(status)) = events.recv_timeout(Duration::from_millis(200)) {
            for buffer in &status.buffers {
                println!("{:>3}% {}", buffer.utilization(), buffer);
            }
            println!();
        }

        if !adjusted && started.elapsed() > Duration::from_secs(3) {
            pipeline.resize_buffer(STAGE1_BUFFER, 4)?;
            pipeline.set_rate(AgentId::Consumer(1), RateKind::Get, 3.0)?;
            pipeline.set_rate(AgentId::Producer, RateKind::Produce, 8.0)?;
            adjusted = true;
        }
    }

    let report = pipeline.stop();

    println!("\nLoop metrics:");
    for status in pipeline.loop_metrics() {
        println!("  {} {}: {}", status.agent, status.kind, status.metrics.format());
    }
    println!(
        "\nStopped: {} loops joined, {} detached",
        report.joined,
        report.detached.len()
    );

    Ok(())
}
