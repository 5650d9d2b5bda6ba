use crossbeam::channel::Receiver;
use staged_pipeline::{
    AgentId, BoundedBuffer, Consumer, Event, Item, PipelineBuilder, PipelineError, Producer,
    RateKind, RateLimiter, STAGE1_BUFFER,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const ALPHABET: &str = "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

fn item(c: char) -> Item {
    c.to_string()
}

fn buffer(id: u32, capacity: usize) -> Arc<BoundedBuffer<Item>> {
    Arc::new(BoundedBuffer::new(id, capacity).expect("buffer"))
}

#[test]
fn test_fifo_order() {
    let buffer = buffer(1, 3);
    for c in ['a', 'b', 'c'] {
        buffer.put(item(c)).expect("put");
    }
    let drained: Vec<Item> = (0..3).map(|_| buffer.get()).collect();
    assert_eq!(drained, vec!["a", "b", "c"]);
}

#[test]
fn test_capacity_blocks_third_put() {
    let buffer = buffer(1, 2);
    buffer.put(item('a')).expect("put");
    buffer.put(item('b')).expect("put");

    let (tx, rx) = mpsc::channel();
    let producer = Arc::clone(&buffer);
    let handle = thread::spawn(move || {
        producer.put(item('c')).expect("put");
        tx.send(Instant::now()).expect("send");
    });

    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    assert_eq!(buffer.len(), 2);

    let released_at = Instant::now();
    assert_eq!(buffer.get(), "a");
    let put_done = rx.recv_timeout(Duration::from_secs(2)).expect("put should unblock");
    assert!(put_done >= released_at);
    handle.join().expect("join");
    assert_eq!(buffer.snapshot().items, vec!["b", "c"]);
}

#[test]
fn test_get_blocks_until_put() {
    let buffer = buffer(1, 4);
    let (tx, rx) = mpsc::channel();
    let consumer = Arc::clone(&buffer);
    let handle = thread::spawn(move || {
        let got = consumer.get();
        tx.send((got, Instant::now())).expect("send");
    });

    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    let put_at = Instant::now();
    buffer.put(item('x')).expect("put");

    let (got, got_at) = rx.recv_timeout(Duration::from_secs(2)).expect("get should unblock");
    assert_eq!(got, "x");
    assert!(got_at >= put_at);
    assert!(got_at - put_at < Duration::from_millis(500));
    handle.join().expect("join");
}

#[test]
fn test_resize_truncation() {
    let buffer = buffer(1, 4);
    for c in ['a', 'b', 'c', 'd'] {
        buffer.put(item(c)).expect("put");
    }

    assert!(!buffer.resize(0));
    let unchanged = buffer.snapshot();
    assert_eq!(unchanged.items, vec!["a", "b", "c", "d"]);
    assert_eq!(unchanged.capacity, 4);

    assert!(buffer.resize(2));
    let snapshot = buffer.snapshot();
    assert_eq!(snapshot.items, vec!["a", "b"]);
    assert_eq!(snapshot.capacity, 2);
}

#[test]
fn test_concurrent_moves_never_duplicate() {
    let stage1 = buffer(STAGE1_BUFFER, ALPHABET.len());
    for c in ALPHABET.chars() {
        stage1.put(item(c)).expect("put");
    }

    let consumers: Vec<Arc<Consumer>> = (1..=2u8)
        .map(|i| {
            let home = buffer(u32::from(i) + 1, ALPHABET.len());
            Arc::new(Consumer::new(i, home, 1.0, 1.0).expect("consumer"))
        })
        .collect();

    let claimed = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = consumers
        .iter()
        .map(|consumer| {
            let consumer = Arc::clone(consumer);
            let stage1 = Arc::clone(&stage1);
            let claimed = Arc::clone(&claimed);
            thread::spawn(move || {
                while claimed.fetch_add(1, Ordering::SeqCst) < ALPHABET.len() {
                    consumer.move_from(&stage1).expect("move");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("join");
    }

    assert!(stage1.is_empty());
    let mut seen = Vec::new();
    for consumer in &consumers {
        seen.extend(consumer.home().snapshot().items);
    }
    assert_eq!(seen.len(), ALPHABET.len());
    let unique: HashSet<_> = seen.iter().cloned().collect();
    let expected: HashSet<_> = ALPHABET.chars().map(item).collect();
    assert_eq!(unique, expected);
}

#[test]
fn test_producer_rate_adherence() {
    let dest = buffer(1, 10);
    let producer = Producer::new(Arc::clone(&dest), 2.0, Box::new(|| item('p'))).expect("producer");
    let mut limiter = RateLimiter::new();

    let start = Instant::now();
    for _ in 0..3 {
        limiter.throttle(producer.rate());
        producer.produce().expect("produce");
    }
    let elapsed = start.elapsed();

    assert!(elapsed >= Duration::from_millis(1000), "too fast: {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(1300), "too slow: {:?}", elapsed);
    assert_eq!(dest.len(), 3);
}

#[test]
fn test_pipeline_produce_rate_adherence() {
    let mut pipeline = PipelineBuilder::new()
        .stage1_capacity(16)
        .produce_rate(2.0)
        .move_rate(1, 0.01)
        .move_rate(2, 0.01)
        .stop_grace(Duration::from_millis(300))
        .build()
        .expect("build");
    let events = pipeline.subscribe();
    pipeline.start().expect("start");

    let mut produced_at = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    while produced_at.len() < 3 && Instant::now() < deadline {
        if let Ok(Event::Produced { .. }) = events.recv_timeout(Duration::from_millis(100)) {
            produced_at.push(Instant::now());
        }
    }
    pipeline.stop();

    assert_eq!(produced_at.len(), 3);
    let span = produced_at[2] - produced_at[0];
    assert!(span >= Duration::from_millis(950), "too fast: {:?}", span);
    assert!(span < Duration::from_millis(1300), "too slow: {:?}", span);
}

/// Time at which the next `Produced` event arrived, skipping other events
fn next_produced(events: &Receiver<Event>, timeout: Duration) -> Option<Instant> {
    let deadline = Instant::now() + timeout;
    while let Some(left) = deadline.checked_duration_since(Instant::now()) {
        match events.recv_timeout(left) {
            Ok(Event::Produced { .. }) => return Some(Instant::now()),
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
    None
}

#[test]
fn test_raised_rate_reaches_running_producer() {
    let mut pipeline = PipelineBuilder::new()
        .stage1_capacity(64)
        .produce_rate(0.5)
        .move_rate(1, 0.01)
        .move_rate(2, 0.01)
        .stop_grace(Duration::from_millis(300))
        .build()
        .expect("build");
    let events = pipeline.subscribe();
    pipeline.start().expect("start");

    next_produced(&events, Duration::from_secs(1)).expect("first item");
    pipeline
        .set_rate(AgentId::Producer, RateKind::Produce, 20.0)
        .expect("set rate");

    // The wait already in progress runs out at the old rate, then 20/s applies.
    let mut produced = 0;
    while next_produced(&events, Duration::from_millis(2500)).is_some() {
        produced += 1;
        if produced == 5 {
            break;
        }
    }
    pipeline.stop();
    assert_eq!(produced, 5);
}

#[test]
fn test_lowered_rate_reaches_running_producer() {
    let mut pipeline = PipelineBuilder::new()
        .stage1_capacity(64)
        .produce_rate(20.0)
        .move_rate(1, 0.01)
        .move_rate(2, 0.01)
        .stop_grace(Duration::from_millis(300))
        .build()
        .expect("build");
    let events = pipeline.subscribe();
    pipeline.start().expect("start");

    let mut fast = Vec::new();
    while fast.len() < 3 {
        fast.push(next_produced(&events, Duration::from_secs(1)).expect("fast item"));
    }
    let fast_gap = fast[2] - fast[1];
    assert!(fast_gap < Duration::from_millis(250), "fast gap {:?}", fast_gap);

    pipeline
        .set_rate(AgentId::Producer, RateKind::Produce, 2.0)
        .expect("set rate");
    events.try_iter().for_each(drop);

    // The first item may still come from a wait begun at 20/s.
    next_produced(&events, Duration::from_secs(2)).expect("in-flight item");
    let first = next_produced(&events, Duration::from_secs(2)).expect("slow item");
    let second = next_produced(&events, Duration::from_secs(2)).expect("slow item");
    pipeline.stop();

    let slow_gap = second - first;
    assert!(slow_gap >= Duration::from_millis(450), "slow gap {:?}", slow_gap);
    assert!(slow_gap > fast_gap * 2);
}

#[test]
fn test_start_is_idempotent_and_emits_lifecycle_events() {
    let mut pipeline = PipelineBuilder::new()
        .stop_grace(Duration::from_millis(300))
        .build()
        .expect("build");
    let events = pipeline.subscribe();

    assert!(pipeline.start().expect("start"));
    assert!(!pipeline.start().expect("second start"));
    assert!(pipeline.is_running());
    assert_eq!(pipeline.loop_metrics().len(), 5);

    let report = pipeline.stop();
    assert!(!pipeline.is_running());
    assert_eq!(report.joined + report.detached.len(), 5);

    let received: Vec<Event> = events.try_iter().collect();
    assert_eq!(received.first(), Some(&Event::Started));
    assert_eq!(received.iter().filter(|e| **e == Event::Started).count(), 1);
    assert_eq!(received.last(), Some(&Event::Stopped));
}

#[test]
fn test_items_flow_end_to_end() {
    let mut pipeline = PipelineBuilder::new()
        .produce_rate(40.0)
        .move_rate(1, 40.0)
        .move_rate(2, 40.0)
        .get_rate(1, 40.0)
        .get_rate(2, 40.0)
        .stop_grace(Duration::from_millis(300))
        .build()
        .expect("build");
    let events = pipeline.subscribe();
    pipeline.start().expect("start");
    thread::sleep(Duration::from_millis(800));
    pipeline.stop();

    let received: Vec<Event> = events.try_iter().collect();
    let produced = received
        .iter()
        .filter(|e| matches!(e, Event::Produced { buffer: 1, .. }))
        .count();
    let moved: Vec<_> = received
        .iter()
        .filter_map(|e| match e {
            Event::Moved { source, dest, .. } => Some((*source, *dest)),
            _ => None,
        })
        .collect();
    let consumed = received
        .iter()
        .filter(|e| matches!(e, Event::Consumed { .. }))
        .count();

    assert!(produced > 0);
    assert!(!moved.is_empty());
    assert!(moved.iter().all(|(s, d)| *s == 1 && (*d == 2 || *d == 3)));
    assert!(consumed > 0);
    assert!(consumed <= moved.len());
    assert!(moved.len() <= produced);
}

#[test]
fn test_control_surface_emits_results() {
    let pipeline = PipelineBuilder::new().build().expect("build");
    let events = pipeline.subscribe();

    assert!(matches!(
        pipeline.resize_buffer(2, 0),
        Err(PipelineError::InvalidConfiguration(_))
    ));
    pipeline.resize_buffer(3, 9).expect("resize");
    assert!(pipeline.set_rate(AgentId::Producer, RateKind::Produce, 0.0).is_err());
    pipeline
        .set_rate(AgentId::Consumer(2), RateKind::Move, 7.0)
        .expect("set rate");

    let received: Vec<Event> = events.try_iter().collect();
    assert_eq!(
        received,
        vec![
            Event::Resized {
                buffer: 2,
                capacity: 0,
                success: false
            },
            Event::Resized {
                buffer: 3,
                capacity: 9,
                success: true
            },
            Event::RateChanged {
                agent: AgentId::Producer,
                kind: RateKind::Produce,
                value: 0.0,
                success: false
            },
            Event::RateChanged {
                agent: AgentId::Consumer(2),
                kind: RateKind::Move,
                value: 7.0,
                success: true
            },
        ]
    );
    assert_eq!(pipeline.rate(AgentId::Producer, RateKind::Produce), Some(2.0));
    assert_eq!(pipeline.rate(AgentId::Consumer(2), RateKind::Move), Some(7.0));
}

#[test]
fn test_invalid_items_do_not_stop_the_producer() {
    let mut toggle = false;
    let mut pipeline = PipelineBuilder::new()
        .produce_rate(50.0)
        .move_rate(1, 0.01)
        .move_rate(2, 0.01)
        .stage1_capacity(64)
        .stop_grace(Duration::from_millis(300))
        .item_source(move || {
            toggle = !toggle;
            if toggle {
                "ok".to_string()
            } else {
                "k".to_string()
            }
        })
        .build()
        .expect("build");
    pipeline.start().expect("start");
    thread::sleep(Duration::from_millis(300));
    pipeline.stop();

    let producer = pipeline
        .loop_metrics()
        .into_iter()
        .find(|l| l.agent == AgentId::Producer)
        .expect("producer loop");
    assert!(producer.metrics.invalid_items > 0);
    assert!(producer.metrics.completed > 0);
    assert_eq!(producer.metrics.faults, 0);
    assert!(pipeline
        .snapshot(STAGE1_BUFFER)
        .expect("stage1")
        .items
        .iter()
        .all(|i| i == "k"));
}

#[test]
fn test_status_loop_publishes_snapshots() {
    let mut pipeline = PipelineBuilder::new()
        .status_interval(Duration::from_millis(100))
        .stop_grace(Duration::from_millis(300))
        .build()
        .expect("build");
    let events = pipeline.subscribe();
    pipeline.start().expect("start");
    thread::sleep(Duration::from_millis(450));
    pipeline.stop();

    let statuses: Vec<_> = events
        .try_iter()
        .filter_map(|e| match e {
            Event::Status(status) => Some(status),
            _ => None,
        })
        .collect();
    assert!(statuses.len() >= 2);
    let status = &statuses[0];
    assert_eq!(status.buffers.len(), 3);
    assert_eq!(status.rates.len(), 5);
    assert_eq!(status.loops.len(), 5);
    for buffer in &status.buffers {
        assert!(buffer.len <= buffer.capacity);
    }
}

#[test]
fn test_restart_after_stop() {
    let mut pipeline = PipelineBuilder::new()
        .produce_rate(20.0)
        .stop_grace(Duration::from_millis(300))
        .build()
        .expect("build");
    pipeline.start().expect("start");
    thread::sleep(Duration::from_millis(100));
    pipeline.stop();

    assert!(pipeline.start().expect("restart"));
    thread::sleep(Duration::from_millis(200));
    let produced_after_restart = pipeline.loop_metrics()[0].metrics.completed;
    pipeline.stop();
    assert!(produced_after_restart > 0);
}

#[test]
fn test_no_deadlock_under_concurrent_reconfiguration() {
    let mut pipeline = PipelineBuilder::new()
        .produce_rate(60.0)
        .move_rate(1, 40.0)
        .move_rate(2, 40.0)
        .get_rate(1, 30.0)
        .get_rate(2, 30.0)
        .stop_grace(Duration::from_millis(500))
        .build()
        .expect("build");
    pipeline.start().expect("start");
    let pipeline = Arc::new(parking_lot::Mutex::new(pipeline));

    let controller = {
        let pipeline = Arc::clone(&pipeline);
        thread::spawn(move || {
            let capacities = [1usize, 3, 8, 2, 5];
            let rates = [10.0, 80.0, 25.0, 50.0];
            for round in 0..40 {
                let pipeline = pipeline.lock();
                let buffer = (round % 3) as u32 + 1;
                pipeline
                    .resize_buffer(buffer, capacities[round % capacities.len()])
                    .expect("resize");
                let (agent, kind) = match round % 5 {
                    0 => (AgentId::Producer, RateKind::Produce),
                    1 => (AgentId::Consumer(1), RateKind::Move),
                    2 => (AgentId::Consumer(2), RateKind::Move),
                    3 => (AgentId::Consumer(1), RateKind::Get),
                    _ => (AgentId::Consumer(2), RateKind::Get),
                };
                pipeline
                    .set_rate(agent, kind, rates[round % rates.len()])
                    .expect("set rate");
                drop(pipeline);
                thread::sleep(Duration::from_millis(25));
            }
        })
    };

    let mut previous_total = 0;
    for _ in 0..4 {
        thread::sleep(Duration::from_millis(500));
        let pipeline = pipeline.lock();
        for snapshot in pipeline.snapshots() {
            assert!(snapshot.len <= snapshot.capacity);
        }
        let total: u64 = pipeline
            .loop_metrics()
            .iter()
            .map(|l| l.metrics.completed)
            .sum();
        assert!(total > previous_total, "pipeline made no progress");
        previous_total = total;
    }
    controller.join().expect("controller");

    let mut pipeline = pipeline.lock();
    let metrics = pipeline.loop_metrics();
    assert!(metrics.iter().all(|l| l.metrics.completed > 0));
    assert!(metrics.iter().all(|l| l.metrics.faults == 0));
    pipeline.stop();
}
