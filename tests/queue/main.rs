//! Work queues: push, non-blocking pop and blocking multi-queue pop.

#[path = "../support/mod.rs"]
mod support;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use storebus::{BusError, Envelope, Message};

use support::{bus, hero, new_hero_message, HeroMessage};

type Job = Envelope<u32>;

#[test]
fn pushed_messages_drain_oldest_first_then_queue_is_empty() {
    let bus = bus();
    bus.push(&[Job::new("q", 1), Job::new("q", 2), Job::new("q", 3)])
        .unwrap();
    assert_eq!(bus.queue_len("q").unwrap(), 3);

    let popped: Vec<u32> = (0..3)
        .map(|_| {
            bus.pop(Job::default, Duration::ZERO, &["q"])
                .unwrap()
                .payload
        })
        .collect();
    assert_eq!(popped, vec![1, 2, 3]);

    let err = bus.pop(Job::default, Duration::ZERO, &["q"]).unwrap_err();
    assert!(matches!(err, BusError::QueueEmpty(ref q) if q == "q"));
    assert!(!err.is_timeout());
}

#[test]
fn non_blocking_pop_on_empty_queue_returns_immediately() {
    let bus = bus();
    let started = Instant::now();
    let err = bus
        .pop(new_hero_message, Duration::ZERO, &["empty"])
        .unwrap_err();
    assert!(matches!(err, BusError::QueueEmpty(_)));
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[test]
fn blocking_pop_returns_first_queue_to_receive() {
    let bus = bus();
    let pusher = bus.try_clone().unwrap();

    let delayed = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        pusher.push(&[hero("queue_y", 100, "Delayed hero")]).unwrap();
    });

    let started = Instant::now();
    let msg: HeroMessage = bus
        .pop(
            new_hero_message,
            Duration::from_secs(5),
            &["queue_x", "queue_y", "queue_z"],
        )
        .unwrap();
    delayed.join().unwrap();

    assert_eq!(msg.topic(), "queue_y");
    assert_eq!(msg.payload.name, "Delayed hero");
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn blocking_pop_times_out_without_data() {
    let bus = bus();
    let timeout = Duration::from_millis(100);

    let started = Instant::now();
    let err = bus
        .pop(new_hero_message, timeout, &["x", "y"])
        .unwrap_err();

    assert!(started.elapsed() >= timeout);
    assert!(err.is_timeout());
    match err {
        BusError::PopTimeout { queues, timeout: waited } => {
            assert_eq!(queues, vec!["x".to_string(), "y".to_string()]);
            assert_eq!(waited, timeout);
        }
        other => panic!("expected pop timeout, got {other:?}"),
    }
}

#[test]
fn late_push_after_timeout_stays_queued() {
    let bus = bus();
    let err = bus
        .pop(new_hero_message, Duration::from_millis(20), &["x", "y"])
        .unwrap_err();
    assert!(err.is_timeout());

    bus.push(&[hero("y", 1, "late")]).unwrap();
    assert_eq!(bus.queue_len("y").unwrap(), 1);
}

#[test]
fn each_message_is_taken_by_exactly_one_popper() {
    let bus = Arc::new(bus());
    let messages: Vec<Job> = (0..200).map(|n| Job::new("work", n)).collect();
    bus.push(&messages).unwrap();

    let taken = Arc::new(Mutex::new(Vec::new()));
    let workers: Vec<_> = (0..4)
        .map(|_| {
            let bus = Arc::clone(&bus);
            let taken = Arc::clone(&taken);
            thread::spawn(move || {
                while let Ok(job) = bus.pop(Job::default, Duration::ZERO, &["work"]) {
                    taken.lock().unwrap().push(job.payload);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let taken = taken.lock().unwrap();
    assert_eq!(taken.len(), 200);
    let unique: HashSet<u32> = taken.iter().copied().collect();
    assert_eq!(unique.len(), 200);
}

#[test]
fn push_stops_at_first_failure() {
    let bus = bus();
    let err = bus
        .push(&[Job::new("q", 1), Job::new("", 2), Job::new("q", 3)])
        .unwrap_err();
    assert!(matches!(err, BusError::MissingTopic));
    assert_eq!(bus.queue_len("q").unwrap(), 1);
}

#[test]
fn push_on_offline_store_fails() {
    let bus = bus();
    bus.store().set_available(false);
    let err = bus.push(&[Job::new("q", 1)]).unwrap_err();
    assert!(matches!(err, BusError::Store(_)));
}
