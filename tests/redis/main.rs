//! Runs against a live Redis server named by `REDIS_URL`, for example
//! `REDIS_URL=redis://127.0.0.1:6379 cargo test --features redis --test redis_store`.
//! Without `REDIS_URL` every test returns early.

#[path = "../support/mod.rs"]
mod support;

use std::collections::BTreeSet;
use std::env;
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use storebus::store::{Channel, RedisStore, Store, SubscribeMode};
use storebus::{BusError, Envelope, Message, MessageBus};
use uuid::Uuid;

use support::{hero, new_hero_message, wait_until, HeroMessage};

const WAIT: Duration = Duration::from_secs(5);

fn redis_bus() -> Option<MessageBus<RedisStore>> {
    let address = env::var("REDIS_URL").ok()?;
    Some(MessageBus::connect(&address).expect("REDIS_URL must point at a running server"))
}

/// Unique name so parallel tests and earlier runs never share keys.
fn scoped(name: &str) -> String {
    format!("storebus-test-{}-{name}", Uuid::new_v4())
}

#[test]
fn pattern_subscription_matches_only_its_topics() {
    let Some(bus) = redis_bus() else { return };
    let prefix = scoped("events");
    let seen = Arc::new(Mutex::new(BTreeSet::new()));

    let sink = Arc::clone(&seen);
    bus.subscribe(
        "events",
        new_hero_message,
        move |m: HeroMessage| {
            sink.lock().unwrap().insert(m.topic().to_string());
        },
        &[format!("{prefix}-*").as_str()],
    )
    .unwrap();

    let first = format!("{prefix}-1");
    let second = format!("{prefix}-2");
    bus.publish(&[
        hero(&first, 1, "a"),
        hero(&second, 2, "b"),
        hero(&scoped("other"), 3, "c"),
    ])
    .unwrap();

    assert!(wait_until(WAIT, || seen.lock().unwrap().len() == 2));
    thread::sleep(Duration::from_millis(100));
    assert_eq!(*seen.lock().unwrap(), BTreeSet::from([first, second]));
}

#[test]
fn consumer_reads_past_subscribe_confirmations() {
    let Some(bus) = redis_bus() else { return };
    let topic = scoped("stream");
    let mut consumer = bus
        .create_consumer("reader", new_hero_message, &[topic.as_str(), scoped("idle").as_str()])
        .unwrap();

    bus.create_producer(&topic)
        .publish(&[hero("", 5, "first")])
        .unwrap();
    let msg = consumer.read(WAIT).unwrap();
    assert_eq!(msg.topic(), topic);
    assert_eq!(msg.payload.key, 5);

    assert!(consumer.read(Duration::from_millis(200)).unwrap_err().is_timeout());
    consumer.close().unwrap();
}

#[test]
fn raw_pattern_channel_reports_pattern() {
    let Some(bus) = redis_bus() else { return };
    let prefix = scoped("raw");
    let pattern = format!("{prefix}.*");
    let channel = bus
        .store()
        .subscribe(&[pattern.clone()], SubscribeMode::Pattern)
        .unwrap();

    bus.store().publish(&format!("{prefix}.eu"), b"x").unwrap();
    let raw = channel.receive(Some(WAIT)).unwrap();
    assert_eq!(raw.channel, format!("{prefix}.eu"));
    assert_eq!(raw.pattern.as_deref(), Some(pattern.as_str()));
    assert_eq!(raw.payload, b"x");
    channel.close().unwrap();
}

#[test]
fn blocking_pop_returns_first_queue_to_receive() {
    let Some(bus) = redis_bus() else { return };
    let pusher = bus.try_clone().unwrap();
    let (x, y, z) = (scoped("queue_x"), scoped("queue_y"), scoped("queue_z"));

    let target = y.clone();
    let delayed = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        pusher.push(&[hero(&target, 100, "Delayed hero")]).unwrap();
    });

    let msg: HeroMessage = bus
        .pop(new_hero_message, WAIT, &[x.as_str(), y.as_str(), z.as_str()])
        .unwrap();
    delayed.join().unwrap();

    assert_eq!(msg.topic(), y);
    assert_eq!(msg.payload.name, "Delayed hero");
}

#[test]
fn queue_drains_oldest_first_then_reports_empty() {
    let Some(bus) = redis_bus() else { return };
    let queue = scoped("fifo");
    let jobs: Vec<Envelope<u32>> = (1..=3).map(|n| Envelope::new(queue.as_str(), n)).collect();
    bus.push(&jobs).unwrap();
    assert_eq!(bus.queue_len(&queue).unwrap(), 3);

    let popped: Vec<u32> = (0..3)
        .map(|_| {
            bus.pop(Envelope::<u32>::default, Duration::ZERO, &[queue.as_str()])
                .unwrap()
                .payload
        })
        .collect();
    assert_eq!(popped, vec![1, 2, 3]);
    assert!(matches!(
        bus.pop(Envelope::<u32>::default, Duration::ZERO, &[queue.as_str()]),
        Err(BusError::QueueEmpty(_))
    ));
}

#[test]
fn blocking_pop_times_out_without_data() {
    let Some(bus) = redis_bus() else { return };
    let started = Instant::now();
    let err = bus
        .pop(
            new_hero_message,
            Duration::from_secs(1),
            &[scoped("x").as_str(), scoped("y").as_str()],
        )
        .unwrap_err();
    assert!(matches!(err, BusError::PopTimeout { .. }));
    assert!(started.elapsed() >= Duration::from_millis(900));
}

#[test]
fn concurrent_obtain_has_exactly_one_winner() {
    let Some(bus) = redis_bus() else { return };
    let key = scoped("leader");
    let barrier = Arc::new(Barrier::new(2));

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let client = bus.try_clone().unwrap();
            let barrier = Arc::clone(&barrier);
            let key = key.clone();
            thread::spawn(move || {
                barrier.wait();
                match client.obtain_lock(&key, Duration::from_secs(10)) {
                    Ok(lock) => {
                        thread::sleep(Duration::from_millis(200));
                        lock.release().unwrap();
                        true
                    }
                    Err(err) => {
                        assert!(matches!(err, BusError::LockHeld(_)));
                        false
                    }
                }
            })
        })
        .collect();

    let winners = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|won| *won)
        .count();
    assert_eq!(winners, 1);
}

#[test]
fn stale_release_keeps_new_owner() {
    let Some(bus) = redis_bus() else { return };
    let key = scoped("report");

    let expired = bus.obtain_lock(&key, Duration::from_millis(100)).unwrap();
    thread::sleep(Duration::from_millis(250));
    assert!(!expired.is_held().unwrap());

    let owner = bus.obtain_lock(&key, Duration::from_secs(10)).unwrap();
    expired.release().unwrap();
    assert!(owner.is_held().unwrap());

    owner.release().unwrap();
    assert_eq!(bus.store().get(&key).unwrap(), None);
}

#[test]
fn unbounded_ttl_sets_no_expiry() {
    let Some(bus) = redis_bus() else { return };
    let key = scoped("forever");
    let lock = bus.obtain_lock(&key, Duration::MAX).unwrap();
    assert!(lock.is_held().unwrap());
    lock.release().unwrap();
}
