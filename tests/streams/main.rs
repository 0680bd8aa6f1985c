//! Producer and consumer handles.

#[path = "../support/mod.rs"]
mod support;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use storebus::store::{InMemoryStore, Store};
use storebus::{BitcodeCodec, BusConfig, BusError, Envelope, Message, MessageBus};

use support::{bus, hero, new_hero_message, HeroMessage};

const READ: Duration = Duration::from_millis(500);

#[test]
fn consumer_reads_what_producer_publishes() {
    let bus = bus();
    let mut consumer = bus
        .create_consumer("consumer", new_hero_message, &["hero"])
        .unwrap();
    let producer = bus.create_producer("hero");
    assert_eq!(producer.topic(), "hero");

    producer
        .publish(&[hero("", 1, "Ada"), hero("", 2, "Bo")])
        .unwrap();

    let first = consumer.read(READ).unwrap();
    let second = consumer.read(READ).unwrap();
    assert_eq!(first.topic(), "hero");
    assert_eq!(first.payload.name, "Ada");
    assert_eq!(second.payload.name, "Bo");
    assert_eq!(second.session_id(), "session-2");

    consumer.close().unwrap();
}

#[test]
fn read_timeout_is_recoverable() {
    let bus = bus();
    let mut consumer = bus
        .create_consumer("consumer", new_hero_message, &["hero"])
        .unwrap();

    let err = consumer.read(Duration::from_millis(20)).unwrap_err();
    assert!(matches!(err, BusError::ReadTimeout(_)));
    assert!(err.is_timeout());

    bus.create_producer("hero")
        .publish(&[hero("", 3, "After timeout")])
        .unwrap();
    assert_eq!(consumer.read(READ).unwrap().payload.key, 3);
}

#[test]
fn zero_timeout_waits_for_a_message() {
    let bus = bus();
    let mut consumer = bus
        .create_consumer("consumer", new_hero_message, &["slow"])
        .unwrap();
    let producer = bus.create_producer("slow");

    let publisher = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        producer.publish(&[hero("", 9, "eventually")]).unwrap();
    });

    let msg = consumer.read(Duration::ZERO).unwrap();
    publisher.join().unwrap();
    assert_eq!(msg.payload.key, 9);
}

#[test]
fn decode_failure_is_returned_and_next_read_succeeds() {
    let bus = bus();
    let mut consumer = bus
        .create_consumer("consumer", new_hero_message, &["hero"])
        .unwrap();

    bus.store().publish("hero", b"\x00\x01 not json").unwrap();
    bus.publish(&[hero("hero", 5, "fine")]).unwrap();

    let err = consumer.read(READ).unwrap_err();
    assert!(matches!(err, BusError::Decode(_)));
    assert_eq!(consumer.read(READ).unwrap().payload.key, 5);
}

#[test]
fn pattern_consumer_reports_source_topic() {
    let bus = bus();
    let mut consumer = bus
        .create_consumer("status", Envelope::<u8>::default, &["status.*"])
        .unwrap();
    assert_eq!(consumer.topics(), ["status.*".to_string()]);

    bus.create_producer("status.eu").publish(&[Envelope::new("", 1u8)]).unwrap();
    bus.create_producer("metrics").publish(&[Envelope::new("", 2u8)]).unwrap();

    let msg = consumer.read(READ).unwrap();
    assert_eq!(msg.topic(), "status.eu");
    assert!(consumer.read(Duration::from_millis(30)).unwrap_err().is_timeout());
}

#[test]
fn producer_is_shared_across_threads() {
    let bus = bus();
    let mut consumer = bus
        .create_consumer("consumer", Envelope::<u32>::default, &["shared"])
        .unwrap();
    let producer = Arc::new(bus.create_producer("shared"));

    let publishers: Vec<_> = (0..4u32)
        .map(|t| {
            let producer = Arc::clone(&producer);
            thread::spawn(move || {
                for n in 0..25u32 {
                    producer.publish(&[Envelope::new("", t * 100 + n)]).unwrap();
                }
            })
        })
        .collect();
    for p in publishers {
        p.join().unwrap();
    }

    let mut got: Vec<u32> = (0..100).map(|_| consumer.read(READ).unwrap().payload).collect();
    got.sort_unstable();
    let mut expected: Vec<u32> = (0..4u32)
        .flat_map(|t| (0..25u32).map(move |n| t * 100 + n))
        .collect();
    expected.sort_unstable();
    assert_eq!(got, expected);
}

#[test]
fn consumer_requires_topics() {
    let bus = bus();
    let err = bus
        .create_consumer("empty", new_hero_message, &[])
        .err()
        .unwrap();
    assert!(matches!(err, BusError::NoTopics));
}

#[test]
fn closing_consumer_releases_its_channel() {
    let bus = bus();
    let consumer = bus
        .create_consumer("consumer", new_hero_message, &["hero"])
        .unwrap();
    assert_eq!(bus.store().channel_count(), 1);
    consumer.close().unwrap();
    assert_eq!(bus.store().channel_count(), 0);
}

#[test]
fn bitcode_bus_round_trips() {
    let store = InMemoryStore::connect("memory://bitcode").unwrap();
    let bus = MessageBus::with_codec(store, BitcodeCodec, BusConfig::new("memory://bitcode"))
        .unwrap();
    let mut consumer = bus
        .create_consumer("consumer", new_hero_message, &["hero"])
        .unwrap();

    bus.publish(&[hero("hero", 11, "binary")]).unwrap();
    let msg: HeroMessage = consumer.read(READ).unwrap();
    assert_eq!(msg.payload.name, "binary");

    bus.push(&[hero("jobs", 12, "queued")]).unwrap();
    let job: HeroMessage = bus.pop(new_hero_message, Duration::ZERO, &["jobs"]).unwrap();
    assert_eq!(job.payload.key, 12);
}
