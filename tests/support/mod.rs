//! Fixtures shared by the integration suites.

#![allow(dead_code)]

use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use storebus::store::InMemoryStore;
use storebus::{BusConfig, DispatchMode, Envelope, MessageBus};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Hero {
    pub key: u32,
    pub name: String,
}

pub type HeroMessage = Envelope<Hero>;

pub fn hero(topic: &str, key: u32, name: &str) -> HeroMessage {
    Envelope::new(
        topic,
        Hero {
            key,
            name: name.to_string(),
        },
    )
    .with_session_id(format!("session-{key}"))
}

pub fn new_hero_message() -> HeroMessage {
    HeroMessage::default()
}

pub fn bus() -> MessageBus<InMemoryStore> {
    MessageBus::connect("memory://tests").unwrap()
}

pub fn sequential_bus() -> MessageBus<InMemoryStore> {
    MessageBus::with_config(BusConfig::new("memory://tests").dispatch(DispatchMode::Sequential))
        .unwrap()
}

/// Polls `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}
