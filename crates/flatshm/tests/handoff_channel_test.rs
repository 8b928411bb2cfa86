#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]
//! Handoff-Channel delivery between a producer and a consumer instance

mod common;

use common::unique_name;
use flatshm::{HandoffChannel, Semaphore};
use proptest::prelude::*;
use std::thread;
use std::time::Duration;

fn exchange(name: &str, values: &[[u32; 4]]) -> Vec<[u32; 4]> {
    let consumer = HandoffChannel::<[u32; 4]>::create(name).expect("create");
    let producer = HandoffChannel::<[u32; 4]>::create(name).expect("attach");

    let sent = values.to_vec();
    let writer = thread::spawn(move || {
        for value in &sent {
            producer.produce(value).expect("produce");
        }
        producer
    });

    let mut received = Vec::with_capacity(values.len());
    for _ in values {
        let mut out = [0u32; 4];
        consumer.consume_into(&mut out).expect("consume");
        received.push(out);
    }

    let producer = writer.join().expect("writer thread");
    drop(producer);
    consumer.close().expect("close");
    received
}

#[test]
fn handoff_delivers_each_value_once_in_order() {
    let values: Vec<[u32; 4]> = (0..500).map(|i| [i, i * 2, i * 3, !i]).collect();
    let received = exchange(&unique_name("order"), &values);
    assert_eq!(received, values);
}

#[test]
fn handoff_consumer_blocks_until_produced() {
    let name = unique_name("wait");
    let consumer = HandoffChannel::<u64>::create(&name).expect("create");
    let producer = HandoffChannel::<u64>::create(&name).expect("attach");

    let mut out = 0;
    assert!(!consumer.try_consume_into(&mut out).expect("try consume"));

    let writer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        producer.produce(&99).expect("produce");
        producer
    });
    let value = consumer.consume(|v| *v).expect("consume");
    assert_eq!(value, 99);
    drop(writer.join().expect("writer thread"));
}

#[test]
fn handoff_token_names_and_cleanup() {
    let name = unique_name("names");
    let channel = HandoffChannel::<u8>::create(&name).expect("create");
    {
        let read = Semaphore::create(&format!("{name}_read"), 0).expect("read token");
        let write = Semaphore::create(&format!("{name}_write"), 1).expect("write token");
        assert!(!read.is_creator());
        assert!(!write.is_creator());
        assert_eq!(read.value().expect("value"), 0);
        assert_eq!(write.value().expect("value"), 1);
    }
    // Dropping the attached handles left both counters as they were.
    let mut out = 0;
    assert!(!channel.try_consume_into(&mut out).expect("try consume"));
    channel.produce(&5).expect("produce");
    channel.close().expect("close");

    for suffix in ["_read", "_write"] {
        assert!(!Semaphore::unlink_name(&format!("{name}{suffix}")).expect("unlink"));
    }
    assert!(!flatshm::SharedSegment::unlink_name(&name).expect("unlink"));
}

#[test]
fn handoff_consumer_restart_does_not_redeliver() {
    let name = unique_name("restart");
    let producer = HandoffChannel::<u64>::create(&name).expect("create");

    let first = HandoffChannel::<u64>::create(&name).expect("attach first consumer");
    producer.produce(&1).expect("produce");
    assert_eq!(first.consume(|v| *v).expect("consume"), 1);
    drop(first);

    let second = HandoffChannel::<u64>::create(&name).expect("attach second consumer");
    let mut out = 0;
    assert!(!second.try_consume_into(&mut out).expect("try consume"));

    let write = Semaphore::create(&format!("{name}_write"), 1).expect("write token");
    assert!(!write.was_recovered());
    assert_eq!(write.value().expect("value"), 1);
    drop(write);

    producer.produce(&2).expect("produce");
    assert_eq!(second.consume(|v| *v).expect("consume"), 2);
    drop(second);
    producer.close().expect("close");
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Any sequence of values arrives complete and in order.
    #[test]
    fn handoff_exactness(values in prop::collection::vec(any::<[u32; 4]>(), 1..64)) {
        let received = exchange(&unique_name("prop"), &values);
        prop_assert_eq!(received, values);
    }
}
