use std::path::Path;
use std::time::Duration;

use spillway::{AddressSettings, Broker, BrokerConfig, ConsumerId, Credit, Message};
use tempfile::tempdir;

const ADDRESS: &str = "ticks";
const QUEUE: &str = "ticks.q";

fn config(dir: &Path, settings: AddressSettings) -> BrokerConfig {
    BrokerConfig::new(dir).with_address(ADDRESS, settings)
}

fn open_consumer(broker: &Broker) -> ConsumerId {
    let session = broker.open_session().expect("session");
    broker
        .create_consumer(session, QUEUE, Credit::unlimited())
        .expect("consumer")
}

fn take(broker: &Broker, consumer: ConsumerId, count: usize) -> Vec<u32> {
    let mut seen = Vec::new();
    for _ in 0..count {
        let Some(delivery) = broker
            .deliver(consumer, Duration::from_millis(200))
            .expect("deliver")
        else {
            break;
        };
        let body = &delivery.message.body;
        seen.push(u32::from_le_bytes([body[0], body[1], body[2], body[3]]));
        broker
            .acknowledge(consumer, delivery.tag, None)
            .expect("ack");
    }
    seen
}

#[test]
fn toggling_paging_neither_loses_nor_duplicates() {
    let dir = tempdir().expect("tempdir");
    let settings = AddressSettings {
        max_size_bytes: 8 * 1024,
        low_watermark_bytes: Some(4 * 1024),
        page_size_bytes: 16 * 1024,
        ..AddressSettings::default()
    };
    let broker = Broker::open(config(dir.path(), settings)).expect("open");
    broker.create_queue(ADDRESS, QUEUE, true).expect("queue");
    let consumer = open_consumer(&broker);

    let mut next = 0u32;
    let mut seen = Vec::new();
    for _ in 0..4 {
        for _ in 0..40 {
            let mut body = next.to_le_bytes().to_vec();
            body.resize(512, 0);
            broker
                .route(Message::new(ADDRESS, body), None)
                .expect("route");
            next += 1;
        }
        seen.extend(take(&broker, consumer, 30));
    }
    assert!(
        broker
            .address_snapshot(ADDRESS)
            .expect("snapshot")
            .paging
            .records_paged
            > 0
    );
    seen.extend(take(&broker, consumer, usize::MAX));
    assert_eq!(seen, (0..next).collect::<Vec<_>>());

    broker
        .route(Message::new(ADDRESS, next.to_le_bytes().to_vec()), None)
        .expect("route after drain");
    assert!(!broker.address_snapshot(ADDRESS).expect("snapshot").paging.paging);
    assert_eq!(take(&broker, consumer, usize::MAX), vec![next]);
}

#[test]
fn oversized_message_is_paged_as_one_record() {
    let dir = tempdir().expect("tempdir");
    let settings = AddressSettings {
        max_size_bytes: 0,
        page_size_bytes: 4096,
        ..AddressSettings::default()
    };
    let broker = Broker::open(config(dir.path(), settings)).expect("open");
    broker.create_queue(ADDRESS, QUEUE, true).expect("queue");

    let mut large = 0u32.to_le_bytes().to_vec();
    large.resize(16 * 1024, 7);
    broker
        .route(Message::new(ADDRESS, large.clone()), None)
        .expect("route large");
    broker
        .route(Message::new(ADDRESS, 1u32.to_le_bytes().to_vec()), None)
        .expect("route small");
    let paging = broker.address_snapshot(ADDRESS).expect("snapshot").paging;
    assert_eq!(paging.records_paged, 2);

    let consumer = open_consumer(&broker);
    let delivery = broker
        .deliver(consumer, Duration::from_millis(200))
        .expect("deliver")
        .expect("large delivery");
    assert_eq!(delivery.message.body, large);
    broker
        .acknowledge(consumer, delivery.tag, None)
        .expect("ack");
    assert_eq!(take(&broker, consumer, 1), vec![1]);
}
