use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use spillway::{
    AckDecision, AddressSettings, Broker, BrokerConfig, ConsumerId, Credit, Delivery, Error,
    FullPolicy, Message, Session, TxState, Xid,
};
use tempfile::tempdir;

const ADDRESS: &str = "payments";
const QUEUE: &str = "payments.q";

fn config(dir: &Path, settings: AddressSettings) -> BrokerConfig {
    BrokerConfig::new(dir).with_address(ADDRESS, settings)
}

fn paged() -> AddressSettings {
    AddressSettings {
        max_size_bytes: 0,
        page_size_bytes: 4096,
        ..AddressSettings::default()
    }
}

fn open_consumer(broker: &Broker, credit: Credit) -> ConsumerId {
    let session = broker.open_session().expect("session");
    broker
        .create_consumer(session, QUEUE, credit)
        .expect("consumer")
}

fn bodies(broker: &Broker, consumer: ConsumerId) -> Vec<Vec<u8>> {
    let mut seen = Vec::new();
    while let Some(delivery) = broker
        .deliver(consumer, Duration::from_millis(50))
        .expect("deliver")
    {
        seen.push(delivery.message.body.clone());
        broker
            .acknowledge(consumer, delivery.tag, None)
            .expect("ack");
    }
    seen
}

fn xid() -> Xid {
    Xid::new(7, b"global-1".to_vec(), b"branch-1".to_vec())
}

fn prepare_xa_sends(dir: &Path, settings: AddressSettings) {
    let broker = Broker::open(config(dir, settings)).expect("open");
    broker.create_queue(ADDRESS, QUEUE, true).expect("queue");
    let session = broker.open_session().expect("session");
    let tx = broker.begin_xa(session, xid()).expect("begin xa");
    for body in [b"one", b"two", b"six"] {
        broker
            .route(Message::new(ADDRESS, body.to_vec()), Some(tx))
            .expect("send in tx");
    }
    broker.prepare(tx).expect("prepare");
    assert_eq!(broker.transaction_state(tx).expect("state"), TxState::Prepared);
}

#[test]
fn prepared_sends_stay_invisible_until_commit_after_restart() {
    for settings in [AddressSettings::default(), paged()] {
        let dir = tempdir().expect("tempdir");
        prepare_xa_sends(dir.path(), settings.clone());

        let broker = Broker::open(config(dir.path(), settings)).expect("reopen");
        let in_doubt = broker.in_doubt().expect("in doubt");
        assert_eq!(in_doubt.len(), 1);
        assert_eq!(in_doubt[0].xid, Some(xid()));
        let tx = broker.find_xa(&xid()).expect("find").expect("recovered tx");
        assert_eq!(tx, in_doubt[0].tx);

        let consumer = open_consumer(&broker, Credit::unlimited());
        assert!(broker
            .deliver(consumer, Duration::ZERO)
            .expect("deliver")
            .is_none());

        broker.commit(tx).expect("commit");
        assert!(broker.in_doubt().expect("in doubt").is_empty());
        assert_eq!(
            bodies(&broker, consumer),
            vec![b"one".to_vec(), b"two".to_vec(), b"six".to_vec()]
        );
    }
}

#[test]
fn rolling_back_an_in_doubt_transaction_discards_its_sends() {
    let dir = tempdir().expect("tempdir");
    prepare_xa_sends(dir.path(), paged());
    {
        let broker = Broker::open(config(dir.path(), paged())).expect("reopen");
        let tx = broker.find_xa(&xid()).expect("find").expect("recovered tx");
        broker.rollback(tx).expect("rollback");
        let consumer = open_consumer(&broker, Credit::unlimited());
        assert!(bodies(&broker, consumer).is_empty());
    }

    let broker = Broker::open(config(dir.path(), paged())).expect("reopen again");
    assert!(broker.in_doubt().expect("in doubt").is_empty());
    let consumer = open_consumer(&broker, Credit::unlimited());
    assert!(bodies(&broker, consumer).is_empty());
}

#[test]
fn prepared_ack_holds_the_message_until_resolved() {
    let dir = tempdir().expect("tempdir");
    {
        let broker = Broker::open(BrokerConfig::new(dir.path())).expect("open");
        broker.create_queue(ADDRESS, QUEUE, true).expect("queue");
        for body in [b"first", b"other"] {
            broker
                .route(Message::new(ADDRESS, body.to_vec()), None)
                .expect("route");
        }
        let session = broker.open_session().expect("session");
        let consumer = broker
            .create_consumer(session, QUEUE, Credit::unlimited())
            .expect("consumer");
        let delivery = broker
            .deliver(consumer, Duration::ZERO)
            .expect("deliver")
            .expect("delivery");
        let tx = broker.begin_xa(session, xid()).expect("begin xa");
        broker
            .acknowledge(consumer, delivery.tag, Some(tx))
            .expect("ack in tx");
        broker.prepare(tx).expect("prepare");
    }

    let broker = Broker::open(BrokerConfig::new(dir.path())).expect("reopen");
    let consumer = open_consumer(&broker, Credit::unlimited());
    let held = broker
        .deliver(consumer, Duration::ZERO)
        .expect("deliver")
        .expect("delivery");
    assert_eq!(held.message.body, b"other".to_vec());
    broker.cancel(consumer, held.tag).expect("cancel");

    let tx = broker.find_xa(&xid()).expect("find").expect("recovered tx");
    broker.rollback(tx).expect("rollback");
    assert_eq!(
        bodies(&broker, consumer),
        vec![b"first".to_vec(), b"other".to_vec()]
    );
}

#[test]
fn credit_window_limits_outstanding_deliveries() {
    let dir = tempdir().expect("tempdir");
    let broker = Broker::open(BrokerConfig::new(dir.path())).expect("open");
    broker.create_queue(ADDRESS, QUEUE, true).expect("queue");
    for index in 0u8..5 {
        broker
            .route(Message::new(ADDRESS, vec![index]), None)
            .expect("route");
    }
    let consumer = open_consumer(&broker, Credit::messages(2));

    let first = broker
        .deliver(consumer, Duration::ZERO)
        .expect("deliver")
        .expect("first");
    let second = broker
        .deliver(consumer, Duration::ZERO)
        .expect("deliver")
        .expect("second");
    assert!(broker
        .deliver(consumer, Duration::from_millis(20))
        .expect("deliver")
        .is_none());

    broker
        .acknowledge(consumer, first.tag, None)
        .expect("ack first");
    let third = broker
        .deliver(consumer, Duration::ZERO)
        .expect("deliver")
        .expect("third");
    assert_eq!(
        (first.message.body[0], second.message.body[0], third.message.body[0]),
        (0, 1, 2)
    );

    broker
        .set_credit(consumer, Credit::unlimited())
        .expect("widen credit");
    let rest: Vec<u8> = (0..2)
        .map(|_| {
            broker
                .deliver(consumer, Duration::ZERO)
                .expect("deliver")
                .expect("delivery")
                .message
                .body[0]
        })
        .collect();
    assert_eq!(rest, vec![3, 4]);
}

#[test]
fn handler_receives_redelivery_after_cancel() {
    let dir = tempdir().expect("tempdir");
    let broker = Broker::open(BrokerConfig::new(dir.path())).expect("open");
    broker.create_queue(ADDRESS, QUEUE, true).expect("queue");
    let consumer = open_consumer(&broker, Credit::unlimited());

    let seen = Arc::new(Mutex::new(Vec::new()));
    let cancelled = Arc::new(AtomicBool::new(false));
    let handler = {
        let seen = Arc::clone(&seen);
        let cancelled = Arc::clone(&cancelled);
        move |delivery: &Delivery| {
            seen.lock()
                .expect("seen lock")
                .push((delivery.message.body[0], delivery.delivery_count));
            if !cancelled.swap(true, Ordering::SeqCst) {
                AckDecision::Cancel
            } else {
                AckDecision::Ack
            }
        }
    };
    let handle = broker
        .attach_handler(consumer, handler)
        .expect("attach handler");
    for index in 0u8..3 {
        broker
            .route(Message::new(ADDRESS, vec![index]), None)
            .expect("route");
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while seen.lock().expect("seen lock").len() < 4 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    handle.stop();
    assert_eq!(
        *seen.lock().expect("seen lock"),
        vec![(0, 1), (0, 2), (1, 1), (2, 1)]
    );
    let snapshot = broker.queue_snapshot(QUEUE).expect("snapshot");
    assert_eq!(snapshot.depth, 0);
    assert_eq!(snapshot.redeliveries, 1);
}

#[test]
fn full_address_fails_fast() {
    let dir = tempdir().expect("tempdir");
    let settings = AddressSettings {
        max_disk_bytes: Some(8192),
        ..paged()
    };
    let broker = Broker::open(config(dir.path(), settings)).expect("open");
    broker.create_queue(ADDRESS, QUEUE, true).expect("queue");

    let mut routed = 0;
    let err = loop {
        match broker.route(Message::new(ADDRESS, vec![1u8; 1000]), None) {
            Ok(_) => routed += 1,
            Err(err) => break err,
        }
        assert!(routed < 100, "disk limit never reached");
    };
    assert!(matches!(err, Error::CapacityExceeded(ref address) if address == ADDRESS));
    assert!(routed >= 2);

    let session = broker.open_session().expect("session");
    let tx = broker.begin(session).expect("begin");
    broker
        .route(Message::new(ADDRESS, vec![2u8; 1000]), Some(tx))
        .expect("buffered send");
    assert!(matches!(
        broker.commit(tx),
        Err(Error::CapacityExceeded(_))
    ));
}

#[test]
fn blocked_producer_resumes_when_pages_are_freed() {
    let dir = tempdir().expect("tempdir");
    let settings = AddressSettings {
        max_disk_bytes: Some(8192),
        full_policy: FullPolicy::Block {
            timeout_ms: Some(10_000),
        },
        ..paged()
    };
    let broker = Broker::open(config(dir.path(), settings)).expect("open");
    broker.create_queue(ADDRESS, QUEUE, true).expect("queue");

    // Open both pages; the producer blocks once the second one fills.
    let mut routed = 0u8;
    loop {
        let paging = broker.address_snapshot(ADDRESS).expect("snapshot").paging;
        if paging.disk_bytes >= 8192 && paging.pages.len() == 2 {
            break;
        }
        broker
            .route(Message::new(ADDRESS, vec![routed; 1000]), None)
            .expect("route");
        routed += 1;
        assert!(routed < 100, "pages never filled");
    }
    let producer = {
        let broker = Arc::clone(&broker);
        thread::spawn(move || {
            for _ in 0..4 {
                broker.route(Message::new(ADDRESS, vec![0xFF; 1000]), None)?;
            }
            Ok::<_, Error>(())
        })
    };

    let consumer = open_consumer(&broker, Credit::unlimited());
    let mut received = 0usize;
    let deadline = Instant::now() + Duration::from_secs(10);
    while received < usize::from(routed) + 4 && Instant::now() < deadline {
        if let Some(delivery) = broker
            .deliver(consumer, Duration::from_millis(100))
            .expect("deliver")
        {
            broker
                .acknowledge(consumer, delivery.tag, None)
                .expect("ack");
            received += 1;
        }
    }
    producer
        .join()
        .expect("producer thread")
        .expect("blocked sends complete");
    assert_eq!(received, usize::from(routed) + 4);
}

#[test]
fn dropping_a_session_rolls_back_its_transaction() {
    let dir = tempdir().expect("tempdir");
    let broker = Broker::open(BrokerConfig::new(dir.path())).expect("open");
    broker.create_queue(ADDRESS, QUEUE, true).expect("queue");
    broker
        .route(Message::new(ADDRESS, b"held".to_vec()), None)
        .expect("route");

    {
        let session = Session::open(&broker).expect("session");
        let consumer = session
            .create_consumer(QUEUE, Credit::unlimited())
            .expect("consumer");
        session.begin().expect("begin");
        let delivery = session
            .receive(consumer, Duration::ZERO)
            .expect("receive")
            .expect("delivery");
        session.ack(&delivery).expect("ack in tx");
        session
            .send(Message::new(ADDRESS, b"never".to_vec()))
            .expect("send in tx");
        assert_eq!(broker.snapshot().expect("snapshot").active_transactions, 1);
    }

    assert_eq!(broker.snapshot().expect("snapshot").active_transactions, 0);
    let consumer = open_consumer(&broker, Credit::unlimited());
    let redelivered = broker
        .deliver(consumer, Duration::ZERO)
        .expect("deliver")
        .expect("delivery");
    assert_eq!(redelivered.message.body, b"held".to_vec());
    assert_eq!(redelivered.delivery_count, 2);
    broker
        .acknowledge(consumer, redelivered.tag, None)
        .expect("ack");
    assert!(bodies(&broker, consumer).is_empty());

    let session = Session::open(&broker).expect("session");
    session.begin().expect("begin");
    session
        .send(Message::new(ADDRESS, b"kept".to_vec()))
        .expect("send in tx");
    session.commit().expect("commit");
    session.close().expect("close");
    assert_eq!(bodies(&broker, consumer), vec![b"kept".to_vec()]);
}

fn padded(label: &str) -> Vec<u8> {
    let mut body = label.as_bytes().to_vec();
    body.resize(1000, b'.');
    body
}

fn label(body: &[u8]) -> String {
    let end = body.iter().position(|&b| b == b'.').unwrap_or(body.len());
    String::from_utf8_lossy(&body[..end]).into_owned()
}

/// Send "late" in a transaction, route 20 messages outside it, then commit.
fn commit_after_routing(dir: &Path, settings: AddressSettings, two_phase: bool) -> Arc<Broker> {
    let broker = Broker::open(config(dir, settings)).expect("open");
    broker.create_queue(ADDRESS, QUEUE, true).expect("queue");
    let session = broker.open_session().expect("session");
    let tx = if two_phase {
        broker.begin_xa(session, xid()).expect("begin xa")
    } else {
        broker.begin(session).expect("begin")
    };
    broker
        .route(Message::new(ADDRESS, padded("late")), Some(tx))
        .expect("send in tx");
    if two_phase {
        broker.prepare(tx).expect("prepare");
    }
    for i in 0..20 {
        broker
            .route(Message::new(ADDRESS, padded(&i.to_string())), None)
            .expect("route");
    }
    broker.commit(tx).expect("commit");
    broker
}

#[test]
fn commit_is_ordered_after_messages_routed_before_it() {
    let mut expected: Vec<String> = (0..20).map(|i| i.to_string()).collect();
    expected.push("late".to_string());

    // The small watermark makes the address start paging between the send
    // and the commit; the large one keeps everything in memory.
    for max_size_bytes in [4096, 1 << 30] {
        let settings = AddressSettings {
            max_size_bytes,
            page_size_bytes: 16 * 1024,
            ..AddressSettings::default()
        };
        for two_phase in [true, false] {
            for restart in [false, true] {
                let dir = tempdir().expect("tempdir");
                let mut broker = commit_after_routing(dir.path(), settings.clone(), two_phase);
                if restart {
                    drop(broker);
                    broker = Broker::open(config(dir.path(), settings.clone())).expect("reopen");
                    assert!(broker.in_doubt().expect("in doubt").is_empty());
                }
                let consumer = open_consumer(&broker, Credit::unlimited());
                let seen: Vec<String> = bodies(&broker, consumer).iter().map(|body| label(body)).collect();
                assert_eq!(
                    seen, expected,
                    "max_size={max_size_bytes} two_phase={two_phase} restart={restart}"
                );
            }
        }
    }
}

#[test]
fn commit_paged_behind_backlog_survives_a_second_restart() {
    let settings = AddressSettings {
        max_size_bytes: 4096,
        page_size_bytes: 16 * 1024,
        ..AddressSettings::default()
    };
    let dir = tempdir().expect("tempdir");
    drop(commit_after_routing(dir.path(), settings.clone(), true));

    // Consume part of the backlog, then restart twice: the committed send is
    // read from its page each time and is never delivered twice.
    {
        let broker = Broker::open(config(dir.path(), settings.clone())).expect("reopen");
        let consumer = open_consumer(&broker, Credit::unlimited());
        for expected in ["0", "1", "2"] {
            let delivery = broker
                .deliver(consumer, Duration::from_millis(50))
                .expect("deliver")
                .expect("delivery");
            assert_eq!(label(&delivery.message.body), expected);
            broker
                .acknowledge(consumer, delivery.tag, None)
                .expect("ack");
        }
    }
    drop(Broker::open(config(dir.path(), settings.clone())).expect("second open"));

    let broker = Broker::open(config(dir.path(), settings)).expect("third open");
    let consumer = open_consumer(&broker, Credit::unlimited());
    let seen: Vec<String> = bodies(&broker, consumer).iter().map(|body| label(body)).collect();
    let mut expected: Vec<String> = (3..20).map(|i| i.to_string()).collect();
    expected.push("late".to_string());
    assert_eq!(seen, expected);
}
