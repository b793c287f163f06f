//! End-to-end consumer-group scenarios over the deterministic store.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use alder_core::GetStateRequest;
use alder_core::QueryRequest;
use alder_core::State;
use alder_core::StateStore;
use alder_stream::ownership;
use alder_stream::Consumer;
use alder_stream::ConsumerConfig;
use alder_stream::ProduceMessage;
use alder_stream::Producer;
use alder_stream::StreamError;
use alder_testing::DeterministicStateStore;
use tokio::time::Instant;

const STREAM: &str = "fooStream";
const GROUP: &str = "aGroup";

/// Protocol timing shrunk to milliseconds, keeping the production ratios:
/// heartbeats three times faster than the standby takeover period.
fn fast_config() -> ConsumerConfig {
    ConsumerConfig {
        heartbeat_interval: Duration::from_millis(100),
        takeover_interval: Duration::from_millis(300),
        retry_backoff: Duration::from_millis(50),
    }
}

async fn attach(store: &Arc<DeterministicStateStore>) -> Consumer<DeterministicStateStore> {
    Consumer::attach_with_config(STREAM, GROUP, store.clone(), fast_config())
        .await
        .expect("attach should succeed")
}

async fn send_bodies(store: &Arc<DeterministicStateStore>, numbers: std::ops::RangeInclusive<u32>) {
    let producer = Producer::new(store.clone());
    let messages: Vec<ProduceMessage> = numbers
        .map(|n| ProduceMessage::new(STREAM, format!("hello world {n}").into_bytes()))
        .collect();
    producer.send(&messages).await.expect("send should succeed");
}

async fn ownership_record(store: &Arc<DeterministicStateStore>) -> State {
    store
        .get_state(GetStateRequest::latest(ownership::ownership_state_id(STREAM, GROUP)))
        .await
        .expect("ownership record should exist")
}

fn owner_id(record: &State) -> String {
    record
        .annotation(ownership::ANNOTATION_OWNER_ID)
        .expect("ownership record carries an owner id")
        .to_string()
}

#[tokio::test]
async fn attach_creates_ownership_record_and_claims_it() {
    let store = Arc::new(DeterministicStateStore::new());
    let a = attach(&store).await;

    let record = ownership_record(&store).await;
    assert_eq!(owner_id(&record), a.id());
    assert_eq!(record.annotation(ownership::ANNOTATION_OWNER_STATE), Some("1"));
    assert_eq!(record.annotation(ownership::ANNOTATION_COMMITTED_REV), Some("0"));

    send_bodies(&store, 1..=1).await;
    let message = a.receive(Duration::from_secs(1)).await.unwrap();
    assert_eq!(message.body, b"hello world 1");
}

#[tokio::test]
async fn second_consumer_attaches_as_standby() {
    let store = Arc::new(DeterministicStateStore::new());
    let a = attach(&store).await;
    let b = attach(&store).await;

    assert_eq!(owner_id(&ownership_record(&store).await), a.id());

    send_bodies(&store, 1..=1).await;
    assert!(!b.next().await, "standby must not deliver");
    assert_eq!(b.commit(1).await, Err(StreamError::NotActive));
}

// S1: two consumers, ten messages; every body is delivered exactly once and
// all by the single active consumer.
#[tokio::test]
async fn only_one_consumer_delivers() {
    let store = Arc::new(DeterministicStateStore::new());
    let a = attach(&store).await;
    let b = attach(&store).await;
    send_bodies(&store, 1..=10).await;

    let collected: Arc<Mutex<Vec<(String, String)>>> = Arc::new(Mutex::new(Vec::new()));
    let deadline = Instant::now() + Duration::from_secs(5);

    let mut tasks = Vec::new();
    for consumer in [a, b] {
        let collected = collected.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                if collected.lock().unwrap().len() >= 10 || Instant::now() >= deadline {
                    return;
                }
                match consumer.receive(Duration::from_millis(100)).await {
                    Ok(message) => {
                        consumer.commit(message.rev).await.unwrap();
                        collected
                            .lock()
                            .unwrap()
                            .push((consumer.id().to_string(), String::from_utf8(message.body).unwrap()));
                    }
                    Err(StreamError::ReceiveTimeout) => {}
                    Err(error) => panic!("unexpected receive error: {error}"),
                }
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let collected = collected.lock().unwrap();
    let mut bodies: Vec<&str> = collected.iter().map(|(_, body)| body.as_str()).collect();
    bodies.sort_unstable();
    let mut expected: Vec<String> = (1..=10).map(|n| format!("hello world {n}")).collect();
    expected.sort_unstable();
    assert_eq!(bodies, expected.iter().map(String::as_str).collect::<Vec<_>>());

    let deliverers: std::collections::HashSet<&str> = collected.iter().map(|(id, _)| id.as_str()).collect();
    assert_eq!(deliverers.len(), 1, "exactly one consumer must have delivered");

    // No more ownership rewrites changed the committed rev than messages.
    let history = store
        .query_states(QueryRequest::new([
            (ownership::LABEL_CONSUMER_STREAM, STREAM),
            (ownership::LABEL_CONSUMER_GROUP, GROUP),
        ]))
        .await
        .unwrap();
    let mut advancing_commits = 0;
    let mut last_rev = String::from("0");
    for version in &history.states {
        let rev = version.annotation(ownership::ANNOTATION_COMMITTED_REV).unwrap_or("0");
        if rev != last_rev {
            advancing_commits += 1;
            last_rev = rev.to_string();
        }
    }
    assert!(advancing_commits <= 10, "got {advancing_commits} rev-advancing commits");
}

#[tokio::test]
async fn delivers_in_order_and_persists_commits() {
    let store = Arc::new(DeterministicStateStore::new());
    let a = attach(&store).await;
    send_bodies(&store, 1..=3).await;

    let mut last_rev = 0;
    for n in 1..=3u32 {
        let message = a.receive(Duration::from_secs(1)).await.unwrap();
        assert_eq!(message.body, format!("hello world {n}").into_bytes());
        assert!(message.rev > last_rev, "revisions must increase");
        last_rev = message.rev;
        a.commit(message.rev).await.unwrap();
    }

    let record = ownership_record(&store).await;
    assert_eq!(
        record.annotation(ownership::ANNOTATION_COMMITTED_REV),
        Some(last_rev.to_string().as_str())
    );
    assert!(!a.next().await, "everything is committed");
}

// S2: a slow handler must not lose the group while heartbeats are flowing.
#[tokio::test]
async fn heartbeat_keeps_ownership_while_handler_is_slow() {
    let store = Arc::new(DeterministicStateStore::new());
    let a = attach(&store).await;
    let b = attach(&store).await;
    send_bodies(&store, 1..=3).await;

    let m1 = a.receive(Duration::from_secs(1)).await.unwrap();
    a.commit(m1.rev).await.unwrap();
    let m2 = a.receive(Duration::from_secs(1)).await.unwrap();
    assert_eq!(m2.body, b"hello world 2");

    // "Processing" takes far longer than the standby takeover period.
    for _ in 0..7 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!b.next().await, "standby must not steal a heartbeating owner");
    }
    assert_eq!(owner_id(&ownership_record(&store).await), a.id());

    // The slow commit still succeeds and the rest of the stream drains.
    a.commit(m2.rev).await.unwrap();
    let m3 = a.receive(Duration::from_secs(1)).await.unwrap();
    a.commit(m3.rev).await.unwrap();

    let record = ownership_record(&store).await;
    assert_eq!(owner_id(&record), a.id());
    assert_eq!(
        record.annotation(ownership::ANNOTATION_COMMITTED_REV),
        Some(m3.rev.to_string().as_str())
    );
}

// S3: a silently dead owner is replaced and delivery resumes after the last
// committed revision.
#[tokio::test]
async fn standby_takes_over_after_owner_crash() {
    let store = Arc::new(DeterministicStateStore::new());
    let a = attach(&store).await;
    let b = attach(&store).await;
    send_bodies(&store, 1..=5).await;

    for n in 1..=3u32 {
        let message = a.receive(Duration::from_secs(1)).await.unwrap();
        assert_eq!(message.body, format!("hello world {n}").into_bytes());
        a.commit(message.rev).await.unwrap();
    }
    // Crash: no shutdown, no release write.
    drop(a);

    let mut got = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    while got.len() < 2 && Instant::now() < deadline {
        match b.receive(Duration::from_millis(200)).await {
            Ok(message) => {
                b.commit(message.rev).await.unwrap();
                got.push(String::from_utf8(message.body).unwrap());
            }
            Err(StreamError::ReceiveTimeout) => {}
            Err(error) => panic!("unexpected receive error: {error}"),
        }
    }
    assert_eq!(got, vec!["hello world 4", "hello world 5"]);
    assert_eq!(owner_id(&ownership_record(&store).await), b.id());
}

// S4: a clean shutdown hands the group over without waiting out the
// takeover period.
#[tokio::test]
async fn clean_shutdown_hands_over_promptly() {
    let store = Arc::new(DeterministicStateStore::new());
    let a = attach(&store).await;
    let b = attach(&store).await;

    a.shutdown().await.unwrap();

    // The standby adopts the released record and claims it on the update
    // event, not the timer.
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let record = ownership_record(&store).await;
        if owner_id(&record) == b.id() && record.annotation(ownership::ANNOTATION_OWNER_STATE) == Some("1") {
            break;
        }
        assert!(Instant::now() < deadline, "standby never claimed the released group");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    send_bodies(&store, 1..=1).await;
    let message = b.receive(Duration::from_secs(1)).await.unwrap();
    assert_eq!(message.body, b"hello world 1");
}

// S5: wait blocks until a message is produced, then next delivers it.
#[tokio::test]
async fn wait_wakes_when_a_message_arrives() {
    let store = Arc::new(DeterministicStateStore::new());
    let a = attach(&store).await;
    assert!(!a.next().await, "stream is empty");

    let producer_store = store.clone();
    let producer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        send_bodies(&producer_store, 1..=1).await;
    });

    let started = Instant::now();
    a.wait(Duration::from_secs(5)).await;
    assert!(
        started.elapsed() < Duration::from_secs(1),
        "wait should wake on the produced message, not the deadline"
    );

    assert!(a.next().await);
    assert_eq!(a.message().await.body, b"hello world 1");
    producer.await.unwrap();
}

#[tokio::test]
async fn wait_sleeps_out_the_timeout_for_standby() {
    let store = Arc::new(DeterministicStateStore::new());
    let _a = attach(&store).await;
    let b = attach(&store).await;

    let producer_store = store.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        send_bodies(&producer_store, 1..=1).await;
    });

    let started = Instant::now();
    b.wait(Duration::from_millis(200)).await;
    assert!(
        started.elapsed() >= Duration::from_millis(200),
        "a standby's wait must sleep to the deadline even while messages arrive"
    );
}

// S6: a message observed but never committed is delivered again after
// failover.
#[tokio::test]
async fn uncommitted_message_is_redelivered_after_failover() {
    let store = Arc::new(DeterministicStateStore::new());
    let a = attach(&store).await;
    let b = attach(&store).await;
    send_bodies(&store, 1..=2).await;

    let m1 = a.receive(Duration::from_secs(1)).await.unwrap();
    a.commit(m1.rev).await.unwrap();

    assert!(a.next().await);
    let observed_by_a = a.message().await;
    assert_eq!(observed_by_a.body, b"hello world 2");
    // Crash between next() and commit().
    drop(a);

    let deadline = Instant::now() + Duration::from_secs(5);
    let redelivered = loop {
        match b.receive(Duration::from_millis(200)).await {
            Ok(message) => break message,
            Err(StreamError::ReceiveTimeout) => {
                assert!(Instant::now() < deadline, "takeover never happened");
            }
            Err(error) => panic!("unexpected receive error: {error}"),
        }
    };

    assert_eq!(redelivered.rev, observed_by_a.rev);
    assert_eq!(redelivered.body, observed_by_a.body);
}

// Property: the ownership record is rewritten only while there is a message
// past the committed revision.
#[tokio::test]
async fn heartbeat_writes_only_when_messages_are_pending() {
    let store = Arc::new(DeterministicStateStore::new());
    let a = attach(&store).await;

    let idle_rev = ownership_record(&store).await.rev;
    tokio::time::sleep(Duration::from_millis(350)).await;
    assert_eq!(
        ownership_record(&store).await.rev,
        idle_rev,
        "no heartbeat may be written for an empty stream"
    );

    send_bodies(&store, 1..=1).await;
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let record = ownership_record(&store).await;
        if record.rev > idle_rev {
            // The heartbeat refreshed the record without touching progress.
            assert_eq!(owner_id(&record), a.id());
            assert_eq!(record.annotation(ownership::ANNOTATION_COMMITTED_REV), Some("0"));
            break;
        }
        assert!(Instant::now() < deadline, "heartbeat never fired with a pending message");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // Draining the stream quiesces the record again.
    let message = a.receive(Duration::from_secs(1)).await.unwrap();
    a.commit(message.rev).await.unwrap();
    let drained_rev = ownership_record(&store).await.rev;
    tokio::time::sleep(Duration::from_millis(350)).await;
    assert_eq!(ownership_record(&store).await.rev, drained_rev);
}

#[tokio::test]
async fn shutdown_is_idempotent() {
    let store = Arc::new(DeterministicStateStore::new());
    let a = attach(&store).await;

    a.shutdown().await.unwrap();
    let record = ownership_record(&store).await;
    assert_eq!(record.annotation(ownership::ANNOTATION_OWNER_STATE), Some("0"));
    assert_eq!(owner_id(&record), a.id());

    a.shutdown().await.unwrap();
    assert_eq!(ownership_record(&store).await.rev, record.rev, "second shutdown must not write");
}

#[tokio::test]
async fn standby_shutdown_is_a_noop() {
    let store = Arc::new(DeterministicStateStore::new());
    let a = attach(&store).await;
    let b = attach(&store).await;

    let before = ownership_record(&store).await.rev;
    b.shutdown().await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(ownership_record(&store).await.rev, before, "standby shutdown must not write");

    // The group still works.
    send_bodies(&store, 1..=1).await;
    let message = a.receive(Duration::from_secs(1)).await.unwrap();
    a.commit(message.rev).await.unwrap();
}

#[tokio::test]
async fn consumer_recovers_from_a_transient_store_outage() {
    let store = Arc::new(DeterministicStateStore::new());
    let a = attach(&store).await;

    send_bodies(&store, 1..=1).await;
    let m1 = a.receive(Duration::from_secs(1)).await.unwrap();
    a.commit(m1.rev).await.unwrap();

    // The coordinator's reads fail for a while; it must log, back off and
    // keep going rather than give up.
    store.fail_queries(true);
    tokio::time::sleep(Duration::from_millis(300)).await;
    store.fail_queries(false);

    send_bodies(&store, 2..=2).await;
    let deadline = Instant::now() + Duration::from_secs(3);
    let message = loop {
        match a.receive(Duration::from_millis(200)).await {
            Ok(message) => break message,
            Err(StreamError::ReceiveTimeout) => {
                assert!(Instant::now() < deadline, "consumer never recovered from the outage");
            }
            Err(error) => panic!("unexpected receive error: {error}"),
        }
    };
    assert_eq!(message.body, b"hello world 2");
    a.commit(message.rev).await.unwrap();
    assert_eq!(owner_id(&ownership_record(&store).await), a.id());
}

#[tokio::test]
#[should_panic(expected = "stream is required")]
async fn attach_panics_on_empty_stream() {
    let store = Arc::new(DeterministicStateStore::new());
    let _ = Consumer::attach("", GROUP, store).await;
}

#[tokio::test]
#[should_panic(expected = "group is required")]
async fn attach_panics_on_empty_group() {
    let store = Arc::new(DeterministicStateStore::new());
    let _ = Consumer::attach(STREAM, "", store).await;
}

#[tokio::test]
#[should_panic(expected = "next() must be called")]
async fn message_panics_without_a_successful_next() {
    let store = Arc::new(DeterministicStateStore::new());
    let a = attach(&store).await;
    let _ = a.message().await;
}
