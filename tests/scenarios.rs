//! Integration tests driving [`Consumer`] through [`MockBroker`] rather
//! than a running RabbitMQ, covering the concurrency behaviors the core's
//! gate/buffer/listener machinery is built to guarantee.

#![cfg(feature = "test-util")]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use jms_consumer_core::broker::mock::MockBroker;
use jms_consumer_core::config::{AckMode, ConsumerConfig};
use jms_consumer_core::destination::Destination;
use jms_consumer_core::listener_consumer::MessageListener;
use jms_consumer_core::session::{ConsumerTag, TestSession};
use jms_consumer_core::{Consumer, Delivery};

fn config(listener_termination_timeout: Duration) -> ConsumerConfig {
    ConsumerConfig::new(listener_termination_timeout)
}

fn new_consumer(
    broker: Arc<MockBroker>,
    session: Arc<TestSession>,
    queue: &str,
    config: ConsumerConfig,
) -> Arc<Consumer> {
    Consumer::new(
        session,
        broker,
        Destination::queue(queue),
        ConsumerTag::generate(),
        config,
        false,
    )
}

/// Run a synchronous closure on a plain OS thread (not tokio's blocking
/// pool, which is already entered on the test's own runtime) and await its
/// result. `Consumer`'s synchronous methods call back into `session.runtime()`
/// via `Handle::block_on`, which panics if invoked from a thread that already
/// has this runtime entered; a bare `std::thread::spawn` has no such context.
async fn run_blocking<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> T {
    let thread = std::thread::spawn(f);
    tokio::task::spawn_blocking(move || thread.join().expect("blocking thread panicked"))
        .await
        .expect("spawn_blocking task panicked")
}

/// A message published to the queue before `receive()` is called comes
/// back through the synchronous API and is acked under auto-ack.
#[tokio::test(flavor = "multi_thread")]
async fn basic_synchronous_receive() {
    let handle = tokio::runtime::Handle::current();
    let broker = MockBroker::new();
    let session = TestSession::new(handle, AckMode::Auto);
    let consumer = new_consumer(broker.clone(), session, "orders", config(Duration::from_millis(500)));

    broker.publish("orders", Bytes::from_static(b"order-1"));

    let delivery = run_blocking(move || consumer.receive_timeout(Duration::from_secs(1)))
        .await
        .unwrap()
        .expect("message should have been delivered");

    assert_eq!(delivery.body, Bytes::from_static(b"order-1"));
    assert_eq!(broker.acked(), vec![delivery.envelope.delivery_tag]);
}

/// `receive(timeout)` against an empty queue returns `None` once the
/// timeout elapses, rather than blocking forever.
#[tokio::test(flavor = "multi_thread")]
async fn receive_times_out_on_empty_queue() {
    let handle = tokio::runtime::Handle::current();
    let broker = MockBroker::new();
    let session = TestSession::new(handle, AckMode::Auto);
    let consumer = new_consumer(broker, session, "orders", config(Duration::from_millis(500)));

    let start = std::time::Instant::now();
    let result = run_blocking(move || consumer.receive_timeout(Duration::from_millis(300)))
        .await
        .unwrap();

    assert!(result.is_none());
    assert!(start.elapsed() >= Duration::from_millis(250));
}

/// Closing the consumer while a thread is blocked in `receive()` wakes
/// that thread with `None`, not an error, and the consumer reports closed.
#[tokio::test(flavor = "multi_thread")]
async fn close_during_blocked_receive_returns_none() {
    let handle = tokio::runtime::Handle::current();
    let broker = MockBroker::new();
    let session = TestSession::new(handle, AckMode::Auto);
    let consumer = new_consumer(broker, session, "orders", config(Duration::from_millis(500)));

    let receiver = consumer.clone();
    let waiting = tokio::spawn(run_blocking(move || receiver.receive()));

    tokio::time::sleep(Duration::from_millis(150)).await;
    let closer = consumer.clone();
    run_blocking(move || closer.close()).await;

    let result = waiting.await.unwrap().unwrap();
    assert!(result.is_none());
    assert!(consumer.is_closed());
}

struct CountingListener {
    count: AtomicUsize,
}

impl CountingListener {
    fn new() -> Arc<Self> {
        Arc::new(Self { count: AtomicUsize::new(0) })
    }
}

impl MessageListener for CountingListener {
    fn on_message(&self, _delivery: &Delivery) -> Result<(), anyhow::Error> {
        self.count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A connection `pause()`/`resume()` cycle stops listener delivery
/// mid-flight and resumes it without re-registering the listener.
#[tokio::test(flavor = "multi_thread")]
async fn listener_stops_on_pause_and_resumes() {
    let handle = tokio::runtime::Handle::current();
    let broker = MockBroker::new();
    let session = TestSession::new(handle, AckMode::Auto);
    let consumer = new_consumer(broker.clone(), session, "events", config(Duration::from_millis(500)));
    let listener = CountingListener::new();

    let l = listener.clone() as Arc<dyn MessageListener>;
    let c = consumer.clone();
    run_blocking(move || c.set_message_listener(Some(l))).await.unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;

    broker.publish("events", Bytes::from_static(b"e1"));
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(listener.count.load(Ordering::SeqCst), 1);

    let pauser = consumer.clone();
    run_blocking(move || pauser.pause()).await;
    tokio::time::sleep(Duration::from_millis(80)).await;

    broker.publish("events", Bytes::from_static(b"e2"));
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(listener.count.load(Ordering::SeqCst), 1, "paused consumer must not deliver");

    let resumer = consumer.clone();
    run_blocking(move || resumer.resume()).await;
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(listener.count.load(Ordering::SeqCst), 2, "resumed consumer must deliver the backlog");
}

/// Two threads racing `set_message_listener` both complete without
/// error, and exactly one of the two candidate listeners ends up receiving
/// subsequent deliveries (the install is serialized through a mutex).
#[tokio::test(flavor = "multi_thread")]
async fn set_message_listener_race_leaves_exactly_one_installed() {
    let handle = tokio::runtime::Handle::current();
    let broker = MockBroker::new();
    let session = TestSession::new(handle, AckMode::Auto);
    let consumer = new_consumer(broker.clone(), session, "events", config(Duration::from_millis(500)));

    let listener_0 = CountingListener::new();
    let c0 = consumer.clone();
    let l0 = listener_0.clone() as Arc<dyn MessageListener>;
    run_blocking(move || c0.set_message_listener(Some(l0))).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let listener_a = CountingListener::new();
    let listener_b = CountingListener::new();

    let consumer_a = consumer.clone();
    let la = listener_a.clone() as Arc<dyn MessageListener>;
    let install_a = tokio::spawn(run_blocking(move || consumer_a.set_message_listener(Some(la))));

    let consumer_b = consumer.clone();
    let lb = listener_b.clone() as Arc<dyn MessageListener>;
    let install_b = tokio::spawn(run_blocking(move || consumer_b.set_message_listener(Some(lb))));

    let (result_a, result_b) = tokio::join!(install_a, install_b);
    result_a.unwrap().unwrap();
    result_b.unwrap().unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;

    broker.publish("events", Bytes::from_static(b"e1"));
    tokio::time::sleep(Duration::from_millis(150)).await;

    let total = listener_a.count.load(Ordering::SeqCst) + listener_b.count.load(Ordering::SeqCst);
    assert_eq!(total, 1, "exactly one of the racing candidates should observe the delivery");
    assert_eq!(listener_0.count.load(Ordering::SeqCst), 0, "the superseded initial listener must not be invoked again");
}

/// `close()` invoked while a listener invocation is mid-flight (a
/// deliberately slow handler) waits out `listener_termination_timeout` for
/// an orderly stop before returning, rather than abandoning a message that
/// is still being processed.
#[tokio::test(flavor = "multi_thread")]
async fn close_waits_for_in_flight_listener_invocation() {
    struct SlowListener {
        started: Arc<tokio::sync::Notify>,
        finished: AtomicUsize,
    }

    impl MessageListener for SlowListener {
        fn on_message(&self, _delivery: &Delivery) -> Result<(), anyhow::Error> {
            self.started.notify_one();
            std::thread::sleep(Duration::from_millis(200));
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    let handle = tokio::runtime::Handle::current();
    let broker = MockBroker::new();
    let session = TestSession::new(handle, AckMode::Auto);
    // Generous termination timeout: long enough to outlast the listener's
    // 200ms sleep, so close() observes an orderly stop rather than forcing
    // an abort mid-invocation.
    let consumer = new_consumer(broker.clone(), session, "events", config(Duration::from_secs(2)));

    let started = Arc::new(tokio::sync::Notify::new());
    let listener = Arc::new(SlowListener { started: started.clone(), finished: AtomicUsize::new(0) });

    let l = listener.clone() as Arc<dyn MessageListener>;
    let c = consumer.clone();
    run_blocking(move || c.set_message_listener(Some(l))).await.unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;

    broker.publish("events", Bytes::from_static(b"slow"));
    started.notified().await;

    let closer = consumer.clone();
    run_blocking(move || closer.close()).await;

    assert_eq!(listener.finished.load(Ordering::SeqCst), 1, "close() must wait for the in-flight invocation");
    assert!(consumer.is_closed());
}
