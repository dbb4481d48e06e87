// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Backplane buffering and delivery over an in-process transport.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use futures::{StreamExt, stream::BoxStream};
use parking_lot::Mutex;
use tick::Clock;
use tierlink_handle::{BackplaneAction, BackplaneMessage, CacheBackplane, ChangeAction, Error, ErrorKind, Result};
use tierlink_redis::{BackplaneConfiguration, BackplaneTransport, RedisCacheBackplane};
use tokio::sync::broadcast;

type TestResult = std::result::Result<(), Error>;

#[derive(Clone)]
struct MemoryTransport {
    bus: broadcast::Sender<Vec<u8>>,
    published: Arc<Mutex<Vec<Vec<u8>>>>,
    failing: Arc<AtomicBool>,
}

impl MemoryTransport {
    fn new() -> Self {
        let (bus, _) = broadcast::channel(1024);
        Self {
            bus,
            published: Arc::default(),
            failing: Arc::default(),
        }
    }

    fn published(&self) -> usize {
        self.published.lock().len()
    }
}

impl BackplaneTransport for MemoryTransport {
    async fn publish(&self, payload: Vec<u8>) -> Result<()> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(Error::with_cause(ErrorKind::TransientStore, "transport offline"));
        }
        self.published.lock().push(payload.clone());
        let _ = self.bus.send(payload);
        Ok(())
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, Vec<u8>>> {
        let receiver = self.bus.subscribe();
        Ok(futures::stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(payload) => return Some((payload, receiver)),
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed())
    }
}

fn backplane(transport: &MemoryTransport, configuration: BackplaneConfiguration) -> RedisCacheBackplane<MemoryTransport> {
    RedisCacheBackplane::with_transport(configuration, transport.clone(), Clock::new_frozen()).expect("valid backplane")
}

fn collect(backplane: &RedisCacheBackplane<MemoryTransport>) -> (tierlink_handle::Subscription, Arc<Mutex<Vec<BackplaneMessage>>>) {
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let subscription = backplane.messages().subscribe(move |message| sink.lock().push(message.clone()));
    (subscription, received)
}

async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn notifications_are_deduplicated_until_flushed() {
    let transport = MemoryTransport::new();
    let backplane = backplane(&transport, BackplaneConfiguration::default());

    backplane.notify_change("k", None, ChangeAction::Put);
    backplane.notify_change("k", None, ChangeAction::Put);
    backplane.notify_change("k", Some("r"), ChangeAction::Put);
    assert_eq!(backplane.pending_messages(), 2);

    backplane.flush().await;

    assert_eq!(backplane.pending_messages(), 0);
    assert_eq!(transport.published(), 1);
    assert_eq!(backplane.messages_sent(), 2);
    assert_eq!(backplane.chunks_sent(), 1);
}

#[tokio::test]
async fn clear_purges_pending_messages() {
    let transport = MemoryTransport::new();
    let backplane = backplane(&transport, BackplaneConfiguration::default());

    backplane.notify_change("a", None, ChangeAction::Add);
    backplane.notify_remove("b", None);
    backplane.notify_clear();

    assert_eq!(backplane.pending_messages(), 1);
}

#[tokio::test]
async fn full_buffer_drops_and_counts() {
    let transport = MemoryTransport::new();
    let backplane = backplane(&transport, BackplaneConfiguration::default().with_capacity(2));

    backplane.notify_remove("a", None);
    backplane.notify_remove("b", None);
    backplane.notify_remove("c", None);

    assert_eq!(backplane.pending_messages(), 2);
    assert_eq!(backplane.dropped_messages(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn other_instances_receive_and_own_messages_are_ignored() -> TestResult {
    let transport = MemoryTransport::new();
    let sender = backplane(&transport, BackplaneConfiguration::default());
    let receiver = backplane(&transport, BackplaneConfiguration::default());
    let (_own_subscription, own) = collect(&sender);
    let (_subscription, received) = collect(&receiver);

    assert!(eventually(|| transport.bus.receiver_count() == 2).await, "both instances subscribe");

    sender.notify_change("k", Some("r"), ChangeAction::Update);
    sender.notify_clear_region("r");
    sender.flush().await;

    assert!(eventually(|| received.lock().len() == 2).await, "messages delivered");
    let received = received.lock().clone();
    assert_eq!(received[0].action(), BackplaneAction::Changed(ChangeAction::Update));
    assert_eq!(received[0].key(), Some("k"));
    assert_eq!(received[0].origin(), sender.identifier());
    assert_eq!(received[1].action(), BackplaneAction::ClearRegion);
    assert_eq!(receiver.messages_received(), 2);

    assert!(own.lock().is_empty());
    assert_eq!(sender.messages_received(), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn debounce_flushes_without_explicit_call() {
    let transport = MemoryTransport::new();
    let backplane = RedisCacheBackplane::with_transport(
        BackplaneConfiguration::default().with_debounce(Duration::from_millis(5)),
        transport.clone(),
        Clock::new_tokio(),
    )
    .expect("valid backplane");

    backplane.notify_remove("k", None);

    assert!(eventually(|| transport.published() == 1).await, "debounced flush published");
    assert_eq!(backplane.pending_messages(), 0);
}

#[tokio::test]
async fn publish_failures_are_swallowed() {
    let transport = MemoryTransport::new();
    transport.failing.store(true, Ordering::Relaxed);
    let backplane = backplane(&transport, BackplaneConfiguration::default());

    backplane.notify_remove("k", None);
    backplane.flush().await;

    assert_eq!(backplane.messages_sent(), 0);
    assert_eq!(transport.published(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disposed_backplane_stops_receiving() {
    let transport = MemoryTransport::new();
    let sender = backplane(&transport, BackplaneConfiguration::default());
    let receiver = backplane(&transport, BackplaneConfiguration::default());
    let (_subscription, received) = collect(&receiver);
    assert!(eventually(|| transport.bus.receiver_count() == 2).await);

    receiver.dispose();
    receiver.notify_remove("ignored", None);
    assert_eq!(receiver.pending_messages(), 0);

    sender.notify_remove("k", None);
    sender.flush().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(received.lock().is_empty());
    assert_eq!(receiver.messages_received(), 0);
}

#[test]
fn requires_a_runtime() {
    let err = RedisCacheBackplane::with_transport(BackplaneConfiguration::default(), MemoryTransport::new(), Clock::new_frozen())
        .expect_err("no runtime");
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[test]
fn invalid_configuration_is_rejected() {
    let runtime = tokio::runtime::Builder::new_current_thread().build().expect("runtime");
    let _guard = runtime.enter();

    let err = RedisCacheBackplane::with_transport(
        BackplaneConfiguration::default().with_capacity(0),
        MemoryTransport::new(),
        Clock::new_frozen(),
    )
    .expect_err("zero capacity");
    assert_eq!(err.kind(), ErrorKind::Configuration);
}
