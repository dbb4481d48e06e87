// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Log output of the cache manager.

use std::{
    io::Write,
    sync::{Arc, Mutex},
};

use tick::Clock;
use tierlink::{BackplaneMessage, CacheItem, CacheManager, Error, HandleConfiguration, ManagerConfiguration, OriginId, update_fn};
use tierlink_handle::testing::{BackplaneHub, HandleOp, MockHandle};
use tracing_subscriber::{fmt::MakeWriter, layer::SubscriberExt};

type TestResult = Result<(), Error>;

/// Collects formatted log lines written by the thread-local subscriber.
#[derive(Debug, Clone, Default)]
struct LogCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    fn output(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock().unwrap()).to_string()
    }

    fn assert_contains(&self, expected: &str) {
        let output = self.output();
        assert!(output.contains(expected), "log output does not contain '{expected}', got:\n{output}");
    }

    fn subscriber(&self) -> impl tracing::Subscriber {
        tracing_subscriber::registry().with(tracing_subscriber::fmt::layer().with_writer(self.clone()).with_ansi(false))
    }
}

struct LogCaptureWriter {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl Write for LogCaptureWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = LogCaptureWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogCaptureWriter {
            buffer: Arc::clone(&self.buffer),
        }
    }
}

fn block_on<F: Future>(f: F) -> F::Output {
    futures::executor::block_on(f)
}

#[test]
fn hits_and_misses_are_logged_with_key_fields() -> TestResult {
    let capture = LogCapture::default();
    let _guard = tracing::subscriber::set_default(capture.subscriber());

    let handle = MockHandle::new("memory");
    let manager = CacheManager::builder(ManagerConfiguration::new("orders"), Clock::new_frozen())
        .handle(handle)
        .build()?;

    block_on(async {
        manager.put(CacheItem::in_region("order-1", "eu", "open".to_string())?).await?;
        manager.get("order-1", Some("eu")).await?;
        manager.get("order-2", None).await?;
        Ok::<_, Error>(())
    })?;

    capture.assert_contains("DEBUG");
    capture.assert_contains("cache hit");
    capture.assert_contains("cache miss");
    capture.assert_contains("cache.name=\"orders\"");
    capture.assert_contains("cache.key=\"order-1\"");
    capture.assert_contains("cache.region=\"eu\"");
    Ok(())
}

#[test]
fn exhausted_update_is_a_warning() -> TestResult {
    let capture = LogCapture::default();
    let _guard = tracing::subscriber::set_default(capture.subscriber());

    let handle = MockHandle::new("memory");
    let manager = CacheManager::builder(ManagerConfiguration::new("orders"), Clock::new_frozen())
        .handle(handle.clone())
        .build()?;

    block_on(async {
        manager.put(CacheItem::new("k", "v".to_string())?).await?;
        handle.force_conflicts(10);
        manager
            .try_update("k", None, update_fn(|v: &String| Some(v.clone())), 2)
            .await?;
        Ok::<_, Error>(())
    })?;

    capture.assert_contains("WARN");
    capture.assert_contains("update gave up after too many version conflicts");
    Ok(())
}

#[test]
fn remote_evictions_are_info_and_failures_are_errors() -> TestResult {
    let capture = LogCapture::default();
    let _guard = tracing::subscriber::set_default(capture.subscriber());

    let hub = BackplaneHub::new();
    let backplane = hub.connect();
    let near = MockHandle::<String>::new("near");
    let far = MockHandle::with_configuration(HandleConfiguration::new("far").with_backplane_source(true), Clock::new_frozen());
    far.set_distributed(true);
    let manager = CacheManager::builder(
        ManagerConfiguration::new("orders").with_retry_timeout(std::time::Duration::ZERO),
        tick::ClockControl::new().auto_advance_timers(true).to_clock(),
    )
    .handle(near.clone())
    .handle(far)
    .backplane(backplane.clone())
    .build()?;

    near.fail_when(|op| matches!(op, HandleOp::Remove { .. }));
    backplane.inject(&BackplaneMessage::removed(OriginId::from_bytes([9; 16]), "k", None));
    block_on(manager.process_pending_notifications());

    capture.assert_contains("INFO");
    capture.assert_contains("evicting after remote change");
    capture.assert_contains("eviction failed, retrying");
    capture.assert_contains("ERROR");
    capture.assert_contains("eviction failed after retry");
    Ok(())
}
