// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Integration tests for `InMemoryHandle`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tick::{Clock, ClockControl};
use tierlink_handle::{
    CacheHandle, CacheItem, Error, ErrorKind, ExpirationMode, HandleConfiguration, RemovalReason, UpdateResult, update_fn,
};
use tierlink_memory::InMemoryHandle;

type TestResult = Result<(), Error>;

fn block_on<F: std::future::Future>(f: F) -> F::Output {
    futures::executor::block_on(f)
}

fn handle_with(clock: Clock) -> InMemoryHandle<String> {
    InMemoryHandle::builder(HandleConfiguration::new("memory").with_statistics(true), clock)
        .build()
        .expect("valid configuration")
}

#[test]
fn add_only_inserts_when_absent() -> TestResult {
    block_on(async {
        let handle = handle_with(Clock::new_frozen());

        assert!(handle.add(CacheItem::new("k", "v1".to_string())?).await?);
        assert!(!handle.add(CacheItem::new("k", "v2".to_string())?).await?);
        assert_eq!(handle.get("k", None).await?.expect("hit").value(), "v1");
        Ok(())
    })
}

#[test]
fn put_overwrites() -> TestResult {
    block_on(async {
        let handle = handle_with(Clock::new_frozen());

        handle.put(CacheItem::new("k", "v1".to_string())?).await?;
        handle.put(CacheItem::new("k", "v2".to_string())?).await?;
        assert_eq!(handle.get("k", None).await?.expect("hit").value(), "v2");
        assert_eq!(handle.stats().snapshot().puts, 2);
        Ok(())
    })
}

#[test]
fn stored_items_get_creation_time_and_defaults() -> TestResult {
    block_on(async {
        let clock = Clock::new_frozen();
        let configuration =
            HandleConfiguration::new("memory").with_expiration(ExpirationMode::Absolute, Duration::from_secs(30))?;
        let handle = InMemoryHandle::<String>::builder(configuration, clock.clone()).build()?;

        handle.put(CacheItem::new("k", "v".to_string())?).await?;
        let item = handle.get("k", None).await?.expect("hit");

        assert_eq!(item.created(), Some(clock.system_time()));
        assert_eq!(item.expiration_mode(), ExpirationMode::Absolute);
        assert_eq!(item.expiration_timeout(), Duration::from_secs(30));
        assert!(item.uses_expiration_defaults());
        Ok(())
    })
}

#[test]
fn expired_item_is_a_miss_and_reported() -> TestResult {
    block_on(async {
        let control = ClockControl::new();
        let handle = handle_with(control.to_clock());
        let reasons = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reasons);
        let _subscription = handle
            .removals()
            .subscribe(move |event| sink.lock().expect("lock poisoned").push(event.reason));

        let item = CacheItem::new("k", "v".to_string())?.with_absolute_expiration(Duration::from_secs(5))?;
        handle.put(item).await?;

        control.advance(Duration::from_secs(4));
        assert!(handle.get("k", None).await?.is_some());

        control.advance(Duration::from_secs(2));
        assert!(handle.get("k", None).await?.is_none());
        assert!(!handle.exists("k", None).await?);
        assert_eq!(*reasons.lock().expect("lock poisoned"), vec![RemovalReason::Expired]);
        Ok(())
    })
}

#[test]
fn sliding_item_survives_while_read() -> TestResult {
    block_on(async {
        let control = ClockControl::new();
        let handle = handle_with(control.to_clock());

        let item = CacheItem::new("k", "v".to_string())?.with_sliding_expiration(Duration::from_secs(10))?;
        handle.put(item).await?;

        for _ in 0..5 {
            control.advance(Duration::from_secs(6));
            assert!(handle.get("k", None).await?.is_some());
        }

        control.advance(Duration::from_secs(11));
        assert!(handle.get("k", None).await?.is_none());
        Ok(())
    })
}

#[test]
fn every_read_refreshes_last_accessed() -> TestResult {
    block_on(async {
        let control = ClockControl::new();
        let clock = control.to_clock();
        let handle = handle_with(clock.clone());

        let absolute = CacheItem::new("a", "v".to_string())?.with_absolute_expiration(Duration::from_secs(600))?;
        handle.put(absolute).await?;
        handle.put(CacheItem::new("n", "v".to_string())?.with_no_expiration()).await?;
        let stored_at = clock.system_time();

        control.advance(Duration::from_secs(60));
        let read_at = clock.system_time();

        for key in ["a", "n"] {
            let item = handle.get(key, None).await?.expect("hit");
            assert_eq!(item.last_accessed(), Some(read_at));
            assert_eq!(item.created(), Some(stored_at));
        }

        // Absolute expiration still counts from creation.
        control.advance(Duration::from_secs(541));
        assert!(handle.get("a", None).await?.is_none());
        assert!(handle.get("n", None).await?.is_some());
        Ok(())
    })
}

#[test]
fn add_replaces_expired_item() -> TestResult {
    block_on(async {
        let control = ClockControl::new();
        let handle = handle_with(control.to_clock());

        handle
            .put(CacheItem::new("k", "old".to_string())?.with_absolute_expiration(Duration::from_secs(1))?)
            .await?;
        control.advance(Duration::from_secs(2));

        assert!(handle.add(CacheItem::new("k", "new".to_string())?).await?);
        assert_eq!(handle.get("k", None).await?.expect("hit").value(), "new");
        Ok(())
    })
}

#[test]
fn clear_region_removes_only_that_region() -> TestResult {
    block_on(async {
        let handle = handle_with(Clock::new_frozen());

        handle.put(CacheItem::in_region("a", "r1", "1".to_string())?).await?;
        handle.put(CacheItem::in_region("b", "r1", "2".to_string())?).await?;
        handle.put(CacheItem::in_region("a", "r2", "3".to_string())?).await?;
        handle.put(CacheItem::new("a", "4".to_string())?).await?;

        handle.clear_region("r1").await?;

        assert!(handle.get("a", Some("r1")).await?.is_none());
        assert!(handle.get("b", Some("r1")).await?.is_none());
        assert!(handle.get("a", Some("r2")).await?.is_some());
        assert!(handle.get("a", None).await?.is_some());
        Ok(())
    })
}

#[test]
fn remove_and_clear() -> TestResult {
    block_on(async {
        let handle = handle_with(Clock::new_frozen());

        assert!(!handle.remove("missing", None).await?);

        handle.put(CacheItem::new("a", "1".to_string())?).await?;
        handle.put(CacheItem::new("b", "2".to_string())?).await?;
        assert!(handle.remove("a", None).await?);
        assert!(handle.get("a", None).await?.is_none());

        handle.clear().await?;
        assert!(handle.get("b", None).await?.is_none());
        Ok(())
    })
}

#[test]
fn update_outcomes() -> TestResult {
    block_on(async {
        let handle = handle_with(Clock::new_frozen());

        let missing = handle.update("k", None, update_fn(|v: &String| Some(v.clone())), 5).await?;
        assert_eq!(missing, UpdateResult::ItemDidNotExist);

        handle.put(CacheItem::new("k", "1".to_string())?).await?;

        let none = handle.update("k", None, update_fn(|_: &String| None), 5).await?;
        assert_eq!(none, UpdateResult::FactoryReturnedNone);
        assert_eq!(handle.get("k", None).await?.expect("hit").value(), "1");

        let updated = handle
            .update("k", None, update_fn(|v: &String| Some(format!("{v}+"))), 5)
            .await?;
        let UpdateResult::Success { item, retried, attempts } = updated else {
            panic!("expected success, got {updated:?}");
        };
        assert_eq!(item.value(), "1+");
        assert!(!retried);
        assert_eq!(attempts, 1);
        Ok(())
    })
}

#[test]
fn invalid_configuration_is_rejected() {
    let err = InMemoryHandle::<String>::builder(HandleConfiguration::default(), Clock::new_frozen())
        .build()
        .expect_err("empty name must be rejected");
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[test]
fn capacity_evictions_are_reported() -> TestResult {
    block_on(async {
        let handle = InMemoryHandle::<String>::builder(HandleConfiguration::new("bounded"), Clock::new_frozen())
            .max_capacity(1)
            .build()?;
        let evicted = Arc::new(Mutex::new(0_usize));
        let sink = Arc::clone(&evicted);
        let _subscription = handle.removals().subscribe(move |event| {
            if event.reason == RemovalReason::Evicted {
                *sink.lock().expect("lock poisoned") += 1;
            }
        });

        for i in 0..20 {
            handle.put(CacheItem::new(format!("k{i}"), i.to_string())?).await?;
        }
        let count = handle.count().expect("memory handle counts");

        assert!(count <= 1, "count = {count}");
        assert!(*evicted.lock().expect("lock poisoned") > 0);
        Ok(())
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_updates_lose_no_write() -> TestResult {
    let handle = Arc::new(handle_with(Clock::new_frozen()));
    handle.put(CacheItem::new("counter", "0".to_string())?).await?;

    let tasks: Vec<_> = (0..32)
        .map(|_| {
            let handle = Arc::clone(&handle);
            tokio::spawn(async move {
                handle
                    .update(
                        "counter",
                        None,
                        update_fn(|v: &String| Some((v.parse::<u32>().unwrap_or(0) + 1).to_string())),
                        10,
                    )
                    .await
            })
        })
        .collect();

    for task in tasks {
        assert!(task.await.expect("task panicked")?.is_success());
    }

    assert_eq!(handle.get("counter", None).await?.expect("hit").value(), "32");
    Ok(())
}
