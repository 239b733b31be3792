//! Concurrency invariants for slot accounting
//!
//! Exercises real SlotManager instances under concurrent load: the slot
//! ceiling, release balance, idle monotonicity, and fallback behavior.

use forgeflow::config::EndpointConfig;
use forgeflow::endpoint::{Endpoint, EndpointRegistry};
use forgeflow::slots::{AcquireOptions, SlotManager};
use forgeflow::types::{Dialect, ModelTier};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn endpoint(tier: ModelTier, max_slots: u32) -> Endpoint {
    Endpoint::from_config(EndpointConfig {
        tier,
        name: format!("{tier} endpoint"),
        base_url: "http://localhost:9999".into(),
        dialect: Dialect::Native,
        model_id: tier.as_str().into(),
        max_slots,
        context_length: 4096,
        supports_tools: false,
        supports_vision: false,
        thinking: None,
        idle_shutdown_secs: 0,
        port: 9999,
        externally_managed: false,
        enabled: true,
    })
}

fn manager(endpoints: Vec<Endpoint>) -> Arc<SlotManager> {
    Arc::new(SlotManager::new(Arc::new(EndpointRegistry::new(endpoints))))
}

fn opts(timeout_ms: u64) -> AcquireOptions {
    AcquireOptions {
        timeout: Duration::from_millis(timeout_ms),
        allow_fallback: false,
        fallback_tier: None,
        max_attempts: 50,
        initial_backoff: Duration::from_millis(5),
    }
}

#[tokio::test]
async fn ceiling_holds_under_concurrent_load() {
    const MAX_SLOTS: u32 = 3;
    const WORKERS: usize = 12;
    const ROUNDS: usize = 25;

    let slots = manager(vec![endpoint(ModelTier::Coder, MAX_SLOTS)]);
    let registry = Arc::clone(slots.registry());
    let violated = Arc::new(AtomicBool::new(false));
    let done = Arc::new(AtomicBool::new(false));

    // Sampler watches the counter while workers hammer acquire/release
    let watcher = {
        let registry = Arc::clone(&registry);
        let violated = Arc::clone(&violated);
        let done = Arc::clone(&done);
        tokio::spawn(async move {
            while !done.load(Ordering::SeqCst) {
                let active = registry.get(ModelTier::Coder).unwrap().active_slots();
                if active > MAX_SLOTS {
                    violated.store(true, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_micros(200)).await;
            }
        })
    };

    let mut workers = Vec::new();
    for _ in 0..WORKERS {
        let slots = Arc::clone(&slots);
        workers.push(tokio::spawn(async move {
            let mut acquired = 0usize;
            for _ in 0..ROUNDS {
                let (tier, ok) = slots.acquire_slot(ModelTier::Coder, &opts(2000)).await;
                if ok {
                    acquired += 1;
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    slots.release_slot(tier);
                }
            }
            acquired
        }));
    }

    let mut total_acquired = 0;
    for worker in workers {
        total_acquired += worker.await.unwrap();
    }
    done.store(true, Ordering::SeqCst);
    watcher.await.unwrap();

    assert!(!violated.load(Ordering::SeqCst), "active_slots exceeded max_slots");
    // Every acquire was balanced by a release
    assert_eq!(slots.total_active(), 0);
    assert!(total_acquired > 0);
}

#[tokio::test]
async fn sequential_acquires_succeed_on_single_slot() {
    let slots = manager(vec![endpoint(ModelTier::Coder, 1)]);

    let (_, ok) = slots.acquire_slot(ModelTier::Coder, &opts(100)).await;
    assert!(ok);
    slots.release_slot(ModelTier::Coder);

    let (_, ok) = slots.acquire_slot(ModelTier::Coder, &opts(100)).await;
    assert!(ok);
    slots.release_slot(ModelTier::Coder);
}

#[tokio::test]
async fn waiter_succeeds_after_holder_releases() {
    let slots = manager(vec![endpoint(ModelTier::Coder, 1)]);

    let (_, ok) = slots.acquire_slot(ModelTier::Coder, &opts(100)).await;
    assert!(ok);

    // Second acquisition waits within its deadline
    let waiter = {
        let slots = Arc::clone(&slots);
        tokio::spawn(async move { slots.acquire_slot(ModelTier::Coder, &opts(2000)).await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    slots.release_slot(ModelTier::Coder);

    let (tier, ok) = waiter.await.unwrap();
    assert!(ok);
    assert_eq!(tier, ModelTier::Coder);
}

#[tokio::test]
async fn saturated_primary_falls_back() {
    let slots = manager(vec![
        endpoint(ModelTier::Coder, 1),
        endpoint(ModelTier::Q4Tools, 2),
    ]);

    let (_, ok) = slots.acquire_slot(ModelTier::Coder, &opts(100)).await;
    assert!(ok);

    let fallback_opts = AcquireOptions {
        allow_fallback: true,
        fallback_tier: Some(ModelTier::Q4Tools),
        ..opts(200)
    };
    let (tier, ok) = slots.acquire_slot(ModelTier::Coder, &fallback_opts).await;
    assert!(ok);
    assert_eq!(tier, ModelTier::Q4Tools);

    // Balance both endpoints
    slots.release_slot(ModelTier::Coder);
    slots.release_slot(ModelTier::Q4Tools);
    assert_eq!(slots.total_active(), 0);
}

#[tokio::test]
async fn exhausted_capacity_without_fallback_reports_failure() {
    let slots = manager(vec![endpoint(ModelTier::Coder, 1)]);

    let (_, ok) = slots.acquire_slot(ModelTier::Coder, &opts(100)).await;
    assert!(ok);

    let (tier, ok) = slots.acquire_slot(ModelTier::Coder, &opts(150)).await;
    assert_eq!(tier, ModelTier::Coder);
    assert!(!ok);
}

#[tokio::test]
async fn idle_is_none_while_any_slot_is_active() {
    let slots = manager(vec![endpoint(ModelTier::Vision, 2)]);

    let (_, ok) = slots.acquire_slot(ModelTier::Vision, &opts(100)).await;
    assert!(ok);
    let (_, ok) = slots.acquire_slot(ModelTier::Vision, &opts(100)).await;
    assert!(ok);

    slots.release_slot(ModelTier::Vision);
    // One slot still held: the tier is not idle
    assert_eq!(slots.idle_seconds(ModelTier::Vision), None);

    slots.release_slot(ModelTier::Vision);
    assert!(slots.idle_seconds(ModelTier::Vision).is_some());
}

#[tokio::test]
async fn mark_active_with_held_slot_keeps_idle_none() {
    let slots = manager(vec![endpoint(ModelTier::Vision, 1)]);

    let (_, ok) = slots.acquire_slot(ModelTier::Vision, &opts(100)).await;
    assert!(ok);

    for _ in 0..3 {
        slots.mark_active(ModelTier::Vision);
        assert_eq!(slots.idle_seconds(ModelTier::Vision), None);
    }

    slots.release_slot(ModelTier::Vision);
    assert!(slots.idle_seconds(ModelTier::Vision).is_some());
}

#[tokio::test]
async fn mark_active_resets_a_running_idle_clock() {
    let slots = manager(vec![endpoint(ModelTier::Vision, 1)]);

    let (_, ok) = slots.acquire_slot(ModelTier::Vision, &opts(100)).await;
    assert!(ok);
    slots.release_slot(ModelTier::Vision);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(slots.is_idle(ModelTier::Vision, Duration::from_millis(40)));

    slots.mark_active(ModelTier::Vision);
    assert!(!slots.is_idle(ModelTier::Vision, Duration::from_millis(40)));
}

#[tokio::test]
async fn disabled_tier_fails_fast() {
    let config = EndpointConfig {
        tier: ModelTier::Summary,
        name: "Summary".into(),
        base_url: String::new(),
        dialect: Dialect::Native,
        model_id: "summary".into(),
        max_slots: 4,
        context_length: 4096,
        supports_tools: false,
        supports_vision: false,
        thinking: None,
        idle_shutdown_secs: 0,
        port: 0,
        externally_managed: false,
        enabled: false,
    };
    let slots = manager(vec![Endpoint::from_config(config)]);

    let started = std::time::Instant::now();
    let (_, ok) = slots.acquire_slot(ModelTier::Summary, &opts(5000)).await;
    assert!(!ok);
    assert!(started.elapsed() < Duration::from_millis(100));
}
