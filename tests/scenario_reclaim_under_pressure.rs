//! End-to-end: continuing from the two-GPU lending scenario, GPU 1's own
//! usage grows and a HIGH-urgency reclaim must release the lease.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use vram_orchestrator::{GpuVendor, LeaseState, LendingPolicy, ReclaimUrgency, VramLendingPool};

#[test]
fn reclaim_under_pressure_releases_the_lease_and_fires_hook_once() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();

    let pool = VramLendingPool::new(LendingPolicy::default());
    pool.register_gpu(0, GpuVendor::Nvidia, 24_000_000_000, 4);
    pool.register_gpu(1, GpuVendor::Nvidia, 16_000_000_000, 5);
    pool.update_gpu_usage(0, Some(21_000_000_000), None);
    pool.update_gpu_usage(1, Some(10_000_000_000), None);
    let lease = pool.borrow(0, 1_000_000_000, "kv_cache").unwrap();

    let hook_calls = Arc::new(AtomicUsize::new(0));
    let hook_calls_clone = hook_calls.clone();
    pool.on_reclaim(move |_lease| {
        hook_calls_clone.fetch_add(1, Ordering::SeqCst);
    });

    pool.update_gpu_usage(1, None, Some(3_000_000_000));
    let reclaimed = pool.reclaim(1, ReclaimUrgency::High, None);

    assert_eq!(reclaimed, 1_000_000_000);
    assert_eq!(pool.get_budget(1).unwrap().lent_bytes, 0);
    assert_eq!(hook_calls.load(Ordering::SeqCst), 1);

    // The lease is no longer in the active set (state RELEASED/MIGRATED).
    assert!(pool.get_active_leases().iter().all(|l| l.lease_id != lease.lease_id));
    let _ = LeaseState::Released;
}
