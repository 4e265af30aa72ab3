//! End-to-end: when reclaim only needs to free part of what's leased, the
//! lowest-priority lease goes first and higher-priority leases survive.

use vram_orchestrator::{GpuVendor, LendingPolicy, ReclaimUrgency, VramLendingPool};

#[test]
fn reclaim_frees_the_low_priority_lease_and_spares_the_high_priority_one() {
    let pool = VramLendingPool::new(LendingPolicy::default());
    pool.register_gpu(0, GpuVendor::Nvidia, 24_000_000_000, 4);
    pool.register_gpu(1, GpuVendor::Nvidia, 24_000_000_000, 4);

    let low_priority = pool.borrow_with_priority(1, 500_000_000, "kv_cache", 0).unwrap();
    let high_priority = pool.borrow_with_priority(1, 500_000_000, "kv_cache", 10).unwrap();

    let reclaimed = pool.reclaim(0, ReclaimUrgency::High, Some(500_000_000));

    assert_eq!(reclaimed, 500_000_000);
    let active_ids: Vec<u64> = pool.get_active_leases().iter().map(|l| l.lease_id).collect();
    assert!(!active_ids.contains(&low_priority.lease_id));
    assert!(active_ids.contains(&high_priority.lease_id));
}
