//! End-to-end: GPU 0 is nearly full and borrows from GPU 1, which has more
//! free capacity and a faster PCIe link.

use vram_orchestrator::{GpuVendor, LendingPolicy, VramLendingPool};

#[test]
fn borrow_prefers_the_gpu_with_more_free_capacity_and_faster_pcie() {
    let pool = VramLendingPool::new(LendingPolicy::default());
    pool.register_gpu(0, GpuVendor::Nvidia, 24_000_000_000, 4);
    pool.register_gpu(1, GpuVendor::Nvidia, 16_000_000_000, 5);
    pool.update_gpu_usage(0, Some(21_000_000_000), None);
    pool.update_gpu_usage(1, Some(10_000_000_000), None);

    let lease = pool.borrow(0, 1_000_000_000, "kv_cache").expect("GPU 1 should have lendable capacity");

    assert_eq!(lease.lender_gpu, 1);
    assert_eq!(lease.borrower_gpu, 0);
    assert_eq!(pool.get_budget(0).unwrap().borrowed_bytes, 1_000_000_000);
    assert_eq!(pool.get_budget(1).unwrap().lent_bytes, 1_000_000_000);
}
