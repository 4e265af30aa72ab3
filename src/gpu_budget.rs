//! Per-GPU capacity bookkeeping that every other component reads from and
//! writes into: a plain accounting record, no device I/O of its own.

use crate::device::GpuVendor;

/// Tracks one GPU's total, used, lent, borrowed, and reserved VRAM.
///
/// `total_bytes` never changes after registration. `model_bytes` and
/// `kv_cache_bytes` are the model's own working set, updated independently by
/// `VramLendingPool::update_gpu_usage` (a decode step grows `kv_cache_bytes`
/// without touching `model_bytes`). `lent_bytes` is capacity this GPU has
/// given away to other GPUs; `borrowed_bytes` is capacity this GPU currently
/// holds from elsewhere. `reserved_bytes` is the floor carved out at
/// registration time (`total_bytes * min_free_ratio`) that never counts as
/// lendable, regardless of how idle the GPU looks.
#[derive(Debug, Clone, PartialEq)]
pub struct GpuBudget {
    pub gpu_id: u32,
    pub vendor: GpuVendor,
    pub total_bytes: u64,
    pub model_bytes: u64,
    pub kv_cache_bytes: u64,
    pub lent_bytes: u64,
    pub borrowed_bytes: u64,
    pub reserved_bytes: u64,
    pub device_name: String,
    pub pcie_gen: u32,
    pub compute_capability: (u32, u32),
}

impl GpuBudget {
    /// Minimal constructor for callers that don't care about the device
    /// profile fields; `reserved_bytes` defaults to zero.
    pub fn new(gpu_id: u32, vendor: GpuVendor, total_bytes: u64, pcie_gen: u32) -> Self {
        Self::with_profile(gpu_id, vendor, total_bytes, 0, "", pcie_gen, (0, 0))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn with_profile(
        gpu_id: u32,
        vendor: GpuVendor,
        total_bytes: u64,
        reserved_bytes: u64,
        device_name: &str,
        pcie_gen: u32,
        compute_capability: (u32, u32),
    ) -> Self {
        Self {
            gpu_id,
            vendor,
            total_bytes,
            model_bytes: 0,
            kv_cache_bytes: 0,
            lent_bytes: 0,
            borrowed_bytes: 0,
            reserved_bytes,
            device_name: device_name.to_string(),
            pcie_gen,
            compute_capability,
        }
    }

    /// Physical VRAM not currently occupied by the resident model, its KV
    /// cache, capacity already lent out, or the reserved floor.
    pub fn free_bytes(&self) -> u64 {
        let used = self.model_bytes + self.kv_cache_bytes + self.lent_bytes + self.reserved_bytes;
        self.total_bytes.saturating_sub(used)
    }

    /// How much of `free_bytes` this GPU is still willing to lend, beyond
    /// what `reserved_bytes` already carves out.
    pub fn lendable_bytes(&self) -> u64 {
        self.free_bytes().saturating_sub(self.reserved_bytes)
    }

    /// Fraction of total capacity currently occupied, in `[0.0, 1.0]`: the
    /// resident model, its KV cache, and the reserved floor. Does not count
    /// lent or borrowed bytes — this is the figure the reclaim-urgency
    /// thresholds compare against.
    pub fn utilization(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        let used = self.model_bytes + self.kv_cache_bytes + self.reserved_bytes;
        (used as f64 / self.total_bytes as f64).min(1.0)
    }

    /// Effective capacity available to this GPU's own workload: physical
    /// total, plus what's borrowed in, minus what's lent out.
    pub fn effective_capacity(&self) -> u64 {
        (self.total_bytes + self.borrowed_bytes).saturating_sub(self.lent_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn budget() -> GpuBudget {
        GpuBudget::with_profile(0, GpuVendor::Nvidia, 80_000_000_000, 8_000_000_000, "H100", 4, (9, 0))
    }

    #[test]
    fn free_bytes_subtracts_used_lent_and_reserved() {
        let mut b = budget();
        b.model_bytes = 40_000_000_000;
        b.kv_cache_bytes = 10_000_000_000;
        b.lent_bytes = 10_000_000_000;
        assert_eq!(b.free_bytes(), 12_000_000_000);
    }

    #[test]
    fn lendable_bytes_excludes_the_reserved_floor() {
        let mut b = budget();
        b.model_bytes = 10_000_000_000;
        // free_bytes = 80e9 - 10e9 - 0 - 8e9 = 62e9, minus the 8e9 reserve.
        assert_eq!(b.lendable_bytes(), 54_000_000_000);
    }

    #[test]
    fn lendable_bytes_shrinks_as_more_is_lent() {
        let mut b = budget();
        b.lent_bytes = 20_000_000_000;
        assert_eq!(b.lendable_bytes(), 44_000_000_000);
    }

    #[test]
    fn utilization_counts_model_kv_and_reserved_but_not_lent_or_borrowed() {
        let mut b = budget();
        b.model_bytes = 30_000_000_000;
        b.kv_cache_bytes = 10_000_000_000;
        b.lent_bytes = 10_000_000_000;
        b.borrowed_bytes = 5_000_000_000;
        // (30e9 + 10e9 + 8e9) / 80e9 = 0.6
        assert_eq!(b.utilization(), 0.6);
    }

    #[test]
    fn effective_capacity_nets_borrowed_against_lent() {
        let mut b = budget();
        b.lent_bytes = 10_000_000_000;
        b.borrowed_bytes = 16_000_000_000;
        assert_eq!(b.effective_capacity(), 86_000_000_000);
    }

    #[test]
    fn zero_total_bytes_reports_zero_utilization_not_nan() {
        let b = GpuBudget::new(0, GpuVendor::Unknown, 0, 0);
        assert_eq!(b.utilization(), 0.0);
    }

    #[test]
    fn model_and_kv_cache_usage_are_independent() {
        let mut b = budget();
        b.model_bytes = 20_000_000_000;
        b.kv_cache_bytes = 5_000_000_000;
        assert_eq!(b.model_bytes, 20_000_000_000);
        assert_eq!(b.kv_cache_bytes, 5_000_000_000);
    }
}
