//! Cross-GPU VRAM lending: GPUs register a budget, lend spare capacity into
//! a pre-allocated buffer, and the pool reclaims under pressure with
//! graceful migration before forced drops.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::LendingPolicyConfig;
use crate::device::{DeviceBackend, DeviceDescriptor, GpuUtilizationMonitor, GpuVendor, NoopMonitor};
use crate::gpu_budget::GpuBudget;
use crate::transport::{AlwaysAvailableTransport, InterGpuTransport};

/// Lifecycle state of a `VRAMLease`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaseState {
    Active,
    Reclaiming,
    Migrated,
    Released,
}

/// How urgently a reclaim must happen, derived from the lender's
/// utilization at the time the background monitor samples it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ReclaimUrgency {
    Low,
    Medium,
    High,
    Critical,
}

/// An opaque handle to whatever tensor storage actually occupies the leased
/// bytes. The core never inspects this; it only carries it back to the
/// caller and to `InterGpuTransport::migrate` on reclaim.
pub type TensorRef = u64;

/// A grant of `size_bytes` on `lender_gpu` to `borrower_gpu`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VramLease {
    pub lease_id: u64,
    pub lender_gpu: u32,
    pub borrower_gpu: u32,
    pub size_bytes: u64,
    pub buffer_offset: u64,
    pub state: LeaseState,
    pub tensor_ref: Option<TensorRef>,
    pub created_at: DateTime<Utc>,
    pub purpose: String,
    /// Lower priority is reclaimed first; ties broken by age (oldest first).
    pub priority: i32,
}

impl VramLease {
    /// Seconds since the lease was created.
    pub fn age_s(&self) -> f64 {
        (Utc::now() - self.created_at).num_milliseconds().max(0) as f64 / 1000.0
    }

    pub fn is_active(&self) -> bool {
        self.state == LeaseState::Active
    }
}

/// Re-exported policy knobs; see `config::LendingPolicyConfig` for defaults.
pub type LendingPolicy = LendingPolicyConfig;

#[derive(Debug, Default, Clone)]
struct PoolStats {
    total_leases_created: u64,
    total_bytes_lent: u64,
    peak_lent_bytes: u64,
    preemptions_graceful: u64,
    preemptions_forced: u64,
    reclaim_ms_sum: f64,
    reclaim_count: u64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct LendingStats {
    pub total_leases_created: u64,
    pub total_bytes_lent: u64,
    pub peak_lent_bytes: u64,
    pub preemptions_graceful: u64,
    pub preemptions_forced: u64,
    pub reclaim_avg_ms: f64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PoolCapacity {
    pub total_lendable_bytes: u64,
    pub total_lent_bytes: u64,
    pub total_borrowed_bytes: u64,
    pub active_lease_count: usize,
}

struct GpuState {
    budget: GpuBudget,
    lending_buffer_bytes: u64,
    stop_lending: bool,
}

type ReclaimHook = Box<dyn Fn(&VramLease) + Send + Sync>;
type LendHook = Box<dyn Fn(&VramLease) + Send + Sync>;

/// Cooperative cross-GPU VRAM lending pool.
pub struct VramLendingPool {
    policy: LendingPolicy,
    gpus: RwLock<HashMap<u32, GpuState>>,
    leases: RwLock<HashMap<u64, VramLease>>,
    next_lease_id: Mutex<u64>,
    stats: Mutex<PoolStats>,
    monitor: Arc<dyn GpuUtilizationMonitor>,
    transport: Arc<dyn InterGpuTransport>,
    on_reclaim: Mutex<Vec<ReclaimHook>>,
    on_lend: Mutex<Vec<LendHook>>,
    monitor_thread: Mutex<Option<(Arc<std::sync::atomic::AtomicBool>, JoinHandle<()>)>>,
}

impl VramLendingPool {
    pub fn new(policy: LendingPolicy) -> Self {
        Self::with_collaborators(policy, Arc::new(NoopMonitor), Arc::new(AlwaysAvailableTransport))
    }

    pub fn with_collaborators(
        policy: LendingPolicy,
        monitor: Arc<dyn GpuUtilizationMonitor>,
        transport: Arc<dyn InterGpuTransport>,
    ) -> Self {
        Self {
            policy,
            gpus: RwLock::new(HashMap::new()),
            leases: RwLock::new(HashMap::new()),
            next_lease_id: Mutex::new(1),
            stats: Mutex::new(PoolStats::default()),
            monitor,
            transport,
            on_reclaim: Mutex::new(Vec::new()),
            on_lend: Mutex::new(Vec::new()),
            monitor_thread: Mutex::new(None),
        }
    }

    /// Register a GPU's budget. Idempotent: re-registering preserves any
    /// outstanding lent/borrowed accounting already on record.
    pub fn register_gpu(&self, gpu_id: u32, vendor: GpuVendor, total_bytes: u64, pcie_gen: u32) {
        self.register_gpu_with_profile(gpu_id, vendor, total_bytes, 0, "", pcie_gen, (0, 0));
    }

    /// Like [`register_gpu`](Self::register_gpu) but carrying the full
    /// device profile: initial model footprint, a human-readable name, and
    /// compute capability, used for logging and for lender scoring.
    #[allow(clippy::too_many_arguments)]
    pub fn register_gpu_with_profile(
        &self,
        gpu_id: u32,
        vendor: GpuVendor,
        total_bytes: u64,
        model_bytes: u64,
        device_name: &str,
        pcie_gen: u32,
        compute_capability: (u32, u32),
    ) {
        let mut gpus = self.gpus.write().unwrap();
        if let Some(existing) = gpus.get_mut(&gpu_id) {
            existing.budget.total_bytes = total_bytes;
            existing.budget.vendor = vendor;
            existing.budget.device_name = device_name.to_string();
            existing.budget.pcie_gen = pcie_gen;
            existing.budget.compute_capability = compute_capability;
            info!(gpu_id, "re-registered GPU, preserving lease accounting");
            return;
        }
        let reserved_bytes = (total_bytes as f64 * self.policy.min_free_ratio) as u64;
        let lending_buffer_bytes = (total_bytes as f64 * self.policy.buffer_prealloc_ratio) as u64;
        let mut budget = GpuBudget::with_profile(gpu_id, vendor, total_bytes, reserved_bytes, device_name, pcie_gen, compute_capability);
        budget.model_bytes = model_bytes;
        gpus.insert(
            gpu_id,
            GpuState {
                budget,
                lending_buffer_bytes,
                stop_lending: false,
            },
        );
        info!(gpu_id, total_bytes, "registered GPU with lending pool");
    }

    /// Register a GPU discovered through a `DeviceRuntime::enumerate` call,
    /// taking its name, vendor, and compute capability straight from the
    /// descriptor instead of requiring the caller to re-type them.
    pub fn register_device(&self, device: &DeviceDescriptor) {
        self.register_gpu_with_profile(
            device.backend.index(),
            device.vendor,
            device.total_memory_bytes,
            0,
            &device.name,
            device.pcie_gen,
            device.compute_capability,
        );
    }

    /// Update a GPU's own working-set usage, independent of lend/borrow
    /// accounting. Each argument that is `Some` overwrites the corresponding
    /// field; `None` leaves it untouched, so a decode step can grow
    /// `kv_cache_bytes` without re-stating `model_bytes`.
    pub fn update_gpu_usage(&self, gpu_id: u32, model_bytes: Option<u64>, kv_cache_bytes: Option<u64>) {
        if let Some(state) = self.gpus.write().unwrap().get_mut(&gpu_id) {
            if let Some(model_bytes) = model_bytes {
                state.budget.model_bytes = model_bytes;
            }
            if let Some(kv_cache_bytes) = kv_cache_bytes {
                state.budget.kv_cache_bytes = kv_cache_bytes;
            }
        }
    }

    pub fn get_budget(&self, gpu_id: u32) -> Option<GpuBudget> {
        self.gpus.read().unwrap().get(&gpu_id).map(|s| s.budget.clone())
    }

    /// Request `size_bytes` on behalf of `borrower_gpu`. Scores every other
    /// registered GPU as a candidate lender and grants from the best one, or
    /// returns `None` if nothing qualifies — an expected, non-error outcome.
    pub fn borrow(&self, borrower_gpu: u32, size_bytes: u64, purpose: &str) -> Option<VramLease> {
        self.borrow_with_priority(borrower_gpu, size_bytes, purpose, 0)
    }

    /// Like [`borrow`](Self::borrow) but with an explicit reclaim priority;
    /// lower values are reclaimed first.
    pub fn borrow_with_priority(&self, borrower_gpu: u32, size_bytes: u64, purpose: &str, priority: i32) -> Option<VramLease> {
        let lender_gpu = self.select_lender(borrower_gpu, size_bytes)?;
        let offset = self.next_buffer_offset(lender_gpu);
        let mut gpus = self.gpus.write().unwrap();
        {
            let lender = gpus.get_mut(&lender_gpu)?;
            if offset + size_bytes > lender.lending_buffer_bytes {
                return None;
            }
            lender.budget.lent_bytes += size_bytes;
        }
        if let Some(borrower) = gpus.get_mut(&borrower_gpu) {
            borrower.budget.borrowed_bytes += size_bytes;
        }
        drop(gpus);

        let lease_id = {
            let mut next = self.next_lease_id.lock().unwrap();
            let id = *next;
            *next += 1;
            id
        };
        let lease = VramLease {
            lease_id,
            lender_gpu,
            borrower_gpu,
            size_bytes,
            buffer_offset: offset,
            state: LeaseState::Active,
            tensor_ref: None,
            created_at: Utc::now(),
            purpose: purpose.to_string(),
            priority,
        };
        self.leases.write().unwrap().insert(lease_id, lease.clone());

        let mut stats = self.stats.lock().unwrap();
        stats.total_leases_created += 1;
        stats.total_bytes_lent += size_bytes;
        let total_lent: u64 = self.gpus.read().unwrap().values().map(|s| s.budget.lent_bytes).sum();
        stats.peak_lent_bytes = stats.peak_lent_bytes.max(total_lent);
        drop(stats);

        info!(lease_id, lender_gpu, borrower_gpu, size_bytes, "lease granted");
        for hook in self.on_lend.lock().unwrap().iter() {
            hook(&lease);
        }
        Some(lease)
    }

    /// Attach an allocated tensor handle to an existing lease.
    pub fn allocate_on_lease(&self, lease_id: u64, tensor_ref: TensorRef) -> bool {
        if let Some(lease) = self.leases.write().unwrap().get_mut(&lease_id) {
            lease.tensor_ref = Some(tensor_ref);
            true
        } else {
            false
        }
    }

    /// Offset within `lender_gpu`'s pre-allocated lending buffer for a new
    /// lease: the max end-offset of its currently active leases, or 0 if it
    /// has none. Recomputed fresh on every call instead of tracked as a
    /// persisted cursor, so space frees up as leases are reclaimed or
    /// released rather than the buffer filling up monotonically forever.
    fn next_buffer_offset(&self, lender_gpu: u32) -> u64 {
        self.leases
            .read()
            .unwrap()
            .values()
            .filter(|l| l.lender_gpu == lender_gpu && l.is_active())
            .map(|l| l.buffer_offset + l.size_bytes)
            .max()
            .unwrap_or(0)
    }

    /// `GpuBudget::lendable_bytes` bounded by how much of `max_lend_ratio`'s
    /// share of total capacity this GPU hasn't already lent out.
    fn lendable_within_cap(&self, budget: &GpuBudget) -> u64 {
        let lend_cap = (budget.total_bytes as f64 * self.policy.max_lend_ratio) as u64;
        let remaining_lend_cap = lend_cap.saturating_sub(budget.lent_bytes);
        budget.lendable_bytes().min(remaining_lend_cap)
    }

    fn select_lender(&self, borrower_gpu: u32, size_bytes: u64) -> Option<u32> {
        let gpus = self.gpus.read().unwrap();
        let borrower_vendor = gpus.get(&borrower_gpu).map(|s| s.budget.vendor);

        let mut best: Option<(u32, f64)> = None;
        for (gpu_id, state) in gpus.iter() {
            if *gpu_id == borrower_gpu || state.stop_lending {
                continue;
            }
            let util = self
                .monitor
                .vram_usage(*gpu_id)
                .unwrap_or_else(|| state.budget.utilization());
            if util >= self.policy.stop_lending_threshold {
                continue;
            }
            let lendable = self.lendable_within_cap(&state.budget);
            if lendable < size_bytes {
                continue;
            }

            let capacity_score = (lendable as f64 / state.budget.total_bytes.max(1) as f64).min(1.0);
            let pcie_score = (state.budget.pcie_gen as f64 / 5.0).min(1.0);
            let idle_score = 1.0 - util;
            let mut score = 0.4 * capacity_score + 0.3 * pcie_score + 0.3 * idle_score;

            if self.policy.prefer_fast_interconnect
                && self
                    .transport
                    .is_fast_interconnect(DeviceBackend::Cuda(*gpu_id), DeviceBackend::Cuda(borrower_gpu))
            {
                score += 0.05;
            }
            if let Some(bv) = borrower_vendor {
                if bv != state.budget.vendor {
                    score -= self.policy.cross_vendor_penalty;
                }
            }

            // Tiny jitter breaks exact ties deterministically-enough without
            // letting registration order dominate candidate selection.
            let jitter = rand::thread_rng().gen_range(-1e-6..1e-6);
            score += jitter;

            if best.map(|(_, s)| score > s).unwrap_or(true) {
                best = Some((*gpu_id, score));
            }
        }
        best.map(|(gpu_id, _)| gpu_id)
    }

    /// Reclaim active leases on `gpu_id`, ordered by ascending
    /// `(priority, age)` so low-priority and old leases go first, escalating
    /// to forced drop when `urgency` is `Critical`. Stops once `bytes_needed`
    /// bytes have been freed, or processes every eligible lease when
    /// `bytes_needed` is `None`/zero. Returns the number of bytes actually
    /// reclaimed.
    pub fn reclaim(&self, gpu_id: u32, urgency: ReclaimUrgency, bytes_needed: Option<u64>) -> u64 {
        self.reclaim_filtered(gpu_id, urgency, bytes_needed, None)
    }

    /// `reclaim` plus an optional minimum-age gate, used exclusively by the
    /// background monitor (`check_and_reclaim`) so an autonomous sweep
    /// doesn't thrash leases that were granted moments ago. The public
    /// `reclaim` API always passes `None` here — a caller asking for bytes
    /// back explicitly means it now, regardless of how young the lease is.
    fn reclaim_filtered(&self, gpu_id: u32, urgency: ReclaimUrgency, bytes_needed: Option<u64>, min_age_s: Option<f64>) -> u64 {
        let candidates: Vec<VramLease> = {
            let leases = self.leases.read().unwrap();
            let mut v: Vec<VramLease> = leases
                .values()
                .filter(|l| l.lender_gpu == gpu_id && l.is_active())
                .filter(|l| min_age_s.map(|min_age| l.age_s() >= min_age).unwrap_or(true))
                .cloned()
                .collect();
            // Ascending by (priority, age) — low-priority, old leases first.
            v.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.created_at.cmp(&b.created_at)));
            v
        };

        let target = bytes_needed.unwrap_or(0);
        let mut reclaimed_bytes = 0u64;
        for lease in candidates {
            if target > 0 && reclaimed_bytes >= target {
                break;
            }
            let start = Instant::now();
            let ok = if urgency == ReclaimUrgency::Critical {
                self.force_release(lease.lease_id)
            } else {
                self.graceful_reclaim(&lease)
            };
            if ok {
                reclaimed_bytes += lease.size_bytes;
                let mut stats = self.stats.lock().unwrap();
                stats.reclaim_ms_sum += start.elapsed().as_secs_f64() * 1000.0;
                stats.reclaim_count += 1;
            }
        }
        reclaimed_bytes
    }

    fn graceful_reclaim(&self, lease: &VramLease) -> bool {
        if let Some(l) = self.leases.write().unwrap().get_mut(&lease.lease_id) {
            l.state = LeaseState::Reclaiming;
        }
        let migrated = self.transport.migrate(
            DeviceBackend::Cuda(lease.lender_gpu),
            DeviceBackend::Cuda(lease.borrower_gpu),
            lease.size_bytes,
        ) || self.transport.migrate(
            DeviceBackend::Cuda(lease.lender_gpu),
            DeviceBackend::Cpu,
            lease.size_bytes,
        );
        if migrated {
            self.finish_reclaim(lease.lease_id, LeaseState::Migrated, true);
            info!(lease_id = lease.lease_id, "lease gracefully migrated");
            true
        } else {
            warn!(lease_id = lease.lease_id, "graceful migration failed, forcing release");
            self.force_release(lease.lease_id)
        }
    }

    fn force_release(&self, lease_id: u64) -> bool {
        self.finish_reclaim(lease_id, LeaseState::Released, false)
    }

    fn finish_reclaim(&self, lease_id: u64, final_state: LeaseState, graceful: bool) -> bool {
        let lease = {
            let mut leases = self.leases.write().unwrap();
            match leases.get_mut(&lease_id) {
                Some(l) => {
                    l.state = final_state;
                    l.clone()
                }
                None => return false,
            }
        };
        self.release_lease_accounting(&lease);
        let mut stats = self.stats.lock().unwrap();
        if graceful {
            stats.preemptions_graceful += 1;
        } else {
            stats.preemptions_forced += 1;
        }
        drop(stats);
        for hook in self.on_reclaim.lock().unwrap().iter() {
            hook(&lease);
        }
        true
    }

    fn release_lease_accounting(&self, lease: &VramLease) {
        let mut gpus = self.gpus.write().unwrap();
        if let Some(lender) = gpus.get_mut(&lease.lender_gpu) {
            lender.budget.lent_bytes = lender.budget.lent_bytes.saturating_sub(lease.size_bytes);
        }
        if let Some(borrower) = gpus.get_mut(&lease.borrower_gpu) {
            borrower.budget.borrowed_bytes = borrower.budget.borrowed_bytes.saturating_sub(lease.size_bytes);
        }
    }

    /// Voluntarily end a lease early. Idempotent: releasing an
    /// already-released lease is a no-op, not an error.
    pub fn release(&self, lease_id: u64) {
        let already_done = self
            .leases
            .read()
            .unwrap()
            .get(&lease_id)
            .map(|l| !l.is_active())
            .unwrap_or(true);
        if already_done {
            return;
        }
        self.finish_reclaim(lease_id, LeaseState::Released, true);
        debug!(lease_id, "lease released by caller");
    }

    pub fn get_active_leases(&self) -> Vec<VramLease> {
        self.leases
            .read()
            .unwrap()
            .values()
            .filter(|l| l.is_active())
            .cloned()
            .collect()
    }

    pub fn on_reclaim(&self, hook: impl Fn(&VramLease) + Send + Sync + 'static) {
        self.on_reclaim.lock().unwrap().push(Box::new(hook));
    }

    pub fn on_lend(&self, hook: impl Fn(&VramLease) + Send + Sync + 'static) {
        self.on_lend.lock().unwrap().push(Box::new(hook));
    }

    pub fn stats(&self) -> LendingStats {
        let s = self.stats.lock().unwrap();
        LendingStats {
            total_leases_created: s.total_leases_created,
            total_bytes_lent: s.total_bytes_lent,
            peak_lent_bytes: s.peak_lent_bytes,
            preemptions_graceful: s.preemptions_graceful,
            preemptions_forced: s.preemptions_forced,
            reclaim_avg_ms: if s.reclaim_count > 0 {
                s.reclaim_ms_sum / s.reclaim_count as f64
            } else {
                0.0
            },
        }
    }

    /// Aggregate capacity across every registered GPU.
    pub fn pool_capacity(&self) -> PoolCapacity {
        let gpus = self.gpus.read().unwrap();
        let total_lendable_bytes = gpus.values().map(|s| self.lendable_within_cap(&s.budget)).sum();
        let total_lent_bytes = gpus.values().map(|s| s.budget.lent_bytes).sum();
        let total_borrowed_bytes = gpus.values().map(|s| s.budget.borrowed_bytes).sum();
        drop(gpus);
        PoolCapacity {
            total_lendable_bytes,
            total_lent_bytes,
            total_borrowed_bytes,
            active_lease_count: self.get_active_leases().len(),
        }
    }

    /// Spawn the background thread that polls GPU utilization every
    /// `interval` and reclaims under pressure.
    pub fn start_monitoring(self: &Arc<Self>, interval: Duration) {
        let mut guard = self.monitor_thread.lock().unwrap();
        if guard.is_some() {
            return;
        }
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let stop_clone = stop.clone();
        let pool = self.clone();
        let handle = std::thread::spawn(move || {
            while !stop_clone.load(std::sync::atomic::Ordering::Relaxed) {
                pool.check_and_reclaim();
                std::thread::sleep(interval);
            }
        });
        *guard = Some((stop, handle));
    }

    pub fn stop_monitoring(&self) {
        if let Some((stop, handle)) = self.monitor_thread.lock().unwrap().take() {
            stop.store(true, std::sync::atomic::Ordering::Relaxed);
            let _ = handle.join();
        }
    }

    fn check_and_reclaim(&self) {
        let gpu_ids: Vec<u32> = self.gpus.read().unwrap().keys().copied().collect();
        for gpu_id in gpu_ids {
            let util = {
                let mut gpus = self.gpus.write().unwrap();
                let state = match gpus.get_mut(&gpu_id) {
                    Some(s) => s,
                    None => continue,
                };
                let util = self.monitor.vram_usage(gpu_id).unwrap_or_else(|| state.budget.utilization());
                state.stop_lending = util >= self.policy.stop_lending_threshold;
                util
            };
            let min_age_s = Some(self.policy.min_lease_duration_s);
            if util >= self.policy.critical_threshold {
                self.reclaim_filtered(gpu_id, ReclaimUrgency::Critical, None, min_age_s);
            } else if util >= self.policy.reclaim_threshold {
                self.reclaim_filtered(gpu_id, ReclaimUrgency::High, None, min_age_s);
            }
        }
    }

    /// Stop monitoring and force-release every outstanding lease. Shutdown
    /// is a lifecycle operation even though the pool keeps no persisted
    /// state.
    pub fn close(&self) {
        self.stop_monitoring();
        let lease_ids: Vec<u64> = self.leases.read().unwrap().keys().copied().collect();
        for id in lease_ids {
            self.force_release(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> VramLendingPool {
        VramLendingPool::new(LendingPolicy::default())
    }

    #[test]
    fn borrow_returns_none_with_no_registered_gpus() {
        let pool = pool();
        assert!(pool.borrow(0, 1_000_000, "kv_cache_overflow").is_none());
    }

    #[test]
    fn borrow_grants_from_the_only_eligible_lender() {
        let pool = pool();
        pool.register_gpu(0, GpuVendor::Nvidia, 80_000_000_000, 4);
        pool.register_gpu(1, GpuVendor::Nvidia, 80_000_000_000, 4);
        let lease = pool.borrow(1, 1_000_000_000, "kv_cache_overflow").unwrap();
        assert_eq!(lease.lender_gpu, 0);
        assert_eq!(lease.borrower_gpu, 1);
        assert!(lease.is_active());
    }

    #[test]
    fn re_registering_a_gpu_preserves_lease_accounting() {
        let pool = pool();
        pool.register_gpu(0, GpuVendor::Nvidia, 80_000_000_000, 4);
        pool.register_gpu(1, GpuVendor::Nvidia, 80_000_000_000, 4);
        let _lease = pool.borrow(1, 1_000_000_000, "x").unwrap();
        pool.register_gpu(0, GpuVendor::Nvidia, 80_000_000_000, 4);
        assert_eq!(pool.get_budget(0).unwrap().lent_bytes, 1_000_000_000);
    }

    #[test]
    fn cross_vendor_penalty_prefers_same_vendor_lender() {
        let pool = pool();
        pool.register_gpu(0, GpuVendor::Amd, 80_000_000_000, 4);
        pool.register_gpu(1, GpuVendor::Nvidia, 80_000_000_000, 4);
        pool.register_gpu(2, GpuVendor::Nvidia, 80_000_000_000, 4);
        let lease = pool.borrow(1, 1_000_000_000, "x").unwrap();
        assert_eq!(lease.lender_gpu, 2);
    }

    #[test]
    fn stop_lending_threshold_excludes_saturated_gpus() {
        let pool = pool();
        pool.register_gpu(0, GpuVendor::Nvidia, 80_000_000_000, 4);
        pool.register_gpu(1, GpuVendor::Nvidia, 80_000_000_000, 4);
        pool.update_gpu_usage(0, Some(75_000_000_000), None);
        assert!(pool.borrow(1, 1_000_000_000, "x").is_none());
    }

    #[test]
    fn release_is_idempotent() {
        let pool = pool();
        pool.register_gpu(0, GpuVendor::Nvidia, 80_000_000_000, 4);
        pool.register_gpu(1, GpuVendor::Nvidia, 80_000_000_000, 4);
        let lease = pool.borrow(1, 1_000_000_000, "x").unwrap();
        pool.release(lease.lease_id);
        pool.release(lease.lease_id);
        assert_eq!(pool.get_active_leases().len(), 0);
        assert_eq!(pool.get_budget(0).unwrap().lent_bytes, 0);
    }

    #[test]
    fn reclaim_releases_every_active_lease_when_bytes_needed_is_none() {
        let pool = pool();
        pool.register_gpu(0, GpuVendor::Nvidia, 80_000_000_000, 4);
        pool.register_gpu(1, GpuVendor::Nvidia, 80_000_000_000, 4);
        pool.borrow(1, 1_000_000_000, "x").unwrap();
        let reclaimed = pool.reclaim(0, ReclaimUrgency::Critical, None);
        assert_eq!(reclaimed, 1_000_000_000);
        assert_eq!(pool.get_active_leases().len(), 0);
        assert_eq!(pool.stats().preemptions_forced, 1);
    }

    #[test]
    fn reclaim_releases_low_priority_lease_before_high_priority_one() {
        let mut policy = LendingPolicy::default();
        policy.max_lend_ratio = 0.90;
        let pool = VramLendingPool::new(policy);
        pool.register_gpu(0, GpuVendor::Nvidia, 80_000_000_000, 4);
        pool.register_gpu(1, GpuVendor::Nvidia, 80_000_000_000, 4);
        let low = pool.borrow_with_priority(1, 500_000_000, "x", 0).unwrap();
        let high = pool.borrow_with_priority(1, 500_000_000, "x", 10).unwrap();

        // Only enough demand to satisfy one lease — the low-priority one
        // must be the one chosen.
        let reclaimed = pool.reclaim(0, ReclaimUrgency::Critical, Some(500_000_000));
        assert_eq!(reclaimed, 500_000_000);

        let active: Vec<u64> = pool.get_active_leases().iter().map(|l| l.lease_id).collect();
        assert!(!active.contains(&low.lease_id));
        assert!(active.contains(&high.lease_id));
    }

    #[test]
    fn pool_capacity_aggregates_across_gpus() {
        let pool = pool();
        pool.register_gpu(0, GpuVendor::Nvidia, 80_000_000_000, 4);
        pool.register_gpu(1, GpuVendor::Nvidia, 80_000_000_000, 4);
        pool.borrow(1, 1_000_000_000, "x").unwrap();
        let cap = pool.pool_capacity();
        assert_eq!(cap.total_lent_bytes, 1_000_000_000);
        assert_eq!(cap.active_lease_count, 1);
    }

    #[test]
    fn close_force_releases_everything() {
        let pool = pool();
        pool.register_gpu(0, GpuVendor::Nvidia, 80_000_000_000, 4);
        pool.register_gpu(1, GpuVendor::Nvidia, 80_000_000_000, 4);
        pool.borrow(1, 1_000_000_000, "x").unwrap();
        pool.close();
        assert_eq!(pool.get_active_leases().len(), 0);
    }

    #[test]
    fn buffer_offset_is_reused_once_every_lease_on_it_is_released() {
        let pool = pool();
        pool.register_gpu(0, GpuVendor::Nvidia, 80_000_000_000, 4);
        pool.register_gpu(1, GpuVendor::Nvidia, 80_000_000_000, 4);

        let first = pool.borrow(1, 1_000_000_000, "x").unwrap();
        assert_eq!(first.buffer_offset, 0);
        pool.release(first.lease_id);

        // With the only lease on GPU 0 released, a fresh borrow must reuse
        // offset 0 instead of continuing to bump forward.
        let second = pool.borrow(1, 1_000_000_000, "x").unwrap();
        assert_eq!(second.buffer_offset, 0);
    }

    #[test]
    fn register_device_copies_descriptor_fields_into_the_budget() {
        let pool = pool();
        let device = DeviceDescriptor {
            backend: DeviceBackend::Cuda(2),
            name: "H100".to_string(),
            vendor: GpuVendor::Nvidia,
            total_memory_bytes: 80_000_000_000,
            compute_capability: (9, 0),
            pcie_gen: 5,
        };
        pool.register_device(&device);
        let budget = pool.get_budget(2).unwrap();
        assert_eq!(budget.device_name, "H100");
        assert_eq!(budget.compute_capability, (9, 0));
        assert_eq!(budget.pcie_gen, 5);
        assert_eq!(budget.total_bytes, 80_000_000_000);
    }
}
