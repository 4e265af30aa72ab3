//! Inter-GPU transport collaborator interface.
//!
//! `GpuUtilizationMonitor` lives in `device.rs` alongside the device sum
//! type it reports on; this module covers the data-movement side: the
//! copy/migrate primitive `VRAMLendingPool`'s graceful reclaim and
//! `PagedKvCache`'s overflow path both need, without depending on any real
//! interconnect (NVLink, PCIe peer-to-peer, plain host-staged copy).

use crate::device::DeviceBackend;

/// Moves opaque byte buffers between devices. A real implementation wraps
/// NVLink/PCIe peer copies or stages through host memory; the core only
/// calls this during graceful lease reclaim (migrate a borrower's tensor off
/// a reclaimed lease) and KV page eviction (spill a borrowed page to CPU).
pub trait InterGpuTransport: Send + Sync {
    /// Copy `size_bytes` from `src` to `dst`. Returns `false` if the
    /// transport cannot currently service the request (e.g. destination out
    /// of memory) — a recoverable, expected outcome, not an error.
    fn migrate(&self, src: DeviceBackend, dst: DeviceBackend, size_bytes: u64) -> bool;

    /// Whether `a` and `b` are connected by a fast interconnect (NVLink,
    /// Infinity Fabric), consulted by the lender-scoring formula's
    /// `prefer_fast_interconnect` term.
    fn is_fast_interconnect(&self, a: DeviceBackend, b: DeviceBackend) -> bool;
}

/// A transport that always succeeds and reports no fast interconnects —
/// used by tests and as the default when no real topology is known.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysAvailableTransport;

impl InterGpuTransport for AlwaysAvailableTransport {
    fn migrate(&self, _src: DeviceBackend, _dst: DeviceBackend, _size_bytes: u64) -> bool {
        true
    }

    fn is_fast_interconnect(&self, _a: DeviceBackend, _b: DeviceBackend) -> bool {
        false
    }
}
