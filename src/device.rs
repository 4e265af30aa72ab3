//! Device abstraction.
//!
//! `DeviceBackend` is a closed sum type over the accelerator backends this
//! crate reasons about, matched on its enum tag rather than probed at
//! runtime. `DeviceRuntime` is the interface for enumerating devices,
//! allocating/copying typed byte buffers, and synchronising.
//!
//! The core never implements a real `DeviceRuntime` itself outside of the
//! optional `nvml` feature (vendor monitoring only, not allocation) — a real
//! CUDA/ROCm/Metal backend is an external collaborator.

use std::fmt;

/// Which physical accelerator backend a device belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceBackend {
    Cuda(u32),
    Rocm(u32),
    Mps,
    Cpu,
}

impl DeviceBackend {
    /// The device index used for budget/lease bookkeeping. CPU and MPS
    /// (single-device backends in this model) are index 0.
    pub fn index(&self) -> u32 {
        match self {
            DeviceBackend::Cuda(i) | DeviceBackend::Rocm(i) => *i,
            DeviceBackend::Mps | DeviceBackend::Cpu => 0,
        }
    }
}

impl fmt::Display for DeviceBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceBackend::Cuda(i) => write!(f, "cuda:{i}"),
            DeviceBackend::Rocm(i) => write!(f, "rocm:{i}"),
            DeviceBackend::Mps => write!(f, "mps"),
            DeviceBackend::Cpu => write!(f, "cpu"),
        }
    }
}

/// GPU vendor, used for the lending-pool's same-vendor preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Unknown,
}

impl fmt::Display for GpuVendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpuVendor::Nvidia => write!(f, "NVIDIA"),
            GpuVendor::Amd => write!(f, "AMD"),
            GpuVendor::Intel => write!(f, "Intel"),
            GpuVendor::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Static device enumeration record.
#[derive(Debug, Clone)]
pub struct DeviceDescriptor {
    pub backend: DeviceBackend,
    pub name: String,
    pub vendor: GpuVendor,
    pub total_memory_bytes: u64,
    pub compute_capability: (u32, u32),
    pub pcie_gen: u32,
}

/// The device-runtime collaborator interface: enumerate devices,
/// allocate/copy typed byte buffers, time operations, synchronise.
///
/// A `DeviceBuffer` is an opaque handle; the core never dereferences it, it
/// only threads it through `VRAMLease::tensor_ref` (see `lending.rs`) and
/// hands it back to the runtime for copies.
pub trait DeviceRuntime: Send + Sync {
    type Buffer: Send + Sync;

    /// Enumerate every device this runtime can drive.
    fn enumerate(&self) -> Vec<DeviceDescriptor>;

    /// Allocate a zeroed buffer of `size_bytes` on `device`.
    fn allocate(&self, device: DeviceBackend, size_bytes: u64) -> Option<Self::Buffer>;

    /// Copy bytes from `src` (on `src_device`) to a new buffer on `dst_device`.
    fn copy(
        &self,
        src: &Self::Buffer,
        src_device: DeviceBackend,
        dst_device: DeviceBackend,
    ) -> Option<Self::Buffer>;

    /// Block until all outstanding work on `device` completes.
    fn synchronize(&self, device: DeviceBackend);
}

/// The GPU monitor collaborator interface: real-time device
/// utilization, preferred over bookkeeping-derived estimates when available.
pub trait GpuUtilizationMonitor: Send + Sync {
    /// Actual device utilization in `[0.0, 1.0]`, or `None` if unavailable.
    fn vram_usage(&self, gpu_id: u32) -> Option<f64>;
}

/// A `GpuUtilizationMonitor` that always reports "unknown", so the lending
/// pool falls back to its own bookkeeping (`GPUBudget::utilization`).
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMonitor;

impl GpuUtilizationMonitor for NoopMonitor {
    fn vram_usage(&self, _gpu_id: u32) -> Option<f64> {
        None
    }
}

#[cfg(feature = "nvml")]
pub mod nvml_backend {
    //! Real VRAM utilization via the NVIDIA Management Library.

    use super::GpuUtilizationMonitor;
    use nvml_wrapper::Nvml;
    use std::sync::Mutex;

    pub struct NvmlMonitor {
        nvml: Mutex<Nvml>,
    }

    impl NvmlMonitor {
        pub fn init() -> Result<Self, nvml_wrapper::error::NvmlError> {
            Ok(Self {
                nvml: Mutex::new(Nvml::init()?),
            })
        }
    }

    impl GpuUtilizationMonitor for NvmlMonitor {
        fn vram_usage(&self, gpu_id: u32) -> Option<f64> {
            let nvml = self.nvml.lock().ok()?;
            let device = nvml.device_by_index(gpu_id).ok()?;
            let mem = device.memory_info().ok()?;
            if mem.total == 0 {
                return Some(0.0);
            }
            Some(mem.used as f64 / mem.total as f64)
        }
    }
}
