//! Cooperative VRAM orchestration core for multi-GPU LLM inference.
//!
//! Five components, each independently usable:
//!
//! - [`gpu_budget`] — per-GPU capacity bookkeeping.
//! - [`lending`] — cross-GPU VRAM lending pool.
//! - [`paged_kv`] — PagedAttention-style KV cache.
//! - [`batcher`] — iteration-level continuous batching.
//! - [`placement`] — heterogeneous layer placement.
//!
//! An embedding runtime drives these through [`OrchestratorContext`], which
//! owns one instance of each stateful component. Pass the context through
//! constructors explicitly; reach for [`OrchestratorContext::global`] only
//! at the outermost layer of a process that genuinely needs one shared
//! instance.

pub mod batcher;
pub mod config;
pub mod device;
pub mod error;
pub mod gpu_budget;
pub mod lending;
pub mod model;
pub mod paged_kv;
pub mod placement;
pub mod transport;

pub use batcher::{CompletionHandle, ContinuousBatcher, InferenceRequest, RequestStatus, SamplingParams};
pub use config::{BatcherConfig, OrchestratorConfig};
pub use device::{DeviceBackend, DeviceDescriptor, DeviceRuntime, GpuUtilizationMonitor, GpuVendor};
pub use error::{OrchestratorError, OrchestratorResult};
pub use gpu_budget::GpuBudget;
pub use lending::{LeaseState, LendingPolicy, ReclaimUrgency, VramLease, VramLendingPool};
pub use model::{KvLayout, LayerKv, ModelAdapter, Tokenizer};
pub use paged_kv::{PagedKvCache, PagedKvConfig, PhysicalPage};
pub use placement::{compute_optimal_placement, GpuProfile, LayerProfile, LayerProfiler, PlacementPlan};
pub use transport::InterGpuTransport;

use std::sync::{Arc, Mutex, OnceLock};

/// Owns the lending pool and paged KV cache an embedding runtime needs for
/// one model deployment. `paged_kv` is shared (`Arc<Mutex<_>>`, not a bare
/// `Mutex<_>`) because a `ContinuousBatcher` needs its own handle to the same
/// cache the context manages, not a private copy.
pub struct OrchestratorContext {
    pub lending_pool: Arc<VramLendingPool>,
    pub paged_kv: Arc<Mutex<PagedKvCache>>,
}

impl OrchestratorContext {
    pub fn new(config: OrchestratorConfig, kv_config: PagedKvConfig, gpu_ids: &[u32]) -> Arc<Self> {
        let lending_pool = Arc::new(VramLendingPool::new(config.lending.clone()));
        let paged_kv = PagedKvCache::new(kv_config, &config.paged_kv, gpu_ids)
            .with_lending_pool(lending_pool.clone());
        Arc::new(Self {
            lending_pool,
            paged_kv: Arc::new(Mutex::new(paged_kv)),
        })
    }

    /// Register every device a runtime enumerates with the lending pool,
    /// taking each GPU's name, vendor, and compute capability straight from
    /// the runtime instead of requiring the caller to re-enter them.
    pub fn register_devices<R: DeviceRuntime>(&self, runtime: &R) {
        for device in runtime.enumerate() {
            self.lending_pool.register_device(&device);
        }
    }

    /// Construct a `ContinuousBatcher` wired to this context's shared paged
    /// KV cache, so admission/eviction on the batcher and overflow borrowing
    /// on the cache both observe the same page state.
    pub fn spawn_batcher(
        self: &Arc<Self>,
        config: BatcherConfig,
        model: Arc<dyn ModelAdapter>,
        tokenizer: Arc<dyn Tokenizer>,
    ) -> Arc<ContinuousBatcher> {
        ContinuousBatcher::new(config, model, tokenizer, self.paged_kv.clone())
    }
}

static GLOBAL: OnceLock<Mutex<Option<Arc<OrchestratorContext>>>> = OnceLock::new();

impl OrchestratorContext {
    /// The optional outermost singleton.
    pub fn global() -> Option<Arc<OrchestratorContext>> {
        GLOBAL.get_or_init(|| Mutex::new(None)).lock().unwrap().clone()
    }

    pub fn set_global(ctx: Arc<OrchestratorContext>) {
        *GLOBAL.get_or_init(|| Mutex::new(None)).lock().unwrap() = Some(ctx);
    }

    /// Explicit reset, primarily for test isolation.
    pub fn reset_global() {
        if let Some(lock) = GLOBAL.get() {
            *lock.lock().unwrap() = None;
        }
    }
}
