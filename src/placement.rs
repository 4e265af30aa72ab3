//! Heterogeneous layer placement: per-layer profiling with closed-form FLOP
//! estimators, per-GPU benchmarking (GEMM throughput, memory bandwidth, with
//! CPU-only synthetic defaults), and `compute_optimal_placement`'s
//! dynamic-programming layer→GPU solver with a greedy VRAM-feasibility
//! repair pass.

use std::collections::HashMap;

use tracing::warn;

/// Coarse classification used by the FLOP estimator's name-based heuristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    Attention,
    Mlp,
    Norm,
    Embedding,
    Block,
}

/// Profile data for a single transformer layer.
#[derive(Debug, Clone)]
pub struct LayerProfile {
    pub index: usize,
    pub name: String,
    pub layer_kind: LayerKind,
    pub latency_ms: f64,
    pub param_count: u64,
    pub param_memory_mb: f64,
    pub activation_memory_mb: f64,
    pub total_memory_mb: f64,
    pub estimated_flops: u64,
}

/// Performance profile for a single GPU (or CPU, for fallback placement).
#[derive(Debug, Clone)]
pub struct GpuProfile {
    pub index: u32,
    pub name: String,
    pub total_vram_mb: f64,
    pub free_vram_mb: f64,
    pub compute_throughput_gflops: f64,
    pub memory_bandwidth_gbps: f64,
}

/// Optimal layer-to-GPU assignment plan.
#[derive(Debug, Clone, Default)]
pub struct PlacementPlan {
    /// `(layer_index, gpu_index)` pairs, in layer order.
    pub assignments: Vec<(usize, u32)>,
    pub estimated_latency_ms: f64,
    pub estimated_transfer_overhead_ms: f64,
    pub gpu_utilization: HashMap<u32, f64>,
}

/// Profiles transformer layers and GPUs ahead of a placement decision.
pub struct LayerProfiler {
    pub batch_size: usize,
    pub seq_length: usize,
}

impl Default for LayerProfiler {
    fn default() -> Self {
        Self {
            batch_size: 1,
            seq_length: 128,
        }
    }
}

impl LayerProfiler {
    pub fn new(batch_size: usize, seq_length: usize) -> Self {
        Self { batch_size, seq_length }
    }

    /// Build a `LayerProfile` from static model metadata. A real
    /// implementation times an actual forward pass; this crate accepts
    /// param counts and per-layer kind from the `ModelAdapter` and derives
    /// memory/FLOPS/latency the same closed-form way the original does when
    /// it can't run a live forward pass.
    pub fn profile_layer(&self, index: usize, name: &str, kind: LayerKind, param_count: u64, hidden_size: usize) -> LayerProfile {
        let elem_bytes = 4.0;
        let param_memory_mb = (param_count as f64 * elem_bytes) / (1024.0 * 1024.0);
        let activation_bytes = (self.batch_size * self.seq_length * hidden_size) as f64 * elem_bytes * 2.0;
        let activation_memory_mb = activation_bytes / (1024.0 * 1024.0);
        let total_memory_mb = param_memory_mb + activation_memory_mb;
        let estimated_flops = self.estimate_layer_flops(kind, hidden_size, param_count);
        // No live timing available in this core; approximate from FLOPS the
        // same way the original falls back to when a real timed run fails.
        let latency_ms = (estimated_flops as f64 / 1e9).max(0.01);

        LayerProfile {
            index,
            name: name.to_string(),
            layer_kind: kind,
            latency_ms,
            param_count,
            param_memory_mb,
            activation_memory_mb,
            total_memory_mb,
            estimated_flops,
        }
    }

    /// Closed-form FLOP estimate per layer kind.
    fn estimate_layer_flops(&self, kind: LayerKind, hidden_size: usize, param_count: u64) -> u64 {
        let b = self.batch_size as u64;
        let s = self.seq_length as u64;
        let h = hidden_size as u64;

        match kind {
            LayerKind::Attention => 2 * b * s * s * h + 4 * b * s * h * h,
            LayerKind::Mlp => {
                let expansion = 4u64;
                2 * b * s * h * h * expansion * 2
            }
            LayerKind::Norm | LayerKind::Embedding => b * s * h,
            LayerKind::Block => {
                let attn = 2 * b * s * s * h + 4 * b * s * h * h;
                let mlp = 2 * b * s * h * h * 4 * 2;
                let norm = 2 * b * s * h;
                attn + mlp + norm
            }
        }
        .max(if param_count > 0 { 2 * b * s * param_count } else { b * s * h })
        .min(u64::MAX)
    }

    /// Benchmark GEMM throughput and bandwidth on a real device runtime, or
    /// fall back to a CPU-only synthetic estimate when no accelerator is
    /// present.
    pub fn profile_cpu_only(&self) -> GpuProfile {
        let (total_mb, free_mb) = host_memory_mb();
        GpuProfile {
            index: 0,
            name: "cpu".to_string(),
            total_vram_mb: total_mb,
            free_vram_mb: free_mb,
            compute_throughput_gflops: cpu_synthetic_gflops(),
            memory_bandwidth_gbps: 10.0,
        }
    }
}

/// Host RAM stands in for "VRAM" when placement falls back to the CPU
/// backend, the same way `sysinfo` reports system memory elsewhere in the
/// stack rather than a hand-rolled `/proc/meminfo` reader.
fn host_memory_mb() -> (f64, f64) {
    use sysinfo::System;
    let mut sys = System::new_all();
    sys.refresh_memory();
    (
        sys.total_memory() as f64 / (1024.0 * 1024.0),
        sys.available_memory() as f64 / (1024.0 * 1024.0),
    )
}

/// CPU-only synthetic GFLOPS estimate, scaled by host core count, matching
/// the proportional role `_benchmark_cpu_gflops` plays when no real GEMM
/// benchmark can run.
fn cpu_synthetic_gflops() -> f64 {
    num_cpus::get() as f64 * 8.0
}

/// Dynamic-programming layer→GPU solver (`compute_optimal_placement`):
/// `dp[i][g]` is the minimum cumulative latency to run layers `0..=i` with
/// layer `i` placed on GPU `g`, including a transfer-cost term whenever
/// consecutive layers land on different GPUs.
pub fn compute_optimal_placement(
    layers: &[LayerProfile],
    gpus: &[GpuProfile],
    transfer_bandwidth_gbps: f64,
) -> PlacementPlan {
    let n_layers = layers.len();
    let n_gpus = gpus.len();
    if n_layers == 0 || n_gpus == 0 {
        return PlacementPlan::default();
    }

    if n_gpus == 1 {
        let mut gpu_utilization = HashMap::new();
        gpu_utilization.insert(gpus[0].index, 1.0);
        return PlacementPlan {
            assignments: (0..n_layers).map(|i| (i, gpus[0].index)).collect(),
            estimated_latency_ms: layers.iter().map(|l| l.latency_ms).sum(),
            estimated_transfer_overhead_ms: 0.0,
            gpu_utilization,
        };
    }

    let max_gflops = gpus.iter().map(|g| g.compute_throughput_gflops).fold(0.0, f64::max).max(1.0);
    let speed_factor: Vec<f64> = gpus
        .iter()
        .map(|g| if g.compute_throughput_gflops > 0.0 { g.compute_throughput_gflops / max_gflops } else { 0.1 })
        .collect();

    let transfer_cost_ms = |layer_idx: usize| -> f64 {
        if transfer_bandwidth_gbps <= 0.0 {
            return 0.0;
        }
        let act_bytes = layers[layer_idx].activation_memory_mb * 1024.0 * 1024.0;
        (act_bytes * 8.0 / (transfer_bandwidth_gbps * 1e9)) * 1000.0
    };

    const INF: f64 = f64::INFINITY;
    let mut dp = vec![vec![INF; n_gpus]; n_layers];
    let mut parent = vec![vec![-1i32; n_gpus]; n_layers];
    let vram_avail: Vec<f64> = gpus.iter().map(|g| g.free_vram_mb).collect();

    for g in 0..n_gpus {
        if layers[0].total_memory_mb <= vram_avail[g] {
            dp[0][g] = layers[0].latency_ms / speed_factor[g].max(0.01);
        }
    }

    for i in 1..n_layers {
        for g in 0..n_gpus {
            let layer_cost = layers[i].latency_ms / speed_factor[g].max(0.01);
            for prev_g in 0..n_gpus {
                if dp[i - 1][prev_g].is_infinite() {
                    continue;
                }
                let xfer = if prev_g != g { transfer_cost_ms(i - 1) } else { 0.0 };
                let total = dp[i - 1][prev_g] + layer_cost + xfer;
                if total < dp[i][g] {
                    dp[i][g] = total;
                    parent[i][g] = prev_g as i32;
                }
            }
        }
    }

    let best_last_gpu = (0..n_gpus)
        .min_by(|&a, &b| dp[n_layers - 1][a].partial_cmp(&dp[n_layers - 1][b]).unwrap())
        .unwrap();
    let best_latency = dp[n_layers - 1][best_last_gpu];

    let mut assignments = vec![(0usize, 0u32); n_layers];
    let mut g = best_last_gpu;
    for i in (0..n_layers).rev() {
        assignments[i] = (i, gpus[g].index);
        g = if parent[i][g] >= 0 { parent[i][g] as usize } else { g };
    }

    let mut transfer_total = 0.0;
    let mut gpu_mem_used: HashMap<u32, f64> = gpus.iter().map(|g| (g.index, 0.0)).collect();
    for i in 0..n_layers {
        let (layer_idx, gpu_idx) = assignments[i];
        *gpu_mem_used.entry(gpu_idx).or_insert(0.0) += layers[layer_idx].total_memory_mb;
        if i > 0 && assignments[i - 1].1 != gpu_idx {
            transfer_total += transfer_cost_ms(i - 1);
        }
    }

    let gpu_utilization: HashMap<u32, f64> = gpus
        .iter()
        .map(|g| {
            let total = if g.total_vram_mb > 0.0 { g.total_vram_mb } else { 1.0 };
            (g.index, (gpu_mem_used.get(&g.index).copied().unwrap_or(0.0) / total).min(1.0))
        })
        .collect();

    let plan = PlacementPlan {
        assignments,
        estimated_latency_ms: best_latency,
        estimated_transfer_overhead_ms: transfer_total,
        gpu_utilization,
    };

    enforce_vram_constraints(plan, layers, gpus)
}

/// Post-process: greedily move tail layers off any GPU whose assignment
/// overflows its free VRAM, onto whichever other GPU has the most free
/// space remaining, matching `_enforce_vram_constraints`'s largest-first
/// greedy repair.
fn enforce_vram_constraints(mut plan: PlacementPlan, layers: &[LayerProfile], gpus: &[GpuProfile]) -> PlacementPlan {
    let gpu_free: HashMap<u32, f64> = gpus.iter().map(|g| (g.index, g.free_vram_mb)).collect();
    let mut gpu_used: HashMap<u32, f64> = gpus.iter().map(|g| (g.index, 0.0)).collect();

    for &(layer_idx, gpu_idx) in &plan.assignments {
        *gpu_used.entry(gpu_idx).or_insert(0.0) += layers[layer_idx].total_memory_mb;
    }

    let mut overflow_gpus: Vec<(u32, f64)> = gpu_free
        .iter()
        .filter_map(|(&g, &free)| {
            let used = gpu_used.get(&g).copied().unwrap_or(0.0);
            if used > free {
                Some((g, used - free))
            } else {
                None
            }
        })
        .collect();
    if overflow_gpus.is_empty() {
        return plan;
    }
    overflow_gpus.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
    warn!(?overflow_gpus, "VRAM overflow detected in placement plan, redistributing");

    for (overloaded_gpu, mut overflow_mb) in overflow_gpus {
        let mut layers_on_gpu: Vec<(usize, usize)> = plan
            .assignments
            .iter()
            .enumerate()
            .filter(|(_, &(_, g))| g == overloaded_gpu)
            .map(|(pos, &(layer_idx, _))| (pos, layer_idx))
            .collect();
        layers_on_gpu.reverse();

        for (pos, layer_idx) in layers_on_gpu {
            if overflow_mb <= 0.0 {
                break;
            }
            let lp = &layers[layer_idx];
            let candidate = gpus
                .iter()
                .filter(|g| g.index != overloaded_gpu)
                .filter(|g| {
                    gpu_used.get(&g.index).copied().unwrap_or(0.0) + lp.total_memory_mb
                        <= gpu_free.get(&g.index).copied().unwrap_or(0.0)
                })
                .max_by(|a, b| {
                    let free_a = gpu_free[&a.index] - gpu_used.get(&a.index).copied().unwrap_or(0.0);
                    let free_b = gpu_free[&b.index] - gpu_used.get(&b.index).copied().unwrap_or(0.0);
                    free_a.partial_cmp(&free_b).unwrap()
                });
            if let Some(target) = candidate {
                plan.assignments[pos] = (layer_idx, target.index);
                *gpu_used.get_mut(&overloaded_gpu).unwrap() -= lp.total_memory_mb;
                *gpu_used.entry(target.index).or_insert(0.0) += lp.total_memory_mb;
                overflow_mb -= lp.total_memory_mb;
            }
        }
    }
    plan
}
