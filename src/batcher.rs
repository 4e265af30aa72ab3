//! Iteration-level continuous batching: a single cooperative loop
//! (never async) that admits waiting requests, partitions the active set
//! into prefill vs. decode, coalesces decode into one batched step when it
//! can, and evicts completed requests every iteration.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config::BatcherConfig;
use crate::error::OrchestratorError;
use crate::model::{ModelAdapter, Tokenizer};
use crate::paged_kv::PagedKvCache;

/// Lifecycle state of an `InferenceRequest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Waiting,
    Active,
    Finished,
    Cancelled,
    Error,
}

/// Sampling knobs carried per-request.
#[derive(Debug, Clone, Copy)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_k: usize,
    pub top_p: f32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_k: 50,
            top_p: 1.0,
        }
    }
}

/// A single generation request tracked by the batcher.
pub struct InferenceRequest {
    pub request_id: String,
    pub prompt: String,
    pub max_new_tokens: usize,
    pub sampling: SamplingParams,
    pub stop_token_id: Option<u32>,
    /// The tokenized prompt, populated at admission time; empty until then.
    pub input_ids: Vec<u32>,
    pub generated_ids: Vec<u32>,
    pub tokens_generated: usize,
    pub has_kv_cache: bool,
    pub status: RequestStatus,
    /// Which GPU's paged KV cache this request's pages live on.
    pub gpu_id: u32,
    pub created_at: Instant,
    pub finished_at: Option<Instant>,
    on_token: Option<Box<dyn Fn(&str) + Send>>,
}

impl InferenceRequest {
    pub fn new(request_id: impl Into<String>, prompt: impl Into<String>, max_new_tokens: usize) -> Self {
        Self {
            request_id: request_id.into(),
            prompt: prompt.into(),
            max_new_tokens,
            sampling: SamplingParams::default(),
            stop_token_id: None,
            input_ids: Vec::new(),
            generated_ids: Vec::new(),
            tokens_generated: 0,
            has_kv_cache: false,
            status: RequestStatus::Waiting,
            gpu_id: 0,
            created_at: Instant::now(),
            finished_at: None,
            on_token: None,
        }
    }

    /// Pin this request to a specific GPU's paged KV cache instead of the
    /// default (GPU 0).
    pub fn with_gpu(mut self, gpu_id: u32) -> Self {
        self.gpu_id = gpu_id;
        self
    }

    pub fn with_on_token(mut self, cb: impl Fn(&str) + Send + 'static) -> Self {
        self.on_token = Some(Box::new(cb));
        self
    }
}

/// A resolved-exactly-once handle to a request's final output.
#[derive(Debug)]
pub struct CompletionHandle {
    state: Arc<(Mutex<Option<Result<String, OrchestratorError>>>, Condvar)>,
}

impl CompletionHandle {
    fn new_pair() -> (Self, CompletionSetter) {
        let state = Arc::new((Mutex::new(None), Condvar::new()));
        (
            CompletionHandle { state: state.clone() },
            CompletionSetter { state },
        )
    }

    /// Block until the request finishes, returning its final text or error.
    pub fn wait(&self) -> Result<String, OrchestratorError> {
        let (lock, cvar) = &*self.state;
        let mut guard = lock.lock().unwrap();
        while guard.is_none() {
            guard = cvar.wait(guard).unwrap();
        }
        guard.clone().unwrap()
    }

    /// Non-blocking poll.
    pub fn try_result(&self) -> Option<Result<String, OrchestratorError>> {
        self.state.0.lock().unwrap().clone()
    }
}

struct CompletionSetter {
    state: Arc<(Mutex<Option<Result<String, OrchestratorError>>>, Condvar)>,
}

impl CompletionSetter {
    fn resolve(&self, result: Result<String, OrchestratorError>) {
        let (lock, cvar) = &*self.state;
        let mut guard = lock.lock().unwrap();
        if guard.is_none() {
            *guard = Some(result);
            cvar.notify_all();
        }
    }
}

struct TrackedRequest {
    req: InferenceRequest,
    setter: CompletionSetter,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BatcherStats {
    pub total_requests: u64,
    pub total_tokens_generated: u64,
    pub total_iterations: u64,
}

struct SharedState {
    waiting: VecDeque<TrackedRequest>,
    active: Vec<TrackedRequest>,
    stats: BatcherStats,
}

/// Iteration-level continuous batching scheduler, driven by a single
/// background thread — never async, one cooperative loop per batcher
/// instance.
pub struct ContinuousBatcher {
    config: BatcherConfig,
    model: Arc<dyn ModelAdapter>,
    tokenizer: Arc<dyn Tokenizer>,
    kv_cache: Arc<Mutex<PagedKvCache>>,
    state: Mutex<SharedState>,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ContinuousBatcher {
    pub fn new(
        config: BatcherConfig,
        model: Arc<dyn ModelAdapter>,
        tokenizer: Arc<dyn Tokenizer>,
        kv_cache: Arc<Mutex<PagedKvCache>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            model,
            tokenizer,
            kv_cache,
            state: Mutex::new(SharedState {
                waiting: VecDeque::new(),
                active: Vec::new(),
                stats: BatcherStats::default(),
            }),
            running: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        })
    }

    /// Enqueue a request. Returns `QueueFull` if the waiting queue is
    /// already at `max_waiting_queue`.
    pub fn submit(&self, req: InferenceRequest) -> Result<CompletionHandle, OrchestratorError> {
        let mut state = self.state.lock().unwrap();
        if state.waiting.len() >= self.config.max_waiting_queue {
            return Err(OrchestratorError::QueueFull);
        }
        let (handle, setter) = CompletionHandle::new_pair();
        state.waiting.push_back(TrackedRequest { req, setter });
        state.stats.total_requests += 1;
        Ok(handle)
    }

    pub fn start(self: &Arc<Self>) {
        let mut guard = self.thread.lock().unwrap();
        if guard.is_some() {
            return;
        }
        self.running.store(true, Ordering::Relaxed);
        let batcher = self.clone();
        let handle = std::thread::spawn(move || batcher.run_loop());
        *guard = Some(handle);
    }

    /// Stop the loop. Cancels only requests still in the waiting queue;
    /// active requests are left to finish naturally.
    pub fn stop(&self, timeout: Duration) {
        self.running.store(false, Ordering::Relaxed);
        {
            let mut state = self.state.lock().unwrap();
            for mut tracked in state.waiting.drain(..) {
                tracked.req.status = RequestStatus::Cancelled;
                tracked.setter.resolve(Err(OrchestratorError::Cancelled));
            }
        }
        let handle = self.thread.lock().unwrap().take();
        if let Some(handle) = handle {
            let start = Instant::now();
            while !handle.is_finished() && start.elapsed() < timeout {
                std::thread::sleep(Duration::from_millis(1));
            }
            let _ = handle.join();
        }
    }

    pub fn stats(&self) -> BatcherStats {
        self.state.lock().unwrap().stats
    }

    pub fn pending_count(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.waiting.len() + state.active.len()
    }

    fn run_loop(self: Arc<Self>) {
        while self.running.load(Ordering::Relaxed) {
            let had_work = {
                let mut state = self.state.lock().unwrap();
                self.admit_requests(&mut state);
                let has_active = !state.active.is_empty();
                if has_active {
                    self.iteration_step(&mut state);
                    self.evict_completed(&mut state);
                }
                has_active || !state.waiting.is_empty()
            };
            std::thread::sleep(if had_work {
                Duration::from_micros(100)
            } else {
                Duration::from_millis(10)
            });
        }
    }

    /// Admit up to `max_batch_size - active.len()` waiting requests,
    /// tokenizing each prompt and preparing its paged KV storage: a
    /// prefix-cache lookup first, then a fresh allocation only if nothing
    /// was hit.
    fn admit_requests(&self, state: &mut SharedState) {
        let slots = self.config.max_batch_size.saturating_sub(state.active.len());
        for _ in 0..slots {
            let Some(mut tracked) = state.waiting.pop_front() else {
                break;
            };
            let input_ids = self.tokenizer.encode(&tracked.req.prompt);
            {
                let mut kv = self.kv_cache.lock().unwrap();
                let hit_tokens = kv.try_prefix_cache(&tracked.req.request_id, tracked.req.gpu_id, &input_ids);
                if hit_tokens == 0 {
                    kv.allocate(&tracked.req.request_id, tracked.req.gpu_id, input_ids.len());
                }
            }
            tracked.req.input_ids = input_ids;
            tracked.req.status = RequestStatus::Active;
            debug!(request_id = %tracked.req.request_id, "request admitted");
            state.active.push(tracked);
        }
    }

    /// Prefill requests run individually; decode requests coalesce into one
    /// batched step when there are at least two, matching the original's
    /// "all same length → concat, else pad, else fall back to sequential"
    /// decision ladder.
    fn iteration_step(&self, state: &mut SharedState) {
        state.stats.total_iterations += 1;

        let mut prefill_idx = Vec::new();
        let mut decode_idx = Vec::new();
        for (i, tracked) in state.active.iter().enumerate() {
            if tracked.req.has_kv_cache {
                decode_idx.push(i);
            } else {
                prefill_idx.push(i);
            }
        }

        for i in prefill_idx {
            self.forward_prefill(&mut state.active[i]);
        }

        if decode_idx.len() >= 2 {
            self.forward_batched_decode(state, &decode_idx);
        } else if decode_idx.len() == 1 {
            let i = decode_idx[0];
            self.forward_decode_single(&mut state.active[i]);
        }
    }

    /// A prefill step processes a request's full tokenized prompt in one
    /// `forward_step` call rather than one token at a time; `forward_step`
    /// doesn't care whether its input slice is one token per request (decode)
    /// or one request's whole prompt (prefill), so only the last position's
    /// logits — the ones that predict the first generated token — are used.
    fn forward_prefill(&self, tracked: &mut TrackedRequest) {
        let input_ids = if tracked.req.input_ids.is_empty() {
            &[0u32][..]
        } else {
            &tracked.req.input_ids[..]
        };
        match self.model.forward_step(input_ids, &[]) {
            Ok(logits_batch) => {
                tracked.req.has_kv_cache = true;
                if let Some(logits) = logits_batch.last() {
                    self.advance_with_logits(tracked, logits);
                }
            }
            Err(e) => self.fail_request(tracked, e),
        }
    }

    fn forward_decode_single(&self, tracked: &mut TrackedRequest) {
        let last_token = *tracked.req.generated_ids.last().unwrap_or(&0);
        match self.model.forward_step(&[last_token], &[]) {
            Ok(logits_batch) => {
                if let Some(logits) = logits_batch.first() {
                    self.advance_with_logits(tracked, logits);
                }
            }
            Err(e) => self.fail_request(tracked, e),
        }
    }

    /// Coalesces every decode-phase request named in `idx` into a single
    /// `forward_step` call; on model failure, falls back to sequential
    /// single-request steps rather than failing the whole batch.
    fn forward_batched_decode(&self, state: &mut SharedState, idx: &[usize]) {
        let tokens: Vec<u32> = idx
            .iter()
            .map(|&i| *state.active[i].req.generated_ids.last().unwrap_or(&0))
            .collect();
        match self.model.forward_step(&tokens, &[]) {
            Ok(logits_batch) if logits_batch.len() == idx.len() => {
                for (&i, logits) in idx.iter().zip(logits_batch.iter()) {
                    state.active[i].req.has_kv_cache = true;
                    self.advance_with_logits(&mut state.active[i], logits);
                }
            }
            _ => {
                warn!("batched decode failed, falling back to sequential");
                for &i in idx {
                    self.forward_decode_single(&mut state.active[i]);
                }
            }
        }
    }

    fn advance_with_logits(&self, tracked: &mut TrackedRequest, logits: &[f32]) {
        let next_token = sample(logits, tracked.req.sampling);
        tracked.req.generated_ids.push(next_token);
        tracked.req.tokens_generated += 1;
        self.kv_cache
            .lock()
            .unwrap()
            .append_token(&tracked.req.request_id, next_token);

        if let Some(cb) = &tracked.req.on_token {
            let text = self.tokenizer.decode(&[next_token]);
            if !text.is_empty() {
                cb(&text);
            }
        }

        let stop_reached = tracked.req.stop_token_id == Some(next_token);
        let budget_reached = tracked.req.tokens_generated >= tracked.req.max_new_tokens;
        if stop_reached || budget_reached {
            self.finish_request(tracked);
        }
    }

    fn finish_request(&self, tracked: &mut TrackedRequest) {
        tracked.req.status = RequestStatus::Finished;
        tracked.req.finished_at = Some(Instant::now());
        let text = self.tokenizer.decode(&tracked.req.generated_ids);
        debug!(request_id = %tracked.req.request_id, tokens = tracked.req.tokens_generated, "request finished");
        tracked.setter.resolve(Ok(text));
    }

    fn fail_request(&self, tracked: &mut TrackedRequest, err: OrchestratorError) {
        tracked.req.status = RequestStatus::Error;
        warn!(request_id = %tracked.req.request_id, error = %err, "request failed");
        tracked.setter.resolve(Err(err));
    }

    /// Evict every request that reached a terminal status this iteration,
    /// freeing their paged KV cache entries back to the device pool.
    fn evict_completed(&self, state: &mut SharedState) {
        let (done, still_active): (Vec<_>, Vec<_>) = state.active.drain(..).partition(|t| {
            matches!(
                t.req.status,
                RequestStatus::Finished | RequestStatus::Error | RequestStatus::Cancelled
            )
        });
        if !done.is_empty() {
            let mut kv = self.kv_cache.lock().unwrap();
            for tracked in &done {
                kv.free_request(&tracked.req.request_id);
            }
        }
        state.stats.total_tokens_generated += done.iter().map(|t| t.req.tokens_generated as u64).sum::<u64>();
        state.active = still_active;
    }
}

/// Temperature/top-k/top-p sampling over raw logits. Falls back to greedy
/// argmax when every knob is at its identity value.
pub fn sample(logits: &[f32], params: SamplingParams) -> u32 {
    if params.temperature == 1.0 && params.top_p >= 1.0 && params.top_k == 0 {
        return argmax(logits);
    }

    let mut scaled: Vec<f32> = if params.temperature > 0.0 {
        logits.iter().map(|&l| l / params.temperature).collect()
    } else {
        logits.to_vec()
    };

    if params.top_k > 0 && params.top_k < scaled.len() {
        let mut sorted = scaled.clone();
        sorted.sort_by(|a, b| b.partial_cmp(a).unwrap());
        let threshold = sorted[params.top_k - 1];
        for v in scaled.iter_mut() {
            if *v < threshold {
                *v = f32::NEG_INFINITY;
            }
        }
    }

    if params.top_p < 1.0 {
        let mut indexed: Vec<(usize, f32)> = scaled.iter().copied().enumerate().collect();
        indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
        let probs = softmax(&indexed.iter().map(|(_, v)| *v).collect::<Vec<_>>());
        let mut cumulative = 0.0;
        for (rank, (idx, _)) in indexed.iter().enumerate() {
            cumulative += probs[rank];
            if cumulative - probs[rank] >= params.top_p {
                scaled[*idx] = f32::NEG_INFINITY;
            }
        }
    }

    let probs = softmax(&scaled);
    weighted_sample(&probs)
}

fn argmax(logits: &[f32]) -> u32 {
    logits
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
        .map(|(i, _)| i as u32)
        .unwrap_or(0)
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    if sum == 0.0 {
        return vec![0.0; logits.len()];
    }
    exps.iter().map(|&e| e / sum).collect()
}

fn weighted_sample(probs: &[f32]) -> u32 {
    let mut roll: f32 = rand::random::<f32>();
    for (i, &p) in probs.iter().enumerate() {
        if roll < p {
            return i as u32;
        }
        roll -= p;
    }
    (probs.len().saturating_sub(1)) as u32
}
