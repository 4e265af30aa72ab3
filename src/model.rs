//! Model and tokenizer collaborator interfaces, plus the KV-cache
//! layout descriptor shared by `paged_kv` and `batcher`.

use crate::error::{OrchestratorError, OrchestratorResult};

/// Describes how a HuggingFace-style `past_key_values` tuple is laid out, so
/// `PagedKvCache::from_hf_cache`/`to_hf_cache` can validate it instead of
/// guessing at an unfamiliar tensor shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvLayout {
    /// `[batch, heads, seq, head_dim]`, the layout this crate natively works
    /// in and the only one `from_hf_cache`/`to_hf_cache` accept.
    BatchHeadsSeqDim,
    /// Any other axis ordering, reported back only as the `got` side of an
    /// `UnsupportedKvLayout` error.
    Other(&'static str),
}

impl KvLayout {
    pub(crate) fn require_standard(self) -> OrchestratorResult<()> {
        match self {
            KvLayout::BatchHeadsSeqDim => Ok(()),
            KvLayout::Other(got) => Err(OrchestratorError::UnsupportedKvLayout {
                expected: "[batch, heads, seq, dim]",
                got: got.to_string(),
            }),
        }
    }
}

/// A single layer's key/value tensors in `[batch, heads, seq, head_dim]`
/// layout, flattened to `f32` for a backend-agnostic representation. The
/// core never interprets the contents, only their shape.
#[derive(Debug, Clone)]
pub struct LayerKv {
    pub key: Vec<f32>,
    pub value: Vec<f32>,
    pub num_heads: usize,
    pub head_dim: usize,
    pub seq_len: usize,
}

/// The model collaborator interface: a forward pass that
/// advances one or more sequences by one token each, given their current KV
/// cache state. The core drives this; it never implements it.
pub trait ModelAdapter: Send + Sync {
    /// Run one decode step for a batch of requests, each supplying its
    /// current per-layer KV state and the next input token id. Returns one
    /// logits vector per request, in the same order.
    fn forward_step(
        &self,
        input_token_ids: &[u32],
        kv_state: &[Vec<LayerKv>],
    ) -> OrchestratorResult<Vec<Vec<f32>>>;

    /// Number of transformer layers the model has, used by `placement.rs`.
    fn num_layers(&self) -> usize;

    /// Hidden size, used by the FLOP/param estimators in `placement.rs`.
    fn hidden_size(&self) -> usize;

    /// Attention head count, used for per-layer KV page sizing.
    fn num_heads(&self) -> usize;

    /// Per-head dimension.
    fn head_dim(&self) -> usize;
}

/// The tokenizer collaborator interface.
pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Vec<u32>;
    fn decode(&self, token_ids: &[u32]) -> String;
    fn eos_token_id(&self) -> u32;
}

/// A `Tokenizer` that maps each UTF-8 byte to its own token id, for
/// embedding runtimes that haven't wired up a real vocabulary yet. Not
/// suitable for production decoding quality, only for exercising the
/// admission/generation pipeline end to end.
#[derive(Debug, Default, Clone, Copy)]
pub struct ByteTokenizer;

impl Tokenizer for ByteTokenizer {
    fn encode(&self, text: &str) -> Vec<u32> {
        text.bytes().map(u32::from).collect()
    }

    fn decode(&self, token_ids: &[u32]) -> String {
        let bytes: Vec<u8> = token_ids.iter().map(|&t| t as u8).collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn eos_token_id(&self) -> u32 {
        0
    }
}
