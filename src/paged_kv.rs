//! PagedAttention-style KV cache: fixed-size pages, a virtual-to-physical
//! page table per request, reference-counted pages for copy-on-write prefix
//! sharing, and LRU eviction that prefers borrowed pages before touching
//! owned ones.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use tracing::{debug, warn};

use crate::config::PagedKvConfigOptions;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::lending::VramLendingPool;
use crate::model::{KvLayout, LayerKv};

/// Derived sizing for one configured cache.
#[derive(Debug, Clone, Copy)]
pub struct PagedKvConfig {
    pub page_size: usize,
    pub num_heads: usize,
    pub head_dim: usize,
    pub num_layers: usize,
    pub bytes_per_element: usize,
}

impl PagedKvConfig {
    pub fn from_model(page_size: usize, num_heads: usize, head_dim: usize, num_layers: usize) -> Self {
        Self {
            page_size,
            num_heads,
            head_dim,
            num_layers,
            bytes_per_element: 4,
        }
    }

    /// Bytes occupied by one physical page across all layers (key + value).
    pub fn page_size_bytes(&self) -> usize {
        2 * self.page_size * self.num_heads * self.head_dim * self.num_layers * self.bytes_per_element
    }

    pub fn total_memory_bytes(&self, num_pages: usize) -> usize {
        num_pages * self.page_size_bytes()
    }
}

/// One fixed-size slab of token storage, owned by exactly one GPU.
#[derive(Debug, Clone)]
pub struct PhysicalPage {
    pub page_id: u64,
    pub gpu_id: u32,
    pub ref_count: u32,
    pub borrowed_lease_id: Option<u64>,
    pub token_ids: Vec<u32>,
    pub data: Vec<Vec<LayerKv>>,
    pub last_used_seq: u64,
}

impl PhysicalPage {
    fn new(page_id: u64, gpu_id: u32) -> Self {
        Self {
            page_id,
            gpu_id,
            ref_count: 1,
            borrowed_lease_id: None,
            token_ids: Vec::new(),
            data: Vec::new(),
            last_used_seq: 0,
        }
    }
}

/// One entry in a request's virtual-to-physical page table.
#[derive(Debug, Clone)]
pub struct PageTableEntry {
    pub virtual_index: usize,
    pub physical_page_id: u64,
}

#[derive(Debug, Default, Clone, Copy)]
struct CacheStats {
    allocations: u64,
    prefix_hits: u64,
    prefix_misses: u64,
    evictions: u64,
    overflow_borrows: u64,
}

struct RequestEntry {
    gpu_id: u32,
    page_table: Vec<PageTableEntry>,
    num_tokens: usize,
}

/// Manages physical pages across devices and the per-request page tables
/// that reference them.
pub struct PagedKvCache {
    config: PagedKvConfig,
    pages_per_device: usize,
    pages: HashMap<u64, PhysicalPage>,
    free_pages: HashMap<u32, Vec<u64>>,
    next_page_id: u64,
    requests: HashMap<String, RequestEntry>,
    prefix_cache: HashMap<u64, u64>,
    lru_seq: u64,
    stats: CacheStats,
    lending_pool: Option<std::sync::Arc<VramLendingPool>>,
}

impl PagedKvCache {
    pub fn new(config: PagedKvConfig, options: &PagedKvConfigOptions, gpu_ids: &[u32]) -> Self {
        let pages_per_device = if options.max_pages > 0 {
            options.max_pages
        } else {
            options.pages_per_device
        };
        let mut free_pages = HashMap::new();
        let mut pages = HashMap::new();
        let mut next_page_id = 0u64;
        for &gpu_id in gpu_ids {
            let mut ids = Vec::with_capacity(pages_per_device);
            for _ in 0..pages_per_device {
                let id = next_page_id;
                next_page_id += 1;
                pages.insert(id, PhysicalPage::new(id, gpu_id));
                ids.push(id);
            }
            free_pages.insert(gpu_id, ids);
        }
        Self {
            config,
            pages_per_device,
            pages,
            free_pages,
            next_page_id,
            requests: HashMap::new(),
            prefix_cache: HashMap::new(),
            lru_seq: 0,
            stats: CacheStats::default(),
            lending_pool: None,
        }
    }

    pub fn with_lending_pool(mut self, pool: std::sync::Arc<VramLendingPool>) -> Self {
        self.lending_pool = Some(pool);
        self
    }

    /// Reserve storage for a new request, sized for `prompt_len` tokens.
    /// Idempotent on `request_id`: re-allocating an existing request is a
    /// no-op that returns `true`.
    pub fn allocate(&mut self, request_id: &str, gpu_id: u32, prompt_len: usize) -> bool {
        if self.requests.contains_key(request_id) {
            return true;
        }
        let pages_needed = prompt_len.div_ceil(self.config.page_size).max(1);
        let mut page_table = Vec::with_capacity(pages_needed);
        for v in 0..pages_needed {
            let page_id = match self.alloc_page(gpu_id) {
                Some(id) => id,
                None => {
                    self.free_request_pages(&page_table);
                    warn!(request_id, "allocate failed: page pool exhausted");
                    return false;
                }
            };
            page_table.push(PageTableEntry {
                virtual_index: v,
                physical_page_id: page_id,
            });
        }
        self.requests.insert(
            request_id.to_string(),
            RequestEntry {
                gpu_id,
                page_table,
                num_tokens: 0,
            },
        );
        self.stats.allocations += 1;
        true
    }

    fn alloc_page(&mut self, gpu_id: u32) -> Option<u64> {
        if let Some(id) = self.free_pages.get_mut(&gpu_id).and_then(|v| v.pop()) {
            if let Some(page) = self.pages.get_mut(&id) {
                page.ref_count = 1;
                page.borrowed_lease_id = None;
                page.token_ids.clear();
                page.data.clear();
            }
            return Some(id);
        }
        if let Some(id) = self.borrow_overflow_page(gpu_id) {
            return Some(id);
        }
        self.evict_lru(gpu_id)
    }

    fn borrow_overflow_page(&mut self, gpu_id: u32) -> Option<u64> {
        let pool = self.lending_pool.as_ref()?;
        let lease = pool.borrow(gpu_id, self.config.page_size_bytes() as u64, "kv_cache_overflow")?;
        let id = self.next_page_id;
        self.next_page_id += 1;
        let mut page = PhysicalPage::new(id, gpu_id);
        page.borrowed_lease_id = Some(lease.lease_id);
        self.pages.insert(id, page);
        self.stats.overflow_borrows += 1;
        debug!(gpu_id, page_id = id, "allocated borrowed overflow page");
        Some(id)
    }

    fn evict_lru(&mut self, gpu_id: u32) -> Option<u64> {
        let victim_id = self
            .pages
            .values()
            .filter(|p| p.gpu_id == gpu_id && p.ref_count <= 1)
            .min_by(|a, b| {
                // Borrowed pages are preferred eviction candidates.
                let a_key = (a.borrowed_lease_id.is_none(), a.last_used_seq);
                let b_key = (b.borrowed_lease_id.is_none(), b.last_used_seq);
                a_key.cmp(&b_key)
            })
            .map(|p| p.page_id)?;

        let victim = self.pages.remove(&victim_id)?;
        self.prefix_cache.retain(|_, &mut v| v != victim_id);
        if let (Some(lease_id), Some(pool)) = (victim.borrowed_lease_id, &self.lending_pool) {
            pool.release(lease_id);
        }
        self.stats.evictions += 1;
        debug!(gpu_id, page_id = victim_id, "evicted page");

        let id = self.next_page_id;
        self.next_page_id += 1;
        self.pages.insert(id, PhysicalPage::new(id, gpu_id));
        Some(id)
    }

    fn free_request_pages(&mut self, page_table: &[PageTableEntry]) {
        for entry in page_table {
            self.free("", entry.physical_page_id);
        }
    }

    /// Append one token to `request_id`'s sequence, growing the page table
    /// with a fresh page when the current tail page is full.
    pub fn append_token(&mut self, request_id: &str, token_id: u32) -> Option<()> {
        let gpu_id = self.requests.get(request_id)?.gpu_id;
        let page_size = self.config.page_size;

        let needs_new_page = {
            let req = self.requests.get(request_id)?;
            req.num_tokens % page_size == 0 && req.num_tokens > 0
        } || self.requests.get(request_id)?.page_table.is_empty();

        if needs_new_page {
            let new_page_id = self.alloc_page(gpu_id)?;
            let req = self.requests.get_mut(request_id)?;
            let v = req.page_table.len();
            req.page_table.push(PageTableEntry {
                virtual_index: v,
                physical_page_id: new_page_id,
            });
        }

        let req = self.requests.get_mut(request_id)?;
        let tail_page_id = req.page_table.last()?.physical_page_id;
        let page = self.pages.get_mut(&tail_page_id)?;
        page.token_ids.push(token_id);
        self.lru_seq += 1;
        page.last_used_seq = self.lru_seq;
        req.num_tokens += 1;
        Some(())
    }

    /// Release `request_id`'s claim on `page_id`; frees the page back to the
    /// device pool once its reference count reaches zero.
    pub fn free(&mut self, _request_id: &str, page_id: u64) {
        let should_free = if let Some(page) = self.pages.get_mut(&page_id) {
            page.ref_count = page.ref_count.saturating_sub(1);
            page.ref_count == 0
        } else {
            false
        };
        if should_free {
            if let Some(page) = self.pages.get_mut(&page_id) {
                let gpu_id = page.gpu_id;
                if let (Some(lease_id), Some(pool)) = (page.borrowed_lease_id.take(), &self.lending_pool) {
                    pool.release(lease_id);
                }
                self.free_pages.entry(gpu_id).or_default().push(page_id);
            }
        }
    }

    /// Free every page belonging to a finished request, decrementing shared
    /// pages' reference counts instead of freeing them outright.
    pub fn free_request(&mut self, request_id: &str) {
        if let Some(req) = self.requests.remove(request_id) {
            for entry in &req.page_table {
                self.free(request_id, entry.physical_page_id);
            }
        }
    }

    /// Copy-on-write fork: `child_id` shares `parent_id`'s pages by bumping
    /// their reference counts rather than duplicating storage.
    pub fn fork(&mut self, parent_id: &str, child_id: &str) -> bool {
        let page_table = match self.requests.get(parent_id) {
            Some(req) => req.page_table.clone(),
            None => return false,
        };
        let gpu_id = self.requests[parent_id].gpu_id;
        let num_tokens = self.requests[parent_id].num_tokens;
        for entry in &page_table {
            if let Some(page) = self.pages.get_mut(&entry.physical_page_id) {
                page.ref_count += 1;
            }
        }
        self.requests.insert(
            child_id.to_string(),
            RequestEntry {
                gpu_id,
                page_table,
                num_tokens,
            },
        );
        true
    }

    /// Divergence path for a shared page: if the target page's `ref_count >
    /// 1`, copy its contents into a fresh page before writing, then repoint
    /// the page table.
    pub fn write_token(&mut self, request_id: &str, page_index: usize, token_id: u32) -> Option<()> {
        let gpu_id = self.requests.get(request_id)?.gpu_id;
        let page_id = self.requests.get(request_id)?.page_table.get(page_index)?.physical_page_id;
        let ref_count = self.pages.get(&page_id)?.ref_count;

        let target_page_id = if ref_count > 1 {
            let new_id = self.alloc_page(gpu_id)?;
            let source = self.pages.get(&page_id)?.clone();
            let new_page = self.pages.get_mut(&new_id)?;
            new_page.token_ids = source.token_ids;
            new_page.data = source.data;
            if let Some(p) = self.pages.get_mut(&page_id) {
                p.ref_count -= 1;
            }
            let req = self.requests.get_mut(request_id)?;
            req.page_table[page_index].physical_page_id = new_id;
            new_id
        } else {
            page_id
        };

        let page = self.pages.get_mut(&target_page_id)?;
        page.token_ids.push(token_id);
        self.lru_seq += 1;
        page.last_used_seq = self.lru_seq;
        Some(())
    }

    /// Walk `token_ids` one full page at a time, attaching any matching
    /// cached page directly into `request_id`'s page table (bumping its
    /// `ref_count`) instead of allocating a fresh one, and registering a
    /// freshly allocated page for every page that misses. A miss resets the
    /// running hit count to zero, so only a maximal from-the-start run of
    /// hits is ever returned — a hit after a later miss shares storage but
    /// does not count toward the reported prefix length. Per the resolved
    /// Open Question, a hash match is always followed by an equality check
    /// against the page's stored token ids before being treated as a hit.
    /// Returns the number of cache-hit tokens.
    pub fn try_prefix_cache(&mut self, request_id: &str, gpu_id: u32, token_ids: &[u32]) -> usize {
        let page_size = self.config.page_size;
        let mut entry = self.requests.remove(request_id).unwrap_or(RequestEntry {
            gpu_id,
            page_table: Vec::new(),
            num_tokens: 0,
        });

        let mut hits = 0usize;
        let mut offset = 0usize;
        while offset + page_size <= token_ids.len() {
            let chunk = &token_ids[offset..offset + page_size];
            let hash = hash_tokens(chunk);
            let reused = self.prefix_cache.get(&hash).copied().and_then(|page_id| {
                let page = self.pages.get_mut(&page_id)?;
                (page.token_ids == chunk).then_some(page_id)
            });

            match reused {
                Some(page_id) => {
                    if let Some(page) = self.pages.get_mut(&page_id) {
                        page.ref_count += 1;
                        self.lru_seq += 1;
                        page.last_used_seq = self.lru_seq;
                    }
                    entry.page_table.push(PageTableEntry {
                        virtual_index: entry.page_table.len(),
                        physical_page_id: page_id,
                    });
                    hits += page_size;
                    self.stats.prefix_hits += 1;
                }
                None => {
                    self.stats.prefix_misses += 1;
                    let Some(page_id) = self.alloc_page(gpu_id) else {
                        break;
                    };
                    if let Some(page) = self.pages.get_mut(&page_id) {
                        page.token_ids = chunk.to_vec();
                    }
                    self.prefix_cache.insert(hash, page_id);
                    entry.page_table.push(PageTableEntry {
                        virtual_index: entry.page_table.len(),
                        physical_page_id: page_id,
                    });
                    hits = 0;
                }
            }
            offset += page_size;
        }

        entry.num_tokens = entry.page_table.len() * page_size;
        // A prompt shorter than one page can't produce any full-page chunk
        // to look up; leave no entry behind so `allocate` still reserves the
        // (at-least-one-page) storage this request actually needs.
        if !entry.page_table.is_empty() {
            self.requests.insert(request_id.to_string(), entry);
        }
        hits
    }

    /// Register a full page's token sequence in the prefix cache so future
    /// requests sharing the same prefix can reuse it.
    pub fn register_prefix(&mut self, page_id: u64) {
        if let Some(page) = self.pages.get(&page_id) {
            if page.token_ids.len() == self.config.page_size {
                let hash = hash_tokens(&page.token_ids);
                self.prefix_cache.insert(hash, page_id);
            }
        }
    }

    /// Import a HuggingFace-style `past_key_values` tensor set into fresh
    /// pages, validating the layout first.
    pub fn from_hf_cache(
        &mut self,
        request_id: &str,
        gpu_id: u32,
        layout: KvLayout,
        layers: Vec<LayerKv>,
    ) -> OrchestratorResult<()> {
        layout.require_standard()?;
        let seq_len = layers.first().map(|l| l.seq_len).unwrap_or(0);
        if !self.allocate(request_id, gpu_id, seq_len) {
            return Err(OrchestratorError::UnknownRequest(request_id.to_string()));
        }
        let req = self
            .requests
            .get(request_id)
            .ok_or_else(|| OrchestratorError::UnknownRequest(request_id.to_string()))?;
        if let Some(entry) = req.page_table.first() {
            if let Some(page) = self.pages.get_mut(&entry.physical_page_id) {
                page.data = vec![layers];
            }
        }
        Ok(())
    }

    /// Export a request's cached layers back into HuggingFace layout.
    pub fn to_hf_cache(&self, request_id: &str, layout: KvLayout) -> OrchestratorResult<Vec<Vec<LayerKv>>> {
        layout.require_standard()?;
        let req = self
            .requests
            .get(request_id)
            .ok_or_else(|| OrchestratorError::UnknownRequest(request_id.to_string()))?;
        Ok(req
            .page_table
            .iter()
            .filter_map(|e| self.pages.get(&e.physical_page_id))
            .flat_map(|p| p.data.clone())
            .collect())
    }

    pub fn stats(&self) -> (u64, u64, u64, u64, u64) {
        (
            self.stats.allocations,
            self.stats.prefix_hits,
            self.stats.prefix_misses,
            self.stats.evictions,
            self.stats.overflow_borrows,
        )
    }

    pub fn pages_per_device(&self) -> usize {
        self.pages_per_device
    }

    /// Pages currently on `gpu_id`'s free list, for stats/testing.
    pub fn free_page_count(&self, gpu_id: u32) -> usize {
        self.free_pages.get(&gpu_id).map(|v| v.len()).unwrap_or(0)
    }

    /// Pages on `gpu_id` currently held by some request or the prefix cache.
    pub fn used_page_count(&self, gpu_id: u32) -> usize {
        self.pages.values().filter(|p| p.gpu_id == gpu_id && p.ref_count > 0).count()
    }
}

fn hash_tokens(tokens: &[u32]) -> u64 {
    let mut hasher = DefaultHasher::new();
    tokens.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> PagedKvCache {
        let config = PagedKvConfig::from_model(4, 8, 64, 2);
        let options = PagedKvConfigOptions {
            page_size: 4,
            max_pages: 8,
            pages_per_device: 8,
        };
        PagedKvCache::new(config, &options, &[0])
    }

    #[test]
    fn allocate_reserves_enough_pages_for_prompt() {
        let mut cache = cache();
        assert!(cache.allocate("req-1", 0, 6));
        assert_eq!(cache.requests["req-1"].page_table.len(), 2);
    }

    #[test]
    fn allocate_is_idempotent() {
        let mut cache = cache();
        assert!(cache.allocate("req-1", 0, 6));
        assert!(cache.allocate("req-1", 0, 6));
        assert_eq!(cache.requests.len(), 1);
    }

    #[test]
    fn append_token_grows_page_table_when_full() {
        let mut cache = cache();
        cache.allocate("req-1", 0, 4);
        for t in 0..4 {
            cache.append_token("req-1", t).unwrap();
        }
        assert_eq!(cache.requests["req-1"].page_table.len(), 1);
        cache.append_token("req-1", 99).unwrap();
        assert_eq!(cache.requests["req-1"].page_table.len(), 2);
    }

    #[test]
    fn fork_shares_pages_via_ref_count() {
        let mut cache = cache();
        cache.allocate("parent", 0, 4);
        let page_id = cache.requests["parent"].page_table[0].physical_page_id;
        assert!(cache.fork("parent", "child"));
        assert_eq!(cache.pages[&page_id].ref_count, 2);
    }

    #[test]
    fn write_token_copies_on_write_when_shared() {
        let mut cache = cache();
        cache.allocate("parent", 0, 4);
        let original_page_id = cache.requests["parent"].page_table[0].physical_page_id;
        cache.fork("parent", "child");
        cache.write_token("child", 0, 7).unwrap();
        let child_page_id = cache.requests["child"].page_table[0].physical_page_id;
        assert_ne!(child_page_id, original_page_id);
        assert_eq!(cache.pages[&original_page_id].ref_count, 1);
    }

    #[test]
    fn prefix_cache_hit_attaches_existing_page_and_bumps_ref_count() {
        let mut cache = cache();
        cache.allocate("donor", 0, 4);
        let page_id = cache.requests["donor"].page_table[0].physical_page_id;
        {
            let page = cache.pages.get_mut(&page_id).unwrap();
            page.token_ids = vec![1, 2, 3, 4];
        }
        cache.register_prefix(page_id);

        let hits = cache.try_prefix_cache("req-1", 0, &[1, 2, 3, 4]);
        assert_eq!(hits, 4);
        assert_eq!(cache.requests["req-1"].page_table[0].physical_page_id, page_id);
        assert_eq!(cache.pages[&page_id].ref_count, 2);
    }

    #[test]
    fn prefix_cache_miss_allocates_a_fresh_page_and_registers_it() {
        let mut cache = cache();
        let hits = cache.try_prefix_cache("req-1", 0, &[5, 6, 7, 8]);
        assert_eq!(hits, 0);
        assert_eq!(cache.requests["req-1"].page_table.len(), 1);
        let page_id = cache.requests["req-1"].page_table[0].physical_page_id;
        assert_eq!(cache.pages[&page_id].token_ids, vec![5, 6, 7, 8]);
    }

    #[test]
    fn prefix_cache_only_counts_hits_from_an_unbroken_run_at_the_start() {
        let mut cache = cache();
        cache.allocate("donor", 0, 4);
        let first_page = cache.requests["donor"].page_table[0].physical_page_id;
        {
            let page = cache.pages.get_mut(&first_page).unwrap();
            page.token_ids = vec![1, 2, 3, 4];
        }
        cache.register_prefix(first_page);

        // First page hits, the next two pages miss — the running hit count
        // must reset to zero on the first miss and stay there.
        let hits = cache.try_prefix_cache("req-1", 0, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]);
        assert_eq!(hits, 0);
        assert_eq!(cache.requests["req-1"].page_table.len(), 3);
        assert_eq!(cache.requests["req-1"].page_table[0].physical_page_id, first_page);
    }

    #[test]
    fn eviction_falls_back_to_lru_when_the_pool_is_exhausted() {
        let mut cache = cache();
        // Drain all free pages for gpu 0.
        for i in 0..8 {
            cache.allocate(&format!("req-{i}"), 0, 4);
        }
        assert_eq!(cache.free_page_count(0), 0);

        // No lending pool configured, so the only way to satisfy this
        // allocation is LRU eviction of the oldest owned page.
        assert!(cache.allocate("req-overflow", 0, 4));
        let (_, _, _, evictions, overflow_borrows) = cache.stats();
        assert_eq!(evictions, 1);
        assert_eq!(overflow_borrows, 0);
    }

    #[test]
    fn eviction_never_picks_a_page_still_shared_by_a_fork() {
        let mut cache = cache();
        cache.allocate("parent", 0, 4);
        cache.fork("parent", "child");
        for i in 0..7 {
            cache.allocate(&format!("req-{i}"), 0, 4);
        }
        assert_eq!(cache.free_page_count(0), 0);

        // The parent/child page has ref_count 2 and must survive eviction.
        let shared_page_id = cache.requests["parent"].page_table[0].physical_page_id;
        assert!(cache.allocate("req-overflow", 0, 4));
        assert!(cache.pages.contains_key(&shared_page_id));
        assert_eq!(cache.pages[&shared_page_id].ref_count, 2);
    }

    #[test]
    fn non_standard_hf_layout_is_rejected() {
        let mut cache = cache();
        let err = cache
            .from_hf_cache("req-1", 0, KvLayout::Other("[seq, batch, heads, dim]"), vec![])
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::UnsupportedKvLayout { .. }));
    }
}
