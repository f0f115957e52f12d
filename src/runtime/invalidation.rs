//! Process-wide guest-code-write invalidation (spec §4.9, C9).
//!
//! Grounded on `src/jit/cache.rs`'s `regions: RwLock<BTreeMap<u64,u64>>`
//! range-tracking (the teacher already separates "which guest ranges are
//! cached" from "what's cached," letting invalidation walk ranges instead
//! of every cache entry) and `src/jit/eviction.rs`'s traversal pattern of
//! sweeping a tracked-block set under one mutex — reused here for its
//! *traversal* shape only; the hotness-decay scoring `eviction.rs` exists
//! for is out of scope (this core never evicts for capacity, only for
//! correctness).

use std::sync::Arc;

use log::debug;
use parking_lot::RwLock;

use crate::runtime::thread_context::ThreadContext;

/// Three triggers name in spec §4.9: a guest write to executable memory, a
/// guest `munmap`/`mprotect` of an executable range, and removal of a
/// `CustomIRHandler`. All three funnel through `invalidate_range`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationTrigger {
    GuestWrite,
    UnmapOrReprotect,
    HandlerRemoved,
}

/// Global invalidation coordination: shared for compilers installing new
/// blocks, exclusive while a range invalidation sweep runs (spec §4.9;
/// SPEC_FULL.md §4.9 "reusing the teacher's `parking_lot` dependency
/// already present for exactly this read-heavy/write-rare pattern").
pub struct InvalidationProtocol {
    code_invalidation_mutex: RwLock<()>,
}

impl InvalidationProtocol {
    pub fn new() -> Self {
        InvalidationProtocol { code_invalidation_mutex: RwLock::new(()) }
    }

    /// Acquired by a compiling thread around `LookupCache::insert` so an
    /// in-flight invalidation sweep can never observe a half-installed
    /// mapping (spec §8 E6: "either A's insert is observed by B and
    /// erased, or B runs first and A re-inserts").
    pub fn compile_guard(&self) -> parking_lot::RwLockReadGuard<'_, ()> {
        self.code_invalidation_mutex.read()
    }

    /// Sweeps `[start, start+len)` across every thread's `LookupCache`,
    /// exclusive of concurrent compiles (spec §4.9; P3: "after
    /// `invalidate_guest_code_range(s, l)` returns, no `find(pc)` call on
    /// any thread may return a mapping whose coverage intersects
    /// `[s, s+l)`").
    pub fn invalidate_range(&self, threads: &[Arc<ThreadContext>], start: u64, len: u64, trigger: InvalidationTrigger) {
        let _guard = self.code_invalidation_mutex.write();
        let mut total_erased = 0usize;
        for ctx in threads {
            let unpatched = ctx.lookup_cache.erase_range(start, len);
            total_erased += unpatched.len();
        }
        debug!(
            "[InvalidationProtocol] {trigger:?} invalidated [{start:#x}, {:#x}), unpatched {total_erased} link(s) across {} thread(s)",
            start + len,
            threads.len()
        );
    }
}

impl Default for InvalidationProtocol {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::jit::{BlockMapping, CachedObjectCode, CpuBackend, DebugData, IRCaptureCache, IRListing, RAData};
    use crate::types::{GuestMode, GuestPC, GuestRange, HostCodePtr};

    struct NoopBackend;
    impl CpuBackend for NoopBackend {
        fn compile_code(
            &mut self,
            _: GuestPC,
            _: &IRListing,
            _: Option<&RAData>,
            _: bool,
            _: &crate::arena::CodeArena,
        ) -> Result<(HostCodePtr, DebugData), crate::error::CacheError> {
            Err(crate::error::CacheError::ArenaExhausted { requested: 0, available: 0 })
        }
        fn relocate_jit_object_code(&mut self, _: GuestPC, _: &CachedObjectCode, _: &crate::arena::CodeArena) -> Option<HostCodePtr> {
            None
        }
        fn clear_cache(&mut self) {}
        fn clear_relocations(&mut self) {}
        fn initialize(&mut self) {}
    }

    fn ctx_with_mapping(pc: GuestPC) -> Arc<ThreadContext> {
        let config = CoreConfig::default();
        let ctx = ThreadContext::new(1, 1, 0, &config, Box::new(NoopBackend), Arc::new(IRCaptureCache::new(None)));
        ctx.lookup_cache.insert(BlockMapping {
            entry_pc: pc,
            host_entry: unsafe { HostCodePtr::from_raw(0x1000 as *const u8) },
            covered_guest_ranges: vec![GuestRange::new(pc.value(), 4)],
            outgoing_links: Vec::new(),
        });
        ctx
    }

    #[test]
    fn invalidate_range_clears_matching_mapping_across_threads() {
        let pc = GuestPC::new(0x2000, GuestMode::Guest64).unwrap();
        let ctx1 = ctx_with_mapping(pc);
        let ctx2 = ctx_with_mapping(pc);
        let protocol = InvalidationProtocol::new();

        protocol.invalidate_range(&[Arc::clone(&ctx1), Arc::clone(&ctx2)], 0x2000, 4, InvalidationTrigger::GuestWrite);

        assert!(ctx1.lookup_cache.find(pc).is_none());
        assert!(ctx2.lookup_cache.find(pc).is_none());
    }

    #[test]
    fn invalidate_range_leaves_non_overlapping_mappings() {
        let pc_hit = GuestPC::new(0x2000, GuestMode::Guest64).unwrap();
        let pc_miss = GuestPC::new(0x9000, GuestMode::Guest64).unwrap();
        let ctx = ctx_with_mapping(pc_hit);
        ctx.lookup_cache.insert(BlockMapping {
            entry_pc: pc_miss,
            host_entry: unsafe { HostCodePtr::from_raw(0x2000 as *const u8) },
            covered_guest_ranges: vec![GuestRange::new(pc_miss.value(), 4)],
            outgoing_links: Vec::new(),
        });
        let protocol = InvalidationProtocol::new();

        protocol.invalidate_range(&[Arc::clone(&ctx)], 0x2000, 4, InvalidationTrigger::GuestWrite);

        assert!(ctx.lookup_cache.find(pc_hit).is_none());
        assert!(ctx.lookup_cache.find(pc_miss).is_some());
    }
}
