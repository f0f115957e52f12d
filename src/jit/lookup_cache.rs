//! Guest-PC to host-code-pointer lookup (spec §4.1, C1).
//!
//! Grounded on `src/jit/cache.rs::CodeCache` (an `RwLock`-guarded map from
//! guest address to compiled block, a `BTreeMap` region index used for
//! invalidation, and `CacheStats` atomics) restructured into the spec's
//! required two-level sparse page table with an overflow hash table for
//! pages with few mappings, plus the per-page index needed for
//! invalidation in time proportional to pages touched rather than total
//! cache size.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::arena::CodeArena;
use crate::error::CacheError;
use crate::types::{GuestMode, GuestPC, GuestRange, HostCodePtr, PAGE_SHIFT};

/// Number of page-table-entry slots per top-level directory, chosen so the
/// directory itself stays small while the leaf level covers one guest page
/// each (spec §4.1: "two-level ... first level is a flat array, second
/// level is populated lazily").
const L1_BITS: u32 = 12;
const L1_SIZE: usize = 1 << L1_BITS;

/// A block compiled for one guest entry PC: its host entry point plus the
/// guest byte ranges it covers, used by invalidation to find every mapping
/// touching a written page (spec §3 `BlockMapping`).
#[derive(Debug, Clone)]
pub struct BlockMapping {
    pub entry_pc: GuestPC,
    pub host_entry: HostCodePtr,
    pub covered_guest_ranges: Vec<GuestRange>,
    /// Direct-exit targets this block was linked to, so `erase` can find
    /// and unpatch every `BlockLink` pointing at a mapping being removed
    /// (spec §4.1 "un-patching thunk").
    pub outgoing_links: Vec<GuestPC>,
}

/// A patched direct-branch target inside a compiled block's host code,
/// recorded so invalidation can revert it to a dispatcher trampoline
/// instead of leaving a dangling jump into freed code (spec §3
/// `BlockLink`). The core never follows `patch_site` itself; it is handed
/// back to the `CpuBackend` that owns the actual patch/unpatch bytes.
#[derive(Debug, Clone, Copy)]
pub struct BlockLink {
    pub from_pc: GuestPC,
    pub to_pc: GuestPC,
    pub patch_site: *const u8,
}

// SAFETY: `patch_site` addresses bytes inside a thread-owned `CodeArena`
// that outlives every `BlockLink` referencing it (the arena is only ever
// cleared together with the `LookupCache` holding these links, see
// `LookupCache::clear`).
unsafe impl Send for BlockLink {}
unsafe impl Sync for BlockLink {}

#[derive(Debug, Default)]
struct Stats {
    hits: AtomicU64,
    misses: AtomicU64,
    insertions: AtomicU64,
    erasures: AtomicU64,
}

/// Per-thread guest-PC-to-host-code lookup structure (spec §4.1).
///
/// The page table is a sparse `Vec<Option<Box<[Option<BlockMapping>; PAGE]>>>`-
/// shaped structure; pages with a single mapping live directly in the leaf
/// slot, pages accumulating more than one entry point (self-modifying or
/// re-targeted code) overflow into `overflow`. A `page_index` tracks which
/// pages have any overflow entries so `erase_range` only visits pages that
/// could possibly be affected (spec §4.1 invariant: "invalidation cost is
/// proportional to pages touched, not total cache size").
pub struct LookupCache {
    mode: GuestMode,
    page_count: u64,
    l1: RwLock<Vec<Option<Box<PageTable>>>>,
    overflow: RwLock<HashMap<u64, BlockMapping>>,
    page_index: RwLock<HashMap<u64, HashSet<u64>>>,
    links: RwLock<HashMap<u64, Vec<BlockLink>>>,
    arena: CodeArena,
    stats: Stats,
}

type PageTable = [Option<BlockMapping>; L1_SIZE];

impl LookupCache {
    pub fn new(mode: GuestMode, guest64_vm_limit: u64, code_arena_size: usize) -> Self {
        let vm_size = mode.vm_size(guest64_vm_limit);
        let page_count = (vm_size >> PAGE_SHIFT).max(1);
        LookupCache {
            mode,
            page_count,
            l1: RwLock::new(Vec::new()),
            overflow: RwLock::new(HashMap::new()),
            page_index: RwLock::new(HashMap::new()),
            links: RwLock::new(HashMap::new()),
            arena: CodeArena::new(code_arena_size),
            stats: Stats::default(),
        }
    }

    pub fn mode(&self) -> GuestMode {
        self.mode
    }

    pub fn arena(&self) -> &CodeArena {
        &self.arena
    }

    /// Look up the host entry point for `pc`. Hit/miss is tracked for
    /// diagnostics (spec §4.1 item "hit/miss counters").
    pub fn find(&self, pc: GuestPC) -> Option<HostCodePtr> {
        let page = pc.page();
        if page >= self.page_count {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        if let Some(mapping) = self.overflow.read().get(&pc.value()) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Some(mapping.host_entry);
        }

        let outer = page as usize / L1_SIZE;
        let inner = page as usize % L1_SIZE;
        let l1 = self.l1.read();
        if let Some(table) = l1.get(outer).and_then(|t| t.as_ref()) {
            if let Some(mapping) = &table[inner] {
                if mapping.entry_pc == pc {
                    self.stats.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(mapping.host_entry);
                }
            }
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Installs a compiled block's mapping, tearing down any prior mapping
    /// for the same entry PC first (spec §4.1 "insert tears down any prior
    /// mapping before installing" — the SMC-rewrite edge case). Returns the
    /// replaced mapping's host entry point, if any, so the caller can hand
    /// it to the back-end for cleanup. If the page already holds a
    /// *different* entry PC, the new mapping overflows into the hash table
    /// and the page is recorded in `page_index` (spec §4.1 edge case "two
    /// entry points on the same page").
    pub fn insert(&self, mapping: BlockMapping) -> Option<HostCodePtr> {
        self.stats.insertions.fetch_add(1, Ordering::Relaxed);
        let prior = self.remove_entry(mapping.entry_pc).map(|m| m.host_entry);
        let page = mapping.entry_pc.page();

        for range in &mapping.covered_guest_ranges {
            let mut index = self.page_index.write();
            for p in range.first_page()..=range.last_page() {
                index.entry(p).or_default().insert(mapping.entry_pc.value());
            }
        }

        let fits_l1 = {
            let l1 = self.l1.read();
            l1.get(page as usize / L1_SIZE)
                .and_then(|t| t.as_ref())
                .map(|t| t[page as usize % L1_SIZE].is_none())
                .unwrap_or(true)
        };

        if fits_l1 {
            let mut l1 = self.l1.write();
            let outer = page as usize / L1_SIZE;
            if l1.len() <= outer {
                l1.resize_with(outer + 1, || None);
            }
            let table = l1[outer].get_or_insert_with(|| Box::new(empty_page_table()));
            table[page as usize % L1_SIZE] = Some(mapping);
        } else {
            self.overflow.write().insert(mapping.entry_pc.value(), mapping);
        }

        prior
    }

    /// Removes whatever mapping is installed for `pc` (L1 leaf or overflow)
    /// and clears `pc` out of `page_index` for every page it covered (spec
    /// §4.9 step 2b). Shared by `insert` (same-PC replacement) and `erase`
    /// (deliberate removal) so both paths keep the index consistent.
    fn remove_entry(&self, pc: GuestPC) -> Option<BlockMapping> {
        let page = pc.page();
        let removed = if let Some(mapping) = self.overflow.write().remove(&pc.value()) {
            Some(mapping)
        } else {
            let mut l1 = self.l1.write();
            match l1.get_mut(page as usize / L1_SIZE) {
                Some(Some(table)) => {
                    let inner = page as usize % L1_SIZE;
                    if table[inner].as_ref().map(|m| m.entry_pc) == Some(pc) {
                        table[inner].take()
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };

        if let Some(mapping) = &removed {
            let mut index = self.page_index.write();
            for range in &mapping.covered_guest_ranges {
                for p in range.first_page()..=range.last_page() {
                    if let Some(pcs) = index.get_mut(&p) {
                        pcs.remove(&pc.value());
                        if pcs.is_empty() {
                            index.remove(&p);
                        }
                    }
                }
            }
        }

        removed
    }

    /// Installs a direct-branch patch record so invalidation can unpatch it
    /// without asking the back-end to re-derive the link (spec §4.1
    /// "`add_block_link`").
    pub fn add_block_link(&self, link: BlockLink) -> Result<(), CacheError> {
        if self.find(link.to_pc).is_none() {
            return Err(CacheError::NoSuchTarget { target: link.to_pc.value() });
        }
        self.links.write().entry(link.to_pc.value()).or_default().push(link);
        Ok(())
    }

    /// Removes the mapping for `pc`, if any, along with every `BlockLink`
    /// that pointed at it. Returns the unpatch sites the caller (the
    /// back-end) must revert to dispatcher trampolines.
    pub fn erase(&self, pc: GuestPC) -> Vec<BlockLink> {
        self.stats.erasures.fetch_add(1, Ordering::Relaxed);
        self.remove_entry(pc);
        self.links.write().remove(&pc.value()).unwrap_or_default()
    }

    /// Removes every mapping whose `covered_guest_ranges` intersects
    /// `[start, start+len)`, visiting only pages recorded in `page_index`
    /// for that range (spec §4.1 invariant on invalidation cost).
    pub fn erase_range(&self, start: u64, len: u64) -> Vec<BlockLink> {
        let range = GuestRange::new(start, len);
        let mut affected_pcs = HashSet::new();

        {
            let index = self.page_index.read();
            for page in range.first_page()..=range.last_page() {
                if let Some(pcs) = index.get(&page) {
                    affected_pcs.extend(pcs.iter().copied());
                }
            }
        }

        let mut unpatch = Vec::new();
        for pc_value in affected_pcs {
            let pc = GuestPC::trusted(pc_value);
            unpatch.extend(self.erase(pc));
        }
        unpatch
    }

    /// Drops every mapping and resets the code arena (spec §4.1
    /// `clear`). Used on process-wide fork/exec boundaries.
    pub fn clear(&self) {
        self.l1.write().clear();
        self.overflow.write().clear();
        self.page_index.write().clear();
        self.links.write().clear();
        self.arena.clear();
    }

    pub fn stats(&self) -> (u64, u64, u64, u64) {
        (
            self.stats.hits.load(Ordering::Relaxed),
            self.stats.misses.load(Ordering::Relaxed),
            self.stats.insertions.load(Ordering::Relaxed),
            self.stats.erasures.load(Ordering::Relaxed),
        )
    }
}

fn empty_page_table() -> PageTable {
    std::array::from_fn(|_| None)
}
