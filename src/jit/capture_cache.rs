//! Memoizes lifted-and-optimized IR across re-translation (spec §4.5, C5).
//!
//! Grounded on `src/jit/nready.rs` ("NReady!" persistence cache: IR plus
//! native code plus metadata, keyed by block identity, reader/writer
//! locked, a same-generation version gate before trusting persisted native
//! code) — the closest teacher analogue to "memoize a lift, optionally seed
//! an on-disk cache, and refuse to trust stale native code across a
//! generation bump."

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use sha2::{Digest, Sha256};

use crate::jit::backend::DebugData;
use crate::jit::ir::{IRListing, RAData, SharedListing};
use crate::types::GuestPC;

/// Current on-disk format generation. Bumped whenever the byte layout
/// written by `store_aot_entry` changes; `load_aot_index` refuses entries
/// from a different generation rather than guessing compatibility, mirroring
/// the teacher's "same-generation only" native-code reuse gate.
const AOT_GENERATION: u32 = 1;

fn content_hash(bytes: &[u8]) -> u64 {
    let digest = Sha256::digest(bytes);
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(buf)
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
struct CacheKey {
    pc: u64,
    content_hash: u64,
}

struct Entry {
    ir: SharedListing,
    ra: Option<Arc<RAData>>,
    debug: Option<DebugData>,
}

/// Process-wide memo of `(guest PC, content hash) -> lifted IR` (spec §4.5).
/// Readers take a shared lock; a new entry takes an exclusive lock only for
/// the duration of the insert (spec §4.5 "readers acquire a shared lock,
/// writers acquire exclusive").
pub struct IRCaptureCache {
    entries: RwLock<HashMap<CacheKey, Entry>>,
    aot_dir: Option<PathBuf>,
}

/// Result of `pre_generate_ir_fetch`: either a cache hit with everything a
/// caller needs to skip lifting and codegen, or a miss that also reports
/// the content hash the caller must pass to `post_compile_code`.
pub enum FetchResult {
    Hit { ir: SharedListing, ra: Option<Arc<RAData>>, debug: Option<DebugData> },
    Miss { content_hash: u64 },
}

impl IRCaptureCache {
    pub fn new(aot_dir: Option<PathBuf>) -> Self {
        IRCaptureCache { entries: RwLock::new(HashMap::new()), aot_dir }
    }

    /// Spec §4.5 `pre_generate_ir_fetch`: looks up a memoized lift for `pc`
    /// over `guest_bytes` (the bytes the decoder would read at `pc`, hashed
    /// to detect a re-lift forced by self-modifying code).
    pub fn pre_generate_ir_fetch(&self, pc: GuestPC, guest_bytes: &[u8]) -> FetchResult {
        let key = CacheKey { pc: pc.value(), content_hash: content_hash(guest_bytes) };
        let entries = self.entries.read().unwrap();
        match entries.get(&key) {
            Some(entry) => FetchResult::Hit {
                ir: Arc::clone(&entry.ir),
                ra: entry.ra.clone(),
                debug: entry.debug.clone(),
            },
            None => FetchResult::Miss { content_hash: key.content_hash },
        }
    }

    /// Spec §4.5 `post_compile_code`: records a freshly-compiled entry.
    /// Returns `true` if the caller should treat this as an early-exit (the
    /// entry was already present, e.g. a race with another compiling
    /// thread lost; the core keeps the existing entry rather than
    /// overwriting it, since both lifts are equally valid but only one
    /// `IRListing` should be the system of record for a given key).
    pub fn post_compile_code(
        &self,
        pc: GuestPC,
        content_hash: u64,
        ir: IRListing,
        ra: Option<RAData>,
        debug: Option<DebugData>,
    ) -> bool {
        let key = CacheKey { pc: pc.value(), content_hash };
        let mut entries = self.entries.write().unwrap();
        if entries.contains_key(&key) {
            return true;
        }
        entries.insert(
            key,
            Entry { ir: Arc::new(ir), ra: ra.map(Arc::new), debug },
        );
        false
    }

    /// Drops every memoized entry (spec §4.1-adjacent `clear` semantics
    /// extended to this cache on a process-wide fork/exec boundary).
    pub fn clear(&self) {
        self.entries.write().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Persists one compiled block's object code to `aot_dir`, if
    /// configured. Layout: `[generation: u32 LE][pc: u64 LE]
    /// [content_hash: u64 LE][len: u32 LE][bytes...]`, length-prefixed per
    /// field in the teacher's own disk-format convention rather than an
    /// external serialization crate, since the format is intentionally
    /// opaque to everything but this cache (spec §6: "format is back-end
    /// specific, the core only carries opaque bytes").
    pub fn store_aot_entry(&self, pc: GuestPC, content_hash: u64, object_code: &[u8]) -> std::io::Result<()> {
        let dir = match &self.aot_dir {
            Some(d) => d,
            None => return Ok(()),
        };
        std::fs::create_dir_all(dir)?;
        let path = entry_path(dir, pc, content_hash);
        let mut file = std::fs::File::create(path)?;
        file.write_all(&AOT_GENERATION.to_le_bytes())?;
        file.write_all(&pc.value().to_le_bytes())?;
        file.write_all(&content_hash.to_le_bytes())?;
        file.write_all(&(object_code.len() as u32).to_le_bytes())?;
        file.write_all(object_code)?;
        Ok(())
    }

    /// Loads a previously-persisted entry, if present and written by this
    /// same `AOT_GENERATION`. A generation mismatch is treated as a miss,
    /// never an error: stale caches are simply regenerated (spec §4.5
    /// "same-generation only" gate).
    pub fn load_aot_index(&self, pc: GuestPC, content_hash: u64) -> Option<Vec<u8>> {
        let dir = self.aot_dir.as_ref()?;
        let path = entry_path(dir, pc, content_hash);
        let mut file = std::fs::File::open(path).ok()?;

        let mut generation = [0u8; 4];
        file.read_exact(&mut generation).ok()?;
        if u32::from_le_bytes(generation) != AOT_GENERATION {
            return None;
        }

        let mut pc_bytes = [0u8; 8];
        file.read_exact(&mut pc_bytes).ok()?;
        let mut hash_bytes = [0u8; 8];
        file.read_exact(&mut hash_bytes).ok()?;
        if u64::from_le_bytes(pc_bytes) != pc.value() || u64::from_le_bytes(hash_bytes) != content_hash {
            return None;
        }

        let mut len_bytes = [0u8; 4];
        file.read_exact(&mut len_bytes).ok()?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        let mut bytes = vec![0u8; len];
        file.read_exact(&mut bytes).ok()?;
        Some(bytes)
    }
}

fn entry_path(dir: &Path, pc: GuestPC, content_hash: u64) -> PathBuf {
    dir.join(format!("{:016x}-{:016x}.aotblk", pc.value(), content_hash))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_misses_then_hits_after_post_compile() {
        let cache = IRCaptureCache::new(None);
        let pc = GuestPC::new(0x1000, crate::types::GuestMode::Guest64).unwrap();
        let bytes = [0x90u8, 0x90, 0xc3];

        let hash = match cache.pre_generate_ir_fetch(pc, &bytes) {
            FetchResult::Miss { content_hash } => content_hash,
            FetchResult::Hit { .. } => panic!("expected miss on empty cache"),
        };

        let early_exit = cache.post_compile_code(pc, hash, IRListing::new(), None, None);
        assert!(!early_exit);

        match cache.pre_generate_ir_fetch(pc, &bytes) {
            FetchResult::Hit { .. } => {}
            FetchResult::Miss { .. } => panic!("expected hit after post_compile_code"),
        }
    }

    #[test]
    fn different_content_hash_is_a_fresh_miss_after_smc() {
        let cache = IRCaptureCache::new(None);
        let pc = GuestPC::new(0x1000, crate::types::GuestMode::Guest64).unwrap();
        let original = [0x90u8, 0x90, 0xc3];
        let modified = [0xccu8, 0x90, 0xc3];

        let hash = match cache.pre_generate_ir_fetch(pc, &original) {
            FetchResult::Miss { content_hash } => content_hash,
            _ => unreachable!(),
        };
        cache.post_compile_code(pc, hash, IRListing::new(), None, None);

        match cache.pre_generate_ir_fetch(pc, &modified) {
            FetchResult::Miss { .. } => {}
            FetchResult::Hit { .. } => panic!("modified bytes must not hit the stale entry"),
        }
    }

    #[test]
    fn aot_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let cache = IRCaptureCache::new(Some(dir.path().to_path_buf()));
        let pc = GuestPC::new(0x2000, crate::types::GuestMode::Guest64).unwrap();
        let object_code = vec![0xde, 0xad, 0xbe, 0xef];

        cache.store_aot_entry(pc, 42, &object_code).unwrap();
        let loaded = cache.load_aot_index(pc, 42).unwrap();
        assert_eq!(loaded, object_code);
    }

    #[test]
    fn aot_load_misses_for_unknown_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = IRCaptureCache::new(Some(dir.path().to_path_buf()));
        let pc = GuestPC::new(0x3000, crate::types::GuestMode::Guest64).unwrap();
        assert!(cache.load_aot_index(pc, 7).is_none());
    }

    #[test]
    fn clear_drops_memoized_entries() {
        let cache = IRCaptureCache::new(None);
        let pc = GuestPC::new(0x4000, crate::types::GuestMode::Guest64).unwrap();
        let hash = match cache.pre_generate_ir_fetch(pc, b"abc") {
            FetchResult::Miss { content_hash } => content_hash,
            _ => unreachable!(),
        };
        cache.post_compile_code(pc, hash, IRListing::new(), None, None);
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
    }
}
