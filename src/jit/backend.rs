//! The host back-end contract (spec §4.4, C4).
//!
//! Per-host-arch code generation is out of scope for this core (spec §1);
//! only the trait boundary lives here. Grounded on the teacher's
//! `jit::codegen::CodeGen` (the shape of "consume IR, produce a code
//! fragment with relocations, report size back to the cache") and
//! `jit::async_runtime::CodeCacheInstaller` (an existing narrow trait
//! separating the JIT core from code installation).

use crate::arena::CodeArena;
use crate::error::CacheError;
use crate::jit::ir::{IRListing, RAData};
use crate::types::{GuestPC, HostCodePtr};

/// Relocation and size metadata a back-end reports alongside compiled code
/// so the `InvalidationProtocol` and an optional AOT cache can operate on
/// opaque bytes without understanding the host ISA (spec §4.4 item 3).
#[derive(Debug, Clone, Default)]
pub struct DebugData {
    pub host_size: u32,
    pub relocations: Vec<u8>,
    pub symbol_name: Option<String>,
}

/// A previously-serialized compiled block, as loaded from an AOT cache.
#[derive(Debug, Clone)]
pub struct CachedObjectCode {
    pub bytes: Vec<u8>,
    pub debug: DebugData,
}

/// The host back-end (spec §4.4). Implementations are per-host-architecture
/// and are treated as opaque by the core; the core only relies on the three
/// guarantees listed on each method.
pub trait CpuBackend: Send + Sync {
    /// Emit machine code for `ir`, apply relocations, and return an entry
    /// pointer allocated out of `arena`.
    ///
    /// Guarantees the core relies on:
    /// 1. The returned pointer is callable with the host ABI the dispatcher
    ///    establishes (a pointer to the owning `ThreadContext` is placed in
    ///    a known host register on entry).
    /// 2. `debug_data` reports host code size and relocations accurately.
    /// 3. On arena exhaustion this returns `Err(CacheError::ArenaExhausted
    ///    { .. })` rather than any other error, so the dispatcher can clear
    ///    the cache and retry once (spec §4.1 edge case, §7 item 4).
    fn compile_code(
        &mut self,
        guest_pc: GuestPC,
        ir: &IRListing,
        ra_data: Option<&RAData>,
        gdb_enabled: bool,
        arena: &CodeArena,
    ) -> Result<(HostCodePtr, DebugData), CacheError>;

    /// Rehydrate a previously-serialized block (AOT cache hit). Returns
    /// `None` if the serialized generation doesn't match this back-end's
    /// current generation (spec §6 "Persisted state").
    fn relocate_jit_object_code(
        &mut self,
        guest_pc: GuestPC,
        cached: &CachedObjectCode,
        arena: &CodeArena,
    ) -> Option<HostCodePtr>;

    fn clear_cache(&mut self);
    fn clear_relocations(&mut self);
    fn initialize(&mut self);
}
