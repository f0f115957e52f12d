//! Core configuration (spec §5 "Configuration" ambient stack).
//!
//! `CoreConfig` is a plain serde-friendly value the embedding driver builds
//! (by hand, or by parsing its own TOML file) and hands to
//! `Context::create_new_context`. The core never reads environment
//! variables or configuration files itself.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::types::{GuestMode, DEFAULT_GUEST64_VM_LIMIT};

/// Self-modifying-code detection strategy (spec §4.2 step 5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SmcMode {
    /// No guard instructions are emitted; the block is trusted not to be
    /// modified underneath the JIT. Invalidation still works via explicit
    /// `invalidate_guest_code_range` calls from the syscall layer.
    Off,
    /// Every lifted instruction is preceded by a `ValidateCode` guard that
    /// compares live guest bytes against the bytes seen at lift time.
    Full,
}

impl Default for SmcMode {
    fn default() -> Self {
        SmcMode::Off
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Whether guest code runs in 32-bit or 64-bit mode. Fixed for the
    /// lifetime of a `Context` (spec §9 Open Question #2).
    pub guest_mode: GuestMode,

    /// Upper bound used to size a 64-bit guest's `LookupCache` page table.
    /// Ignored in 32-bit mode, where `GUEST32_VM_SIZE` always applies.
    pub guest64_vm_limit: u64,

    /// Maximum guest instructions lifted into a single block before the
    /// `BlockBuilder` forces a block boundary.
    pub max_block_instructions: u32,

    /// Self-modifying-code detection strategy.
    pub smc_mode: SmcMode,

    /// Byte capacity of each thread's JIT code arena.
    pub code_arena_size: usize,

    /// Directory IR text dumps are written to, if any (spec §6 "Persisted
    /// state": `"<hex_rip>-{pre,post}.ir"`).
    pub ir_dump_dir: Option<PathBuf>,

    /// Directory an AOT object-code cache is persisted to/loaded from, if
    /// the `aot-cache` feature is enabled.
    pub aot_dir: Option<PathBuf>,

    /// Whether to write a `/tmp/perf-<pid>.map` symbol file for `perf`.
    pub write_perf_map: bool,

    /// Bound used by `ThreadManager::wait_for_idle_with_timeout` (spec §5).
    pub idle_wait_timeout_ms: u64,

    /// Extended per-instruction debug info threaded through `BlockBuilder`.
    pub extended_debug: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            guest_mode: GuestMode::Guest64,
            guest64_vm_limit: DEFAULT_GUEST64_VM_LIMIT,
            max_block_instructions: 256,
            smc_mode: SmcMode::Off,
            code_arena_size: 64 * 1024 * 1024,
            ir_dump_dir: None,
            aot_dir: None,
            write_perf_map: false,
            idle_wait_timeout_ms: 1_500,
            extended_debug: false,
        }
    }
}

impl CoreConfig {
    /// Parse a `CoreConfig` from a TOML document. The embedding driver is
    /// responsible for reading the file; the core only parses the bytes.
    pub fn from_toml_str(src: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(src)
    }
}
