//! Crate-wide error taxonomy (spec §7).

use crate::types::GuestMode;

/// Errors raised by the `LookupCache` (spec §4.1).
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    #[error("code arena exhausted (requested {requested} bytes, {available} available)")]
    ArenaExhausted { requested: usize, available: usize },
    #[error("no mapping exists for target pc {target:#x}, cannot install block link")]
    NoSuchTarget { target: u64 },
}

/// Errors raised while lifting or compiling a block (spec §4.2, §7 items 1-2).
#[derive(Debug, Clone, thiserror::Error)]
pub enum JitError {
    #[error("decode failed at {pc:#x}: {reason}")]
    DecodeFailure { pc: u64, reason: String },
    #[error("back-end produced no host code for block at {pc:#x}")]
    CompileFailure { pc: u64 },
    #[error("dispatch error at {pc:#x}: {reason}")]
    DispatchError { pc: u64, reason: String },
}

/// Startup misconfiguration (spec §7 item 3). Always surfaced by panicking
/// out of `init_core`/`Context::create_new_context`, never returned across
/// a JIT boundary.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("no CpuBackend available for this host architecture")]
    NoBackend,
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level crate error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CoreError {
    #[error("guest pc {value:#x} invalid for {mode:?}: upper bits must be zero in 32-bit mode")]
    InvalidGuestPc { value: u64, mode: GuestMode },
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Jit(#[from] JitError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}
