//! Externally-implemented collaborators (spec §6 "Consumed").
//!
//! The guest instruction table, the per-opcode decoder, guest syscall
//! emulation, and signal delegation are deliberately out of scope for this
//! core (spec §1). They are reached only through the traits in this module.
//! Shapes are grounded on the teacher's `jit::decoder::DecodedInstr` (field
//! layout trimmed to what the core, rather than a concrete x86 decoder,
//! needs) and `jit::async_runtime::CodeCacheInstaller` (an existing narrow
//! trait boundary between the JIT core and an external installer).

use crate::types::GuestPC;

/// One decoded guest instruction, as produced by an external `Decoder`.
/// The core never interprets `raw` itself; it is carried through so a
/// `BlockBuilder`'s SMC guard (`ValidateCode`) can compare against it.
#[derive(Debug, Clone)]
pub struct DecodedInstr {
    pub pc: GuestPC,
    pub length: u8,
    pub raw: Vec<u8>,
    /// Opaque key the external opcode dispatcher uses to find its handler;
    /// the core passes it through `BlockBuilder` to whatever emits IR for
    /// this instruction without interpreting it.
    pub table_key: u32,
    pub is_branch: bool,
    pub is_call: bool,
    pub is_return: bool,
    pub is_privileged: bool,
}

/// A lifted run of guest instructions, as produced by
/// `Decoder::decode_instructions_at_entry` (spec §6).
#[derive(Debug, Clone)]
pub struct DecodedBlock {
    pub entry_pc: GuestPC,
    pub instructions: Vec<DecodedInstr>,
    pub total_length: u64,
    /// Set when the decoder stopped because it hit an unconditional
    /// control transfer (spec §3 `DecodedBlock`).
    pub terminated_unconditionally: bool,
}

/// The external guest instruction decoder (spec §6).
pub trait Decoder: Send + Sync {
    /// Decode guest code starting at `pc`, returning one or more
    /// `DecodedBlock`s (the decoder may fold fall-through blocks into a
    /// single multi-block lift, spec §4.2 step 3).
    fn decode_instructions_at_entry(&self, pc: GuestPC) -> Vec<DecodedBlock>;
}

/// The external guest syscall emulation layer (spec §6).
pub trait SyscallHandler: Send + Sync {
    /// Handle a guest syscall; `args` are the guest ABI's argument
    /// registers, the return value is written back into the guest's
    /// return-value register by the caller.
    fn handle_syscall(&self, frame: &mut crate::runtime::thread_context::Registers, args: [u64; 6]) -> u64;

    /// Consulted on an AOT-enabled build to short-circuit a compile miss.
    fn lookup_aotir_cache_entry(&self, pc: GuestPC) -> Option<Vec<u8>>;

    /// Marks `[start, start+len)` as containing executable guest code so
    /// the syscall layer can install a write trap for SMC detection.
    fn mark_guest_executable_range(&self, start: u64, len: u64);
}

/// Host signal plumbing the core relies on to deliver guest signals and to
/// implement the cross-thread pause signal (spec §5, §6).
pub trait SignalDelegator: Send + Sync {
    fn register_host_signal_handler(&self, signum: i32, required: bool);
    fn register_host_signal_handler_for_guest(&self, signum: i32);
    fn check_xid_handler(&self);
    fn register_tls_state(&self, tid: u64);
    fn uninstall_tls_state(&self, tid: u64);
}

/// Host OS thread primitives, consumed by `ThreadManager` (spec §6
/// `Threads::Thread`).
pub trait HostThreadOps: Send + Sync {
    fn create(&self, entry: Box<dyn FnOnce() + Send>) -> u64;
    fn join(&self, handle: u64);
    fn detach(&self, handle: u64);
    fn cleanup_after_fork(&self);
    fn is_self(&self, handle: u64) -> bool;
}
