//! Per-guest-thread execution state (spec §4.7, C7).
//!
//! Grounded on `src/cpu.rs::VirtualCpu` (hot flags kept in `AtomicBool`s,
//! full register state behind an `RwLock`, a `(Mutex<bool>, Condvar)` pair
//! for pause/resume) — the same split is used here, with the single
//! `SignalReason` atomic replacing the teacher's several independent
//! atomic flags per spec §4.7's narrower, prioritized state value.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::config::CoreConfig;
use crate::jit::{CpuBackend, IRCaptureCache, LookupCache, PassManager};
use crate::types::GuestPC;

/// The running thread's coarse execution state (spec §4.6 state machine).
/// `InSignal` is tracked alongside `Running` rather than as a fully
/// distinct code path: nested guest signal delivery re-enters `run_block`
/// with a saved resume state, per spec §4.6 item 3 ("transfers control via
/// a nested dispatcher entry").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Waiting,
    Running,
    Paused,
    InSignal,
    Stopping,
    Terminated,
}

/// Guest general-purpose and vector register file. Field names and widths
/// are intentionally generic (`gpr`/`vector`) rather than x86-specific,
/// since the concrete register mapping is a `Decoder`/`CpuBackend` concern
/// this core never interprets (spec §1).
#[derive(Debug, Clone)]
pub struct Registers {
    pub gpr: [u64; 16],
    pub vector: Vec<[u8; 16]>,
    pub flags: u64,
    pub rip: u64,
}

impl Registers {
    pub fn new(vector_width: usize) -> Self {
        Registers {
            gpr: [0; 16],
            vector: vec![[0u8; 16]; vector_width],
            flags: 0,
            rip: 0,
        }
    }
}

/// Priority-ordered delivery reason set on a thread's `SignalReason` atomic
/// (spec §3 invariant "only the owning thread clears it; any other agent
/// may only set it to a value of equal or higher priority").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SignalReason {
    None = 0,
    Return = 1,
    Signal = 2,
    Pause = 3,
    Stop = 4,
}

impl SignalReason {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SignalReason::None,
            1 => SignalReason::Return,
            2 => SignalReason::Signal,
            3 => SignalReason::Pause,
            _ => SignalReason::Stop,
        }
    }
}

/// Atomic holder for `SignalReason` enforcing the priority-ratchet rule
/// (spec §3 invariant 3, §5 P4): a `request` only takes effect if it is of
/// equal or higher priority than whatever is currently set. Only
/// `clear_if_owner` (called by the owning thread at its suspension point)
/// ever lowers the value.
#[derive(Debug, Default)]
pub struct SignalReasonCell(AtomicU8);

impl SignalReasonCell {
    pub fn new() -> Self {
        SignalReasonCell(AtomicU8::new(SignalReason::None as u8))
    }

    pub fn get(&self) -> SignalReason {
        SignalReason::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Sets `reason` iff it outranks (or matches) the current value.
    /// Returns `true` if the value changed.
    pub fn request(&self, reason: SignalReason) -> bool {
        loop {
            let current = self.0.load(Ordering::Acquire);
            if reason as u8 <= current && SignalReason::from_u8(current) != SignalReason::None {
                return false;
            }
            if self
                .0
                .compare_exchange(current, reason as u8, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Clears the reason back to `None`. Only the owning thread, at its own
    /// suspension point, should call this (spec §3 invariant 3).
    pub fn clear(&self) {
        self.0.store(SignalReason::None as u8, Ordering::Release);
    }
}

/// Pause/resume coordination for one thread, mirroring the teacher's
/// `(Mutex<bool>, Condvar)` pattern in `VirtualCpu` for blocking a thread
/// until explicitly resumed.
#[derive(Default)]
pub struct PauseGate {
    paused: Mutex<bool>,
    cv: Condvar,
}

impl PauseGate {
    pub fn new() -> Self {
        PauseGate { paused: Mutex::new(false), cv: Condvar::new() }
    }

    pub fn park(&self) {
        let mut guard = self.paused.lock().unwrap();
        *guard = true;
        while *guard {
            guard = self.cv.wait(guard).unwrap();
        }
    }

    pub fn resume(&self) {
        let mut guard = self.paused.lock().unwrap();
        *guard = false;
        self.cv.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.lock().unwrap()
    }
}

/// Per-guest-thread state (spec §4.7). Owns its `LookupCache`,
/// `BlockBuilder` inputs, `PassManager`, and `CpuBackend`; holds a shared
/// `Arc` to the process-wide `IRCaptureCache`. Must not move in memory
/// while `running` since compiled JIT code captures its address — callers
/// construct it inside an `Arc` and never hand out an owned value.
pub struct ThreadContext {
    pub pid: u64,
    pub tid: u64,
    pub parent_tid: u64,
    pub registers: Mutex<Registers>,
    pub signal_reason: SignalReasonCell,
    pub pause_gate: PauseGate,
    pub early_exit: std::sync::atomic::AtomicBool,
    pub lookup_cache: LookupCache,
    pub pass_manager: PassManager,
    pub backend: Mutex<Box<dyn CpuBackend>>,
    pub capture_cache: Arc<IRCaptureCache>,
    /// Set by `ThreadManager::step` and cleared by the dispatcher after
    /// exactly one more block boundary, at which point it re-requests
    /// `SignalReason::Pause` (spec §4.8 `step`, spec.md line 322:
    /// "coroutine-like pause/step/stop").
    pub single_step: AtomicBool,
    dispatch_state: Mutex<DispatchState>,
    /// Interrupted guest PCs saved across nested guest-signal-handler
    /// dispatcher entries (spec §4.6 item 1 "save context"). The top of the
    /// stack is the PC to resume at on the next guest sigreturn.
    signal_return_stack: Mutex<Vec<GuestPC>>,
    /// The guest handler entry PC a pending `SignalReason::Signal` should
    /// transfer control to; set by the driver's `SignalDelegator` before
    /// requesting the signal, consumed by the dispatcher.
    pending_signal_pc: Mutex<Option<GuestPC>>,
    guest_pc: AtomicU64,
}

impl ThreadContext {
    pub fn new(
        pid: u64,
        tid: u64,
        parent_tid: u64,
        config: &CoreConfig,
        backend: Box<dyn CpuBackend>,
        capture_cache: Arc<IRCaptureCache>,
    ) -> Arc<Self> {
        Arc::new(ThreadContext {
            pid,
            tid,
            parent_tid,
            registers: Mutex::new(Registers::new(16)),
            signal_reason: SignalReasonCell::new(),
            pause_gate: PauseGate::new(),
            early_exit: std::sync::atomic::AtomicBool::new(false),
            lookup_cache: LookupCache::new(config.guest_mode, config.guest64_vm_limit, config.code_arena_size),
            pass_manager: PassManager::standard(crate::jit::RegAllocConfig::default()),
            backend: Mutex::new(backend),
            capture_cache,
            single_step: AtomicBool::new(false),
            dispatch_state: Mutex::new(DispatchState::Waiting),
            signal_return_stack: Mutex::new(Vec::new()),
            pending_signal_pc: Mutex::new(None),
            guest_pc: AtomicU64::new(0),
        })
    }

    pub fn is_root(&self) -> bool {
        self.parent_tid == 0
    }

    pub fn guest_pc(&self) -> GuestPC {
        GuestPC::trusted(self.guest_pc.load(Ordering::Acquire))
    }

    pub fn set_guest_pc(&self, pc: GuestPC) {
        self.guest_pc.store(pc.value(), Ordering::Release);
    }

    pub fn dispatch_state(&self) -> DispatchState {
        *self.dispatch_state.lock().unwrap()
    }

    pub fn set_dispatch_state(&self, state: DispatchState) {
        *self.dispatch_state.lock().unwrap() = state;
    }

    /// Requests delivery of a guest signal whose handler lives at
    /// `handler_pc`. The dispatcher picks this up on its next poll of
    /// `signal_reason` (spec §4.6 item 3).
    pub fn request_signal_delivery(&self, handler_pc: GuestPC) {
        *self.pending_signal_pc.lock().unwrap() = Some(handler_pc);
        self.signal_reason.request(SignalReason::Signal);
    }

    pub(crate) fn take_pending_signal_pc(&self) -> Option<GuestPC> {
        self.pending_signal_pc.lock().unwrap().take()
    }

    /// Saves `interrupted_pc` and the prior `DispatchState` before
    /// transferring control into a guest signal handler (spec §4.6 item 1).
    /// Returns the prior state so the caller can restore it once the nested
    /// dispatcher entry returns.
    pub(crate) fn enter_signal(&self, interrupted_pc: GuestPC) -> DispatchState {
        self.signal_return_stack.lock().unwrap().push(interrupted_pc);
        let prior = self.dispatch_state();
        self.set_dispatch_state(DispatchState::InSignal);
        prior
    }

    /// Spec §4.6 item 4: pops the PC saved by `enter_signal` so the
    /// dispatcher can resume at the point the signal interrupted (or
    /// wherever the handler last wrote the guest PC, if it's already been
    /// applied by the caller before calling this).
    pub fn guest_sigreturn(&self) -> Option<GuestPC> {
        self.signal_return_stack.lock().unwrap().pop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_reason_ratchet_rejects_lower_priority_requests() {
        let cell = SignalReasonCell::new();
        assert!(cell.request(SignalReason::Pause));
        assert!(!cell.request(SignalReason::Return));
        assert_eq!(cell.get(), SignalReason::Pause);
    }

    #[test]
    fn signal_reason_ratchet_accepts_higher_priority_requests() {
        let cell = SignalReasonCell::new();
        assert!(cell.request(SignalReason::Pause));
        assert!(cell.request(SignalReason::Stop));
        assert_eq!(cell.get(), SignalReason::Stop);
    }

    #[test]
    fn clear_resets_to_none() {
        let cell = SignalReasonCell::new();
        cell.request(SignalReason::Pause);
        cell.clear();
        assert_eq!(cell.get(), SignalReason::None);
    }

    #[test]
    fn enter_signal_saves_pc_and_guest_sigreturn_restores_it() {
        use crate::config::CoreConfig;
        use crate::jit::IRCaptureCache;

        struct NoopBackend;
        impl CpuBackend for NoopBackend {
            fn compile_code(
                &mut self,
                _: GuestPC,
                _: &crate::jit::IRListing,
                _: Option<&crate::jit::RAData>,
                _: bool,
                _: &crate::arena::CodeArena,
            ) -> Result<(crate::types::HostCodePtr, crate::jit::DebugData), crate::error::CacheError> {
                Err(crate::error::CacheError::ArenaExhausted { requested: 0, available: 0 })
            }
            fn relocate_jit_object_code(
                &mut self,
                _: GuestPC,
                _: &crate::jit::CachedObjectCode,
                _: &crate::arena::CodeArena,
            ) -> Option<crate::types::HostCodePtr> {
                None
            }
            fn clear_cache(&mut self) {}
            fn clear_relocations(&mut self) {}
            fn initialize(&mut self) {}
        }

        let config = CoreConfig::default();
        let ctx = ThreadContext::new(1, 1, 0, &config, Box::new(NoopBackend), Arc::new(IRCaptureCache::new(None)));
        let interrupted = GuestPC::new(0x1000, config.guest_mode).unwrap();

        let prior = ctx.enter_signal(interrupted);
        assert_eq!(prior, DispatchState::Waiting);
        assert_eq!(ctx.dispatch_state(), DispatchState::InSignal);
        assert_eq!(ctx.guest_sigreturn(), Some(interrupted));
        assert_eq!(ctx.guest_sigreturn(), None);
    }

    #[test]
    fn pause_gate_resume_releases_parked_thread() {
        let gate = Arc::new(PauseGate::new());
        let g2 = Arc::clone(&gate);
        let handle = std::thread::spawn(move || g2.park());
        while !gate.is_paused() {
            std::thread::yield_now();
        }
        gate.resume();
        handle.join().unwrap();
    }
}
