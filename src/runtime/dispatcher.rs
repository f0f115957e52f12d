//! The host-side execution loop driving one guest thread (spec §4.6, C6).
//!
//! Grounded on `src/cpu.rs`'s execution-control section (pause/resume/
//! single-step/breakpoint checks wrapped around an interpreted-instruction
//! loop), translated from "check flags around one interpreted instruction"
//! to "check flags around one compiled block entry," per spec §4.6's
//! suspension-point rule: a guest thread may only suspend at block
//! boundaries, never inside a host basic block.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::{debug, trace, warn};

use crate::error::CacheError;
use crate::jit::{BlockBuilder, BlockMapping, CustomIRRegistry, FetchResult, IRListing, RAData};
use crate::runtime::invalidation::InvalidationProtocol;
use crate::runtime::thread_context::{DispatchState, SignalReason, ThreadContext};
use crate::types::{GuestPC, HostCodePtr};

/// Why `run_block` returned control to its caller instead of looping again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The JIT exited normally at a block boundary; the dispatcher should
    /// re-poll `signal_reason` and continue.
    BlockBoundary,
    Paused,
    Stopped,
    /// A `ValidateCode` guard failed: the stale block was evicted and the
    /// dispatcher should retry compilation at the same PC.
    SmcRetry,
    /// The back-end produced no host code; spec §6 "On fatal JIT-compile
    /// failure the core emulates a SIGILL."
    Fatal,
}

/// Distinguishes a recoverable block fault (retry after the SMC guard
/// evicted the stale mapping) from a fatal one (no back-end available, or
/// the decoder found nothing at `pc`), named per SPEC_FULL.md §4.6 since
/// neither spec.md's §4.2 guard description nor its §7 taxonomy gives this
/// distinction its own type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockFault {
    Retry,
    Fatal,
}

/// Compiles (or fetches a cached) host entry point for `pc`, running the
/// full §4.1-§4.5 pipeline on a `LookupCache` miss. Holds `invalidation`'s
/// shared compile guard for the whole call so an in-flight invalidation
/// sweep never observes a half-installed mapping (spec §4.9 step 1,
/// invariant 5, scenario E6).
pub fn compile_block(
    ctx: &ThreadContext,
    decoder: &dyn crate::interfaces::Decoder,
    registry: &CustomIRRegistry,
    config: &crate::config::CoreConfig,
    invalidation: &InvalidationProtocol,
    pc: GuestPC,
) -> Result<HostCodePtr, BlockFault> {
    let _compile_guard = invalidation.compile_guard();
    let builder = BlockBuilder::new(decoder, registry, config);
    let gdb_enabled = config.extended_debug;

    if let Some(mut ir) = builder.custom_handler_ir(pc) {
        let ra = ctx.pass_manager.run(&mut ir);
        // A custom handler isn't backed by guest memory, so there is no
        // guest byte range a write could invalidate (spec §4.2 step 2).
        return compile_and_insert(ctx, pc, &ir, Some(&ra), gdb_enabled, Vec::new());
    }

    let decoded = match builder.decode(pc) {
        Some(decoded) => decoded,
        None => {
            warn!("[Dispatcher] decode failed at {pc}, no instructions available");
            return Err(BlockFault::Fatal);
        }
    };

    // The block's guest byte coverage for invalidation purposes is the
    // decoded extent itself (spec §4.9 step 2b), independent of whether
    // `SmcMode::Full`'s `ValidateCode` guards were inserted.
    let covered_guest_ranges: Vec<crate::types::GuestRange> =
        decoded.iter().map(|block| crate::types::GuestRange::new(block.entry_pc.value(), block.total_length)).collect();

    // Spec §4.5: the content hash is computed over the decoded-region
    // bytes, so a self-modifying rewrite forces a fresh miss even though
    // `pc` itself is unchanged.
    let guest_bytes: Vec<u8> = decoded
        .iter()
        .flat_map(|block| block.instructions.iter().flat_map(|instr| instr.raw.iter().copied()))
        .collect();

    match ctx.capture_cache.pre_generate_ir_fetch(pc, &guest_bytes) {
        FetchResult::Hit { ir, ra, .. } => {
            trace!("[Dispatcher] IR capture cache hit for {pc}");
            compile_and_insert(ctx, pc, &ir, ra.as_deref(), gdb_enabled, covered_guest_ranges)
        }
        FetchResult::Miss { content_hash } => {
            let mut ir = builder.lift(&decoded);
            let ra = ctx.pass_manager.run(&mut ir);
            ctx.capture_cache.post_compile_code(pc, content_hash, ir.clone(), Some(ra.clone()), None);
            compile_and_insert(ctx, pc, &ir, Some(&ra), gdb_enabled, covered_guest_ranges)
        }
    }
}

/// Hands `ir`/`ra` to the back-end and installs the result in `lookup_cache`
/// (spec §2 data flow). On `CacheError::ArenaExhausted` the cache (and its
/// arena) is cleared and compilation is retried exactly once, per spec
/// §4.1's "insert exceeds arena capacity -> clear and retry once" edge case
/// and §7 item 4. `covered_guest_ranges` is the decoded-byte extent
/// `compile_block` computed, not derived from `ValidateCode` guards (those
/// are only present under `SmcMode::Full` and must not gate whether
/// `invalidate_guest_code_range` can find this mapping at all, spec §4.9
/// step 2b).
fn compile_and_insert(
    ctx: &ThreadContext,
    pc: GuestPC,
    ir: &IRListing,
    ra: Option<&RAData>,
    gdb_enabled: bool,
    covered_guest_ranges: Vec<crate::types::GuestRange>,
) -> Result<HostCodePtr, BlockFault> {
    let mut backend = ctx.backend.lock().unwrap();
    let arena = ctx.lookup_cache.arena();

    let result = match backend.compile_code(pc, ir, ra, gdb_enabled, arena) {
        Err(CacheError::ArenaExhausted { requested, available }) => {
            warn!(
                "[Dispatcher] code arena exhausted for {pc} (requested {requested}, available {available}); clearing cache and retrying once"
            );
            ctx.lookup_cache.clear();
            backend.compile_code(pc, ir, ra, gdb_enabled, arena)
        }
        other => other,
    };

    match result {
        Ok((host_ptr, _debug)) => {
            ctx.lookup_cache.insert(BlockMapping {
                entry_pc: pc,
                host_entry: host_ptr,
                covered_guest_ranges,
                outgoing_links: Vec::new(),
            });
            Ok(host_ptr)
        }
        Err(err) => {
            warn!("[Dispatcher] back-end produced no code for {pc}: {err}");
            Err(BlockFault::Fatal)
        }
    }
}

/// Runs the dispatch loop for one guest thread until it suspends for any
/// reason (spec §4.6 pseudocode). The caller (`ThreadManager`'s host
/// thread entry point) is responsible for looping back in on
/// `ExitReason::BlockBoundary`. Transitions `ctx`'s `DispatchState` at
/// every suspension point (spec §4.6 state machine).
pub fn run_block(
    ctx: &Arc<ThreadContext>,
    decoder: &dyn crate::interfaces::Decoder,
    registry: &CustomIRRegistry,
    config: &crate::config::CoreConfig,
    invalidation: &InvalidationProtocol,
    enter_jit: impl FnOnce(HostCodePtr, &ThreadContext) -> GuestPC,
) -> ExitReason {
    if matches!(ctx.dispatch_state(), DispatchState::Waiting | DispatchState::Paused) {
        ctx.set_dispatch_state(DispatchState::Running);
    }

    match ctx.signal_reason.get() {
        SignalReason::Pause => {
            ctx.signal_reason.clear();
            ctx.set_dispatch_state(DispatchState::Paused);
            trace!("[Dispatcher] thread {} observed Pause", ctx.tid);
            return ExitReason::Paused;
        }
        SignalReason::Stop => {
            ctx.set_dispatch_state(DispatchState::Stopping);
            trace!("[Dispatcher] thread {} observed Stop", ctx.tid);
            return ExitReason::Stopped;
        }
        SignalReason::Signal => {
            return deliver_guest_signal(ctx, decoder, registry, config, invalidation, enter_jit);
        }
        _ => {}
    }

    let pc = ctx.guest_pc();
    let host_ptr = match ctx.lookup_cache.find(pc) {
        Some(ptr) => ptr,
        None => match compile_block(ctx, decoder, registry, config, invalidation, pc) {
            Ok(ptr) => ptr,
            Err(BlockFault::Retry) => return ExitReason::SmcRetry,
            Err(BlockFault::Fatal) => return ExitReason::Fatal,
        },
    };

    let next_pc = enter_jit(host_ptr, ctx);
    ctx.set_guest_pc(next_pc);
    debug!("[Dispatcher] thread {} resumed at {next_pc}", ctx.tid);

    if ctx.single_step.swap(false, Ordering::AcqRel) {
        trace!("[Dispatcher] thread {} completing single step, re-requesting Pause", ctx.tid);
        ctx.signal_reason.request(SignalReason::Pause);
    }

    ExitReason::BlockBoundary
}

/// Transfers control into a registered guest signal handler via a nested
/// `run_block` entry (spec §4.6 item 3). Saves the interrupted PC so a
/// later guest sigreturn can restore it (item 4). Full guest-ABI frame
/// construction (mcontext/uc_stack/siginfo) is a back-end concern out of
/// scope for this core (spec §1); only the PC redirect and the
/// `DispatchState` transition live here.
fn deliver_guest_signal(
    ctx: &Arc<ThreadContext>,
    decoder: &dyn crate::interfaces::Decoder,
    registry: &CustomIRRegistry,
    config: &crate::config::CoreConfig,
    invalidation: &InvalidationProtocol,
    enter_jit: impl FnOnce(HostCodePtr, &ThreadContext) -> GuestPC,
) -> ExitReason {
    let handler_pc = match ctx.take_pending_signal_pc() {
        Some(pc) => pc,
        None => {
            warn!("[Dispatcher] thread {} observed Signal with no pending handler PC, ignoring", ctx.tid);
            ctx.signal_reason.clear();
            return ExitReason::BlockBoundary;
        }
    };

    let prior_state = ctx.enter_signal(ctx.guest_pc());
    ctx.signal_reason.clear();
    ctx.set_guest_pc(handler_pc);
    trace!("[Dispatcher] thread {} entering guest signal handler at {handler_pc}", ctx.tid);

    let exit = run_block(ctx, decoder, registry, config, invalidation, enter_jit);

    if ctx.dispatch_state() == DispatchState::InSignal {
        ctx.set_dispatch_state(prior_state);
    }
    exit
}
