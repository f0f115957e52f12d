//! Per-thread execution: dispatch loop, thread lifecycle, and cross-thread
//! invalidation (spec §4.6-§4.9).

pub mod dispatcher;
pub mod invalidation;
pub mod thread_context;
pub mod thread_manager;

pub use dispatcher::{compile_block, run_block, BlockFault, ExitReason};
pub use invalidation::{InvalidationProtocol, InvalidationTrigger};
pub use thread_context::{DispatchState, PauseGate, Registers, SignalReason, SignalReasonCell, ThreadContext};
pub use thread_manager::{ThreadManager, IDLE_WAIT_TIMEOUT};
