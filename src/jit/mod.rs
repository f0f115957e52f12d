//! Translation pipeline: lift guest code to IR, optimize, register-allocate,
//! hand off to a host back-end, and cache the result (spec §4.1-§4.5).

pub mod backend;
pub mod block_builder;
pub mod capture_cache;
pub mod ir;
pub mod lookup_cache;
pub mod pass_manager;
pub mod regalloc;

pub use backend::{CachedObjectCode, CpuBackend, DebugData};
pub use block_builder::{BlockBuilder, CustomIRHandler, CustomIRRegistry};
pub use capture_cache::{FetchResult, IRCaptureCache};
pub use ir::{Assignment, IRListing, IrBlock, IrInstr, IrOp, RAData, SharedListing, ValueClass, VReg};
pub use lookup_cache::{BlockLink, BlockMapping, LookupCache};
pub use pass_manager::PassManager;
pub use regalloc::RegAllocConfig;
