//! Core address and sizing types shared across the translation pipeline.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Page granularity used by the `LookupCache`'s sparse page table and by
/// guest-range invalidation. Matches the host's native page size on the
/// platforms this core targets.
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: u32 = 12;

/// Upper bound on a 32-bit guest's virtual address space: the page table
/// must be sized to cover it regardless of host address-space layout
/// (spec §9 Open Question #2).
pub const GUEST32_VM_SIZE: u64 = 1 << 32;

/// Default upper bound used to size the page table for 64-bit guests.
/// Configurable via `CoreConfig::guest64_vm_limit`.
pub const DEFAULT_GUEST64_VM_LIMIT: u64 = 1 << 40;

/// Whether a thread's code is 32-bit or 64-bit guest code. Threaded through
/// `ThreadContext` and `LookupCache::new` so the cache can size its page
/// table without guessing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GuestMode {
    Guest32,
    Guest64,
}

impl GuestMode {
    pub fn vm_size(self, guest64_vm_limit: u64) -> u64 {
        match self {
            GuestMode::Guest32 => GUEST32_VM_SIZE,
            GuestMode::Guest64 => guest64_vm_limit,
        }
    }
}

/// A 64-bit guest program counter.
///
/// In 32-bit guest mode the upper 32 bits must be zero; `GuestPC::new`
/// enforces this so no caller can construct a `GuestPC` that violates the
/// invariant (spec §3 boundary case B3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct GuestPC(u64);

impl GuestPC {
    /// Construct a `GuestPC`, validating against `mode`.
    pub fn new(value: u64, mode: GuestMode) -> Result<Self, CoreError> {
        if mode == GuestMode::Guest32 && (value >> 32) != 0 {
            return Err(CoreError::InvalidGuestPc { value, mode });
        }
        Ok(GuestPC(value))
    }

    /// Construct a `GuestPC` from a value already known (by the caller) to
    /// satisfy the mode invariant, e.g. a PC read back out of a `ThreadContext`
    /// whose mode hasn't changed since it was validated. Not exposed outside
    /// the crate.
    pub(crate) fn trusted(value: u64) -> Self {
        GuestPC(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    pub fn page(self) -> u64 {
        self.0 >> PAGE_SHIFT
    }

    pub fn offset_in_page(self) -> usize {
        (self.0 & (PAGE_SIZE as u64 - 1)) as usize
    }

    pub fn checked_add(self, delta: u64) -> Option<GuestPC> {
        self.0.checked_add(delta).map(GuestPC)
    }
}

impl std::fmt::Display for GuestPC {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// An opaque executable-memory pointer into a JIT-owned code region.
///
/// Not dereferenceable by safe code; callers obtain one only from
/// `LookupCache::find`/`insert` or a `CpuBackend::compile_code` result, and
/// must only ever call through it using the host ABI the dispatcher
/// establishes (spec §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostCodePtr(*const u8);

// SAFETY: a `HostCodePtr` only ever addresses read-only-after-install,
// executable memory owned by a thread's code arena (invariant 1 in
// spec §3). It carries no interior mutability and crossing threads with it
// is only ever done by value (e.g. inside a `BlockMapping`) while the
// owning thread's arena keeps the memory alive.
unsafe impl Send for HostCodePtr {}
unsafe impl Sync for HostCodePtr {}

impl HostCodePtr {
    /// # Safety
    /// `ptr` must point into memory that satisfies invariant 1 of spec §3:
    /// executable, readable, and not freed while reachable.
    pub unsafe fn from_raw(ptr: *const u8) -> Self {
        HostCodePtr(ptr)
    }

    pub fn as_ptr(self) -> *const u8 {
        self.0
    }
}

/// A half-open guest byte range `[start, start + len)`, as recorded in a
/// `BlockMapping`'s `covered_guest_ranges`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestRange {
    pub start: u64,
    pub len: u64,
}

impl GuestRange {
    pub fn new(start: u64, len: u64) -> Self {
        GuestRange { start, len }
    }

    pub fn end(self) -> u64 {
        self.start + self.len
    }

    pub fn intersects(self, other_start: u64, other_len: u64) -> bool {
        let other_end = other_start + other_len;
        self.start < other_end && other_start < self.end()
    }

    pub fn first_page(self) -> u64 {
        self.start >> PAGE_SHIFT
    }

    pub fn last_page(self) -> u64 {
        // B1: a block straddling the end of the address space must not
        // overflow when computing the last covered page.
        self.end().saturating_sub(1) >> PAGE_SHIFT
    }
}
