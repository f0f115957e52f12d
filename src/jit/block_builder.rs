//! Turns decoded guest instructions into an `IRListing` (spec §4.2, C2).
//!
//! Grounded on `src/jit/decoder.rs::DecodedInstr` for the shape of a decoded
//! instruction (kept in `interfaces.rs`, trimmed to what this core needs)
//! and `src/jit/mod.rs`'s documented lift loop ("decode a run of
//! instructions, stop at an unconditional control transfer or the
//! configured instruction budget, emit IR for each"). Per-opcode IR
//! emission is out of scope for this core (spec §1); what this module
//! does own is the `CustomIRHandler` override point spec §4.2 step 2
//! describes: before asking the external `Decoder` for anything, check
//! whether `entry_pc` has a registered thunk and, if so, lift from it
//! instead of guest memory.

use std::collections::HashMap;

use log::{debug, trace, warn};
use parking_lot::RwLock;

use crate::config::{CoreConfig, SmcMode};
use crate::interfaces::{DecodedBlock, Decoder};
use crate::jit::ir::{IrBlock, IrInstr, IrOp, IRListing, ValueClass, VReg};
use crate::types::GuestPC;

/// An external lifting thunk installed for a specific guest PC (spec §3
/// `CustomIRHandler`, §4.2 step 2: "invoke it with the builder; it produces
/// the IR directly").
pub trait CustomIRHandler: Send + Sync {
    /// Produces the full `IRListing` for a compilation miss at `entry_pc`,
    /// bypassing the external `Decoder` entirely.
    fn emit_block(&self, entry_pc: GuestPC) -> IRListing;
}

/// Process-wide `(guest_pc) -> CustomIRHandler` map, consulted under a
/// shared lock on every `generate_ir` call (spec §4.2 step 2, SPEC_FULL.md
/// §4.2: `parking_lot::RwLock<HashMap<GuestPC, CustomIRHandler>>`).
#[derive(Default)]
pub struct CustomIRRegistry {
    handlers: RwLock<HashMap<u64, Box<dyn CustomIRHandler>>>,
}

impl CustomIRRegistry {
    pub fn new() -> Self {
        CustomIRRegistry::default()
    }

    /// Spec §7 item 5: installing over an already-occupied PC is an
    /// invalidation race, not an overwrite — the existing entry is left
    /// untouched and `false` is returned.
    pub fn add_entrypoint(&self, pc: GuestPC, handler: Box<dyn CustomIRHandler>) -> bool {
        let mut handlers = self.handlers.write();
        if handlers.contains_key(&pc.value()) {
            return false;
        }
        handlers.insert(pc.value(), handler);
        true
    }

    pub fn remove_entrypoint(&self, pc: GuestPC) {
        self.handlers.write().remove(&pc.value());
    }

    fn get(&self, pc: GuestPC) -> Option<IRListing> {
        let handlers = self.handlers.read();
        handlers.get(&pc.value()).map(|h| h.emit_block(pc))
    }
}

/// Lifts guest code reachable from `entry_pc` into an `IRListing` (spec §4.2,
/// operation `generate_ir`).
pub struct BlockBuilder<'a> {
    decoder: &'a dyn Decoder,
    registry: &'a CustomIRRegistry,
    config: &'a CoreConfig,
}

impl<'a> BlockBuilder<'a> {
    pub fn new(decoder: &'a dyn Decoder, registry: &'a CustomIRRegistry, config: &'a CoreConfig) -> Self {
        BlockBuilder { decoder, registry, config }
    }

    /// Decodes and lifts the instruction run starting at `entry_pc`.
    /// Consults the `CustomIRHandler` registry first (spec §4.2 step 2);
    /// on a registry miss, falls through to the external `Decoder`.
    /// Returns `None` if the decoder produced nothing (e.g. unmapped guest
    /// memory), matching spec §4.2 edge case "decode at an unmapped
    /// address."
    ///
    /// A thin wrapper over `custom_handler_ir`/`decode`/`lift` kept for
    /// callers that don't need to inspect the decoded bytes in between (spec
    /// §4.5 needs them split so a compile miss can hash the decoded region
    /// before paying for a full lift).
    pub fn generate_ir(&self, entry_pc: GuestPC) -> Option<IRListing> {
        if let Some(listing) = self.custom_handler_ir(entry_pc) {
            return Some(listing);
        }
        let decoded_blocks = self.decode(entry_pc)?;
        Some(self.lift(&decoded_blocks))
    }

    /// Consults the `CustomIRHandler` registry for `entry_pc` (spec §4.2
    /// step 2). Bypasses the external `Decoder` entirely on a hit.
    pub fn custom_handler_ir(&self, entry_pc: GuestPC) -> Option<IRListing> {
        let listing = self.registry.get(entry_pc)?;
        debug!("[BlockBuilder] lifted {entry_pc} via custom IR handler");
        Some(listing)
    }

    /// Decodes the instruction run starting at `entry_pc` without lifting
    /// it, so a caller (the compile-miss path, spec §4.5) can compute a
    /// content hash over the decoded bytes before deciding whether the
    /// lift is even necessary. Returns `None` on an unmapped entry.
    pub fn decode(&self, entry_pc: GuestPC) -> Option<Vec<DecodedBlock>> {
        let decoded_blocks = self.decoder.decode_instructions_at_entry(entry_pc);
        if decoded_blocks.is_empty() {
            warn!("[BlockBuilder] no instructions decoded at {entry_pc}");
            return None;
        }
        Some(decoded_blocks)
    }

    /// Lifts an already-decoded instruction run into an `IRListing` (spec
    /// §4.2 steps 3-5).
    pub fn lift(&self, decoded_blocks: &[DecodedBlock]) -> IRListing {
        let mut listing = IRListing::new();
        let mut instr_count = 0u32;
        let entry_pc = decoded_blocks.first().map(|b| b.entry_pc);

        for decoded in decoded_blocks {
            let mut instrs = self.lift_block(decoded, &mut instr_count);
            if self.config.smc_mode == SmcMode::Full {
                self.insert_smc_guard(decoded, &mut instrs);
            }
            listing.push_block(IrBlock { instrs });

            if instr_count >= self.config.max_block_instructions {
                if let Some(entry_pc) = entry_pc {
                    trace!(
                        "[BlockBuilder] truncating lift at {entry_pc}: instruction budget {} reached",
                        self.config.max_block_instructions
                    );
                }
                break;
            }
        }

        debug!(
            "[BlockBuilder] lifted {} block(s), {} instr(s){}",
            listing.blocks.len(),
            listing.instr_count(),
            entry_pc.map(|pc| format!(" from {pc}")).unwrap_or_default(),
        );
        listing
    }

    /// Concrete per-opcode IR emission is a back-end concern out of scope
    /// for this core (spec §1); each decoded instruction contributes only
    /// the control-flow exit its `DecodedInstr` flags imply, which is all
    /// the pipeline (SMC guards, linking, invalidation) needs to reason
    /// about independent of any particular instruction set.
    fn lift_block(&self, decoded: &DecodedBlock, instr_count: &mut u32) -> Vec<IrInstr> {
        let mut out = Vec::with_capacity(decoded.instructions.len());
        for instr in &decoded.instructions {
            if instr.is_return || instr.is_branch {
                out.push(IrInstr {
                    result: VReg::NONE,
                    result_class: ValueClass::None,
                    op: IrOp::ExitIndirect { target: VReg::NONE },
                });
            }
            *instr_count += 1;
        }

        if !decoded.terminated_unconditionally {
            out.push(IrInstr {
                result: VReg::NONE,
                result_class: ValueClass::None,
                op: IrOp::ExitIndirect { target: VReg::NONE },
            });
        }
        out
    }

    /// Captures the bytes the lifted block assumed and inserts a
    /// `ValidateCode` guard so a later write to those bytes evicts this
    /// block before it runs stale (spec §4.2 step 5, SMC detection).
    fn insert_smc_guard(&self, decoded: &DecodedBlock, instrs: &mut Vec<IrInstr>) {
        let mut expected = Vec::with_capacity(decoded.total_length as usize);
        for instr in &decoded.instructions {
            expected.extend_from_slice(&instr.raw);
        }
        if expected.is_empty() {
            return;
        }
        instrs.insert(
            0,
            IrInstr {
                result: VReg::NONE,
                result_class: ValueClass::None,
                op: IrOp::ValidateCode {
                    pc: decoded.entry_pc,
                    len: expected.len().min(u8::MAX as usize) as u8,
                    expected,
                },
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::interfaces::DecodedInstr;
    use crate::types::GuestMode;

    struct OneInstrDecoder;

    impl Decoder for OneInstrDecoder {
        fn decode_instructions_at_entry(&self, pc: GuestPC) -> Vec<DecodedBlock> {
            vec![DecodedBlock {
                entry_pc: pc,
                instructions: vec![DecodedInstr {
                    pc,
                    length: 3,
                    raw: vec![0x90, 0x90, 0x90],
                    table_key: 1,
                    is_branch: false,
                    is_call: false,
                    is_return: true,
                    is_privileged: false,
                }],
                total_length: 3,
                terminated_unconditionally: true,
            }]
        }
    }

    struct EmptyDecoder;
    impl Decoder for EmptyDecoder {
        fn decode_instructions_at_entry(&self, _pc: GuestPC) -> Vec<DecodedBlock> {
            vec![]
        }
    }

    struct OneInstructionThunk;
    impl CustomIRHandler for OneInstructionThunk {
        fn emit_block(&self, entry_pc: GuestPC) -> IRListing {
            let mut listing = IRListing::new();
            listing.push_block(IrBlock {
                instrs: vec![IrInstr {
                    result: VReg::NONE,
                    result_class: ValueClass::None,
                    op: IrOp::ExitDirect { target: entry_pc.checked_add(1).unwrap(), link_eligible: false },
                }],
            });
            listing
        }
    }

    #[test]
    fn generate_ir_returns_none_for_unmapped_entry() {
        let decoder = EmptyDecoder;
        let registry = CustomIRRegistry::new();
        let config = CoreConfig::default();
        let builder = BlockBuilder::new(&decoder, &registry, &config);
        assert!(builder.generate_ir(GuestPC::new(0x1000, config.guest_mode).unwrap()).is_none());
    }

    #[test]
    fn generate_ir_inserts_validate_code_when_smc_mode_full() {
        let decoder = OneInstrDecoder;
        let registry = CustomIRRegistry::new();
        let mut config = CoreConfig::default();
        config.smc_mode = SmcMode::Full;
        let builder = BlockBuilder::new(&decoder, &registry, &config);
        let pc = GuestPC::new(0x1000, config.guest_mode).unwrap();
        let listing = builder.generate_ir(pc).unwrap();
        let has_guard = listing.blocks[0]
            .instrs
            .iter()
            .any(|i| matches!(i.op, IrOp::ValidateCode { .. }));
        assert!(has_guard);
    }

    #[test]
    fn generate_ir_skips_validate_code_when_smc_off() {
        let decoder = OneInstrDecoder;
        let registry = CustomIRRegistry::new();
        let config = CoreConfig::default();
        let builder = BlockBuilder::new(&decoder, &registry, &config);
        let pc = GuestPC::new(0x1000, config.guest_mode).unwrap();
        let listing = builder.generate_ir(pc).unwrap();
        let has_guard = listing.blocks[0]
            .instrs
            .iter()
            .any(|i| matches!(i.op, IrOp::ValidateCode { .. }));
        assert!(!has_guard);
    }

    #[test]
    fn custom_ir_handler_bypasses_the_decoder() {
        let decoder = EmptyDecoder;
        let registry = CustomIRRegistry::new();
        let config = CoreConfig::default();
        let pc = GuestPC::new(0xdead, GuestMode::Guest64).unwrap();
        assert!(registry.add_entrypoint(pc, Box::new(OneInstructionThunk)));

        let builder = BlockBuilder::new(&decoder, &registry, &config);
        let listing = builder.generate_ir(pc).unwrap();
        assert!(matches!(listing.blocks[0].instrs[0].op, IrOp::ExitDirect { .. }));
    }

    #[test]
    fn add_entrypoint_rejects_an_already_installed_pc() {
        let registry = CustomIRRegistry::new();
        let pc = GuestPC::new(0xdead, GuestMode::Guest64).unwrap();
        assert!(registry.add_entrypoint(pc, Box::new(OneInstructionThunk)));
        assert!(!registry.add_entrypoint(pc, Box::new(OneInstructionThunk)));
    }
}
