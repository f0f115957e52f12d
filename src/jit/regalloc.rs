//! Linear-scan register allocation over SSA live ranges (spec §4.3.1).
//!
//! Grounded on the teacher's optimizing-tier compiler's position in the
//! pipeline (`compiler_s2`: runs after IR compaction, owns register
//! assignment, hands its result to code generation) — the concrete x86
//! register-assignment logic there is back-end-specific and out of scope,
//! but the pipeline position and "spill slots packed by size class" policy
//! are preserved here.

use std::collections::HashMap;

use crate::jit::ir::{Assignment, IRListing, RAData, ValueClass, VReg};

/// A value's live range expressed as `[first_def, last_use]` instruction
/// indices in the compacted, linearized instruction stream.
#[derive(Debug, Clone, Copy)]
struct LiveRange {
    vreg: VReg,
    class: ValueClass,
    start: u32,
    end: u32,
}

pub struct RegAllocConfig {
    pub gpr_count: u16,
    pub fpr_count: u16,
}

impl Default for RegAllocConfig {
    fn default() -> Self {
        RegAllocConfig { gpr_count: 14, fpr_count: 16 }
    }
}

/// Runs linear-scan register allocation over `ir`, producing an `RAData`
/// that assigns every defined value a physical register or a spill slot.
/// Leaves `ir` semantically unchanged; spill/fill pseudo-ops are inserted
/// by `PassManager`'s compaction step based on this result, not here (spec
/// §4.3.1: "Records ... a fill/spill pair of pseudo-ops").
pub fn allocate(ir: &IRListing, config: &RegAllocConfig) -> RAData {
    let ranges = build_live_ranges(ir);

    let mut assignments: Vec<Option<Assignment>> = vec![None; ir.next_vreg as usize];
    let mut gpr_free: Vec<u16> = (0..config.gpr_count).rev().collect();
    let mut fpr_free: Vec<u16> = (0..config.fpr_count).rev().collect();
    let mut active: Vec<LiveRange> = Vec::new();
    let mut next_spill_slot: u32 = 0;
    let mut spill_slots_by_class: HashMap<(ValueClass, u32), u32> = HashMap::new();

    let mut sorted = ranges;
    sorted.sort_by_key(|r| r.start);

    for range in sorted {
        active.retain(|a| {
            let still_live = a.end >= range.start;
            if !still_live {
                match assignments[a.vreg.0 as usize] {
                    Some(Assignment::Register(r)) => match a.class {
                        ValueClass::Fpr => fpr_free.push(r),
                        _ => gpr_free.push(r),
                    },
                    _ => {}
                }
            }
            still_live
        });

        let free_pool = match range.class {
            ValueClass::Fpr => &mut fpr_free,
            _ => &mut gpr_free,
        };

        let assignment = if let Some(reg) = free_pool.pop() {
            Assignment::Register(reg)
        } else {
            let key = (range.class, 0u32);
            let slot = *spill_slots_by_class.entry(key).or_insert_with(|| {
                let s = next_spill_slot;
                next_spill_slot += 1;
                s
            });
            Assignment::Spill(slot)
        };

        assignments[range.vreg.0 as usize] = Some(assignment);
        active.push(range);
    }

    RAData {
        assignments,
        spill_slot_count: next_spill_slot,
    }
}

fn build_live_ranges(ir: &IRListing) -> Vec<LiveRange> {
    let mut starts: HashMap<u32, u32> = HashMap::new();
    let mut ends: HashMap<u32, u32> = HashMap::new();
    let mut classes: HashMap<u32, ValueClass> = HashMap::new();
    let mut index: u32 = 0;

    for block in &ir.blocks {
        for instr in &block.instrs {
            if instr.result.is_valid() {
                starts.entry(instr.result.0).or_insert(index);
                ends.insert(instr.result.0, index);
                classes.insert(instr.result.0, instr.result_class);
            }
            for used in operand_vregs(&instr.op) {
                if used.is_valid() {
                    ends.insert(used.0, index);
                    starts.entry(used.0).or_insert(index);
                }
            }
            index += 1;
        }
    }

    starts
        .into_iter()
        .map(|(vreg, start)| LiveRange {
            vreg: VReg(vreg),
            class: classes.get(&vreg).copied().unwrap_or(ValueClass::Gpr),
            start,
            end: ends.get(&vreg).copied().unwrap_or(start),
        })
        .collect()
}

pub(crate) fn operand_vregs(op: &crate::jit::ir::IrOp) -> Vec<VReg> {
    use crate::jit::ir::IrOp::*;
    match *op {
        StoreGpr(_, v) | StoreFlags(v) | StoreRip(v) | Neg(v) | Not(v) => vec![v],
        Load { addr, .. } => vec![addr],
        Store { addr, value, .. } => vec![addr, value],
        Add(a, b) | Sub(a, b) | Mul(a, b) | IMul(a, b) | Div(a, b) | IDiv(a, b) | And(a, b)
        | Or(a, b) | Xor(a, b) | Shl(a, b) | Shr(a, b) | Sar(a, b) | Cmp(a, b) => vec![a, b],
        SetPredicate { cmp, .. } => vec![cmp],
        Spill { value, .. } => vec![value],
        ExitIndirect { target } => vec![target],
        _ => vec![],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::ir::{IrBlock, IrInstr, IrOp};

    fn block_with(instrs: Vec<IrInstr>) -> IrBlock {
        IrBlock { instrs }
    }

    #[test]
    fn allocates_distinct_registers_for_concurrently_live_values() {
        let mut ir = IRListing::new();
        let a = ir.fresh_vreg();
        let b = ir.fresh_vreg();
        let c = ir.fresh_vreg();
        ir.push_block(block_with(vec![
            IrInstr { result: a, result_class: ValueClass::Gpr, op: IrOp::Const(1) },
            IrInstr { result: b, result_class: ValueClass::Gpr, op: IrOp::Const(2) },
            IrInstr { result: c, result_class: ValueClass::Gpr, op: IrOp::Add(a, b) },
        ]));

        let ra = allocate(&ir, &RegAllocConfig::default());
        let ra_a = ra.assignment_for(a).unwrap();
        let ra_b = ra.assignment_for(b).unwrap();
        assert_ne!(ra_a, ra_b);
        assert!(ra.assignment_for(c).is_some());
    }

    #[test]
    fn spills_when_registers_are_exhausted() {
        let mut ir = IRListing::new();
        let mut vs = Vec::new();
        let mut instrs = Vec::new();
        for _ in 0..4 {
            let v = ir.fresh_vreg();
            instrs.push(IrInstr { result: v, result_class: ValueClass::Gpr, op: IrOp::Const(1) });
            vs.push(v);
        }
        // Keep every value live simultaneously with a final instruction
        // that "uses" all of them by chained adds.
        let mut acc = vs[0];
        for &v in &vs[1..] {
            let next = ir.fresh_vreg();
            instrs.push(IrInstr { result: next, result_class: ValueClass::Gpr, op: IrOp::Add(acc, v) });
            acc = next;
        }
        ir.push_block(block_with(instrs));

        let tiny = RegAllocConfig { gpr_count: 2, fpr_count: 2 };
        let ra = allocate(&ir, &tiny);
        let spilled = ra
            .assignments
            .iter()
            .filter(|a| matches!(a, Some(Assignment::Spill(_))))
            .count();
        assert!(spilled > 0);
    }
}
