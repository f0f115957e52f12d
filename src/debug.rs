//! Write-once diagnostic artifacts: text IR dumps and a `perf`-compatible
//! symbol map (spec §6 "Persisted state").
//!
//! Grounded on `src/debugger.rs`'s `DebugEvent` enum and inspection surface,
//! repurposed here from live GDB-style inspection (out of scope, per
//! SPEC_FULL.md §6) to the one piece of that module's responsibility this
//! core retains: writing artifacts to disk for offline tooling.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use crate::jit::ir::IRListing;
use crate::types::{GuestPC, HostCodePtr};

/// Stage an IR dump is taken at: before or after the optimization pipeline
/// runs, matching the two filenames spec §6 names (`-pre.ir`, `-post.ir`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpStage {
    Pre,
    Post,
}

impl DumpStage {
    fn suffix(self) -> &'static str {
        match self {
            DumpStage::Pre => "pre",
            DumpStage::Post => "post",
        }
    }
}

/// Writes `ir` as text to `<dir>/<hex_rip>-{pre,post}.ir` (spec §6).
pub fn dump_ir(dir: &Path, pc: GuestPC, stage: DumpStage, ir: &IRListing) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("{:x}-{}.ir", pc.value(), stage.suffix()));
    let mut file = File::create(path)?;
    write_ir_text(&mut file, ir)
}

fn write_ir_text(out: &mut impl Write, ir: &IRListing) -> std::io::Result<()> {
    for (block_idx, block) in ir.blocks.iter().enumerate() {
        writeln!(out, "block {block_idx}:")?;
        for instr in &block.instrs {
            if instr.result.is_valid() {
                writeln!(out, "  v{} = {:?}", instr.result.0, instr.op)?;
            } else {
                writeln!(out, "  {:?}", instr.op)?;
            }
        }
    }
    Ok(())
}

/// Appends one `perf`-style symbol record (`"<hex_addr> <hex_size>
/// <name>\n"`) to `/tmp/perf-<pid>.map` (spec §6).
pub struct PerfMapWriter {
    file: File,
}

impl PerfMapWriter {
    pub fn for_pid(pid: u32) -> std::io::Result<Self> {
        let path = format!("/tmp/perf-{pid}.map");
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(PerfMapWriter { file })
    }

    pub fn record(&mut self, addr: HostCodePtr, size: u32, name: &str) -> std::io::Result<()> {
        writeln!(self.file, "{:x} {:x} {}", addr.as_ptr() as usize, size, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::ir::{IrBlock, IrInstr, IrOp, ValueClass};
    use crate::types::GuestMode;

    #[test]
    fn dump_ir_writes_expected_filename() {
        let dir = tempfile::tempdir().unwrap();
        let pc = GuestPC::new(0xdead, GuestMode::Guest64).unwrap();
        let mut ir = IRListing::new();
        let v = ir.fresh_vreg();
        ir.push_block(IrBlock {
            instrs: vec![IrInstr { result: v, result_class: ValueClass::Gpr, op: IrOp::Const(1) }],
        });

        dump_ir(dir.path(), pc, DumpStage::Pre, &ir).unwrap();
        let path = dir.path().join("dead-pre.ir");
        assert!(path.exists());
        let text = std::fs::read_to_string(path).unwrap();
        assert!(text.contains("block 0:"));
    }

    #[test]
    fn perf_map_writer_appends_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("perf-1.map");
        {
            let mut w = PerfMapWriter { file: File::create(&path).unwrap() };
            let ptr = unsafe { HostCodePtr::from_raw(0x1000 as *const u8) };
            w.record(ptr, 0x20, "block_1000").unwrap();
        }
        let text = std::fs::read_to_string(path).unwrap();
        assert!(text.contains("block_1000"));
    }
}
