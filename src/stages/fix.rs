//! Fixes for OS defects.

use crate::context::EngineContext;
use crate::encode::{op, CodeBuf};
use crate::error::Result;
use crate::firmware::{rom_call, vector};
use crate::scanner::Width;
use crate::stages::{report_site, FailurePolicy, PatchStage, StageOutcome};

/// Where the new trap #3 handler goes, relative to the ROM base.
pub const TRAP3_HANDLER: u32 = 0x13100;

/// How far into OSContrastDn its register restore and the next save may sit.
const CONTRAST_WINDOW: usize = 0x100;

/// Largest distance between the restore and the next save in OSContrastDn.
const CONTRAST_MAX_GAP: u32 = 0x10;

/// Trap #3 (`HeapDeref` for kernel programs) made to work from user mode.
pub struct Trap3HeapDeref;

impl PatchStage for Trap3HeapDeref {
    fn name(&self) -> &'static str {
        "trap3-heap-deref"
    }

    fn apply(&self, ctx: &mut EngineContext) -> Result<StageOutcome> {
        let heap_table = ctx.rom_call(rom_call::HEAP_TABLE)?;
        let handler = ctx.base() + TRAP3_HANDLER;

        let mut code = CodeBuf::new();
        code.words(&[0xD0C8, 0xD0C8]) // adda.w a0,a0 twice
            .sized_operand(0xD0FC, 0xD1FC, heap_table) // adda #HeapTable,a0
            .word(0x2050) // movea.l (a0),a0
            .word(op::RTE);

        report_site("Fixing trap #3", handler);
        ctx.put_n(handler, code.as_bytes())?;
        ctx.set_vector(vector::TRAP_3, handler)?;
        Ok(StageOutcome::applied(vec![handler]))
    }
}

/// OSContrastUp/Dn save and restore d0-d7 as longs instead of words.
pub struct ContrastRegisters;

impl PatchStage for ContrastRegisters {
    fn name(&self) -> &'static str {
        "contrast-registers"
    }

    fn policy(&self) -> FailurePolicy {
        FailurePolicy::BestEffort
    }

    fn apply(&self, ctx: &mut EngineContext) -> Result<StageOutcome> {
        let up = ctx.rom_call(rom_call::OS_CONTRAST_UP)?;
        let down = ctx.rom_call(rom_call::OS_CONTRAST_DN)?;

        if ctx.get_u16(up)? != op::MOVEM_W_SAVE {
            return Ok(StageOutcome::skipped("OSContrastUp does not save words"));
        }
        if ctx.get_u16(down)? != op::MOVEM_W_SAVE {
            return Ok(StageOutcome::skipped("OSContrastDn does not save words"));
        }

        // The cursor sits right after OSContrastDn's first movem.
        let restore = ctx.scan_forward_within(op::MOVEM_W_RESTORE as u32, Width::Word, CONTRAST_WINDOW)?;
        let save = ctx.scan_forward_within(op::MOVEM_W_SAVE as u32, Width::Word, CONTRAST_WINDOW)?;
        if save.wrapping_sub(restore) > CONTRAST_MAX_GAP {
            return Ok(StageOutcome::skipped(format!(
                "register save at 0x{:06X} too far from restore at 0x{:06X}",
                save - 2,
                restore - 2
            )));
        }

        report_site("Fixing OSContrastUp/Dn registers", up);
        ctx.put_u16(up, op::MOVEM_L_SAVE)?;
        ctx.put_u16(down, op::MOVEM_L_SAVE)?;
        ctx.put_u16(restore - 2, op::MOVEM_L_RESTORE)?;
        ctx.put_u16(save - 2, op::MOVEM_L_SAVE)?;
        Ok(StageOutcome::applied(vec![up, down, restore - 2, save - 2]))
    }
}

/// Battery checks stop reading a stale status word after a battery change.
pub struct BatteryChange;

impl PatchStage for BatteryChange {
    fn name(&self) -> &'static str {
        "battery-change"
    }

    fn apply(&self, ctx: &mut EngineContext) -> Result<StageOutcome> {
        let handler = ctx.vector(vector::TRAP_11)?;
        ctx.seek(handler)?;
        let site = ctx.scan_forward(0x4E68, Width::Word)? + 4; // move usp,a0

        let mut code = CodeBuf::new();
        code.word(0x4600) // not.b d0
            .long(0x0200_00FF)
            .long(0x0A00_0000)
            .word(0x4600)
            .long(0x0000_0000);

        report_site("Fixing battery change", site);
        ctx.put_n(site, code.as_bytes())?;
        Ok(StageOutcome::applied(vec![site]))
    }
}
