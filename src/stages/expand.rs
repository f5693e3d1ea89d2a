//! Features added back to the OS.
//!
//! AMS 2.xx ships `OSVRegisterTimer` and `OSVFreeTimer` as stubs. The
//! auto-int 5 handler gets a wrapper that services the user timers after
//! the OS's own work, the timer init code is rewritten to clear both the
//! system and the user timer slots, and the two ROM_CALLs are pointed at
//! working implementations.

use crate::context::EngineContext;
use crate::encode::{op, CodeBuf};
use crate::error::Result;
use crate::firmware::{rom_call, vector, CalculatorModel, FirmwareInfo};
use crate::scanner::Width;
use crate::stages::{report_site, PatchStage, StageOutcome};

/// New auto-int 5 handler, relative to the ROM base.
pub const TIMER_HANDLER: u32 = 0x13110;
/// New `OSVRegisterTimer`.
pub const REGISTER_TIMER: u32 = 0x13140;
/// New `OSVFreeTimer`.
pub const FREE_TIMER: u32 = 0x13170;

/// Bytes between the epilogue of the auto-int 5 handler and its end.
const EPILOGUE_FROM_END: u32 = 6;

/// Number of system timers the OS keeps in front of the user timers.
pub fn system_timer_count(firmware: &FirmwareInfo) -> u16 {
    match firmware.os.major {
        2 if firmware.os.minor == 5 => 7,
        2 => 8,
        _ if firmware.model == CalculatorModel::Ti89Titanium => 9,
        _ => 8,
    }
}

/// Working `OSVRegisterTimer`/`OSVFreeTimer`.
pub struct Timers;

impl PatchStage for Timers {
    fn name(&self) -> &'static str {
        "timers"
    }

    fn apply(&self, ctx: &mut EngineContext) -> Result<StageOutcome> {
        let old_handler = ctx.vector(vector::AUTO_INT_5)?;
        ctx.seek(old_handler)?;
        let prologue = ctx.read_u32()?;
        let handler_end = ctx.scan_forward(op::RTE as u32, Width::Word)?;
        let epilogue_at = handler_end - EPILOGUE_FROM_END;
        let epilogue = ctx.get_u32(epilogue_at)?;

        let timers = ctx.trap9_item(3)?;
        let fifty_msec_tick = ctx.rom_call(rom_call::FIFTY_MSEC_TICK)?;
        let timer_vars = ctx.trap9_item(4)?;

        // The init code starts at the register save right before OSRegisterTimer.
        let register = ctx.rom_call(rom_call::OS_REGISTER_TIMER)?;
        ctx.seek(register)?;
        ctx.scan_backward(op::MOVEM_L_SAVE as u32, Width::Word)?;
        let init = ctx.tell();

        let base = ctx.base();
        let handler = base + TIMER_HANDLER;
        let count = system_timer_count(ctx.firmware());

        let mut wrapper = CodeBuf::new();
        wrapper
            .long(prologue)
            .word(op::JSR_ABS_L)
            .long(old_handler + 4)
            .word(0x45F8) // lea timers.w,a2
            .word(timers as u16)
            .words(&[0x76FF, 0xB69A, 0x6718, 0x5392, 0x6614])
            .long(0x24EA_FFFC)
            .words(&[0x205A, 0x4E90, 0xB4FC])
            .word((timers + 24) as u16)
            .word(0x6DEA)
            .long(epilogue)
            .word(op::RTE)
            .words(&[0x508A, 0x60F0]);

        let mut reset = CodeBuf::new();
        reset
            .word(0x7000) // moveq #0,d0
            .sized_operand(0x21C0, 0x23C0, fifty_msec_tick)
            .word(op::LEA_ABS_W_A0)
            .word((timer_vars + 0x0A) as u16)
            .word(0x43F8) // lea abs.w,a1
            .word((timers - 2 * count as u32) as u16)
            .byte(0x74) // moveq #count-1,d2
            .byte((count - 1) as u8)
            .words(&[0x72FF, 0x20C1, 0x20C0, 0x32C0])
            .long(0x51CA_FFF8)
            .words(&[0x22C1, 0x22C0, 0x22C0, 0x22C1, 0x22C0, 0x22C0])
            .word(op::RTS);

        let mut register_timer = CodeBuf::new();
        register_timer
            .word(0x7000)
            .long(0x322F_0004)
            .words(&[0x5341, 0x74FF])
            .long(0x0C41_0002)
            .words(&[0x641C, op::LEA_ABS_W_A0])
            .word(timers as u16)
            .long(0xC2FC_000C)
            .words(&[0xD1C1, 0xB490, 0x660E])
            .long(0x242F_0006)
            .words(&[0x20C2, 0x20C2])
            .long(0x20AF_000A)
            .words(&[0x5240, op::RTS]);

        let mut free_timer = CodeBuf::new();
        free_timer
            .word(0x7000)
            .long(0x322F_0004)
            .words(&[0x5341, 0x74FF])
            .long(0x0C41_0002)
            .words(&[0x6412, op::LEA_ABS_W_A0])
            .word(timers as u16)
            .long(0xC3FC_000C)
            .words(&[0xD1C1, 0x20C2, 0x4298, 0x4290, 0x5240, op::RTS]);

        report_site("Reintegrating OSVRegisterTimer/OSVFreeTimer", handler);
        ctx.put_n(handler, wrapper.as_bytes())?;
        ctx.put_u16(epilogue_at, op::RTS)?;
        ctx.set_vector(vector::AUTO_INT_5, handler)?;

        report_site("Rewriting timer init code", init);
        ctx.put_n(init, reset.as_bytes())?;

        ctx.put_n(base + REGISTER_TIMER, register_timer.as_bytes())?;
        ctx.set_rom_call(rom_call::OSV_REGISTER_TIMER, base + REGISTER_TIMER)?;
        ctx.put_n(base + FREE_TIMER, free_timer.as_bytes())?;
        ctx.set_rom_call(rom_call::OSV_FREE_TIMER, base + FREE_TIMER)?;

        Ok(StageOutcome::applied(vec![
            handler,
            init,
            base + REGISTER_TIMER,
            base + FREE_TIMER,
        ]))
    }
}
