//! Faster replacements for hot OS routines.
//!
//! Each routine here is rewritten from scratch. The addresses the original
//! resolves at run time (heap table, font tables, string tables) are looked
//! up once while patching and embedded in the new code.

use crate::context::EngineContext;
use crate::encode::{op, CodeBuf};
use crate::error::Result;
use crate::firmware::rom_call;
use crate::stages::{report_site, PatchStage, StageOutcome};

/// Attribute keys of the three system fonts.
const SMALL_FONT: u32 = 0x300;
const MEDIUM_FONT: u32 = 0x301;
const LARGE_FONT: u32 = 0x302;

/// `HeapDeref` reduced to a table lookup.
pub struct HeapDeref;

impl PatchStage for HeapDeref {
    fn name(&self) -> &'static str {
        "heap-deref"
    }

    fn apply(&self, ctx: &mut EngineContext) -> Result<StageOutcome> {
        let entry = ctx.rom_call(rom_call::HEAP_DEREF)?;
        let mut table = ctx.get_u16(entry + 0x0A)? as u32;
        if table == 0 {
            table = ctx.get_u16(entry + 0x0C)? as u32;
        }

        let mut code = CodeBuf::new();
        code.long(0x302F_0004) // move.w 4(sp),d0
            .word(0xE548) // lsl.w #2,d0
            .sized_operand(0x2078, 0x2079, table) // movea.l table,a0
            .long(0x2070_0000) // movea.l 0(a0,d0.w),a0
            .word(op::RTS);

        report_site("Optimizing HeapDeref", entry);
        ctx.put_n(entry, code.as_bytes())?;
        Ok(StageOutcome::applied(vec![entry]))
    }
}

/// Font lookups in the character drawing routine replaced by fixed addresses.
pub struct FontDrawing;

impl PatchStage for FontDrawing {
    fn name(&self) -> &'static str {
        "font-drawing"
    }

    fn applies_to(&self, ctx: &EngineContext) -> bool {
        ctx.features().hardcode_fonts
    }

    fn apply(&self, ctx: &mut EngineContext) -> Result<StageOutcome> {
        let small = ctx.require_attribute(SMALL_FONT)?;
        let medium = ctx.require_attribute(MEDIUM_FONT)?;
        let large = ctx.require_attribute(LARGE_FONT)?;

        // DrawChar jumps to the shared glyph routine: PC-relative on AMS 2,
        // absolute with a two byte longer prologue on AMS 3.
        let entry = ctx.rom_call(rom_call::DRAW_CHAR)?;
        let (routine, shift) = if ctx.firmware().os.major == 2 {
            (ctx.pc_relative(entry + 0x26)?, 0)
        } else {
            (ctx.get_u32(entry + 0x26)?, 2)
        };

        let mut sites = Vec::with_capacity(3);
        for (offset, font) in [(0x7A, large), (0xC2, medium), (0x112, small)] {
            let site = routine + offset + shift;
            let mut code = CodeBuf::new();
            code.word(op::LEA_ABS_L_A0).long(font).word(op::BRA_S_2A);
            report_site("Hardcoding font", site);
            ctx.put_n(site, code.as_bytes())?;
            sites.push(site);
        }
        Ok(StageOutcome::applied(sites))
    }
}

/// `sf_width` reading the small font table directly.
pub struct SfWidth;

impl PatchStage for SfWidth {
    fn name(&self) -> &'static str {
        "sf-width"
    }

    fn applies_to(&self, ctx: &EngineContext) -> bool {
        ctx.features().hardcode_fonts
    }

    fn apply(&self, ctx: &mut EngineContext) -> Result<StageOutcome> {
        let small = ctx.require_attribute(SMALL_FONT)?;
        let entry = ctx.rom_call(rom_call::SF_WIDTH)?;

        // The small font has 6 bytes per glyph, width first.
        let mut code = CodeBuf::new();
        code.word(op::LEA_ABS_L_A0)
            .long(small)
            .word(0x7000) // moveq #0,d0
            .long(0x102F_0005) // move.b 5(sp),d0
            .word(0x3200) // move.w d0,d1
            .words(&[0xD040, 0xD041, 0xD040]) // d0 *= 6
            .long(0x1030_0000) // move.b 0(a0,d0.w),d0
            .word(op::RTS);

        report_site("Optimizing sf_width", entry);
        ctx.put_n(entry, code.as_bytes())?;
        Ok(StageOutcome::applied(vec![entry]))
    }
}

/// `XR_stringPtr` answering from the built-in English table.
pub struct EnglishLanguage;

impl PatchStage for EnglishLanguage {
    fn name(&self) -> &'static str {
        "english-language"
    }

    fn applies_to(&self, ctx: &EngineContext) -> bool {
        ctx.features().hardcode_english_language
    }

    fn apply(&self, ctx: &mut EngineContext) -> Result<StageOutcome> {
        let entry = ctx.rom_call(rom_call::XR_STRING_PTR)?;
        let frame = ctx.system_frame()?;
        let strings = ctx.get_u32(frame + 4)?;
        let limit = ctx.get_u32(strings + 0x0E)?;
        let running_app = ctx.rom_call(rom_call::EV_RUNNING_APP)?;
        let heap_table = ctx.rom_call(rom_call::HEAP_TABLE)?;
        let cond_get_attr = ctx.rom_call(rom_call::OO_COND_GET_ATTR)?;

        let mut code = CodeBuf::new();
        // Built-in strings come straight from the English table.
        code.long(0x302F_0006) // move.w 6(sp),d0
            .word(0x0C40) // cmpi.w #limit,d0
            .word(limit as u16)
            .word(0x620E) // bhi.s app_string
            .word(op::LEA_ABS_L_A0)
            .long(strings)
            .word(0xE548) // lsl.w #2,d0
            .long(0x2070_0012) // movea.l 18(a0,d0.w),a0
            .word(op::RTS);
        // Anything above comes from the running application's frame.
        code.words(&[0x42A7, 0x4857]) // clr.l -(sp) ; pea (sp)
            .long(0x0640_0800) // addi.w #$800,d0
            .words(&[0x3F00, 0x4267]) // move.w d0,-(sp) ; clr.w -(sp)
            .sized_operand(0x3238, 0x3239, running_app) // move.w EV_runningApp,d1
            .sized_operand(op::LEA_ABS_W_A0, op::LEA_ABS_L_A0, heap_table)
            .word(0xE549) // lsl.w #2,d1
            .long(0x2070_1000) // movea.l 0(a0,d1.w),a0
            .long(0x2F28_0014) // move.l 20(a0),-(sp)
            .word(op::JSR_ABS_L)
            .long(cond_get_attr)
            .long(0x4FEF_000C) // lea 12(sp),sp
            .word(0x205F) // movea.l (sp)+,a0
            .word(op::RTS);

        report_site("Hardcoding English language", entry);
        ctx.put_n(entry, code.as_bytes())?;
        Ok(StageOutcome::applied(vec![entry]))
    }
}
