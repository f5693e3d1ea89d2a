//! Removal of the protections AMS places on user code.

use crate::context::EngineContext;
use crate::encode::{op, CodeBuf};
use crate::error::Result;
use crate::firmware::rom_call;
use crate::scanner::Width;
use crate::stages::{report_site, FailurePolicy, PatchStage, StageOutcome};

/// Start of the reset code, relative to the ROM base.
pub const RESET_CODE: u32 = 0x12188;

/// Start of the bulk of the OS code, relative to the ROM base.
pub const APPLICATION_AREA: u32 = 0x20000;

/// I/O port controlling the executable Flash area.
const FLASH_PROTECTION_PORT: u32 = 0x0070_0012;

/// Lets programs execute from RAM.
pub struct RamExecution;

impl PatchStage for RamExecution {
    fn name(&self) -> &'static str {
        "ram-execution"
    }

    fn apply(&self, ctx: &mut EngineContext) -> Result<StageOutcome> {
        let entry = ctx.rom_call(rom_call::EX_STO_BCD)?;
        report_site("Killing RAM execution protection", entry + 0x56);
        // Bounds of the executable RAM window.
        for offset in [0x58, 0x5C, 0x62, 0x68] {
            ctx.put_u16(entry + offset, 0)?;
        }
        Ok(StageOutcome::applied(vec![entry + 0x56]))
    }
}

/// Lets programs execute from the whole Flash ROM.
pub struct FlashExecution {
    /// Also neutralise the writes to the HW1 protection ports, which are
    /// only reachable with stealth I/O.
    pub stealth_ports: bool,
}

impl PatchStage for FlashExecution {
    fn name(&self) -> &'static str {
        "flash-execution"
    }

    fn apply(&self, ctx: &mut EngineContext) -> Result<StageOutcome> {
        ctx.seek(ctx.base() + RESET_CODE)?;
        let end = ctx.scan_forward(FLASH_PROTECTION_PORT, Width::Long)?;
        let handler = ctx.trapb_function(0x10)?;

        let mut code = CodeBuf::new();
        code.long(0x33FC_003F)
            .long(FLASH_PROTECTION_PORT)
            .word(op::RTS);

        report_site("Killing Flash execution protection", end - 8);
        ctx.put_u16(end - 6, 0x003F)?;
        if self.stealth_ports {
            for offset in [26, 20, 14] {
                ctx.put_u16(end - offset, op::MOVE_W_D0_ABS_L)?;
            }
        }

        report_site("Killing Flash execution protection", handler);
        ctx.put_n(handler, code.as_bytes())?;
        Ok(StageOutcome::applied(vec![end - 8, handler]))
    }
}

/// Reports the real start of the archive instead of a clamped one.
pub struct ArchiveMemory;

impl PatchStage for ArchiveMemory {
    fn name(&self) -> &'static str {
        "archive-memory"
    }

    fn apply(&self, ctx: &mut EngineContext) -> Result<StageOutcome> {
        let entry = ctx.rom_call(rom_call::EM_GET_ARCHIVE_MEMORY_BEGINNING)?;
        ctx.seek(entry)?;
        let site = ctx.scan_forward(0xFFFF_0000, Width::Long)?;

        let mut code = CodeBuf::new();
        // movea.l d0,a0 ; addq.l #8,sp ; rts
        code.words(&[0x2040, 0x508F, op::RTS]);

        report_site("Removing archive memory limit", site);
        ctx.put_n(site, code.as_bytes())?;
        Ok(StageOutcome::applied(vec![site]))
    }
}

/// Accepts Flash applications whatever their signature.
pub struct UnsignedApps {
    /// Where to start looking for the verification call, relative to the ROM base.
    pub search_from: u32,
}

impl PatchStage for UnsignedApps {
    fn name(&self) -> &'static str {
        "unsigned-apps"
    }

    fn policy(&self) -> FailurePolicy {
        FailurePolicy::BestEffort
    }

    fn apply(&self, ctx: &mut EngineContext) -> Result<StageOutcome> {
        let string_ptr = ctx.rom_call(rom_call::XR_STRING_PTR)?;
        let memcmp = ctx.rom_call(rom_call::MEMCMP)?;

        // The verifier loads the "invalid signature" message id 0x20E and
        // calls XR_stringPtr right after.
        ctx.seek(ctx.base() + self.search_from)?;
        let end = ctx.scan_forward(0x0000_020E, Width::Long)?;
        let opcode = ctx.read_u16()?;
        let target = ctx.read_u32()?;
        if opcode != op::JSR_ABS_L || target != string_ptr {
            return Ok(StageOutcome::skipped(format!(
                "unexpected data after the signature message at 0x{:06X}",
                end
            )));
        }

        let verifier = ctx.pc_relative(end - 0x0C)?;
        ctx.seek(verifier)?;
        let call = ctx.scan_forward(memcmp, Width::Long)?;
        let branch = ctx.get_u16(call - 8)?;

        report_site("Killing FlashApp signature checking", call - 0x0E);
        ctx.put_u16(call - 0x0C, branch)?;
        Ok(StageOutcome::applied(vec![call - 0x0E]))
    }
}

/// Lifts the 8 KB (AMS 2.05) or 24 KB (2.08, 2.09) limit on assembly programs.
pub struct AsmSizeLimit;

impl PatchStage for AsmSizeLimit {
    fn name(&self) -> &'static str {
        "asm-size-limit"
    }

    fn applies_to(&self, ctx: &EngineContext) -> bool {
        let os = ctx.firmware().os;
        os.major == 2 && matches!(os.minor, 5 | 8 | 9)
    }

    fn apply(&self, ctx: &mut EngineContext) -> Result<StageOutcome> {
        // cmp.w #$6000,(a2) on 2.05, cmp.w #$6000,(a3) later.
        let signature = if ctx.firmware().os.minor == 5 {
            0x0C52_6000
        } else {
            0x0C53_6000
        };
        ctx.seek(ctx.base() + APPLICATION_AREA)?;
        let end = ctx.scan_forward(signature, Width::Long)?;

        report_site("Killing ASM size limit", end - 4);
        ctx.put_u16(end - 2, 0xFFFF)?;
        Ok(StageOutcome::applied(vec![end - 4]))
    }
}

/// Stops AMS from refusing programs that call unknown ROM_CALLs.
pub struct InvalidProgramReference;

/// Number of `ER_throw` sites raising "Invalid program reference".
const PROGRAM_REFERENCE_THROWS: usize = 3;

impl PatchStage for InvalidProgramReference {
    fn name(&self) -> &'static str {
        "invalid-program-reference"
    }

    fn apply(&self, ctx: &mut EngineContext) -> Result<StageOutcome> {
        ctx.seek(ctx.base() + APPLICATION_AREA)?;
        let mut sites = Vec::with_capacity(PROGRAM_REFERENCE_THROWS);
        for _ in 0..PROGRAM_REFERENCE_THROWS {
            let end = ctx.scan_forward(0xA244, Width::Word)?;
            sites.push(end - 2);
        }

        for &site in &sites {
            report_site("Killing 'Invalid Program Reference'", site);
            ctx.put_u16(site, op::NOP)?;
        }
        Ok(StageOutcome::applied(sites))
    }
}
