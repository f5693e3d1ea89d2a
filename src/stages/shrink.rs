//! Relocation of the data at the end of oversized TI-89 basecodes.
//!
//! AMS 2.08 and 2.09 for the TI-89 overflow into one more Flash sector than
//! earlier 2.xx releases, which costs 64 KB of archive memory. A run of
//! bitmaps and dialog templates at the very end of the basecode fits into
//! free space near the start, so it is moved there and every absolute
//! pointer to it is rewritten. One bitmap is a byte-for-byte duplicate of
//! another and is dropped entirely.

use tracing::{debug, info};

use crate::address::BASECODE_OFFSET;
use crate::context::EngineContext;
use crate::error::{Error, Result};
use crate::firmware::CalculatorModel;
use crate::fixup::{apply_fixups, verify_fixups, PointerFixup};
use crate::integrity::{BASECODE_LENGTH_FIELD, TRAILER_LEN};
use crate::stages::{report_site, FailurePolicy, PatchStage, StageOutcome};

/// Free space the relocated blocks are copied to.
pub const DESTINATION: u32 = 0x214000;

/// One relocatable block at the end of the basecode.
struct Block {
    len: u32,
    /// Locations elsewhere in the OS that hold the block's address.
    refs: &'static [u32],
    /// `(offset, target)`: the long at `offset` points `target` bytes into
    /// the block itself.
    internal: &'static [(u32, u32)],
    /// Index of an earlier block with identical contents.
    alias_of: Option<usize>,
}

const fn block(len: u32, refs: &'static [u32]) -> Block {
    Block {
        len,
        refs,
        internal: &[],
        alias_of: None,
    }
}

const fn alias(len: u32, refs: &'static [u32], of: usize) -> Block {
    Block {
        len,
        refs,
        internal: &[],
        alias_of: Some(of),
    }
}

struct Layout {
    version_code: u8,
    /// Address of the first block.
    source: u32,
    blocks: &'static [Block],
}

const LAYOUTS: &[Layout] = &[
    Layout {
        version_code: 11,
        source: 0x33FEE0,
        blocks: &[
            block(10, &[0x237362]),
            block(10, &[0x237368]),
            block(26, &[0x2A8B06]),
            block(8, &[0x2A8B1C]),
            block(10, &[0x2A8B32]),
            block(10, &[0x2A8B48]),
            alias(10, &[0x2B97E8], 0),
            block(10, &[0x2B97EC]),
            block(10, &[0x2B97F0, 0x2A8AEE]),
            block(10, &[0x2B97F8]),
            block(10, &[0x2B97F4]),
            block(68, &[0x2A8B5C]),
            block(12, &[0x2A8B76]),
            block(16, &[0x2B97FC]),
            block(16, &[0x2B9800]),
            block(16, &[0x2B9804]),
            block(16, &[0x2B9808]),
            block(16, &[0x2B980C]),
            block(8, &[]),
            block(8, &[]),
            block(8, &[]),
            block(8, &[]),
        ],
    },
    Layout {
        version_code: 12,
        source: 0x33FFB0,
        blocks: &[
            block(90, &[0x2F5DD2]),
            Block {
                len: 126,
                refs: &[0x2F7FE8],
                internal: &[(38, 16)],
                alias_of: None,
            },
            Block {
                len: 150,
                refs: &[0x2F870A],
                internal: &[(86, 40), (118, 52)],
                alias_of: None,
            },
            block(38, &[0x2FA8D8]),
            block(128, &[0x224312]),
            block(10, &[0x237362]),
            block(10, &[0x237368]),
            block(26, &[0x2A8CCE]),
            block(8, &[0x2A8CE4]),
            block(10, &[0x2A8CFA]),
            block(10, &[0x2A8D10]),
            alias(10, &[0x2B99B0], 5),
            block(10, &[0x2B99B4]),
            block(10, &[0x2B99B8, 0x2A8CB6]),
            block(10, &[0x2B99C0]),
            block(10, &[0x2B99BC]),
            block(68, &[0x2A8D24]),
            block(12, &[0x2A8D3E]),
            block(16, &[0x2B99C4]),
            block(16, &[0x2B99C8]),
            block(16, &[0x2B99CC]),
            block(16, &[0x2B99D0]),
            block(16, &[0x2B99D4]),
            block(8, &[]),
            block(8, &[]),
            block(8, &[]),
            block(8, &[]),
        ],
    },
];

/// A planned move of one block.
#[derive(Debug)]
struct Move {
    from: u32,
    to: u32,
    len: u32,
}

/// Everything a relocation does, computed before touching the image.
#[derive(Debug)]
struct Plan {
    copies: Vec<Move>,
    fixups: Vec<PointerFixup>,
    /// Address right after the last block.
    end: u32,
}

impl Layout {
    fn find(version_code: u8) -> Option<&'static Layout> {
        LAYOUTS.iter().find(|l| l.version_code == version_code)
    }

    fn plan(&self) -> Plan {
        let mut copies = Vec::new();
        let mut fixups = Vec::new();
        let mut destinations = Vec::with_capacity(self.blocks.len());
        let mut src = self.source;
        let mut dst = DESTINATION;

        for b in self.blocks {
            match b.alias_of {
                Some(of) => {
                    let kept = destinations[of];
                    fixups.extend(b.refs.iter().map(|&r| PointerFixup::alias(r, src, kept)));
                    destinations.push(kept);
                }
                None => {
                    copies.push(Move {
                        from: src,
                        to: dst,
                        len: b.len,
                    });
                    fixups.extend(
                        b.internal
                            .iter()
                            .map(|&(offset, target)| PointerFixup::internal(src, dst, offset, target)),
                    );
                    fixups.extend(b.refs.iter().map(|&r| PointerFixup::reference(r, src, dst)));
                    destinations.push(dst);
                    dst += b.len;
                }
            }
            src += b.len;
        }

        Plan {
            copies,
            fixups,
            end: src,
        }
    }
}

/// Move the tail of AMS 2.08/2.09 for the TI-89 so the OS fits in one
/// less Flash sector.
pub struct Shrink;

impl PatchStage for Shrink {
    fn name(&self) -> &'static str {
        "shrink"
    }

    fn policy(&self) -> FailurePolicy {
        FailurePolicy::BestEffort
    }

    fn applies_to(&self, ctx: &EngineContext) -> bool {
        let firmware = ctx.firmware();
        firmware.model == CalculatorModel::Ti89 && Layout::find(firmware.version_code).is_some()
    }

    fn apply(&self, ctx: &mut EngineContext) -> Result<StageOutcome> {
        let layout = Layout::find(ctx.firmware().version_code).ok_or_else(|| {
            Error::UnexpectedLayout(format!(
                "no relocation table for release code {}",
                ctx.firmware().version_code
            ))
        })?;
        let plan = layout.plan();

        let start = ctx.base() + BASECODE_OFFSET;
        let checksum_at = ctx
            .get_u32(start + BASECODE_LENGTH_FIELD)?
            .wrapping_add(start + 2);
        if plan.end != checksum_at {
            return Err(Error::UnexpectedLayout(format!(
                "relocated data ends at 0x{:06X} but the checksum is at 0x{:06X}",
                plan.end, checksum_at
            )));
        }
        verify_fixups(ctx, &plan.fixups)?;

        let mut blocks = Vec::with_capacity(plan.copies.len());
        for copy in &plan.copies {
            blocks.push(ctx.get_n(copy.from, copy.len as usize)?);
        }
        let trailer = ctx.get_n(plan.end, TRAILER_LEN as usize)?;

        for (copy, data) in plan.copies.iter().zip(&blocks) {
            debug!("0x{:06X} -> 0x{:06X} ({} bytes)", copy.from, copy.to, copy.len);
            ctx.put_n(copy.to, data)?;
        }
        let stats = apply_fixups(ctx, &plan.fixups)?;
        ctx.put_n(layout.source, &trailer)?;

        let shrunk = plan.end - layout.source;
        ctx.record_shrink(shrunk);
        report_site("Relocated basecode tail", DESTINATION);
        info!(
            "Shrunk by {} bytes ({} pointers rewritten)",
            shrunk,
            stats.total()
        );
        Ok(StageOutcome::applied(vec![DESTINATION, layout.source]))
    }
}
