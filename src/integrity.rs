//! Checksum and length bookkeeping for the basecode.
//!
//! The basecode starts with a `0x8000`-tagged length field at offset 2.
//! The checksum covers that length plus 2 bytes from the start of the
//! basecode and is stored as a big-endian long right after the covered
//! range. A 67-byte end signature follows.
//!
//! Relocating data out of the tail of the basecode shortens it. The ledger
//! then has to fix both length fields, move the checksum, rewrite the
//! container's size field and cut the file.

use tracing::{debug, info};

use crate::address::BASECODE_OFFSET;
use crate::context::EngineContext;
use crate::error::{Error, Result};

/// Offset of the basecode length field (tag 0x8000).
pub const BASECODE_LENGTH_FIELD: u32 = 2;

/// Offset of the signed-area length field (tag 0x8070).
pub const SIGNED_LENGTH_FIELD: u32 = 0x80;

/// Difference between the basecode and signed-area lengths.
pub const SIGNED_LENGTH_ADJUSTMENT: u32 = 126;

/// Bytes covered by the checksum beyond the value of the length field.
const LENGTH_FIELD_BIAS: u32 = 2;

/// Size of the checksum plus the end signature.
pub const TRAILER_LEN: u32 = 4 + 67;

/// Offset, relative to the basecode, of the container's little-endian size field.
const CONTAINER_SIZE_FIELD: i64 = -4;

/// State of the checksum over one range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChecksumRecord {
    pub range_start: u32,
    pub range_length: u32,
    pub stored_value: u32,
    pub computed_value: u32,
}

impl ChecksumRecord {
    pub fn is_valid(&self) -> bool {
        self.stored_value == self.computed_value
    }
}

/// Wrapping sum of the big-endian words in `[start, start + len)`.
pub fn checksum(ctx: &mut EngineContext, start: u32, len: u32) -> Result<u32> {
    if len % 2 != 0 {
        return Err(Error::OutOfRange {
            offset: ctx.space().to_offset(start.wrapping_add(len)),
        });
    }
    let bytes = ctx.get_n(start, len as usize)?;
    Ok(word_sum(&bytes))
}

fn word_sum(bytes: &[u8]) -> u32 {
    bytes
        .chunks_exact(2)
        .fold(0u32, |sum, w| sum.wrapping_add(u16::from_be_bytes([w[0], w[1]]) as u32))
}

/// Integrity checkpoint taken before any patch runs.
#[derive(Clone, Copy, Debug)]
pub struct IntegrityLedger {
    start: u32,
    length: u32,
    image_len: usize,
}

impl IntegrityLedger {
    /// Locate the checksummed range and verify the stored checksum.
    pub fn open(ctx: &mut EngineContext) -> Result<(Self, ChecksumRecord)> {
        let start = ctx.space().advance(ctx.base(), BASECODE_OFFSET)?;
        let declared = ctx.get_u32(start + BASECODE_LENGTH_FIELD)?;
        let length = declared.checked_add(LENGTH_FIELD_BIAS).ok_or(Error::OutOfRange {
            offset: ctx.space().to_offset(start) + declared as i64 + LENGTH_FIELD_BIAS as i64,
        })?;
        let ledger = Self {
            start,
            length,
            image_len: ctx.image().len(),
        };

        let record = ledger.record(ctx, length)?;
        if !record.is_valid() {
            return Err(Error::ChecksumMismatch {
                stored: record.stored_value,
                computed: record.computed_value,
            });
        }
        debug!(
            "checksum 0x{:08X} over 0x{:X} bytes at 0x{:06X}",
            record.stored_value, length, start
        );
        Ok((ledger, record))
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    /// Length covered by the checksum before any shrinking.
    pub fn length(&self) -> u32 {
        self.length
    }

    /// Address of the checksum before any shrinking.
    pub fn checksum_address(&self) -> u32 {
        self.start + self.length
    }

    fn record(&self, ctx: &mut EngineContext, length: u32) -> Result<ChecksumRecord> {
        let computed_value = checksum(ctx, self.start, length)?;
        let stored_at = ctx.space().advance(self.start, length)?;
        let stored_value = ctx.get_u32(stored_at)?;
        Ok(ChecksumRecord {
            range_start: self.start,
            range_length: length,
            stored_value,
            computed_value,
        })
    }

    /// Bring the length fields, checksum and container size in line with
    /// the patched image.
    ///
    /// Running it again on an unchanged image rewrites the same bytes.
    pub fn commit(&self, ctx: &mut EngineContext) -> Result<ChecksumRecord> {
        let shrunk = ctx.shrunk_by();
        let length = self.shortened(ctx, self.length, shrunk)?;

        if shrunk != 0 {
            let field = self.start + BASECODE_LENGTH_FIELD;
            let declared = self.shortened(ctx, length, LENGTH_FIELD_BIAS)?;
            if ctx.get_u32(field)? != declared {
                let signed = self.shortened(ctx, declared, SIGNED_LENGTH_ADJUSTMENT)?;
                ctx.put_u32(field, declared)?;
                ctx.put_u32(self.start + SIGNED_LENGTH_FIELD, signed)?;
            }
        }

        let checksum_at = ctx.space().advance(self.start, length)?;
        let computed_value = checksum(ctx, self.start, length)?;
        ctx.put_u32(checksum_at, computed_value)?;
        info!(
            "Checksum 0x{:08X} written at 0x{:06X}",
            computed_value, checksum_at
        );

        if shrunk != 0 {
            let head = ctx.head() as i64;
            let final_len = self
                .image_len
                .checked_sub(shrunk as usize)
                .ok_or(Error::OutOfRange {
                    offset: self.image_len as i64 - shrunk as i64,
                })?;
            let image = ctx.image_mut();
            if image.len() > final_len {
                image.seek(head + CONTAINER_SIZE_FIELD)?;
                image.write_n(&((final_len as i64 - head) as u32).to_le_bytes())?;
                image.truncate(final_len);
                info!("Image shrunk by {} bytes", shrunk);
            }
        }

        Ok(ChecksumRecord {
            range_start: self.start,
            range_length: length,
            stored_value: computed_value,
            computed_value,
        })
    }

    /// `length - by`, where running below zero means the recorded shrink
    /// does not fit the basecode.
    fn shortened(&self, ctx: &EngineContext, length: u32, by: u32) -> Result<u32> {
        length.checked_sub(by).ok_or(Error::OutOfRange {
            offset: ctx.space().to_offset(self.start) + length as i64 - by as i64,
        })
    }
}
