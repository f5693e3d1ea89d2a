//! Resolution of the OS's indirection layers.
//!
//! AMS exposes almost nothing at fixed addresses. Entry points are reached
//! through the ROM_CALL table, the exception vectors, two trap dispatch
//! tables and the attribute table hanging off the system frame. Everything
//! here reads the image; only [`EngineContext::set_rom_call`] and
//! [`EngineContext::set_vector`] write.

use tracing::debug;

use crate::context::EngineContext;
use crate::error::{Error, Result};
use crate::firmware::{vector, VECTOR_TABLE_OFFSET};
use crate::scanner::Width;

/// Marker returned for attributes that are not in the table.
pub const ATTRIBUTE_NOT_FOUND: u32 = 0xFFFF_FFFF;

/// `mulu.w #6,d3`, the index scaling right after the trap #11 table is loaded.
const TRAPB_INDEX_SCALING: u32 = 0xC6FC_0006;

/// Distance from the end of [`TRAPB_INDEX_SCALING`] back to the `lea` displacement.
const TRAPB_TABLE_DISPLACEMENT: u32 = 6;

/// Offset of the trap #9 pointer table operand in its handler.
const TRAP9_TABLE_OPERAND: u32 = 2;

/// Offset of the system frame pointer in the trap #10 handler.
const SYSTEM_FRAME_OPERAND: u32 = 10;

/// Offset of the attribute count in the system frame.
const ATTRIBUTE_LAST_INDEX: u32 = 0x0E;

/// Result of an attribute table lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttributeLookup {
    /// The value, or [`ATTRIBUTE_NOT_FOUND`].
    pub value: u32,
    /// Number of keys compared before the search ended.
    pub comparisons: u32,
}

impl AttributeLookup {
    pub fn found(&self) -> Option<u32> {
        (self.value != ATTRIBUTE_NOT_FOUND).then_some(self.value)
    }
}

impl EngineContext {
    /// Address of the ROM_CALL table slot for `id`. Negative ids reach the
    /// metadata stored in front of the table.
    pub fn dispatch_slot(&self, id: i32) -> u32 {
        (self.dispatch_table as i64 + 4 * id as i64) as u32
    }

    /// Ids past the end of the table are rejected; the slot they name
    /// belongs to whatever follows it.
    fn check_rom_call(&self, id: i32) -> Result<()> {
        if id >= 0 && self.dispatch_entries != 0 && id as u32 >= self.dispatch_entries {
            return Err(Error::OutOfRange {
                offset: self.space().to_offset(self.dispatch_slot(id)),
            });
        }
        Ok(())
    }

    /// Address of entry `index` in a table of `stride`-byte entries.
    fn table_entry(&self, table: u32, index: u32, stride: u32) -> Result<u32> {
        let displacement = index.checked_mul(stride).ok_or(Error::OutOfRange {
            offset: self.space().to_offset(table) + index as i64 * stride as i64,
        })?;
        self.space().advance(table, displacement)
    }

    /// Address a ROM_CALL currently points at.
    pub fn rom_call(&mut self, id: i32) -> Result<u32> {
        self.check_rom_call(id)?;
        let slot = self.dispatch_slot(id);
        self.get_u32(slot)
    }

    /// Redirect a ROM_CALL.
    pub fn set_rom_call(&mut self, id: i32, addr: u32) -> Result<()> {
        self.check_rom_call(id)?;
        let slot = self.dispatch_slot(id);
        debug!("ROM_CALL 0x{:03X} -> 0x{:06X}", id, addr);
        self.put_u32(slot, addr)
    }

    fn vector_offset(&self, slot: u32) -> i64 {
        (self.head() + VECTOR_TABLE_OFFSET + slot) as i64
    }

    /// Handler address stored in the vector table at byte offset `slot`.
    pub fn vector(&mut self, slot: u32) -> Result<u32> {
        let offset = self.vector_offset(slot);
        let image = self.image_mut();
        image.seek(offset)?;
        image.read_u32()
    }

    pub fn set_vector(&mut self, slot: u32, addr: u32) -> Result<()> {
        let offset = self.vector_offset(slot);
        debug!("vector 0x{:02X} -> 0x{:06X}", slot, addr);
        let image = self.image_mut();
        image.seek(offset)?;
        image.write_u32(addr)
    }

    /// Decode a 68000 PC-relative word displacement stored at `addr`.
    pub fn pc_relative(&mut self, addr: u32) -> Result<u32> {
        let displacement = self.get_u16(addr)? as i16;
        Ok(addr.wrapping_add(displacement as i32 as u32))
    }

    /// Entry `index` of the table the trap #9 handler returns pointers from.
    pub fn trap9_item(&mut self, index: u32) -> Result<u32> {
        let table = match self.trap9_pointers {
            Some(table) => table,
            None => {
                let handler = self.vector(vector::TRAP_9)?;
                let operand = self.space().advance(handler, TRAP9_TABLE_OPERAND)?;
                let table = self.get_u32(operand)?;
                debug!("trap #9 pointer table at 0x{:06X}", table);
                *self.trap9_pointers.insert(table)
            }
        };
        let entry = self.table_entry(table, index, 4)?;
        self.get_u32(entry)
    }

    /// Function `index` of the trap #11 dispatch table.
    pub fn trapb_function(&mut self, index: u32) -> Result<u32> {
        let table = match self.trapb_functions {
            Some(table) => table,
            None => {
                let handler = self.vector(vector::TRAP_11)?;
                self.seek(handler)?;
                let end = self.scan_forward(TRAPB_INDEX_SCALING, Width::Long)?;
                let operand = self.space().retreat(end, TRAPB_TABLE_DISPLACEMENT)?;
                let table = self.pc_relative(operand)?;
                debug!("trap #11 function table at 0x{:06X}", table);
                *self.trapb_functions.insert(table)
            }
        };
        let entry = self.table_entry(table, index, 6)?;
        self.get_u32(entry)
    }

    /// Root of the system frame, reached through the trap #10 handler.
    pub fn system_frame(&mut self) -> Result<u32> {
        if let Some(frame) = self.system_frame {
            return Ok(frame);
        }
        let handler = self.vector(vector::TRAP_10)?;
        let operand = self.space().advance(handler, SYSTEM_FRAME_OPERAND)?;
        let frame = self.get_u32(operand)?;
        debug!("system frame at 0x{:06X}", frame);
        Ok(*self.system_frame.insert(frame))
    }

    /// Look `key` up in the system frame's attribute table.
    ///
    /// The table starts with the index of its last entry, followed by
    /// key/value pairs. A table of N entries therefore costs at most N
    /// comparisons.
    pub fn attribute(&mut self, key: u32) -> Result<AttributeLookup> {
        let frame = self.system_frame()?;
        let count_at = self.space().advance(frame, ATTRIBUTE_LAST_INDEX)?;
        let mut remaining = self.get_u32(count_at)? as i32;
        let mut comparisons = 0;

        while remaining >= 0 {
            let entry_key = self.read_u32()?;
            let value = self.read_u32()?;
            comparisons += 1;
            if entry_key == key {
                return Ok(AttributeLookup { value, comparisons });
            }
            remaining -= 1;
        }

        Ok(AttributeLookup {
            value: ATTRIBUTE_NOT_FOUND,
            comparisons,
        })
    }

    /// Like [`Self::attribute`], but a missing key is an error.
    pub fn require_attribute(&mut self, key: u32) -> Result<u32> {
        self.attribute(key)?
            .found()
            .ok_or(Error::AttributeNotFound(key))
    }
}
