//! Translation between calculator addresses and image file offsets.
//!
//! The basecode of an OS image is loaded at `base + 0x12000` on the
//! calculator, where `base` is the start of the Flash ROM for the model
//! (0x200000 on the TI-89, 0x400000 on the TI-92 Plus and Voyage 200,
//! 0x800000 on the TI-89 Titanium). In the update file the same byte sits at
//! `head`, right after the container header.

use crate::error::{Error, Result};

/// Offset of the basecode from the start of the Flash ROM.
pub const BASECODE_OFFSET: u32 = 0x12000;

/// Mask selecting the Flash ROM base out of any ROM address.
pub const ROM_BASE_MASK: u32 = 0x00E0_0000;

/// Affine mapping between the two coordinate systems.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddressSpace {
    base: u32,
    head: u32,
    delta: i64,
}

impl AddressSpace {
    pub fn new(base: u32, head: u32) -> Self {
        Self {
            base,
            head,
            delta: base as i64 + BASECODE_OFFSET as i64 - head as i64,
        }
    }

    /// Derive the mapping from the ROM_CALL table pointer.
    ///
    /// The table always lives in Flash, so masking its address gives the ROM base.
    pub fn from_dispatch_pointer(table: u32, head: u32) -> Self {
        Self::new(table & ROM_BASE_MASK, head)
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn head(&self) -> u32 {
        self.head
    }

    pub fn delta(&self) -> i64 {
        self.delta
    }

    /// Address of the first basecode byte.
    pub fn basecode_start(&self) -> u32 {
        self.base.wrapping_add(BASECODE_OFFSET)
    }

    /// File offset of an address. May be negative or past the end; the
    /// cursor rejects it on use.
    pub fn to_offset(&self, addr: u32) -> i64 {
        addr as i64 - self.delta
    }

    pub fn to_address(&self, offset: i64) -> u32 {
        (offset + self.delta) as u32
    }

    /// `addr + by`, or [`Error::OutOfRange`] if that leaves the 32-bit
    /// address space.
    pub fn advance(&self, addr: u32, by: u32) -> Result<u32> {
        addr.checked_add(by).ok_or(Error::OutOfRange {
            offset: self.to_offset(addr) + by as i64,
        })
    }

    /// `addr - by`, or [`Error::OutOfRange`] below address zero.
    pub fn retreat(&self, addr: u32, by: u32) -> Result<u32> {
        addr.checked_sub(by).ok_or(Error::OutOfRange {
            offset: self.to_offset(addr) - by as i64,
        })
    }
}
