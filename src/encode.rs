//! Builder for replacement 68000 code.

/// Opcodes that appear in more than one replacement routine.
pub mod op {
    pub const NOP: u16 = 0x4E71;
    pub const RTE: u16 = 0x4E73;
    pub const RTS: u16 = 0x4E75;
    /// `jsr abs.l`
    pub const JSR_ABS_L: u16 = 0x4EB9;
    /// `lea abs.w,a0`
    pub const LEA_ABS_W_A0: u16 = 0x41F8;
    /// `lea abs.l,a0`
    pub const LEA_ABS_L_A0: u16 = 0x41F9;
    /// `movem.w <list>,-(sp)`
    pub const MOVEM_W_SAVE: u16 = 0x48A7;
    /// `movem.l <list>,-(sp)`
    pub const MOVEM_L_SAVE: u16 = 0x48E7;
    /// `movem.w (sp)+,<list>`
    pub const MOVEM_W_RESTORE: u16 = 0x4C9F;
    /// `movem.l (sp)+,<list>`
    pub const MOVEM_L_RESTORE: u16 = 0x4CDF;
    /// `move.w d0,abs.l`
    pub const MOVE_W_D0_ABS_L: u16 = 0x33C0;
    /// `bra.s *+0x2C`
    pub const BRA_S_2A: u16 = 0x602A;
}

/// A routine assembled word by word before it is written to the image.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CodeBuf {
    bytes: Vec<u8>,
}

impl CodeBuf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn byte(&mut self, value: u8) -> &mut Self {
        self.bytes.push(value);
        self
    }

    pub fn word(&mut self, value: u16) -> &mut Self {
        self.bytes.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn words(&mut self, values: &[u16]) -> &mut Self {
        for &value in values {
            self.word(value);
        }
        self
    }

    pub fn long(&mut self, value: u32) -> &mut Self {
        self.bytes.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Emit an instruction whose operand is an absolute address or an
    /// immediate, picking the 16-bit form when the value fits in the
    /// sign-extended short range (below 0x8000) and the 32-bit form otherwise.
    pub fn sized_operand(&mut self, short_opcode: u16, long_opcode: u16, value: u32) -> &mut Self {
        if value < 0x8000 {
            self.word(short_opcode).word(value as u16)
        } else {
            self.word(long_opcode).long(value)
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}
