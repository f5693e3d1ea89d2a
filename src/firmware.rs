//! Calculator models, OS versions and the well-known OS entry points.

use std::fmt;

use crate::error::{Error, Result};

/// Hardware the image targets, as encoded in the basecode header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CalculatorModel {
    Ti92Plus,
    Ti89,
    Voyage200,
    Ti89Titanium,
}

impl CalculatorModel {
    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            1 => Ok(Self::Ti92Plus),
            3 => Ok(Self::Ti89),
            8 => Ok(Self::Voyage200),
            9 => Ok(Self::Ti89Titanium),
            other => Err(Error::UnknownModel(other)),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Self::Ti92Plus => 1,
            Self::Ti89 => 3,
            Self::Voyage200 => 8,
            Self::Ti89Titanium => 9,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Ti92Plus => "TI-92 Plus",
            Self::Ti89 => "TI-89",
            Self::Voyage200 => "Voyage 200",
            Self::Ti89Titanium => "TI-89 Titanium",
        }
    }
}

impl fmt::Display for CalculatorModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// AMS release as reported by the `ReleaseVersion` string, e.g. `"2.05"`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct OsVersion {
    pub major: u8,
    pub minor: u8,
}

impl OsVersion {
    pub fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Decode the `"M.mm"` form.
    pub fn parse(text: &[u8]) -> Result<Self> {
        let digit = |i: usize| -> Result<u8> {
            match text.get(i) {
                Some(b) if b.is_ascii_digit() => Ok(b - b'0'),
                _ => Err(Error::UnexpectedLayout(format!(
                    "malformed release version string {:?}",
                    String::from_utf8_lossy(text)
                ))),
            }
        };
        Ok(Self {
            major: digit(0)?,
            minor: digit(2)? * 10 + digit(3)?,
        })
    }
}

impl fmt::Display for OsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.major, self.minor)
    }
}

/// Optional behaviors selected by the user.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Features {
    /// Resolve the font tables once and embed their addresses in the drawing code.
    pub hardcode_fonts: bool,
    /// Replace the localized string lookup with the built-in English table.
    pub hardcode_english_language: bool,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            hardcode_fonts: true,
            hardcode_english_language: false,
        }
    }
}

/// What the container says about the image, plus what the OS says about itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FirmwareInfo {
    pub model: CalculatorModel,
    /// Release code from the basecode header (9 = 2.05, 11 = 2.08, 12 = 2.09,
    /// 13 = 3.01, 14 = 3.10).
    pub version_code: u8,
    pub os: OsVersion,
}

/// Indices into the ROM_CALL dispatch table.
pub mod rom_call {
    /// Slot holding the number of entries.
    pub const ENTRY_COUNT: i32 = -1;

    pub const HEAP_DEREF: i32 = 0x096;
    pub const EX_STO_BCD: i32 = 0x0C0;
    pub const OS_REGISTER_TIMER: i32 = 0x0F0;
    pub const DRAW_CHAR: i32 = 0x1A4;
    pub const MEMCMP: i32 = 0x270;
    pub const OSV_REGISTER_TIMER: i32 = 0x284;
    pub const OSV_FREE_TIMER: i32 = 0x285;
    pub const XR_STRING_PTR: i32 = 0x293;
    pub const OS_CONTRAST_UP: i32 = 0x296;
    pub const OS_CONTRAST_DN: i32 = 0x297;
    pub const EM_GET_ARCHIVE_MEMORY_BEGINNING: i32 = 0x3CF;
    pub const OO_COND_GET_ATTR: i32 = 0x3FA;
    pub const RELEASE_VERSION: i32 = 0x440;
    pub const HEAP_TABLE: i32 = 0x441;
    pub const EV_RUNNING_APP: i32 = 0x45D;
    pub const SF_WIDTH: i32 = 0x4D3;
    pub const FIFTY_MSEC_TICK: i32 = 0x4FC;
}

/// Byte offsets into the 68000 exception vector table.
pub mod vector {
    pub const AUTO_INT_5: u32 = 0x74;
    pub const TRAP_3: u32 = 0x8C;
    pub const TRAP_9: u32 = 0xA4;
    pub const TRAP_10: u32 = 0xA8;
    pub const TRAP_11: u32 = 0xAC;
    /// Not a real exception; AMS keeps the ROM_CALL table pointer here.
    pub const ROM_CALL_TABLE: u32 = 0xC8;
}

/// Offset of the vector table copy from the start of the basecode.
pub const VECTOR_TABLE_OFFSET: u32 = 0x88;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_codes() {
        for code in [1u8, 3, 8, 9] {
            assert_eq!(CalculatorModel::from_code(code).unwrap().code(), code);
        }
        assert!(matches!(
            CalculatorModel::from_code(2),
            Err(Error::UnknownModel(2))
        ));
    }

    #[test]
    fn test_parse_release_version() {
        assert_eq!(OsVersion::parse(b"2.05").unwrap(), OsVersion::new(2, 5));
        assert_eq!(OsVersion::parse(b"3.10, 07/18/2005").unwrap(), OsVersion::new(3, 10));
        assert_eq!(OsVersion::new(2, 9).to_string(), "2.09");
        assert!(OsVersion::parse(b"2.").is_err());
    }

    #[test]
    fn test_default_features() {
        let features = Features::default();
        assert!(features.hardcode_fonts);
        assert!(!features.hardcode_english_language);
    }
}
