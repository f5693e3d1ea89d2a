//! The `**TIFL**` container around an OS image.
//!
//! An update file is a TIFL header, optionally preceded by a license text
//! wrapped in its own TIFL header, followed by the basecode. The basecode
//! header carries the size, the target model and a release code.

use tracing::debug;

use crate::error::{Error, Result};
use crate::firmware::CalculatorModel;

pub const TIFL_SIGNATURE: &[u8] = b"**TIFL**";

/// Offset of the name field in a TIFL header.
const NAME_OFFSET: usize = 0x11;

/// Distance from a TIFL header's name field to the data it describes.
const NAME_TO_DATA: usize = 61;

const LICENSE_NAME: &[u8] = b"License";
const BASECODE_NAME: &[u8] = b"basecode";
const PRODUCT_NAME: &[u8] = b"Advanced Mathematics Software";

/// The OS header behind a license must start before this offset.
const LICENSE_SEARCH_LIMIT: usize = 0xA000;

const SIZE_FIELD: usize = 2;
const MODEL_FIELD: usize = 8;
const VERSION_FIELD: usize = 11;
const PRODUCT_FIELD: usize = 0x16;

/// Bytes following the basecode proper: the 0x8000 tag, the checksum, and
/// the end signature.
pub const TRAILER_SIZE: u32 = 2 + 4 + 3 + 64;

/// Bytes the range check adds on top of the declared basecode size.
const RANGE_CHECK_BIAS: u32 = 67;

/// Parsed container header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Container {
    /// File offset of the first basecode byte.
    pub head: u32,
    /// Length of the license block in front of the OS header, if any.
    pub license_len: u32,
    /// Size declared in the basecode header.
    pub basecode_size: u32,
    pub model: CalculatorModel,
    pub version_code: u8,
}

fn field<'a>(bytes: &'a [u8], offset: usize, len: usize) -> Result<&'a [u8]> {
    bytes
        .get(offset..offset + len)
        .ok_or_else(|| Error::Format(format!("file too short for header field at 0x{:X}", offset)))
}

impl Container {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if field(bytes, 0, TIFL_SIGNATURE.len())? != TIFL_SIGNATURE {
            return Err(Error::Format("missing **TIFL** signature".into()));
        }

        let mut license_len = 0;
        if field(bytes, NAME_OFFSET, LICENSE_NAME.len())? == LICENSE_NAME {
            let limit = bytes
                .len()
                .min(LICENSE_SEARCH_LIMIT + TIFL_SIGNATURE.len() - 1);
            license_len = bytes[NAME_OFFSET..limit]
                .windows(TIFL_SIGNATURE.len())
                .position(|w| w == TIFL_SIGNATURE)
                .map(|p| p + NAME_OFFSET)
                .ok_or_else(|| Error::Format("no OS header after the license".into()))?;
            debug!("skipped {} bytes of license", license_len);
        }

        let name = license_len + NAME_OFFSET;
        if field(bytes, name, BASECODE_NAME.len())? != BASECODE_NAME {
            return Err(Error::Format("first entry is not the basecode".into()));
        }
        let head = name + NAME_TO_DATA;

        if field(bytes, head + PRODUCT_FIELD, PRODUCT_NAME.len())? != PRODUCT_NAME {
            return Err(Error::Format("basecode is not an AMS image".into()));
        }

        let size = field(bytes, head + SIZE_FIELD, 4)?;
        let basecode_size = u32::from_be_bytes([size[0], size[1], size[2], size[3]]);
        let model = CalculatorModel::from_code(field(bytes, head + MODEL_FIELD, 1)?[0])?;
        let version_code = field(bytes, head + VERSION_FIELD, 1)?[0];

        Ok(Self {
            head: head as u32,
            license_len: license_len as u32,
            basecode_size,
            model,
            version_code,
        })
    }

    /// Size of the patched output before any shrinking: header, basecode
    /// and trailer. Trailing bytes in the input are dropped.
    pub fn image_len(&self) -> usize {
        self.head as usize + self.basecode_size as usize + TRAILER_SIZE as usize
    }

    pub fn validate_size(&self, policy: SizePolicy) -> Result<()> {
        match policy {
            SizePolicy::Exact => self.validate_exact(),
            SizePolicy::Range => self.validate_range(),
        }
    }

    fn mismatch(&self) -> Error {
        Error::SizeMismatch {
            model: self.model.to_string(),
            version_code: self.version_code,
            actual: self.basecode_size,
        }
    }

    fn validate_exact(&self) -> Result<()> {
        let row = KNOWN_SIZES
            .iter()
            .find(|row| row.version_code == self.version_code)
            .ok_or(Error::UnsupportedVersion(self.version_code))?;

        let known = row
            .sizes
            .iter()
            .any(|&(model, size)| model == self.model && size == self.basecode_size);
        if known {
            Ok(())
        } else {
            Err(self.mismatch())
        }
    }

    fn validate_range(&self) -> Result<()> {
        use CalculatorModel::*;

        let code = self.version_code;
        if !matches!(code, 9 | 12 | 13 | 14) {
            return Err(Error::UnsupportedVersion(code));
        }

        let mut max = 0x140000 - 0x12000;
        if code >= 12 && self.model != Ti92Plus {
            max += 0x10000;
        }
        if code >= 13 {
            max += 0x10000;
        }
        if code == 14 {
            max += 0x10000;
        }

        let mut range = 0x10000;
        if self.model == Voyage200 && code == 12 {
            range += 0x10000;
        }

        let size = self.basecode_size.saturating_add(RANGE_CHECK_BIAS);
        if size < max - range || size >= max {
            return Err(self.mismatch());
        }
        Ok(())
    }
}

/// How strictly the declared basecode size is checked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SizePolicy {
    /// Only the exact sizes of known releases are accepted.
    Exact,
    /// Any size inside the window the model's Flash layout allows.
    Range,
}

struct KnownSizes {
    version_code: u8,
    sizes: &'static [(CalculatorModel, u32)],
}

const KNOWN_SIZES: &[KnownSizes] = &[
    KnownSizes {
        version_code: 9,
        sizes: &[
            (CalculatorModel::Ti89, 0x124772),
            (CalculatorModel::Ti92Plus, 0x123F8E),
        ],
    },
    KnownSizes {
        version_code: 11,
        sizes: &[
            (CalculatorModel::Ti89, 0x12E01A),
            (CalculatorModel::Ti92Plus, 0x12D96A),
            (CalculatorModel::Voyage200, 0x12DBEE),
        ],
    },
    KnownSizes {
        version_code: 12,
        sizes: &[
            (CalculatorModel::Ti89, 0x12E2FE),
            (CalculatorModel::Ti92Plus, 0x12DC4E),
            (CalculatorModel::Voyage200, 0x12DECA),
            // 3.0x builds for the Voyage 200 reuse release code 12.
            (CalculatorModel::Voyage200, 0x1393F6),
        ],
    },
    KnownSizes {
        version_code: 13,
        sizes: &[
            (CalculatorModel::Ti89Titanium, 0x14565A),
            (CalculatorModel::Voyage200, 0x148D3A),
        ],
    },
    KnownSizes {
        version_code: 14,
        sizes: &[(CalculatorModel::Ti89Titanium, 0x155C3E)],
    },
];
