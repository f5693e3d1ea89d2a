//! Signature scanning over the image cursor.
//!
//! 68000 code is word aligned, so word and long patterns are tried at every
//! second byte and byte patterns at every byte. A scan starts at the current
//! cursor position and leaves the cursor next to the match, which lets
//! callers chain scans ("find A, then the next B after it").

use std::fmt;

use crate::error::{Error, Result};
use crate::image::Image;

/// Width of a scanned value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Width {
    Byte,
    Word,
    Long,
}

impl Width {
    /// Number of bytes compared at each candidate position.
    pub fn size(self) -> usize {
        match self {
            Self::Byte => 1,
            Self::Word => 2,
            Self::Long => 4,
        }
    }

    /// Distance between two candidate positions.
    pub fn stride(self) -> usize {
        match self {
            Self::Byte => 1,
            Self::Word | Self::Long => 2,
        }
    }

    fn read(self, image: &mut Image) -> Result<u32> {
        match self {
            Self::Byte => image.read_u8().map(u32::from),
            Self::Word => image.read_u16().map(u32::from),
            Self::Long => image.read_u32(),
        }
    }
}

impl fmt::Display for Width {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Byte => "byte",
            Self::Word => "word",
            Self::Long => "long",
        })
    }
}

/// Bounded forward/backward pattern search.
#[derive(Clone, Copy, Debug)]
pub struct SignatureScanner {
    /// Furthest distance, in bytes, a match may start from the scan origin.
    window: usize,
}

impl Default for SignatureScanner {
    fn default() -> Self {
        Self { window: usize::MAX }
    }
}

impl SignatureScanner {
    pub fn new(window: usize) -> Self {
        Self { window }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Search forward for `value`.
    ///
    /// Returns the offset just past the match; the cursor is left there.
    pub fn forward(&self, image: &mut Image, value: u32, width: Width) -> Result<usize> {
        let start = image.position();
        let backoff = (width.size() - width.stride()) as i64;

        loop {
            let at = image.position();
            if at - start > self.window {
                return Err(self.not_found(value, width, start));
            }
            if width.read(image).map_err(|e| exhausted(e, value, width))? == value {
                return Ok(image.position());
            }
            image.skip(-backoff)?;
        }
    }

    /// Search backward for `value`, starting with the value at the cursor.
    ///
    /// Returns the offset of the match itself; the cursor is left just past it.
    pub fn backward(&self, image: &mut Image, value: u32, width: Width) -> Result<usize> {
        let start = image.position();

        loop {
            let at = image.position();
            if start - at > self.window {
                return Err(self.not_found(value, width, start));
            }
            if width.read(image).map_err(|e| exhausted(e, value, width))? == value {
                return Ok(at);
            }
            let previous = at as i64 - width.stride() as i64;
            if previous < 0 {
                return Err(Error::StreamExhausted { value, width });
            }
            image.seek(previous)?;
        }
    }

    fn not_found(&self, value: u32, width: Width, start: usize) -> Error {
        Error::PatternNotFound {
            value,
            width,
            start,
            window: self.window,
        }
    }
}

fn exhausted(err: Error, value: u32, width: Width) -> Error {
    match err {
        Error::TruncatedImage { .. } => Error::StreamExhausted { value, width },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(bytes: &[u8]) -> Image {
        Image::new(bytes.to_vec())
    }

    #[test]
    fn test_forward_long_first_match() {
        let mut img = image(&[0, 0, 0x12, 0x34, 0x56, 0x78, 0, 0, 0x12, 0x34, 0x56, 0x78]);
        let scanner = SignatureScanner::default();
        assert_eq!(scanner.forward(&mut img, 0x12345678, Width::Long).unwrap(), 6);
        assert_eq!(img.position(), 6);

        // Scanning again from the returned position finds the next occurrence.
        assert_eq!(scanner.forward(&mut img, 0x12345678, Width::Long).unwrap(), 12);
    }

    #[test]
    fn test_forward_long_ignores_odd_alignment() {
        let mut img = image(&[0, 0x12, 0x34, 0x56, 0x78, 0, 0, 0]);
        let scanner = SignatureScanner::default();
        assert!(matches!(
            scanner.forward(&mut img, 0x12345678, Width::Long),
            Err(Error::StreamExhausted { .. })
        ));
    }

    #[test]
    fn test_forward_byte_and_word() {
        let mut img = image(&[1, 2, 3, 4, 0x4E, 0x75]);
        let scanner = SignatureScanner::default();
        assert_eq!(scanner.forward(&mut img, 3, Width::Byte).unwrap(), 3);
        img.seek(0).unwrap();
        assert_eq!(scanner.forward(&mut img, 0x4E75, Width::Word).unwrap(), 6);
    }

    #[test]
    fn test_backward_positions() {
        let mut img = image(&[0x48, 0xE7, 0, 0, 0, 0, 0, 0]);
        let scanner = SignatureScanner::default();
        img.seek(6).unwrap();
        assert_eq!(scanner.backward(&mut img, 0x48E7, Width::Word).unwrap(), 0);
        assert_eq!(img.position(), 2);

        let mut img = image(&[0, 0, 0xCA, 0xFE, 0xBA, 0xBE, 0, 0]);
        img.seek(4).unwrap();
        assert_eq!(scanner.backward(&mut img, 0xCAFEBABE, Width::Long).unwrap(), 2);
        assert_eq!(img.position(), 6);

        let mut img = image(&[9, 0, 0, 0]);
        img.seek(3).unwrap();
        assert_eq!(scanner.backward(&mut img, 9, Width::Byte).unwrap(), 0);
        assert_eq!(img.position(), 1);
    }

    #[test]
    fn test_backward_exhausted() {
        let mut img = image(&[0; 8]);
        img.seek(4).unwrap();
        assert!(matches!(
            SignatureScanner::default().backward(&mut img, 0x4E75, Width::Word),
            Err(Error::StreamExhausted { value: 0x4E75, width: Width::Word })
        ));
    }

    #[test]
    fn test_window_limits_search() {
        let mut bytes = vec![0u8; 64];
        bytes[40] = 0x4E;
        bytes[41] = 0x75;
        let scanner = SignatureScanner::new(16);
        let mut img = image(&bytes);
        assert!(matches!(
            scanner.forward(&mut img, 0x4E75, Width::Word),
            Err(Error::PatternNotFound { start: 0, window: 16, .. })
        ));

        let mut img = image(&bytes);
        img.seek(30).unwrap();
        assert_eq!(scanner.forward(&mut img, 0x4E75, Width::Word).unwrap(), 42);
    }
}
