//! In-memory OS image with a single big-endian cursor.

use crate::error::{Error, Result};

/// The image bytes plus the shared read/write position.
///
/// All multi-byte values are big-endian, as on the 68000. There is exactly
/// one position; any operation that cares where it starts must seek first.
#[derive(Clone, Debug)]
pub struct Image {
    data: Vec<u8>,
    pos: usize,
}

impl Image {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, pos: 0 }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    /// Move to an absolute offset. The end of the image is a valid position.
    pub fn seek(&mut self, offset: i64) -> Result<()> {
        if offset < 0 || offset > self.data.len() as i64 {
            return Err(Error::OutOfRange { offset });
        }
        self.pos = offset as usize;
        Ok(())
    }

    /// Move relative to the current position.
    pub fn skip(&mut self, delta: i64) -> Result<()> {
        self.seek(self.pos as i64 + delta)
    }

    fn span(&self, len: usize) -> Result<std::ops::Range<usize>> {
        match self.pos.checked_add(len) {
            Some(end) if end <= self.data.len() => Ok(self.pos..end),
            _ => Err(Error::TruncatedImage {
                offset: self.pos,
                wanted: len,
            }),
        }
    }

    pub fn read_n(&mut self, len: usize) -> Result<&[u8]> {
        let range = self.span(len)?;
        self.pos = range.end;
        Ok(&self.data[range])
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_n(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let b = self.read_n(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let b = self.read_n(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn write_n(&mut self, bytes: &[u8]) -> Result<()> {
        let range = self.span(bytes.len())?;
        self.pos = range.end;
        self.data[range].copy_from_slice(bytes);
        Ok(())
    }

    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.write_n(&[value])
    }

    pub fn write_u16(&mut self, value: u16) -> Result<()> {
        self.write_n(&value.to_be_bytes())
    }

    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.write_n(&value.to_be_bytes())
    }

    /// Cut the image down to `len` bytes. The cursor is clamped to the new end.
    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
        self.pos = self.pos.min(self.data.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_big_endian_access() {
        let mut image = Image::new(vec![0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC]);
        assert_eq!(image.read_u16().unwrap(), 0x1234);
        assert_eq!(image.read_u32().unwrap(), 0x56789ABC);
        assert_eq!(image.position(), 6);

        image.seek(1).unwrap();
        image.write_u32(0xDEADBEEF).unwrap();
        assert_eq!(image.as_bytes(), &[0x12, 0xDE, 0xAD, 0xBE, 0xEF, 0xBC]);
    }

    #[test]
    fn test_read_past_end() {
        let mut image = Image::new(vec![0; 3]);
        image.seek(2).unwrap();
        assert!(matches!(
            image.read_u16(),
            Err(Error::TruncatedImage { offset: 2, wanted: 2 })
        ));
        // Failed reads leave the cursor alone.
        assert_eq!(image.position(), 2);
    }

    #[test]
    fn test_seek_bounds() {
        let mut image = Image::new(vec![0; 4]);
        assert!(image.seek(4).is_ok());
        assert!(matches!(image.seek(5), Err(Error::OutOfRange { offset: 5 })));
        assert!(matches!(image.skip(-5), Err(Error::OutOfRange { offset: -1 })));
    }

    #[test]
    fn test_truncate() {
        let mut image = Image::new(vec![1, 2, 3, 4]);
        image.seek(4).unwrap();
        image.truncate(2);
        assert_eq!(image.len(), 2);
        assert_eq!(image.position(), 2);
    }
}
