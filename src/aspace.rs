//! Bounds-checked access to the on-disk bytes of an image.
//!
//! All offsets here are `Raw` (file offsets). Translating virtual
//! addresses into file offsets is the section map's job; everything
//! downstream of that translation reads through this buffer.
use anyhow::Result;
use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use crate::addr::Raw;

#[derive(Debug, Error)]
pub enum BufError {
    #[error("read beyond end of file image: {0:#x}")]
    OutOfBounds(u64),
    #[error("string is not valid ascii at {0:#x}")]
    BadString(u64),
}

/// The in-memory copy of the file image.
///
/// Mutable only through the pointer writes used by the relocation engine;
/// the disk file is never touched.
pub struct ImageBuf {
    buf: Vec<u8>,
}

impl ImageBuf {
    pub fn new(buf: Vec<u8>) -> ImageBuf {
        ImageBuf { buf }
    }

    pub fn len(&self) -> u64 {
        self.buf.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn data(&self) -> &[u8] {
        &self.buf
    }

    pub fn slice(&self, offset: Raw, length: usize) -> Result<&[u8]> {
        let start = offset.0 as usize;
        let end = start
            .checked_add(length)
            .ok_or(BufError::OutOfBounds(offset.0))?;
        if end > self.buf.len() {
            return Err(BufError::OutOfBounds(offset.0).into());
        }
        Ok(&self.buf[start..end])
    }

    pub fn read_u8(&self, offset: Raw) -> Result<u8> {
        Ok(self.slice(offset, 1)?[0])
    }

    pub fn read_u16(&self, offset: Raw) -> Result<u16> {
        Ok(LittleEndian::read_u16(self.slice(offset, 2)?))
    }

    pub fn read_u32(&self, offset: Raw) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.slice(offset, 4)?))
    }

    pub fn read_u64(&self, offset: Raw) -> Result<u64> {
        Ok(LittleEndian::read_u64(self.slice(offset, 8)?))
    }

    /// Read a pointer-sized value, widened to u64.
    pub fn read_pointer(&self, is_64: bool, offset: Raw) -> Result<u64> {
        if is_64 {
            self.read_u64(offset)
        } else {
            Ok(self.read_u32(offset)? as u64)
        }
    }

    /// Read a NULL-terminated, ASCII-encoded string at the given offset.
    pub fn read_ascii(&self, offset: Raw) -> Result<String> {
        let start = offset.0 as usize;
        if start >= self.buf.len() {
            return Err(BufError::OutOfBounds(offset.0).into());
        }

        let buf: Vec<u8> = self.buf[start..]
            .iter()
            .copied()
            .take_while(|&c| c != 0)
            .collect();

        if !buf.is_ascii() {
            return Err(BufError::BadString(offset.0).into());
        }

        String::from_utf8(buf).map_err(|_| BufError::BadString(offset.0).into())
    }

    pub fn write_u32(&mut self, offset: Raw, v: u32) -> Result<()> {
        let start = offset.0 as usize;
        if start + 4 > self.buf.len() {
            return Err(BufError::OutOfBounds(offset.0).into());
        }
        LittleEndian::write_u32(&mut self.buf[start..start + 4], v);
        Ok(())
    }

    pub fn write_u64(&mut self, offset: Raw, v: u64) -> Result<()> {
        let start = offset.0 as usize;
        if start + 8 > self.buf.len() {
            return Err(BufError::OutOfBounds(offset.0).into());
        }
        LittleEndian::write_u64(&mut self.buf[start..start + 8], v);
        Ok(())
    }

    /// Write a pointer-sized value, truncating to u32 on 32-bit images.
    pub fn write_pointer(&mut self, is_64: bool, offset: Raw, v: u64) -> Result<()> {
        if is_64 {
            self.write_u64(offset, v)
        } else {
            self.write_u32(offset, v as u32)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads() -> Result<()> {
        let buf = ImageBuf::new(vec![0x4d, 0x5a, 0x90, 0x00, 0x03, 0x00, 0x00, 0x00]);

        assert_eq!(buf.read_u8(Raw(0))?, 0x4d);
        assert_eq!(buf.read_u16(Raw(0))?, 0x5a4d);
        assert_eq!(buf.read_u32(Raw(0))?, 0x0090_5a4d);
        assert_eq!(buf.read_u64(Raw(0))?, 0x0000_0003_0090_5a4d);

        assert_eq!(buf.read_pointer(false, Raw(4))?, 0x3);
        assert_eq!(buf.read_pointer(true, Raw(0))?, 0x0000_0003_0090_5a4d);

        assert!(buf.read_u32(Raw(6)).is_err());
        assert!(buf.read_u8(Raw(8)).is_err());

        Ok(())
    }

    #[test]
    fn ascii() -> Result<()> {
        let mut data = b"kernel32.dll\0".to_vec();
        data.extend_from_slice(b"HeapAlloc\0");
        let buf = ImageBuf::new(data);

        assert_eq!(buf.read_ascii(Raw(0))?, "kernel32.dll");
        assert_eq!(buf.read_ascii(Raw(13))?, "HeapAlloc");

        Ok(())
    }

    #[test]
    fn writes() -> Result<()> {
        let mut buf = ImageBuf::new(vec![0u8; 16]);

        buf.write_pointer(true, Raw(0), 0x1_8000_0010)?;
        assert_eq!(buf.read_u64(Raw(0))?, 0x1_8000_0010);

        buf.write_pointer(false, Raw(8), 0x1_0040_1000)?;
        // truncated to 32 bits.
        assert_eq!(buf.read_u32(Raw(8))?, 0x0040_1000);

        Ok(())
    }
}
