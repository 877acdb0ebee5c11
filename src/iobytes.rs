//! Bounds-checked big-endian cursors over borrowed byte ranges.
//!
//! Every packet in this crate is parsed through a [`BytesReader`] and built
//! through a [`BytesWriter`]. Both keep the same start/position/length shape so
//! a reader can be made from any slice without copying.

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum IoError {
    #[error("short buffer: needed {needed} bytes, {remaining} remaining")]
    ShortBuffer { needed: usize, remaining: usize },
    #[error("buffer full: needed {needed} bytes, {remaining} remaining")]
    BufferFull { needed: usize, remaining: usize },
    #[error("seek to {position} outside buffer of {len} bytes")]
    SeekOutOfBounds { position: usize, len: usize },
}

#[derive(Debug, Clone)]
pub struct BytesReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BytesReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        BytesReader { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_eof(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Moves the cursor to an absolute offset within the buffer. Seeking to
    /// one-past-the-end is allowed; it leaves the reader at EOF.
    pub fn seek(&mut self, position: usize) -> Result<(), IoError> {
        if position > self.data.len() {
            return Err(IoError::SeekOutOfBounds {
                position,
                len: self.data.len(),
            });
        }
        self.pos = position;
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], IoError> {
        if n > self.remaining() {
            return Err(IoError::ShortBuffer {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, IoError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, IoError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, IoError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64, IoError> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], IoError> {
        self.take(n)
    }

    /// Everything from the cursor to the end of the buffer, consuming it.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let slice = &self.data[self.pos..];
        self.pos = self.data.len();
        slice
    }

    /// Hex rendering of the whole underlying buffer, for drop-with-debug-log
    /// paths. Long packets are truncated.
    pub fn hex_dump(&self) -> String {
        hex_dump(self.data)
    }
}

pub fn hex_dump(data: &[u8]) -> String {
    const MAX: usize = 64;
    let mut out = String::with_capacity(data.len().min(MAX) * 3 + 8);
    for (i, byte) in data.iter().take(MAX).enumerate() {
        if i > 0 {
            out.push(if i % 16 == 0 { '|' } else { ' ' });
        }
        out.push_str(&format!("{byte:02x}"));
    }
    if data.len() > MAX {
        out.push_str(&format!(" .. ({} bytes)", data.len()));
    }
    out
}

#[derive(Debug)]
pub struct BytesWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> BytesWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        BytesWriter { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn seek(&mut self, position: usize) -> Result<(), IoError> {
        if position > self.buf.len() {
            return Err(IoError::SeekOutOfBounds {
                position,
                len: self.buf.len(),
            });
        }
        self.pos = position;
        Ok(())
    }

    fn reserve(&mut self, n: usize) -> Result<&mut [u8], IoError> {
        if n > self.remaining() {
            return Err(IoError::BufferFull {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let slice = &mut self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn write_u8(&mut self, value: u8) -> Result<(), IoError> {
        self.reserve(1)?[0] = value;
        Ok(())
    }

    pub fn write_u16(&mut self, value: u16) -> Result<(), IoError> {
        self.reserve(2)?.copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    pub fn write_u32(&mut self, value: u32) -> Result<(), IoError> {
        self.reserve(4)?.copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    pub fn write_u64(&mut self, value: u64) -> Result<(), IoError> {
        self.reserve(8)?.copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    pub fn write_bytes(&mut self, data: &[u8]) -> Result<(), IoError> {
        self.reserve(data.len())?.copy_from_slice(data);
        Ok(())
    }

    /// The bytes written so far.
    pub fn written(&self) -> &[u8] {
        &self.buf[..self.pos]
    }
}
