//! Kernel printf buffer.
//!
//! The buffer is page-aligned host memory that kernels append text records
//! to. The first dword holds the header size; the second holds the current
//! write offset, which starts right after the header.

use std::io::Write;

use md_common::{CmError, CmResult};
use tracing::debug;

use crate::surface::PAGE_SIZE;

pub const PRINT_HEADER_SIZE: u32 = 8;

#[derive(Clone)]
#[repr(C, align(4096))]
struct Page([u8; PAGE_SIZE]);

pub struct PrintBuffer {
    pages: Box<[Page]>,
    size: usize,
}

impl PrintBuffer {
    /// Allocate at least `size` bytes, rounded up to whole pages.
    pub fn new(size: usize) -> CmResult<Self> {
        if size <= PRINT_HEADER_SIZE as usize {
            return Err(CmError::InvalidArgValue(format!(
                "print buffer of {size} bytes has no room past its header"
            )));
        }
        if size > u32::MAX as usize {
            return Err(CmError::InvalidArgValue(format!("print buffer of {size} bytes")));
        }
        let page_count = size.div_ceil(PAGE_SIZE);
        let mut buffer = Self {
            pages: vec![Page([0; PAGE_SIZE]); page_count].into_boxed_slice(),
            size: page_count * PAGE_SIZE,
        };
        buffer.reset();
        debug!(size = buffer.size, "Print buffer allocated");
        Ok(buffer)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Page-aligned address handed to the device as a host buffer.
    pub fn host_addr(&self) -> usize {
        self.pages.as_ptr() as usize
    }

    pub fn write_offset(&self) -> u32 {
        self.read_u32(4)
    }

    /// Append a record the way a kernel would. Returns the bytes stored;
    /// records past the end are truncated.
    pub fn write(&mut self, record: &[u8]) -> usize {
        let offset = self.write_offset() as usize;
        let stored = record.len().min(self.size.saturating_sub(offset));
        for (i, byte) in record[..stored].iter().enumerate() {
            self.set_byte(offset + i, *byte);
        }
        self.write_u32(4, (offset + stored) as u32);
        stored
    }

    /// Text written since the last flush.
    pub fn contents(&self) -> Vec<u8> {
        let end = self.write_offset() as usize;
        (PRINT_HEADER_SIZE as usize..end).map(|i| self.byte(i)).collect()
    }

    /// Dump the pending text to `out` and rewind. Returns the bytes written.
    pub fn flush(&mut self, out: &mut dyn Write) -> CmResult<usize> {
        let text = self.contents();
        out.write_all(&text)
            .and_then(|()| out.flush())
            .map_err(|e| CmError::Failure(format!("print buffer flush: {e}")))?;
        self.reset();
        Ok(text.len())
    }

    fn reset(&mut self) {
        self.write_u32(0, PRINT_HEADER_SIZE);
        self.write_u32(4, PRINT_HEADER_SIZE);
    }

    fn byte(&self, at: usize) -> u8 {
        self.pages[at / PAGE_SIZE].0[at % PAGE_SIZE]
    }

    fn set_byte(&mut self, at: usize, value: u8) {
        self.pages[at / PAGE_SIZE].0[at % PAGE_SIZE] = value;
    }

    fn read_u32(&self, at: usize) -> u32 {
        u32::from_le_bytes([self.byte(at), self.byte(at + 1), self.byte(at + 2), self.byte(at + 3)])
    }

    fn write_u32(&mut self, at: usize, value: u32) {
        for (i, byte) in value.to_le_bytes().into_iter().enumerate() {
            self.set_byte(at + i, byte);
        }
    }
}

impl std::fmt::Debug for PrintBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrintBuffer")
            .field("size", &self.size)
            .field("write_offset", &self.write_offset())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounded_to_pages_and_aligned() {
        let buf = PrintBuffer::new(5000).unwrap();
        assert_eq!(buf.size(), 2 * PAGE_SIZE);
        assert_eq!(buf.host_addr() % PAGE_SIZE, 0);
        assert_eq!(buf.write_offset(), PRINT_HEADER_SIZE);
    }

    #[test]
    fn header_only_size_rejected() {
        assert!(matches!(PrintBuffer::new(8), Err(CmError::InvalidArgValue(_))));
    }

    #[test]
    fn flush_dumps_and_rewinds() {
        let mut buf = PrintBuffer::new(PAGE_SIZE).unwrap();
        buf.write(b"hello ");
        buf.write(b"world\n");
        let mut out = Vec::new();
        assert_eq!(buf.flush(&mut out).unwrap(), 12);
        assert_eq!(out, b"hello world\n");
        assert!(buf.contents().is_empty());
    }

    #[test]
    fn overflow_truncates() {
        let mut buf = PrintBuffer::new(PAGE_SIZE).unwrap();
        let record = vec![b'x'; PAGE_SIZE];
        assert_eq!(buf.write(&record), PAGE_SIZE - PRINT_HEADER_SIZE as usize);
        assert_eq!(buf.write(b"more"), 0);
    }
}
