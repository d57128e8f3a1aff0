//! File primitive used by file-backed pages.
//!
//! The VM core never walks a filesystem; it only reads and writes byte
//! ranges of files the loader or mmap path already opened. Every call is
//! made under the system-wide fs lock ([`crate::system::VmSystem`]),
//! which is never held across a swap operation.

use crate::sync::TicketMutex;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use nephron_shared::mem::PAGE_FRAME_SIZE;

pub trait BackingFile: Send + Sync {
    /// Read up to `buf.len()` bytes at `offset`; returns bytes read
    /// (short at end of file).
    fn read_at(&self, buf: &mut [u8], offset: u64) -> usize;

    /// Write `buf` at `offset` within the file's existing extent;
    /// returns bytes written.
    fn write_at(&self, buf: &[u8], offset: u64) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One file-backed page: `read_bytes` from `offset`, then `zero_bytes` of
/// zero fill. The two always cover the page exactly.
#[derive(Clone)]
pub struct FileSlice {
    pub file: Arc<dyn BackingFile>,
    pub offset: u64,
    pub read_bytes: usize,
    pub zero_bytes: usize,
}

impl FileSlice {
    /// # Panics
    ///
    /// Panics unless `read_bytes + zero_bytes == PAGE_FRAME_SIZE`.
    pub fn new(file: Arc<dyn BackingFile>, offset: u64, read_bytes: usize) -> Self {
        assert!(read_bytes <= PAGE_FRAME_SIZE);
        Self {
            file,
            offset,
            read_bytes,
            zero_bytes: PAGE_FRAME_SIZE - read_bytes,
        }
    }
}

impl fmt::Debug for FileSlice {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FileSlice")
            .field("offset", &self.offset)
            .field("read_bytes", &self.read_bytes)
            .field("zero_bytes", &self.zero_bytes)
            .finish()
    }
}

/// Memory-backed file for tests and hosts without storage.
pub struct MemFile {
    data: TicketMutex<Vec<u8>>,
}

impl MemFile {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: TicketMutex::new(data),
        }
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl BackingFile for MemFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> usize {
        let data = self.data.lock();
        let offset = offset as usize;
        if offset >= data.len() {
            return 0;
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        n
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> usize {
        let mut data = self.data.lock();
        let offset = offset as usize;
        if offset >= data.len() {
            return 0;
        }
        let n = buf.len().min(data.len() - offset);
        data[offset..offset + n].copy_from_slice(&buf[..n]);
        n
    }

    fn len(&self) -> usize {
        self.data.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn read_write_at() {
        let file = MemFile::new(vec![0u8; 16]);
        assert_eq!(file.write_at(b"abcd", 4), 4);
        let mut buf = [0u8; 8];
        assert_eq!(file.read_at(&mut buf, 2), 8);
        assert_eq!(&buf[2..6], b"abcd");
    }

    #[test]
    fn short_read_at_eof() {
        let file = MemFile::new(vec![9u8; 10]);
        let mut buf = [0u8; 8];
        assert_eq!(file.read_at(&mut buf, 6), 4);
        assert_eq!(file.read_at(&mut buf, 10), 0);
        assert_eq!(file.write_at(b"x", 10), 0);
    }

    #[test]
    fn slice_covers_page() {
        let file: Arc<dyn BackingFile> = Arc::new(MemFile::new(vec![1u8; 100]));
        let slice = FileSlice::new(file, 0, 100);
        assert_eq!(slice.read_bytes + slice.zero_bytes, PAGE_FRAME_SIZE);
    }
}
