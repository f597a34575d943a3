// Copyright (C) 2024 Ryan Daum <ryan.daum@gmail.com>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! The backing store: one large, contiguous region of `capacity_bytes`,
//! either anonymous memory (tests, ephemeral runs) or a memory-mapped file.
//! Pages are fixed-size 4096-byte slices addressed by index, a single size
//! class, since every page in this store is the same size.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::ptr::null_mut;

use human_bytes::human_bytes;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::page::PAGE_SIZE;

/// A single large mapping, carved into fixed-size pages by index. Owns the
/// raw mapping for its lifetime; `Drop` unmaps it.
pub struct Pool {
    base: *mut u8,
    capacity_bytes: usize,
    // Present only for a file-backed pool; `msync`/`fsync` are no-ops
    // without one.
    file: Option<File>,
}

unsafe impl Send for Pool {}
unsafe impl Sync for Pool {}

impl Pool {
    /// Map `capacity_bytes` of anonymous, zero-filled memory.
    pub fn anonymous(capacity_bytes: usize) -> Result<Self> {
        Self::validate_capacity(capacity_bytes)?;
        let base = unsafe {
            libc::mmap(
                null_mut(),
                capacity_bytes,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(Error::Io { operation: "mmap anonymous pool", source: io::Error::last_os_error() });
        }
        info!(capacity = %human_bytes(capacity_bytes as f64), "mapped anonymous pool");
        Ok(Self { base: base.cast::<u8>(), capacity_bytes, file: None })
    }

    /// Map `capacity_bytes` of a file at `path`, creating/growing it as
    /// needed. Shared so writes are visible to other mappings of the same
    /// file (there are none in this process, but `MAP_SHARED` is what makes
    /// `msync` meaningful).
    pub fn file_backed(path: &Path, capacity_bytes: usize) -> Result<Self> {
        Self::validate_capacity(capacity_bytes)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|source| Error::Io { operation: "open backing file", source })?;
        file.set_len(capacity_bytes as u64)
            .map_err(|source| Error::Io { operation: "grow backing file", source })?;

        let base = unsafe {
            libc::mmap(
                null_mut(),
                capacity_bytes,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(Error::Io { operation: "mmap backing file", source: io::Error::last_os_error() });
        }
        info!(path = %path.display(), capacity = %human_bytes(capacity_bytes as f64), "mapped file-backed pool");
        Ok(Self { base: base.cast::<u8>(), capacity_bytes, file: Some(file) })
    }

    fn validate_capacity(capacity_bytes: usize) -> Result<()> {
        if capacity_bytes == 0 || capacity_bytes % PAGE_SIZE != 0 {
            return Err(Error::InvalidArgument(format!(
                "capacity_bytes {capacity_bytes} must be a positive multiple of {PAGE_SIZE}"
            )));
        }
        let max_bytes = crate::address::MAX_PAGES as usize * PAGE_SIZE;
        if capacity_bytes > max_bytes {
            return Err(Error::InvalidArgument(format!(
                "capacity_bytes {capacity_bytes} exceeds the 24-bit address space ({max_bytes} bytes)"
            )));
        }
        Ok(())
    }

    pub fn capacity_bytes(&self) -> usize {
        self.capacity_bytes
    }

    pub fn page_count(&self) -> u32 {
        (self.capacity_bytes / PAGE_SIZE) as u32
    }

    pub fn is_durable(&self) -> bool {
        self.file.is_some()
    }

    fn offset_of(&self, index: u32) -> usize {
        assert!(index < self.page_count(), "page index {index} out of bounds");
        index as usize * PAGE_SIZE
    }

    /// Inverse of `page`/`page_mut`: recover the page index a previously
    /// borrowed slice of this pool was carved from.
    pub fn index_of(&self, bytes: &[u8]) -> u32 {
        let offset = unsafe { bytes.as_ptr().offset_from(self.base) };
        assert!(offset >= 0, "slice does not belong to this pool");
        let offset = offset as usize;
        assert_eq!(offset % PAGE_SIZE, 0, "slice is not page-aligned");
        (offset / PAGE_SIZE) as u32
    }

    /// Borrow page `index` for reading. The lifetime is tied to `&self`
    /// rather than to any finer-grained lock: exclusivity of writers is a
    /// contract enforced by `PageManager`/`Batch`, not by this type.
    pub fn page(&self, index: u32) -> &[u8] {
        let off = self.offset_of(index);
        unsafe { std::slice::from_raw_parts(self.base.add(off), PAGE_SIZE) }
    }

    /// Borrow page `index` for writing. Safety: the caller must ensure no
    /// other live borrow of the same page exists — `PageManager` upholds
    /// this by only ever handing out a writable page to the single active
    /// batch.
    #[allow(clippy::mut_from_ref)]
    pub fn page_mut(&self, index: u32) -> &mut [u8] {
        let off = self.offset_of(index);
        unsafe { std::slice::from_raw_parts_mut(self.base.add(off), PAGE_SIZE) }
    }

    /// Advise the kernel that a freed page's contents are no longer needed,
    /// so it can be dropped from the working set without being written back.
    pub fn advise_page_free(&self, index: u32) {
        let off = self.offset_of(index);
        unsafe {
            let addr = self.base.add(off);
            if libc::madvise(addr.cast(), PAGE_SIZE, libc::MADV_DONTNEED) != 0 {
                debug!(error = %io::Error::last_os_error(), "madvise(MADV_DONTNEED) failed");
            }
        }
    }

    /// `msync` the whole mapping. A no-op on an anonymous pool.
    pub fn msync(&self) -> Result<()> {
        if self.file.is_none() {
            return Ok(());
        }
        let rc = unsafe { libc::msync(self.base.cast(), self.capacity_bytes, libc::MS_SYNC) };
        if rc != 0 {
            return Err(Error::Io { operation: "msync pool", source: io::Error::last_os_error() });
        }
        Ok(())
    }

    /// `fsync` the backing file's metadata and data. A no-op on an anonymous
    /// pool.
    pub fn fsync(&self) -> Result<()> {
        match &self.file {
            Some(file) => file.sync_all().map_err(|source| Error::Io { operation: "fsync pool", source }),
            None => Ok(()),
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.cast(), self.capacity_bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_pages_are_independently_addressable_and_zeroed() {
        let pool = Pool::anonymous(PAGE_SIZE * 4).unwrap();
        assert_eq!(pool.page_count(), 4);
        assert!(!pool.is_durable());
        assert!(pool.page(0).iter().all(|&b| b == 0));

        pool.page_mut(1)[0] = 0xAB;
        assert_eq!(pool.page(1)[0], 0xAB);
        assert_eq!(pool.page(0)[0], 0, "writes must not leak across pages");
    }

    #[test]
    fn file_backed_pool_persists_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("paprika.db");
        {
            let pool = Pool::file_backed(&path, PAGE_SIZE * 2).unwrap();
            pool.page_mut(0)[..4].copy_from_slice(&[1, 2, 3, 4]);
            pool.msync().unwrap();
        }
        let reopened = Pool::file_backed(&path, PAGE_SIZE * 2).unwrap();
        assert_eq!(&reopened.page(0)[..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn rejects_capacity_not_a_page_multiple() {
        assert!(Pool::anonymous(PAGE_SIZE + 1).is_err());
    }

    #[test]
    fn rejects_capacity_beyond_the_address_space() {
        let too_big = (crate::address::MAX_PAGES as usize + 1) * PAGE_SIZE;
        assert!(Pool::anonymous(too_big).is_err());
    }
}
