//! A growable, byte-addressed memory-mapped region.
//!
//! This is the leaf of the design: everything else (header, lock, table)
//! goes through the atomic/byte-copy primitives here rather than touching
//! the mapping directly. Modeled on the mmap-backed header regions seen
//! across the retrieved example pack (e.g. a POSIX shared-memory header
//! mapped as a `#[repr(C)]` struct of atomics, and a growable append-only
//! store that re-`mmap`s after extending the backing file).
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU32, Ordering};

use memmap2::MmapMut;

use crate::error::{Error, Result};

/// A growable memory-mapped file with a pinned base pointer for the
/// lifetime of each mapping.
///
/// Growing the region (see `resize_to`) drops the old mapping and
/// establishes a new one over the extended file; any references derived
/// from `as_ptr` must not be held across a `resize_to` call.
pub struct MappedRegion {
    path: PathBuf,
    file: File,
    mmap: MmapMut,
}

impl MappedRegion {
    /// Open (or create) the file at `path`, growing it to at least
    /// `min_len` bytes, and map it.
    pub fn open_or_create(path: impl AsRef<Path>, min_len: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        if file.metadata()?.len() < min_len {
            file.set_len(min_len)?;
        }
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(MappedRegion { path, file, mmap })
    }

    /// Grow the backing file to `new_len` bytes (no-op if already that
    /// large or larger) and remap.
    ///
    /// The newly grown tail reads back as all-zero bytes, which is load
    /// bearing: the `+1` bucket/free-list bias and `hashCode == -1` "free
    /// slot" sentinel (stored as zero... see `table::Entry`) both rely on a
    /// freshly extended region being zero-filled by the OS.
    pub fn resize_to(&mut self, new_len: u64) -> Result<()> {
        if self.file.metadata()?.len() < new_len {
            self.file.set_len(new_len)?;
        }
        // Dropping the old mapping before creating the new one avoids
        // holding two live mappings of the same file at once.
        self.mmap = unsafe { MmapMut::map_mut(&self.file)? };
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    #[inline]
    fn base_ptr(&self) -> *mut u8 {
        self.mmap.as_ptr() as *mut u8
    }

    /// Borrow the 32-bit atomic cell at `offset`.
    ///
    /// # Safety
    /// `offset` must be 4-byte aligned and `offset + 4 <= self.len()`.
    #[inline]
    pub fn atomic_i32(&self, offset: usize) -> &AtomicI32 {
        debug_assert!(offset + 4 <= self.len());
        debug_assert_eq!(offset % 4, 0);
        unsafe { &*(self.base_ptr().add(offset) as *const AtomicI32) }
    }

    /// Borrow the unsigned 32-bit atomic cell at `offset`.
    #[inline]
    pub fn atomic_u32(&self, offset: usize) -> &AtomicU32 {
        debug_assert!(offset + 4 <= self.len());
        debug_assert_eq!(offset % 4, 0);
        unsafe { &*(self.base_ptr().add(offset) as *const AtomicU32) }
    }

    /// Borrow the 64-bit atomic cell at `offset`.
    #[inline]
    pub fn atomic_i64(&self, offset: usize) -> &AtomicI64 {
        debug_assert!(offset + 8 <= self.len());
        debug_assert_eq!(offset % 8, 0);
        unsafe { &*(self.base_ptr().add(offset) as *const AtomicI64) }
    }

    /// Byte-wise copy of `len` bytes from `src_offset` to `dst_offset`
    /// within this same region. Ranges may overlap.
    ///
    /// Takes `&self`, not `&mut self`: like the atomic accessors above,
    /// this is a raw write into shared, cross-process memory whose
    /// exclusivity is guaranteed by the write lock (see `lock`), not by
    /// Rust's borrow checker. Only safe to call on bytes the seqlock
    /// reader protocol guarantees are not concurrently observed (entry
    /// payload bytes of a slot not yet reachable from any bucket/chain, or
    /// already unlinked from one).
    pub fn copy_within(&self, dst_offset: usize, src_offset: usize, len: usize) {
        debug_assert!(dst_offset + len <= self.len());
        debug_assert!(src_offset + len <= self.len());
        unsafe {
            let base = self.base_ptr();
            std::ptr::copy(base.add(src_offset), base.add(dst_offset), len);
        }
    }

    /// Read `len` bytes starting at `offset` into `out`.
    pub fn read_bytes(&self, offset: usize, out: &mut [u8]) {
        debug_assert!(offset + out.len() <= self.len());
        out.copy_from_slice(&self.mmap[offset..offset + out.len()]);
    }

    /// Write `buf` into the region starting at `offset`. See `copy_within`
    /// for why this takes `&self`.
    pub fn write_bytes(&self, offset: usize, buf: &[u8]) {
        debug_assert!(offset + buf.len() <= self.len());
        unsafe {
            std::ptr::copy_nonoverlapping(buf.as_ptr(), self.base_ptr().add(offset), buf.len());
        }
    }

    /// Plain (non-atomic) read of a `T: Copy` value at `offset`. Used for
    /// key/value payloads, which are not part of the header and are never
    /// raced on by the seqlock protocol's readers while a writer is
    /// concurrently touching the *same* slot (see `table` module).
    pub fn read_pod<T: Copy>(&self, offset: usize) -> T {
        debug_assert!(offset + std::mem::size_of::<T>() <= self.len());
        unsafe { std::ptr::read_unaligned(self.base_ptr().add(offset) as *const T) }
    }

    /// Plain (non-atomic) write of a `T: Copy` value at `offset`. See
    /// `copy_within` for why this takes `&self`.
    pub fn write_pod<T: Copy>(&self, offset: usize, value: T) {
        debug_assert!(offset + std::mem::size_of::<T>() <= self.len());
        unsafe { std::ptr::write_unaligned(self.base_ptr().add(offset) as *mut T, value) };
    }

    pub fn flush(&self) -> Result<()> {
        self.mmap.flush().map_err(Error::from)
    }
}
