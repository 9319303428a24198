//! Memory header corruption guard.
//!
//! Every block handed out by the collector is prefixed with a 16-byte
//! [`MemoryHeader`] `[u64 size word | u64 checksum]`, where
//! `checksum = address_of_header ^ size_word`. The size word holds the
//! user-requested size; its top bit marks blocks whose allocation was
//! recorded, so a release can tell profiled blocks from ones handed out while
//! the profiler itself was allocating. The header sits immediately before the
//! user pointer; the distance from the raw allocation to the user pointer is
//! `max(HEADER_SIZE, align)` so any alignment request is honoured.
//!
//! [`HeaderLayout::acquire`] writes the header and yields the user pointer;
//! [`HeaderLayout::release`] validates it and yields the raw allocation back.
//! A mismatch on release is unrecoverable corruption: the header itself can
//! no longer be trusted, so callers must abort rather than continue.

#![allow(unsafe_code)]

use std::ptr::NonNull;

use thiserror::Error;

/// Size of the header in front of every guarded block.
pub const HEADER_SIZE: usize = 16;

/// Alignment the header scheme guarantees at minimum.
pub const MIN_ALIGN: usize = 16;

/// Size-word bit set on blocks whose allocation was recorded.
pub const TRACKED_FLAG: u64 = 1 << 63;

/// Header stored immediately before a user-visible buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct MemoryHeader {
    /// User-requested size, plus [`TRACKED_FLAG`] for recorded blocks.
    pub size_word: u64,
    /// `address_of_header ^ size_word`.
    pub checksum: u64,
}

impl MemoryHeader {
    /// Header for a block of `size` bytes whose header lives at `header_addr`.
    #[must_use]
    pub fn compute(header_addr: usize, size: usize, tracked: bool) -> Self {
        let mut size_word = size as u64 & !TRACKED_FLAG;
        if tracked {
            size_word |= TRACKED_FLAG;
        }
        Self {
            size_word,
            checksum: header_addr as u64 ^ size_word,
        }
    }

    /// User size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        usize::try_from(self.size_word & !TRACKED_FLAG).unwrap_or(usize::MAX)
    }

    /// Whether the block's allocation was recorded.
    #[must_use]
    pub fn is_tracked(&self) -> bool {
        self.size_word & TRACKED_FLAG != 0
    }

    /// Check the stored checksum against the header's own address.
    pub fn verify(&self, header_addr: usize) -> Result<(), HeaderError> {
        let expected = header_addr as u64 ^ self.size_word;
        if expected != self.checksum {
            return Err(HeaderError::Corrupted {
                header_addr,
                stored_word: self.size_word,
                stored_checksum: self.checksum,
                expected_checksum: expected,
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.size_word.to_le_bytes());
        buf[8..16].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    #[must_use]
    pub fn from_bytes(buf: &[u8; HEADER_SIZE]) -> Self {
        let mut size_word = [0u8; 8];
        let mut checksum = [0u8; 8];
        size_word.copy_from_slice(&buf[0..8]);
        checksum.copy_from_slice(&buf[8..16]);
        Self {
            size_word: u64::from_le_bytes(size_word),
            checksum: u64::from_le_bytes(checksum),
        }
    }
}

/// Header validation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HeaderError {
    #[error(
        "memory header at {header_addr:#x} is corrupted (size word {stored_word:#x}, checksum {stored_checksum:#x}, expected {expected_checksum:#x})"
    )]
    Corrupted {
        header_addr: usize,
        stored_word: u64,
        stored_checksum: u64,
        expected_checksum: u64,
    },
}

/// Raw allocation recovered from a released block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleasedBlock {
    /// Start of the underlying allocation.
    pub raw: NonNull<u8>,
    /// User size recorded in the header.
    pub size: usize,
    /// Whether the block's allocation was recorded.
    pub tracked: bool,
}

/// Placement of the header for one alignment class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderLayout {
    offset: usize,
    align: usize,
}

impl HeaderLayout {
    /// Layout for blocks aligned to `align` (a power of two).
    #[must_use]
    pub fn for_align(align: usize) -> Self {
        let align = align.max(MIN_ALIGN);
        Self {
            offset: align.max(HEADER_SIZE),
            align,
        }
    }

    /// Distance from the raw allocation to the user pointer.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Alignment of the raw allocation.
    #[must_use]
    pub fn align(&self) -> usize {
        self.align
    }

    /// Raw bytes needed for a `user_size`-byte block, `None` on overflow.
    #[must_use]
    pub fn total_size(&self, user_size: usize) -> Option<usize> {
        user_size.checked_add(self.offset)
    }

    /// Write the header into `raw` and return the user pointer.
    ///
    /// # Safety
    ///
    /// `raw` must be valid for writes of `self.total_size(user_size)` bytes and
    /// aligned to `self.align()`.
    pub unsafe fn acquire(
        &self,
        raw: NonNull<u8>,
        user_size: usize,
        tracked: bool,
    ) -> NonNull<u8> {
        // SAFETY: offset < total size, so the user pointer stays inside the
        // allocation and is non-null.
        let user = unsafe { raw.add(self.offset) };
        // SAFETY: offset >= HEADER_SIZE, so the header lies within [raw, user).
        let header_ptr = unsafe { user.sub(HEADER_SIZE) };
        let header = MemoryHeader::compute(header_ptr.as_ptr() as usize, user_size, tracked);
        // SAFETY: header_ptr is valid for HEADER_SIZE bytes of writes.
        unsafe { write_header(header_ptr, header) };
        user
    }

    /// Set the tracked bit on a live block whose allocation has been
    /// recorded. The size is kept and the checksum recomputed.
    ///
    /// # Safety
    ///
    /// Same contract as [`HeaderLayout::read`].
    pub unsafe fn mark_tracked(&self, user: NonNull<u8>) {
        // SAFETY: forwarded contract.
        let header = unsafe { self.read(user) };
        // SAFETY: acquire placed the header in the HEADER_SIZE bytes before user.
        let header_ptr = unsafe { user.sub(HEADER_SIZE) };
        let stamped = MemoryHeader::compute(header_ptr.as_ptr() as usize, header.size(), true);
        // SAFETY: header_ptr is valid for HEADER_SIZE bytes of writes.
        unsafe { write_header(header_ptr, stamped) };
    }

    /// Read the header in front of `user` without validating it.
    ///
    /// # Safety
    ///
    /// `user` must have been produced by [`HeaderLayout::acquire`] with a
    /// layout of the same alignment, and the block must still be allocated.
    pub unsafe fn read(&self, user: NonNull<u8>) -> MemoryHeader {
        // SAFETY: acquire placed the header in the HEADER_SIZE bytes before user.
        let header_ptr = unsafe { user.sub(HEADER_SIZE) };
        let mut bytes = [0u8; HEADER_SIZE];
        // SAFETY: header_ptr is valid for HEADER_SIZE bytes of reads.
        unsafe {
            std::ptr::copy_nonoverlapping(header_ptr.as_ptr(), bytes.as_mut_ptr(), HEADER_SIZE);
        }
        MemoryHeader::from_bytes(&bytes)
    }

    /// Read and validate the header in front of `user`.
    ///
    /// # Safety
    ///
    /// Same contract as [`HeaderLayout::read`].
    pub unsafe fn inspect(&self, user: NonNull<u8>) -> Result<MemoryHeader, HeaderError> {
        // SAFETY: forwarded contract.
        let header = unsafe { self.read(user) };
        header.verify(user.as_ptr() as usize - HEADER_SIZE)?;
        Ok(header)
    }

    /// Start of the raw allocation behind `user`.
    ///
    /// # Safety
    ///
    /// Same contract as [`HeaderLayout::read`].
    pub unsafe fn raw_of(&self, user: NonNull<u8>) -> NonNull<u8> {
        // SAFETY: acquire computed user as raw + offset.
        unsafe { user.sub(self.offset) }
    }

    /// Validate the header in front of `user`, poison it, and return the raw
    /// allocation so the caller can hand it back to the backing allocator.
    ///
    /// Poisoning makes a second release of the same block fail validation.
    ///
    /// # Safety
    ///
    /// Same contract as [`HeaderLayout::inspect`].
    pub unsafe fn release(&self, user: NonNull<u8>) -> Result<ReleasedBlock, HeaderError> {
        // SAFETY: forwarded contract.
        let header = unsafe { self.inspect(user) }?;
        // SAFETY: the header bytes precede user and belong to the block.
        let header_ptr = unsafe { user.sub(HEADER_SIZE) };
        let poisoned = MemoryHeader {
            size_word: header.size_word,
            checksum: !header.checksum,
        };
        // SAFETY: header_ptr is valid for HEADER_SIZE bytes of writes.
        unsafe { write_header(header_ptr, poisoned) };
        // SAFETY: forwarded contract.
        let raw = unsafe { self.raw_of(user) };
        Ok(ReleasedBlock {
            raw,
            size: header.size(),
            tracked: header.is_tracked(),
        })
    }
}

/// # Safety
///
/// `header_ptr` must be valid for `HEADER_SIZE` bytes of writes.
unsafe fn write_header(header_ptr: NonNull<u8>, header: MemoryHeader) {
    let bytes = header.to_bytes();
    // SAFETY: forwarded contract; a local array never overlaps the block.
    unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), header_ptr.as_ptr(), HEADER_SIZE) };
}
