//! The shared memory segment and its atomic word accessor.
//!
//! The database segment may be mapped at a different virtual address in every
//! process that attaches to it, so nothing inside it is ever referred to by a
//! process-local pointer. All cross-references are byte offsets from the
//! segment base, and offset 0 is the null offset (the header occupies the low
//! offsets, so no valid word ever lives there).
//!
//! Every mutation of a shared word goes through one of the atomic methods
//! below. They are sequentially consistent, which is what LOCK-prefixed
//! operations deliver on x86 and is sufficient for both locking algorithms:
//! any read of a word published through these methods observes the
//! publishing write.

use core::mem;
use core::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;
use log::error;

use crate::{LockError, Offset, Word};

pub(crate) type AtomicWord = AtomicU64;

/// Size of one segment word in bytes.
pub(crate) const WORD_BYTES: usize = mem::size_of::<Word>();

/// Per-node padding unit. One queue node occupies a multiple of this, so
/// requesters spinning on their own node never share a cache line.
pub(crate) const SYN_VAR_PADDING: usize = mem::align_of::<CachePadded<Word>>();

const_assert!(SYN_VAR_PADDING >= WORD_BYTES);
const_assert!(SYN_VAR_PADDING % WORD_BYTES == 0);

/// Mark written to the first word of every formatted segment.
const MAGIC_MARK: Word = 0x736d_6c6f_636b_3031;

// Header word offsets, in bytes from the segment base.
pub(crate) const MAGIC_OFF: Offset = 0;
pub(crate) const LENGTH_OFF: Offset = 8;
pub(crate) const GLOBAL_LOCK_OFF: Offset = 16;
pub(crate) const TAIL_OFF: Offset = 24;
pub(crate) const NEXT_WRITER_OFF: Offset = 32;
pub(crate) const READER_COUNT_OFF: Offset = 40;
pub(crate) const STORAGE_OFF: Offset = 48;
pub(crate) const MAX_NODES_OFF: Offset = 56;
pub(crate) const FREELIST_OFF: Offset = 64;

const HEADER_BYTES: usize = 72;

/// First byte of the node pool: the header rounded up to the padding unit.
pub(crate) const POOL_BASE: usize =
    ((HEADER_BYTES + SYN_VAR_PADDING - 1) / SYN_VAR_PADDING) * SYN_VAR_PADDING;

const_assert!(POOL_BASE >= HEADER_BYTES);

enum Backing {
    /// Segment allocated by this process, used by tests and single-process
    /// databases.
    Owned(Box<[AtomicWord]>),
    /// Externally mapped region; the mapping outlives the handle.
    Mapped {
        base: *const AtomicWord,
        words: usize,
    },
}

/// A shared memory segment holding the lock control words and the queue-node
/// pool, addressed by byte offsets from its base.
pub struct Segment {
    backing: Backing,
}

// The mapped variant carries a raw pointer, but every access to the region
// goes through atomic operations on whole words.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Allocate an owned, zeroed segment of at least `bytes` bytes.
    pub(crate) fn with_capacity(bytes: usize) -> Segment {
        let words = (bytes + WORD_BYTES - 1) / WORD_BYTES;
        let slab = (0..words)
            .map(|_| AtomicWord::new(0))
            .collect::<Vec<AtomicWord>>()
            .into_boxed_slice();
        Segment {
            backing: Backing::Owned(slab),
        }
    }

    /// Wrap an externally mapped region.
    ///
    /// # Safety
    ///
    /// `base` must point to a readable and writable mapping of at least `len`
    /// bytes that stays valid for the lifetime of the returned segment, and
    /// no non-atomic access to the region may happen while it is shared.
    pub(crate) unsafe fn from_raw(base: *mut u8, len: usize) -> Result<Segment, LockError> {
        if base.is_null() || base as usize % mem::align_of::<AtomicWord>() != 0 {
            error!("segment base pointer is null or misaligned");
            return Err(LockError::InvalidHandle);
        }
        if len < POOL_BASE {
            error!("segment of {} bytes cannot hold the lock header", len);
            return Err(LockError::SegmentTooSmall);
        }
        Ok(Segment {
            backing: Backing::Mapped {
                base: base as *const AtomicWord,
                words: len / WORD_BYTES,
            },
        })
    }

    fn words(&self) -> &[AtomicWord] {
        match &self.backing {
            Backing::Owned(slab) => &slab[..],
            // Valid per the `from_raw` contract.
            Backing::Mapped { base, words } => unsafe {
                core::slice::from_raw_parts(*base, *words)
            },
        }
    }

    /// Total segment size in bytes.
    pub fn len(&self) -> usize {
        self.words().len() * WORD_BYTES
    }

    /// Base address of the segment, for handing to another attacher.
    pub fn as_ptr(&self) -> *const u8 {
        self.words().as_ptr() as *const u8
    }

    fn word(&self, off: Offset) -> &AtomicWord {
        debug_assert!(off as usize % WORD_BYTES == 0, "unaligned word offset");
        &self.words()[off as usize / WORD_BYTES]
    }

    /// Write the segment mark and pool geometry. Single-threaded, done once
    /// at creation before the segment is shared.
    pub(crate) fn format(&self, max_nodes: usize, node_bytes: usize) -> Result<(), LockError> {
        let pool = max_nodes
            .checked_mul(node_bytes)
            .and_then(|p| p.checked_add(POOL_BASE))
            .ok_or(LockError::SegmentTooSmall)?;
        if pool > self.len() {
            error!(
                "segment of {} bytes cannot hold {} lock nodes",
                self.len(),
                max_nodes
            );
            return Err(LockError::SegmentTooSmall);
        }
        self.store(LENGTH_OFF, self.len() as Word);
        self.store(STORAGE_OFF, POOL_BASE as Word);
        self.store(MAX_NODES_OFF, max_nodes as Word);
        self.store(MAGIC_OFF, MAGIC_MARK);
        Ok(())
    }

    /// Validate the handle before touching any lock word.
    pub(crate) fn check(&self) -> Result<(), LockError> {
        if self.load(MAGIC_OFF) != MAGIC_MARK || self.load(LENGTH_OFF) != self.len() as Word {
            error!("database handle check failed: segment mark or length mismatch");
            return Err(LockError::InvalidHandle);
        }
        Ok(())
    }

    pub(crate) fn load(&self, off: Offset) -> Word {
        self.word(off).load(Ordering::SeqCst)
    }

    pub(crate) fn store(&self, off: Offset, val: Word) {
        self.word(off).store(val, Ordering::SeqCst)
    }

    /// Add `d` to the word, returning the prior value.
    pub(crate) fn fetch_add(&self, off: Offset, d: Word) -> Word {
        self.word(off).fetch_add(d, Ordering::SeqCst)
    }

    /// Subtract `d` from the word, returning the prior value.
    pub(crate) fn fetch_sub(&self, off: Offset, d: Word) -> Word {
        self.word(off).fetch_sub(d, Ordering::SeqCst)
    }

    pub(crate) fn fetch_and(&self, off: Offset, mask: Word) -> Word {
        self.word(off).fetch_and(mask, Ordering::SeqCst)
    }

    pub(crate) fn fetch_or(&self, off: Offset, bits: Word) -> Word {
        self.word(off).fetch_or(bits, Ordering::SeqCst)
    }

    /// Unconditional swap, returning the prior value.
    pub(crate) fn swap(&self, off: Offset, val: Word) -> Word {
        self.word(off).swap(val, Ordering::SeqCst)
    }

    /// Returns true iff the word was `old` and is now `new`.
    pub(crate) fn compare_and_swap(&self, off: Offset, old: Word, new: Word) -> bool {
        self.word(off)
            .compare_exchange(old, new, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_capacity_is_zeroed() {
        let seg = Segment::with_capacity(256);
        assert_eq!(seg.len(), 256);
        for off in (0..256).step_by(WORD_BYTES) {
            assert_eq!(seg.load(off as Offset), 0);
        }
    }

    #[test]
    fn test_atomic_ops() {
        let seg = Segment::with_capacity(POOL_BASE);
        let off = GLOBAL_LOCK_OFF;

        assert_eq!(seg.fetch_add(off, 10), 0);
        assert_eq!(seg.fetch_sub(off, 4), 10);
        assert_eq!(seg.load(off), 6);

        assert_eq!(seg.fetch_or(off, 0x9), 6);
        assert_eq!(seg.fetch_and(off, !0x1), 0xf);
        assert_eq!(seg.load(off), 0xe);

        assert_eq!(seg.swap(off, 42), 0xe);
        assert!(seg.compare_and_swap(off, 42, 7));
        assert!(!seg.compare_and_swap(off, 42, 7));
        assert_eq!(seg.load(off), 7);
    }

    #[test]
    fn test_format_and_check() {
        let seg = Segment::with_capacity(POOL_BASE + 4 * SYN_VAR_PADDING);
        assert!(seg.check().is_err());

        seg.format(4, SYN_VAR_PADDING).unwrap();
        assert!(seg.check().is_ok());
        assert_eq!(seg.load(STORAGE_OFF), POOL_BASE as Word);
        assert_eq!(seg.load(MAX_NODES_OFF), 4);
    }

    #[test]
    fn test_format_rejects_oversized_pool() {
        let seg = Segment::with_capacity(POOL_BASE + SYN_VAR_PADDING);
        assert_eq!(
            seg.format(2, SYN_VAR_PADDING),
            Err(LockError::SegmentTooSmall)
        );
    }

    #[test]
    fn test_from_raw_rejects_null() {
        let res = unsafe { Segment::from_raw(core::ptr::null_mut(), 4096) };
        assert_eq!(res.err(), Some(LockError::InvalidHandle));
    }
}
