//! Database-wide reader/writer locking over a shared memory segment.
//!
//! Write transactions are serialized against each other and against readers;
//! readers run in parallel. All lock state lives inside the database memory
//! segment and is manipulated with atomic operations and bounded
//! busy-waiting only, so processes mapping the same segment coordinate
//! without any operating-system mutex.
//!
//! Two interchangeable algorithms are provided. The default is the
//! global-flag lock, one word encoding a writer flag and a reader count; it
//! is cheap but lets readers starve writers. The `queued-locks` feature
//! selects the fair FIFO lock instead, where every requester spins on its
//! own cache-line-padded queue node.

#[macro_use]
extern crate static_assertions;

use custom_error::custom_error;

mod backoff;
mod freelist;
mod global;
mod queue;
mod segment;

pub use global::GlobalFlag;
pub use queue::{NodeClass, Queued};
pub use segment::Segment;

use segment::{GLOBAL_LOCK_OFF, NEXT_WRITER_OFF, POOL_BASE, READER_COUNT_OFF, TAIL_OFF};

/// Machine word stored in the shared segment.
pub type Word = u64;
/// Byte offset from the segment base; 0 is the null offset.
pub type Offset = Word;

/// Default capacity of the queue-node pool.
pub const DEFAULT_MAX_NODES: usize = 64;

custom_error! {
    #[derive(PartialEq, Clone)]
    pub LockError
    InvalidHandle = "Supplied database handle failed validation",
    PoolExhausted = "No free lock queue nodes are available",
    SegmentTooSmall = "Memory segment cannot hold the lock state",
}

/// Proof of a held exclusive lock; pass it back to the matching `end_write`.
#[derive(Debug, PartialEq, Eq)]
#[must_use]
pub struct WriteToken(pub(crate) Offset);

/// Proof of a held shared lock; pass it back to the matching `end_read`.
#[derive(Debug, PartialEq, Eq)]
#[must_use]
pub struct ReadToken(pub(crate) Offset);

impl WriteToken {
    /// The raw token value; always non-zero.
    pub fn value(&self) -> Offset {
        self.0
    }
}

impl ReadToken {
    /// The raw token value; always non-zero.
    pub fn value(&self) -> Offset {
        self.0
    }
}

/// One locking algorithm over the segment's lock words.
///
/// Implementations must make writers mutually exclusive with every other
/// requester while allowing readers to share, with all waiting done by
/// spinning on segment words. The [`Database`] handle dispatches to the
/// algorithm selected at build time.
pub trait LockProtocol {
    /// Block until exclusive ownership is held.
    fn start_write(seg: &Segment) -> Result<WriteToken, LockError>;
    /// Release exclusive ownership.
    fn end_write(seg: &Segment, token: WriteToken) -> Result<(), LockError>;
    /// Block until no writer is active.
    fn start_read(seg: &Segment) -> Result<ReadToken, LockError>;
    /// Release a shared hold.
    fn end_read(seg: &Segment, token: ReadToken) -> Result<(), LockError>;
    /// Readers currently inside their critical section.
    fn reader_count(seg: &Segment) -> Word;
}

#[cfg(feature = "queued-locks")]
type DefaultProtocol = Queued;
#[cfg(not(feature = "queued-locks"))]
type DefaultProtocol = GlobalFlag;

/// A handle onto a shared-memory database segment.
///
/// Every handle validates the segment mark before touching lock state, so a
/// stale or garbage mapping fails with [`LockError::InvalidHandle`] instead
/// of corrupting anything.
///
/// The lock is not reentrant: a thread holding it must not call `start_*`
/// again before releasing, and locks do not compose or nest.
pub struct Database {
    seg: Segment,
}

impl Database {
    /// Create a database with an owned in-process segment sized for
    /// `max_nodes` queue nodes, with the lock state initialized.
    pub fn create(max_nodes: usize) -> Result<Database, LockError> {
        let bytes = max_nodes
            .checked_mul(freelist::NODE_STRIDE)
            .and_then(|pool| pool.checked_add(POOL_BASE))
            .ok_or(LockError::SegmentTooSmall)?;
        let seg = Segment::with_capacity(bytes);
        seg.format(max_nodes, freelist::NODE_STRIDE)?;

        let mut db = Database { seg };
        db.init_lock_queue()?;
        Ok(db)
    }

    /// Attach to a segment created elsewhere, typically a mapping of the
    /// same shared memory in another process.
    ///
    /// # Safety
    ///
    /// `base` must point to a live mapping of at least `len` bytes that
    /// outlives the handle, and the region must only ever be accessed
    /// through database handles.
    pub unsafe fn attach(base: *mut u8, len: usize) -> Result<Database, LockError> {
        let seg = Segment::from_raw(base, len)?;
        seg.check()?;
        Ok(Database { seg })
    }

    /// Reset all lock state and thread every pool node onto the freelist.
    ///
    /// Runs once during database creation. Not thread-safe; nothing may
    /// hold or wait for the lock while this runs, which the exclusive
    /// receiver enforces for in-process use.
    pub fn init_lock_queue(&mut self) -> Result<(), LockError> {
        self.seg.check()?;
        self.seg.store(GLOBAL_LOCK_OFF, 0);
        self.seg.store(TAIL_OFF, 0);
        self.seg.store(NEXT_WRITER_OFF, 0);
        self.seg.store(READER_COUNT_OFF, 0);
        freelist::init_pool(&self.seg);
        Ok(())
    }

    /// Block until exclusive ownership of the database is held.
    pub fn start_write(&self) -> Result<WriteToken, LockError> {
        self.seg.check()?;
        DefaultProtocol::start_write(&self.seg)
    }

    /// Release exclusive ownership. `token` must come from the matching
    /// [`start_write`](Database::start_write).
    pub fn end_write(&self, token: WriteToken) -> Result<(), LockError> {
        self.seg.check()?;
        DefaultProtocol::end_write(&self.seg, token)
    }

    /// Block until no writer is active.
    pub fn start_read(&self) -> Result<ReadToken, LockError> {
        self.seg.check()?;
        DefaultProtocol::start_read(&self.seg)
    }

    /// Release a shared hold. `token` must come from the matching
    /// [`start_read`](Database::start_read).
    pub fn end_read(&self, token: ReadToken) -> Result<(), LockError> {
        self.seg.check()?;
        DefaultProtocol::end_read(&self.seg, token)
    }

    /// Readers currently inside their critical section.
    pub fn reader_count(&self) -> Word {
        DefaultProtocol::reader_count(&self.seg)
    }

    /// Whether the lock queue has no enqueued requester.
    pub fn queue_is_empty(&self) -> bool {
        self.seg.load(TAIL_OFF) == 0
    }

    /// Queue nodes currently on the freelist. Only meaningful while no
    /// acquisition or release is in flight.
    pub fn free_nodes(&self) -> usize {
        freelist::available(&self.seg)
    }

    /// The underlying segment, for handing its base to another attacher.
    pub fn segment(&self) -> &Segment {
        &self.seg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_create_and_single_writer() {
        let db = Database::create(DEFAULT_MAX_NODES).unwrap();

        let token = db.start_write().unwrap();
        assert!(token.value() > 0);
        db.end_write(token).unwrap();

        assert_eq!(db.reader_count(), 0);
        assert!(db.queue_is_empty());
    }

    #[test]
    fn test_read_tokens_are_nonzero() {
        let db = Database::create(DEFAULT_MAX_NODES).unwrap();

        let token = db.start_read().unwrap();
        assert!(token.value() > 0);
        assert_eq!(db.reader_count(), 1);
        db.end_read(token).unwrap();
        assert_eq!(db.reader_count(), 0);
    }

    #[test]
    fn test_attach_rejects_unformatted_memory() {
        let slab = vec![0u64; 4096].into_boxed_slice();
        let base = Box::leak(slab).as_mut_ptr() as *mut u8;

        let res = unsafe { Database::attach(base, 4096 * 8) };
        assert_eq!(res.err(), Some(LockError::InvalidHandle));
    }

    #[test]
    fn test_attach_shares_lock_state() {
        let creator = Arc::new(Database::create(DEFAULT_MAX_NODES).unwrap());
        let base = creator.segment().as_ptr() as *mut u8;
        let len = creator.segment().len();

        // A second handle over the same segment, as a second process mapping
        // the shared region would hold. The Arc keeps the creator segment
        // alive for the duration.
        let attached = unsafe { Database::attach(base, len) }.unwrap();
        let entered = Arc::new(AtomicBool::new(false));

        let reader = creator.start_read().unwrap();
        assert_eq!(attached.reader_count(), 1);

        let keepalive = Arc::clone(&creator);
        let e = Arc::clone(&entered);
        let writer = thread::spawn(move || {
            let token = attached.start_write().unwrap();
            e.store(true, Ordering::SeqCst);
            attached.end_write(token).unwrap();
            drop(keepalive);
        });

        thread::sleep(Duration::from_millis(100));
        assert!(!entered.load(Ordering::SeqCst));

        creator.end_read(reader).unwrap();
        writer.join().unwrap();
        assert!(entered.load(Ordering::SeqCst));
    }

    #[test]
    fn test_reinit_resets_lock_state() {
        let mut db = Database::create(8).unwrap();

        // Leak a hold, then re-initialize as segment re-creation would.
        let _abandoned = db.start_read().unwrap();
        assert_eq!(db.reader_count(), 1);

        db.init_lock_queue().unwrap();
        assert_eq!(db.reader_count(), 0);
        assert!(db.queue_is_empty());
        assert_eq!(db.free_nodes(), 8);

        let token = db.start_write().unwrap();
        db.end_write(token).unwrap();
    }
}
