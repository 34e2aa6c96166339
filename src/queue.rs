//! The queued (fair FIFO) reader/writer lock.
//!
//! Every acquisition allocates a queue node from the pool, swaps itself in as
//! the queue tail and then spins only on its own node's blocked bit, so
//! waiters never hammer a shared word. Release hands the lock to the
//! successor node. Ordering is FIFO by the tail swap, except that a
//! contiguous run of readers collapses into parallel execution: each reader,
//! once running, wakes the reader queued behind it.
//!
//! Readers coordinate with writers through a separate reader count. A writer
//! at the head of the queue only enters once that count is zero; the last
//! departing reader hands the lock to the writer published in the
//! next-writer word.
//!
//! A successor announces its class by OR-ing its class bit into the
//! predecessor's `state` before publishing itself in the predecessor's
//! `next`. The release path relies on that order: once `next` is visible,
//! the class hint is too, and the releaser knows whether to wake a writer or
//! to count a reader in before unblocking it.

use bitflags::bitflags;
use log::error;

use crate::backoff;
use crate::freelist;
use crate::freelist::{NODE_CLASS, NODE_NEXT, NODE_STATE};
use crate::segment::{Segment, NEXT_WRITER_OFF, READER_COUNT_OFF, TAIL_OFF};
use crate::{LockError, LockProtocol, Offset, ReadToken, Word, WriteToken};

bitflags! {
    /// Requester kind, stored in a node's `class` word and OR-ed into the
    /// predecessor's `state` as the successor-class hint.
    pub struct NodeClass: Word {
        const READ = 0x2;
        const WRITE = 0x4;
    }
}

/// Bit 0 of a node's `state` word; cleared when the node may enter its
/// critical section. The class bits above it carry the successor hint.
pub(crate) const BLOCKED: Word = 0x1;

/// The queued locking algorithm.
pub struct Queued;

/// Allocate and initialize a node, then swap it in as the queue tail.
/// Returns the node and its predecessor (0 for an empty queue).
fn enqueue(seg: &Segment, class: NodeClass) -> Result<(Offset, Offset), LockError> {
    let node = match freelist::alloc(seg) {
        Some(node) => node,
        None => {
            error!("lock queue node pool exhausted");
            return Err(LockError::PoolExhausted);
        }
    };
    seg.store(node + NODE_CLASS, class.bits());
    seg.store(node + NODE_NEXT, 0);
    seg.store(node + NODE_STATE, BLOCKED);

    let prev = seg.swap(TAIL_OFF, node);
    Ok((node, prev))
}

impl LockProtocol for Queued {
    fn start_write(seg: &Segment) -> Result<WriteToken, LockError> {
        let (node, prev) = enqueue(seg, NodeClass::WRITE)?;

        if prev == 0 {
            // Head of an empty queue. Publish as the pending writer, then
            // try to take that publication back; winning the swap with no
            // readers around is the fast-path acquisition.
            seg.store(NEXT_WRITER_OFF, node);
            if seg.load(READER_COUNT_OFF) == 0 && seg.swap(NEXT_WRITER_OFF, 0) == node {
                seg.fetch_and(node + NODE_STATE, !BLOCKED);
                return Ok(WriteToken(node));
            }
            // Readers are still draining; the last one hands the lock over.
        } else {
            seg.fetch_or(prev + NODE_STATE, NodeClass::WRITE.bits());
            seg.store(prev + NODE_NEXT, node);
        }

        backoff::spin_until(|| seg.load(node + NODE_STATE) & BLOCKED == 0);
        Ok(WriteToken(node))
    }

    fn end_write(seg: &Segment, token: WriteToken) -> Result<(), LockError> {
        let node = token.0;

        if seg.load(node + NODE_NEXT) != 0 || !seg.compare_and_swap(TAIL_OFF, node, 0) {
            // A successor swapped the tail but may not have linked yet.
            backoff::busy_wait(|| seg.load(node + NODE_NEXT) != 0);
            let succ = seg.load(node + NODE_NEXT);
            if seg.load(succ + NODE_CLASS) & NodeClass::READ.bits() != 0 {
                // Readers behind a writer are counted in on their behalf.
                seg.fetch_add(READER_COUNT_OFF, 1);
            }
            seg.fetch_and(succ + NODE_STATE, !BLOCKED);
        }

        freelist::free(seg, node);
        Ok(())
    }

    fn start_read(seg: &Segment) -> Result<ReadToken, LockError> {
        let (node, prev) = enqueue(seg, NodeClass::READ)?;

        if prev == 0 {
            seg.fetch_add(READER_COUNT_OFF, 1);
            seg.fetch_and(node + NODE_STATE, !BLOCKED);
        } else if seg.load(prev + NODE_CLASS) & NodeClass::WRITE.bits() != 0
            || seg.compare_and_swap(
                prev + NODE_STATE,
                BLOCKED,
                BLOCKED | NodeClass::READ.bits(),
            )
        {
            // The predecessor is a writer, or a still-blocked reader that now
            // carries our hint; either way it counts us in when it wakes or
            // releases.
            seg.store(prev + NODE_NEXT, node);
            backoff::spin_until(|| seg.load(node + NODE_STATE) & BLOCKED == 0);
        } else {
            // The predecessor is a reader already past its blocked bit.
            seg.fetch_add(READER_COUNT_OFF, 1);
            seg.store(prev + NODE_NEXT, node);
            seg.fetch_and(node + NODE_STATE, !BLOCKED);
        }

        // A reader queued behind this one left its hint; count it in and
        // wake it, so a contiguous run of readers enters together.
        if seg.load(node + NODE_STATE) & NodeClass::READ.bits() != 0 {
            backoff::busy_wait(|| seg.load(node + NODE_NEXT) != 0);
            let succ = seg.load(node + NODE_NEXT);
            seg.fetch_add(READER_COUNT_OFF, 1);
            seg.fetch_and(succ + NODE_STATE, !BLOCKED);
        }

        Ok(ReadToken(node))
    }

    fn end_read(seg: &Segment, token: ReadToken) -> Result<(), LockError> {
        let node = token.0;

        // The queue behind a run of departing readers is irrelevant; the
        // reader count alone tracks live readers, so the tail may reset to
        // empty even while other readers run.
        if seg.load(node + NODE_NEXT) != 0 || !seg.compare_and_swap(TAIL_OFF, node, 0) {
            backoff::busy_wait(|| seg.load(node + NODE_NEXT) != 0);
            if seg.load(node + NODE_STATE) & NodeClass::WRITE.bits() != 0 {
                // The successor is a writer waiting for readers to drain.
                seg.store(NEXT_WRITER_OFF, seg.load(node + NODE_NEXT));
            }
        }

        if seg.fetch_sub(READER_COUNT_OFF, 1) == 1 {
            // Last reader out hands the lock to the pending writer, if any.
            let writer = seg.swap(NEXT_WRITER_OFF, 0);
            if writer != 0 {
                seg.fetch_and(writer + NODE_STATE, !BLOCKED);
            }
        }

        freelist::free(seg, node);
        Ok(())
    }

    fn reader_count(seg: &Segment) -> Word {
        seg.load(READER_COUNT_OFF)
    }
}
