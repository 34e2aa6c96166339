//! The queue-node pool and its lock-free allocator.
//!
//! Queue nodes live in a fixed array inside the segment, one per padding
//! unit so waiters spinning on their own node never share a cache line. Free
//! nodes are threaded through their `next_cell` word into a Treiber stack
//! rooted at the segment's freelist word.
//!
//! Reclamation is reference counted. A node's `refcount` is even while the
//! node holds only stable references (2 per live reference); bit 0 is set
//! exactly while the node sits on the freelist, claimed for the push by
//! whoever won the final release. Readers of a link word that may race with
//! reclamation pin the target first ([`deref_link`]), which keeps the
//! refcount above zero and blocks the recycle.

use core::hint;

use crate::segment::{
    Segment, FREELIST_OFF, MAX_NODES_OFF, STORAGE_OFF, SYN_VAR_PADDING, WORD_BYTES,
};
use crate::{Offset, Word};

// Field offsets within one node, in bytes.
pub(crate) const NODE_CLASS: Offset = 0;
pub(crate) const NODE_NEXT: Offset = 8;
pub(crate) const NODE_STATE: Offset = 16;
pub(crate) const NODE_REFCOUNT: Offset = 24;
pub(crate) const NODE_NEXT_CELL: Offset = 32;

const NODE_FIELDS: usize = 5;

/// Distance between consecutive nodes in the pool.
pub(crate) const NODE_STRIDE: usize = SYN_VAR_PADDING;

const_assert!(NODE_STRIDE >= NODE_FIELDS * WORD_BYTES);

/// Refcount marker: set while the node is on the freelist.
const PUSH_MARK: Word = 0x1;
/// Refcount weight of one stable reference.
const REF_UNIT: Word = 0x2;

/// Thread every pool cell onto the freelist. Single-threaded; runs during
/// database creation before the segment is shared.
pub(crate) fn init_pool(seg: &Segment) {
    let storage = seg.load(STORAGE_OFF);
    let max_nodes = seg.load(MAX_NODES_OFF);

    let mut top = 0;
    for cell in (0..max_nodes).rev() {
        let node = storage + cell * NODE_STRIDE as Word;
        seg.store(node + NODE_CLASS, 0);
        seg.store(node + NODE_NEXT, 0);
        seg.store(node + NODE_STATE, 0);
        seg.store(node + NODE_REFCOUNT, PUSH_MARK);
        seg.store(node + NODE_NEXT_CELL, top);
        top = node;
    }
    seg.store(FREELIST_OFF, top);
}

/// Pop a node off the freelist, or `None` when the pool is exhausted.
///
/// The returned node carries one stable reference (refcount 2 when nobody
/// else has it pinned); its `class`, `next` and `state` words are whatever
/// the previous user left and must be initialized by the caller.
pub(crate) fn alloc(seg: &Segment) -> Option<Offset> {
    loop {
        let top = seg.load(FREELIST_OFF);
        if top == 0 {
            return None;
        }
        // Pin before the pop so a concurrent release cannot recycle the node
        // out from under the CAS below.
        seg.fetch_add(top + NODE_REFCOUNT, REF_UNIT);
        if seg.compare_and_swap(FREELIST_OFF, top, seg.load(top + NODE_NEXT_CELL)) {
            // The pop claimed the node; drop the push mark, keep our pin.
            seg.fetch_sub(top + NODE_REFCOUNT, PUSH_MARK);
            return Some(top);
        }
        free(seg, top);
        hint::spin_loop();
    }
}

/// Drop one reference to `node`, pushing it back onto the freelist when the
/// count reaches zero.
pub(crate) fn free(seg: &Segment, node: Offset) {
    seg.fetch_sub(node + NODE_REFCOUNT, REF_UNIT);
    // Whoever moves the count from 0 to the push mark owns the push; with
    // pins still outstanding the swap fails and the last unpin pushes.
    if seg.compare_and_swap(node + NODE_REFCOUNT, 0, PUSH_MARK) {
        loop {
            let top = seg.load(FREELIST_OFF);
            seg.store(node + NODE_NEXT_CELL, top);
            if seg.compare_and_swap(FREELIST_OFF, top, node) {
                return;
            }
            hint::spin_loop();
        }
    }
}

/// Read the node offset stored in the link word at `link`, pinned against
/// reclamation, or `None` when the link is null.
///
/// The pin is taken before the link is re-read; a target that changed in
/// between was never safely referenced and is released again. Callers own
/// one reference to the returned node and drop it with [`free`].
///
/// The release paths read successor links without pinning, because a linked
/// successor is still blocked and cannot be reclaimed; this helper exists
/// for readers without that guarantee.
#[allow(dead_code)]
pub(crate) fn deref_link(seg: &Segment, link: Offset) -> Option<Offset> {
    loop {
        let target = seg.load(link);
        if target == 0 {
            return None;
        }
        seg.fetch_add(target + NODE_REFCOUNT, REF_UNIT);
        if seg.load(link) == target {
            return Some(target);
        }
        free(seg, target);
        hint::spin_loop();
    }
}

/// Number of nodes currently on the freelist. Only meaningful while no
/// acquisition or release is in flight.
pub(crate) fn available(seg: &Segment) -> usize {
    let mut count = 0;
    let mut node = seg.load(FREELIST_OFF);
    while node != 0 {
        count += 1;
        node = seg.load(node + NODE_NEXT_CELL);
    }
    count
}
