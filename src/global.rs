//! The global-flag reader/writer lock.
//!
//! One shared word encodes the whole lock: bit 0 is the writer-active flag,
//! the remaining bits count readers in steps of [`RC_INCR`]. Readers make
//! themselves visible with one fetch-and-add and writers take the word with
//! one compare-and-swap, so the uncontended paths are a single atomic each.
//!
//! This is a reader-preference lock. A writer only enters on a full-word
//! zero, so a steady stream of readers can hold a writer off indefinitely.
//! That trade-off is accepted here; the queued lock is the fair alternative.

use crate::backoff;
use crate::segment::{Segment, GLOBAL_LOCK_OFF};
use crate::{LockError, LockProtocol, ReadToken, Word, WriteToken};

/// Writer-active flag, bit 0 of the lock word.
pub(crate) const WAFLAG: Word = 0x1;
/// Reader-count increment; keeps bit 0 clear for the writer flag.
pub(crate) const RC_INCR: Word = 0x2;

const_assert!(WAFLAG & RC_INCR == 0);

/// Tokens from this lock carry no per-requester state; any fixed non-zero
/// value satisfies the token contract.
const GLOBAL_TOKEN: Word = 1;

/// The global-flag locking algorithm.
pub struct GlobalFlag;

impl LockProtocol for GlobalFlag {
    fn start_write(seg: &Segment) -> Result<WriteToken, LockError> {
        if seg.compare_and_swap(GLOBAL_LOCK_OFF, 0, WAFLAG) {
            return Ok(WriteToken(GLOBAL_TOKEN));
        }
        // Readers present or another writer active. Each poll is gated on a
        // plain read so the CAS is only attempted on a word that was zero.
        backoff::spin_until(|| {
            seg.load(GLOBAL_LOCK_OFF) == 0 && seg.compare_and_swap(GLOBAL_LOCK_OFF, 0, WAFLAG)
        });
        Ok(WriteToken(GLOBAL_TOKEN))
    }

    fn end_write(seg: &Segment, _token: WriteToken) -> Result<(), LockError> {
        seg.fetch_and(GLOBAL_LOCK_OFF, !WAFLAG);
        Ok(())
    }

    fn start_read(seg: &Segment) -> Result<ReadToken, LockError> {
        // Become visible to writers before testing for one.
        let prior = seg.fetch_add(GLOBAL_LOCK_OFF, RC_INCR);
        if prior & WAFLAG == 0 {
            return Ok(ReadToken(GLOBAL_TOKEN));
        }
        backoff::spin_until(|| seg.load(GLOBAL_LOCK_OFF) & WAFLAG == 0);
        Ok(ReadToken(GLOBAL_TOKEN))
    }

    fn end_read(seg: &Segment, _token: ReadToken) -> Result<(), LockError> {
        seg.fetch_sub(GLOBAL_LOCK_OFF, RC_INCR);
        Ok(())
    }

    fn reader_count(seg: &Segment) -> Word {
        seg.load(GLOBAL_LOCK_OFF) / RC_INCR
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::POOL_BASE;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn test_segment() -> Arc<Segment> {
        let seg = Segment::with_capacity(POOL_BASE);
        seg.format(0, 1).unwrap();
        Arc::new(seg)
    }

    #[test]
    fn test_uncontended_writer() {
        let seg = test_segment();

        let token = GlobalFlag::start_write(&seg).unwrap();
        assert_eq!(seg.load(GLOBAL_LOCK_OFF), WAFLAG);
        assert_eq!(GlobalFlag::reader_count(&seg), 0);

        GlobalFlag::end_write(&seg, token).unwrap();
        assert_eq!(seg.load(GLOBAL_LOCK_OFF), 0);
    }

    #[test]
    fn test_readers_share() {
        let seg = test_segment();

        let r1 = GlobalFlag::start_read(&seg).unwrap();
        let r2 = GlobalFlag::start_read(&seg).unwrap();
        assert_eq!(GlobalFlag::reader_count(&seg), 2);

        GlobalFlag::end_read(&seg, r1).unwrap();
        GlobalFlag::end_read(&seg, r2).unwrap();
        assert_eq!(seg.load(GLOBAL_LOCK_OFF), 0);
    }

    #[test]
    fn test_writer_blocked_by_reader() {
        let seg = test_segment();
        let entered = Arc::new(AtomicBool::new(false));

        let reader = GlobalFlag::start_read(&seg).unwrap();

        let s = Arc::clone(&seg);
        let e = Arc::clone(&entered);
        let writer = thread::spawn(move || {
            let token = GlobalFlag::start_write(&s).unwrap();
            e.store(true, Ordering::SeqCst);
            GlobalFlag::end_write(&s, token).unwrap();
        });

        thread::sleep(Duration::from_millis(100));
        assert!(!entered.load(Ordering::SeqCst));

        GlobalFlag::end_read(&seg, reader).unwrap();
        writer.join().unwrap();
        assert!(entered.load(Ordering::SeqCst));
    }

    #[test]
    fn test_reader_blocked_by_writer() {
        let seg = test_segment();
        let entered = Arc::new(AtomicBool::new(false));

        let token = GlobalFlag::start_write(&seg).unwrap();

        let s = Arc::clone(&seg);
        let e = Arc::clone(&entered);
        let reader = thread::spawn(move || {
            let token = GlobalFlag::start_read(&s).unwrap();
            e.store(true, Ordering::SeqCst);
            GlobalFlag::end_read(&s, token).unwrap();
        });

        thread::sleep(Duration::from_millis(100));
        assert!(!entered.load(Ordering::SeqCst));

        GlobalFlag::end_write(&seg, token).unwrap();
        reader.join().unwrap();
        assert!(entered.load(Ordering::SeqCst));
    }

    #[test]
    fn test_writers_are_mutually_exclusive() {
        let seg = test_segment();
        let inside = Arc::new(AtomicUsize::new(0));
        let threads = 8;
        let rounds = 200;

        let mut handles = Vec::new();
        for _ in 0..threads {
            let s = Arc::clone(&seg);
            let i = Arc::clone(&inside);
            handles.push(thread::spawn(move || {
                for _ in 0..rounds {
                    let token = GlobalFlag::start_write(&s).unwrap();
                    assert_eq!(i.fetch_add(1, Ordering::SeqCst), 0);
                    assert_eq!(i.fetch_sub(1, Ordering::SeqCst), 1);
                    GlobalFlag::end_write(&s, token).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(seg.load(GLOBAL_LOCK_OFF), 0);
    }

    #[test]
    fn test_readers_exclude_writers() {
        let seg = test_segment();
        let readers_in = Arc::new(AtomicUsize::new(0));
        let writers_in = Arc::new(AtomicUsize::new(0));
        let rounds = 200;

        let mut handles = Vec::new();
        for worker in 0..8 {
            let s = Arc::clone(&seg);
            let r = Arc::clone(&readers_in);
            let w = Arc::clone(&writers_in);
            handles.push(thread::spawn(move || {
                for _ in 0..rounds {
                    if worker % 4 == 0 {
                        let token = GlobalFlag::start_write(&s).unwrap();
                        assert_eq!(w.fetch_add(1, Ordering::SeqCst), 0);
                        assert_eq!(r.load(Ordering::SeqCst), 0);
                        w.fetch_sub(1, Ordering::SeqCst);
                        GlobalFlag::end_write(&s, token).unwrap();
                    } else {
                        let token = GlobalFlag::start_read(&s).unwrap();
                        r.fetch_add(1, Ordering::SeqCst);
                        assert_eq!(w.load(Ordering::SeqCst), 0);
                        r.fetch_sub(1, Ordering::SeqCst);
                        GlobalFlag::end_read(&s, token).unwrap();
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(seg.load(GLOBAL_LOCK_OFF), 0);
    }
}
