//! # Deferred Reclamation
//!
//! Frees retired generations only once no capture can still be using them.
//! Readers never touch the reclaimer: each capture holds its own reference
//! to the generation it loaded, and dropping that reference is the end of
//! its read-side critical section.
//!
//! - The writer (pool teardown or resize, cold path) unpublishes a generation
//!   and hands its last published reference to [`DeferredReclaimer::retire`].
//! - Once unpublished, no new reader can obtain it. The only references left
//!   are the queued one and those of captures already in flight.
//! - An item whose queued reference is the only one left is freed on the next
//!   reclamation attempt. Readers that started after the retire never hold it,
//!   however they overlap, so they cannot delay it.
//!
//! Retiring with no readers in flight frees the item immediately.

use std::fmt;
use std::sync::Arc;

use log::debug;

use crate::sync::{yield_now, AtomicU64, Mutex, Ordering};

/// Reclaimer for items read lock-free from every processor
pub struct DeferredReclaimer<T> {
    retired: Mutex<Vec<Arc<T>>>,
    reclaimed: AtomicU64,
}

impl<T: Send + Sync> DeferredReclaimer<T> {
    #[must_use]
    pub fn new() -> Self {
        Self { retired: Mutex::new(Vec::new()), reclaimed: AtomicU64::new(0) }
    }

    /// Queue `item` for destruction once its last reader is gone
    ///
    /// The caller must already have made `item` unreachable for new readers.
    /// Returns the number of items freed by the reclamation attempt that
    /// follows.
    pub fn retire(&self, item: Arc<T>) -> usize {
        self.retired.lock().push(item);
        self.try_reclaim()
    }

    /// Free every retired item no reader still references
    ///
    /// Never waits for readers. Returns the number of items freed.
    pub fn try_reclaim(&self) -> usize {
        let ready: Vec<Arc<T>> = {
            let mut retired = self.retired.lock();
            if retired.is_empty() {
                return 0;
            }
            // Unreachable for new readers: a count of one cannot grow again
            let (ready, waiting): (Vec<_>, Vec<_>) =
                retired.drain(..).partition(|item| Arc::strong_count(item) == 1);
            *retired = waiting;
            ready
        };

        let freed = ready.len();
        if freed > 0 {
            self.reclaimed.fetch_add(freed as u64, Ordering::Relaxed);
            debug!("Reclaimed {freed} retired callchain generation(s)");
        }
        // Destructors run outside the lock
        drop(ready);
        freed
    }

    /// Wait until everything retired so far has been freed
    ///
    /// Must not be called while the caller itself holds a reference to a
    /// retired item: it would never be released. Returns the number of
    /// items freed.
    pub fn synchronize(&self) -> usize {
        let mut freed = self.try_reclaim();
        while self.pending() > 0 {
            yield_now();
            freed += self.try_reclaim();
        }
        freed
    }

    /// Items retired but not yet freed
    pub fn pending(&self) -> usize {
        self.retired.lock().len()
    }

    /// Total items freed since construction
    pub fn reclaimed(&self) -> u64 {
        self.reclaimed.load(Ordering::Relaxed)
    }
}

impl<T: Send + Sync> Default for DeferredReclaimer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for DeferredReclaimer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredReclaimer")
            .field("pending", &self.retired.lock().len())
            .field("reclaimed", &self.reclaimed.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Counts its own destruction
    struct Tracked(Arc<AtomicUsize>);

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    fn tracked() -> (Arc<Tracked>, Arc<AtomicUsize>) {
        let drops = Arc::new(AtomicUsize::new(0));
        (Arc::new(Tracked(Arc::clone(&drops))), drops)
    }

    fn dropped(drops: &AtomicUsize) -> usize {
        drops.load(std::sync::atomic::Ordering::SeqCst)
    }

    #[test]
    fn test_retire_without_readers_frees_immediately() {
        let reclaimer = DeferredReclaimer::new();
        let (item, drops) = tracked();

        assert_eq!(reclaimer.retire(item), 1);
        assert_eq!(dropped(&drops), 1);
        assert_eq!(reclaimer.pending(), 0);
        assert_eq!(reclaimer.reclaimed(), 1);
    }

    #[test]
    fn test_reader_delays_reclamation() {
        let reclaimer = DeferredReclaimer::new();
        let (item, drops) = tracked();

        let reader = Arc::clone(&item);
        assert_eq!(reclaimer.retire(item), 0);
        assert_eq!(reclaimer.try_reclaim(), 0);
        assert_eq!(dropped(&drops), 0);

        drop(reader);
        assert_eq!(reclaimer.try_reclaim(), 1);
        assert_eq!(dropped(&drops), 1);
        assert_eq!(reclaimer.try_reclaim(), 0);
    }

    #[test]
    fn test_items_are_freed_independently() {
        let reclaimer = DeferredReclaimer::new();
        let (first, first_drops) = tracked();
        let (second, second_drops) = tracked();

        let first_reader = Arc::clone(&first);
        reclaimer.retire(first);
        // Nobody reads the second one: freed without waiting for the first
        assert_eq!(reclaimer.retire(second), 1);
        assert_eq!(dropped(&second_drops), 1);
        assert_eq!(reclaimer.pending(), 1);

        drop(first_reader);
        assert_eq!(reclaimer.try_reclaim(), 1);
        assert_eq!(dropped(&first_drops), 1);
    }

    #[test]
    fn test_synchronize_waits_for_other_threads() {
        let reclaimer = Arc::new(DeferredReclaimer::new());
        let (item, drops) = tracked();
        let (go_tx, go_rx) = crossbeam_channel::bounded::<()>(0);

        let reader = {
            let held = Arc::clone(&item);
            std::thread::spawn(move || {
                go_rx.recv().unwrap();
                drop(held);
            })
        };

        reclaimer.retire(item);
        assert_eq!(dropped(&drops), 0);

        go_tx.send(()).unwrap();
        assert_eq!(reclaimer.synchronize(), 1);
        assert_eq!(dropped(&drops), 1);
        reader.join().unwrap();
    }
}
