use parking_lot::Mutex;
use std::any::Any;
use std::collections::VecDeque;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering, fence};

/// Value of the real-time thread's confirmation counter at some point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Generation(u64);

impl Generation {
    pub fn value(self) -> u64 {
        self.0
    }
}

struct Retired {
    stamp: u64,
    garbage: Box<dyn Any + Send>,
}

struct Shared {
    announced: AtomicU64,
    attached: AtomicBool,
    pending: Mutex<VecDeque<Retired>>,
}

/// Deferred reclamation shared by every structure the real-time thread reads.
///
/// Editing threads hand unlinked objects to [`Reclaimer::retire`] instead of
/// dropping them. The real-time thread calls [`RealtimeReader::confirm`] at the
/// top of every callback; an object retired while generation `N` was announced
/// is only dropped by [`Reclaimer::collect`] once generation `N + 1` has been
/// announced, i.e. once the reader has finished every traversal that could
/// have reached it.
#[derive(Clone)]
pub struct Reclaimer {
    shared: Arc<Shared>,
}

impl Reclaimer {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                announced: AtomicU64::new(0),
                attached: AtomicBool::new(false),
                pending: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Hands out the single real-time reader. Returns `None` while another
    /// reader is alive.
    pub fn reader(&self) -> Option<RealtimeReader> {
        self.shared
            .attached
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()?;
        Some(RealtimeReader {
            shared: Arc::clone(&self.shared),
        })
    }

    pub fn has_reader(&self) -> bool {
        self.shared.attached.load(Ordering::SeqCst)
    }

    /// Current generation. Must be read after the object it stamps has been
    /// unlinked.
    pub fn generation(&self) -> Generation {
        fence(Ordering::SeqCst);
        Generation(self.shared.announced.load(Ordering::SeqCst))
    }

    /// True once nothing stamped with `stamp` can still be reached by the
    /// real-time thread.
    pub fn is_quiescent(&self, stamp: Generation) -> bool {
        !self.shared.attached.load(Ordering::SeqCst)
            || self.shared.announced.load(Ordering::Acquire) > stamp.0
    }

    /// Queues `garbage` until the real-time thread has moved past it. Dropped on
    /// the spot when no reader is attached.
    pub fn retire<G: Send + 'static>(&self, garbage: G) {
        let stamp = self.generation();
        if !self.shared.attached.load(Ordering::SeqCst) {
            drop(garbage);
            return;
        }
        self.shared.pending.lock().push_back(Retired {
            stamp: stamp.0,
            garbage: Box::new(garbage),
        });
    }

    /// Drops everything retired before the latest confirmation. Returns the
    /// number of objects dropped.
    pub fn collect(&self) -> usize {
        let attached = self.shared.attached.load(Ordering::SeqCst);
        let announced = self.shared.announced.load(Ordering::SeqCst);
        let reclaimable: Vec<Retired> = {
            let mut pending = self.shared.pending.lock();
            let ready = pending
                .iter()
                .take_while(|retired| !attached || retired.stamp < announced)
                .count();
            pending.drain(..ready).collect()
        };
        let count = reclaimable.len();
        // dropped outside the lock, garbage may own other retirable objects
        for retired in reclaimable {
            drop(retired.garbage);
        }
        count
    }

    pub fn pending(&self) -> usize {
        self.shared.pending.lock().len()
    }
}

impl Default for Reclaimer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Reclaimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reclaimer")
            .field("announced", &self.shared.announced.load(Ordering::Relaxed))
            .field("attached", &self.shared.attached.load(Ordering::Relaxed))
            .finish()
    }
}

/// The real-time side of the handshake. Only one exists per [`Reclaimer`].
pub struct RealtimeReader {
    shared: Arc<Shared>,
}

impl RealtimeReader {
    /// Announces a new generation and opens a read cycle. Everything read
    /// through the returned [`Cycle`] stays allocated until the next call.
    pub fn confirm(&mut self) -> Cycle<'_> {
        self.shared.announced.fetch_add(1, Ordering::SeqCst);
        fence(Ordering::SeqCst);
        Cycle {
            shared: &self.shared,
        }
    }
}

impl Drop for RealtimeReader {
    fn drop(&mut self) {
        self.shared.attached.store(false, Ordering::SeqCst);
    }
}

/// Proof that the real-time thread is inside a confirmed cycle.
pub struct Cycle<'r> {
    shared: &'r Shared,
}

impl Cycle<'_> {
    /// Whether this cycle protects structures that retire into `reclaimer`.
    pub fn covers(&self, reclaimer: &Reclaimer) -> bool {
        ptr::eq(self.shared, Arc::as_ptr(&reclaimer.shared))
    }

    pub fn generation(&self) -> Generation {
        Generation(self.shared.announced.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn retire_without_reader_drops_immediately() {
        let reclaimer = Reclaimer::new();
        let dropped = Arc::new(AtomicUsize::new(0));
        reclaimer.retire(DropCounter(dropped.clone()));
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
        assert_eq!(reclaimer.pending(), 0);
    }

    #[test]
    fn garbage_survives_until_next_generation() {
        let reclaimer = Reclaimer::new();
        let mut reader = reclaimer.reader().unwrap();
        let dropped = Arc::new(AtomicUsize::new(0));

        reclaimer.retire(DropCounter(dropped.clone()));
        assert_eq!(reclaimer.collect(), 0);
        assert_eq!(dropped.load(Ordering::SeqCst), 0);

        let _ = reader.confirm();
        assert_eq!(reclaimer.collect(), 1);
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn retired_mid_cycle_waits_for_the_following_confirm() {
        let reclaimer = Reclaimer::new();
        let mut reader = reclaimer.reader().unwrap();
        let dropped = Arc::new(AtomicUsize::new(0));

        {
            let cycle = reader.confirm();
            assert!(cycle.covers(&reclaimer));
            reclaimer.retire(DropCounter(dropped.clone()));
            assert_eq!(reclaimer.collect(), 0);
        }
        assert_eq!(dropped.load(Ordering::SeqCst), 0);

        let _ = reader.confirm();
        reclaimer.collect();
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn only_one_reader() {
        let reclaimer = Reclaimer::new();
        let reader = reclaimer.reader();
        assert!(reader.is_some());
        assert!(reclaimer.reader().is_none());
        drop(reader);
        assert!(!reclaimer.has_reader());
        assert!(reclaimer.reader().is_some());
    }

    #[test]
    fn detaching_releases_pending_garbage() {
        let reclaimer = Reclaimer::new();
        let reader = reclaimer.reader().unwrap();
        let dropped = Arc::new(AtomicUsize::new(0));
        reclaimer.retire(DropCounter(dropped.clone()));
        drop(reader);
        assert_eq!(reclaimer.collect(), 1);
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn quiescence_follows_confirmation() {
        let reclaimer = Reclaimer::new();
        let mut reader = reclaimer.reader().unwrap();
        let stamp = reclaimer.generation();
        assert!(!reclaimer.is_quiescent(stamp));
        let cycle = reader.confirm();
        assert!(cycle.generation() > stamp);
        assert!(reclaimer.is_quiescent(stamp));
    }

    #[test]
    fn cycle_does_not_cover_foreign_reclaimer() {
        let ours = Reclaimer::new();
        let theirs = Reclaimer::new();
        let mut reader = ours.reader().unwrap();
        let cycle = reader.confirm();
        assert!(!cycle.covers(&theirs));
    }

    #[test]
    fn concurrent_reader_eventually_frees_everything() {
        let reclaimer = Reclaimer::new();
        let mut reader = reclaimer.reader().unwrap();
        let dropped = Arc::new(AtomicUsize::new(0));
        let stop = Arc::new(AtomicBool::new(false));

        let rt_stop = stop.clone();
        let rt = std::thread::spawn(move || {
            while !rt_stop.load(Ordering::Relaxed) {
                let _cycle = reader.confirm();
                std::thread::yield_now();
            }
        });

        for _ in 0..1000 {
            reclaimer.retire(DropCounter(dropped.clone()));
            reclaimer.collect();
        }
        while reclaimer.pending() > 0 {
            reclaimer.collect();
            std::thread::yield_now();
        }
        stop.store(true, Ordering::Relaxed);
        rt.join().unwrap();
        assert_eq!(dropped.load(Ordering::SeqCst), 1000);
    }
}
