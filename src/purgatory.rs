use crate::unsafe_box::UnsafeBox;
use parking_lot::RwLock;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How long the worker sleeps between scans while the collection is live.
const SCAN_INTERVAL: Duration = Duration::from_millis(100);

/// A retired node that the purgatory knows how to reclaim.
///
/// Implemented by the node types of both collections. `reclaim` is called at
/// most once per node, after a scan has proven that no cursor can reach it
/// anymore.
pub(crate) trait Reclaim: Sized {
    /// The node's reference count.
    fn refs(&self) -> &AtomicUsize;

    /// The scan marker, set once the node has been seen unreferenced under
    /// the purge barrier.
    fn purged(&self) -> &AtomicBool;

    /// Whether the node has been unlinked from the live structure.
    fn retired(&self) -> bool;

    /// Tags the node as unlinked. Only [`PurgeInner::retire`] calls this,
    /// under the purge barrier, so that no release path can slip a record
    /// in and have it reaped before the retiring thread is done with the
    /// node.
    fn set_retired(&self);

    /// Releases the neighbor references the node's frozen links still hold,
    /// then frees the node.
    ///
    /// # Safety
    ///
    /// The node should be unreachable from every cursor and should not be
    /// reclaimed twice.
    unsafe fn reclaim(node: *mut Self, purgatory: &PurgeInner<Self>);
}

/// A record on the retirement stack. One is pushed every time a node's
/// reference count reaches zero while the node is unlinked.
struct Record<N> {
    node: *mut N,
    next: *mut Record<N>,
    /// Decision of the marking phase; owned by the worker.
    reap: bool,
}

/// State shared between a collection and its purge worker.
pub(crate) struct PurgeInner<N> {
    /// Head of the lock-free stack of retirement records.
    head: AtomicPtr<Record<N>>,
    /// The purge barrier. Every cursor step takes it shared around its
    /// link-read-and-pin; the scan takes it exclusive to snapshot the stack.
    barrier: RwLock<()>,
    /// Set by the owning collection's destructor.
    stop: AtomicBool,
}

/// Deferred reclamation of unlinked nodes.
///
/// Nodes retired here are freed by a dedicated worker thread, and only after
/// a scan has established that no cursor holds or can still take a reference
/// to them. Dropping the purgatory drains every outstanding record.
pub(crate) struct Purgatory<N: Reclaim> {
    inner: Arc<PurgeInner<N>>,
    worker: Option<JoinHandle<()>>,
}

impl<N: Reclaim + 'static> Purgatory<N> {
    pub(crate) fn new() -> Self {
        let inner = Arc::new(PurgeInner {
            head: AtomicPtr::new(ptr::null_mut()),
            barrier: RwLock::new(()),
            stop: AtomicBool::new(false),
        });
        let worker = {
            let inner = Arc::clone(&inner);
            thread::Builder::new()
                .name("limbo-purge".into())
                .spawn(move || PurgeInner::run(&inner))
                .expect("failed to spawn the purge worker")
        };
        Self {
            inner,
            worker: Some(worker),
        }
    }
}

impl<N: Reclaim> Purgatory<N> {
    pub(crate) fn inner(&self) -> &PurgeInner<N> {
        &self.inner
    }

    /// Stops the worker, draining every outstanding record first.
    pub(crate) fn shutdown(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.inner.stop.store(true, Ordering::Release);
            worker.join().expect("the purge worker panicked");
        }
    }
}

impl<N: Reclaim> Drop for Purgatory<N> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<N: Reclaim> PurgeInner<N> {
    pub(crate) fn barrier(&self) -> &RwLock<()> {
        &self.barrier
    }

    /// Drops one reference to `node`, retiring it if that was the last one
    /// and the node is already unlinked.
    ///
    /// The decrement and the tag read are sequentially consistent, pairing
    /// with the tag write and the count read in [`PurgeInner::retire`]; one
    /// of the two paths is guaranteed to observe the other and enqueue the
    /// node.
    ///
    /// # Safety
    ///
    /// The caller should own the reference being released.
    pub(crate) unsafe fn release(&self, node: *mut N) {
        let _barrier = self.barrier.read();
        let refs = (*node).refs().fetch_sub(1, Ordering::SeqCst);
        debug_assert_ne!(refs, 0);
        if refs == 1 && (*node).retired() {
            self.push(node);
        }
    }

    /// Tags `node` as unlinked and retires it now if nothing references it
    /// anymore.
    ///
    /// Tagging and the zero check share one barrier section: a concurrent
    /// release that observes the tag may enqueue a duplicate record, but no
    /// scan can reap the node before this call is done with it.
    ///
    /// # Safety
    ///
    /// The node should already be unlinked, with its frozen neighbor
    /// references in place.
    pub(crate) unsafe fn retire(&self, node: *mut N) {
        let _barrier = self.barrier.read();
        (*node).set_retired();
        if (*node).refs().load(Ordering::SeqCst) == 0 {
            self.push(node);
        }
    }

    /// Prepends a record for `node` to the shared stack.
    fn push(&self, node: *mut N) {
        let record = UnsafeBox::into_raw(UnsafeBox::new(Record {
            node,
            next: ptr::null_mut(),
            reap: false,
        }));
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            unsafe { (*record).next = head };
            match self
                .head
                .compare_exchange_weak(head, record, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    fn run(inner: &Arc<Self>) {
        loop {
            let stopping = inner.stop.load(Ordering::Acquire);
            inner.scan();
            if stopping && inner.head.load(Ordering::Acquire).is_null() {
                // Nothing outstanding is left and nothing new can arrive:
                // the collection is being dropped and every cascade has been
                // followed to its end.
                return;
            }
            if !stopping {
                thread::sleep(SCAN_INTERVAL);
            }
        }
    }

    /// One mark/sweep pass over the retirement stack.
    fn scan(&self) {
        // Snapshot the stack under the barrier held exclusively. Every pin
        // that was in flight has published its increment by the time the
        // barrier is ours.
        let h1 = {
            let _barrier = self.barrier.write();
            self.head.load(Ordering::Acquire)
        };
        if h1.is_null() {
            return;
        }

        // Mark. A node seen unreferenced here is unreachable for good: it is
        // unlinked, no cursor sits on it, and no retired node's frozen links
        // hold it (that would be a reference too).
        unsafe {
            let mut record = h1;
            while !record.is_null() {
                let node = (*record).node;
                let reap = (*node).refs().load(Ordering::Acquire) == 0
                    && !(*node).purged().swap(true, Ordering::AcqRel);
                (*record).reap = reap;
                record = (*record).next;
            }
        }

        // Re-snapshot. Records pushed since the first snapshot are younger
        // than one grace interval and stay shared for the next pass. Pushes
        // happen under the barrier in shared mode, so holding it exclusively
        // freezes the stack.
        let h2 = {
            let _barrier = self.barrier.write();
            let h2 = self.head.load(Ordering::Acquire);
            if h2 == h1 {
                self.head.store(ptr::null_mut(), Ordering::Release);
            }
            h2
        };

        // Prune duplicates among the young records and sever them from the
        // segment reaped below. Only the worker ever touches the next links
        // of already-pushed records, so rewriting them under live pushers is
        // fine; the segment head must stay, its predecessors are unknown.
        if h2 != h1 {
            unsafe {
                let mut prev: *mut Record<N> = ptr::null_mut();
                let mut record = h2;
                while record != h1 {
                    let next = (*record).next;
                    let duplicate = (*(*record).node).purged().load(Ordering::Acquire);
                    if duplicate && !prev.is_null() {
                        (*prev).next = next;
                        UnsafeBox::drop(&mut UnsafeBox::from_raw(record));
                    } else {
                        // A reaped node is unreachable, so it cannot have
                        // been re-pinned and re-pushed within this scan.
                        debug_assert!(!duplicate);
                        prev = record;
                    }
                    record = next;
                }
                (*prev).next = ptr::null_mut();
            }
        }

        // The segment from the first snapshot is private now. Reap the
        // marked nodes; releasing their frozen links may cascade more
        // records onto the shared stack for the next pass.
        unsafe {
            let mut record = h1;
            while !record.is_null() {
                let next = (*record).next;
                if (*record).reap {
                    N::reclaim((*record).node, self);
                }
                UnsafeBox::drop(&mut UnsafeBox::from_raw(record));
                record = next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unsafe_box::UnsafeBox;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    static FREED: AtomicUsize = AtomicUsize::new(0);

    struct DummyNode {
        refs: AtomicUsize,
        purged: AtomicBool,
        retired: AtomicBool,
    }

    impl DummyNode {
        fn unlinked() -> *mut DummyNode {
            UnsafeBox::into_raw(UnsafeBox::new(DummyNode {
                refs: AtomicUsize::new(0),
                purged: AtomicBool::new(false),
                retired: AtomicBool::new(true),
            }))
        }
    }

    impl Reclaim for DummyNode {
        fn refs(&self) -> &AtomicUsize {
            &self.refs
        }

        fn purged(&self) -> &AtomicBool {
            &self.purged
        }

        fn retired(&self) -> bool {
            self.retired.load(Ordering::Acquire)
        }

        fn set_retired(&self) {
            self.retired.store(true, Ordering::Release);
        }

        unsafe fn reclaim(node: *mut Self, _purgatory: &PurgeInner<Self>) {
            FREED.fetch_add(1, Ordering::AcqRel);
            UnsafeBox::drop(&mut UnsafeBox::from_raw(node));
        }
    }

    #[test]
    fn drains_on_shutdown() {
        let before = FREED.load(Ordering::Acquire);
        let mut purgatory = Purgatory::<DummyNode>::new();
        unsafe {
            for _ in 0..16 {
                purgatory.inner().retire(DummyNode::unlinked());
            }
        }
        purgatory.shutdown();
        assert_eq!(FREED.load(Ordering::Acquire) - before, 16);
    }

    #[test]
    fn pinned_nodes_survive_the_drain() {
        let mut purgatory = Purgatory::<DummyNode>::new();
        let node = DummyNode::unlinked();
        unsafe {
            (*node).refs.store(1, Ordering::Release);
            purgatory.inner().retire(node);
            purgatory.shutdown();
            // Still pinned: the worker never freed it.
            assert_eq!((*node).refs.load(Ordering::Acquire), 1);
            UnsafeBox::drop(&mut UnsafeBox::from_raw(node));
        }
    }
}
