use crate::lock::RawRwLock;
use crate::logger::{Log, NoopLogger};
use crate::node::{AtomicStatus, Status};
use crate::purgatory::{PurgeInner, Purgatory, Reclaim};
use crate::unsafe_box::UnsafeBox;
use std::cell::UnsafeCell;
use std::ffi::c_void;
use std::iter::FromIterator;
use std::marker::PhantomData as marker;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

pub(crate) struct ListNode<T, Logger> {
    status: AtomicStatus,
    /// `None` only on the two sentinels.
    value: UnsafeCell<Option<T>>,
    left: AtomicPtr<ListNode<T, Logger>>,
    right: AtomicPtr<ListNode<T, Logger>>,
    /// Two structural references while linked, plus one per live cursor.
    /// Once unlinked, the frozen links own one reference on each neighbor
    /// instead.
    refs: AtomicUsize,
    purged: AtomicBool,
    lock: RawRwLock,
    marker: marker<Logger>,
}

impl<T, Logger> ListNode<T, Logger>
where
    Logger: Log,
{
    fn alloc(status: Status, value: Option<T>, refs: usize) -> *mut Self {
        let node = UnsafeBox::into_raw(UnsafeBox::new(Self {
            status: AtomicStatus::new(status),
            value: UnsafeCell::new(value),
            left: AtomicPtr::new(ptr::null_mut()),
            right: AtomicPtr::new(ptr::null_mut()),
            refs: AtomicUsize::new(refs),
            purged: AtomicBool::new(false),
            lock: RawRwLock::new(),
            marker,
        }));
        Logger::log_new(node as *const c_void);
        node
    }

    unsafe fn free(node: *mut Self) {
        Logger::log_drop(node as *const c_void);
        UnsafeBox::drop(&mut UnsafeBox::from_raw(node));
    }
}

impl<T, Logger> Reclaim for ListNode<T, Logger>
where
    Logger: Log,
{
    fn refs(&self) -> &AtomicUsize {
        &self.refs
    }

    fn purged(&self) -> &AtomicBool {
        &self.purged
    }

    fn retired(&self) -> bool {
        self.status.load() == Status::Deleted
    }

    fn set_retired(&self) {
        self.status.store(Status::Deleted);
    }

    unsafe fn reclaim(node: *mut Self, purgatory: &PurgeInner<Self>) {
        let left = (*node).left.load(Ordering::Acquire);
        let right = (*node).right.load(Ordering::Acquire);
        debug_assert!(!left.is_null() && !right.is_null());
        purgatory.release(left);
        purgatory.release(right);
        Self::free(node);
    }
}

/// A concurrent doubly-linked list.
///
/// Every operation takes `&self`; threads share the list behind an `Arc` or
/// a scope. Cursors obtained from [`List::begin`], [`List::end`] and
/// [`List::find`] pin their node and keep working across concurrent erasure
/// of any node, including their own.
pub struct List<T, Logger = NoopLogger>
where
    Logger: Log,
{
    begin: *mut ListNode<T, Logger>,
    end: *mut ListNode<T, Logger>,
    len: AtomicUsize,
    purgatory: Purgatory<ListNode<T, Logger>>,
}

unsafe impl<T, Logger> Send for List<T, Logger>
where
    T: Send + Sync,
    Logger: Log,
{
}

unsafe impl<T, Logger> Sync for List<T, Logger>
where
    T: Send + Sync,
    Logger: Log,
{
}

impl<T, Logger> List<T, Logger>
where
    T: Send + 'static,
    Logger: Log + 'static,
{
    /// Creates an empty list.
    pub fn new() -> Self {
        let begin = ListNode::alloc(Status::Begin, None, 1);
        let end = ListNode::alloc(Status::End, None, 1);
        unsafe {
            (*begin).right.store(end, Ordering::Release);
            (*end).left.store(begin, Ordering::Release);
        }
        Self {
            begin,
            end,
            len: AtomicUsize::new(0),
            purgatory: Purgatory::new(),
        }
    }
}

impl<T, Logger> Default for List<T, Logger>
where
    T: Send + 'static,
    Logger: Log + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, Logger> List<T, Logger>
where
    Logger: Log,
{
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a cursor at the first node, or at [`List::end`] when the
    /// list is empty.
    pub fn begin(&self) -> Cursor<'_, T, Logger> {
        unsafe {
            let _begin = (*self.begin).lock.read();
            Cursor::pin(self, (*self.begin).right.load(Ordering::Acquire))
        }
    }

    /// Returns a cursor at the end sentinel, one past the last node.
    pub fn end(&self) -> Cursor<'_, T, Logger> {
        unsafe { Cursor::pin(self, self.end) }
    }

    /// Inserts `value` at the front of the list.
    pub fn push_front(&self, value: T) {
        unsafe {
            let begin = self.begin;
            let _left = (*begin).lock.write();
            let right = (*begin).right.load(Ordering::Acquire);
            let _right = (*right).lock.write();

            let node = ListNode::alloc(Status::Active, Some(value), 2);
            (*node).left.store(begin, Ordering::Release);
            (*node).right.store(right, Ordering::Release);

            (*begin).right.store(node, Ordering::Release);
            (*right).left.store(node, Ordering::Release);
            self.len.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Inserts `value` at the back of the list.
    pub fn push_back(&self, value: T) {
        let mut value = Some(value);
        unsafe {
            let end = self.end;
            loop {
                // Snapshot and pin the current last node. Its lock orders
                // before the sentinel's, so it cannot be taken while the
                // sentinel's is held; snapshot, lock in order, revalidate.
                let left = {
                    let _end = (*end).lock.read();
                    let left = (*end).left.load(Ordering::Acquire);
                    (*left).refs.fetch_add(1, Ordering::Relaxed);
                    left
                };

                let linked = {
                    let _left = (*left).lock.write();
                    let _end = (*end).lock.write();
                    if (*left).right.load(Ordering::Acquire) == end
                        && (*end).left.load(Ordering::Acquire) == left
                    {
                        let node = ListNode::alloc(Status::Active, value.take(), 2);
                        (*node).left.store(left, Ordering::Release);
                        (*node).right.store(end, Ordering::Release);

                        (*left).right.store(node, Ordering::Release);
                        (*end).left.store(node, Ordering::Release);
                        self.len.fetch_add(1, Ordering::AcqRel);
                        true
                    } else {
                        false
                    }
                };

                self.purgatory.inner().release(left);
                if linked {
                    return;
                }
            }
        }
    }

    /// Inserts `value` before the node the cursor is at.
    ///
    /// At the end sentinel this is [`List::push_back`]; at the begin
    /// sentinel, [`List::push_front`]; at an unlinked node, a no-op.
    pub fn insert(&self, cursor: &Cursor<'_, T, Logger>, value: T) {
        debug_assert!(ptr::eq(cursor.list, self));
        let node = cursor.node;
        unsafe {
            match (*node).status.load() {
                Status::End => return self.push_back(value),
                Status::Begin => return self.push_front(value),
                Status::Deleted => return,
                Status::Active => {}
            }
            let mut value = Some(value);
            loop {
                let left = {
                    let _node = (*node).lock.read();
                    if (*node).status.load() != Status::Active {
                        return;
                    }
                    let left = (*node).left.load(Ordering::Acquire);
                    (*left).refs.fetch_add(1, Ordering::Relaxed);
                    left
                };

                let linked = {
                    let _left = (*left).lock.write();
                    let _node = (*node).lock.write();
                    if (*left).right.load(Ordering::Acquire) == node
                        && (*node).left.load(Ordering::Acquire) == left
                        && (*node).status.load() == Status::Active
                    {
                        let new = ListNode::alloc(Status::Active, value.take(), 2);
                        (*new).left.store(left, Ordering::Release);
                        (*new).right.store(node, Ordering::Release);

                        (*left).right.store(new, Ordering::Release);
                        (*node).left.store(new, Ordering::Release);
                        self.len.fetch_add(1, Ordering::AcqRel);
                        true
                    } else {
                        false
                    }
                };

                self.purgatory.inner().release(left);
                if linked || (*node).status.load() != Status::Active {
                    return;
                }
            }
        }
    }

    /// Unlinks the node the cursor is at and retires it to the purgatory.
    ///
    /// A no-op unless the node is a live entry.
    pub fn remove(&self, cursor: &Cursor<'_, T, Logger>) {
        debug_assert!(ptr::eq(cursor.list, self));
        unsafe { self.unlink(cursor.node) }
    }

    /// Erases the last node. A no-op on an empty list.
    pub fn pop_back(&self) {
        unsafe {
            let node = {
                let _end = (*self.end).lock.read();
                let node = (*self.end).left.load(Ordering::Acquire);
                if (*node).status.load() != Status::Active {
                    return;
                }
                (*node).refs.fetch_add(1, Ordering::Relaxed);
                node
            };
            self.unlink(node);
            self.purgatory.inner().release(node);
        }
    }

    unsafe fn unlink(&self, node: *mut ListNode<T, Logger>) {
        if (*node).status.load() != Status::Active {
            return;
        }
        loop {
            let (left, right) = {
                let _node = (*node).lock.read();
                if (*node).status.load() != Status::Active {
                    return;
                }
                let left = (*node).left.load(Ordering::Acquire);
                let right = (*node).right.load(Ordering::Acquire);
                (*left).refs.fetch_add(1, Ordering::Relaxed);
                (*right).refs.fetch_add(1, Ordering::Relaxed);
                (left, right)
            };

            let unlinked = {
                let _left = (*left).lock.write();
                let _node = (*node).lock.read();
                let _right = (*right).lock.write();
                // Adjacency must hold in both directions: a dead neighbor
                // keeps its frozen link to this node, so its own side of
                // the check would still pass.
                if (*left).right.load(Ordering::Acquire) == node
                    && (*right).left.load(Ordering::Acquire) == node
                    && (*node).left.load(Ordering::Acquire) == left
                    && (*node).right.load(Ordering::Acquire) == right
                    && (*node).status.load() == Status::Active
                {
                    // The frozen links own one reference on each neighbor
                    // from now until reclamation; they must be in place
                    // before any release path can observe the tag and hand
                    // the node to the purgatory.
                    (*left).refs.fetch_add(1, Ordering::Relaxed);
                    (*right).refs.fetch_add(1, Ordering::Relaxed);
                    (*node).status.store(Status::Deleted);
                    // The neighbors stop owning the node. Sequentially
                    // consistent like the tag store above, so a racing
                    // cursor release observes the tag once it observes the
                    // decremented count.
                    (*node).refs.fetch_sub(2, Ordering::SeqCst);
                    (*left).right.store(right, Ordering::Release);
                    (*right).left.store(left, Ordering::Release);
                    self.len.fetch_sub(1, Ordering::AcqRel);
                    true
                } else {
                    false
                }
            };

            self.purgatory.inner().release(left);
            self.purgatory.inner().release(right);
            if unlinked || (*node).status.load() != Status::Active {
                return;
            }
        }
    }

    /// Returns a cursor at the first live node equal to `value`, or at
    /// [`List::end`] if there is none.
    pub fn find(&self, value: &T) -> Cursor<'_, T, Logger>
    where
        T: PartialEq,
    {
        let mut cursor = self.begin();
        loop {
            let node = cursor.node;
            unsafe {
                if (*node).status.load() == Status::End {
                    return cursor;
                }
                let matches = {
                    let _node = (*node).lock.read();
                    (*node).status.load() == Status::Active
                        && (*(*node).value.get()).as_ref() == Some(value)
                };
                if matches {
                    return cursor;
                }
            }
            cursor.move_next();
        }
    }
}

impl<T, Logger> Drop for List<T, Logger>
where
    Logger: Log,
{
    fn drop(&mut self) {
        // No cursor can exist anymore; join the worker, which drains every
        // retired node first, then free the chain left between the
        // sentinels.
        self.purgatory.shutdown();
        unsafe {
            let mut node = self.begin;
            loop {
                let next = (*node).right.load(Ordering::Relaxed);
                let done = node == self.end;
                ListNode::free(node);
                if done {
                    return;
                }
                node = next;
            }
        }
    }
}

impl<T, Logger> FromIterator<T> for List<T, Logger>
where
    T: Send + 'static,
    Logger: Log + 'static,
{
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let list = Self::new();
        for value in iter {
            list.push_back(value);
        }
        list
    }
}

impl<T, Logger> Extend<T> for List<T, Logger>
where
    T: Send + 'static,
    Logger: Log + 'static,
{
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        for value in iter {
            self.push_back(value);
        }
    }
}

/// A pinned position in a [`List`].
///
/// The cursor owns one reference on its node, which keeps the node's memory
/// alive across concurrent erasure. Advancing off an erased node follows the
/// links the node had when it was unlinked.
pub struct Cursor<'a, T, Logger = NoopLogger>
where
    Logger: Log,
{
    list: &'a List<T, Logger>,
    node: *mut ListNode<T, Logger>,
}

impl<'a, T, Logger> Cursor<'a, T, Logger>
where
    Logger: Log,
{
    /// # Safety
    ///
    /// The node should be kept alive by a lock or a reference the caller
    /// holds.
    unsafe fn pin(list: &'a List<T, Logger>, node: *mut ListNode<T, Logger>) -> Self {
        (*node).refs.fetch_add(1, Ordering::Relaxed);
        Self { list, node }
    }

    /// Returns a snapshot of the node's value; `None` at the sentinels.
    pub fn get(&self) -> Option<T>
    where
        T: Clone,
    {
        unsafe {
            let _node = (*self.node).lock.read();
            (*(*self.node).value.get()).clone()
        }
    }

    /// Replaces the node's value in place. A no-op at the sentinels.
    pub fn set(&self, value: T) {
        unsafe {
            let _node = (*self.node).lock.write();
            if let Some(slot) = (*(*self.node).value.get()).as_mut() {
                *slot = value;
            }
        }
    }

    /// Moves to the right neighbor. A no-op at the end sentinel.
    pub fn move_next(&mut self) {
        unsafe {
            if (*self.node).status.load() == Status::End {
                return;
            }
            let prev = self.node;
            {
                let _barrier = self.list.purgatory.inner().barrier().read();
                let next = (*prev).right.load(Ordering::Acquire);
                (*next).refs.fetch_add(1, Ordering::Relaxed);
                self.node = next;
            }
            self.list.purgatory.inner().release(prev);
        }
    }

    /// Moves to the left neighbor. A no-op at the begin sentinel.
    pub fn move_prev(&mut self) {
        unsafe {
            if (*self.node).status.load() == Status::Begin {
                return;
            }
            let prev = self.node;
            {
                let _barrier = self.list.purgatory.inner().barrier().read();
                let next = (*prev).left.load(Ordering::Acquire);
                (*next).refs.fetch_add(1, Ordering::Relaxed);
                self.node = next;
            }
            self.list.purgatory.inner().release(prev);
        }
    }
}

impl<T, Logger> Clone for Cursor<'_, T, Logger>
where
    Logger: Log,
{
    fn clone(&self) -> Self {
        // The source pin keeps the node alive, so taking another reference
        // is a plain increment.
        unsafe {
            (*self.node).refs.fetch_add(1, Ordering::Relaxed);
        }
        Self {
            list: self.list,
            node: self.node,
        }
    }
}

impl<T, Logger> PartialEq for Cursor<'_, T, Logger>
where
    Logger: Log,
{
    fn eq(&self, other: &Self) -> bool {
        self.node == other.node
    }
}

impl<T, Logger> Eq for Cursor<'_, T, Logger> where Logger: Log {}

impl<T, Logger> std::fmt::Debug for Cursor<'_, T, Logger>
where
    Logger: Log,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor").field("node", &self.node).finish()
    }
}

impl<T, Logger> Drop for Cursor<'_, T, Logger>
where
    Logger: Log,
{
    fn drop(&mut self) {
        unsafe { self.list.purgatory.inner().release(self.node) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(list: &List<i32>) -> Vec<i32> {
        let mut values = Vec::new();
        let mut cursor = list.begin();
        while cursor != list.end() {
            values.extend(cursor.get());
            cursor.move_next();
        }
        values
    }

    /// Walks the raw chain in both directions, checking the adjacency
    /// invariant and that the live count matches `len`.
    fn assert_well_formed(list: &List<i32>) {
        unsafe {
            let mut live = 0;
            let mut node = list.begin;
            assert_eq!((*node).status.load(), Status::Begin);
            loop {
                let right = (*node).right.load(Ordering::Acquire);
                if node != list.end {
                    assert_eq!((*right).left.load(Ordering::Acquire), node);
                }
                if (*node).status.load() == Status::Active {
                    live += 1;
                }
                if node == list.end {
                    break;
                }
                node = right;
            }
            assert_eq!(live, list.len());
        }
    }

    #[test]
    fn pushes_and_finds() {
        let list = List::new();
        assert!(list.is_empty());
        list.push_back(2);
        list.push_back(3);
        list.push_front(1);
        assert_eq!(list.len(), 3);
        assert_eq!(collect(&list), [1, 2, 3]);
        assert_well_formed(&list);

        assert_eq!(list.find(&2).get(), Some(2));
        assert_eq!(list.find(&4), list.end());
    }

    #[test]
    fn insert_before_positions() {
        let list = (1..=4).collect::<List<i32>>();
        list.push_back(5);
        list.push_front(0);
        list.insert(&list.end(), 6);
        let mut before_last = list.end();
        before_last.move_prev();
        list.insert(&before_last, 7);
        assert_eq!(collect(&list), [0, 1, 2, 3, 4, 5, 7, 6]);
        assert_well_formed(&list);
    }

    #[test]
    fn insert_at_begin_cursor_is_push_front() {
        let list = (1..=2).collect::<List<i32>>();
        let mut cursor = list.begin();
        cursor.move_prev();
        list.insert(&cursor, 0);
        assert_eq!(collect(&list), [0, 1, 2]);
    }

    #[test]
    fn removes_through_cursor() {
        let list = (1..=4).collect::<List<i32>>();
        let cursor = list.find(&2);
        list.remove(&cursor);
        assert_eq!(collect(&list), [1, 3, 4]);
        assert_well_formed(&list);

        // Erasing twice through the same cursor is a no-op.
        list.remove(&cursor);
        assert_eq!(list.len(), 3);

        // So is inserting before the erased node.
        list.insert(&cursor, 9);
        assert_eq!(collect(&list), [1, 3, 4]);
    }

    #[test]
    fn erased_node_stays_readable_and_advances() {
        let list = (1..=4).collect::<List<i32>>();
        let mut cursor = list.find(&2);
        list.remove(&cursor);
        assert_eq!(cursor.get(), Some(2));
        cursor.move_next();
        assert_eq!(cursor.get(), Some(3));
        cursor.move_prev();
        assert_eq!(cursor.get(), Some(1));
    }

    #[test]
    fn pop_back_round_trip() {
        let list = (1..=3).collect::<List<i32>>();
        list.push_back(4);
        list.pop_back();
        assert_eq!(collect(&list), [1, 2, 3]);
        list.pop_back();
        list.pop_back();
        list.pop_back();
        assert!(list.is_empty());
        // Popping an empty list is a no-op.
        list.pop_back();
        assert!(list.is_empty());
        assert_well_formed(&list);
    }

    #[test]
    fn set_updates_in_place() {
        let list = (1..=3).collect::<List<i32>>();
        let cursor = list.find(&2);
        cursor.set(20);
        assert_eq!(collect(&list), [1, 20, 3]);
        // Setting through a sentinel cursor does nothing.
        list.end().set(99);
        assert_eq!(collect(&list), [1, 20, 3]);
    }

    #[test]
    fn cursor_clone_is_same_position() {
        let list = (1..=3).collect::<List<i32>>();
        let cursor = list.find(&2);
        let mut clone = cursor.clone();
        assert_eq!(clone, cursor);
        clone.move_next();
        assert_ne!(clone, cursor);
        assert_eq!(cursor.get(), Some(2));
    }

    #[test]
    fn end_is_a_fixed_point() {
        let list = (1..=2).collect::<List<i32>>();
        let mut cursor = list.end();
        cursor.move_next();
        assert_eq!(cursor, list.end());
        let mut cursor = list.begin();
        cursor.move_prev();
        cursor.move_prev();
        assert_eq!(cursor.get(), None);
        cursor.move_next();
        assert_eq!(cursor.get(), Some(1));
    }
}
