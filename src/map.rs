use crate::logger::{Log, NoopLogger};
use crate::node::{AtomicStatus, Status};
use crate::purgatory::{PurgeInner, Purgatory, Reclaim};
use crate::unsafe_box::UnsafeBox;
use parking_lot::RwLock;
use std::cmp::Ordering::{Equal, Greater, Less};
use std::ffi::c_void;
use std::iter::FromIterator;
use std::marker::PhantomData as marker;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicUsize, Ordering};

pub(crate) struct MapNode<K, V, Logger> {
    status: AtomicStatus,
    /// `None` only on the end sentinel. Immutable once the node is
    /// published, so cursors borrow it without a lock.
    entry: Option<(K, V)>,
    parent: AtomicPtr<MapNode<K, V, Logger>>,
    left: AtomicPtr<MapNode<K, V, Logger>>,
    right: AtomicPtr<MapNode<K, V, Logger>>,
    /// Cached subtree height; a missing child counts as -1.
    height: AtomicI32,
    /// One reference per live cursor. Once unlinked, the frozen links own
    /// one reference on each neighbor.
    refs: AtomicUsize,
    purged: AtomicBool,
    marker: marker<Logger>,
}

impl<K, V, Logger> MapNode<K, V, Logger>
where
    Logger: Log,
{
    fn alloc(status: Status, entry: Option<(K, V)>, refs: usize) -> *mut Self {
        let node = UnsafeBox::into_raw(UnsafeBox::new(Self {
            status: AtomicStatus::new(status),
            entry,
            parent: AtomicPtr::new(ptr::null_mut()),
            left: AtomicPtr::new(ptr::null_mut()),
            right: AtomicPtr::new(ptr::null_mut()),
            height: AtomicI32::new(0),
            refs: AtomicUsize::new(refs),
            purged: AtomicBool::new(false),
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

impl<K, V, Logger> Reclaim for MapNode<K, V, Logger>
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
        for &neighbor in &[
            (*node).parent.load(Ordering::Acquire),
            (*node).left.load(Ordering::Acquire),
            (*node).right.load(Ordering::Acquire),
        ] {
            if !neighbor.is_null() {
                purgatory.release(neighbor);
            }
        }
        Self::free(node);
    }
}

/// Tree state guarded by the collection-wide lock.
struct Core<K, V, Logger> {
    root: *mut MapNode<K, V, Logger>,
    len: usize,
}

/// A concurrent sorted map backed by an AVL tree.
///
/// Every operation takes `&self`; threads share the map behind an `Arc` or a
/// scope. Structural operations serialize on one collection-wide
/// reader/writer lock. Cursors traverse without it: they pin their node
/// against reclamation and stay valid across concurrent removal, including
/// removal of the node they are at.
///
/// Inserting an already-present key is a no-op, not an upsert.
pub struct AvlMap<K, V, Logger = NoopLogger>
where
    Logger: Log,
{
    core: RwLock<Core<K, V, Logger>>,
    /// The end sentinel; permanently the rightmost node of the tree.
    end: *mut MapNode<K, V, Logger>,
    purgatory: Purgatory<MapNode<K, V, Logger>>,
}

unsafe impl<K, V, Logger> Send for AvlMap<K, V, Logger>
where
    K: Send + Sync,
    V: Send + Sync,
    Logger: Log,
{
}

unsafe impl<K, V, Logger> Sync for AvlMap<K, V, Logger>
where
    K: Send + Sync,
    V: Send + Sync,
    Logger: Log,
{
}

impl<K, V, Logger> AvlMap<K, V, Logger>
where
    K: Ord + Send + 'static,
    V: Send + 'static,
    Logger: Log + 'static,
{
    /// Creates an empty map.
    pub fn new() -> Self {
        let end = MapNode::alloc(Status::End, None, 1);
        Self {
            core: RwLock::new(Core { root: end, len: 0 }),
            end,
            purgatory: Purgatory::new(),
        }
    }
}

impl<K, V, Logger> Default for AvlMap<K, V, Logger>
where
    K: Ord + Send + 'static,
    V: Send + 'static,
    Logger: Log + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, Logger> AvlMap<K, V, Logger>
where
    K: Ord,
    Logger: Log,
{
    pub fn len(&self) -> usize {
        self.core.read().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserts `key` with `value`. A no-op if an equal key is present.
    pub fn insert(&self, key: K, value: V) {
        let mut core = self.core.write();
        unsafe {
            let parent = Self::locate(core.root, &key);
            let goes_left = match &(*parent).entry {
                None => true,
                Some((parent_key, _)) => {
                    if *parent_key == key {
                        return;
                    }
                    key < *parent_key
                }
            };
            let node = MapNode::alloc(Status::Active, Some((key, value)), 0);
            (*node).parent.store(parent, Ordering::Release);
            if goes_left {
                debug_assert!((*parent).left.load(Ordering::Acquire).is_null());
                (*parent).left.store(node, Ordering::Release);
            } else {
                debug_assert!((*parent).right.load(Ordering::Acquire).is_null());
                (*parent).right.store(node, Ordering::Release);
            }
            core.len += 1;
            Self::rebalance(&mut core, parent);
        }
    }

    /// Removes `key`. A no-op if it is absent.
    pub fn remove(&self, key: &K) {
        let mut core = self.core.write();
        unsafe {
            let node = Self::locate(core.root, key);
            match &(*node).entry {
                Some((found, _)) if found == key => {}
                _ => return,
            }
            Self::unlink_node(&mut core, node);
            self.purgatory.inner().retire(node);
        }
    }

    /// Removes every entry.
    ///
    /// Cursors held across the call keep their value readable and still
    /// reach [`AvlMap::end`] when advanced.
    pub fn clear(&self) {
        let mut core = self.core.write();
        unsafe {
            // Unlink the minimum until only the sentinel is left. Each
            // victim freezes the neighborhood it had at its own unlink
            // time, which keeps held cursors walkable and lets the
            // purgatory cascade in unlink order.
            loop {
                let mut node = core.root;
                loop {
                    let left = (*node).left.load(Ordering::Acquire);
                    if left.is_null() {
                        break;
                    }
                    node = left;
                }
                if (*node).status.load() == Status::End {
                    return;
                }
                Self::unlink_node(&mut core, node);
                self.purgatory.inner().retire(node);
            }
        }
    }

    /// Returns a cursor at the entry with `key`, or at [`AvlMap::end`] if
    /// it is absent.
    pub fn find(&self, key: &K) -> Cursor<'_, K, V, Logger> {
        let core = self.core.read();
        unsafe {
            let node = Self::locate(core.root, key);
            match &(*node).entry {
                Some((found, _)) if found == key => Cursor::pin(self, node),
                _ => Cursor::pin(self, self.end),
            }
        }
    }

    /// Returns a cursor at the smallest entry, or at [`AvlMap::end`] when
    /// the map is empty.
    pub fn begin(&self) -> Cursor<'_, K, V, Logger> {
        let core = self.core.read();
        unsafe {
            let mut node = core.root;
            loop {
                let left = (*node).left.load(Ordering::Acquire);
                if left.is_null() {
                    break;
                }
                node = left;
            }
            Cursor::pin(self, node)
        }
    }

    /// Returns a cursor at the end sentinel, one past the largest entry.
    pub fn end(&self) -> Cursor<'_, K, V, Logger> {
        unsafe { Cursor::pin(self, self.end) }
    }

    /// Descends to the node with `key`, or to the node the key would be
    /// attached under. The end sentinel orders above every key.
    unsafe fn locate(
        root: *mut MapNode<K, V, Logger>,
        key: &K,
    ) -> *mut MapNode<K, V, Logger> {
        let mut current = root;
        loop {
            let next = match &(*current).entry {
                None => (*current).left.load(Ordering::Acquire),
                Some((current_key, _)) => match key.cmp(current_key) {
                    Equal => return current,
                    Less => (*current).left.load(Ordering::Acquire),
                    Greater => (*current).right.load(Ordering::Acquire),
                },
            };
            if next.is_null() {
                return current;
            }
            current = next;
        }
    }

    /// Splices `node` out of the tree, freezes its links, and rebalances.
    /// The caller retires the node to the purgatory, which tags it.
    unsafe fn unlink_node(core: &mut Core<K, V, Logger>, node: *mut MapNode<K, V, Logger>) {
        debug_assert_eq!((*node).status.load(), Status::Active);
        let left = (*node).left.load(Ordering::Acquire);
        let right = (*node).right.load(Ordering::Acquire);

        let rebalance_from;
        if !left.is_null() && !right.is_null() {
            // Two children: relink the in-order predecessor into this
            // node's position. Payloads never move between nodes; cursors
            // pin nodes.
            let pred = Self::rightmost(left);
            if pred == left {
                // The predecessor keeps its own left subtree.
                rebalance_from = pred;
            } else {
                let pred_parent = (*pred).parent.load(Ordering::Acquire);
                let pred_left = (*pred).left.load(Ordering::Acquire);
                (*pred_parent).right.store(pred_left, Ordering::Release);
                if !pred_left.is_null() {
                    (*pred_left).parent.store(pred_parent, Ordering::Release);
                }
                (*pred).left.store(left, Ordering::Release);
                (*left).parent.store(pred, Ordering::Release);
                rebalance_from = pred_parent;
            }
            (*pred).right.store(right, Ordering::Release);
            (*right).parent.store(pred, Ordering::Release);
            Self::replace_child(core, node, pred);
        } else {
            let child = if left.is_null() { right } else { left };
            rebalance_from = (*node).parent.load(Ordering::Acquire);
            Self::replace_child(core, node, child);
        }

        // Freeze the link snapshot: it owns one reference on each neighbor
        // until the node itself is reclaimed. The references must be in
        // place before the retire call publishes the tag.
        for &neighbor in &[(*node).parent.load(Ordering::Acquire), left, right] {
            if !neighbor.is_null() {
                (*neighbor).refs.fetch_add(1, Ordering::Relaxed);
            }
        }
        core.len -= 1;
        Self::rebalance(core, rebalance_from);
    }

    /// Points `old`'s parent (or the root slot) at `new` instead.
    unsafe fn replace_child(
        core: &mut Core<K, V, Logger>,
        old: *mut MapNode<K, V, Logger>,
        new: *mut MapNode<K, V, Logger>,
    ) {
        let parent = (*old).parent.load(Ordering::Acquire);
        if !new.is_null() {
            (*new).parent.store(parent, Ordering::Release);
        }
        if parent.is_null() {
            core.root = new;
        } else if (*parent).left.load(Ordering::Acquire) == old {
            (*parent).left.store(new, Ordering::Release);
        } else {
            debug_assert_eq!((*parent).right.load(Ordering::Acquire), old);
            (*parent).right.store(new, Ordering::Release);
        }
    }

    unsafe fn rightmost(node: *mut MapNode<K, V, Logger>) -> *mut MapNode<K, V, Logger> {
        let mut current = node;
        loop {
            let right = (*current).right.load(Ordering::Acquire);
            if right.is_null() {
                return current;
            }
            current = right;
        }
    }

    unsafe fn height(node: *mut MapNode<K, V, Logger>) -> i32 {
        if node.is_null() {
            -1
        } else {
            (*node).height.load(Ordering::Relaxed)
        }
    }

    unsafe fn update_height(node: *mut MapNode<K, V, Logger>) {
        let left = Self::height((*node).left.load(Ordering::Acquire));
        let right = Self::height((*node).right.load(Ordering::Acquire));
        (*node).height.store(1 + left.max(right), Ordering::Relaxed);
    }

    unsafe fn balance_factor(node: *mut MapNode<K, V, Logger>) -> i32 {
        Self::height((*node).left.load(Ordering::Acquire))
            - Self::height((*node).right.load(Ordering::Acquire))
    }

    /// Walks from `from` to the root, refreshing heights and rotating every
    /// node whose balance leaves [-1, 1].
    unsafe fn rebalance(core: &mut Core<K, V, Logger>, from: *mut MapNode<K, V, Logger>) {
        let mut node = from;
        while !node.is_null() {
            let parent = (*node).parent.load(Ordering::Acquire);
            Self::update_height(node);
            let balance = Self::balance_factor(node);
            if balance > 1 {
                let left = (*node).left.load(Ordering::Acquire);
                if Self::balance_factor(left) < 0 {
                    Self::rotate_left(core, left);
                }
                Self::rotate_right(core, node);
            } else if balance < -1 {
                let right = (*node).right.load(Ordering::Acquire);
                if Self::balance_factor(right) > 0 {
                    Self::rotate_right(core, right);
                }
                Self::rotate_left(core, node);
            }
            node = parent;
        }
    }

    unsafe fn rotate_right(core: &mut Core<K, V, Logger>, node: *mut MapNode<K, V, Logger>) {
        let pivot = (*node).left.load(Ordering::Acquire);
        let inner = (*pivot).right.load(Ordering::Acquire);
        let parent = (*node).parent.load(Ordering::Acquire);

        // Up-links move before down-links, so a concurrent climb that sees
        // the new down-links also sees the new up-links and cannot loop
        // between the pivot and the deposed node.
        (*pivot).parent.store(parent, Ordering::Release);
        if parent.is_null() {
            core.root = pivot;
        } else if (*parent).left.load(Ordering::Acquire) == node {
            (*parent).left.store(pivot, Ordering::Release);
        } else {
            (*parent).right.store(pivot, Ordering::Release);
        }

        (*node).left.store(inner, Ordering::Release);
        if !inner.is_null() {
            (*inner).parent.store(node, Ordering::Release);
        }
        (*node).parent.store(pivot, Ordering::Release);
        (*pivot).right.store(node, Ordering::Release);

        Self::update_height(node);
        Self::update_height(pivot);
    }

    unsafe fn rotate_left(core: &mut Core<K, V, Logger>, node: *mut MapNode<K, V, Logger>) {
        let pivot = (*node).right.load(Ordering::Acquire);
        let inner = (*pivot).left.load(Ordering::Acquire);
        let parent = (*node).parent.load(Ordering::Acquire);

        (*pivot).parent.store(parent, Ordering::Release);
        if parent.is_null() {
            core.root = pivot;
        } else if (*parent).left.load(Ordering::Acquire) == node {
            (*parent).left.store(pivot, Ordering::Release);
        } else {
            (*parent).right.store(pivot, Ordering::Release);
        }

        (*node).right.store(inner, Ordering::Release);
        if !inner.is_null() {
            (*inner).parent.store(node, Ordering::Release);
        }
        (*node).parent.store(pivot, Ordering::Release);
        (*pivot).left.store(node, Ordering::Release);

        Self::update_height(node);
        Self::update_height(pivot);
    }
}

impl<K, V, Logger> Drop for AvlMap<K, V, Logger>
where
    Logger: Log,
{
    fn drop(&mut self) {
        // No cursor can exist anymore; join the worker, which drains every
        // retired node first, then tear down whatever is still linked.
        self.purgatory.shutdown();
        unsafe {
            let mut stack = vec![self.core.read().root];
            while let Some(node) = stack.pop() {
                if node.is_null() {
                    continue;
                }
                stack.push((*node).left.load(Ordering::Relaxed));
                stack.push((*node).right.load(Ordering::Relaxed));
                MapNode::free(node);
            }
        }
    }
}

impl<K, V, Logger> FromIterator<(K, V)> for AvlMap<K, V, Logger>
where
    K: Ord + Send + 'static,
    V: Send + 'static,
    Logger: Log + 'static,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let map = Self::new();
        for (key, value) in iter {
            map.insert(key, value);
        }
        map
    }
}

impl<K, V, Logger> Extend<(K, V)> for AvlMap<K, V, Logger>
where
    K: Ord + Send + 'static,
    V: Send + 'static,
    Logger: Log + 'static,
{
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        for (key, value) in iter {
            self.insert(key, value);
        }
    }
}

/// A pinned position in an [`AvlMap`].
///
/// The cursor owns one reference on its node, which keeps the node's memory
/// alive across concurrent removal. Advancing off a removed node follows the
/// links the node had when it was unlinked.
pub struct Cursor<'a, K, V, Logger = NoopLogger>
where
    Logger: Log,
{
    map: &'a AvlMap<K, V, Logger>,
    node: *mut MapNode<K, V, Logger>,
}

impl<'a, K, V, Logger> Cursor<'a, K, V, Logger>
where
    Logger: Log,
{
    /// # Safety
    ///
    /// The node should be kept alive by a lock or a reference the caller
    /// holds.
    unsafe fn pin(map: &'a AvlMap<K, V, Logger>, node: *mut MapNode<K, V, Logger>) -> Self {
        (*node).refs.fetch_add(1, Ordering::Relaxed);
        Self { map, node }
    }

    /// Returns the entry's key; `None` at the end sentinel.
    pub fn key(&self) -> Option<&K> {
        unsafe { (*self.node).entry.as_ref().map(|(key, _)| key) }
    }

    /// Returns the entry's value; `None` at the end sentinel.
    pub fn value(&self) -> Option<&V> {
        unsafe { (*self.node).entry.as_ref().map(|(_, value)| value) }
    }
}

impl<'a, K, V, Logger> Cursor<'a, K, V, Logger>
where
    K: Ord,
    Logger: Log,
{
    /// Moves to the in-order successor. The end sentinel is a fixed point.
    pub fn move_next(&mut self) {
        unsafe {
            if (*self.node).status.load() == Status::End {
                return;
            }
            let prev = self.node;
            {
                let _barrier = self.map.purgatory.inner().barrier().read();
                let next = Self::successor(self.map, prev);
                (*next).refs.fetch_add(1, Ordering::Relaxed);
                self.node = next;
            }
            self.map.purgatory.inner().release(prev);
        }
    }

    unsafe fn successor(
        map: &AvlMap<K, V, Logger>,
        node: *mut MapNode<K, V, Logger>,
    ) -> *mut MapNode<K, V, Logger> {
        let right = (*node).right.load(Ordering::Acquire);
        if !right.is_null() {
            let mut next = right;
            loop {
                let left = (*next).left.load(Ordering::Acquire);
                if left.is_null() {
                    return next;
                }
                next = left;
            }
        }
        // No right subtree: the successor is the nearest ancestor ordering
        // above this node. Comparing keys keeps the climb meaningful even
        // on the frozen links of an unlinked node, whose parent no longer
        // links back to it.
        let key = match &(*node).entry {
            Some((key, _)) => key,
            None => return map.end,
        };
        let mut parent = (*node).parent.load(Ordering::Acquire);
        while !parent.is_null() {
            match &(*parent).entry {
                None => return parent,
                Some((parent_key, _)) if parent_key > key => return parent,
                Some(_) => parent = (*parent).parent.load(Ordering::Acquire),
            }
        }
        map.end
    }
}

impl<K, V, Logger> Clone for Cursor<'_, K, V, Logger>
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
            map: self.map,
            node: self.node,
        }
    }
}

impl<K, V, Logger> PartialEq for Cursor<'_, K, V, Logger>
where
    Logger: Log,
{
    fn eq(&self, other: &Self) -> bool {
        self.node == other.node
    }
}

impl<K, V, Logger> std::fmt::Debug for Cursor<'_, K, V, Logger>
where
    Logger: Log,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor").field("node", &self.node).finish()
    }
}

impl<K, V, Logger> Eq for Cursor<'_, K, V, Logger> where Logger: Log {}

impl<K, V, Logger> Drop for Cursor<'_, K, V, Logger>
where
    Logger: Log,
{
    fn drop(&mut self) {
        unsafe { self.map.purgatory.inner().release(self.node) }
    }
}
