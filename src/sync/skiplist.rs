use super::reclaim::{Cycle, Reclaimer};
use crate::error::IndexError;
use parking_lot::{Mutex, MutexGuard};
use std::cmp::Ordering as KeyOrdering;
use std::collections::HashMap;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

pub const MAX_LEVEL: usize = 16;

/// Stable handle to an entry, valid until the entry is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u64);

/// Where [`Editor::insert`] links the new entry: right in front of `Before`'s
/// node, or after the last entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    Before(NodeId),
    End,
}

struct Node<K, V> {
    id: u64,
    entry: Option<(K, V)>,
    links: Box<[AtomicPtr<Node<K, V>>]>,
}

impl<K, V> Node<K, V> {
    fn alloc(id: u64, entry: Option<(K, V)>, height: usize, next: *mut Self) -> NonNull<Self> {
        let links = (0..height).map(|_| AtomicPtr::new(next)).collect();
        NonNull::from(Box::leak(Box::new(Node { id, entry, links })))
    }

    fn key(&self) -> Option<&K> {
        self.entry.as_ref().map(|(key, _)| key)
    }

    fn next(&self, level: usize) -> *mut Self {
        self.links[level].load(Ordering::Acquire)
    }

    fn set_next(&self, level: usize, next: *mut Self, order: Ordering) {
        self.links[level].store(next, order);
    }

    fn height(&self) -> usize {
        self.links.len()
    }
}

/// An unlinked node on its way to the reclaimer.
struct RetiredNode<K, V>(NonNull<Node<K, V>>);

// Only the owning thread of the reclaim queue touches the node once retired.
unsafe impl<K: Send, V: Send> Send for RetiredNode<K, V> {}

impl<K, V> Drop for RetiredNode<K, V> {
    fn drop(&mut self) {
        // SAFETY: the node was unlinked before retirement and the reclaimer
        // only drops it once no reader can reach it.
        unsafe { drop(Box::from_raw(self.0.as_ptr())) }
    }
}

struct EditState<K, V> {
    rng: fastrand::Rng,
    next_id: u64,
    live: HashMap<NodeId, NonNull<Node<K, V>>>,
}

/// Ordered multimap readable from the real-time thread while one editor at a
/// time mutates it.
///
/// Entries with equal keys keep their insertion order. Removed nodes go
/// through the [`Reclaimer`], so a reader inside a [`Cycle`] never follows a
/// freed link.
pub struct SkipList<K, V> {
    head: NonNull<Node<K, V>>,
    tail: NonNull<Node<K, V>>,
    len: AtomicUsize,
    edit: Mutex<EditState<K, V>>,
    reclaimer: Reclaimer,
}

// SAFETY: nodes are only mutated under the edit lock and only freed through the
// reclaimer; readers share &K and &V across threads.
unsafe impl<K: Send + Sync, V: Send + Sync> Send for SkipList<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for SkipList<K, V> {}

impl<K: Ord, V> SkipList<K, V> {
    pub fn new(reclaimer: Reclaimer) -> Self {
        Self::with_seed(reclaimer, fastrand::u64(..))
    }

    pub fn with_seed(reclaimer: Reclaimer, seed: u64) -> Self {
        let tail = Node::alloc(u64::MAX, None, 0, ptr::null_mut());
        let head = Node::alloc(0, None, MAX_LEVEL, tail.as_ptr());
        Self {
            head,
            tail,
            len: AtomicUsize::new(0),
            edit: Mutex::new(EditState {
                rng: fastrand::Rng::with_seed(seed),
                next_id: 1,
                live: HashMap::new(),
            }),
            reclaimer,
        }
    }

    pub fn reclaimer(&self) -> &Reclaimer {
        &self.reclaimer
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lock-free view for the real-time thread.
    pub fn view<'c>(&'c self, cycle: &'c Cycle<'_>) -> View<'c, K, V> {
        assert!(
            cycle.covers(&self.reclaimer),
            "cycle belongs to another reclaimer"
        );
        View { list: self }
    }

    /// Takes the edit lock.
    pub fn edit(&self) -> Editor<'_, K, V> {
        Editor {
            list: self,
            state: self.edit.lock(),
        }
    }

    /// Predecessors of `key` on every level: the last node whose key is below
    /// `key`, or not above it when `inclusive`.
    ///
    /// # Safety
    /// The caller must either hold the edit lock or be inside a cycle of this
    /// list's reclaimer.
    unsafe fn descend(&self, key: &K, inclusive: bool) -> [*mut Node<K, V>; MAX_LEVEL] {
        let tail = self.tail.as_ptr();
        let mut preds = [self.head.as_ptr(); MAX_LEVEL];
        let mut x = self.head.as_ptr();
        for level in (0..MAX_LEVEL).rev() {
            loop {
                let next = unsafe { (*x).next(level) };
                if next == tail {
                    break;
                }
                let advance = match unsafe { (*next).key() }.map(|k| k.cmp(key)) {
                    Some(KeyOrdering::Less) => true,
                    Some(KeyOrdering::Equal) => inclusive,
                    _ => false,
                };
                if !advance {
                    break;
                }
                x = next;
            }
            preds[level] = x;
        }
        preds
    }
}

impl<K, V> Drop for SkipList<K, V> {
    fn drop(&mut self) {
        let tail = self.tail.as_ptr();
        let mut x = self.head.as_ptr();
        // SAFETY: no reader or editor can exist while the list is dropped.
        unsafe {
            while x != tail {
                let next = (*x).next(0);
                drop(Box::from_raw(x));
                x = next;
            }
            drop(Box::from_raw(tail));
        }
    }
}

/// Read-only access, either from a [`Cycle`] or from an [`Editor`].
pub struct View<'g, K, V> {
    list: &'g SkipList<K, V>,
}

impl<K, V> Clone for View<'_, K, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K, V> Copy for View<'_, K, V> {}

impl<'g, K: Ord, V> View<'g, K, V> {
    fn cursor(&self, node: *mut Node<K, V>) -> Cursor<'g, K, V> {
        Cursor {
            list: self.list,
            // descend and next never hand out null
            node: NonNull::new(node).unwrap_or(self.list.tail),
        }
    }

    /// The head sentinel; `next()` yields the first entry.
    pub fn head(&self) -> Cursor<'g, K, V> {
        self.cursor(self.list.head.as_ptr())
    }

    pub fn end(&self) -> Cursor<'g, K, V> {
        self.cursor(self.list.tail.as_ptr())
    }

    pub fn first(&self) -> Cursor<'g, K, V> {
        self.head().next()
    }

    /// First entry with key not below `key`.
    pub fn lower_bound(&self, key: &K) -> Cursor<'g, K, V> {
        self.find_less(key).next()
    }

    /// First entry with key above `key`.
    pub fn upper_bound(&self, key: &K) -> Cursor<'g, K, V> {
        self.find_less_or_equal(key).next()
    }

    /// Last entry with key below `key`, or the head sentinel.
    pub fn find_less(&self, key: &K) -> Cursor<'g, K, V> {
        // SAFETY: a view only exists under the edit lock or inside a cycle.
        let preds = unsafe { self.list.descend(key, false) };
        self.cursor(preds[0])
    }

    /// Last entry with key not above `key`, or the head sentinel.
    pub fn find_less_or_equal(&self, key: &K) -> Cursor<'g, K, V> {
        // SAFETY: as in find_less.
        let preds = unsafe { self.list.descend(key, true) };
        self.cursor(preds[0])
    }

    pub fn iter(&self) -> Iter<'g, K, V> {
        Iter {
            cursor: self.first(),
        }
    }
}

/// Position in the list. Sentinels have no entry.
pub struct Cursor<'g, K, V> {
    list: &'g SkipList<K, V>,
    node: NonNull<Node<K, V>>,
}

impl<K, V> Clone for Cursor<'_, K, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K, V> Copy for Cursor<'_, K, V> {}

impl<K, V> PartialEq for Cursor<'_, K, V> {
    fn eq(&self, other: &Self) -> bool {
        self.node == other.node
    }
}

impl<K, V> Eq for Cursor<'_, K, V> {}

impl<K, V> std::fmt::Debug for Cursor<'_, K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_head() {
            f.write_str("Cursor(head)")
        } else if self.is_end() {
            f.write_str("Cursor(end)")
        } else {
            write!(f, "Cursor({})", self.node_ref().id)
        }
    }
}

impl<'g, K, V> Cursor<'g, K, V> {
    fn node_ref(&self) -> &'g Node<K, V> {
        // SAFETY: the node is reachable for the lifetime of the view that
        // produced this cursor.
        unsafe { &*self.node.as_ptr() }
    }

    pub fn is_head(&self) -> bool {
        self.node == self.list.head
    }

    pub fn is_end(&self) -> bool {
        self.node == self.list.tail
    }

    pub fn id(&self) -> Option<NodeId> {
        self.node_ref().entry.as_ref().map(|_| NodeId(self.node_ref().id))
    }

    pub fn key(&self) -> Option<&'g K> {
        self.node_ref().key()
    }

    pub fn value(&self) -> Option<&'g V> {
        self.node_ref().entry.as_ref().map(|(_, value)| value)
    }

    pub fn entry(&self) -> Option<(&'g K, &'g V)> {
        self.node_ref().entry.as_ref().map(|(key, value)| (key, value))
    }

    /// Following entry; the end stays at the end.
    pub fn next(self) -> Self {
        if self.is_end() {
            return self;
        }
        let next = self.node_ref().next(0);
        Cursor {
            list: self.list,
            node: NonNull::new(next).unwrap_or(self.list.tail),
        }
    }
}

pub struct Iter<'g, K, V> {
    cursor: Cursor<'g, K, V>,
}

impl<'g, K, V> Iterator for Iter<'g, K, V> {
    type Item = (&'g K, &'g V);

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.cursor.entry()?;
        self.cursor = self.cursor.next();
        Some(entry)
    }
}

/// Exclusive editing access. Holds the list's edit lock.
pub struct Editor<'a, K, V> {
    list: &'a SkipList<K, V>,
    state: MutexGuard<'a, EditState<K, V>>,
}

impl<K: Ord, V> Editor<'_, K, V> {
    pub fn view(&self) -> View<'_, K, V> {
        View { list: self.list }
    }

    pub fn get(&self, id: NodeId) -> Option<Cursor<'_, K, V>> {
        let node = *self.state.live.get(&id)?;
        Some(Cursor {
            list: self.list,
            node,
        })
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.state.live.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.state.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.live.is_empty()
    }

    /// Links a new entry immediately in front of `position`. Fails when `key`
    /// would break the ordering there.
    pub fn insert(&mut self, position: Position, key: K, value: V) -> Result<NodeId, IndexError> {
        let list = self.list;
        let tail = list.tail.as_ptr();
        let target = match position {
            Position::End => tail,
            Position::Before(id) => self
                .state
                .live
                .get(&id)
                .ok_or(IndexError::UnknownNode)?
                .as_ptr(),
        };
        // SAFETY: the edit lock is held.
        let mut preds = unsafe { list.descend(&key, false) };
        let mut pred = preds[0];
        loop {
            let next = unsafe { (*pred).next(0) };
            if next == target {
                break;
            }
            if next == tail || unsafe { (*next).key() } != Some(&key) {
                return Err(IndexError::OutOfOrder);
            }
            pred = next;
        }
        preds[0] = pred;
        Ok(self.link(preds, key, value))
    }

    /// Links a new entry after every entry with a key not above `key`.
    pub fn insert_sorted(&mut self, key: K, value: V) -> NodeId {
        // SAFETY: the edit lock is held.
        let preds = unsafe { self.list.descend(&key, true) };
        self.link(preds, key, value)
    }

    fn link(&mut self, preds: [*mut Node<K, V>; MAX_LEVEL], key: K, value: V) -> NodeId {
        let height = random_height(&mut self.state.rng);
        let id = NodeId(self.state.next_id);
        self.state.next_id += 1;

        let node = Node::alloc(id.0, Some((key, value)), height, ptr::null_mut());
        let raw = node.as_ptr();
        // SAFETY: the edit lock is held, every pred is linked and at least as
        // tall as the level it stands for. The new node is private until the
        // level 0 store below publishes it.
        unsafe {
            for (level, pred) in preds.iter().enumerate().take(height) {
                (*raw).set_next(level, (**pred).next(level), Ordering::Relaxed);
            }
            for (level, pred) in preds.iter().enumerate().take(height) {
                (**pred).set_next(level, raw, Ordering::Release);
            }
        }
        self.state.live.insert(id, node);
        self.list.len.fetch_add(1, Ordering::Relaxed);
        id
    }
}

impl<K: Ord + Send + 'static, V: Send + 'static> Editor<'_, K, V> {
    /// Unlinks the entry and hands it to the reclaimer. Unknown ids are ignored.
    pub fn remove(&mut self, id: NodeId) -> bool {
        let Some(node) = self.state.live.remove(&id) else {
            return false;
        };
        let list = self.list;
        let tail = list.tail.as_ptr();
        let x = node.as_ptr();
        // SAFETY: the edit lock is held and x is linked on all of its levels.
        unsafe {
            if let Some(key) = (*x).key() {
                let preds = list.descend(key, false);
                let height = (*x).height();
                for level in (0..height).rev() {
                    let mut pred = preds[level];
                    // entries between pred and x share x's key
                    loop {
                        let next = (*pred).next(level);
                        if next == x || next == tail {
                            break;
                        }
                        pred = next;
                    }
                    if (*pred).next(level) == x {
                        (*pred).set_next(level, (*x).next(level), Ordering::Release);
                    }
                }
            }
        }
        list.len.fetch_sub(1, Ordering::Relaxed);
        list.reclaimer.retire(RetiredNode(node));
        true
    }
}

fn random_height(rng: &mut fastrand::Rng) -> usize {
    let mut height = 1;
    while height < MAX_LEVEL && rng.bool() {
        height += 1;
    }
    height
}
