//! Reference counters attached to resource handles.
//!
//! Every resource registered in a `ResourceManager` has a counter living in one of two
//! [`CounterPool`]s. Both pools share one implementation, parameterized over a [`SyncStrategy`]:
//!
//! * [`Local`] counters are only touched by the thread owning the manager. Releasing the last
//!   reference destroys the resource inline. Releasing a reference that already reached zero is a
//!   double release and panics.
//! * [`Shared`] counters can be incremented and decremented from any thread. Releasing the last
//!   reference posts the resource to the manager's deferred destruction queue, which is drained by
//!   `ResourceManager::gc` on the owning thread. Extra releases are ignored, since racing threads
//!   may legitimately both try to drop the last reference.
//!
//! Counter slots are recycled once their resource is destroyed. A reference to a recycled slot is
//! recognized because the slot stores the handle of its current owner; operations on such stale
//! references never affect the new occupant.
use crate::handle::{Handle, TypeTag};
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::{cell::RefCell, fmt, ops::Range, sync::Arc};
use tracing::{trace, warn};

/// A cell giving closure-scoped mutable access to its contents.
pub trait LockCell<T> {
    fn new(value: T) -> Self;
    fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R;
}

impl<T> LockCell<T> for RefCell<T> {
    fn new(value: T) -> Self {
        RefCell::new(value)
    }

    fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.borrow_mut())
    }
}

impl<T> LockCell<T> for Mutex<T> {
    fn new(value: T) -> Self {
        Mutex::new(value)
    }

    fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.lock())
    }
}

/// How a counter pool protects its state.
pub trait SyncStrategy: 'static {
    type Cell<T>: LockCell<T>;
    const THREAD_SAFE: bool;
}

/// Counters owned by a single thread.
pub enum Local {}

/// Counters that can be used from any thread.
pub enum Shared {}

impl SyncStrategy for Local {
    type Cell<T> = RefCell<T>;
    const THREAD_SAFE: bool = false;
}

impl SyncStrategy for Shared {
    type Cell<T> = Mutex<T>;
    const THREAD_SAFE: bool = true;
}

#[derive(Copy, Clone, Debug)]
struct Counter {
    handle: Handle,
    tag: Option<TypeTag>,
    count: u32,
    destroyed: bool,
}

impl Default for Counter {
    fn default() -> Self {
        Counter {
            handle: Handle::default(),
            tag: None,
            count: 0,
            destroyed: true,
        }
    }
}

/// Outcome of a release.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Release {
    /// The resource is still referenced; holds the new count.
    Alive(u32),
    /// That was the last reference: the resource must be destroyed (exactly once).
    Destroy,
    /// Stale or already released reference (shared counters only).
    Ignored,
}

/// A growable array of counters and a list of free indices.
///
/// The array and the free list are behind independent locks, never held at the same time.
pub(crate) struct CounterPool<S: SyncStrategy> {
    counters: S::Cell<Vec<Counter>>,
    free: S::Cell<Vec<u32>>,
}

impl<S: SyncStrategy> CounterPool<S> {
    pub(crate) fn with_capacity(capacity: usize) -> CounterPool<S> {
        let capacity = capacity.max(1);
        CounterPool {
            counters: S::Cell::new(vec![Counter::default(); capacity]),
            // reversed so that low indices are handed out first
            free: S::Cell::new((0..capacity as u32).rev().collect()),
        }
    }

    /// Current number of counter slots, free or not.
    pub(crate) fn capacity(&self) -> usize {
        self.counters.with(|counters| counters.len())
    }

    /// Number of slots that can be handed out without growing.
    pub(crate) fn free_count(&self) -> usize {
        self.free.with(|free| free.len())
    }

    fn grow(&self) -> Range<u32> {
        self.counters.with(|counters| {
            let old_len = counters.len();
            let new_len = (old_len * 3 / 2).max(old_len + 1);
            counters.resize(new_len, Counter::default());
            trace!(old_len, new_len, thread_safe = S::THREAD_SAFE, "counter pool grown");
            old_len as u32..new_len as u32
        })
    }

    /// Allocates a counter for `handle` with an initial count of 1 and returns its index.
    pub(crate) fn construct(&self, handle: Handle, tag: TypeTag) -> u32 {
        let index = match self.free.with(|free| free.pop()) {
            Some(index) => index,
            None => {
                let fresh = self.grow();
                let index = fresh.start;
                self.free.with(|free| free.extend(fresh.skip(1).rev()));
                index
            }
        };
        self.counters.with(|counters| {
            counters[index as usize] = Counter {
                handle,
                tag: Some(tag),
                count: 1,
                destroyed: false,
            };
        });
        index
    }

    /// Adds a reference. Returns `false` (and does nothing) if the reference is stale or the
    /// resource has already been released.
    pub(crate) fn inc(&self, index: u32, handle: Handle) -> bool {
        self.counters.with(|counters| {
            let counter = &mut counters[index as usize];
            if counter.handle != handle || counter.destroyed {
                return false;
            }
            counter.count += 1;
            true
        })
    }

    /// Removes a reference.
    pub(crate) fn dec(&self, index: u32, handle: Handle) -> Release {
        self.counters.with(|counters| {
            let counter = &mut counters[index as usize];
            if counter.handle != handle || counter.destroyed || counter.count == 0 {
                if S::THREAD_SAFE {
                    return Release::Ignored;
                }
                panic!(
                    "double release of {:?} (tag {:?}): its reference count already reached zero",
                    handle, counter.tag
                );
            }
            counter.count -= 1;
            if counter.count == 0 {
                counter.destroyed = true;
                Release::Destroy
            } else {
                Release::Alive(counter.count)
            }
        })
    }

    /// Current count, zero for stale references.
    pub(crate) fn count(&self, index: u32, handle: Handle) -> u32 {
        self.counters.with(|counters| {
            let counter = &counters[index as usize];
            if counter.handle == handle {
                counter.count
            } else {
                0
            }
        })
    }

    /// Returns the slot to the free list once the resource is gone.
    pub(crate) fn recycle(&self, index: u32, handle: Handle) {
        let recycled = self.counters.with(|counters| {
            let counter = &mut counters[index as usize];
            if counter.handle != handle {
                return false;
            }
            *counter = Counter::default();
            true
        });
        if recycled {
            self.free.with(|free| free.push(index));
        }
    }
}

/// A destruction request posted by the release of the last reference to a thread-safe resource.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct DeferredDestroy {
    pub(crate) handle: Handle,
    pub(crate) tag: TypeTag,
    pub(crate) index: u32,
}

/// Reference to a resource whose counter belongs to the thread owning the `ResourceManager`.
///
/// This is a plain token: copying it does not add a reference. References are added and removed
/// with `ResourceManager::inc` and `ResourceManager::dec`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct LocalRef {
    pub(crate) handle: Handle,
    pub(crate) tag: TypeTag,
    pub(crate) index: u32,
}

/// Reference to a thread-safe resource (fences and timer queries).
///
/// Can be sent to and used from any thread. Cloning the token does not add a reference: use
/// [`inc`](SharedRef::inc) and [`dec`](SharedRef::dec).
#[derive(Clone)]
pub struct SharedRef {
    pub(crate) handle: Handle,
    pub(crate) tag: TypeTag,
    pub(crate) index: u32,
    pub(crate) pool: Arc<CounterPool<Shared>>,
    pub(crate) deferred: Sender<DeferredDestroy>,
}

impl SharedRef {
    pub fn id(&self) -> Handle {
        self.handle
    }

    pub fn type_tag(&self) -> TypeTag {
        self.tag
    }

    /// Adds a reference. No-op if the resource has already been released.
    pub fn inc(&self) {
        if !self.pool.inc(self.index, self.handle) {
            trace!(handle = ?self.handle, "inc on released shared resource ignored");
        }
    }

    /// Removes a reference. Releasing the last one schedules the destruction of the resource on
    /// the next `ResourceManager::gc`.
    pub fn dec(&self) {
        if let Release::Destroy = self.pool.dec(self.index, self.handle) {
            trace!(handle = ?self.handle, tag = ?self.tag, "last shared reference released");
            let request = DeferredDestroy {
                handle: self.handle,
                tag: self.tag,
                index: self.index,
            };
            if self.deferred.send(request).is_err() {
                warn!(handle = ?self.handle, tag = ?self.tag, "resource manager is gone, resource leaked");
            }
        }
    }

    /// Current number of references.
    pub fn count(&self) -> u32 {
        self.pool.count(self.index, self.handle)
    }
}

impl fmt::Debug for SharedRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SharedRef")
            .field("handle", &self.handle)
            .field("tag", &self.tag)
            .field("index", &self.index)
            .finish()
    }
}

/// A counted reference to a resource registered in a `ResourceManager`.
#[derive(Clone, Debug)]
pub enum ResourceRef {
    Local(LocalRef),
    Shared(SharedRef),
}

impl ResourceRef {
    /// The handle of the resource.
    pub fn id(&self) -> Handle {
        match self {
            ResourceRef::Local(r) => r.handle,
            ResourceRef::Shared(r) => r.handle,
        }
    }

    pub fn type_tag(&self) -> TypeTag {
        match self {
            ResourceRef::Local(r) => r.tag,
            ResourceRef::Shared(r) => r.tag,
        }
    }

    pub fn is_thread_safe(&self) -> bool {
        matches!(self, ResourceRef::Shared(_))
    }

    /// Returns the thread-safe token, if the resource is of a thread-safe kind.
    pub fn as_shared(&self) -> Option<&SharedRef> {
        match self {
            ResourceRef::Shared(r) => Some(r),
            ResourceRef::Local(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use slotmap::SlotMap;

    fn handles(n: usize) -> Vec<Handle> {
        let mut map = SlotMap::<Handle, ()>::with_key();
        (0..n).map(|_| map.insert(())).collect()
    }

    #[test]
    fn grows_by_half() {
        let pool = CounterPool::<Local>::with_capacity(4);
        let h = handles(7);
        let indices: Vec<u32> = h
            .iter()
            .map(|&h| pool.construct(h, TypeTag::VertexBuffer))
            .collect();
        // 4 -> 6 -> 9
        assert_eq!(pool.capacity(), 9);
        assert_eq!(indices, vec![0, 1, 2, 3, 4, 5, 6]);
        assert_eq!(pool.free_count(), 2);
        // indices handed out before growing still refer to the same counters
        assert_eq!(pool.count(0, h[0]), 1);
        assert!(pool.inc(0, h[0]));
        assert_eq!(pool.count(0, h[0]), 2);
    }

    #[test]
    fn recycled_slots_are_reused() {
        let pool = CounterPool::<Local>::with_capacity(2);
        let h = handles(3);
        let a = pool.construct(h[0], TypeTag::IndexBuffer);
        assert_eq!(pool.dec(a, h[0]), Release::Destroy);
        pool.recycle(a, h[0]);
        let b = pool.construct(h[1], TypeTag::IndexBuffer);
        assert_eq!(a, b);
        // the stale reference does not see the new occupant
        assert_eq!(pool.count(a, h[0]), 0);
        assert!(!pool.inc(a, h[0]));
        assert_eq!(pool.count(b, h[1]), 1);
    }

    #[test]
    #[should_panic(expected = "double release")]
    fn local_double_release_panics() {
        let pool = CounterPool::<Local>::with_capacity(1);
        let h = handles(1)[0];
        let index = pool.construct(h, TypeTag::BufferObject);
        assert_eq!(pool.dec(index, h), Release::Destroy);
        pool.dec(index, h);
    }

    #[test]
    fn shared_double_release_is_ignored() {
        let pool = CounterPool::<Shared>::with_capacity(1);
        let h = handles(1)[0];
        let index = pool.construct(h, TypeTag::Fence);
        assert_eq!(pool.dec(index, h), Release::Destroy);
        assert_eq!(pool.dec(index, h), Release::Ignored);
        assert!(!pool.inc(index, h));
        assert_eq!(pool.dec(index, h), Release::Ignored);
    }

    #[test]
    fn random_sequences_destroy_exactly_once() {
        let mut rng = rand::thread_rng();
        let pool = CounterPool::<Local>::with_capacity(8);
        for h in handles(64) {
            let index = pool.construct(h, TypeTag::VertexBuffer);
            let mut live = 1u32;
            let mut destroyed = 0;
            while live > 0 {
                if rng.gen_bool(0.55) {
                    assert!(pool.inc(index, h));
                    live += 1;
                } else {
                    match pool.dec(index, h) {
                        Release::Alive(count) => {
                            live -= 1;
                            assert_eq!(count, live);
                        }
                        Release::Destroy => {
                            live -= 1;
                            assert_eq!(live, 0);
                            destroyed += 1;
                        }
                        Release::Ignored => unreachable!(),
                    }
                }
                // bound the walk
                if live > 32 {
                    for _ in 0..live - 1 {
                        assert!(matches!(pool.dec(index, h), Release::Alive(_)));
                    }
                    live = 1;
                }
            }
            assert_eq!(destroyed, 1);
            assert!(!pool.inc(index, h));
            pool.recycle(index, h);
        }
    }

    #[test]
    fn concurrent_shared_releases_post_once() {
        let pool = Arc::new(CounterPool::<Shared>::with_capacity(4));
        let (sender, receiver) = crossbeam_channel::unbounded();
        let handle = handles(1)[0];
        let index = pool.construct(handle, TypeTag::TimerQuery);
        let r = SharedRef {
            handle,
            tag: TypeTag::TimerQuery,
            index,
            pool: pool.clone(),
            deferred: sender,
        };
        for _ in 0..63 {
            r.inc();
        }
        assert_eq!(r.count(), 64);

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let r = r.clone();
                std::thread::spawn(move || {
                    // every thread releases more than its share: extra releases are ignored
                    for _ in 0..10 {
                        r.dec();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(r.count(), 0);
        let posted: Vec<_> = receiver.try_iter().collect();
        assert_eq!(
            posted,
            vec![DeferredDestroy {
                handle,
                tag: TypeTag::TimerQuery,
                index
            }]
        );
    }
}
