//! Registry of reference-counted resources.
use crate::{
    fence::Fence,
    handle::{Handle, TypeTag},
    pool::PooledBuffer,
    query::TimerQuery,
    ref_count::{
        CounterPool, DeferredDestroy, Local, LocalRef, Release, ResourceRef, Shared, SharedRef,
    },
    Error,
};
use crossbeam_channel::{Receiver, Sender};
use slotmap::{SecondaryMap, SlotMap};
use std::sync::Arc;
use tracing::{debug, trace, trace_span, warn};

/// Parameters of a [`ResourceManager`].
#[derive(Copy, Clone, Debug)]
pub struct ResourceManagerCreateInfo {
    /// Initial number of slots of each counter pool.
    pub capacity: usize,
    /// Enables debug names (`associate_tag`).
    pub debug_mode: bool,
}

impl Default for ResourceManagerCreateInfo {
    fn default() -> Self {
        ResourceManagerCreateInfo {
            capacity: 1024,
            debug_mode: cfg!(debug_assertions),
        }
    }
}

/// A resource object, as stored in the registry.
#[derive(Debug)]
pub enum ResourceObject {
    /// Uniform or storage buffer.
    BufferObject(PooledBuffer),
    IndexBuffer(PooledBuffer),
    VertexBuffer(PooledBuffer),
    TimerQuery(TimerQuery),
    Fence(Fence),
}

impl ResourceObject {
    pub fn type_tag(&self) -> TypeTag {
        match self {
            ResourceObject::BufferObject(_) => TypeTag::BufferObject,
            ResourceObject::IndexBuffer(_) => TypeTag::IndexBuffer,
            ResourceObject::VertexBuffer(_) => TypeTag::VertexBuffer,
            ResourceObject::TimerQuery(_) => TypeTag::TimerQuery,
            ResourceObject::Fence(_) => TypeTag::Fence,
        }
    }
}

/// Types that can be registered in a [`ResourceManager`].
pub trait Resource: Sized {
    fn type_tag(&self) -> TypeTag;
    fn into_object(self) -> ResourceObject;
    fn from_object(object: &ResourceObject) -> Option<&Self>;
    fn from_object_mut(object: &mut ResourceObject) -> Option<&mut Self>;
}

impl Resource for PooledBuffer {
    fn type_tag(&self) -> TypeTag {
        self.usage_class().type_tag()
    }

    fn into_object(self) -> ResourceObject {
        match self.type_tag() {
            TypeTag::VertexBuffer => ResourceObject::VertexBuffer(self),
            TypeTag::IndexBuffer => ResourceObject::IndexBuffer(self),
            _ => ResourceObject::BufferObject(self),
        }
    }

    fn from_object(object: &ResourceObject) -> Option<&Self> {
        match object {
            ResourceObject::BufferObject(buffer)
            | ResourceObject::IndexBuffer(buffer)
            | ResourceObject::VertexBuffer(buffer) => Some(buffer),
            _ => None,
        }
    }

    fn from_object_mut(object: &mut ResourceObject) -> Option<&mut Self> {
        match object {
            ResourceObject::BufferObject(buffer)
            | ResourceObject::IndexBuffer(buffer)
            | ResourceObject::VertexBuffer(buffer) => Some(buffer),
            _ => None,
        }
    }
}

impl Resource for TimerQuery {
    fn type_tag(&self) -> TypeTag {
        TypeTag::TimerQuery
    }

    fn into_object(self) -> ResourceObject {
        ResourceObject::TimerQuery(self)
    }

    fn from_object(object: &ResourceObject) -> Option<&Self> {
        match object {
            ResourceObject::TimerQuery(query) => Some(query),
            _ => None,
        }
    }

    fn from_object_mut(object: &mut ResourceObject) -> Option<&mut Self> {
        match object {
            ResourceObject::TimerQuery(query) => Some(query),
            _ => None,
        }
    }
}

impl Resource for Fence {
    fn type_tag(&self) -> TypeTag {
        TypeTag::Fence
    }

    fn into_object(self) -> ResourceObject {
        ResourceObject::Fence(self)
    }

    fn from_object(object: &ResourceObject) -> Option<&Self> {
        match object {
            ResourceObject::Fence(fence) => Some(fence),
            _ => None,
        }
    }

    fn from_object_mut(object: &mut ResourceObject) -> Option<&mut Self> {
        match object {
            ResourceObject::Fence(fence) => Some(fence),
            _ => None,
        }
    }
}

/// Destroys a resource object. New resource kinds are registered here.
fn destroy_object(object: ResourceObject) {
    match object {
        ResourceObject::BufferObject(buffer)
        | ResourceObject::IndexBuffer(buffer)
        | ResourceObject::VertexBuffer(buffer) => buffer.release(),
        ResourceObject::TimerQuery(query) => {
            query.clear();
        }
        // other clones of the fence stay usable
        ResourceObject::Fence(fence) => drop(fence),
    }
}

#[derive(Copy, Clone, Debug)]
enum CounterSlot {
    Local(u32),
    Shared(u32),
}

struct Slot {
    object: Option<ResourceObject>,
    counter: Option<CounterSlot>,
}

/// Owns the resources and their reference counters.
///
/// References to thread-safe resources (`SharedRef`) can be released from any thread: releasing
/// the last one queues the resource for destruction, and the queue is drained by [`gc`], which
/// must be called regularly by the thread that owns the manager. The manager is neither `Send`
/// nor `Sync`, so destruction always happens on that thread.
///
/// [`gc`]: ResourceManager::gc
pub struct ResourceManager {
    objects: SlotMap<Handle, Slot>,
    local_counters: CounterPool<Local>,
    shared_counters: Arc<CounterPool<Shared>>,
    deferred_sender: Sender<DeferredDestroy>,
    deferred_receiver: Receiver<DeferredDestroy>,
    debug_names: SecondaryMap<Handle, String>,
    debug_mode: bool,
    terminated: bool,
}

impl ResourceManager {
    pub fn new(create_info: &ResourceManagerCreateInfo) -> ResourceManager {
        let (deferred_sender, deferred_receiver) = crossbeam_channel::unbounded();
        debug!(
            capacity = create_info.capacity,
            debug_mode = create_info.debug_mode,
            "creating resource manager"
        );
        ResourceManager {
            objects: SlotMap::with_capacity_and_key(create_info.capacity),
            local_counters: CounterPool::with_capacity(create_info.capacity),
            shared_counters: Arc::new(CounterPool::with_capacity(create_info.capacity)),
            deferred_sender,
            deferred_receiver,
            debug_names: SecondaryMap::new(),
            debug_mode: create_info.debug_mode,
            terminated: false,
        }
    }

    /// Reserves a handle. The resource is constructed later with [`construct`].
    ///
    /// [`construct`]: ResourceManager::construct
    pub fn alloc_handle(&mut self) -> Handle {
        self.objects.insert(Slot {
            object: None,
            counter: None,
        })
    }

    /// Places `value` behind a handle returned by `alloc_handle`, with a reference count of 1.
    ///
    /// # Panics
    ///
    /// If the handle is invalid or already holds a resource.
    pub fn construct<T: Resource>(&mut self, handle: Handle, value: T) -> ResourceRef {
        let tag = value.type_tag();
        let slot = self
            .objects
            .get_mut(handle)
            .expect("construct: invalid handle");
        assert!(
            slot.object.is_none(),
            "construct: handle {:?} already holds a resource",
            handle
        );

        let resource = if tag.is_thread_safe() {
            let index = self.shared_counters.construct(handle, tag);
            slot.counter = Some(CounterSlot::Shared(index));
            ResourceRef::Shared(SharedRef {
                handle,
                tag,
                index,
                pool: self.shared_counters.clone(),
                deferred: self.deferred_sender.clone(),
            })
        } else {
            let index = self.local_counters.construct(handle, tag);
            slot.counter = Some(CounterSlot::Local(index));
            ResourceRef::Local(LocalRef { handle, tag, index })
        };
        slot.object = Some(value.into_object());
        trace!(?handle, ?tag, "resource constructed");
        resource
    }

    /// `alloc_handle` followed by `construct`.
    pub fn create<T: Resource>(&mut self, value: T) -> ResourceRef {
        let handle = self.alloc_handle();
        self.construct(handle, value)
    }

    /// Returns the resource behind `handle`, if it exists and is a `T`.
    pub fn handle_cast<T: Resource>(&self, handle: Handle) -> Option<&T> {
        self.objects
            .get(handle)
            .and_then(|slot| slot.object.as_ref())
            .and_then(T::from_object)
    }

    pub fn handle_cast_mut<T: Resource>(&mut self, handle: Handle) -> Option<&mut T> {
        self.objects
            .get_mut(handle)
            .and_then(|slot| slot.object.as_mut())
            .and_then(T::from_object_mut)
    }

    /// Destroys the resource immediately, whatever its reference count.
    ///
    /// Outstanding references become stale: using them has no effect (`inc`, shared `dec`) or
    /// panics (local `dec`).
    ///
    /// # Panics
    ///
    /// If the handle does not refer to a `T`.
    pub fn destruct<T: Resource>(&mut self, handle: Handle) {
        assert!(
            self.handle_cast::<T>(handle).is_some(),
            "destruct: {:?} is not a live resource of the expected type",
            handle
        );
        self.destroy(handle);
    }

    /// Adds a reference to the resource. No-op if it has already been destroyed.
    pub fn inc(&self, resource: &ResourceRef) {
        match resource {
            ResourceRef::Local(r) => {
                if !self.local_counters.inc(r.index, r.handle) {
                    warn!(handle = ?r.handle, tag = ?r.tag, "inc on a destroyed resource ignored");
                }
            }
            ResourceRef::Shared(r) => r.inc(),
        }
    }

    /// Removes a reference to the resource.
    ///
    /// Releasing the last reference to a resource destroys it immediately, or on the next `gc` for
    /// thread-safe resources.
    ///
    /// # Panics
    ///
    /// On the release of a reference to a non thread-safe resource that was already destroyed.
    pub fn dec(&mut self, resource: &ResourceRef) {
        match resource {
            ResourceRef::Local(r) => {
                if let Release::Destroy = self.local_counters.dec(r.index, r.handle) {
                    self.destroy(r.handle);
                }
            }
            ResourceRef::Shared(r) => r.dec(),
        }
    }

    /// Current reference count, zero if the resource is gone.
    pub fn count(&self, resource: &ResourceRef) -> u32 {
        match resource {
            ResourceRef::Local(r) => self.local_counters.count(r.index, r.handle),
            ResourceRef::Shared(r) => r.count(),
        }
    }

    /// Destroys the thread-safe resources whose last reference has been released. Returns the
    /// number of resources destroyed.
    pub fn gc(&mut self) -> usize {
        let _span = trace_span!("resource_gc").entered();
        let pending: Vec<_> = self.deferred_receiver.try_iter().collect();
        for request in pending.iter() {
            trace!(handle = ?request.handle, tag = ?request.tag, "deferred destruction");
            self.destroy(request.handle);
        }
        pending.len()
    }

    /// Number of destructions waiting for the next `gc`.
    pub fn pending_destructions(&self) -> usize {
        self.deferred_receiver.len()
    }

    /// Attaches a name to a resource, for logging. Ignored outside of debug mode.
    pub fn associate_tag(&mut self, handle: Handle, name: impl Into<String>) {
        if self.debug_mode && self.objects.contains_key(handle) {
            self.debug_names.insert(handle, name.into());
        }
    }

    pub fn debug_name(&self, handle: Handle) -> Option<&str> {
        self.debug_names.get(handle).map(String::as_str)
    }

    /// Number of constructed resources.
    pub fn live_count(&self) -> usize {
        self.objects
            .values()
            .filter(|slot| slot.object.is_some())
            .count()
    }

    fn destroy(&mut self, handle: Handle) {
        let slot = match self.objects.remove(handle) {
            Some(slot) => slot,
            None => {
                warn!(?handle, "destroying a resource that does not exist");
                return;
            }
        };
        match slot.counter {
            Some(CounterSlot::Local(index)) => self.local_counters.recycle(index, handle),
            Some(CounterSlot::Shared(index)) => self.shared_counters.recycle(index, handle),
            None => {}
        }
        let name = self.debug_names.remove(handle);
        if let Some(object) = slot.object {
            trace!(?handle, tag = ?object.type_tag(), name = ?name, "destroying resource");
            destroy_object(object);
        }
    }

    fn destroy_remaining(&mut self) {
        let remaining: Vec<Handle> = self.objects.keys().collect();
        let live = self.live_count();
        if live > 0 {
            warn!(live, "resources still alive at termination");
        }
        for handle in remaining {
            self.destroy(handle);
        }
    }

    /// Shuts the manager down.
    ///
    /// Fails with `Error::PendingDestructions` if destructions are still queued: call `gc`
    /// first. Resources still alive are destroyed.
    pub fn try_terminate(&mut self) -> Result<(), Error> {
        let pending = self.pending_destructions();
        if pending > 0 {
            return Err(Error::PendingDestructions(pending));
        }
        self.destroy_remaining();
        self.terminated = true;
        Ok(())
    }

    /// Shuts the manager down.
    ///
    /// # Panics
    ///
    /// If destructions are still queued.
    pub fn terminate(mut self) {
        if let Err(err) = self.try_terminate() {
            panic!("resource manager terminated with work left: {}", err);
        }
    }
}

impl Drop for ResourceManager {
    fn drop(&mut self) {
        if self.terminated || std::thread::panicking() {
            return;
        }
        self.gc();
        self.destroy_remaining();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::NullDevice,
        pool::{BufferPool, UsageClass},
        query::QueryManager,
    };

    fn manager() -> ResourceManager {
        ResourceManager::new(&ResourceManagerCreateInfo {
            capacity: 4,
            debug_mode: true,
        })
    }

    #[test]
    fn local_release_destroys_inline() {
        let device = Arc::new(NullDevice::new());
        let pool = BufferPool::new(device.clone());
        let mut resources = manager();
        let buffer = pool.acquire(&mut resources, UsageClass::Index, 64);
        assert_eq!(buffer.type_tag(), TypeTag::IndexBuffer);
        assert!(!buffer.is_thread_safe());
        resources.inc(&buffer);
        assert_eq!(resources.count(&buffer), 2);
        resources.dec(&buffer);
        assert_eq!(pool.free_count(UsageClass::Index), 0);
        resources.dec(&buffer);
        assert_eq!(resources.live_count(), 0);
        assert_eq!(pool.free_count(UsageClass::Index), 1);
        assert_eq!(resources.count(&buffer), 0);
        // inc on a destroyed resource is ignored
        resources.inc(&buffer);
        assert_eq!(resources.count(&buffer), 0);
    }

    #[test]
    fn handles_are_not_reused() {
        let mut resources = manager();
        let a = resources.create(Fence::new());
        let a_id = a.id();
        a.as_shared().unwrap().dec();
        resources.gc();
        let b = resources.create(Fence::new());
        assert_ne!(a_id, b.id());
        assert!(resources.handle_cast::<Fence>(a_id).is_none());
        assert!(resources.handle_cast::<Fence>(b.id()).is_some());
        resources.dec(&b);
        resources.gc();
        resources.terminate();
    }

    #[test]
    fn handle_cast_checks_the_type() {
        let device = Arc::new(NullDevice::new());
        let queries = QueryManager::new(device, 4).unwrap();
        let mut resources = manager();
        let query = resources.create(queries.get_next_query().unwrap());
        assert!(resources.handle_cast::<TimerQuery>(query.id()).is_some());
        assert!(resources.handle_cast::<Fence>(query.id()).is_none());
        assert!(resources.handle_cast::<PooledBuffer>(query.id()).is_none());
        resources.destruct::<TimerQuery>(query.id());
        assert_eq!(queries.allocated(), 0);
        // stale shared references are harmless
        resources.dec(&query);
        assert_eq!(resources.pending_destructions(), 0);
    }

    #[test]
    #[should_panic(expected = "already holds a resource")]
    fn construct_twice_panics() {
        let mut resources = manager();
        let handle = resources.alloc_handle();
        resources.construct(handle, Fence::new());
        resources.construct(handle, Fence::new());
    }

    #[test]
    fn debug_names() {
        let mut resources = manager();
        let fence = resources.create(Fence::new());
        resources.associate_tag(fence.id(), "frame fence");
        assert_eq!(resources.debug_name(fence.id()), Some("frame fence"));

        let mut release = ResourceManager::new(&ResourceManagerCreateInfo {
            capacity: 4,
            debug_mode: false,
        });
        let other = release.create(Fence::new());
        release.associate_tag(other.id(), "ignored");
        assert_eq!(release.debug_name(other.id()), None);
    }

    #[test]
    fn counters_grow_past_capacity() {
        let mut resources = manager();
        let fences: Vec<_> = (0..10).map(|_| resources.create(Fence::new())).collect();
        assert_eq!(resources.live_count(), 10);
        for fence in &fences {
            resources.dec(fence);
        }
        assert_eq!(resources.pending_destructions(), 10);
        assert_eq!(resources.gc(), 10);
        assert_eq!(resources.live_count(), 0);
        resources.terminate();
    }
}
