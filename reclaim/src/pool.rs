//! Size-class buffer pool.
//!
//! Buffers are pooled per usage class. Released buffers go back to a free list ordered by
//! capacity, from which `acquire` picks the smallest buffer that is large enough. Free buffers that
//! stay unused for `EVICTION_WINDOW` maintenance ticks are given back to the device.
//!
//! The pool itself never sees releases directly: every buffer handed out is registered in the
//! `ResourceManager`, and the destruction of the resource returns the buffer to the pool. Buffers
//! only reach the resource manager's destruction path once nothing references them anymore,
//! including the command buffers that used them, so everything on the free lists is idle on the
//! device.
use crate::{
    device::{BufferCreateInfo, Device, DeviceBuffer, MemoryLocation},
    handle::TypeTag,
    manager::ResourceManager,
    ref_count::ResourceRef,
    serial::Tick,
    Error,
};
use ash::vk;
use std::{
    cell::RefCell,
    collections::BTreeMap,
    fmt,
    ptr::NonNull,
    rc::{Rc, Weak},
    sync::Arc,
};
use tracing::{debug, trace, trace_span};

/// Number of maintenance ticks a free buffer survives before being evicted.
pub const EVICTION_WINDOW: u64 = 3;

/// Role of a pooled buffer. Each class has its own free list.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum UsageClass {
    Vertex,
    Index,
    Uniform,
    Storage,
}

impl UsageClass {
    pub const ALL: [UsageClass; 4] = [
        UsageClass::Vertex,
        UsageClass::Index,
        UsageClass::Uniform,
        UsageClass::Storage,
    ];

    /// Maps vulkan buffer usage flags to a usage class.
    ///
    /// When the flags name several roles, vertex wins over index, index over uniform, and
    /// uniform over storage.
    pub fn from_buffer_usage(usage: vk::BufferUsageFlags) -> Result<UsageClass, Error> {
        if usage.contains(vk::BufferUsageFlags::VERTEX_BUFFER) {
            Ok(UsageClass::Vertex)
        } else if usage.contains(vk::BufferUsageFlags::INDEX_BUFFER) {
            Ok(UsageClass::Index)
        } else if usage.contains(vk::BufferUsageFlags::UNIFORM_BUFFER) {
            Ok(UsageClass::Uniform)
        } else if usage.contains(vk::BufferUsageFlags::STORAGE_BUFFER) {
            Ok(UsageClass::Storage)
        } else {
            Err(Error::InvalidUsage)
        }
    }

    /// Usage flags of buffers allocated for this class.
    pub fn buffer_usage(self) -> vk::BufferUsageFlags {
        let class_usage = match self {
            UsageClass::Vertex => vk::BufferUsageFlags::VERTEX_BUFFER,
            UsageClass::Index => vk::BufferUsageFlags::INDEX_BUFFER,
            UsageClass::Uniform => vk::BufferUsageFlags::UNIFORM_BUFFER,
            UsageClass::Storage => vk::BufferUsageFlags::STORAGE_BUFFER,
        };
        class_usage | vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST
    }

    /// Tag of the resources wrapping buffers of this class.
    pub fn type_tag(self) -> TypeTag {
        match self {
            UsageClass::Vertex => TypeTag::VertexBuffer,
            UsageClass::Index => TypeTag::IndexBuffer,
            UsageClass::Uniform | UsageClass::Storage => TypeTag::BufferObject,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

struct FreeEntry {
    buffer: DeviceBuffer,
    last_access: Tick,
}

/// Free lists are keyed by (capacity, insertion sequence) so that buffers of equal capacity
/// can coexist.
struct PoolState {
    free: [BTreeMap<(u64, u64), FreeEntry>; 4],
    tick: Tick,
    sequence: u64,
    in_use: usize,
}

impl PoolState {
    fn recycle(&mut self, class: UsageClass, buffer: DeviceBuffer) {
        self.sequence += 1;
        self.in_use -= 1;
        trace!(
            ?class,
            byte_size = buffer.byte_size,
            tick = self.tick.0,
            "buffer returned to pool"
        );
        self.free[class.index()].insert(
            (buffer.byte_size, self.sequence),
            FreeEntry {
                buffer,
                last_access: self.tick,
            },
        );
    }
}

/// A buffer allocated from a [`BufferPool`].
///
/// Dropping it returns the buffer to the pool's free list, or frees it if the pool is gone.
pub struct PooledBuffer {
    buffer: Option<DeviceBuffer>,
    class: UsageClass,
    device: Arc<dyn Device>,
    pool: Weak<RefCell<PoolState>>,
}

impl PooledBuffer {
    fn buffer(&self) -> &DeviceBuffer {
        // only `release` takes the buffer out, and it consumes `self`
        self.buffer.as_ref().expect("pooled buffer already released")
    }

    pub fn handle(&self) -> vk::Buffer {
        self.buffer().handle
    }

    /// Capacity of the buffer. At least the size requested when it was acquired.
    pub fn byte_size(&self) -> u64 {
        self.buffer().byte_size
    }

    pub fn usage_class(&self) -> UsageClass {
        self.class
    }

    pub fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        self.buffer().mapped_ptr
    }

    /// Gives the buffer back to its pool.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        let buffer = match self.buffer.take() {
            Some(buffer) => buffer,
            None => return,
        };
        match self.pool.upgrade() {
            Some(state) => state.borrow_mut().recycle(self.class, buffer),
            None => {
                trace!(class = ?self.class, "buffer released after its pool: freeing");
                self.device.destroy_buffer(buffer)
            }
        }
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("buffer", &self.buffer)
            .field("class", &self.class)
            .finish()
    }
}

/// A cache of device buffers, one free list per usage class.
///
/// Not `Send`: the pool and the buffers it hands out must stay on the thread that owns the
/// `ResourceManager` they are registered in.
pub struct BufferPool {
    device: Arc<dyn Device>,
    state: Rc<RefCell<PoolState>>,
}

impl BufferPool {
    pub fn new(device: Arc<dyn Device>) -> BufferPool {
        BufferPool {
            device,
            state: Rc::new(RefCell::new(PoolState {
                free: Default::default(),
                tick: Tick::default(),
                sequence: 0,
                in_use: 0,
            })),
        }
    }

    /// Returns a buffer of the given class with a capacity of at least `byte_size` bytes, reusing
    /// a free buffer if possible, and registers it in `resources`.
    ///
    /// # Panics
    ///
    /// If `byte_size` is zero or the device fails to allocate the buffer.
    pub fn acquire(
        &self,
        resources: &mut ResourceManager,
        class: UsageClass,
        byte_size: u64,
    ) -> ResourceRef {
        let buffer = self.try_acquire_buffer(class, byte_size).unwrap_or_else(|err| {
            panic!(
                "failed to allocate a {:?} buffer of {} bytes: {}",
                class, byte_size, err
            )
        });
        resources.create(buffer)
    }

    /// Same as `acquire`, with the class derived from vulkan usage flags.
    ///
    /// # Panics
    ///
    /// If the flags map to no usage class (see [`UsageClass::from_buffer_usage`]).
    pub fn acquire_with_usage(
        &self,
        resources: &mut ResourceManager,
        usage: vk::BufferUsageFlags,
        byte_size: u64,
    ) -> ResourceRef {
        let class = match UsageClass::from_buffer_usage(usage) {
            Ok(class) => class,
            Err(err) => panic!("cannot pool a buffer with usage {:?}: {}", usage, err),
        };
        self.acquire(resources, class, byte_size)
    }

    /// Returns a buffer that is not registered anywhere.
    pub fn try_acquire_buffer(
        &self,
        class: UsageClass,
        byte_size: u64,
    ) -> Result<PooledBuffer, Error> {
        assert!(byte_size > 0, "cannot allocate an empty buffer");

        {
            let mut state = self.state.borrow_mut();
            let list = &mut state.free[class.index()];
            let best_fit = list.range((byte_size, 0)..).next().map(|(key, _)| *key);
            if let Some(entry) = best_fit.and_then(|key| list.remove(&key)) {
                state.in_use += 1;
                trace!(
                    ?class,
                    byte_size,
                    capacity = entry.buffer.byte_size,
                    "pooled buffer reused"
                );
                return Ok(self.wrap(class, entry.buffer));
            }
        }

        let unified_memory = self.device.properties().unified_memory;
        let location = if class == UsageClass::Uniform && unified_memory {
            MemoryLocation::CpuToGpu
        } else {
            MemoryLocation::GpuOnly
        };
        let buffer = self.device.create_buffer(&BufferCreateInfo {
            usage: class.buffer_usage(),
            byte_size,
            location,
        })?;
        self.state.borrow_mut().in_use += 1;
        debug!(?class, byte_size, ?location, "allocated pooled buffer");
        Ok(self.wrap(class, buffer))
    }

    fn wrap(&self, class: UsageClass, buffer: DeviceBuffer) -> PooledBuffer {
        PooledBuffer {
            buffer: Some(buffer),
            class,
            device: self.device.clone(),
            pool: Rc::downgrade(&self.state),
        }
    }

    /// Advances the maintenance tick and frees the buffers that have been idle for
    /// `EVICTION_WINDOW` ticks. Returns the number of buffers freed.
    pub fn gc(&self) -> usize {
        let _span = trace_span!("buffer_pool_gc").entered();

        let mut evicted = Vec::new();
        {
            let mut state = self.state.borrow_mut();
            state.tick = state.tick.next();
            let tick = state.tick;
            if tick.0 < EVICTION_WINDOW {
                return 0;
            }
            for list in state.free.iter_mut() {
                let stale: Vec<_> = list
                    .iter()
                    .filter(|(_, entry)| tick.elapsed_since(entry.last_access) >= EVICTION_WINDOW)
                    .map(|(key, _)| *key)
                    .collect();
                for key in stale {
                    if let Some(entry) = list.remove(&key) {
                        evicted.push(entry.buffer);
                    }
                }
            }
        }

        let count = evicted.len();
        if count > 0 {
            debug!(count, "evicting idle pooled buffers");
        }
        for buffer in evicted {
            self.device.destroy_buffer(buffer);
        }
        count
    }

    /// Frees every buffer on the free lists. Buffers still in use are freed when released.
    pub fn terminate(&self) {
        let freed: Vec<_> = {
            let mut state = self.state.borrow_mut();
            state
                .free
                .iter_mut()
                .flat_map(|list| std::mem::take(list).into_values())
                .collect()
        };
        if !freed.is_empty() {
            debug!(count = freed.len(), "freeing pooled buffers");
        }
        for entry in freed {
            self.device.destroy_buffer(entry.buffer);
        }
    }

    /// Number of free buffers of the given class.
    pub fn free_count(&self, class: UsageClass) -> usize {
        self.state.borrow().free[class.index()].len()
    }

    /// Total capacity of the free buffers, all classes included.
    pub fn free_bytes(&self) -> u64 {
        self.state
            .borrow()
            .free
            .iter()
            .flat_map(|list| list.keys())
            .map(|(capacity, _)| *capacity)
            .sum()
    }

    /// Number of buffers handed out and not yet returned.
    pub fn in_use_count(&self) -> usize {
        self.state.borrow().in_use
    }

    /// Current maintenance tick.
    pub fn tick(&self) -> Tick {
        self.state.borrow().tick
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::NullDevice;

    fn pool() -> (Arc<NullDevice>, BufferPool) {
        let device = Arc::new(NullDevice::new());
        let pool = BufferPool::new(device.clone());
        (device, pool)
    }

    #[test]
    fn usage_flags_to_class() {
        assert_eq!(
            UsageClass::from_buffer_usage(
                vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
            )
            .unwrap(),
            UsageClass::Uniform
        );
        assert_eq!(
            UsageClass::from_buffer_usage(vk::BufferUsageFlags::STORAGE_BUFFER).unwrap(),
            UsageClass::Storage
        );
        assert!(matches!(
            UsageClass::from_buffer_usage(vk::BufferUsageFlags::TRANSFER_SRC),
            Err(Error::InvalidUsage)
        ));
        assert!(UsageClass::Index
            .buffer_usage()
            .contains(vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST));
    }

    #[test]
    fn best_fit_picks_smallest_sufficient_buffer() {
        let (device, pool) = pool();
        let sizes = [256, 64, 1024, 128];
        let buffers: Vec<_> = sizes
            .iter()
            .map(|&size| pool.try_acquire_buffer(UsageClass::Vertex, size).unwrap())
            .collect();
        let handles: Vec<_> = buffers.iter().map(|b| b.handle()).collect();
        drop(buffers);
        assert_eq!(pool.free_count(UsageClass::Vertex), 4);
        assert_eq!(pool.free_bytes(), 256 + 64 + 1024 + 128);

        let b = pool.try_acquire_buffer(UsageClass::Vertex, 100).unwrap();
        assert_eq!(b.handle(), handles[3]);
        assert_eq!(b.byte_size(), 128);
        let c = pool.try_acquire_buffer(UsageClass::Vertex, 300).unwrap();
        assert_eq!(c.handle(), handles[2]);
        // nothing left that is large enough
        let d = pool.try_acquire_buffer(UsageClass::Vertex, 2048).unwrap();
        assert!(!handles.contains(&d.handle()));
        assert_eq!(device.buffers_created(), 5);
    }

    #[test]
    fn classes_do_not_share_free_lists() {
        let (device, pool) = pool();
        drop(pool.try_acquire_buffer(UsageClass::Index, 64).unwrap());
        let uniform = pool.try_acquire_buffer(UsageClass::Uniform, 64).unwrap();
        assert_eq!(uniform.usage_class(), UsageClass::Uniform);
        assert_eq!(device.buffers_created(), 2);
        assert_eq!(pool.free_count(UsageClass::Index), 1);
    }

    #[test]
    fn nothing_is_evicted_during_startup() {
        let (device, pool) = pool();
        drop(pool.try_acquire_buffer(UsageClass::Storage, 64).unwrap());
        assert_eq!(pool.gc(), 0);
        assert_eq!(pool.gc(), 0);
        assert_eq!(pool.tick(), Tick(2));
        assert_eq!(pool.free_count(UsageClass::Storage), 1);
        assert_eq!(pool.gc(), 1);
        assert_eq!(device.live_buffers(), 0);
    }

    #[test]
    fn reuse_refreshes_last_access() {
        let (_device, pool) = pool();
        drop(pool.try_acquire_buffer(UsageClass::Vertex, 64).unwrap());
        pool.gc();
        pool.gc();
        // acquired and released again at tick 2
        drop(pool.try_acquire_buffer(UsageClass::Vertex, 64).unwrap());
        pool.gc();
        pool.gc();
        assert_eq!(pool.free_count(UsageClass::Vertex), 1);
        pool.gc();
        assert_eq!(pool.free_count(UsageClass::Vertex), 0);
    }

    #[test]
    fn buffers_outliving_the_pool_are_freed() {
        let (device, pool) = pool();
        let buffer = pool.try_acquire_buffer(UsageClass::Uniform, 64).unwrap();
        drop(pool.try_acquire_buffer(UsageClass::Uniform, 32).unwrap());
        drop(pool);
        assert_eq!(device.live_buffers(), 1);
        drop(buffer);
        assert_eq!(device.live_buffers(), 0);
    }

    #[test]
    fn failed_allocation_is_reported() {
        let (device, pool) = pool();
        device.fail_next_buffer_allocation(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        assert!(matches!(
            pool.try_acquire_buffer(UsageClass::Vertex, 64),
            Err(Error::Device(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY))
        ));
        assert_eq!(pool.in_use_count(), 0);
    }
}
