use crate::{
    command::{CommandBuffer, CommandBufferManager},
    device::Device,
    fence::Fence,
    manager::{ResourceManager, ResourceManagerCreateInfo},
    pool::{BufferPool, PooledBuffer, UsageClass},
    query::{QueryManager, TimerQuery},
    ref_count::ResourceRef,
    serial::SubmissionSerial,
    Error,
};
use ash::vk;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, trace_span};

/// Parameters of a [`Context`].
///
/// Can be loaded from JSON; missing fields take their default value.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContextCreateInfo {
    /// Initial capacity of the resource counter pools.
    pub resource_capacity: usize,
    /// Enables resource debug names.
    pub debug_mode: bool,
    /// Number of command buffers in the ring.
    pub command_buffer_count: usize,
    /// Number of timer queries.
    pub timer_query_count: u32,
}

impl Default for ContextCreateInfo {
    fn default() -> Self {
        ContextCreateInfo {
            resource_capacity: 1024,
            debug_mode: cfg!(debug_assertions),
            command_buffer_count: 10,
            timer_query_count: 64,
        }
    }
}

impl ContextCreateInfo {
    /// Parses and validates a JSON configuration.
    pub fn from_json(json: &str) -> Result<ContextCreateInfo, Error> {
        let create_info: ContextCreateInfo = serde_json::from_str(json)?;
        create_info.validate()?;
        Ok(create_info)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.resource_capacity == 0 {
            return Err(Error::Config("resource_capacity must be non-zero".to_string()));
        }
        if self.command_buffer_count == 0 {
            return Err(Error::Config(
                "command_buffer_count must be non-zero".to_string(),
            ));
        }
        if self.timer_query_count == 0 {
            return Err(Error::Config("timer_query_count must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// Resource lifecycle of a device: resources, buffer pool, command buffers and timer queries.
///
/// `gc` must be called once per frame, on the thread that owns the context.
pub struct Context {
    device: Arc<dyn Device>,
    // drop order: wait for the device before destroying resources
    commands: CommandBufferManager,
    resources: ResourceManager,
    buffers: BufferPool,
    queries: Arc<QueryManager>,
}

impl Context {
    pub fn new(device: Arc<dyn Device>, create_info: &ContextCreateInfo) -> Result<Context, Error> {
        create_info.validate()?;
        let commands = CommandBufferManager::new(device.clone(), create_info.command_buffer_count)?;
        let queries = Arc::new(QueryManager::new(
            device.clone(),
            create_info.timer_query_count,
        )?);
        let resources = ResourceManager::new(&ResourceManagerCreateInfo {
            capacity: create_info.resource_capacity,
            debug_mode: create_info.debug_mode,
        });
        let buffers = BufferPool::new(device.clone());
        debug!(?create_info, "context created");
        Ok(Context {
            device,
            commands,
            resources,
            buffers,
            queries,
        })
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    pub fn resources(&self) -> &ResourceManager {
        &self.resources
    }

    pub fn resources_mut(&mut self) -> &mut ResourceManager {
        &mut self.resources
    }

    pub fn buffer_pool(&self) -> &BufferPool {
        &self.buffers
    }

    /// Acquires a pooled buffer. The returned reference must be given back with `release`.
    pub fn acquire_buffer(&mut self, class: UsageClass, byte_size: u64) -> ResourceRef {
        self.buffers.acquire(&mut self.resources, class, byte_size)
    }

    pub fn buffer(&self, resource: &ResourceRef) -> Option<&PooledBuffer> {
        self.resources.handle_cast(resource.id())
    }

    pub fn retain(&self, resource: &ResourceRef) {
        self.resources.inc(resource);
    }

    pub fn release(&mut self, resource: &ResourceRef) {
        self.resources.dec(resource);
    }

    /// Keeps the resource alive until the recording command buffer has finished executing.
    pub fn track(&mut self, resource: &ResourceRef) {
        self.resources.inc(resource);
        self.commands.get().retain(resource.clone());
    }

    /// The recording command buffer, begun if necessary.
    pub fn command_buffer(&mut self) -> &mut CommandBuffer {
        self.commands.get()
    }

    pub fn commands(&mut self) -> &mut CommandBufferManager {
        &mut self.commands
    }

    pub fn flush(&mut self) -> Option<SubmissionSerial> {
        self.commands.flush()
    }

    pub fn inject_dependency(&mut self, semaphore: vk::Semaphore) {
        self.commands.inject_dependency(semaphore);
    }

    pub fn acquire_finished_signal(&mut self) -> Option<vk::Semaphore> {
        self.commands.acquire_finished_signal()
    }

    /// Creates a fence signaled when the recording command buffer completes.
    pub fn create_fence(&mut self) -> ResourceRef {
        let fence = Fence::new();
        fence.set_fence(self.commands.get().fence().clone());
        self.resources.create(fence)
    }

    pub fn fence(&self, resource: &ResourceRef) -> Option<&Fence> {
        self.resources.handle_cast(resource.id())
    }

    /// Allocates a timer query. Returns `None` if all of them are in use.
    pub fn create_timer_query(&mut self) -> Option<ResourceRef> {
        let query = self.queries.get_next_query()?;
        Some(self.resources.create(query))
    }

    pub fn timer_query(&self, resource: &ResourceRef) -> Option<&TimerQuery> {
        self.resources.handle_cast(resource.id())
    }

    pub fn queries(&self) -> &Arc<QueryManager> {
        &self.queries
    }

    /// Per-frame maintenance: reclaims completed command buffers, releases the resources they
    /// held, runs deferred destructions, then advances the buffer pool.
    pub fn gc(&mut self) {
        let _span = trace_span!("context_gc").entered();
        self.commands.gc();
        for resource in self.commands.take_retired() {
            self.resources.dec(&resource);
        }
        self.resources.gc();
        self.buffers.gc();
    }

    /// Waits for the device, releases everything and shuts down.
    pub fn terminate(mut self) {
        let _span = trace_span!("context_terminate").entered();
        for resource in self.commands.terminate() {
            self.resources.dec(&resource);
        }
        self.resources.gc();
        if let Err(err) = self.resources.try_terminate() {
            panic!("resource manager terminated with work left: {}", err);
        }
        self.buffers.terminate();
        debug!("context terminated");
    }
}
