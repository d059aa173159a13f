//! The device boundary.
//!
//! Everything in this crate talks to the GPU through the [`Device`] trait. It is deliberately
//! small: typed buffers, fences, binary semaphores, primary command buffers, one queue, and
//! timestamp query pools. Two implementations are provided:
//!
//! * [`VulkanDevice`], on top of `ash` and `gpu-allocator`;
//! * [`NullDevice`], a headless device that executes submissions in-process, with controllable
//!   completion. It is used by the tests and for headless runs.
//!
//! The core relies on the following properties of any implementation:
//! * fences are monotonic: once signaled, a fence stays signaled until it is reset;
//! * waiting on an already signaled fence returns immediately;
//! * buffer allocation may return more capacity than requested.
use ash::{prelude::VkResult, vk};
use std::ptr::NonNull;

mod null;
mod vulkan;

pub use gpu_allocator::MemoryLocation;
pub use null::{NullDevice, SubmissionRecord};
pub use vulkan::VulkanDevice;

/// Timeout used when the core waits on a fence without a caller-provided deadline.
pub(crate) const FENCE_WAIT_TIMEOUT_NS: u64 = 1_000_000_000;

/// Properties of the device that influence allocation decisions.
#[derive(Copy, Clone, Debug)]
pub struct DeviceProperties {
    /// Whether device-local memory is also host-visible (integrated GPUs).
    pub unified_memory: bool,
    /// Number of nanoseconds per timestamp tick.
    pub timestamp_period: f32,
}

impl Default for DeviceProperties {
    fn default() -> Self {
        DeviceProperties {
            unified_memory: false,
            timestamp_period: 1.0,
        }
    }
}

/// Parameters of a buffer allocation.
#[derive(Copy, Clone, Debug)]
pub struct BufferCreateInfo {
    /// Usage flags.
    pub usage: vk::BufferUsageFlags,
    /// Size of the buffer in bytes.
    pub byte_size: u64,
    /// Where the memory should live.
    pub location: MemoryLocation,
}

/// A buffer and its backing memory, as returned by the device.
#[derive(Debug)]
pub struct DeviceBuffer {
    /// Vulkan handle of the buffer.
    pub handle: vk::Buffer,
    /// Usable size of the buffer in bytes. Can be larger than the requested size.
    pub byte_size: u64,
    /// Usage flags the buffer was created with.
    pub usage: vk::BufferUsageFlags,
    /// If the memory is mapped in client memory, points to the start of the buffer.
    pub mapped_ptr: Option<NonNull<u8>>,
}

/// Parameters of a queue submission: one command buffer, its waits, its signals, and the fence
/// signaled on completion.
#[derive(Copy, Clone, Debug)]
pub struct QueueSubmit<'a> {
    pub command_buffer: vk::CommandBuffer,
    pub wait_semaphores: &'a [vk::Semaphore],
    /// One entry per wait semaphore.
    pub wait_stages: &'a [vk::PipelineStageFlags],
    pub signal_semaphores: &'a [vk::Semaphore],
    pub fence: vk::Fence,
}

/// Device-level operations consumed by the resource lifecycle core.
///
/// Errors are reported as raw `vk::Result` codes. `wait_for_fence` reports an expired timeout
/// with `vk::Result::TIMEOUT`, and `get_timestamp_results` reports results that are not yet
/// available with `vk::Result::NOT_READY`; neither is a device failure.
pub trait Device: Send + Sync {
    fn properties(&self) -> DeviceProperties;

    fn create_buffer(&self, create_info: &BufferCreateInfo) -> VkResult<DeviceBuffer>;
    fn destroy_buffer(&self, buffer: DeviceBuffer);

    fn create_fence(&self) -> VkResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<()>;
    /// Returns whether the fence is signaled, without blocking.
    fn get_fence_status(&self, fence: vk::Fence) -> VkResult<bool>;
    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()>;

    fn create_semaphore(&self) -> VkResult<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    fn allocate_command_buffer(&self) -> VkResult<vk::CommandBuffer>;
    fn free_command_buffer(&self, command_buffer: vk::CommandBuffer);
    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;
    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;
    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;
    fn queue_submit(&self, submit: &QueueSubmit) -> VkResult<()>;

    fn create_timestamp_query_pool(&self, query_count: u32) -> VkResult<vk::QueryPool>;
    fn destroy_query_pool(&self, query_pool: vk::QueryPool);
    fn cmd_reset_query_pool(
        &self,
        command_buffer: vk::CommandBuffer,
        query_pool: vk::QueryPool,
        first_query: u32,
        query_count: u32,
    );
    fn cmd_write_timestamp(
        &self,
        command_buffer: vk::CommandBuffer,
        stage: vk::PipelineStageFlags,
        query_pool: vk::QueryPool,
        query: u32,
    );
    /// Reads `results.len()` consecutive 64-bit timestamps starting at `first_query`.
    fn get_timestamp_results(
        &self,
        query_pool: vk::QueryPool,
        first_query: u32,
        results: &mut [u64],
    ) -> VkResult<()>;
}
