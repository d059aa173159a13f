//! Vulkan backend.
use crate::{
    device::{BufferCreateInfo, Device, DeviceBuffer, DeviceProperties, QueueSubmit},
    Error,
};
use ash::{prelude::VkResult, vk};
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use parking_lot::Mutex;
use std::{collections::HashMap, ffi::CStr, mem};
use tracing::{debug, warn};

/// A [`Device`] backed by a Vulkan device and one of its queues.
///
/// The `ash::Device` is provided by the caller and stays owned by the caller: it must outlive the
/// `VulkanDevice`. Buffer memory is suballocated with `gpu-allocator`.
pub struct VulkanDevice {
    pub device: ash::Device,
    queue: Mutex<vk::Queue>,
    command_pool: Mutex<vk::CommandPool>,
    allocator: Mutex<Option<Allocator>>,
    allocations: Mutex<HashMap<vk::Buffer, Allocation>>,
    properties: DeviceProperties,
}

impl VulkanDevice {
    /// Creates the device wrapper.
    ///
    /// # Safety
    ///
    /// - `device` must have been created from `physical_device`, which must belong to `instance`
    /// - `queue_family_index` must be a queue family requested at device creation, with at least
    ///   one queue
    pub unsafe fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
        queue_family_index: u32,
    ) -> Result<VulkanDevice, Error> {
        let physical_device_properties = instance.get_physical_device_properties(physical_device);
        let unified_memory = matches!(
            physical_device_properties.device_type,
            vk::PhysicalDeviceType::INTEGRATED_GPU | vk::PhysicalDeviceType::CPU
        );
        debug!(
            name = ?CStr::from_ptr(physical_device_properties.device_name.as_ptr()),
            unified_memory,
            "creating vulkan device"
        );

        let queue = device.get_device_queue(queue_family_index, 0);
        let command_pool_create_info = vk::CommandPoolCreateInfo {
            flags: vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            queue_family_index,
            ..Default::default()
        };
        let command_pool = device.create_command_pool(&command_pool_create_info, None)?;

        let allocator = match Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
        }) {
            Ok(allocator) => allocator,
            Err(err) => {
                device.destroy_command_pool(command_pool, None);
                return Err(err.into());
            }
        };

        Ok(VulkanDevice {
            device,
            queue: Mutex::new(queue),
            command_pool: Mutex::new(command_pool),
            allocator: Mutex::new(Some(allocator)),
            allocations: Mutex::new(HashMap::new()),
            properties: DeviceProperties {
                unified_memory,
                timestamp_period: physical_device_properties.limits.timestamp_period,
            },
        })
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        let leaked = mem::take(&mut *self.allocations.lock());
        if !leaked.is_empty() {
            warn!(count = leaked.len(), "buffers still allocated when dropping the device");
        }
        let mut allocator = self.allocator.lock().take();
        unsafe {
            for (buffer, allocation) in leaked {
                self.device.destroy_buffer(buffer, None);
                if let Some(allocator) = allocator.as_mut() {
                    let _ = allocator.free(allocation);
                }
            }
            self.device
                .destroy_command_pool(*self.command_pool.get_mut(), None);
        }
        // the allocator must go away before the caller destroys the device
        drop(allocator);
    }
}

impl Device for VulkanDevice {
    fn properties(&self) -> DeviceProperties {
        self.properties
    }

    fn create_buffer(&self, create_info: &BufferCreateInfo) -> VkResult<DeviceBuffer> {
        unsafe {
            let buffer_create_info = vk::BufferCreateInfo {
                size: create_info.byte_size,
                usage: create_info.usage,
                sharing_mode: vk::SharingMode::EXCLUSIVE,
                ..Default::default()
            };
            let handle = self.device.create_buffer(&buffer_create_info, None)?;
            let requirements = self.device.get_buffer_memory_requirements(handle);

            let allocation = {
                let mut allocator = self.allocator.lock();
                let allocator = allocator
                    .as_mut()
                    .expect("allocator used after device teardown");
                allocator.allocate(&AllocationCreateDesc {
                    name: "pooled buffer",
                    requirements,
                    location: create_info.location,
                    linear: true,
                    allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                })
            };
            let allocation = match allocation {
                Ok(allocation) => allocation,
                Err(err) => {
                    warn!(?err, byte_size = create_info.byte_size, "buffer allocation failed");
                    self.device.destroy_buffer(handle, None);
                    return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
                }
            };

            if let Err(err) =
                self.device
                    .bind_buffer_memory(handle, allocation.memory(), allocation.offset())
            {
                self.device.destroy_buffer(handle, None);
                if let Some(allocator) = self.allocator.lock().as_mut() {
                    let _ = allocator.free(allocation);
                }
                return Err(err);
            }

            let mapped_ptr = allocation.mapped_ptr().map(|ptr| ptr.cast::<u8>());
            self.allocations.lock().insert(handle, allocation);

            Ok(DeviceBuffer {
                handle,
                byte_size: create_info.byte_size,
                usage: create_info.usage,
                mapped_ptr,
            })
        }
    }

    fn destroy_buffer(&self, buffer: DeviceBuffer) {
        let allocation = self.allocations.lock().remove(&buffer.handle);
        unsafe {
            self.device.destroy_buffer(buffer.handle, None);
        }
        if let Some(allocation) = allocation {
            if let Some(allocator) = self.allocator.lock().as_mut() {
                allocator
                    .free(allocation)
                    .expect("failed to free buffer memory");
            }
        }
    }

    fn create_fence(&self) -> VkResult<vk::Fence> {
        unsafe {
            self.device
                .create_fence(&vk::FenceCreateInfo::default(), None)
        }
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) }
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<()> {
        unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns) }
    }

    fn get_fence_status(&self, fence: vk::Fence) -> VkResult<bool> {
        unsafe { self.device.get_fence_status(fence) }
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        unsafe { self.device.reset_fences(&[fence]) }
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        unsafe {
            self.device
                .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
        }
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) }
    }

    fn allocate_command_buffer(&self) -> VkResult<vk::CommandBuffer> {
        let command_pool = self.command_pool.lock();
        let allocate_info = vk::CommandBufferAllocateInfo {
            command_pool: *command_pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: 1,
            ..Default::default()
        };
        let buffers = unsafe { self.device.allocate_command_buffers(&allocate_info)? };
        Ok(buffers[0])
    }

    fn free_command_buffer(&self, command_buffer: vk::CommandBuffer) {
        let command_pool = self.command_pool.lock();
        unsafe {
            self.device
                .free_command_buffers(*command_pool, &[command_buffer])
        }
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        let _pool = self.command_pool.lock();
        let begin_info = vk::CommandBufferBeginInfo {
            flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            ..Default::default()
        };
        unsafe {
            self.device
                .begin_command_buffer(command_buffer, &begin_info)
        }
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        let _pool = self.command_pool.lock();
        unsafe { self.device.end_command_buffer(command_buffer) }
    }

    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        let _pool = self.command_pool.lock();
        unsafe {
            self.device
                .reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())
        }
    }

    fn queue_submit(&self, submit: &QueueSubmit) -> VkResult<()> {
        assert_eq!(submit.wait_semaphores.len(), submit.wait_stages.len());
        let submit_info = vk::SubmitInfo {
            wait_semaphore_count: submit.wait_semaphores.len() as u32,
            p_wait_semaphores: submit.wait_semaphores.as_ptr(),
            p_wait_dst_stage_mask: submit.wait_stages.as_ptr(),
            command_buffer_count: 1,
            p_command_buffers: &submit.command_buffer,
            signal_semaphore_count: submit.signal_semaphores.len() as u32,
            p_signal_semaphores: submit.signal_semaphores.as_ptr(),
            ..Default::default()
        };
        let queue = self.queue.lock();
        unsafe {
            self.device
                .queue_submit(*queue, &[submit_info], submit.fence)
        }
    }

    fn create_timestamp_query_pool(&self, query_count: u32) -> VkResult<vk::QueryPool> {
        let create_info = vk::QueryPoolCreateInfo {
            query_type: vk::QueryType::TIMESTAMP,
            query_count,
            ..Default::default()
        };
        unsafe { self.device.create_query_pool(&create_info, None) }
    }

    fn destroy_query_pool(&self, query_pool: vk::QueryPool) {
        unsafe { self.device.destroy_query_pool(query_pool, None) }
    }

    fn cmd_reset_query_pool(
        &self,
        command_buffer: vk::CommandBuffer,
        query_pool: vk::QueryPool,
        first_query: u32,
        query_count: u32,
    ) {
        unsafe {
            self.device
                .cmd_reset_query_pool(command_buffer, query_pool, first_query, query_count)
        }
    }

    fn cmd_write_timestamp(
        &self,
        command_buffer: vk::CommandBuffer,
        stage: vk::PipelineStageFlags,
        query_pool: vk::QueryPool,
        query: u32,
    ) {
        unsafe {
            self.device
                .cmd_write_timestamp(command_buffer, stage, query_pool, query)
        }
    }

    fn get_timestamp_results(
        &self,
        query_pool: vk::QueryPool,
        first_query: u32,
        results: &mut [u64],
    ) -> VkResult<()> {
        unsafe {
            self.device.get_query_pool_results(
                query_pool,
                first_query,
                results.len() as u32,
                results,
                vk::QueryResultFlags::TYPE_64,
            )
        }
    }
}
