//! Headless device.
use crate::device::{
    BufferCreateInfo, Device, DeviceBuffer, DeviceProperties, MemoryLocation, QueueSubmit,
};
use ash::{
    prelude::VkResult,
    vk::{self, Handle},
};
use parking_lot::{Condvar, Mutex};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    time::{Duration, Instant},
};
use tracing::trace;

#[derive(Copy, Clone, Debug)]
enum NullCommand {
    ResetQueries {
        pool: vk::QueryPool,
        first: u32,
        count: u32,
    },
    WriteTimestamp {
        pool: vk::QueryPool,
        query: u32,
    },
}

/// A submission received by a [`NullDevice`].
#[derive(Clone, Debug)]
pub struct SubmissionRecord {
    pub command_buffer: vk::CommandBuffer,
    pub wait_semaphores: Vec<vk::Semaphore>,
    pub signal_semaphores: Vec<vk::Semaphore>,
    pub fence: vk::Fence,
}

struct PendingSubmission {
    commands: Vec<NullCommand>,
    fence: vk::Fence,
}

#[derive(Default)]
struct NullState {
    next_handle: u64,
    buffers: HashMap<u64, MemoryLocation>,
    buffers_created: usize,
    fences: HashMap<u64, bool>,
    semaphores: HashSet<u64>,
    command_buffers: HashMap<u64, Vec<NullCommand>>,
    query_pools: HashMap<u64, Vec<Option<u64>>>,
    pending: VecDeque<PendingSubmission>,
    submissions: Vec<SubmissionRecord>,
    auto_complete: bool,
    fail_next_buffer: Option<vk::Result>,
    clock: u64,
}

impl NullState {
    fn new_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn execute(&mut self, submission: PendingSubmission) {
        for command in submission.commands {
            match command {
                NullCommand::ResetQueries { pool, first, count } => {
                    if let Some(queries) = self.query_pools.get_mut(&pool.as_raw()) {
                        for q in queries.iter_mut().skip(first as usize).take(count as usize) {
                            *q = None;
                        }
                    }
                }
                NullCommand::WriteTimestamp { pool, query } => {
                    self.clock += 1000;
                    let clock = self.clock;
                    if let Some(q) = self
                        .query_pools
                        .get_mut(&pool.as_raw())
                        .and_then(|queries| queries.get_mut(query as usize))
                    {
                        *q = Some(clock);
                    }
                }
            }
        }
        if let Some(signaled) = self.fences.get_mut(&submission.fence.as_raw()) {
            *signaled = true;
        }
    }
}

/// A device that runs entirely on the CPU.
///
/// Submissions are recorded and "executed" in submission order: executing a submission resolves
/// its timestamp writes and signals its fence. By default submissions stay pending until
/// [`complete_next`](NullDevice::complete_next) or [`complete_all`](NullDevice::complete_all) is
/// called, which lets callers observe work in flight. With
/// [`set_auto_complete`](NullDevice::set_auto_complete), submissions complete immediately.
pub struct NullDevice {
    properties: DeviceProperties,
    state: Mutex<NullState>,
    signaled: Condvar,
}

impl Default for NullDevice {
    fn default() -> Self {
        NullDevice::new()
    }
}

impl NullDevice {
    pub fn new() -> NullDevice {
        NullDevice::with_properties(DeviceProperties::default())
    }

    pub fn with_properties(properties: DeviceProperties) -> NullDevice {
        NullDevice {
            properties,
            state: Mutex::new(NullState::default()),
            signaled: Condvar::new(),
        }
    }

    /// If enabled, submissions complete as soon as they are received.
    pub fn set_auto_complete(&self, enabled: bool) {
        let mut state = self.state.lock();
        state.auto_complete = enabled;
        if enabled {
            while let Some(submission) = state.pending.pop_front() {
                state.execute(submission);
            }
            self.signaled.notify_all();
        }
    }

    /// Completes the oldest pending submission. Returns `false` if nothing was pending.
    pub fn complete_next(&self) -> bool {
        let mut state = self.state.lock();
        match state.pending.pop_front() {
            Some(submission) => {
                state.execute(submission);
                self.signaled.notify_all();
                true
            }
            None => false,
        }
    }

    /// Completes every pending submission and returns how many there were.
    pub fn complete_all(&self) -> usize {
        let mut state = self.state.lock();
        let mut count = 0;
        while let Some(submission) = state.pending.pop_front() {
            state.execute(submission);
            count += 1;
        }
        self.signaled.notify_all();
        count
    }

    /// Number of submissions that have not completed yet.
    pub fn pending_submissions(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// All submissions received so far, in order.
    pub fn submissions(&self) -> Vec<SubmissionRecord> {
        self.state.lock().submissions.clone()
    }

    /// Makes the next call to `create_buffer` fail with the given code.
    pub fn fail_next_buffer_allocation(&self, error: vk::Result) {
        self.state.lock().fail_next_buffer = Some(error);
    }

    /// Number of buffers currently allocated.
    pub fn live_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    /// Memory location requested for a live buffer.
    pub fn buffer_location(&self, buffer: vk::Buffer) -> Option<MemoryLocation> {
        self.state.lock().buffers.get(&buffer.as_raw()).copied()
    }

    /// Number of buffers allocated since the creation of the device.
    pub fn buffers_created(&self) -> usize {
        self.state.lock().buffers_created
    }

    pub fn live_fences(&self) -> usize {
        self.state.lock().fences.len()
    }

    pub fn live_semaphores(&self) -> usize {
        self.state.lock().semaphores.len()
    }

    pub fn is_fence_signaled(&self, fence: vk::Fence) -> bool {
        self.state
            .lock()
            .fences
            .get(&fence.as_raw())
            .copied()
            .unwrap_or(false)
    }
}

impl Device for NullDevice {
    fn properties(&self) -> DeviceProperties {
        self.properties
    }

    fn create_buffer(&self, create_info: &BufferCreateInfo) -> VkResult<DeviceBuffer> {
        let mut state = self.state.lock();
        if let Some(err) = state.fail_next_buffer.take() {
            return Err(err);
        }
        let raw = state.new_handle();
        state.buffers.insert(raw, create_info.location);
        state.buffers_created += 1;
        trace!(raw, byte_size = create_info.byte_size, "null device: create_buffer");
        Ok(DeviceBuffer {
            handle: vk::Buffer::from_raw(raw),
            byte_size: create_info.byte_size,
            usage: create_info.usage,
            mapped_ptr: None,
        })
    }

    fn destroy_buffer(&self, buffer: DeviceBuffer) {
        let removed = self.state.lock().buffers.remove(&buffer.handle.as_raw());
        assert!(removed.is_some(), "destroying an unknown buffer");
    }

    fn create_fence(&self) -> VkResult<vk::Fence> {
        let mut state = self.state.lock();
        let raw = state.new_handle();
        state.fences.insert(raw, false);
        Ok(vk::Fence::from_raw(raw))
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        self.state.lock().fences.remove(&fence.as_raw());
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<()> {
        let deadline = Instant::now().checked_add(Duration::from_nanos(timeout_ns));
        let mut state = self.state.lock();
        loop {
            match state.fences.get(&fence.as_raw()) {
                None => return Err(vk::Result::ERROR_UNKNOWN),
                Some(true) => return Ok(()),
                Some(false) => {}
            }
            if timeout_ns == 0 {
                return Err(vk::Result::TIMEOUT);
            }
            match deadline {
                Some(deadline) => {
                    if self.signaled.wait_until(&mut state, deadline).timed_out() {
                        return match state.fences.get(&fence.as_raw()) {
                            Some(true) => Ok(()),
                            _ => Err(vk::Result::TIMEOUT),
                        };
                    }
                }
                None => self.signaled.wait(&mut state),
            }
        }
    }

    fn get_fence_status(&self, fence: vk::Fence) -> VkResult<bool> {
        self.state
            .lock()
            .fences
            .get(&fence.as_raw())
            .copied()
            .ok_or(vk::Result::ERROR_UNKNOWN)
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        match self.state.lock().fences.get_mut(&fence.as_raw()) {
            Some(signaled) => {
                *signaled = false;
                Ok(())
            }
            None => Err(vk::Result::ERROR_UNKNOWN),
        }
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        let mut state = self.state.lock();
        let raw = state.new_handle();
        state.semaphores.insert(raw);
        Ok(vk::Semaphore::from_raw(raw))
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.state.lock().semaphores.remove(&semaphore.as_raw());
    }

    fn allocate_command_buffer(&self) -> VkResult<vk::CommandBuffer> {
        let mut state = self.state.lock();
        let raw = state.new_handle();
        state.command_buffers.insert(raw, Vec::new());
        Ok(vk::CommandBuffer::from_raw(raw))
    }

    fn free_command_buffer(&self, command_buffer: vk::CommandBuffer) {
        self.state
            .lock()
            .command_buffers
            .remove(&command_buffer.as_raw());
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        match self
            .state
            .lock()
            .command_buffers
            .get_mut(&command_buffer.as_raw())
        {
            Some(commands) => {
                commands.clear();
                Ok(())
            }
            None => Err(vk::Result::ERROR_UNKNOWN),
        }
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        if self
            .state
            .lock()
            .command_buffers
            .contains_key(&command_buffer.as_raw())
        {
            Ok(())
        } else {
            Err(vk::Result::ERROR_UNKNOWN)
        }
    }

    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        self.begin_command_buffer(command_buffer)
    }

    fn queue_submit(&self, submit: &QueueSubmit) -> VkResult<()> {
        let mut state = self.state.lock();
        let commands = state
            .command_buffers
            .get(&submit.command_buffer.as_raw())
            .cloned()
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        state.submissions.push(SubmissionRecord {
            command_buffer: submit.command_buffer,
            wait_semaphores: submit.wait_semaphores.to_vec(),
            signal_semaphores: submit.signal_semaphores.to_vec(),
            fence: submit.fence,
        });
        let submission = PendingSubmission {
            commands,
            fence: submit.fence,
        };
        if state.auto_complete {
            state.execute(submission);
            self.signaled.notify_all();
        } else {
            state.pending.push_back(submission);
        }
        Ok(())
    }

    fn create_timestamp_query_pool(&self, query_count: u32) -> VkResult<vk::QueryPool> {
        let mut state = self.state.lock();
        let raw = state.new_handle();
        state.query_pools.insert(raw, vec![None; query_count as usize]);
        Ok(vk::QueryPool::from_raw(raw))
    }

    fn destroy_query_pool(&self, query_pool: vk::QueryPool) {
        self.state.lock().query_pools.remove(&query_pool.as_raw());
    }

    fn cmd_reset_query_pool(
        &self,
        command_buffer: vk::CommandBuffer,
        query_pool: vk::QueryPool,
        first_query: u32,
        query_count: u32,
    ) {
        if let Some(commands) = self
            .state
            .lock()
            .command_buffers
            .get_mut(&command_buffer.as_raw())
        {
            commands.push(NullCommand::ResetQueries {
                pool: query_pool,
                first: first_query,
                count: query_count,
            });
        }
    }

    fn cmd_write_timestamp(
        &self,
        command_buffer: vk::CommandBuffer,
        _stage: vk::PipelineStageFlags,
        query_pool: vk::QueryPool,
        query: u32,
    ) {
        if let Some(commands) = self
            .state
            .lock()
            .command_buffers
            .get_mut(&command_buffer.as_raw())
        {
            commands.push(NullCommand::WriteTimestamp {
                pool: query_pool,
                query,
            });
        }
    }

    fn get_timestamp_results(
        &self,
        query_pool: vk::QueryPool,
        first_query: u32,
        results: &mut [u64],
    ) -> VkResult<()> {
        let state = self.state.lock();
        let queries = state
            .query_pools
            .get(&query_pool.as_raw())
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        for (i, result) in results.iter_mut().enumerate() {
            match queries.get(first_query as usize + i) {
                Some(Some(value)) => *result = *value,
                Some(None) => return Err(vk::Result::NOT_READY),
                None => return Err(vk::Result::ERROR_UNKNOWN),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submissions_complete_in_order() {
        let device = NullDevice::new();
        let cb = device.allocate_command_buffer().unwrap();
        let f1 = device.create_fence().unwrap();
        let f2 = device.create_fence().unwrap();
        for &fence in &[f1, f2] {
            device
                .queue_submit(&QueueSubmit {
                    command_buffer: cb,
                    wait_semaphores: &[],
                    wait_stages: &[],
                    signal_semaphores: &[],
                    fence,
                })
                .unwrap();
        }
        assert_eq!(device.pending_submissions(), 2);
        assert_eq!(device.wait_for_fence(f1, 0), Err(vk::Result::TIMEOUT));
        assert!(device.complete_next());
        assert!(device.is_fence_signaled(f1));
        assert!(!device.is_fence_signaled(f2));
        assert_eq!(device.complete_all(), 1);
        assert_eq!(device.wait_for_fence(f2, 0), Ok(()));
    }

    #[test]
    fn injected_allocation_failure() {
        let device = NullDevice::new();
        device.fail_next_buffer_allocation(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        let info = BufferCreateInfo {
            usage: vk::BufferUsageFlags::VERTEX_BUFFER,
            byte_size: 64,
            location: MemoryLocation::GpuOnly,
        };
        assert_eq!(
            device.create_buffer(&info).unwrap_err(),
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
        );
        let buffer = device.create_buffer(&info).unwrap();
        assert_eq!(device.live_buffers(), 1);
        assert_eq!(
            device.buffer_location(buffer.handle),
            Some(MemoryLocation::GpuOnly)
        );
        device.destroy_buffer(buffer);
        assert_eq!(device.live_buffers(), 0);
        assert_eq!(device.buffers_created(), 1);
    }
}
