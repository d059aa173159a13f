//! Ring of command buffers.
//!
//! Command buffers cycle through a fixed number of slots: `Free → Recording → Submitted → Free`.
//! There is at most one recording command buffer at a time. Consecutive submissions are chained
//! with binary semaphores: each submission signals the semaphore of its slot, and the next
//! submission waits on it (unless it has been handed off with `acquire_finished_signal`).
use crate::{
    device::{Device, QueueSubmit, FENCE_WAIT_TIMEOUT_NS},
    fence::{CommandBufferFence, WaitResult},
    handle::UniqueHandle,
    ref_count::ResourceRef,
    serial::SubmissionSerial,
    Error,
};
use ash::vk;
use std::{
    mem,
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, trace, trace_span, warn};

/// State of a command buffer slot.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SlotState {
    Free,
    Recording,
    Submitted,
}

/// A command buffer of the ring, with its fence and the semaphore it signals on completion.
#[derive(Debug)]
pub struct CommandBuffer {
    command_buffer: UniqueHandle<vk::CommandBuffer>,
    fence: UniqueHandle<vk::Fence>,
    semaphore: UniqueHandle<vk::Semaphore>,
    sync: Arc<CommandBufferFence>,
    state: SlotState,
    serial: SubmissionSerial,
    resources: Vec<ResourceRef>,
}

impl CommandBuffer {
    pub fn raw(&self) -> vk::CommandBuffer {
        self.command_buffer.get()
    }

    /// Fence of the current use of this command buffer.
    pub fn fence(&self) -> &Arc<CommandBufferFence> {
        &self.sync
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    /// Serial of the last submission of this slot.
    pub fn serial(&self) -> SubmissionSerial {
        self.serial
    }

    /// Keeps a reference until the command buffer has finished executing.
    ///
    /// The reference is handed back by `CommandBufferManager::take_retired` once the slot is
    /// reclaimed; the caller is responsible for releasing it.
    pub fn retain(&mut self, resource: ResourceRef) {
        self.resources.push(resource);
    }
}

/// Fixed-size ring of command buffers on a single queue.
pub struct CommandBufferManager {
    device: Arc<dyn Device>,
    slots: Vec<CommandBuffer>,
    current: Option<usize>,
    last_signal: Option<vk::Semaphore>,
    injected: Option<vk::Semaphore>,
    last_serial: SubmissionSerial,
    retired: Vec<ResourceRef>,
}

/// Resets a slot whose submission has completed and moves its resources to `retired`.
fn reclaim(device: &dyn Device, slot: &mut CommandBuffer, retired: &mut Vec<ResourceRef>) {
    slot.sync
        .reset_fence()
        .expect("reclaiming a command buffer that has not completed");
    device
        .reset_command_buffer(slot.command_buffer.get())
        .expect("failed to reset command buffer");
    slot.state = SlotState::Free;
    retired.append(&mut slot.resources);
    trace!(serial = ?slot.serial, "command buffer reclaimed");
}

impl CommandBufferManager {
    /// Creates a ring of `count` command buffers.
    pub fn new(device: Arc<dyn Device>, count: usize) -> Result<CommandBufferManager, Error> {
        if count == 0 {
            return Err(Error::Config(
                "the command buffer ring needs at least one slot".to_string(),
            ));
        }

        let mut manager = CommandBufferManager {
            device: device.clone(),
            slots: Vec::with_capacity(count),
            current: None,
            last_signal: None,
            injected: None,
            last_serial: SubmissionSerial::INVALID,
            retired: Vec::new(),
        };
        // on error, `Drop` frees the slots created so far
        for _ in 0..count {
            let mut command_buffer = UniqueHandle::new(device.allocate_command_buffer()?);
            let mut fence = match device.create_fence() {
                Ok(fence) => UniqueHandle::new(fence),
                Err(err) => {
                    device.free_command_buffer(command_buffer.take());
                    return Err(err.into());
                }
            };
            let semaphore = match device.create_semaphore() {
                Ok(semaphore) => UniqueHandle::new(semaphore),
                Err(err) => {
                    device.free_command_buffer(command_buffer.take());
                    device.destroy_fence(fence.take());
                    return Err(err.into());
                }
            };
            let sync = Arc::new(CommandBufferFence::new(device.clone(), fence.get()));
            manager.slots.push(CommandBuffer {
                command_buffer,
                fence,
                semaphore,
                sync,
                state: SlotState::Free,
                serial: SubmissionSerial::INVALID,
                resources: Vec::new(),
            });
        }
        debug!(count, "command buffer ring created");
        Ok(manager)
    }

    /// Number of slots in the ring.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Number of submitted command buffers that have not been reclaimed yet.
    pub fn in_flight(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.state == SlotState::Submitted)
            .count()
    }

    /// The recording command buffer, if any.
    pub fn current(&self) -> Option<&CommandBuffer> {
        self.current.map(|index| &self.slots[index])
    }

    /// Serial of the last submission.
    pub fn last_serial(&self) -> SubmissionSerial {
        self.last_serial
    }

    /// Returns the recording command buffer, beginning a new one if necessary.
    ///
    /// If every slot is in flight, blocks until the oldest submission completes.
    pub fn get(&mut self) -> &mut CommandBuffer {
        let index = match self.current {
            Some(index) => index,
            None => {
                let index = self.acquire_free_slot();
                self.begin(index);
                self.current = Some(index);
                index
            }
        };
        &mut self.slots[index]
    }

    fn acquire_free_slot(&mut self) -> usize {
        loop {
            if let Some(index) = self
                .slots
                .iter()
                .position(|slot| slot.state == SlotState::Free)
            {
                return index;
            }

            let oldest = self
                .slots
                .iter()
                .filter(|slot| slot.state == SlotState::Submitted)
                .min_by_key(|slot| slot.serial)
                .map(|slot| (slot.serial, slot.sync.clone()));
            if let Some((serial, sync)) = oldest {
                debug!(?serial, "all command buffers in flight, waiting for the oldest");
                let deadline = Instant::now() + Duration::from_nanos(FENCE_WAIT_TIMEOUT_NS);
                if sync.wait_for_completion(Some(deadline)) == WaitResult::TimeoutExpired {
                    warn!(?serial, "still waiting for a command buffer to complete");
                }
            }
            self.gc();
        }
    }

    fn begin(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        debug_assert_eq!(slot.state, SlotState::Free);
        self.device
            .begin_command_buffer(slot.command_buffer.get())
            .expect("failed to begin command buffer");
        slot.sync = Arc::new(CommandBufferFence::new(
            self.device.clone(),
            slot.fence.get(),
        ));
        slot.state = SlotState::Recording;
        trace!(index, "command buffer recording");
    }

    /// Ends recording and submits the current command buffer.
    ///
    /// The submission waits on the injected dependency and on the signal of the previous
    /// submission, if they are set, and signals the semaphore of its slot. Returns `None` if
    /// nothing was recording.
    pub fn flush(&mut self) -> Option<SubmissionSerial> {
        let index = match self.current.take() {
            Some(index) => index,
            None => {
                trace!("flush: no command buffer recording");
                return None;
            }
        };

        let mut wait_semaphores = Vec::with_capacity(2);
        let mut wait_stages = Vec::with_capacity(2);
        if let Some(semaphore) = self.injected.take() {
            wait_semaphores.push(semaphore);
            wait_stages.push(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);
        }
        if let Some(semaphore) = self.last_signal.take() {
            wait_semaphores.push(semaphore);
            wait_stages.push(vk::PipelineStageFlags::ALL_COMMANDS);
        }

        let serial = self.last_serial.next();
        let slot = &mut self.slots[index];
        let command_buffer = slot.command_buffer.get();
        let signal = slot.semaphore.get();
        self.device
            .end_command_buffer(command_buffer)
            .expect("failed to end command buffer");
        self.device
            .queue_submit(&QueueSubmit {
                command_buffer,
                wait_semaphores: &wait_semaphores,
                wait_stages: &wait_stages,
                signal_semaphores: &[signal],
                fence: slot.fence.get(),
            })
            .expect("queue submission failed");
        slot.serial = serial;
        slot.state = SlotState::Submitted;
        slot.sync.mark_submitted();

        self.last_serial = serial;
        self.last_signal = Some(signal);
        trace!(?serial, waits = wait_semaphores.len(), "command buffer submitted");
        Some(serial)
    }

    /// Makes the next submission wait on `semaphore` (once).
    pub fn inject_dependency(&mut self, semaphore: vk::Semaphore) {
        if let Some(previous) = self.injected.replace(semaphore) {
            warn!(?previous, "injected dependency replaced before being consumed");
        }
    }

    /// Takes the semaphore signaled by the last submission. The next submission will not wait on it.
    pub fn acquire_finished_signal(&mut self) -> Option<vk::Semaphore> {
        self.last_signal.take()
    }

    /// Reclaims the slots whose submission has completed. Returns the number of reclaimed slots.
    pub fn gc(&mut self) -> usize {
        let _span = trace_span!("command_buffer_gc").entered();
        let mut reclaimed = 0;
        for slot in self.slots.iter_mut() {
            if slot.state == SlotState::Submitted && slot.sync.poll() {
                reclaim(&*self.device, slot, &mut self.retired);
                reclaimed += 1;
            }
        }
        reclaimed
    }

    /// Blocks until every submitted command buffer has completed, then reclaims them.
    pub fn wait(&mut self) {
        let _span = trace_span!("command_buffer_wait").entered();
        let pending: Vec<_> = self
            .slots
            .iter()
            .filter(|slot| slot.state == SlotState::Submitted)
            .map(|slot| (slot.serial, slot.sync.clone()))
            .collect();
        for (serial, sync) in pending {
            loop {
                let deadline = Instant::now() + Duration::from_nanos(FENCE_WAIT_TIMEOUT_NS);
                match sync.wait_for_completion(Some(deadline)) {
                    WaitResult::ConditionSatisfied => break,
                    _ => warn!(?serial, "still waiting for a command buffer to complete"),
                }
            }
        }
        self.gc();
    }

    /// Takes the references released by reclaimed command buffers.
    pub fn take_retired(&mut self) -> Vec<ResourceRef> {
        mem::take(&mut self.retired)
    }

    /// Waits for all submissions and returns every reference still held by the ring.
    pub fn terminate(&mut self) -> Vec<ResourceRef> {
        self.wait();
        if let Some(index) = self.current.take() {
            let slot = &mut self.slots[index];
            slot.sync.cancel();
            self.retired.append(&mut slot.resources);
            self.device
                .reset_command_buffer(slot.command_buffer.get())
                .expect("failed to reset command buffer");
            slot.state = SlotState::Free;
        }
        self.take_retired()
    }
}

impl Drop for CommandBufferManager {
    fn drop(&mut self) {
        if let Some(index) = self.current.take() {
            self.slots[index].sync.cancel();
        }
        for slot in self.slots.iter() {
            if slot.state == SlotState::Submitted
                && slot.sync.wait_for_completion(Instant::now().checked_add(Duration::from_nanos(
                    FENCE_WAIT_TIMEOUT_NS,
                ))) != WaitResult::ConditionSatisfied
            {
                warn!(serial = ?slot.serial, "destroying a command buffer that is still executing");
            }
        }
        let leaked: usize = self.slots.iter().map(|slot| slot.resources.len()).sum::<usize>()
            + self.retired.len();
        if leaked > 0 {
            warn!(leaked, "command buffer ring dropped while holding resource references");
        }
        for slot in self.slots.iter_mut() {
            self.device.free_command_buffer(slot.command_buffer.take());
            self.device.destroy_fence(slot.fence.take());
            self.device.destroy_semaphore(slot.semaphore.take());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{device::NullDevice, fence::FenceStatus};

    fn ring(count: usize) -> (Arc<NullDevice>, CommandBufferManager) {
        let device = Arc::new(NullDevice::new());
        let manager = CommandBufferManager::new(device.clone(), count).unwrap();
        (device, manager)
    }

    #[test]
    fn empty_ring_is_rejected() {
        let device = Arc::new(NullDevice::new());
        assert!(matches!(
            CommandBufferManager::new(device, 0),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn get_returns_recording_buffer_until_flush() {
        let (device, mut ring) = ring(2);
        let first = ring.get().raw();
        assert_eq!(ring.get().raw(), first);
        assert_eq!(ring.get().state(), SlotState::Recording);
        assert_eq!(ring.flush(), Some(SubmissionSerial::new(1)));
        assert!(ring.current().is_none());
        assert_eq!(ring.flush(), None);
        assert_eq!(device.submissions().len(), 1);
        device.complete_all();
        ring.wait();
    }

    #[test]
    fn reclaimed_slot_gets_a_fresh_fence() {
        let (device, mut ring) = ring(1);
        let old_fence = ring.get().fence().clone();
        ring.flush();
        device.complete_all();
        assert_eq!(ring.gc(), 1);
        assert_eq!(ring.in_flight(), 0);

        let new_fence = ring.get().fence().clone();
        assert!(!Arc::ptr_eq(&old_fence, &new_fence));
        assert_eq!(old_fence.status(), FenceStatus::Completed);
        assert_eq!(new_fence.status(), FenceStatus::Unsubmitted);
        ring.flush();
        device.complete_all();
        ring.wait();
    }

    #[test]
    fn drop_releases_device_objects() {
        let (device, mut ring) = ring(3);
        ring.get();
        ring.flush();
        ring.get();
        device.complete_all();
        drop(ring);
        assert_eq!(device.live_fences(), 0);
        assert_eq!(device.live_semaphores(), 0);
    }
}
