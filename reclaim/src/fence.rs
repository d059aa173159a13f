//! Completion tracking for submitted command buffers.
use crate::{device::Device, Error};
use ash::vk;
use parking_lot::{Condvar, Mutex, RwLock};
use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, trace};

/// Status of a fence, as last observed.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FenceStatus {
    /// The command buffer guarded by the fence has not been submitted yet.
    Unsubmitted,
    /// Submitted, completion not observed yet.
    Pending,
    /// The device has finished executing the command buffer.
    Completed,
    /// The fence was cancelled.
    Error,
}

/// Result of a wait on a fence.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WaitResult {
    ConditionSatisfied,
    TimeoutExpired,
    /// The fence was cancelled.
    Error,
}

#[derive(Default)]
struct FenceState {
    submitted: bool,
    signaled: bool,
    canceled: bool,
    reset: bool,
}

/// The fence of one submission of a command buffer.
///
/// Waits run concurrently and hold the reset lock in shared mode, so that the device fence is
/// never reset while another thread is waiting on it. Once completion has been observed, it is
/// remembered: a `CommandBufferFence` keeps reporting `Completed` even after the device fence has
/// been reset and reused for another submission.
pub struct CommandBufferFence {
    device: Arc<dyn Device>,
    fence: vk::Fence,
    state: Mutex<FenceState>,
    condition: Condvar,
    reset_lock: RwLock<()>,
}

impl CommandBufferFence {
    /// The device fence is owned by the caller.
    pub(crate) fn new(device: Arc<dyn Device>, fence: vk::Fence) -> CommandBufferFence {
        CommandBufferFence {
            device,
            fence,
            state: Mutex::new(FenceState::default()),
            condition: Condvar::new(),
            reset_lock: RwLock::new(()),
        }
    }

    pub fn raw(&self) -> vk::Fence {
        self.fence
    }

    pub fn status(&self) -> FenceStatus {
        let state = self.state.lock();
        if state.signaled {
            FenceStatus::Completed
        } else if state.canceled {
            FenceStatus::Error
        } else if state.submitted {
            FenceStatus::Pending
        } else {
            FenceStatus::Unsubmitted
        }
    }

    /// Called once the command buffer has been handed to the queue.
    pub(crate) fn mark_submitted(&self) {
        let mut state = self.state.lock();
        state.submitted = true;
        self.condition.notify_all();
    }

    fn mark_signaled(&self) {
        let mut state = self.state.lock();
        if !state.signaled {
            state.signaled = true;
            self.condition.notify_all();
        }
    }

    /// Checks whether the submission has completed, without blocking.
    ///
    /// Cancellation does not affect polling: the device still completes cancelled work.
    pub fn poll(&self) -> bool {
        {
            let state = self.state.lock();
            if state.signaled {
                return true;
            }
            if !state.submitted {
                return false;
            }
        }
        let _shared = self.reset_lock.read();
        match self.device.get_fence_status(self.fence) {
            Ok(true) => {
                self.mark_signaled();
                true
            }
            Ok(false) => false,
            Err(err) => panic!("failed to query fence status: {}", err),
        }
    }

    /// Waits for completion for at most `timeout`.
    pub fn wait(&self, timeout: Duration) -> WaitResult {
        self.wait_until(Instant::now().checked_add(timeout))
    }

    /// Waits for completion until `deadline`, or forever if `deadline` is `None`.
    ///
    /// If the command buffer is not submitted yet, blocks until it is, the deadline passes
    /// (`TimeoutExpired`) or the fence is cancelled (`Error`).
    pub fn wait_until(&self, deadline: Option<Instant>) -> WaitResult {
        self.wait_inner(deadline, true)
    }

    /// Same as `wait_until`, but keeps waiting for the device if the fence is cancelled.
    pub(crate) fn wait_for_completion(&self, deadline: Option<Instant>) -> WaitResult {
        self.wait_inner(deadline, false)
    }

    fn wait_inner(&self, deadline: Option<Instant>, stop_on_cancel: bool) -> WaitResult {
        let _shared = self.reset_lock.read();

        {
            let mut state = self.state.lock();
            loop {
                if state.signaled {
                    return WaitResult::ConditionSatisfied;
                }
                if state.canceled && (stop_on_cancel || !state.submitted) {
                    return WaitResult::Error;
                }
                if state.submitted {
                    break;
                }
                match deadline {
                    Some(deadline) => {
                        if self.condition.wait_until(&mut state, deadline).timed_out()
                            && !state.submitted
                            && !state.canceled
                        {
                            return WaitResult::TimeoutExpired;
                        }
                    }
                    None => self.condition.wait(&mut state),
                }
            }
        }

        let timeout_ns = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                u64::try_from(remaining.as_nanos()).unwrap_or(u64::MAX)
            }
            None => u64::MAX,
        };
        match self.device.wait_for_fence(self.fence, timeout_ns) {
            Ok(()) => {
                self.mark_signaled();
                WaitResult::ConditionSatisfied
            }
            Err(vk::Result::TIMEOUT) => WaitResult::TimeoutExpired,
            Err(err) => panic!("failed to wait for fence: {}", err),
        }
    }

    /// Resets the device fence so that it can be reused for another submission.
    ///
    /// Only valid once completion has been observed (by `poll` or a wait); returns
    /// `Error::FenceNotCompleted` otherwise. Blocks until concurrent waits have returned. Resetting
    /// twice is a no-op.
    pub fn reset_fence(&self) -> Result<(), Error> {
        if !self.state.lock().signaled {
            return Err(Error::FenceNotCompleted);
        }
        let _exclusive = self.reset_lock.write();
        let mut state = self.state.lock();
        if !state.reset {
            if let Err(err) = self.device.reset_fence(self.fence) {
                panic!("failed to reset fence: {}", err)
            }
            state.reset = true;
            trace!(fence = ?self.fence, "fence reset");
        }
        Ok(())
    }

    /// Wakes up waiters with `WaitResult::Error`. Work already submitted still runs.
    pub fn cancel(&self) {
        let mut state = self.state.lock();
        if !state.canceled {
            debug!(fence = ?self.fence, "fence cancelled");
            state.canceled = true;
            self.condition.notify_all();
        }
    }
}

impl fmt::Debug for CommandBufferFence {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CommandBufferFence")
            .field("fence", &self.fence)
            .field("status", &self.status())
            .finish()
    }
}

#[derive(Default)]
struct FenceSlot {
    fence: Option<Arc<CommandBufferFence>>,
    canceled: bool,
}

#[derive(Default)]
struct FenceInner {
    slot: Mutex<FenceSlot>,
    attached: Condvar,
}

/// A user-visible fence.
///
/// Can be created before the command buffer it should track exists, and cancelled at any point.
/// Clones refer to the same fence.
#[derive(Clone, Default)]
pub struct Fence {
    inner: Arc<FenceInner>,
}

impl Fence {
    pub fn new() -> Fence {
        Fence::default()
    }

    /// Attaches the fence of a command buffer. Replaces any previously attached fence.
    pub fn set_fence(&self, fence: Arc<CommandBufferFence>) {
        let mut slot = self.inner.slot.lock();
        if slot.canceled {
            fence.cancel();
        }
        slot.fence = Some(fence);
        self.inner.attached.notify_all();
    }

    pub fn shared_fence(&self) -> Option<Arc<CommandBufferFence>> {
        self.inner.slot.lock().fence.clone()
    }

    /// Waits until a command buffer fence is attached and completed, for at most `timeout`.
    pub fn wait(&self, timeout: Duration) -> WaitResult {
        let deadline = Instant::now().checked_add(timeout);
        let fence = {
            let mut slot = self.inner.slot.lock();
            loop {
                if slot.canceled {
                    return WaitResult::Error;
                }
                if let Some(fence) = &slot.fence {
                    break fence.clone();
                }
                match deadline {
                    Some(deadline) => {
                        if self.inner.attached.wait_until(&mut slot, deadline).timed_out()
                            && slot.fence.is_none()
                            && !slot.canceled
                        {
                            return WaitResult::TimeoutExpired;
                        }
                    }
                    None => self.inner.attached.wait(&mut slot),
                }
            }
        };
        fence.wait_until(deadline)
    }

    /// Cancels the fence and the attached command buffer fence, if any.
    pub fn cancel(&self) {
        let mut slot = self.inner.slot.lock();
        slot.canceled = true;
        if let Some(fence) = &slot.fence {
            fence.cancel();
        }
        self.inner.attached.notify_all();
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.slot.lock().canceled
    }

    pub fn status(&self) -> FenceStatus {
        let slot = self.inner.slot.lock();
        match &slot.fence {
            Some(fence) => fence.status(),
            None if slot.canceled => FenceStatus::Error,
            None => FenceStatus::Unsubmitted,
        }
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Fence")
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{NullDevice, QueueSubmit};
    use std::thread;

    fn submit(device: &NullDevice, fence: &CommandBufferFence) {
        let command_buffer = device.allocate_command_buffer().unwrap();
        device
            .queue_submit(&QueueSubmit {
                command_buffer,
                wait_semaphores: &[],
                wait_stages: &[],
                signal_semaphores: &[],
                fence: fence.raw(),
            })
            .unwrap();
        fence.mark_submitted();
    }

    fn fence(device: &Arc<NullDevice>) -> CommandBufferFence {
        CommandBufferFence::new(device.clone(), device.create_fence().unwrap())
    }

    #[test]
    fn status_transitions() {
        let device = Arc::new(NullDevice::new());
        let fence = fence(&device);
        assert_eq!(fence.status(), FenceStatus::Unsubmitted);
        assert!(!fence.poll());
        submit(&device, &fence);
        assert_eq!(fence.status(), FenceStatus::Pending);
        assert!(!fence.poll());
        device.complete_all();
        assert!(fence.poll());
        assert_eq!(fence.status(), FenceStatus::Completed);
    }

    #[test]
    fn completion_survives_reset() {
        let device = Arc::new(NullDevice::new());
        let fence = fence(&device);
        submit(&device, &fence);
        device.complete_all();
        assert_eq!(fence.wait(Duration::from_millis(10)), WaitResult::ConditionSatisfied);
        fence.reset_fence().unwrap();
        assert!(!device.is_fence_signaled(fence.raw()));
        // still completed from the point of view of this submission
        assert!(fence.poll());
        assert_eq!(fence.wait(Duration::ZERO), WaitResult::ConditionSatisfied);
        fence.reset_fence().unwrap();
    }

    #[test]
    fn cancel_wakes_unsubmitted_waiter() {
        let device = Arc::new(NullDevice::new());
        let fence = Arc::new(fence(&device));
        let waiter = {
            let fence = fence.clone();
            thread::spawn(move || fence.wait(Duration::from_secs(10)))
        };
        thread::sleep(Duration::from_millis(20));
        fence.cancel();
        assert_eq!(waiter.join().unwrap(), WaitResult::Error);
        assert_eq!(fence.status(), FenceStatus::Error);
    }

    #[test]
    fn completion_wait_ignores_cancellation() {
        let device = Arc::new(NullDevice::with_properties(Default::default()));
        device.set_auto_complete(true);
        let fence = fence(&device);
        submit(&device, &fence);
        fence.cancel();
        assert_eq!(
            fence.wait_for_completion(None),
            WaitResult::ConditionSatisfied
        );
    }

    #[test]
    fn wrapper_waits_for_attachment() {
        let device = Arc::new(NullDevice::new());
        device.set_auto_complete(true);
        let wrapper = Fence::new();
        assert_eq!(wrapper.status(), FenceStatus::Unsubmitted);
        assert_eq!(
            wrapper.wait(Duration::from_millis(5)),
            WaitResult::TimeoutExpired
        );

        let waiter = {
            let wrapper = wrapper.clone();
            thread::spawn(move || wrapper.wait(Duration::from_secs(10)))
        };
        let fence = Arc::new(fence(&device));
        wrapper.set_fence(fence.clone());
        submit(&device, &fence);
        assert_eq!(waiter.join().unwrap(), WaitResult::ConditionSatisfied);
        assert_eq!(wrapper.status(), FenceStatus::Completed);
    }

    #[test]
    fn wrapper_cancel_before_attachment_propagates() {
        let device = Arc::new(NullDevice::new());
        let wrapper = Fence::new();
        wrapper.cancel();
        assert_eq!(wrapper.status(), FenceStatus::Error);
        let fence = Arc::new(fence(&device));
        wrapper.set_fence(fence.clone());
        assert_eq!(fence.status(), FenceStatus::Error);
        assert_eq!(wrapper.wait(Duration::from_secs(1)), WaitResult::Error);
    }
}
