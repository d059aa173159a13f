use reclaim::{
    device::NullDevice, Context, ContextCreateInfo, Error, Fence, FenceStatus, WaitResult,
};
use std::{sync::Arc, thread, time::Duration};
use tracing_subscriber::EnvFilter;

fn context() -> (Arc<NullDevice>, Context) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let device = Arc::new(NullDevice::new());
    let context = Context::new(device.clone(), &ContextCreateInfo::default()).unwrap();
    (device, context)
}

#[test]
fn wait_before_submission_times_out() {
    let (_device, mut context) = context();
    let fence = context.create_fence();
    let wrapper = context.fence(&fence).unwrap().clone();
    assert_eq!(wrapper.status(), FenceStatus::Unsubmitted);
    assert_eq!(
        wrapper.wait(Duration::from_millis(20)),
        WaitResult::TimeoutExpired
    );
    context.release(&fence);
    context.terminate();
}

#[test]
fn all_concurrent_waiters_are_satisfied() {
    let (device, mut context) = context();
    let fence = context.create_fence();
    let wrapper = context.fence(&fence).unwrap().clone();

    let waiters: Vec<_> = (0..6)
        .map(|_| {
            let wrapper = wrapper.clone();
            thread::spawn(move || wrapper.wait(Duration::from_secs(10)))
        })
        .collect();

    // let some of them block on the unsubmitted state
    thread::sleep(Duration::from_millis(20));
    context.flush();
    assert_eq!(wrapper.status(), FenceStatus::Pending);
    thread::sleep(Duration::from_millis(20));
    device.complete_all();

    for waiter in waiters {
        assert_eq!(waiter.join().unwrap(), WaitResult::ConditionSatisfied);
    }
    assert_eq!(wrapper.status(), FenceStatus::Completed);
    context.release(&fence);
    context.terminate();
}

#[test]
fn fence_can_be_waited_on_from_another_thread_after_release() {
    let (device, mut context) = context();
    let fence = context.create_fence();
    let wrapper = context.fence(&fence).unwrap().clone();
    context.release(&fence);
    context.gc();
    assert!(context.fence(&fence).is_none());

    let waiter = thread::spawn(move || wrapper.wait(Duration::from_secs(10)));
    context.flush();
    device.complete_all();
    assert_eq!(waiter.join().unwrap(), WaitResult::ConditionSatisfied);
    context.terminate();
}

#[test]
fn reset_is_rejected_until_completion() {
    let (device, mut context) = context();
    let sync = context.command_buffer().fence().clone();
    assert!(matches!(sync.reset_fence(), Err(Error::FenceNotCompleted)));
    context.flush();
    assert!(matches!(sync.reset_fence(), Err(Error::FenceNotCompleted)));
    assert!(!sync.poll());

    device.complete_all();
    let waiters: Vec<_> = (0..4)
        .map(|_| {
            let sync = sync.clone();
            thread::spawn(move || {
                (0..50)
                    .map(|_| sync.wait(Duration::from_secs(10)))
                    .all(|result| result == WaitResult::ConditionSatisfied)
            })
        })
        .collect();
    assert_eq!(sync.wait(Duration::from_secs(10)), WaitResult::ConditionSatisfied);
    // racing with the waiters
    sync.reset_fence().unwrap();
    for waiter in waiters {
        assert!(waiter.join().unwrap());
    }
    assert_eq!(sync.status(), FenceStatus::Completed);
    assert!(!device.is_fence_signaled(sync.raw()));
    context.terminate();
}

#[test]
fn cancel_wakes_waiters_with_error() {
    let (_device, mut context) = context();
    let fence = context.create_fence();
    let wrapper = context.fence(&fence).unwrap().clone();

    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let wrapper = wrapper.clone();
            thread::spawn(move || wrapper.wait(Duration::from_secs(10)))
        })
        .collect();
    thread::sleep(Duration::from_millis(20));
    wrapper.cancel();
    for waiter in waiters {
        assert_eq!(waiter.join().unwrap(), WaitResult::Error);
    }
    assert_eq!(wrapper.status(), FenceStatus::Error);
    assert!(wrapper.is_canceled());
    context.release(&fence);
    context.terminate();
}

#[test]
fn cancelled_command_buffer_is_still_reclaimed() {
    let (device, mut context) = context();
    let fence = context.create_fence();
    context.fence(&fence).unwrap().cancel();
    context.flush();
    device.complete_all();
    context.gc();
    assert_eq!(context.commands().in_flight(), 0);
    context.release(&fence);
    context.terminate();
}

#[test]
fn unattached_fence_waits_for_attachment() {
    let (device, mut context) = context();
    let wrapper = Fence::new();
    let waiter = {
        let wrapper = wrapper.clone();
        thread::spawn(move || wrapper.wait(Duration::from_secs(10)))
    };
    thread::sleep(Duration::from_millis(10));
    wrapper.set_fence(context.command_buffer().fence().clone());
    context.flush();
    device.complete_all();
    assert_eq!(waiter.join().unwrap(), WaitResult::ConditionSatisfied);
    assert!(wrapper.shared_fence().is_some());
    context.terminate();
}
