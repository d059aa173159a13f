use ash::vk::Handle as _;
use std::{fmt, mem};

slotmap::new_key_type! {
    /// Identifies a resource in a `ResourceManager`.
    ///
    /// Handles are generational: a handle is never equal to a handle issued before, even after the
    /// resource it referred to has been destroyed.
    pub struct Handle;
}

/// The kind of a resource registered in a `ResourceManager`.
///
/// Destruction is dispatched on this tag (see `ResourceManager::destroy_object`).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum TypeTag {
    /// Uniform or storage buffer.
    BufferObject,
    IndexBuffer,
    VertexBuffer,
    TimerQuery,
    Fence,
}

impl TypeTag {
    /// Whether references to resources of this kind can be acquired and released from any thread.
    pub const fn is_thread_safe(self) -> bool {
        matches!(self, TypeTag::TimerQuery | TypeTag::Fence)
    }
}

/// A wrapper around a vulkan handle with unique semantics.
///
/// Panics if dropped while still holding a non-null handle: the owner must give the handle back
/// to the device with `take` before dropping.
#[repr(transparent)]
pub(crate) struct UniqueHandle<T: ash::vk::Handle + Copy>(T);

impl<T: ash::vk::Handle + Copy> Drop for UniqueHandle<T> {
    fn drop(&mut self) {
        if self.0.as_raw() != 0 && !std::thread::panicking() {
            panic!("non-null UniqueHandle was dropped")
        }
    }
}

impl<T: ash::vk::Handle + Copy + fmt::Debug> fmt::Debug for UniqueHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl<T: ash::vk::Handle + Copy> UniqueHandle<T> {
    pub(crate) fn new(inner: T) -> UniqueHandle<T> {
        UniqueHandle(inner)
    }

    /// Returns the handle itself.
    pub(crate) fn get(&self) -> T {
        self.0
    }

    /// Releases the handle.
    pub(crate) fn take(&mut self) -> T {
        mem::replace(&mut self.0, T::from_raw(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::{self, Handle as _};

    #[test]
    fn thread_safe_kinds() {
        assert!(TypeTag::Fence.is_thread_safe());
        assert!(TypeTag::TimerQuery.is_thread_safe());
        assert!(!TypeTag::VertexBuffer.is_thread_safe());
        assert!(!TypeTag::IndexBuffer.is_thread_safe());
        assert!(!TypeTag::BufferObject.is_thread_safe());
    }

    #[test]
    fn take_releases_unique_handle() {
        let mut handle = UniqueHandle::new(vk::Fence::from_raw(7));
        assert_eq!(handle.get(), vk::Fence::from_raw(7));
        assert_eq!(handle.take(), vk::Fence::from_raw(7));
        assert_eq!(handle.get(), vk::Fence::null());
    }

    #[test]
    #[should_panic(expected = "non-null UniqueHandle was dropped")]
    fn dropping_live_unique_handle_panics() {
        let _handle = UniqueHandle::new(vk::Semaphore::from_raw(3));
    }
}
