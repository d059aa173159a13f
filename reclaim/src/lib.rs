//! GPU resource lifecycle: reference-counted resources, pooled buffers, command buffer
//! completion tracking and timer queries.
//!
//! The entry point is [`Context`], which owns one instance of each component for a [`Device`].

mod command;
mod context;
pub mod device;
mod error;
mod fence;
mod handle;
mod manager;
mod pool;
mod query;
mod ref_count;
mod serial;

pub use crate::command::CommandBuffer;
pub use crate::command::CommandBufferManager;
pub use crate::command::SlotState;
pub use crate::context::Context;
pub use crate::context::ContextCreateInfo;
pub use crate::device::Device;
pub use crate::error::Error;
pub use crate::error::Result;
pub use crate::fence::CommandBufferFence;
pub use crate::fence::Fence;
pub use crate::fence::FenceStatus;
pub use crate::fence::WaitResult;
pub use crate::handle::Handle;
pub use crate::handle::TypeTag;
pub use crate::manager::Resource;
pub use crate::manager::ResourceManager;
pub use crate::manager::ResourceManagerCreateInfo;
pub use crate::manager::ResourceObject;
pub use crate::pool::BufferPool;
pub use crate::pool::PooledBuffer;
pub use crate::pool::UsageClass;
pub use crate::pool::EVICTION_WINDOW;
pub use crate::query::QueryManager;
pub use crate::query::QueryResult;
pub use crate::query::TimerQuery;
pub use crate::ref_count::LocalRef;
pub use crate::ref_count::ResourceRef;
pub use crate::ref_count::SharedRef;
pub use crate::serial::SubmissionSerial;
pub use crate::serial::Tick;

pub use ash;
pub use ash::vk;
