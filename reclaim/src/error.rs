use ash::vk;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("device error: {0}")]
    Device(#[from] vk::Result),
    #[error("memory allocation error")]
    Allocation(#[from] gpu_allocator::AllocationError),
    #[error("buffer usage flags do not map to a pooled usage class")]
    InvalidUsage,
    #[error("the fence has not been observed completed")]
    FenceNotCompleted,
    #[error("{0} deferred destruction(s) still pending")]
    PendingDestructions(usize),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("could not parse configuration")]
    ConfigSyntax(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
