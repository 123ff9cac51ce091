use kernel_vmem::MapError;

/// Errors returned by the frame and heap allocators.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("already exists")]
    AlreadyExists,
    #[error("not found")]
    NotFound,
    #[error("not implemented")]
    NotImplemented,
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}

impl From<MapError> for MemoryError {
    fn from(value: MapError) -> Self {
        match value {
            MapError::OutOfMemory => Self::OutOfMemory,
            MapError::InvalidArgument(what) => Self::InvalidArgument(what),
            MapError::AlreadyExists => Self::AlreadyExists,
            MapError::NotFound => Self::NotFound,
        }
    }
}
