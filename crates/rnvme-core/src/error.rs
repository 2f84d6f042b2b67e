use std::time::Duration;

use rnvme_mem::MemError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DriverError>;

/// Unified error type for every core operation.
///
/// Nothing here is fatal: an error return leaves the device registry and the
/// hardware in their prior, consistent state, with partial allocations and
/// pins unwound before returning.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("no {what} with id {id}")]
    NotFound { what: &'static str, id: u32 },

    #[error("id {0} already exists")]
    Duplicate(u32),

    #[error("out of memory: {0}")]
    OutOfMemory(&'static str),

    #[error("i/o fault: {0}")]
    IoFault(&'static str),

    #[error("controller not ready within the CAP.TO budget of {0:?}")]
    ControllerTimeout(Duration),

    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}

impl From<MemError> for DriverError {
    fn from(err: MemError) -> Self {
        match err {
            MemError::OutOfMemory(what) => DriverError::OutOfMemory(what),
            // The scatter map step reports allocation pressure, matching the
            // original driver's -ENOMEM on dma_map_sg failure.
            MemError::MapFailed => DriverError::OutOfMemory("scatter list map failed"),
            MemError::OutOfBounds { .. } => DriverError::IoFault("physical access out of bounds"),
            MemError::BadUserRange(_) => DriverError::IoFault("user buffer not pinnable"),
            MemError::BadFree(_) => DriverError::InvalidState("free of unknown allocation"),
        }
    }
}
