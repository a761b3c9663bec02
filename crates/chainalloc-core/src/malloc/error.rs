//! Allocator error type.

use std::fmt;

use thiserror::Error;

/// Which backend failed to supply memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    /// Data-segment growth (`sbrk`).
    HeapSegment,
    /// Anonymous mapping (`mmap`).
    Mapping,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::HeapSegment => "heap_segment",
            Self::Mapping => "mapping",
        })
    }
}

/// Failure of an allocate, zero-allocate or release call.
///
/// `ResourceExhausted` is the runtime condition callers are expected to
/// handle. The other variants are contract violations by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: &'static str },
    #[error("double release of block at {addr:#x}")]
    DoubleRelease { addr: usize },
    #[error("pointer {addr:#x} does not belong to this allocator")]
    UnknownPointer { addr: usize },
    #[error("{backend} backend could not supply {size} bytes (errno {errno})")]
    ResourceExhausted {
        backend: Backend,
        size: usize,
        errno: i32,
    },
}

impl AllocError {
    /// Whether this is a caller contract violation rather than exhaustion.
    #[must_use]
    pub const fn is_contract_violation(&self) -> bool {
        !matches!(self, Self::ResourceExhausted { .. })
    }

    /// Closest POSIX errno for the C boundary.
    #[must_use]
    pub const fn errno(&self) -> i32 {
        match self {
            Self::InvalidArgument { .. }
            | Self::DoubleRelease { .. }
            | Self::UnknownPointer { .. } => libc::EINVAL,
            Self::ResourceExhausted { .. } => libc::ENOMEM,
        }
    }
}
