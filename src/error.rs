//! Types for error handling.
//!
//! # Error handling in hdmem
//!
//! Every failure the memory manager can detect is a broken address mapping: a pointer registered
//! twice, a handle used after its block was erased, a sub-view reaching past its block, or a
//! device allocation or transfer that did not happen. None of them can be retried away, and
//! continuing past one means later reads or writes may land in the wrong memory.
//!
//! Operations therefore return a [`MemoryResult`](type.MemoryResult.html) carrying one of a
//! small closed set of [`MemoryError`](enum.MemoryError.html) kinds. Callers with no recovery
//! strategy (which is most of them) should terminate through
//! [`Fatal::or_fatal`](trait.Fatal.html#tymethod.or_fatal), which logs the violated invariant
//! and panics with it.

#[cfg(feature = "cuda")]
use cuda_driver_sys::{cudaError_enum, CUresult};
use std::result::Result;
use thiserror::Error;

/// Failures reported by a [`DeviceBackend`](../backend/trait.DeviceBackend.html).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum BackendError {
    /// The device could not provide an allocation of the requested size.
    #[error("device allocation of {bytes} bytes failed")]
    OutOfMemory {
        /// Size of the failed request.
        bytes: usize,
    },

    /// An address handed to the backend does not belong to a live device allocation.
    #[error("{address:#x} is not a live device allocation")]
    InvalidDevicePointer {
        /// The offending address.
        address: usize,
    },

    /// A transfer starts inside a device allocation but runs past its end.
    #[error("transfer of {bytes} bytes at {address:#x} runs past its device allocation")]
    TransferOutOfRange {
        /// Start of the transfer on the device.
        address: usize,
        /// Length of the transfer.
        bytes: usize,
    },

    /// The CUDA driver returned an error status.
    #[cfg(feature = "cuda")]
    #[error("CUDA driver error {0:?}")]
    Cuda(CUresult),
}

/// Errors which can be returned by the memory manager.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum MemoryError {
    /// A null host pointer was offered for registration.
    #[error("cannot register a null host pointer")]
    NullPointer,

    /// The requested allocation is empty, or its byte count overflows.
    #[error("invalid memory allocation: zero-sized or overflowing byte count")]
    InvalidAllocation,

    /// The address (or part of the range) is already tracked.
    #[error("address {address:#x} is already registered")]
    DuplicateRegistration {
        /// The address that was registered twice.
        address: usize,
    },

    /// A handle no longer refers to a live block or alias.
    #[error("handle does not refer to a live registration")]
    UnknownHandle,

    /// An address which must be tracked is not.
    #[error("address {address:#x} is not registered")]
    UnknownAddress {
        /// The untracked address.
        address: usize,
    },

    /// An alias does not fall inside its owning block.
    #[error("alias offset {offset} is outside its {len}-byte block")]
    OutOfBoundsAlias {
        /// Requested byte offset (or end of the requested view).
        offset: usize,
        /// Length of the owning block.
        len: usize,
    },

    /// A transfer or copy range runs past the end of a tracked block.
    #[error("range of {bytes} bytes at offset {offset} exceeds the {len}-byte block")]
    OutOfBounds {
        /// Start of the range within the block.
        offset: usize,
        /// Length of the range.
        bytes: usize,
        /// Length of the block.
        len: usize,
    },

    /// A block was erased while aliases into it were still registered.
    #[error("block {address:#x} still has {count} live aliases")]
    LiveAliases {
        /// Host address of the block.
        address: usize,
        /// Number of aliases still registered.
        count: usize,
    },

    /// The device backend failed to allocate, copy or synchronize.
    #[error("device backend failure: {0}")]
    Backend(#[from] BackendError),
}

/// Result type for most memory manager operations.
pub type MemoryResult<T> = Result<T, MemoryError>;

/// Special result type for teardown functions which hand the value back on failure, so the
/// caller can retry or keep it alive.
pub type DropResult<T> = Result<(), (MemoryError, T)>;

/// Escalates memory manager errors into process-level failures.
///
/// ```should_panic
/// use hdmem::error::{Fatal, MemoryError, MemoryResult};
///
/// let result: MemoryResult<()> = Err(MemoryError::UnknownHandle);
/// result.or_fatal();
/// ```
pub trait Fatal<T> {
    /// Unwraps the value, or logs the violated invariant at `error` level and panics.
    fn or_fatal(self) -> T;
}
impl<T> Fatal<T> for MemoryResult<T> {
    #[track_caller]
    fn or_fatal(self) -> T {
        match self {
            Ok(value) => value,
            Err(e) => {
                error!("memory manager invariant violated: {}", e);
                panic!("memory manager invariant violated: {}", e)
            }
        }
    }
}

#[cfg(feature = "cuda")]
pub(crate) trait ToResult {
    fn to_result(self) -> MemoryResult<()>;
}
#[cfg(feature = "cuda")]
impl ToResult for CUresult {
    fn to_result(self) -> MemoryResult<()> {
        if self == cudaError_enum::CUDA_SUCCESS {
            Ok(())
        } else {
            Err(BackendError::Cuda(self).into())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_backend_errors_convert() {
        let e: MemoryError = BackendError::OutOfMemory { bytes: 64 }.into();
        assert_eq!(MemoryError::Backend(BackendError::OutOfMemory { bytes: 64 }), e);
        assert_eq!(
            "device backend failure: device allocation of 64 bytes failed",
            e.to_string()
        );
    }

    #[test]
    fn test_or_fatal_passes_values_through() {
        let result: MemoryResult<u32> = Ok(7);
        assert_eq!(7, result.or_fatal());
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn test_or_fatal_panics_with_diagnostic() {
        let result: MemoryResult<u32> = Err(MemoryError::DuplicateRegistration { address: 0x40 });
        let _ = result.or_fatal();
    }
}
