//! Device allocation and transfer primitives.
//!
//! The memory manager does not talk to an accelerator directly. It is parameterized over a
//! [`DeviceBackend`](trait.DeviceBackend.html), which allocates device buffers, moves bytes
//! across the host/device boundary and fences outstanding work.
//!
//! Two backends ship with hdmem:
//!
//! * [`HostBackend`](struct.HostBackend.html) emulates device memory in host memory. It is the
//!   default, needs no accelerator, and lets tests inspect and modify "device" contents.
//! * `CudaBackend` (cargo feature `cuda`) runs on the CUDA driver API.
//!
//! # Asynchronous transfers
//!
//! Transfers flagged with [`SyncFlags::ASYNC`](struct.SyncFlags.html) may return before the copy
//! has happened. The backend executes them in the order they were issued; the caller must call
//! [`synchronize`](trait.DeviceBackend.html#tymethod.synchronize) before reading the destination
//! or reusing the source. Synchronous transfers and frees are ordered after every earlier
//! asynchronous transfer.

mod host;
pub use self::host::*;

#[cfg(feature = "cuda")]
mod cuda;
#[cfg(feature = "cuda")]
pub use self::cuda::*;

use crate::error::MemoryResult;
use crate::memory::DevicePointer;
use std::fmt;

bitflags! {
    /// Bit flags modifying push, pull and copy requests.
    pub struct SyncFlags: u32 {
        /// No flags set. The transfer is complete when the call returns.
        const DEFAULT = 0x00;

        /// Enqueue the transfer and return without waiting for it. The destination must not be
        /// read, nor the source modified, until the backend has been synchronized.
        const ASYNC = 0x01;

        /// The side receiving a full-block push or pull will only be read until the next
        /// transfer, so both copies stay current afterwards.
        const READ_ONLY = 0x02;
    }
}

/// Primitives the memory manager needs from a device.
///
/// All device addresses are byte addresses. Implementations must execute transfers in issue
/// order and must order `free` after every transfer issued before it.
pub trait DeviceBackend {
    /// Opaque handle wrapping a device buffer for interop with other device-memory libraries.
    type Handle: fmt::Debug;

    /// Allocates `bytes` bytes of device memory.
    fn allocate(&mut self, bytes: usize) -> MemoryResult<DevicePointer<u8>>;

    /// Releases a buffer returned by [`allocate`](#tymethod.allocate).
    ///
    /// # Safety
    ///
    /// `ptr` must come from this backend's `allocate` and must not be used afterwards.
    unsafe fn free(&mut self, ptr: DevicePointer<u8>) -> MemoryResult<()>;

    /// Copies `bytes` bytes from host memory at `src` to device memory at `dst`.
    ///
    /// # Safety
    ///
    /// `src` must be valid for reads of `bytes` bytes until the copy has completed (for
    /// asynchronous copies, until the next `synchronize`).
    unsafe fn copy_host_to_device(
        &mut self,
        dst: DevicePointer<u8>,
        src: *const u8,
        bytes: usize,
        flags: SyncFlags,
    ) -> MemoryResult<()>;

    /// Copies `bytes` bytes from device memory at `src` to host memory at `dst`.
    ///
    /// # Safety
    ///
    /// `dst` must be valid for writes of `bytes` bytes until the copy has completed.
    unsafe fn copy_device_to_host(
        &mut self,
        dst: *mut u8,
        src: DevicePointer<u8>,
        bytes: usize,
        flags: SyncFlags,
    ) -> MemoryResult<()>;

    /// Copies `bytes` bytes between two device addresses. The ranges may overlap.
    ///
    /// # Safety
    ///
    /// Both ranges must lie inside live allocations of this backend.
    unsafe fn copy_device_to_device(
        &mut self,
        dst: DevicePointer<u8>,
        src: DevicePointer<u8>,
        bytes: usize,
        flags: SyncFlags,
    ) -> MemoryResult<()>;

    /// Waits until every transfer issued so far has completed.
    fn synchronize(&mut self) -> MemoryResult<()>;

    /// Wraps an existing device buffer in an interop handle.
    fn create_handle(&mut self, ptr: DevicePointer<u8>, bytes: usize)
        -> MemoryResult<Self::Handle>;
}
