use crate::backend::{DeviceBackend, SyncFlags};
use crate::error::{BackendError, MemoryError, MemoryResult};
use crate::memory::{DeviceCopy, DevicePointer};
use std::alloc::{self, Layout};
use std::collections::{BTreeMap, VecDeque};
use std::mem;
use std::ptr;
use std::slice;

/// Alignment of emulated device allocations, matching what device allocators guarantee.
pub const DEVICE_ALIGNMENT: usize = 256;

/// Device backend emulated in host memory.
///
/// Each device allocation is a separate, zero-initialized, 256-byte aligned host allocation, so
/// "device" addresses never coincide with the host buffers they mirror. Asynchronous transfers
/// are queued and run, in order, on the next [`synchronize`](#method.synchronize), synchronous
/// transfer or free. This matches the ordering guarantees of a real device queue closely enough
/// to exercise fence discipline in tests.
///
/// The device contents can be inspected and modified directly, which is how tests stand in for
/// device kernels:
///
/// ```
/// use hdmem::prelude::*;
///
/// let mut ctx = MemoryContext::new(HostBackend::new(), ContextFlags::DEVICE);
/// let values = ctx.allocate::<u32>(4).unwrap();
/// ctx.host_slice_mut(&values).unwrap().copy_from_slice(&[1, 2, 3, 4]);
/// ctx.synchronize_to_device(&values, None).unwrap();
///
/// // A "kernel" doubling every element.
/// let device = ctx.resolve(&values).unwrap().as_device().unwrap();
/// for x in unsafe { ctx.backend_mut().device_slice_mut::<u32>(device, 4).unwrap() } {
///     *x *= 2;
/// }
///
/// ctx.synchronize_to_host(&values, None).unwrap();
/// assert_eq!(&[2, 4, 6, 8], ctx.host_slice(&values).unwrap());
/// ctx.release(values).unwrap();
/// ```
#[derive(Debug)]
pub struct HostBackend {
    allocations: BTreeMap<usize, usize>,
    queue: VecDeque<Transfer>,
    capacity: Option<usize>,
    in_use: usize,
}

#[derive(Debug, Clone, Copy)]
struct Transfer {
    dst: *mut u8,
    src: *const u8,
    bytes: usize,
}

/// Interop handle produced by [`HostBackend`](struct.HostBackend.html).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HostHandle {
    ptr: DevicePointer<u8>,
    bytes: usize,
}
impl HostHandle {
    /// The device buffer this handle wraps.
    pub fn as_device_ptr(&self) -> DevicePointer<u8> {
        self.ptr
    }

    /// Size of the wrapped buffer in bytes.
    pub fn len(&self) -> usize {
        self.bytes
    }

    /// Returns true if the wrapped buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.bytes == 0
    }
}

impl HostBackend {
    /// Creates an emulated device with unlimited memory.
    pub fn new() -> Self {
        HostBackend {
            allocations: BTreeMap::new(),
            queue: VecDeque::new(),
            capacity: None,
            in_use: 0,
        }
    }

    /// Creates an emulated device which fails allocations beyond `bytes` bytes in total.
    pub fn with_capacity(bytes: usize) -> Self {
        let mut backend = HostBackend::new();
        backend.capacity = Some(bytes);
        backend
    }

    /// Number of live device allocations.
    pub fn live_allocations(&self) -> usize {
        self.allocations.len()
    }

    /// Total bytes of live device allocations.
    pub fn bytes_in_use(&self) -> usize {
        self.in_use
    }

    /// Number of queued asynchronous transfers that have not run yet.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Reads `len` bytes of device memory at `ptr`.
    ///
    /// Queued asynchronous transfers are not reflected until the backend is synchronized.
    pub fn device_bytes(&self, ptr: DevicePointer<u8>, len: usize) -> MemoryResult<&[u8]> {
        self.check(ptr, len)?;
        Ok(unsafe { slice::from_raw_parts(ptr.as_raw(), len) })
    }

    /// Mutable access to `len` bytes of device memory at `ptr`, standing in for a device kernel.
    pub fn device_bytes_mut(
        &mut self,
        ptr: DevicePointer<u8>,
        len: usize,
    ) -> MemoryResult<&mut [u8]> {
        self.check(ptr, len)?;
        let mut ptr = ptr;
        Ok(unsafe { slice::from_raw_parts_mut(ptr.as_raw_mut(), len) })
    }

    /// Mutable typed access to `count` elements of device memory at `ptr`.
    ///
    /// # Safety
    ///
    /// The bytes at `ptr` must hold valid values of `T`. Zero-initialized memory and memory
    /// written from `T`s on the host both qualify for the primitive numeric types.
    pub unsafe fn device_slice_mut<T: DeviceCopy>(
        &mut self,
        ptr: DevicePointer<u8>,
        count: usize,
    ) -> MemoryResult<&mut [T]> {
        let bytes = count
            .checked_mul(mem::size_of::<T>())
            .ok_or(MemoryError::InvalidAllocation)?;
        if ptr.addr() % mem::align_of::<T>() != 0 {
            return Err(BackendError::InvalidDevicePointer {
                address: ptr.addr(),
            }
            .into());
        }
        self.check(ptr, bytes)?;
        Ok(slice::from_raw_parts_mut(ptr.cast::<T>().as_raw_mut(), count))
    }

    fn check(&self, ptr: DevicePointer<u8>, bytes: usize) -> MemoryResult<()> {
        let addr = ptr.addr();
        let (&base, &len) = self
            .allocations
            .range(..=addr)
            .next_back()
            .filter(|&(&base, &len)| addr - base < len)
            .ok_or(BackendError::InvalidDevicePointer { address: addr })?;
        match (addr - base).checked_add(bytes) {
            Some(end) if end <= len => Ok(()),
            _ => Err(BackendError::TransferOutOfRange {
                address: addr,
                bytes,
            }
            .into()),
        }
    }

    fn flush(&mut self) {
        while let Some(transfer) = self.queue.pop_front() {
            unsafe { ptr::copy(transfer.src, transfer.dst, transfer.bytes) };
        }
    }

    unsafe fn submit(&mut self, transfer: Transfer, flags: SyncFlags) {
        if flags.contains(SyncFlags::ASYNC) {
            self.queue.push_back(transfer);
        } else {
            self.flush();
            ptr::copy(transfer.src, transfer.dst, transfer.bytes);
        }
    }
}

impl Default for HostBackend {
    fn default() -> Self {
        HostBackend::new()
    }
}

impl DeviceBackend for HostBackend {
    type Handle = HostHandle;

    fn allocate(&mut self, bytes: usize) -> MemoryResult<DevicePointer<u8>> {
        if bytes == 0 {
            return Err(MemoryError::InvalidAllocation);
        }
        if let Some(capacity) = self.capacity {
            if capacity - self.in_use < bytes {
                return Err(BackendError::OutOfMemory { bytes }.into());
            }
        }
        let layout = Layout::from_size_align(bytes, DEVICE_ALIGNMENT)
            .map_err(|_| MemoryError::InvalidAllocation)?;
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(BackendError::OutOfMemory { bytes }.into());
        }
        let _ = self.allocations.insert(ptr as usize, bytes);
        self.in_use += bytes;
        trace!("emulated device allocation of {} bytes at {:p}", bytes, ptr);
        Ok(unsafe { DevicePointer::wrap(ptr) })
    }

    unsafe fn free(&mut self, ptr: DevicePointer<u8>) -> MemoryResult<()> {
        self.flush();
        let bytes = self
            .allocations
            .remove(&ptr.addr())
            .ok_or(BackendError::InvalidDevicePointer {
                address: ptr.addr(),
            })?;
        self.in_use -= bytes;
        let mut ptr = ptr;
        alloc::dealloc(
            ptr.as_raw_mut(),
            Layout::from_size_align_unchecked(bytes, DEVICE_ALIGNMENT),
        );
        Ok(())
    }

    unsafe fn copy_host_to_device(
        &mut self,
        dst: DevicePointer<u8>,
        src: *const u8,
        bytes: usize,
        flags: SyncFlags,
    ) -> MemoryResult<()> {
        self.check(dst, bytes)?;
        let mut dst = dst;
        self.submit(
            Transfer {
                dst: dst.as_raw_mut(),
                src,
                bytes,
            },
            flags,
        );
        Ok(())
    }

    unsafe fn copy_device_to_host(
        &mut self,
        dst: *mut u8,
        src: DevicePointer<u8>,
        bytes: usize,
        flags: SyncFlags,
    ) -> MemoryResult<()> {
        self.check(src, bytes)?;
        self.submit(
            Transfer {
                dst,
                src: src.as_raw(),
                bytes,
            },
            flags,
        );
        Ok(())
    }

    unsafe fn copy_device_to_device(
        &mut self,
        dst: DevicePointer<u8>,
        src: DevicePointer<u8>,
        bytes: usize,
        flags: SyncFlags,
    ) -> MemoryResult<()> {
        self.check(dst, bytes)?;
        self.check(src, bytes)?;
        let mut dst = dst;
        self.submit(
            Transfer {
                dst: dst.as_raw_mut(),
                src: src.as_raw(),
                bytes,
            },
            flags,
        );
        Ok(())
    }

    fn synchronize(&mut self) -> MemoryResult<()> {
        self.flush();
        Ok(())
    }

    fn create_handle(&mut self, ptr: DevicePointer<u8>, bytes: usize) -> MemoryResult<HostHandle> {
        self.check(ptr, bytes)?;
        Ok(HostHandle { ptr, bytes })
    }
}

impl Drop for HostBackend {
    fn drop(&mut self) {
        self.flush();
        for (base, bytes) in mem::replace(&mut self.allocations, BTreeMap::new()) {
            unsafe {
                alloc::dealloc(
                    base as *mut u8,
                    Layout::from_size_align_unchecked(bytes, DEVICE_ALIGNMENT),
                );
            }
        }
    }
}
