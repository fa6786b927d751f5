//! Device backend on the CUDA driver API.

use crate::backend::{DeviceBackend, SyncFlags};
use crate::error::{BackendError, DropResult, MemoryResult, ToResult};
use crate::memory::DevicePointer;
use cuda_driver_sys::{
    cuMemAlloc_v2, cuMemFree_v2, cuMemcpyDtoDAsync_v2, cuMemcpyDtoD_v2, cuMemcpyDtoHAsync_v2,
    cuMemcpyDtoH_v2, cuMemcpyHtoDAsync_v2, cuMemcpyHtoD_v2, cuStreamCreate, cuStreamDestroy_v2,
    cuStreamSynchronize, cudaError_enum, CUdeviceptr, CUstream,
};
use std::mem;
use std::os::raw::c_void;
use std::ptr;

// CU_STREAM_NON_BLOCKING: the transfer stream does not synchronize with the legacy NULL stream.
const STREAM_NON_BLOCKING: u32 = 0x01;

/// Device backend on the CUDA driver API.
///
/// All transfers are issued on a single non-blocking stream owned by the backend, so they
/// execute in issue order. Synchronous transfers and frees wait for that stream first.
///
/// A CUDA context must be current on the calling thread for the lifetime of the backend; the
/// backend does not initialize the driver or create contexts itself.
#[derive(Debug)]
pub struct CudaBackend {
    stream: CUstream,
}

/// Interop handle produced by [`CudaBackend`](struct.CudaBackend.html): the raw device pointer
/// and size, as third-party CUDA libraries expect them.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CudaHandle {
    ptr: CUdeviceptr,
    bytes: usize,
}
impl CudaHandle {
    /// The raw `CUdeviceptr`.
    pub fn as_raw(&self) -> CUdeviceptr {
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

fn raw(ptr: DevicePointer<u8>) -> CUdeviceptr {
    ptr.addr() as CUdeviceptr
}

impl CudaBackend {
    /// Creates a backend with its own transfer stream in the current CUDA context.
    pub fn new() -> MemoryResult<Self> {
        let mut backend = CudaBackend {
            stream: ptr::null_mut(),
        };
        unsafe {
            cuStreamCreate(&mut backend.stream as *mut CUstream, STREAM_NON_BLOCKING).to_result()?;
        }
        Ok(backend)
    }

    /// The stream transfers are issued on, for ordering kernel launches against them.
    pub fn stream(&self) -> CUstream {
        self.stream
    }

    /// Destroy the backend's stream, returning an error.
    ///
    /// Destroying a stream can report errors from earlier asynchronous work. On failure the error
    /// and the un-destroyed backend are handed back.
    pub fn drop(mut backend: CudaBackend) -> DropResult<CudaBackend> {
        if backend.stream.is_null() {
            return Ok(());
        }
        unsafe {
            let stream = mem::replace(&mut backend.stream, ptr::null_mut());
            match cuStreamDestroy_v2(stream).to_result() {
                Ok(()) => {
                    mem::forget(backend);
                    Ok(())
                }
                Err(e) => Err((e, CudaBackend { stream })),
            }
        }
    }
}

impl DeviceBackend for CudaBackend {
    type Handle = CudaHandle;

    fn allocate(&mut self, bytes: usize) -> MemoryResult<DevicePointer<u8>> {
        let mut ptr: CUdeviceptr = 0;
        unsafe {
            match cuMemAlloc_v2(&mut ptr as *mut CUdeviceptr, bytes) {
                cudaError_enum::CUDA_ERROR_OUT_OF_MEMORY => {
                    return Err(BackendError::OutOfMemory { bytes }.into())
                }
                status => status.to_result()?,
            }
            Ok(DevicePointer::from_addr(ptr as usize))
        }
    }

    unsafe fn free(&mut self, ptr: DevicePointer<u8>) -> MemoryResult<()> {
        self.synchronize()?;
        cuMemFree_v2(raw(ptr)).to_result()
    }

    unsafe fn copy_host_to_device(
        &mut self,
        dst: DevicePointer<u8>,
        src: *const u8,
        bytes: usize,
        flags: SyncFlags,
    ) -> MemoryResult<()> {
        if flags.contains(SyncFlags::ASYNC) {
            cuMemcpyHtoDAsync_v2(raw(dst), src as *const c_void, bytes, self.stream).to_result()
        } else {
            self.synchronize()?;
            cuMemcpyHtoD_v2(raw(dst), src as *const c_void, bytes).to_result()
        }
    }

    unsafe fn copy_device_to_host(
        &mut self,
        dst: *mut u8,
        src: DevicePointer<u8>,
        bytes: usize,
        flags: SyncFlags,
    ) -> MemoryResult<()> {
        if flags.contains(SyncFlags::ASYNC) {
            cuMemcpyDtoHAsync_v2(dst as *mut c_void, raw(src), bytes, self.stream).to_result()
        } else {
            self.synchronize()?;
            cuMemcpyDtoH_v2(dst as *mut c_void, raw(src), bytes).to_result()
        }
    }

    unsafe fn copy_device_to_device(
        &mut self,
        dst: DevicePointer<u8>,
        src: DevicePointer<u8>,
        bytes: usize,
        flags: SyncFlags,
    ) -> MemoryResult<()> {
        if flags.contains(SyncFlags::ASYNC) {
            cuMemcpyDtoDAsync_v2(raw(dst), raw(src), bytes, self.stream).to_result()
        } else {
            self.synchronize()?;
            cuMemcpyDtoD_v2(raw(dst), raw(src), bytes).to_result()
        }
    }

    fn synchronize(&mut self) -> MemoryResult<()> {
        unsafe { cuStreamSynchronize(self.stream).to_result() }
    }

    fn create_handle(&mut self, ptr: DevicePointer<u8>, bytes: usize) -> MemoryResult<CudaHandle> {
        Ok(CudaHandle {
            ptr: raw(ptr),
            bytes,
        })
    }
}

impl Drop for CudaBackend {
    fn drop(&mut self) {
        if self.stream.is_null() {
            return;
        }
        unsafe {
            let stream = mem::replace(&mut self.stream, ptr::null_mut());
            if let Err(e) = cuStreamDestroy_v2(stream).to_result() {
                warn!("failed to destroy CUDA transfer stream: {}", e);
            }
        }
    }
}
