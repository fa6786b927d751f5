use crate::memory::DeviceCopy;
use core::fmt;
use core::ptr;

/// An address in device memory.
///
/// A `DevicePointer` cannot be dereferenced by the host. It can be handed to device code (e.g.
/// as a kernel argument) or passed back to the memory manager, which knows how to translate it.
/// The representation is guaranteed to be the same as `*mut T`.
#[repr(transparent)]
#[derive(Debug, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct DevicePointer<T>(*mut T);
unsafe impl<T> DeviceCopy for DevicePointer<T> {}
impl<T> Clone for DevicePointer<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for DevicePointer<T> {}
impl<T> DevicePointer<T> {
    /// Returns a null device pointer.
    ///
    /// # Examples:
    ///
    /// ```
    /// use hdmem::memory::*;
    /// let ptr: DevicePointer<f64> = DevicePointer::null();
    /// assert!(ptr.is_null());
    /// ```
    pub fn null() -> Self {
        DevicePointer(ptr::null_mut())
    }

    /// Wrap the given raw address in a `DevicePointer`.
    ///
    /// # Safety
    ///
    /// The address must have been produced by a device allocator (or be null). Nothing checks
    /// this here, but handing a host address to a device copy routine is undefined behavior.
    pub unsafe fn wrap(ptr: *mut T) -> Self {
        DevicePointer(ptr)
    }

    /// Wrap a device address given as an integer, the way driver APIs usually report them.
    ///
    /// # Safety
    ///
    /// Same contract as [`wrap`](#method.wrap).
    pub unsafe fn from_addr(addr: usize) -> Self {
        DevicePointer(addr as *mut T)
    }

    /// Returns the contained pointer. It is not valid on the host and must not be dereferenced
    /// there.
    pub fn as_raw(&self) -> *const T {
        self.0
    }

    /// Returns the contained pointer as a mutable raw pointer. It is not valid on the host and
    /// must not be dereferenced there.
    pub fn as_raw_mut(&mut self) -> *mut T {
        self.0
    }

    /// Returns the address as an integer.
    ///
    /// ```
    /// use hdmem::memory::*;
    /// let ptr = unsafe { DevicePointer::<u32>::from_addr(0x1000) };
    /// assert_eq!(0x1000, ptr.addr());
    /// ```
    pub fn addr(&self) -> usize {
        self.0 as usize
    }

    /// Returns true if the pointer is null.
    pub fn is_null(&self) -> bool {
        self.0.is_null()
    }

    /// Offsets the pointer by `bytes` bytes using wrapping arithmetic.
    ///
    /// The result is only meaningful when it stays inside the same device allocation. Offsets
    /// are in bytes, not in units of `T`, because the memory manager tracks sub-views by byte
    /// offset.
    ///
    /// ```
    /// use hdmem::memory::*;
    /// let ptr = unsafe { DevicePointer::<f64>::from_addr(0x1000) };
    /// assert_eq!(0x1010, ptr.wrapping_byte_add(16).addr());
    /// ```
    pub fn wrapping_byte_add(self, bytes: usize) -> Self {
        DevicePointer((self.0 as *mut u8).wrapping_add(bytes) as *mut T)
    }

    /// Reinterprets the pointer as pointing to a `U`.
    pub fn cast<U>(self) -> DevicePointer<U> {
        DevicePointer(self.0 as *mut U)
    }
}
impl<T> fmt::Pointer for DevicePointer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Pointer::fmt(&self.0, f)
    }
}
