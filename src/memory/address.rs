use crate::memory::DevicePointer;
use std::fmt;

/// A byte address in either host or device memory.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Address {
    /// An address in host memory.
    Host(*mut u8),
    /// An address in device memory. It must not be dereferenced on the host.
    Device(DevicePointer<u8>),
}
impl Address {
    /// Returns true if this is a host address.
    pub fn is_host(&self) -> bool {
        match self {
            Address::Host(_) => true,
            Address::Device(_) => false,
        }
    }

    /// Returns true if this is a device address.
    pub fn is_device(&self) -> bool {
        !self.is_host()
    }

    /// The host pointer, if this is a host address.
    pub fn as_host(&self) -> Option<*mut u8> {
        match *self {
            Address::Host(ptr) => Some(ptr),
            Address::Device(_) => None,
        }
    }

    /// The device pointer, if this is a device address.
    pub fn as_device(&self) -> Option<DevicePointer<u8>> {
        match *self {
            Address::Host(_) => None,
            Address::Device(ptr) => Some(ptr),
        }
    }

    /// The numeric value of the address.
    pub fn addr(&self) -> usize {
        match *self {
            Address::Host(ptr) => ptr as usize,
            Address::Device(ptr) => ptr.addr(),
        }
    }

    /// Offsets the address by `bytes` bytes in the same memory.
    ///
    /// This uses wrapping arithmetic and is always safe; whether the result points into a live
    /// allocation is up to the caller.
    pub fn byte_add(self, bytes: usize) -> Self {
        match self {
            Address::Host(ptr) => Address::Host(ptr.wrapping_add(bytes)),
            Address::Device(ptr) => Address::Device(ptr.wrapping_byte_add(bytes)),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Address::Host(ptr) => write!(f, "host {:p}", *ptr),
            Address::Device(ptr) => write!(f, "device {:p}", ptr),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_byte_add_stays_in_the_same_memory() {
        let mut data = [0u8; 16];
        let host = Address::Host(data.as_mut_ptr());
        assert_eq!(Address::Host(unsafe { data.as_mut_ptr().add(8) }), host.byte_add(8));

        let device = Address::Device(unsafe { DevicePointer::from_addr(0x1000) });
        let moved = device.byte_add(0x20);
        assert!(moved.is_device());
        assert_eq!(0x1020, moved.addr());
        assert_eq!(None, moved.as_host());
    }
}
