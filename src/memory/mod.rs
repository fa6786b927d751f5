//! Addresses and typed allocations.
//!
//! The memory module holds the vocabulary shared by the rest of hdmem: what an address is, what
//! can be tracked, and the typed entry points most consumers use instead of raw registration.
//!
//! # Addresses
//!
//! An [`Address`](enum.Address.html) is either a host pointer or a
//! [`DevicePointer`](struct.DevicePointer.html). Device pointers cannot be dereferenced on the
//! host; they are handed to device code or back to the backend. Resolving a tracked allocation
//! yields whichever address is valid for the active execution mode.
//!
//! # Typed allocations
//!
//! [`MemoryContext::allocate`](../context/struct.MemoryContext.html#method.allocate) creates
//! default-initialized host storage for `count` values of `T` and registers it in one step,
//! returning a [`TrackedPtr`](struct.TrackedPtr.html). A
//! [`TrackedView`](struct.TrackedView.html) is a registered sub-range of such an allocation; it
//! shares the allocation's storage and follows its residency.
//!
//! Host storage is never freed implicitly. A `TrackedPtr` which is dropped without being passed
//! to [`release`](../context/struct.MemoryContext.html#method.release) leaks its storage, and its
//! block stays registered until the context is dropped.
//!
//! # FFI Information
//!
//! `DevicePointer<T>` has the same representation as `*mut T` and can be passed through an FFI
//! boundary to code expecting raw device pointers. `TrackedPtr` and `TrackedView` are not
//! FFI-safe; resolve them to an `Address` first.

mod address;
mod typed;

pub use self::address::*;
pub use self::typed::*;
pub use hdmem_core::{DeviceCopy, DevicePointer};

use crate::ledger::{AliasHandle, BlockHandle, Tracked};
use crate::private::Sealed;

/// Anything that names a registration: block and alias handles, and typed allocations and views.
///
/// This trait is sealed and cannot be implemented outside of hdmem.
pub trait Target: Sealed {
    /// The registration this target refers to.
    fn tracked(&self) -> Tracked;

    /// Length in bytes covered by the target, if it is narrower than "up to the end of the
    /// block". Push and pull use it when no explicit byte count is given.
    fn extent(&self) -> Option<usize> {
        None
    }
}

impl Target for BlockHandle {
    fn tracked(&self) -> Tracked {
        Tracked::Block(*self)
    }
}
impl Target for AliasHandle {
    fn tracked(&self) -> Tracked {
        Tracked::Alias(*self)
    }
}
impl Target for Tracked {
    fn tracked(&self) -> Tracked {
        *self
    }
}
