mod pointer;
pub use self::pointer::*;

use core::marker::PhantomData;
use core::num::*;

/// Marker trait for element types which may live in memory mirrored between host and device.
///
/// A type is `DeviceCopy` if a bitwise copy of its value is a valid value on the other side of
/// the host/device boundary. That rules out references, boxes and anything else which points
/// into host-only memory, and anything implementing `Drop`: the memory manager moves raw bytes
/// and never runs destructors for tracked storage.
///
/// ## Implementing DeviceCopy
///
/// The derive checks that every field is itself `DeviceCopy`:
///
/// ```
/// use hdmem::DeviceCopy;
///
/// #[derive(Clone, Default, DeviceCopy)]
/// struct Node {
///     coords: [f64; 3],
///     marker: u32,
/// }
/// ```
///
/// Fields that point back into host memory are rejected at compile time:
///
/// ```compile_fail
/// use hdmem::DeviceCopy;
///
/// #[derive(Clone, DeviceCopy)]
/// struct Rows(Vec<f64>);
/// ```
///
/// The trait may also be implemented by hand, in which case upholding the contract above is the
/// implementor's responsibility:
///
/// ```
/// use hdmem::memory::DeviceCopy;
///
/// #[derive(Clone)]
/// #[repr(C)]
/// struct Stencil(i32, i32);
///
/// unsafe impl DeviceCopy for Stencil {}
/// ```
pub unsafe trait DeviceCopy {}

macro_rules! impl_device_copy {
    ($($t:ty)*) => {
        $(
            unsafe impl DeviceCopy for $t {}
        )*
    }
}

impl_device_copy!(
    usize u8 u16 u32 u64 u128
    isize i8 i16 i32 i64 i128
    f32 f64
    bool char

    NonZeroU8 NonZeroU16 NonZeroU32 NonZeroU64 NonZeroU128 NonZeroUsize
    NonZeroI8 NonZeroI16 NonZeroI32 NonZeroI64 NonZeroI128 NonZeroIsize
);
unsafe impl DeviceCopy for () {}
unsafe impl<T: DeviceCopy> DeviceCopy for Option<T> {}
unsafe impl<T: ?Sized + DeviceCopy> DeviceCopy for PhantomData<T> {}
unsafe impl<T: DeviceCopy> DeviceCopy for Wrapping<T> {}
unsafe impl<T: DeviceCopy, const N: usize> DeviceCopy for [T; N] {}

macro_rules! impl_device_copy_tuple {
    ($(($($name:ident),+))*) => {
        $(
            unsafe impl<$($name: DeviceCopy),+> DeviceCopy for ($($name,)+) {}
        )*
    }
}

impl_device_copy_tuple! {
    (A)
    (A, B)
    (A, B, C)
    (A, B, C, D)
    (A, B, C, D, E)
    (A, B, C, D, E, F)
    (A, B, C, D, E, F, G)
    (A, B, C, D, E, F, G, H)
}
