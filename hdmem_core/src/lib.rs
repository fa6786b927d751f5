//! hdmem-core is the minimal subset of hdmem which can be used from device-side crates.
//!
//! It holds the types that both sides of the host/device boundary need to agree on: the
//! [`DeviceCopy`](trait.DeviceCopy.html) marker trait and the
//! [`DevicePointer`](struct.DevicePointer.html) address type. See hdmem for full documentation.

#![no_std]
#![warn(
    missing_docs,
    missing_debug_implementations,
    unused_import_braces,
    unused_results,
    unused_qualifications
)]
#![allow(unknown_lints)]

mod memory;
pub use crate::memory::*;
