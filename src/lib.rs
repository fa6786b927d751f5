//! A host/device memory manager.
//!
//! hdmem lets array data be allocated once on the host and used from either host code or a
//! device execution path, without the owning data structures knowing which path is active. It
//! keeps a ledger of registered host allocations, mirrors each one lazily into device memory,
//! tracks which copy is authoritative, and resolves any tracked allocation (or a registered
//! sub-view of one) to the address that is valid right now.
//!
//! # Overview
//!
//! All state lives in a [`MemoryContext`](context/struct.MemoryContext.html), which is created
//! explicitly and passed to every consumer. The context is parameterized over a
//! [`DeviceBackend`](backend/trait.DeviceBackend.html) that provides device allocation and
//! transfers; [`HostBackend`](backend/struct.HostBackend.html) emulates a device in host memory
//! and the `cuda` cargo feature adds a backend on the CUDA driver API.
//!
//! ```
//! use hdmem::prelude::*;
//!
//! let mut ctx = MemoryContext::new(HostBackend::new(), ContextFlags::DEVICE);
//! let x = ctx.allocate::<f64>(100).unwrap();
//! ctx.host_slice_mut(&x).unwrap().iter_mut().enumerate().for_each(|(i, v)| *v = i as f64);
//!
//! // Before launching device work: make the device copy current and get its address.
//! ctx.synchronize_to_device(&x, None).unwrap();
//! let device = ctx.address_for_current_mode(&x).unwrap();
//! assert!(device.is_device());
//!
//! // After device work: bring the result back.
//! ctx.synchronize_to_host(&x, None).unwrap();
//! assert_eq!(99.0, ctx.host_slice(&x).unwrap()[99]);
//! ctx.release(x).unwrap();
//! ```
//!
//! # Errors
//!
//! Every failure is a broken address mapping and is returned as a
//! [`MemoryError`](error/enum.MemoryError.html). Callers without a recovery strategy terminate
//! through [`Fatal::or_fatal`](error/trait.Fatal.html).
//!
//! # Logging
//!
//! hdmem logs through the `log` facade and never installs a logger itself. Registration,
//! allocation and transfers are logged at `debug`, address resolution at `trace`.

#![warn(
    missing_docs,
    missing_debug_implementations,
    unused_import_braces,
    unused_results,
    unused_qualifications
)]
// Allow clippy lints
#![allow(unknown_lints)]

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate log;

#[cfg(feature = "cuda")]
extern crate cuda_driver_sys;

#[allow(unused_imports)]
#[macro_use]
extern crate hdmem_derive;
#[doc(hidden)]
pub use hdmem_derive::*;

pub mod backend;
pub mod context;
pub mod error;
pub mod ledger;
pub mod memory;
pub mod prelude;
pub(crate) mod private;

mod derive_compile_fail;
