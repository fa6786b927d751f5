//! This module is a dummy module. It contains doctests that should fail to compile. It's used for
//! testing the DeviceCopy custom-derive macro and should not contain any actual code.
//!
//! ```compile_fail
//! use hdmem::DeviceCopy;
//!
//! #[derive(Clone, DeviceCopy)]
//! struct ShouldFailTuple(Vec<u64>);
//! ```
//!
//! ```compile_fail
//! use hdmem::DeviceCopy;
//!
//! #[derive(Clone, DeviceCopy)]
//! struct ShouldFailStruct{v: Vec<u64>}
//! ```
//!
//! ```compile_fail
//! use hdmem::DeviceCopy;
//!
//! #[derive(Clone, DeviceCopy)]
//! enum ShouldFailTupleEnum {
//!     Unit,
//!     Tuple(Vec<u64>),
//! }
//! ```
//!
//! ```compile_fail
//! use hdmem::DeviceCopy;
//!
//! #[derive(Clone, DeviceCopy)]
//! enum ShouldFailStructEnum {
//!     Unit,
//!     Struct{v: Vec<u64>},
//! }
//! ```
//!
//! ```compile_fail
//! use hdmem::DeviceCopy;
//!
//! #[derive(Copy, Clone, DeviceCopy)]
//! union ShouldFailUnion {
//!     u: *const u64,
//!     o: *const i64,
//! }
//! ```
//!
//! A typed allocation cannot be released twice, since release consumes it:
//!
//! ```compile_fail
//! use hdmem::prelude::*;
//!
//! let mut ctx = MemoryContext::host_only();
//! let values = ctx.allocate::<u32>(4).unwrap();
//! ctx.release(values).unwrap();
//! ctx.release(values).unwrap();
//! ```
