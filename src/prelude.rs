//! This module re-exports a number of commonly-used types for working with hdmem.
//!
//! This allows the user to `use hdmem::prelude::*;` and have the most commonly-used types
//! available quickly.

pub use crate::backend::{DeviceBackend, HostBackend, SyncFlags};
pub use crate::context::{ContextFlags, MemoryContext};
pub use crate::error::{Fatal, MemoryError, MemoryResult};
pub use crate::ledger::{AliasHandle, BlockHandle, Residency};
pub use crate::memory::{Address, DeviceCopy, DevicePointer, TrackedPtr, TrackedView};
