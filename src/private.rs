//! This module contains private sealed traits that should not be used or implemented outside of
//! hdmem. These traits are public because they are used as bounds in certain functions.
//! These traits may change in any way at any time with no warning, and this will not be considered
//! a breaking change.

use crate::ledger::{AliasHandle, BlockHandle, Tracked};
use crate::memory::{DeviceCopy, TrackedPtr, TrackedView};

pub trait Sealed {}

impl Sealed for BlockHandle {}
impl Sealed for AliasHandle {}
impl Sealed for Tracked {}
impl<'a, T: DeviceCopy> Sealed for &'a TrackedPtr<T> {}
impl<'a, T: DeviceCopy> Sealed for &'a TrackedView<T> {}
