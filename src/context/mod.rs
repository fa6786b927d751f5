//! The memory context: registration, resolution and synchronization of tracked memory.
//!
//! A [`MemoryContext`](struct.MemoryContext.html) owns the [`Ledger`](../ledger/struct.Ledger.html)
//! of tracked allocations and the [`DeviceBackend`](../backend/trait.DeviceBackend.html) that
//! provides device memory. Everything that needs to know where an array currently lives is
//! handed a reference to the context; there is no global instance.
//!
//! # Execution modes
//!
//! A context is created with device support enabled or disabled
//! ([`ContextFlags::DEVICE`](struct.ContextFlags.html)). With device support disabled every
//! tracked allocation resolves to its host address and push/pull are no-ops, so code written
//! against the context runs unchanged on machines without an accelerator.
//!
//! With device support enabled, each block records which copy is authoritative (its
//! [`Residency`](../ledger/struct.Residency.html)). Resolving a block returns its host address
//! while only the host copy is current, and its device address (allocating the device buffer on
//! first use) once a push has made the device copy current.
//!
//! # Teardown
//!
//! Dropping the context waits for outstanding transfers and releases every device buffer still
//! attached to a block. Host storage is never freed by the context. Use
//! [`MemoryContext::drop`](struct.MemoryContext.html#method.drop) to observe teardown errors.

mod transfer;

use crate::backend::{DeviceBackend, HostBackend};
use crate::error::{DropResult, MemoryError, MemoryResult};
use crate::ledger::{AliasHandle, BlockHandle, Ledger, Residency, Tracked};
use crate::memory::{Address, DevicePointer, Target};
use std::fmt;

bitflags! {
    /// Bit flags for initializing a memory context.
    pub struct ContextFlags: u32 {
        /// Device support disabled: everything resolves to host memory.
        const DEFAULT = 0x00;

        /// Device support enabled.
        const DEVICE = 0x01;
    }
}

/// Tracks host allocations and their device mirrors.
///
/// # Examples
///
/// ```
/// use hdmem::prelude::*;
///
/// let mut data = vec![0u8; 64];
/// let mut ctx = MemoryContext::new(HostBackend::new(), ContextFlags::DEVICE);
///
/// let block = unsafe { ctx.insert(data.as_mut_ptr(), data.len()) }.unwrap();
/// assert_eq!(Address::Host(data.as_mut_ptr()), ctx.resolve(block).unwrap());
///
/// ctx.push(block, 0, SyncFlags::DEFAULT).unwrap();
/// assert!(ctx.resolve(block).unwrap().is_device());
///
/// ctx.pull(block, 0, SyncFlags::DEFAULT).unwrap();
/// assert_eq!(data.as_mut_ptr(), ctx.erase(block).unwrap());
/// ```
pub struct MemoryContext<B: DeviceBackend = HostBackend> {
    ledger: Ledger<B::Handle>,
    backend: B,
    flags: ContextFlags,
}

impl MemoryContext<HostBackend> {
    /// Creates a context with device support disabled, over an emulated backend.
    pub fn host_only() -> Self {
        MemoryContext::new(HostBackend::new(), ContextFlags::DEFAULT)
    }
}

impl<B: DeviceBackend> MemoryContext<B> {
    /// Creates a context over `backend`.
    pub fn new(backend: B, flags: ContextFlags) -> Self {
        debug!("creating memory context with flags {:?}", flags);
        MemoryContext {
            ledger: Ledger::new(),
            backend,
            flags,
        }
    }

    /// The flags the context currently runs with.
    pub fn flags(&self) -> ContextFlags {
        self.flags
    }

    /// Returns true if device support is enabled.
    pub fn is_device_enabled(&self) -> bool {
        self.flags.contains(ContextFlags::DEVICE)
    }

    /// Enables or disables device support.
    ///
    /// Switching does not move any data. Pull device-resident blocks before disabling device
    /// support, or their host copies stay stale.
    pub fn set_device_enabled(&mut self, enabled: bool) {
        self.flags.set(ContextFlags::DEVICE, enabled);
    }

    /// Read-only access to the tracked allocations.
    pub fn ledger(&self) -> &Ledger<B::Handle> {
        &self.ledger
    }

    /// The device backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Mutable access to the device backend.
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Finds the block or alias registered at exactly `ptr`.
    pub fn lookup(&self, ptr: *const u8) -> Option<Tracked> {
        self.ledger.find(ptr as usize)
    }

    /// Registers `bytes` bytes of caller-owned host memory at `host`.
    ///
    /// # Errors
    ///
    /// `NullPointer` for a null `host`, `InvalidAllocation` for an empty or overflowing range and
    /// `DuplicateRegistration` if the address is already tracked or the range overlaps a tracked
    /// block.
    ///
    /// # Safety
    ///
    /// `host` must be valid for reads and writes of `bytes` bytes until the block is erased, and
    /// must not be accessed through other pointers while a transfer involving it is in flight.
    pub unsafe fn insert(&mut self, host: *mut u8, bytes: usize) -> MemoryResult<BlockHandle> {
        let block = self.ledger.insert_block(host, bytes)?;
        debug!("registered {} bytes at {:p} as {:?}", bytes, host, block);
        Ok(block)
    }

    /// Registers an alias `offset` bytes into `block`.
    pub fn insert_alias(&mut self, block: BlockHandle, offset: usize) -> MemoryResult<AliasHandle> {
        let alias = self.ledger.insert_alias(block, offset)?;
        debug!("registered alias {:?} at offset {} of {:?}", alias, offset, block);
        Ok(alias)
    }

    /// Registers the address `ptr`, which must lie inside a tracked block, as an alias.
    ///
    /// # Errors
    ///
    /// `UnknownAddress` if no block contains `ptr`, and `DuplicateRegistration` if `ptr` is
    /// already registered (including the block's own address).
    pub fn insert_alias_at(&mut self, ptr: *const u8) -> MemoryResult<AliasHandle> {
        let address = ptr as usize;
        match self.ledger.containing_host(address) {
            Some((_, 0)) => Err(MemoryError::DuplicateRegistration { address }),
            Some((block, offset)) => self.insert_alias(block, offset),
            None => Err(MemoryError::UnknownAddress { address }),
        }
    }

    /// Unregisters a block and returns its host pointer.
    ///
    /// The device buffer, if one was ever allocated, is released first. The host storage remains
    /// owned by the caller.
    ///
    /// # Errors
    ///
    /// `UnknownHandle` if the block is not registered (for instance because it was already
    /// erased), `LiveAliases` if aliases into the block are still registered. The ledger is left
    /// unchanged on error.
    pub fn erase(&mut self, block: BlockHandle) -> MemoryResult<*mut u8> {
        let record = self.ledger.block(block)?;
        if !record.aliases().is_empty() {
            return Err(MemoryError::LiveAliases {
                address: record.host() as usize,
                count: record.aliases().len(),
            });
        }
        if let Some(device) = record.device() {
            unsafe { self.backend.free(device)? };
            self.ledger.detach_device(block)?;
        }
        let record = self.ledger.remove_block(block)?;
        debug!("erased {:?} at {:p}", block, record.host());
        Ok(record.host())
    }

    /// Unregisters the block registered at `ptr`. See [`erase`](#method.erase).
    pub fn erase_ptr(&mut self, ptr: *const u8) -> MemoryResult<*mut u8> {
        match self.lookup(ptr) {
            Some(Tracked::Block(block)) => self.erase(block),
            _ => Err(MemoryError::UnknownAddress {
                address: ptr as usize,
            }),
        }
    }

    /// Unregisters an alias.
    pub fn erase_alias(&mut self, alias: AliasHandle) -> MemoryResult<()> {
        let _ = self.ledger.remove_alias(alias)?;
        debug!("erased alias {:?}", alias);
        Ok(())
    }

    /// Unregisters the alias registered at `ptr`.
    pub fn erase_alias_ptr(&mut self, ptr: *const u8) -> MemoryResult<()> {
        match self.lookup(ptr) {
            Some(Tracked::Alias(alias)) => self.erase_alias(alias),
            _ => Err(MemoryError::UnknownAddress {
                address: ptr as usize,
            }),
        }
    }

    /// Returns the address of `target` that is valid for the active execution mode.
    ///
    /// With device support disabled this is always the host address. Otherwise a block resolves
    /// to its host address while only the host copy is current, and to its device address
    /// (allocated on first use) as soon as the device copy is. An alias resolves to its block's
    /// address plus its offset.
    pub fn resolve<P: Target>(&mut self, target: P) -> MemoryResult<Address> {
        let (block, offset) = self.ledger.locate(target.tracked())?;
        let record = self.ledger.block(block)?;
        let (host, residency) = (record.host(), record.residency());
        let base = if !self.is_device_enabled() || residency == Residency::HOST {
            Address::Host(host)
        } else {
            Address::Device(self.device_ptr(block)?)
        };
        let address = base.byte_add(offset);
        trace!("resolved {:?} to {}", target.tracked(), address);
        Ok(address)
    }

    /// Raw-address form of [`resolve`](#method.resolve).
    ///
    /// Addresses that are neither a block nor an alias are returned unchanged; an untracked
    /// pointer is not an error.
    pub fn resolve_ptr(&mut self, ptr: *mut u8) -> MemoryResult<Address> {
        if !self.is_device_enabled() {
            return Ok(Address::Host(ptr));
        }
        match self.lookup(ptr) {
            Some(tracked) => self.resolve(tracked),
            None => Ok(Address::Host(ptr)),
        }
    }

    /// Which copies of the block behind `target` are current.
    pub fn residency<P: Target>(&self, target: P) -> MemoryResult<Residency> {
        let (block, _) = self.ledger.locate(target.tracked())?;
        Ok(self.ledger.block(block)?.residency())
    }

    /// Length of `target` in bytes. Handles cover everything up to the end of their block.
    pub fn len<P: Target>(&self, target: P) -> MemoryResult<usize> {
        let (block, offset) = self.ledger.locate(target.tracked())?;
        let len = self.ledger.block(block)?.len();
        Ok(target.extent().unwrap_or(len - offset))
    }

    /// Destroy a `MemoryContext`, returning an error.
    ///
    /// Waits for outstanding transfers and releases every device buffer. Blocks whose device
    /// copy was authoritative lose it; pull them first. On failure the context is handed back
    /// with the buffers that were not yet released.
    ///
    /// # Example
    ///
    /// ```
    /// use hdmem::prelude::*;
    ///
    /// let ctx = MemoryContext::new(HostBackend::new(), ContextFlags::DEVICE);
    /// match MemoryContext::drop(ctx) {
    ///     Ok(()) => println!("Successfully destroyed"),
    ///     Err((e, ctx)) => {
    ///         println!("Failed to destroy memory context: {:?}", e);
    ///         // Do something with ctx
    ///     },
    /// }
    /// ```
    pub fn drop(mut ctx: MemoryContext<B>) -> DropResult<MemoryContext<B>> {
        match ctx.release_device_buffers() {
            Ok(()) => Ok(()),
            Err(e) => Err((e, ctx)),
        }
    }

    fn device_ptr(&mut self, block: BlockHandle) -> MemoryResult<DevicePointer<u8>> {
        let record = self.ledger.block(block)?;
        if let Some(device) = record.device() {
            return Ok(device);
        }
        let bytes = record.len();
        let device = self.backend.allocate(bytes)?;
        self.ledger.attach_device(block, device)?;
        debug!("allocated {} device bytes at {:p} for {:?}", bytes, device, block);
        Ok(device)
    }

    // Frees every attached buffer even if some fail. Each failure is logged and the first one is
    // returned; buffers that failed to free stay attached.
    fn release_device_buffers(&mut self) -> MemoryResult<()> {
        let mut first = None;
        if let Err(e) = self.backend.synchronize() {
            warn!("failed to synchronize before releasing device buffers: {}", e);
            first = Some(e);
        }
        let attached: Vec<(BlockHandle, DevicePointer<u8>)> = self
            .ledger
            .blocks()
            .filter_map(|(handle, block)| block.device().map(|device| (handle, device)))
            .collect();
        for (block, device) in attached {
            let released = unsafe { self.backend.free(device) }
                .and_then(|()| self.ledger.detach_device(block));
            if let Err(e) = released {
                warn!("failed to release device buffer {:p} of {:?}: {}", device, block, e);
                first.get_or_insert(e);
            }
        }
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl<B: DeviceBackend> Drop for MemoryContext<B> {
    fn drop(&mut self) {
        let _ = self.release_device_buffers();
    }
}

impl<B: DeviceBackend + fmt::Debug> fmt::Debug for MemoryContext<B> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MemoryContext")
            .field("flags", &self.flags)
            .field("blocks", &self.ledger.len())
            .field("aliases", &self.ledger.alias_count())
            .field("backend", &self.backend)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::SyncFlags;
    use crate::error::BackendError;

    fn device_ctx() -> MemoryContext<HostBackend> {
        MemoryContext::new(HostBackend::new(), ContextFlags::DEVICE)
    }

    #[test]
    fn test_erase_releases_device_buffer() {
        let mut data = vec![0u8; 32];
        let mut ctx = device_ctx();
        let block = unsafe { ctx.insert(data.as_mut_ptr(), 32) }.unwrap();
        ctx.push(block, 0, SyncFlags::DEFAULT).unwrap();
        assert_eq!(1, ctx.backend().live_allocations());

        assert_eq!(data.as_mut_ptr(), ctx.erase(block).unwrap());
        assert_eq!(0, ctx.backend().live_allocations());
        assert_eq!(Err(MemoryError::UnknownHandle), ctx.erase(block));
    }

    #[test]
    fn test_erase_by_pointer() {
        let mut data = vec![0u8; 32];
        let ptr = data.as_mut_ptr();
        let mut ctx = device_ctx();
        let _ = unsafe { ctx.insert(ptr, 32) }.unwrap();
        let alias = ctx.insert_alias_at(unsafe { ptr.add(4) }).unwrap();

        assert_eq!(
            Err(MemoryError::UnknownAddress {
                address: ptr as usize + 4
            }),
            ctx.erase_ptr(unsafe { ptr.add(4) })
        );
        ctx.erase_alias_ptr(unsafe { ptr.add(4) }).unwrap();
        assert_eq!(Err(MemoryError::UnknownHandle), ctx.erase_alias(alias));
        assert_eq!(Ok(ptr), ctx.erase_ptr(ptr));
        assert_eq!(None, ctx.lookup(ptr));
    }

    #[test]
    fn test_insert_alias_at_rejects_block_address_and_untracked() {
        let mut data = vec![0u8; 16];
        let mut other = vec![0u8; 16];
        let ptr = data.as_mut_ptr();
        let mut ctx = device_ctx();
        let _ = unsafe { ctx.insert(ptr, 16) }.unwrap();

        assert_eq!(
            Err(MemoryError::DuplicateRegistration {
                address: ptr as usize
            }),
            ctx.insert_alias_at(ptr)
        );
        assert_eq!(
            Err(MemoryError::UnknownAddress {
                address: other.as_mut_ptr() as usize
            }),
            ctx.insert_alias_at(other.as_mut_ptr())
        );
    }

    #[test]
    fn test_resolve_allocates_device_buffer_once() {
        let mut data = vec![0u8; 16];
        let mut ctx = device_ctx();
        let block = unsafe { ctx.insert(data.as_mut_ptr(), 16) }.unwrap();

        // Host-only residency never needs a device buffer.
        assert!(ctx.resolve(block).unwrap().is_host());
        assert_eq!(0, ctx.backend().live_allocations());

        ctx.push(block, 0, SyncFlags::DEFAULT).unwrap();
        let first = ctx.resolve(block).unwrap();
        let second = ctx.resolve(block).unwrap();
        assert_eq!(first, second);
        assert_eq!(1, ctx.backend().live_allocations());
    }

    #[test]
    fn test_toggling_device_support() {
        let mut data = vec![0u8; 16];
        let ptr = data.as_mut_ptr();
        let mut ctx = device_ctx();
        let block = unsafe { ctx.insert(ptr, 16) }.unwrap();
        ctx.push(block, 0, SyncFlags::DEFAULT).unwrap();

        ctx.set_device_enabled(false);
        assert_eq!(Address::Host(ptr), ctx.resolve(block).unwrap());
        assert_eq!(Address::Host(ptr), ctx.resolve_ptr(ptr).unwrap());
        ctx.set_device_enabled(true);
        assert!(ctx.resolve_ptr(ptr).unwrap().is_device());
    }

    #[test]
    fn test_explicit_drop_releases_everything() {
        let mut data = vec![0u8; 16];
        let mut ctx = device_ctx();
        let block = unsafe { ctx.insert(data.as_mut_ptr(), 16) }.unwrap();
        ctx.push(block, 0, SyncFlags::ASYNC).unwrap();
        assert_eq!(1, ctx.backend().pending());

        let result = ctx.release_device_buffers();
        assert_eq!(Ok(()), result);
        assert_eq!(0, ctx.backend().pending());
        assert_eq!(0, ctx.backend().live_allocations());
        assert_eq!(Residency::HOST, ctx.residency(block).unwrap());
        assert!(MemoryContext::drop(ctx).is_ok());
    }

    #[test]
    fn test_teardown_continues_past_failed_free() {
        let mut data = vec![0u8; 64];
        let ptr = data.as_mut_ptr();
        let mut ctx = device_ctx();
        let blocks: Vec<BlockHandle> = (0..4)
            .map(|i| unsafe { ctx.insert(ptr.add(i * 16), 16) }.unwrap())
            .collect();
        for &block in &blocks {
            ctx.push(block, 0, SyncFlags::DEFAULT).unwrap();
        }
        assert_eq!(4, ctx.backend().live_allocations());

        // Free the first buffer behind the ledger's back.
        let lost = ctx.ledger().block(blocks[0]).unwrap().device().unwrap();
        unsafe { ctx.backend_mut().free(lost) }.unwrap();

        assert_eq!(
            Err(MemoryError::Backend(BackendError::InvalidDevicePointer {
                address: lost.addr()
            })),
            ctx.release_device_buffers()
        );
        assert_eq!(0, ctx.backend().live_allocations());
        for &block in &blocks[1..] {
            assert!(ctx.ledger().block(block).unwrap().device().is_none());
        }
        assert!(ctx.ledger().block(blocks[0]).unwrap().device().is_some());
    }
}
