use crate::backend::{DeviceBackend, SyncFlags};
use crate::context::MemoryContext;
use crate::error::{MemoryError, MemoryResult};
use crate::ledger::{Residency, Tracked};
use crate::memory::{Address, Target};
use std::ptr;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Direction {
    ToDevice,
    ToHost,
}
impl Direction {
    // The copy that is current after a full transfer in this direction.
    fn destination(self) -> Residency {
        match self {
            Direction::ToDevice => Residency::DEVICE,
            Direction::ToHost => Residency::HOST,
        }
    }
}

fn check_range(offset: usize, bytes: usize, len: usize) -> MemoryResult<()> {
    match offset.checked_add(bytes) {
        Some(end) if end <= len => Ok(()),
        _ => Err(MemoryError::OutOfBounds { offset, bytes, len }),
    }
}

// A typed target only covers its own elements, even when its block runs further.
fn check_extent<P: Target>(target: &P, bytes: usize) -> MemoryResult<()> {
    match target.extent() {
        Some(extent) => check_range(0, bytes, extent),
        None => Ok(()),
    }
}

impl<B: DeviceBackend> MemoryContext<B> {
    /// Makes the device copy of `target` current by copying host to device.
    ///
    /// `bytes = 0` covers the whole target: the typed length for allocations and views, and
    /// everything up to the end of the block for handles. Pushing a whole block whose device
    /// copy is already current does nothing. A partial push copies the requested range and
    /// leaves the block's residency alone.
    ///
    /// Does nothing if device support is disabled. The device buffer is allocated on first use.
    ///
    /// # Errors
    ///
    /// `UnknownHandle` for a stale target, `OutOfBounds` if the range runs past the end of the
    /// block (or of the typed allocation or view), and `Backend` if the allocation or copy fails.
    pub fn push<P: Target>(&mut self, target: P, bytes: usize, flags: SyncFlags) -> MemoryResult<()> {
        self.transfer(target, bytes, flags, Direction::ToDevice)
    }

    /// Makes the host copy of `target` current by copying device to host.
    ///
    /// The counterpart of [`push`](#method.push), with the same range and residency rules. A
    /// block that never had a device buffer has nothing to pull.
    pub fn pull<P: Target>(&mut self, target: P, bytes: usize, flags: SyncFlags) -> MemoryResult<()> {
        self.transfer(target, bytes, flags, Direction::ToHost)
    }

    /// Raw-address form of [`push`](#method.push). `ptr` must be a registered block or alias.
    pub fn push_ptr(&mut self, ptr: *const u8, bytes: usize, flags: SyncFlags) -> MemoryResult<()> {
        let target = self.tracked_at(ptr)?;
        self.push(target, bytes, flags)
    }

    /// Raw-address form of [`pull`](#method.pull). `ptr` must be a registered block or alias.
    pub fn pull_ptr(&mut self, ptr: *const u8, bytes: usize, flags: SyncFlags) -> MemoryResult<()> {
        let target = self.tracked_at(ptr)?;
        self.pull(target, bytes, flags)
    }

    /// Copies `bytes` bytes from `src` to `dst`, each of which may be a host or device address.
    ///
    /// Host to host copies run immediately on the calling thread, after any queued transfers;
    /// the others are issued on the backend and may be deferred if `flags` contains `ASYNC`.
    /// Residency is not updated.
    ///
    /// # Errors
    ///
    /// `OutOfBounds` if either address lies inside a tracked block (on its host or device side)
    /// and the range runs past the end of that block. Nothing is copied in that case.
    ///
    /// # Safety
    ///
    /// Addresses outside tracked blocks are not checked: both ranges must be valid for the
    /// copy. For asynchronous copies they must stay valid until the next
    /// [`synchronize`](#method.synchronize).
    pub unsafe fn copy(
        &mut self,
        dst: Address,
        src: Address,
        bytes: usize,
        flags: SyncFlags,
    ) -> MemoryResult<()> {
        if bytes == 0 {
            return Ok(());
        }
        self.check_address(dst, bytes)?;
        self.check_address(src, bytes)?;
        trace!("copying {} bytes from {} to {} ({:?})", bytes, src, dst, flags);
        match (dst, src) {
            (Address::Host(dst), Address::Host(src)) => {
                self.backend.synchronize()?;
                ptr::copy(src as *const u8, dst, bytes);
                Ok(())
            }
            (Address::Device(dst), Address::Host(src)) => {
                self.backend.copy_host_to_device(dst, src, bytes, flags)
            }
            (Address::Host(dst), Address::Device(src)) => {
                self.backend.copy_device_to_host(dst, src, bytes, flags)
            }
            (Address::Device(dst), Address::Device(src)) => {
                self.backend.copy_device_to_device(dst, src, bytes, flags)
            }
        }
    }

    /// Copies `bytes` bytes between two tracked targets at their currently valid addresses.
    ///
    /// Both ends are resolved first, so the bytes move between the authoritative copies and
    /// residency stays unchanged.
    ///
    /// ```
    /// use hdmem::prelude::*;
    ///
    /// let mut ctx = MemoryContext::new(HostBackend::new(), ContextFlags::DEVICE);
    /// let a = ctx.allocate::<u32>(8).unwrap();
    /// let b = ctx.allocate::<u32>(8).unwrap();
    /// ctx.host_slice_mut(&a).unwrap().copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
    ///
    /// let tail = ctx.view(&b, 4, 4).unwrap();
    /// ctx.copy_tracked(&tail, &a, 16, SyncFlags::DEFAULT).unwrap();
    /// assert_eq!(&[0, 0, 0, 0, 1, 2, 3, 4], ctx.host_slice(&b).unwrap());
    ///
    /// // Running past the end of `b` is refused.
    /// assert!(ctx.copy_tracked(&tail, &a, 20, SyncFlags::DEFAULT).is_err());
    /// # ctx.release_view(tail).unwrap();
    /// # ctx.release(a).unwrap();
    /// # ctx.release(b).unwrap();
    /// ```
    pub fn copy_tracked<D: Target, S: Target>(
        &mut self,
        dst: D,
        src: S,
        bytes: usize,
        flags: SyncFlags,
    ) -> MemoryResult<()> {
        check_extent(&dst, bytes)?;
        check_extent(&src, bytes)?;
        let (dst_block, dst_offset) = self.ledger.locate(dst.tracked())?;
        let (src_block, src_offset) = self.ledger.locate(src.tracked())?;
        check_range(dst_offset, bytes, self.ledger.block(dst_block)?.len())?;
        check_range(src_offset, bytes, self.ledger.block(src_block)?.len())?;
        let dst = self.resolve(dst)?;
        let src = self.resolve(src)?;
        unsafe { self.copy(dst, src, bytes, flags) }
    }

    /// The backend's interop handle for the block behind `target`.
    ///
    /// The device buffer and the handle are created on first use. Aliases share their block's
    /// handle.
    pub fn backend_handle<P: Target>(&mut self, target: P) -> MemoryResult<&B::Handle> {
        let (block, _) = self.ledger.locate(target.tracked())?;
        let device = self.device_ptr(block)?;
        let len = self.ledger.block(block)?.len();
        let slot = self.ledger.backend_handle_slot(block)?;
        if slot.is_none() {
            let handle = self.backend.create_handle(device, len)?;
            debug!("created backend handle {:?} for {:?}", handle, block);
            *slot = Some(handle);
        }
        slot.as_ref().ok_or(MemoryError::UnknownHandle)
    }

    /// Waits until every transfer issued so far has completed.
    pub fn synchronize(&mut self) -> MemoryResult<()> {
        self.backend.synchronize()
    }

    fn tracked_at(&self, ptr: *const u8) -> MemoryResult<Tracked> {
        self.lookup(ptr).ok_or(MemoryError::UnknownAddress {
            address: ptr as usize,
        })
    }

    fn check_address(&self, address: Address, bytes: usize) -> MemoryResult<()> {
        let found = match address {
            Address::Host(ptr) => self.ledger.containing_host(ptr as usize),
            Address::Device(ptr) => self.ledger.containing_device(ptr.addr()),
        };
        match found {
            Some((block, offset)) => check_range(offset, bytes, self.ledger.block(block)?.len()),
            None => Ok(()),
        }
    }

    fn transfer<P: Target>(
        &mut self,
        target: P,
        bytes: usize,
        flags: SyncFlags,
        direction: Direction,
    ) -> MemoryResult<()> {
        let (block, offset) = self.ledger.locate(target.tracked())?;
        let record = self.ledger.block(block)?;
        let (len, host, residency, attached) = (
            record.len(),
            record.host(),
            record.residency(),
            record.device().is_some(),
        );
        let bytes = if bytes == 0 {
            target.extent().unwrap_or(len - offset)
        } else {
            check_extent(&target, bytes)?;
            bytes
        };
        check_range(offset, bytes, len)?;

        if !self.is_device_enabled() {
            return Ok(());
        }
        let full = offset == 0 && bytes == len;
        if full && residency.contains(direction.destination()) {
            trace!("{:?} already current for {:?}", residency, block);
            return Ok(());
        }
        if direction == Direction::ToHost && !attached {
            return Ok(());
        }

        let device = self.device_ptr(block)?.wrapping_byte_add(offset);
        let host = unsafe { host.add(offset) };
        unsafe {
            match direction {
                Direction::ToDevice => self.backend.copy_host_to_device(device, host, bytes, flags)?,
                Direction::ToHost => self.backend.copy_device_to_host(host, device, bytes, flags)?,
            }
        }
        if full {
            let residency = if flags.contains(SyncFlags::READ_ONLY) {
                Residency::HOST | Residency::DEVICE
            } else {
                direction.destination()
            };
            self.ledger.set_residency(block, residency)?;
        }
        debug!(
            "{:?}: {} bytes at offset {} of {:?} ({:?})",
            direction, bytes, offset, block, flags
        );
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use crate::backend::{HostBackend, SyncFlags};
    use crate::context::{ContextFlags, MemoryContext};
    use crate::error::MemoryError;
    use crate::ledger::Residency;
    use crate::memory::Address;

    fn device_ctx() -> MemoryContext<HostBackend> {
        MemoryContext::new(HostBackend::new(), ContextFlags::DEVICE)
    }

    #[test]
    fn test_push_and_pull_follow_residency() {
        let mut data = vec![7u8; 64];
        let mut ctx = device_ctx();
        let block = unsafe { ctx.insert(data.as_mut_ptr(), 64) }.unwrap();

        ctx.push(block, 0, SyncFlags::DEFAULT).unwrap();
        assert_eq!(Residency::DEVICE, ctx.residency(block).unwrap());
        let device = ctx.resolve(block).unwrap().as_device().unwrap();
        assert_eq!(&[7u8; 64][..], ctx.backend().device_bytes(device, 64).unwrap());

        // The device copy is authoritative, so a second push must not overwrite it.
        ctx.backend_mut().device_bytes_mut(device, 64).unwrap()[0] = 42;
        ctx.push(block, 0, SyncFlags::DEFAULT).unwrap();
        assert_eq!(42, ctx.backend().device_bytes(device, 1).unwrap()[0]);

        ctx.pull(block, 0, SyncFlags::DEFAULT).unwrap();
        assert_eq!(Residency::HOST, ctx.residency(block).unwrap());
        assert_eq!(42, data[0]);
        assert!(ctx.resolve(block).unwrap().is_host());
    }

    #[test]
    fn test_read_only_push_keeps_both_current() {
        let mut data = vec![1u8; 16];
        let mut ctx = device_ctx();
        let block = unsafe { ctx.insert(data.as_mut_ptr(), 16) }.unwrap();

        ctx.push(block, 0, SyncFlags::READ_ONLY).unwrap();
        assert_eq!(Residency::HOST | Residency::DEVICE, ctx.residency(block).unwrap());
        assert!(ctx.resolve(block).unwrap().is_device());

        // Both copies are current: neither direction copies anything.
        let device = ctx.resolve(block).unwrap().as_device().unwrap();
        ctx.backend_mut().device_bytes_mut(device, 16).unwrap()[0] = 9;
        ctx.pull(block, 0, SyncFlags::DEFAULT).unwrap();
        assert_eq!(1, data[0]);
    }

    #[test]
    fn test_pull_without_device_buffer_is_noop() {
        let mut data = vec![3u8; 16];
        let mut ctx = device_ctx();
        let block = unsafe { ctx.insert(data.as_mut_ptr(), 16) }.unwrap();

        ctx.pull(block, 8, SyncFlags::DEFAULT).unwrap();
        assert_eq!(0, ctx.backend().live_allocations());
        assert_eq!(vec![3u8; 16], data);
    }

    #[test]
    fn test_transfer_range_checks() {
        let mut data = vec![0u8; 32];
        let mut ctx = device_ctx();
        let block = unsafe { ctx.insert(data.as_mut_ptr(), 32) }.unwrap();
        let alias = ctx.insert_alias(block, 24).unwrap();

        assert_eq!(
            Err(MemoryError::OutOfBounds {
                offset: 0,
                bytes: 33,
                len: 32
            }),
            ctx.push(block, 33, SyncFlags::DEFAULT)
        );
        assert_eq!(
            Err(MemoryError::OutOfBounds {
                offset: 24,
                bytes: 9,
                len: 32
            }),
            ctx.push(alias, 9, SyncFlags::DEFAULT)
        );
        // Defaults to the rest of the block.
        ctx.push(alias, 0, SyncFlags::DEFAULT).unwrap();
        assert_eq!(Residency::HOST, ctx.residency(alias).unwrap());
    }

    #[test]
    fn test_explicit_byte_count_stays_inside_view() {
        let mut ctx = device_ctx();
        let values = ctx.allocate::<u32>(8).unwrap();
        let other = ctx.allocate::<u32>(8).unwrap();
        let view = ctx.view(&values, 2, 2).unwrap();
        let too_long = Err(MemoryError::OutOfBounds {
            offset: 0,
            bytes: 12,
            len: 8,
        });

        // The block has room for 12 bytes past the view's start; the view does not.
        assert_eq!(too_long, ctx.synchronize_to_device(&view, Some(12)));
        assert_eq!(too_long, ctx.pull(&view, 12, SyncFlags::DEFAULT));
        assert_eq!(too_long, ctx.copy_tracked(&view, &other, 12, SyncFlags::DEFAULT));
        assert_eq!(too_long, ctx.copy_tracked(&other, &view, 12, SyncFlags::DEFAULT));
        assert_eq!(0, ctx.backend().live_allocations());

        ctx.synchronize_to_device(&view, Some(8)).unwrap();
        ctx.copy_tracked(&other, &view, 8, SyncFlags::DEFAULT).unwrap();
        ctx.release_view(view).unwrap();
        ctx.release(values).unwrap();
        ctx.release(other).unwrap();
    }

    #[test]
    fn test_disabled_transfers_are_noops() {
        let mut data = vec![0u8; 32];
        let mut ctx = MemoryContext::host_only();
        let block = unsafe { ctx.insert(data.as_mut_ptr(), 32) }.unwrap();

        ctx.push(block, 0, SyncFlags::DEFAULT).unwrap();
        ctx.pull(block, 0, SyncFlags::DEFAULT).unwrap();
        assert_eq!(0, ctx.backend().live_allocations());
        assert_eq!(Residency::HOST, ctx.residency(block).unwrap());
        // Range checks still apply.
        assert!(ctx.push(block, 64, SyncFlags::DEFAULT).is_err());
    }

    #[test]
    fn test_raw_pointer_transfers_require_registration() {
        let mut data = vec![0u8; 32];
        let ptr = data.as_mut_ptr();
        let mut ctx = device_ctx();
        let _ = unsafe { ctx.insert(ptr, 32) }.unwrap();

        assert_eq!(
            Err(MemoryError::UnknownAddress {
                address: ptr as usize + 8
            }),
            ctx.push_ptr(unsafe { ptr.add(8) }, 0, SyncFlags::DEFAULT)
        );
        ctx.push_ptr(ptr, 0, SyncFlags::DEFAULT).unwrap();
        ctx.pull_ptr(ptr, 0, SyncFlags::DEFAULT).unwrap();
    }

    #[test]
    fn test_async_push_lands_on_synchronize() {
        let mut data = vec![5u8; 16];
        let mut ctx = device_ctx();
        let block = unsafe { ctx.insert(data.as_mut_ptr(), 16) }.unwrap();

        ctx.push(block, 0, SyncFlags::ASYNC).unwrap();
        let device = ctx.resolve(block).unwrap().as_device().unwrap();
        assert_eq!(1, ctx.backend().pending());
        assert_eq!(&[0u8; 16][..], ctx.backend().device_bytes(device, 16).unwrap());

        ctx.synchronize().unwrap();
        assert_eq!(&[5u8; 16][..], ctx.backend().device_bytes(device, 16).unwrap());
    }

    #[test]
    fn test_raw_copy_checks_device_side_bounds() {
        let mut data = vec![0u8; 32];
        let mut other = vec![1u8; 64];
        let mut ctx = device_ctx();
        let block = unsafe { ctx.insert(data.as_mut_ptr(), 32) }.unwrap();
        ctx.push(block, 0, SyncFlags::DEFAULT).unwrap();
        let device = ctx.resolve(block).unwrap();

        let src = Address::Host(other.as_mut_ptr());
        assert_eq!(
            Err(MemoryError::OutOfBounds {
                offset: 16,
                bytes: 17,
                len: 32
            }),
            unsafe { ctx.copy(device.byte_add(16), src, 17, SyncFlags::DEFAULT) }
        );
        unsafe { ctx.copy(device.byte_add(16), src, 16, SyncFlags::DEFAULT) }.unwrap();
        let device = device.as_device().unwrap();
        let bytes = ctx.backend().device_bytes(device, 32).unwrap();
        assert_eq!(&[0u8; 16][..], &bytes[..16]);
        assert_eq!(&[1u8; 16][..], &bytes[16..]);
    }

    #[test]
    fn test_backend_handle_is_created_once() {
        let mut data = vec![0u8; 48];
        let mut ctx = device_ctx();
        let block = unsafe { ctx.insert(data.as_mut_ptr(), 48) }.unwrap();
        let alias = ctx.insert_alias(block, 16).unwrap();

        let handle = *ctx.backend_handle(block).unwrap();
        assert_eq!(48, handle.len());
        assert_eq!(handle, *ctx.backend_handle(alias).unwrap());
        assert_eq!(1, ctx.backend().live_allocations());
        assert_eq!(
            Some(handle.as_device_ptr()),
            ctx.ledger().block(block).unwrap().device()
        );
    }
}
