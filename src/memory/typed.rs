use crate::backend::{DeviceBackend, SyncFlags};
use crate::context::MemoryContext;
use crate::error::{DropResult, MemoryError, MemoryResult};
use crate::ledger::{AliasHandle, BlockHandle, Tracked};
use crate::memory::{Address, DeviceCopy, Target};
use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ptr::{self, NonNull};
use std::slice;

/// A registered host allocation of `len` values of type `T`.
///
/// Created by [`MemoryContext::allocate`](../context/struct.MemoryContext.html#method.allocate)
/// and destroyed by [`MemoryContext::release`](../context/struct.MemoryContext.html#method.release).
/// The pointer is deliberately not `Clone`: releasing it consumes it, so it cannot be released
/// twice.
pub struct TrackedPtr<T: DeviceCopy> {
    block: BlockHandle,
    host: NonNull<T>,
    len: usize,
}
impl<T: DeviceCopy> TrackedPtr<T> {
    /// The block handle of the allocation.
    pub fn block(&self) -> BlockHandle {
        self.block
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the allocation holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size of the allocation in bytes.
    pub fn byte_len(&self) -> usize {
        self.len * mem::size_of::<T>()
    }

    /// The host pointer the allocation was registered with.
    ///
    /// The pointer is only current on the host while the host copy is authoritative; use
    /// [`address_for_current_mode`](../context/struct.MemoryContext.html#method.address_for_current_mode)
    /// to get the address that is valid right now.
    pub fn as_host_ptr(&self) -> *mut T {
        self.host.as_ptr()
    }
}
impl<T: DeviceCopy> fmt::Debug for TrackedPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TrackedPtr")
            .field("block", &self.block)
            .field("host", &self.host)
            .field("len", &self.len)
            .finish()
    }
}

/// A registered sub-range of a [`TrackedPtr`](struct.TrackedPtr.html), starting at element
/// `first`.
///
/// The view shares the parent's storage: it resolves to the parent's current address plus its
/// byte offset. The parent cannot be released while the view is registered.
pub struct TrackedView<T: DeviceCopy> {
    alias: AliasHandle,
    first: usize,
    len: usize,
    _marker: PhantomData<*mut T>,
}
impl<T: DeviceCopy> TrackedView<T> {
    /// The alias handle of the view.
    pub fn alias(&self) -> AliasHandle {
        self.alias
    }

    /// Index of the first element of the view in its parent.
    pub fn first(&self) -> usize {
        self.first
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the view holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size of the view in bytes.
    pub fn byte_len(&self) -> usize {
        self.len * mem::size_of::<T>()
    }
}
impl<T: DeviceCopy> fmt::Debug for TrackedView<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TrackedView")
            .field("alias", &self.alias)
            .field("first", &self.first)
            .field("len", &self.len)
            .finish()
    }
}

impl<'a, T: DeviceCopy> Target for &'a TrackedPtr<T> {
    fn tracked(&self) -> Tracked {
        Tracked::Block(self.block)
    }

    fn extent(&self) -> Option<usize> {
        Some(self.byte_len())
    }
}
impl<'a, T: DeviceCopy> Target for &'a TrackedView<T> {
    fn tracked(&self) -> Tracked {
        Tracked::Alias(self.alias)
    }

    fn extent(&self) -> Option<usize> {
        Some(self.byte_len())
    }
}

/// Typed entry points.
impl<B: DeviceBackend> MemoryContext<B> {
    /// Allocates host storage for `count` default values of `T` and registers it.
    ///
    /// Returns `InvalidAllocation` if the allocation would be empty.
    ///
    /// # Examples
    ///
    /// ```
    /// use hdmem::prelude::*;
    ///
    /// let mut ctx = MemoryContext::host_only();
    /// let values = ctx.allocate::<f64>(100).unwrap();
    /// assert_eq!(800, ctx.len(&values).unwrap());
    /// ctx.release(values).unwrap();
    /// ```
    pub fn allocate<T: DeviceCopy + Clone + Default>(
        &mut self,
        count: usize,
    ) -> MemoryResult<TrackedPtr<T>> {
        let bytes = count
            .checked_mul(mem::size_of::<T>())
            .ok_or(MemoryError::InvalidAllocation)?;
        if bytes == 0 {
            return Err(MemoryError::InvalidAllocation);
        }
        let storage: Box<[T]> = vec![T::default(); count].into_boxed_slice();
        let host = Box::into_raw(storage) as *mut T;
        match unsafe { self.insert(host as *mut u8, bytes) } {
            Ok(block) => Ok(TrackedPtr {
                block,
                host: unsafe { NonNull::new_unchecked(host) },
                len: count,
            }),
            Err(e) => {
                unsafe { free_host(host, count) };
                Err(e)
            }
        }
    }

    /// Unregisters a typed allocation, releasing its device buffer, then frees its host storage.
    ///
    /// On failure (for instance while views into the allocation are still registered) the
    /// pointer is handed back untouched.
    ///
    /// A pointer issued by another context is rejected with `UnknownHandle` and nothing is
    /// erased.
    pub fn release<T: DeviceCopy>(&mut self, ptr: TrackedPtr<T>) -> DropResult<TrackedPtr<T>> {
        match self.ledger().block(ptr.block) {
            Ok(record) if record.host() as *mut T == ptr.host.as_ptr() => {}
            Ok(_) => return Err((MemoryError::UnknownHandle, ptr)),
            Err(e) => return Err((e, ptr)),
        }
        match self.erase(ptr.block) {
            Ok(_) => {
                unsafe { free_host(ptr.host.as_ptr(), ptr.len) };
                Ok(())
            }
            Err(e) => Err((e, ptr)),
        }
    }

    /// Registers a view of `count` elements of `ptr`, starting at element `first`.
    ///
    /// # Examples
    ///
    /// ```
    /// use hdmem::prelude::*;
    ///
    /// let mut ctx = MemoryContext::host_only();
    /// let values = ctx.allocate::<f64>(50).unwrap();
    /// let tail = ctx.view(&values, 20, 30).unwrap();
    ///
    /// let base = ctx.resolve(&values).unwrap();
    /// assert_eq!(base.byte_add(160), ctx.resolve(&tail).unwrap());
    ///
    /// ctx.release_view(tail).unwrap();
    /// ctx.release(values).unwrap();
    /// ```
    pub fn view<T: DeviceCopy>(
        &mut self,
        ptr: &TrackedPtr<T>,
        first: usize,
        count: usize,
    ) -> MemoryResult<TrackedView<T>> {
        let size = mem::size_of::<T>();
        let len = ptr.byte_len();
        let end = first
            .checked_add(count)
            .and_then(|end| end.checked_mul(size))
            .ok_or(MemoryError::InvalidAllocation)?;
        if count == 0 || size == 0 {
            return Err(MemoryError::InvalidAllocation);
        }
        if end > len {
            return Err(MemoryError::OutOfBoundsAlias { offset: end, len });
        }
        let alias = self.insert_alias(ptr.block, first * size)?;
        Ok(TrackedView {
            alias,
            first,
            len: count,
            _marker: PhantomData,
        })
    }

    /// Unregisters a view. The parent allocation is unaffected.
    pub fn release_view<T: DeviceCopy>(&mut self, view: TrackedView<T>) -> MemoryResult<()> {
        self.erase_alias(view.alias)
    }

    /// The address of `target` that is valid for the active execution mode.
    ///
    /// This is [`resolve`](#method.resolve) under the name used by code that only wants "the
    /// pointer to dereference right now".
    pub fn address_for_current_mode<P: Target>(&mut self, target: P) -> MemoryResult<Address> {
        self.resolve(target)
    }

    /// Makes the device copy of `target` current. `None` (or `Some(0)`) covers the whole target.
    pub fn synchronize_to_device<P: Target>(
        &mut self,
        target: P,
        bytes: Option<usize>,
    ) -> MemoryResult<()> {
        self.push(target, bytes.unwrap_or(0), SyncFlags::DEFAULT)
    }

    /// Makes the host copy of `target` current. `None` (or `Some(0)`) covers the whole target.
    pub fn synchronize_to_host<P: Target>(
        &mut self,
        target: P,
        bytes: Option<usize>,
    ) -> MemoryResult<()> {
        self.pull(target, bytes.unwrap_or(0), SyncFlags::DEFAULT)
    }

    /// The host storage of a typed allocation.
    ///
    /// The contents are only current if the host copy is authoritative; call
    /// [`synchronize_to_host`](#method.synchronize_to_host) first after device work.
    pub fn host_slice<T: DeviceCopy>(&self, ptr: &TrackedPtr<T>) -> MemoryResult<&[T]> {
        let _ = self.ledger().block(ptr.block)?;
        Ok(unsafe { slice::from_raw_parts(ptr.host.as_ptr(), ptr.len) })
    }

    /// Mutable access to the host storage of a typed allocation.
    ///
    /// Writes are not tracked. If the device copy is authoritative, push the host copy
    /// explicitly after writing or the writes will be overwritten by the next pull.
    pub fn host_slice_mut<T: DeviceCopy>(&mut self, ptr: &TrackedPtr<T>) -> MemoryResult<&mut [T]> {
        let _ = self.ledger().block(ptr.block)?;
        Ok(unsafe { slice::from_raw_parts_mut(ptr.host.as_ptr(), ptr.len) })
    }

    /// The host storage covered by a view.
    pub fn view_slice<T: DeviceCopy>(&self, view: &TrackedView<T>) -> MemoryResult<&[T]> {
        let host = self.view_host(view)?;
        Ok(unsafe { slice::from_raw_parts(host as *const T, view.len) })
    }

    /// Mutable access to the host storage covered by a view.
    pub fn view_slice_mut<T: DeviceCopy>(
        &mut self,
        view: &TrackedView<T>,
    ) -> MemoryResult<&mut [T]> {
        let host = self.view_host(view)?;
        Ok(unsafe { slice::from_raw_parts_mut(host as *mut T, view.len) })
    }

    // Host address of the view's first element, once the view is known to fit its block.
    fn view_host<T: DeviceCopy>(&self, view: &TrackedView<T>) -> MemoryResult<*mut u8> {
        let (block, offset) = self.ledger().locate(Tracked::Alias(view.alias))?;
        let record = self.ledger().block(block)?;
        let bytes = view.byte_len();
        match offset.checked_add(bytes) {
            Some(end) if end <= record.len() => Ok(unsafe { record.host().add(offset) }),
            _ => Err(MemoryError::OutOfBounds {
                offset,
                bytes,
                len: record.len(),
            }),
        }
    }
}

unsafe fn free_host<T>(host: *mut T, count: usize) {
    drop(Box::from_raw(ptr::slice_from_raw_parts_mut(host, count)));
}

/// Free-function form of [`MemoryContext::allocate`](../context/struct.MemoryContext.html#method.allocate).
pub fn allocate<T, B>(ctx: &mut MemoryContext<B>, count: usize) -> MemoryResult<TrackedPtr<T>>
where
    T: DeviceCopy + Clone + Default,
    B: DeviceBackend,
{
    ctx.allocate(count)
}

/// Free-function form of [`MemoryContext::release`](../context/struct.MemoryContext.html#method.release).
pub fn release<T, B>(ctx: &mut MemoryContext<B>, ptr: TrackedPtr<T>) -> DropResult<TrackedPtr<T>>
where
    T: DeviceCopy,
    B: DeviceBackend,
{
    ctx.release(ptr)
}

/// Free-function form of
/// [`MemoryContext::address_for_current_mode`](../context/struct.MemoryContext.html#method.address_for_current_mode).
pub fn address_for_current_mode<P: Target, B: DeviceBackend>(
    ctx: &mut MemoryContext<B>,
    target: P,
) -> MemoryResult<Address> {
    ctx.address_for_current_mode(target)
}

/// Free-function form of
/// [`MemoryContext::synchronize_to_device`](../context/struct.MemoryContext.html#method.synchronize_to_device).
pub fn synchronize_to_device<P: Target, B: DeviceBackend>(
    ctx: &mut MemoryContext<B>,
    target: P,
    bytes: Option<usize>,
) -> MemoryResult<()> {
    ctx.synchronize_to_device(target, bytes)
}

/// Free-function form of
/// [`MemoryContext::synchronize_to_host`](../context/struct.MemoryContext.html#method.synchronize_to_host).
pub fn synchronize_to_host<P: Target, B: DeviceBackend>(
    ctx: &mut MemoryContext<B>,
    target: P,
    bytes: Option<usize>,
) -> MemoryResult<()> {
    ctx.synchronize_to_host(target, bytes)
}

/// Free-function form of
/// [`MemoryContext::backend_handle`](../context/struct.MemoryContext.html#method.backend_handle).
pub fn backend_handle<P: Target, B: DeviceBackend>(
    ctx: &mut MemoryContext<B>,
    target: P,
) -> MemoryResult<&B::Handle> {
    ctx.backend_handle(target)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::HostBackend;
    use crate::context::ContextFlags;
    use crate::ledger::Residency;

    fn device_ctx() -> MemoryContext<HostBackend> {
        MemoryContext::new(HostBackend::new(), ContextFlags::DEVICE)
    }

    #[test]
    fn test_allocate_registers_default_values() {
        let mut ctx = device_ctx();
        let values = ctx.allocate::<u64>(16).unwrap();
        assert_eq!(1, ctx.ledger().len());
        assert_eq!(128, ctx.len(&values).unwrap());
        assert!(ctx.host_slice(&values).unwrap().iter().all(|&x| x == 0));
        ctx.release(values).unwrap();
        assert!(ctx.ledger().is_empty());
    }

    #[test]
    fn test_allocate_rejects_empty() {
        let mut ctx = device_ctx();
        assert_eq!(
            MemoryError::InvalidAllocation,
            ctx.allocate::<u32>(0).unwrap_err()
        );
        assert_eq!(
            MemoryError::InvalidAllocation,
            ctx.allocate::<()>(8).unwrap_err()
        );
    }

    #[test]
    fn test_release_with_live_view_hands_pointer_back() {
        let mut ctx = device_ctx();
        let values = ctx.allocate::<f32>(10).unwrap();
        let view = ctx.view(&values, 2, 4).unwrap();

        let (err, values) = ctx.release(values).unwrap_err();
        assert_eq!(
            MemoryError::LiveAliases {
                address: values.as_host_ptr() as usize,
                count: 1
            },
            err
        );

        ctx.release_view(view).unwrap();
        ctx.release(values).unwrap();
    }

    #[test]
    fn test_view_bounds() {
        let mut ctx = device_ctx();
        let values = ctx.allocate::<u32>(10).unwrap();
        assert_eq!(
            MemoryError::OutOfBoundsAlias { offset: 44, len: 40 },
            ctx.view(&values, 8, 3).unwrap_err()
        );
        assert_eq!(
            MemoryError::InvalidAllocation,
            ctx.view(&values, 2, 0).unwrap_err()
        );
        let whole = ctx.view(&values, 0, 10).unwrap();
        ctx.release_view(whole).unwrap();
        ctx.release(values).unwrap();
    }

    #[test]
    fn test_view_sync_is_partial() {
        let mut ctx = device_ctx();
        let values = ctx.allocate::<u32>(8).unwrap();
        ctx.host_slice_mut(&values)
            .unwrap()
            .copy_from_slice(&[0, 1, 2, 3, 4, 5, 6, 7]);
        let view = ctx.view(&values, 4, 2).unwrap();

        ctx.synchronize_to_device(&view, None).unwrap();
        assert_eq!(Residency::HOST, ctx.residency(&values).unwrap());

        let device = ctx.ledger().block(values.block()).unwrap().device().unwrap();
        let bytes = ctx.backend().device_bytes(device, 32).unwrap();
        assert_eq!(&[0u8; 16][..], &bytes[..16]);
        assert_eq!(&4u32.to_ne_bytes()[..], &bytes[16..20]);
        assert_eq!(&5u32.to_ne_bytes()[..], &bytes[20..24]);
        assert_eq!(&[0u8; 8][..], &bytes[24..]);

        assert_eq!(&[4, 5], ctx.view_slice(&view).unwrap());
        ctx.release_view(view).unwrap();
        ctx.release(values).unwrap();
    }

    #[test]
    fn test_released_block_handle_is_unknown() {
        let mut ctx = device_ctx();
        let values = ctx.allocate::<u8>(4).unwrap();
        let block = values.block();
        ctx.release(values).unwrap();
        assert_eq!(
            Err(MemoryError::UnknownHandle),
            ctx.resolve(block).map(|_| ())
        );
    }
}
