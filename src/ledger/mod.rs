//! Bookkeeping for tracked allocations.
//!
//! The ledger is the single source of truth for what the memory manager tracks. It holds two
//! kinds of records: [`MemoryBlock`](struct.MemoryBlock.html)s, one per registered host
//! allocation, and [`Alias`](struct.Alias.html)es, byte-offset views into a block. Records are
//! stored in generation-checked arenas and addressed by [`BlockHandle`](struct.BlockHandle.html)
//! and [`AliasHandle`](struct.AliasHandle.html); a handle outliving its record is detected
//! rather than silently reused.
//!
//! Raw addresses are indexed as well, so pointer-based callers can still be served: blocks by
//! host address and by device address (ordered, so the block containing an arbitrary address is
//! a range query) and aliases by their own address. An address is never both a block address
//! and an alias address.
//!
//! The ledger applies no policy. It is reachable read-only through
//! [`MemoryContext::ledger`](../context/struct.MemoryContext.html#method.ledger) for
//! diagnostics; all mutation goes through the context.

mod arena;

use self::arena::{Arena, Key};
use crate::error::{MemoryError, MemoryResult};
use crate::memory::DevicePointer;
use std::collections::{BTreeMap, HashMap};

bitflags! {
    /// Which copies of a block currently hold its authoritative contents.
    ///
    /// `HOST | DEVICE` means both copies are current. A freshly registered block is `HOST`.
    pub struct Residency: u8 {
        /// The host copy is current.
        const HOST = 0b01;
        /// The device copy is current.
        const DEVICE = 0b10;
    }
}

/// Identifies a registered block.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct BlockHandle(Key);

/// Identifies a registered alias.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct AliasHandle(Key);

/// Either kind of registration.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum Tracked {
    /// A whole block.
    Block(BlockHandle),
    /// A view into a block.
    Alias(AliasHandle),
}
impl From<BlockHandle> for Tracked {
    fn from(handle: BlockHandle) -> Self {
        Tracked::Block(handle)
    }
}
impl From<AliasHandle> for Tracked {
    fn from(handle: AliasHandle) -> Self {
        Tracked::Alias(handle)
    }
}

/// One tracked host allocation and its lazily created device counterpart.
#[derive(Debug)]
pub struct MemoryBlock<H> {
    host: *mut u8,
    len: usize,
    device: Option<DevicePointer<u8>>,
    handle: Option<H>,
    residency: Residency,
    aliases: Vec<AliasHandle>,
}
impl<H> MemoryBlock<H> {
    /// The host address the block was registered with.
    pub fn host(&self) -> *mut u8 {
        self.host
    }

    /// Length of the block in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// The device buffer, if one has been allocated yet.
    pub fn device(&self) -> Option<DevicePointer<u8>> {
        self.device
    }

    /// The backend interop handle, if one has been created yet.
    pub fn backend_handle(&self) -> Option<&H> {
        self.handle.as_ref()
    }

    /// Which copies are current.
    pub fn residency(&self) -> Residency {
        self.residency
    }

    /// Aliases registered into this block, in no particular order.
    pub fn aliases(&self) -> &[AliasHandle] {
        &self.aliases
    }

    fn contains(&self, base: usize, addr: usize) -> bool {
        addr >= base && addr - base < self.len
    }
}

/// A byte-offset view into a block.
#[derive(Clone, Copy, Debug)]
pub struct Alias {
    block: BlockHandle,
    offset: usize,
}
impl Alias {
    /// The block this alias points into.
    pub fn block(&self) -> BlockHandle {
        self.block
    }

    /// Byte offset into the owning block.
    pub fn offset(&self) -> usize {
        self.offset
    }
}

/// The block and alias tables.
#[derive(Debug)]
pub struct Ledger<H> {
    blocks: Arena<MemoryBlock<H>>,
    aliases: Arena<Alias>,
    blocks_by_host: BTreeMap<usize, BlockHandle>,
    blocks_by_device: BTreeMap<usize, BlockHandle>,
    aliases_by_addr: HashMap<usize, AliasHandle>,
}
impl<H> Ledger<H> {
    pub(crate) fn new() -> Self {
        Ledger {
            blocks: Arena::new(),
            aliases: Arena::new(),
            blocks_by_host: BTreeMap::new(),
            blocks_by_device: BTreeMap::new(),
            aliases_by_addr: HashMap::new(),
        }
    }

    /// Number of registered blocks.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Returns true if no block is registered.
    pub fn is_empty(&self) -> bool {
        self.blocks.len() == 0
    }

    /// Number of registered aliases.
    pub fn alias_count(&self) -> usize {
        self.aliases.len()
    }

    /// Looks up a block record.
    pub fn block(&self, handle: BlockHandle) -> MemoryResult<&MemoryBlock<H>> {
        self.blocks.get(handle.0).ok_or(MemoryError::UnknownHandle)
    }

    pub(crate) fn block_mut(&mut self, handle: BlockHandle) -> MemoryResult<&mut MemoryBlock<H>> {
        self.blocks.get_mut(handle.0).ok_or(MemoryError::UnknownHandle)
    }

    /// Looks up an alias record.
    pub fn alias(&self, handle: AliasHandle) -> MemoryResult<&Alias> {
        self.aliases.get(handle.0).ok_or(MemoryError::UnknownHandle)
    }

    /// Iterates over all registered blocks.
    pub fn blocks(&self) -> impl Iterator<Item = (BlockHandle, &MemoryBlock<H>)> {
        self.blocks.iter().map(|(key, block)| (BlockHandle(key), block))
    }

    /// Finds the registration whose address is exactly `addr`.
    pub fn find(&self, addr: usize) -> Option<Tracked> {
        if let Some(&block) = self.blocks_by_host.get(&addr) {
            return Some(Tracked::Block(block));
        }
        self.aliases_by_addr.get(&addr).map(|&alias| Tracked::Alias(alias))
    }

    /// Finds the block whose host range contains `addr`, with the byte offset of `addr` in it.
    pub fn containing_host(&self, addr: usize) -> Option<(BlockHandle, usize)> {
        let (&base, &handle) = self.blocks_by_host.range(..=addr).next_back()?;
        let block = self.blocks.get(handle.0)?;
        if block.contains(base, addr) {
            Some((handle, addr - base))
        } else {
            None
        }
    }

    /// Finds the block whose device buffer contains `addr`, with the byte offset of `addr` in it.
    pub fn containing_device(&self, addr: usize) -> Option<(BlockHandle, usize)> {
        let (&base, &handle) = self.blocks_by_device.range(..=addr).next_back()?;
        let block = self.blocks.get(handle.0)?;
        if block.contains(base, addr) {
            Some((handle, addr - base))
        } else {
            None
        }
    }

    /// Reduces a registration to its block and the byte offset into it.
    pub fn locate(&self, target: Tracked) -> MemoryResult<(BlockHandle, usize)> {
        match target {
            Tracked::Block(block) => self.block(block).map(|_| (block, 0)),
            Tracked::Alias(alias) => {
                let alias = self.alias(alias)?;
                Ok((alias.block, alias.offset))
            }
        }
    }

    pub(crate) fn insert_block(&mut self, host: *mut u8, len: usize) -> MemoryResult<BlockHandle> {
        let addr = host as usize;
        if host.is_null() {
            return Err(MemoryError::NullPointer);
        }
        let end = match addr.checked_add(len) {
            Some(end) if len > 0 => end,
            _ => return Err(MemoryError::InvalidAllocation),
        };
        if self.aliases_by_addr.contains_key(&addr) {
            return Err(MemoryError::DuplicateRegistration { address: addr });
        }
        // Blocks must not overlap, or the containing-address lookup becomes ambiguous.
        if self.containing_host(addr).is_some() {
            return Err(MemoryError::DuplicateRegistration { address: addr });
        }
        if let Some((&next, _)) = self.blocks_by_host.range(addr..end).next() {
            return Err(MemoryError::DuplicateRegistration { address: next });
        }

        let handle = BlockHandle(self.blocks.insert(MemoryBlock {
            host,
            len,
            device: None,
            handle: None,
            residency: Residency::HOST,
            aliases: Vec::new(),
        }));
        let _ = self.blocks_by_host.insert(addr, handle);
        Ok(handle)
    }

    pub(crate) fn insert_alias(
        &mut self,
        block: BlockHandle,
        offset: usize,
    ) -> MemoryResult<AliasHandle> {
        let record = self.block(block)?;
        if offset >= record.len {
            return Err(MemoryError::OutOfBoundsAlias {
                offset,
                len: record.len,
            });
        }
        // An alias at offset zero shares the block's address; it is only reachable by handle.
        let addr = record.host as usize + offset;
        let indexed = offset != 0;
        if indexed && self.aliases_by_addr.contains_key(&addr) {
            return Err(MemoryError::DuplicateRegistration { address: addr });
        }

        let handle = AliasHandle(self.aliases.insert(Alias { block, offset }));
        if indexed {
            let _ = self.aliases_by_addr.insert(addr, handle);
        }
        self.block_mut(block)?.aliases.push(handle);
        Ok(handle)
    }

    pub(crate) fn remove_block(&mut self, handle: BlockHandle) -> MemoryResult<MemoryBlock<H>> {
        let record = self.block(handle)?;
        if !record.aliases.is_empty() {
            return Err(MemoryError::LiveAliases {
                address: record.host as usize,
                count: record.aliases.len(),
            });
        }
        let record = self.blocks.remove(handle.0).ok_or(MemoryError::UnknownHandle)?;
        let _ = self.blocks_by_host.remove(&(record.host as usize));
        if let Some(device) = record.device {
            let _ = self.blocks_by_device.remove(&device.addr());
        }
        Ok(record)
    }

    pub(crate) fn remove_alias(&mut self, handle: AliasHandle) -> MemoryResult<Alias> {
        let alias = self.aliases.remove(handle.0).ok_or(MemoryError::UnknownHandle)?;
        let block = self.blocks.get_mut(alias.block.0).ok_or(MemoryError::UnknownHandle)?;
        if let Some(position) = block.aliases.iter().position(|&a| a == handle) {
            let _ = block.aliases.swap_remove(position);
        }
        if alias.offset != 0 {
            let addr = block.host as usize + alias.offset;
            let _ = self.aliases_by_addr.remove(&addr);
        }
        Ok(alias)
    }

    pub(crate) fn attach_device(
        &mut self,
        handle: BlockHandle,
        device: DevicePointer<u8>,
    ) -> MemoryResult<()> {
        let block = self.block_mut(handle)?;
        debug_assert!(block.device.is_none());
        block.device = Some(device);
        let _ = self.blocks_by_device.insert(device.addr(), handle);
        Ok(())
    }

    /// Forgets a block's device buffer and interop handle. The residency falls back to `HOST`.
    pub(crate) fn detach_device(&mut self, handle: BlockHandle) -> MemoryResult<()> {
        let block = self.blocks.get_mut(handle.0).ok_or(MemoryError::UnknownHandle)?;
        block.handle = None;
        block.residency = Residency::HOST;
        if let Some(device) = block.device.take() {
            let _ = self.blocks_by_device.remove(&device.addr());
        }
        Ok(())
    }

    pub(crate) fn set_residency(
        &mut self,
        handle: BlockHandle,
        residency: Residency,
    ) -> MemoryResult<()> {
        self.block_mut(handle)?.residency = residency;
        Ok(())
    }

    pub(crate) fn backend_handle_slot(&mut self, handle: BlockHandle) -> MemoryResult<&mut Option<H>> {
        Ok(&mut self.block_mut(handle)?.handle)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ledger() -> Ledger<()> {
        Ledger::new()
    }

    fn buffer(bytes: usize) -> Vec<u8> {
        vec![0u8; bytes]
    }

    #[test]
    fn test_insert_and_find_block() {
        let mut ledger = ledger();
        let mut data = buffer(64);
        let block = ledger.insert_block(data.as_mut_ptr(), 64).unwrap();

        assert_eq!(Some(Tracked::Block(block)), ledger.find(data.as_ptr() as usize));
        assert_eq!(Residency::HOST, ledger.block(block).unwrap().residency());
        assert_eq!(1, ledger.len());
    }

    #[test]
    fn test_overlapping_blocks_are_duplicates() {
        let mut ledger = ledger();
        let mut data = buffer(64);
        let base = data.as_mut_ptr();
        let _ = ledger.insert_block(unsafe { base.add(16) }, 16).unwrap();

        // Starts before the existing block and runs into it.
        assert_eq!(
            Err(MemoryError::DuplicateRegistration {
                address: base as usize + 16
            }),
            ledger.insert_block(base, 32).map(|_| ())
        );
        // Starts inside the existing block.
        assert!(ledger.insert_block(unsafe { base.add(20) }, 4).is_err());
        // Adjacent ranges are fine.
        assert!(ledger.insert_block(base, 16).is_ok());
        assert!(ledger.insert_block(unsafe { base.add(32) }, 32).is_ok());
    }

    #[test]
    fn test_rejects_null_and_empty() {
        let mut ledger = ledger();
        let mut data = buffer(8);
        assert_eq!(
            Err(MemoryError::NullPointer),
            ledger.insert_block(std::ptr::null_mut(), 8).map(|_| ())
        );
        assert_eq!(
            Err(MemoryError::InvalidAllocation),
            ledger.insert_block(data.as_mut_ptr(), 0).map(|_| ())
        );
    }

    #[test]
    fn test_alias_bounds_and_lookup() {
        let mut ledger = ledger();
        let mut data = buffer(400);
        let base = data.as_mut_ptr() as usize;
        let block = ledger.insert_block(data.as_mut_ptr(), 400).unwrap();

        let alias = ledger.insert_alias(block, 160).unwrap();
        assert_eq!(Some(Tracked::Alias(alias)), ledger.find(base + 160));
        assert_eq!(Ok((block, 160)), ledger.locate(alias.into()));
        assert_eq!(Some((block, 399)), ledger.containing_host(base + 399));
        assert_eq!(None, ledger.containing_host(base + 400));

        assert_eq!(
            Err(MemoryError::OutOfBoundsAlias {
                offset: 400,
                len: 400
            }),
            ledger.insert_alias(block, 400).map(|_| ())
        );
        assert_eq!(
            Err(MemoryError::DuplicateRegistration { address: base + 160 }),
            ledger.insert_alias(block, 160).map(|_| ())
        );
    }

    #[test]
    fn test_block_with_aliases_cannot_be_removed() {
        let mut ledger = ledger();
        let mut data = buffer(32);
        let block = ledger.insert_block(data.as_mut_ptr(), 32).unwrap();
        let alias = ledger.insert_alias(block, 8).unwrap();

        assert_eq!(
            Err(MemoryError::LiveAliases {
                address: data.as_ptr() as usize,
                count: 1
            }),
            ledger.remove_block(block).map(|_| ())
        );
        let _ = ledger.remove_alias(alias).unwrap();
        assert!(ledger.block(block).unwrap().aliases().is_empty());
        assert!(ledger.remove_block(block).is_ok());
        assert_eq!(None, ledger.find(data.as_ptr() as usize + 8));
        assert_eq!(Err(MemoryError::UnknownHandle), ledger.locate(alias.into()));
    }

    #[test]
    fn test_device_index_follows_attach_and_detach() {
        let mut ledger = ledger();
        let mut data = buffer(32);
        let block = ledger.insert_block(data.as_mut_ptr(), 32).unwrap();
        let device = unsafe { DevicePointer::from_addr(0x10_0000) };

        ledger.attach_device(block, device).unwrap();
        assert_eq!(Some((block, 31)), ledger.containing_device(0x10_0000 + 31));
        ledger.detach_device(block).unwrap();
        assert_eq!(None, ledger.containing_device(0x10_0000));
        assert_eq!(None, ledger.block(block).unwrap().device());
    }
}
