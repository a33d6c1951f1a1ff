use core::{mem, ops::Range};

use crate::PAGE_SIZE;

/// Maximum number of regions a [`VmPool`](crate::VmPool) can track.
///
/// The region table must fit in one page.
pub const MAX_VM_REGIONS: usize = PAGE_SIZE / mem::size_of::<Region>();

/// A page-aligned range of virtual addresses handed out by a
/// [`VmPool`](crate::VmPool).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Region {
    base_address: usize,
    size: usize,
}

impl Region {
    pub const EMPTY: Self = Self {
        base_address: 0,
        size: 0,
    };

    #[must_use]
    pub const fn new(base_address: usize, size: usize) -> Self {
        Self { base_address, size }
    }

    #[must_use]
    pub const fn base_address(&self) -> usize {
        self.base_address
    }

    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Returns the first address after the region.
    #[must_use]
    pub const fn end(&self) -> usize {
        self.base_address + self.size
    }

    #[must_use]
    pub const fn range(&self) -> Range<usize> {
        self.base_address..self.end()
    }

    #[must_use]
    pub const fn contains(&self, address: usize) -> bool {
        self.base_address <= address && address < self.end()
    }

    #[must_use]
    pub const fn page_count(&self) -> usize {
        self.size.div_ceil(PAGE_SIZE)
    }

    /// Returns an iterator over the start address of every page in the
    /// region.
    pub fn pages(&self) -> impl Iterator<Item = usize> + use<> {
        self.range().step_by(PAGE_SIZE)
    }
}

/// Storage for the region table of a [`VmPool`](crate::VmPool).
#[derive(Debug)]
pub enum RegionStorage<'t> {
    /// The table occupies the first bytes of the pool's own address range.
    ///
    /// The pages holding the table are recorded as a reserved region that
    /// is never released.
    SelfHosted(&'t mut [Region]),
    /// The table lives outside of the pool's address range.
    External(&'t mut [Region]),
}

/// Ordered, densely packed array of region descriptors.
///
/// Live descriptors occupy the first [`len`](Self::len) slots in ascending
/// address order. Removing a descriptor shifts the following ones down.
#[derive(Debug)]
pub struct RegionTable<'t> {
    slots: &'t mut [Region],
    len: usize,
}

impl<'t> RegionTable<'t> {
    /// Creates an empty table over `slots`.
    ///
    /// At most [`MAX_VM_REGIONS`] slots are used.
    #[must_use]
    pub fn new(slots: &'t mut [Region]) -> Self {
        let capacity = slots.len().min(MAX_VM_REGIONS);
        Self {
            slots: &mut slots[..capacity],
            len: 0,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len == self.slots.len()
    }

    /// Returns the number of bytes the table occupies, rounded up to whole
    /// pages.
    #[must_use]
    pub fn footprint(&self) -> usize {
        (self.capacity() * mem::size_of::<Region>()).next_multiple_of(PAGE_SIZE)
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Region> {
        self.as_slice().get(index)
    }

    #[must_use]
    pub fn last(&self) -> Option<&Region> {
        self.as_slice().last()
    }

    /// Returns the index of the region starting at `base_address`.
    #[must_use]
    pub fn position(&self, base_address: usize) -> Option<usize> {
        self.as_slice()
            .iter()
            .position(|region| region.base_address == base_address)
    }

    #[must_use]
    pub fn as_slice(&self) -> &[Region] {
        &self.slots[..self.len]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Region> {
        self.as_slice().iter()
    }

    /// Appends `region` to the table.
    ///
    /// # Panics
    ///
    /// Panics if the table is full.
    pub fn push(&mut self, region: Region) {
        assert!(!self.is_full(), "region table is full");
        self.slots[self.len] = region;
        self.len += 1;
    }

    /// Removes the region at `index` and shifts the following regions down.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn remove(&mut self, index: usize) -> Region {
        assert!(
            index < self.len,
            "region index {index} out of bounds for table of {} regions",
            self.len
        );
        let region = self.slots[index];
        self.slots.copy_within(index + 1..self.len, index);
        self.len -= 1;
        self.slots[self.len] = Region::EMPTY;
        region
    }
}
