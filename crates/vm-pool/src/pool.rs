use core::{ptr, slice};

use frame_pool::PoolId;
use snafu::ResultExt as _;
use spin::Mutex;

use crate::{
    MAX_VM_REGIONS, PAGE_SIZE, PageAlign as _, PageTable, Region, RegionStorage, RegionTable,
    VmPoolError, VmPoolRegistration,
};

/// Allocator of page-aligned virtual memory regions.
///
/// `'p` is the lifetime of the page table the pool is registered with and
/// `'t` the lifetime of the region table storage.
#[derive(Debug)]
pub struct VmPool<'p, 't, P> {
    registration: VmPoolRegistration,
    page_table: &'p Mutex<P>,
    regions: RegionTable<'t>,
    header: Option<Region>,
}

impl<'p, 't, P> VmPool<'p, 't, P>
where
    P: PageTable,
{
    /// Creates a pool managing `size` bytes of virtual memory starting at
    /// `base_address` and registers it with `page_table`.
    ///
    /// Pages of the pool are backed by frames from the frame pool
    /// `frame_pool` when they are first accessed.
    ///
    /// With [`RegionStorage::SelfHosted`] the pages holding the region table
    /// are recorded as the first region of the pool, so allocations start
    /// after them.
    ///
    /// # Panics
    ///
    /// Panics if `base_address` is not page aligned, if the range wraps
    /// around the address space, or if a self-hosted region table does not
    /// fit in the pool.
    pub fn new(
        base_address: usize,
        size: usize,
        frame_pool: PoolId,
        page_table: &'p Mutex<P>,
        storage: RegionStorage<'t>,
    ) -> Result<Self, VmPoolError> {
        assert!(
            base_address.is_page_aligned(),
            "pool base address {base_address:#x} is not page aligned"
        );
        assert!(
            base_address.checked_add(size).is_some(),
            "pool {base_address:#x}+{size:#x} wraps around the address space"
        );

        let (slots, self_hosted) = match storage {
            RegionStorage::SelfHosted(slots) => (slots, true),
            RegionStorage::External(slots) => (slots, false),
        };
        let registration = VmPoolRegistration {
            base_address,
            size,
            frame_pool,
        };
        let mut pool = Self {
            registration,
            page_table,
            regions: RegionTable::new(slots),
            header: None,
        };
        let header = self_hosted.then(|| pool.header_region());

        // the table is first written after registration
        page_table
            .lock()
            .register_pool(registration)
            .context(crate::vm_pool_error::RegisterSnafu)?;
        if let Some(header) = header {
            pool.reserve_header(header);
        }

        log::debug!(
            "vm pool initialized: {:#x}..{:#x}, frames from {:?}",
            base_address,
            pool.end(),
            frame_pool,
        );
        Ok(pool)
    }

    /// Creates a pool whose region table is stored at `base_address`.
    ///
    /// The table is not accessed until the pool is registered with
    /// `page_table`, so its pages may be backed on first access by the page
    /// table's fault handling. Its previous contents are ignored.
    ///
    /// # Safety
    ///
    /// The caller must ensure that the first [`PAGE_SIZE`] bytes at
    /// `base_address` are writable once accessed, either because they are
    /// mapped or because `page_table` services faults on them, and that
    /// nothing else uses them for as long as the pool exists.
    ///
    /// # Panics
    ///
    /// Panics under the same conditions as [`new`](Self::new).
    pub unsafe fn from_raw(
        base_address: usize,
        size: usize,
        frame_pool: PoolId,
        page_table: &'p Mutex<P>,
    ) -> Result<VmPool<'p, 'static, P>, VmPoolError> {
        let slots = unsafe {
            slice::from_raw_parts_mut(
                ptr::with_exposed_provenance_mut::<Region>(base_address),
                MAX_VM_REGIONS,
            )
        };
        VmPool::new(
            base_address,
            size,
            frame_pool,
            page_table,
            RegionStorage::SelfHosted(slots),
        )
    }

    /// Returns the region covering a self-hosted region table.
    fn header_region(&self) -> Region {
        let header = Region::new(self.base_address(), self.regions.footprint());
        assert!(
            header.size() <= self.size(),
            "region table of {:#x} bytes does not fit in pool of {:#x} bytes",
            header.size(),
            self.size()
        );
        header
    }

    fn reserve_header(&mut self, header: Region) {
        self.regions.push(header);
        self.header = Some(header);
    }

    /// Reserves a region of at least `size` bytes and returns its start
    /// address.
    ///
    /// The size is rounded up to whole pages and the region is placed
    /// directly after the last region of the pool. No memory is mapped;
    /// pages are backed when first accessed.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero.
    pub fn allocate(&mut self, size: usize) -> Result<usize, VmPoolError> {
        use crate::vm_pool_error::*;

        assert!(size > 0, "cannot allocate an empty region");
        if self.regions.is_full() {
            let capacity = self.regions.capacity();
            log::warn!("cannot allocate {size:#x} bytes: region table is full ({capacity} regions)");
            return TableFullSnafu { capacity }.fail();
        }

        let base_address = self.regions.last().map_or(self.base_address(), Region::end);
        let available = self.end() - base_address;
        if size > available || size.page_align_up() > available {
            log::warn!("cannot allocate {size:#x} bytes: only {available:#x} bytes left");
            return OutOfSpaceSnafu {
                requested: size,
                available,
            }
            .fail();
        }

        let region = Region::new(base_address, size.page_align_up());
        self.regions.push(region);
        log::trace!(
            "allocated region {:#x}..{:#x} ({} pages)",
            region.base_address(),
            region.end(),
            region.page_count()
        );
        Ok(base_address)
    }

    /// Releases the region starting at `start_address`.
    ///
    /// Every page of the region is freed in the page table, which gives the
    /// backing frames back to their frame pool, and the page table is
    /// reloaded. The regions after the released one keep their addresses.
    pub fn release(&mut self, start_address: usize) -> Result<Region, VmPoolError> {
        use crate::vm_pool_error::*;

        let Some(index) = self.regions.position(start_address) else {
            log::warn!("no region to release at {start_address:#x}");
            return UnknownRegionSnafu { start_address }.fail();
        };
        if self.header.is_some() && index == 0 {
            log::warn!("cannot release the region table at {start_address:#x}");
            return ReservedRegionSnafu { start_address }.fail();
        }

        let mut page_table = self.page_table.lock();
        let region = self.regions.remove(index);
        for page in region.pages() {
            page_table.free_page(page);
        }
        page_table.load();

        log::trace!(
            "released region {:#x}..{:#x}",
            region.base_address(),
            region.end()
        );
        Ok(region)
    }

    /// Returns `true` if `address` lies in the pool's address range.
    ///
    /// The upper bound is inclusive, see
    /// [`VmPoolRegistration::is_legitimate`].
    #[must_use]
    pub fn is_legitimate(&self, address: usize) -> bool {
        self.registration.is_legitimate(address)
    }
}

impl<P> VmPool<'_, '_, P> {
    #[must_use]
    pub fn base_address(&self) -> usize {
        self.registration.base_address
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.registration.size
    }

    #[must_use]
    pub fn end(&self) -> usize {
        self.registration.base_address + self.registration.size
    }

    #[must_use]
    pub fn frame_pool(&self) -> PoolId {
        self.registration.frame_pool
    }

    #[must_use]
    pub fn registration(&self) -> VmPoolRegistration {
        self.registration
    }

    /// Returns the region holding a self-hosted region table.
    #[must_use]
    pub fn header(&self) -> Option<Region> {
        self.header
    }

    /// Returns the number of live regions, including the header.
    #[must_use]
    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    /// Returns the live regions in ascending address order, including the
    /// header.
    pub fn regions(&self) -> impl Iterator<Item = &Region> {
        self.regions.iter()
    }

    /// Returns the number of bytes between the end of the last region and
    /// the end of the pool.
    #[must_use]
    pub fn remaining(&self) -> usize {
        let used_end = self.regions.last().map_or(self.base_address(), Region::end);
        self.end() - used_end
    }
}
