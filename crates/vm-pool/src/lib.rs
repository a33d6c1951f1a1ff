//! Virtual memory region allocator.
//!
//! A [`VmPool`] owns a range of a process's virtual address space and hands
//! out page-aligned [`Region`]s from it. Allocating a region only records it:
//! no physical frame is touched until the region is accessed and the page
//! table services the resulting fault. To make that possible, every pool
//! registers itself with its [`PageTable`] when it is created, so that the
//! page table can ask the pool whether a faulting address is legitimate and
//! take frames from the pool's frame pool.
//!
//! Regions are packed: each new region starts where the previous one ends.
//! Releasing a region asks the page table to free every page of the region,
//! which returns the backing frames, and then reloads the page table.
//!
//! # Usage Example
//!
//! ```rust
//! use frame_pool::{BitmapPlacement, ContFramePool, FramePoolRegistry};
//! use vm_pool::{PAGE_SIZE, PageTable, Region, RegionStorage, RegisterPoolError, VmPool, VmPoolRegistration};
//!
//! #[derive(Default)]
//! struct NullPageTable {
//!     pools: Vec<VmPoolRegistration>,
//! }
//!
//! impl PageTable for NullPageTable {
//!     fn register_pool(&mut self, pool: VmPoolRegistration) -> Result<(), RegisterPoolError> {
//!         self.pools.push(pool);
//!         Ok(())
//!     }
//!     fn free_page(&mut self, _virt_addr: usize) {}
//!     fn load(&mut self) {}
//! }
//!
//! let mut bitmap = [0_u8; 64];
//! let mut frames = FramePoolRegistry::<1>::new();
//! let frame_pool = frames
//!     .register(ContFramePool::new(0x400, 256, BitmapPlacement::SelfHosted, &mut bitmap))
//!     .unwrap();
//!
//! let page_table = spin::Mutex::new(NullPageTable::default());
//! let mut slots = [Region::EMPTY; 16];
//! let mut pool = VmPool::new(
//!     0x4000_0000,
//!     0x10_0000,
//!     frame_pool,
//!     &page_table,
//!     RegionStorage::External(&mut slots),
//! )
//! .unwrap();
//!
//! let a = pool.allocate(100).unwrap();
//! let b = pool.allocate(PAGE_SIZE + 1).unwrap();
//! assert_eq!(a, 0x4000_0000);
//! assert_eq!(b, 0x4000_1000);
//! assert!(pool.is_legitimate(b + 100));
//!
//! pool.release(a).unwrap();
//! assert_eq!(pool.region_count(), 1);
//! ```

#![cfg_attr(not(test), no_std)]

use snafu::{Location, Snafu};

pub use self::{
    pool::VmPool,
    region::{MAX_VM_REGIONS, Region, RegionStorage, RegionTable},
};

mod pool;
mod region;

/// Size of a virtual memory page, equal to the physical frame size.
pub const PAGE_SIZE: usize = frame_pool::FRAME_SIZE;

/// Page rounding of addresses and sizes.
pub trait PageAlign {
    /// Rounds up to the next page boundary.
    #[must_use]
    fn page_align_up(self) -> Self;

    fn is_page_aligned(self) -> bool;
}

impl PageAlign for usize {
    fn page_align_up(self) -> Self {
        self.next_multiple_of(PAGE_SIZE)
    }

    fn is_page_aligned(self) -> bool {
        self.is_multiple_of(PAGE_SIZE)
    }
}

/// What a page table needs to know about a registered [`VmPool`].
///
/// The fields never change after the pool is created, so the page table
/// keeps a copy instead of a reference to the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmPoolRegistration {
    pub base_address: usize,
    pub size: usize,
    pub frame_pool: frame_pool::PoolId,
}

impl VmPoolRegistration {
    /// Returns `true` if `address` lies in the pool's address range.
    ///
    /// The upper bound is inclusive: `base_address + size` itself is
    /// accepted.
    #[must_use]
    pub fn is_legitimate(&self, address: usize) -> bool {
        address >= self.base_address && address - self.base_address <= self.size
    }
}

/// Page-table operations a [`VmPool`] depends on.
pub trait PageTable {
    /// Records `pool` so that faults on its addresses can be serviced.
    fn register_pool(&mut self, pool: VmPoolRegistration) -> Result<(), RegisterPoolError>;

    /// Unmaps the page containing `virt_addr` and returns its frame, if the
    /// page is mapped.
    fn free_page(&mut self, virt_addr: usize);

    /// Makes this page table the active one, discarding cached
    /// translations.
    fn load(&mut self);
}

#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum RegisterPoolError {
    #[snafu(display("page table already has {capacity} registered pools"))]
    TooManyPools {
        capacity: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

impl RegisterPoolError {
    #[must_use]
    #[track_caller]
    pub fn too_many_pools(capacity: usize) -> Self {
        register_pool_error::TooManyPoolsSnafu { capacity }.build()
    }
}

#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum VmPoolError {
    #[snafu(display("region table is full ({capacity} regions)"))]
    TableFull {
        capacity: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("region of {requested:#x} bytes does not fit, {available:#x} bytes left"))]
    OutOfSpace {
        requested: usize,
        available: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("no region starts at {start_address:#x}"))]
    UnknownRegion {
        start_address: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("region at {start_address:#x} holds the region table"))]
    ReservedRegion {
        start_address: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("failed to register with the page table"))]
    Register {
        source: RegisterPoolError,
        #[snafu(implicit)]
        location: Location,
    },
}
