//! Software two-level page table.
//!
//! [`SoftPageTable`] implements [`vm_pool::PageTable`] on top of in-memory
//! maps instead of hardware structures. It services page faults the way a
//! demand-paging kernel does: the faulting address is checked against the
//! registered [`VmPool`](vm_pool::VmPool)s, and the page is backed by a frame
//! taken from the frame pool of the pool that accepts the address. Populating
//! a directory slot for the first time also costs one frame from that pool,
//! as allocating a second-level table would.
//!
//! The low `shared_size` bytes of the address space are identity mapped and
//! never faulted on.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use frame_pool::FramePoolError;
use snafu::{Location, Snafu};

pub use self::{
    entry::{Entry, EntryFlags, FaultCode},
    table::SoftPageTable,
};

mod entry;
mod table;

/// Maximum number of [`VmPool`](vm_pool::VmPool)s a page table can serve.
pub const VM_POOLS_MAX: usize = 16;

/// Number of address bits below the page directory index.
///
/// One directory slot covers 1024 pages.
pub const DIRECTORY_SHIFT: usize = 22;

#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum SoftMmuError {
    #[snafu(display("protection fault at {address:#x}"))]
    ProtectionFault {
        address: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("address {address:#x} does not belong to any registered pool"))]
    IllegitimateAddress {
        address: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("no frame available to map {address:#x}"))]
    Frame {
        address: usize,
        source: FramePoolError,
        #[snafu(implicit)]
        location: Location,
    },
}
