//! Contiguous physical frame pools.
//!
//! This crate manages physical memory in units of [`FRAME_SIZE`]-byte frames.
//! A [`ContFramePool`] owns a contiguous range of frame numbers and hands out
//! either single frames or runs of physically contiguous frames. Pools are
//! collected in a [`FramePoolRegistry`] so that a run can be released knowing
//! only its first frame number, without remembering which pool it came from.
//!
//! # Bookkeeping
//!
//! Each frame is in one of three [`FrameState`]s, packed two bits per frame
//! into a bitmap that must fit into a single frame:
//!
//! ```text
//!  byte i:   7 6   5 4   3 2   1 0
//!          ┌─────┬─────┬─────┬─────┐
//!          │ 4i+3│ 4i+2│ 4i+1│ 4i  │   00 = Free
//!          └─────┴─────┴─────┴─────┘   11 = Used
//!                                      10 = HeadOfSequence
//! ```
//!
//! An allocated run is one `HeadOfSequence` frame followed by zero or more
//! `Used` frames. Releasing a run frees the head and every `Used` frame after
//! it, so the length of a run never has to be stored.
//!
//! The bitmap either lives in the first frame of the pool itself
//! ([`BitmapPlacement::SelfHosted`]), in which case that frame is reserved
//! when the pool is created, or in a frame supplied by the caller
//! ([`BitmapPlacement::External`]).
//!
//! # Usage Example
//!
//! ```rust
//! use frame_pool::{BitmapPlacement, ContFramePool, FramePoolRegistry};
//!
//! let mut bitmap = [0_u8; 256];
//! let mut registry = FramePoolRegistry::<4>::new();
//!
//! let pool = ContFramePool::new(0x200, 1024, BitmapPlacement::SelfHosted, &mut bitmap);
//! let id = registry.register(pool).unwrap();
//!
//! // frame 0x200 holds the bitmap, so the first run starts right after it
//! let frame_no = registry.get_frames(id, 8).unwrap();
//! assert_eq!(frame_no, 0x201);
//!
//! // released by frame number alone
//! assert_eq!(registry.release_frames(frame_no).unwrap(), 8);
//! ```
//!
//! # Thread Safety
//!
//! Pools and the registry take `&mut self` for every mutation and do no
//! locking of their own. Share them between execution contexts behind a lock
//! such as `spin::Mutex`.

#![cfg_attr(not(test), no_std)]

use snafu::{Location, Snafu};

pub use self::{
    bitmap::FrameBitmap,
    pool::{BitmapPlacement, ContFramePool, MAX_FRAMES_PER_POOL},
    registry::{FramePoolRegistry, PoolId},
    state::FrameState,
};

mod bitmap;
mod pool;
mod registry;
mod state;

pub const FRAME_SIZE: usize = 4096;
pub const FRAME_SHIFT: usize = 12;
const _: () = assert!(FRAME_SIZE == 1 << FRAME_SHIFT);

/// Errors that can occur during frame pool operations.
///
/// Every operation that returns one of these errors leaves the pool and the
/// registry exactly as they were before the call.
#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum FramePoolError {
    #[snafu(display("frame pool at {base_frame_no:#x} has no free frames"))]
    Exhausted {
        base_frame_no: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display(
        "no run of {n_frames} contiguous free frames in frame pool at {base_frame_no:#x}"
    ))]
    NoContiguousRun {
        base_frame_no: usize,
        n_frames: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("frames {start:#x}..{end:#x} are outside of the frame pool at {base_frame_no:#x}"))]
    OutOfRange {
        base_frame_no: usize,
        start: usize,
        end: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("frame {frame_no:#x} is {state:?}, expected Free"))]
    FrameNotFree {
        frame_no: usize,
        state: FrameState,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("frame {frame_no:#x} does not belong to any registered frame pool"))]
    UnknownFrame {
        frame_no: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("frame {frame_no:#x} is {state:?}, not the head of an allocated run"))]
    NotHeadOfSequence {
        frame_no: usize,
        state: FrameState,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("frame pool registry is full ({capacity} pools)"))]
    RegistryFull {
        capacity: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("frames {start:#x}..{end:#x} overlap an already registered frame pool"))]
    OverlappingPool {
        start: usize,
        end: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("no frame pool is registered as {id:?}"))]
    UnknownPool {
        id: PoolId,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("frame {frame_no:#x}: {reason}"))]
    InvariantViolated {
        frame_no: usize,
        reason: &'static str,
        #[snafu(implicit)]
        location: Location,
    },
}
