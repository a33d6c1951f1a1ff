//! Contiguous frame pool.
//!
//! # Algorithm
//!
//! - **Allocation** is **first-fit**: the bitmap is scanned from the lowest
//!   frame upwards while counting consecutive free frames, and the first run
//!   that reaches the requested length is taken. The run's first frame becomes
//!   `HeadOfSequence` and the rest become `Used`.
//! - **Release** starts at a `HeadOfSequence` frame, frees it, and keeps
//!   freeing the following frames as long as they are `Used`. The next `Free`
//!   or `HeadOfSequence` frame (or the end of the pool) ends the run.
//! - **Reservation** ([`ContFramePool::mark_inaccessible`]) marks a run at a
//!   known position without searching, for frames that must never be handed
//!   out.
//!
//! # Performance Characteristics
//!
//! - **Allocation**: O(n) in the number of frames in the pool
//! - **Release**: O(k) in the length of the released run
//! - **Memory Overhead**: 2 bits per frame, at most one frame per pool

use core::{ops::Range, ptr, slice};

use snafu::ensure;

use crate::{
    FRAME_SIZE, FrameBitmap, FramePoolError, FrameState,
    frame_pool_error::{
        ExhaustedSnafu, FrameNotFreeSnafu, InvariantViolatedSnafu, NoContiguousRunSnafu,
        NotHeadOfSequenceSnafu, OutOfRangeSnafu, UnknownFrameSnafu,
    },
};

/// Maximum number of frames a single pool can manage.
///
/// The bitmap of a pool must fit in one frame.
pub const MAX_FRAMES_PER_POOL: usize = FrameBitmap::capacity_of(FRAME_SIZE);

/// Location of the bitmap that records the state of a pool's frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitmapPlacement {
    /// The bitmap is stored in the first frame of the pool, which is reserved
    /// when the pool is created.
    SelfHosted,
    /// The bitmap is stored in a frame outside of the pool.
    External {
        /// Frame number of the frame holding the bitmap.
        info_frame_no: usize,
    },
}

impl BitmapPlacement {
    /// Decodes the conventional `info_frame_no` argument, where zero selects
    /// [`SelfHosted`](Self::SelfHosted).
    #[must_use]
    pub fn from_info_frame_no(info_frame_no: usize) -> Self {
        if info_frame_no == 0 {
            Self::SelfHosted
        } else {
            Self::External { info_frame_no }
        }
    }

    /// Returns the frame number that holds the bitmap of a pool starting at
    /// `base_frame_no`.
    #[must_use]
    pub fn info_frame_no(self, base_frame_no: usize) -> usize {
        match self {
            Self::SelfHosted => base_frame_no,
            Self::External { info_frame_no } => info_frame_no,
        }
    }
}

/// Allocator for a contiguous range of physical frames.
///
/// Frames are identified by their global frame number. Internally, a frame is
/// addressed by its *local index*, its offset from
/// [`base_frame_no`](Self::base_frame_no).
#[derive(Debug)]
pub struct ContFramePool<'a> {
    base_frame_no: usize,
    n_frames: usize,
    n_free_frames: usize,
    placement: BitmapPlacement,
    bitmap: FrameBitmap<'a>,
}

impl<'a> ContFramePool<'a> {
    /// Creates a pool managing frames `base_frame_no..base_frame_no +
    /// n_frames`, keeping its bitmap in `storage`.
    ///
    /// All frames start out `Free`. With [`BitmapPlacement::SelfHosted`] the
    /// first frame of the pool is then reserved for the bitmap and is never
    /// handed out.
    ///
    /// The pool still has to be added to a
    /// [`FramePoolRegistry`](crate::FramePoolRegistry) before its frames can
    /// be released by frame number.
    ///
    /// # Panics
    ///
    /// Panics if the bitmap for `n_frames` frames does not fit in one frame,
    /// if `storage` is too small for the bitmap, or if a self-hosted pool has
    /// no frame to hold its bitmap.
    #[must_use]
    pub fn new(
        base_frame_no: usize,
        n_frames: usize,
        placement: BitmapPlacement,
        storage: &'a mut [u8],
    ) -> Self {
        assert!(
            n_frames <= MAX_FRAMES_PER_POOL,
            "bitmap for {n_frames} frames does not fit in a single frame"
        );
        assert!(
            n_frames > 0 || placement != BitmapPlacement::SelfHosted,
            "self-hosted frame pool needs at least one frame for its bitmap"
        );

        let mut bitmap = FrameBitmap::new(storage, n_frames);
        bitmap.fill(FrameState::Free);

        let mut pool = Self {
            base_frame_no,
            n_frames,
            n_free_frames: n_frames,
            placement,
            bitmap,
        };
        if placement == BitmapPlacement::SelfHosted {
            pool.reserve_bitmap_frame();
        }

        log::trace!(
            "frame pool initialized: frames {:#x}..{:#x}, bitmap in frame {:#x}",
            base_frame_no,
            base_frame_no + n_frames,
            placement.info_frame_no(base_frame_no),
        );
        pool
    }

    /// Creates a pool whose bitmap lives in physical memory.
    ///
    /// If `info_frame_no` is zero the bitmap is stored in frame
    /// `base_frame_no`, otherwise in frame `info_frame_no`.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - the frame holding the bitmap is identity mapped and writable
    /// - nothing else accesses that frame for as long as the pool exists
    ///
    /// # Panics
    ///
    /// Panics under the same conditions as [`new`](Self::new).
    #[must_use]
    pub unsafe fn from_frame_numbers(
        base_frame_no: usize,
        n_frames: usize,
        info_frame_no: usize,
    ) -> ContFramePool<'static> {
        assert!(
            n_frames <= MAX_FRAMES_PER_POOL,
            "bitmap for {n_frames} frames does not fit in a single frame"
        );
        let placement = BitmapPlacement::from_info_frame_no(info_frame_no);
        let addr = placement.info_frame_no(base_frame_no) * FRAME_SIZE;
        let storage = unsafe {
            slice::from_raw_parts_mut(
                ptr::with_exposed_provenance_mut::<u8>(addr),
                FrameBitmap::bytes_for(n_frames),
            )
        };
        ContFramePool::new(base_frame_no, n_frames, placement, storage)
    }

    /// Returns the number of frames needed to hold the bitmap of a pool with
    /// `n_frames` frames.
    #[must_use]
    pub const fn needed_info_frames(n_frames: usize) -> usize {
        n_frames.div_ceil(MAX_FRAMES_PER_POOL)
    }

    fn reserve_bitmap_frame(&mut self) {
        assert!(self.bitmap.get(0).is_free());
        self.bitmap.set(0, FrameState::Used);
        self.n_free_frames -= 1;
    }

    #[must_use]
    pub fn base_frame_no(&self) -> usize {
        self.base_frame_no
    }

    #[must_use]
    pub fn n_frames(&self) -> usize {
        self.n_frames
    }

    #[must_use]
    pub fn n_free_frames(&self) -> usize {
        self.n_free_frames
    }

    #[must_use]
    pub fn bitmap_placement(&self) -> BitmapPlacement {
        self.placement
    }

    /// Returns the range of global frame numbers owned by this pool.
    #[must_use]
    pub fn frame_range(&self) -> Range<usize> {
        self.base_frame_no..self.base_frame_no + self.n_frames
    }

    /// Returns `true` if global frame `frame_no` belongs to this pool.
    #[must_use]
    pub fn contains(&self, frame_no: usize) -> bool {
        self.frame_range().contains(&frame_no)
    }

    /// Returns the state of the frame at local index `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not smaller than [`n_frames`](Self::n_frames).
    #[must_use]
    pub fn state(&self, index: usize) -> FrameState {
        self.bitmap.get(index)
    }

    #[must_use]
    pub fn bitmap(&self) -> &FrameBitmap<'a> {
        &self.bitmap
    }

    /// Allocates a run of `n_frames` contiguous frames.
    ///
    /// Returns the global frame number of the first frame of the lowest run
    /// of free frames that is long enough.
    ///
    /// # Panics
    ///
    /// Panics if `n_frames` is zero.
    pub fn get_frames(&mut self, n_frames: usize) -> Result<usize, FramePoolError> {
        assert!(n_frames > 0, "cannot allocate zero frames");
        if self.n_free_frames == 0 {
            log::warn!(
                "frame pool {:#x} is exhausted, cannot allocate {n_frames} frames",
                self.base_frame_no
            );
            return ExhaustedSnafu {
                base_frame_no: self.base_frame_no,
            }
            .fail();
        }

        let Some(start) = self.find_free_run(n_frames) else {
            log::warn!(
                "no run of {n_frames} contiguous frames in frame pool {:#x} ({} frames free)",
                self.base_frame_no,
                self.n_free_frames,
            );
            return NoContiguousRunSnafu {
                base_frame_no: self.base_frame_no,
                n_frames,
            }
            .fail();
        };

        self.mark_run(start, n_frames);
        let frame_no = self.base_frame_no + start;
        log::trace!("allocated frames {frame_no:#x}..{:#x}", frame_no + n_frames);
        Ok(frame_no)
    }

    fn find_free_run(&self, n_frames: usize) -> Option<usize> {
        let mut count = 0;
        for (index, state) in self.bitmap.iter().enumerate() {
            if state.is_free() {
                count += 1;
            } else {
                count = 0;
            }
            if count == n_frames {
                return Some(index + 1 - n_frames);
            }
        }
        None
    }

    fn mark_run(&mut self, start: usize, n_frames: usize) {
        self.bitmap.set(start, FrameState::HeadOfSequence);
        for index in start + 1..start + n_frames {
            self.bitmap.set(index, FrameState::Used);
        }
        self.n_free_frames -= n_frames;
    }

    /// Reserves the `n_frames` frames starting at local index `index` so
    /// that they are never handed out.
    ///
    /// The frames are marked exactly as an allocated run would be, so they
    /// can be given back with [`release_local`](Self::release_local) later.
    ///
    /// # Panics
    ///
    /// Panics if `n_frames` is zero.
    pub fn mark_inaccessible(
        &mut self,
        index: usize,
        n_frames: usize,
    ) -> Result<(), FramePoolError> {
        assert!(n_frames > 0, "cannot reserve zero frames");
        let end = index.saturating_add(n_frames);
        let start_frame_no = self.base_frame_no.saturating_add(index);
        let end_frame_no = self.base_frame_no.saturating_add(end);
        if end > self.n_frames {
            log::warn!(
                "cannot reserve frames {start_frame_no:#x}..{end_frame_no:#x}: \
                 outside frame pool {:#x}",
                self.base_frame_no
            );
            return OutOfRangeSnafu {
                base_frame_no: self.base_frame_no,
                start: start_frame_no,
                end: end_frame_no,
            }
            .fail();
        }
        if let Some(busy) = (index..end).find(|&i| !self.bitmap.get(i).is_free()) {
            log::warn!(
                "cannot reserve frames {start_frame_no:#x}..{end_frame_no:#x}: \
                 frame {:#x} is {:?}",
                self.base_frame_no + busy,
                self.bitmap.get(busy)
            );
            return FrameNotFreeSnafu {
                frame_no: self.base_frame_no + busy,
                state: self.bitmap.get(busy),
            }
            .fail();
        }

        self.mark_run(index, n_frames);
        log::trace!("reserved frames {start_frame_no:#x}..{end_frame_no:#x}");
        Ok(())
    }

    /// Releases the run starting at global frame `frame_no`.
    ///
    /// Returns the number of frames released.
    pub fn release_frames(&mut self, frame_no: usize) -> Result<usize, FramePoolError> {
        ensure!(self.contains(frame_no), UnknownFrameSnafu { frame_no });
        self.release_local(frame_no - self.base_frame_no)
    }

    /// Releases the run starting at local index `index`.
    ///
    /// The frame at `index` must be the head of a run. It and every `Used`
    /// frame directly following it become `Free`.
    ///
    /// Returns the number of frames released.
    pub fn release_local(&mut self, index: usize) -> Result<usize, FramePoolError> {
        ensure!(
            index < self.n_frames,
            OutOfRangeSnafu {
                base_frame_no: self.base_frame_no,
                start: self.base_frame_no.saturating_add(index),
                end: self.base_frame_no.saturating_add(index).saturating_add(1),
            }
        );
        let state = self.bitmap.get(index);
        ensure!(
            state == FrameState::HeadOfSequence,
            NotHeadOfSequenceSnafu {
                frame_no: self.base_frame_no + index,
                state,
            }
        );

        self.bitmap.set(index, FrameState::Free);
        let mut released = 1;
        for next in index + 1..self.n_frames {
            if self.bitmap.get(next) != FrameState::Used {
                break;
            }
            self.bitmap.set(next, FrameState::Free);
            released += 1;
        }
        self.n_free_frames += released;

        let frame_no = self.base_frame_no + index;
        log::trace!("released frames {frame_no:#x}..{:#x}", frame_no + released);
        Ok(released)
    }

    /// Checks that every `Used` frame belongs to a run and that the free
    /// frame counter matches the bitmap.
    ///
    /// The leading frame of a self-hosted pool is the bitmap reservation and
    /// is accepted as a `Used` frame without a head.
    pub fn check_invariants(&self) -> Result<(), FramePoolError> {
        let mut free = 0;
        let mut in_run = false;
        for (index, state) in self.bitmap.iter().enumerate() {
            match state {
                FrameState::Free => {
                    free += 1;
                    in_run = false;
                }
                FrameState::HeadOfSequence => in_run = true,
                FrameState::Used => {
                    let reserved = index == 0 && self.placement == BitmapPlacement::SelfHosted;
                    ensure!(
                        in_run || reserved,
                        InvariantViolatedSnafu {
                            frame_no: self.base_frame_no + index,
                            reason: "used frame does not follow the head of a run",
                        }
                    );
                }
            }
        }
        ensure!(
            free == self.n_free_frames,
            InvariantViolatedSnafu {
                frame_no: self.base_frame_no,
                reason: "free frame counter does not match the bitmap",
            }
        );
        Ok(())
    }
}
