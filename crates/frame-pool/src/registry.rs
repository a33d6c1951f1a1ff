use arrayvec::ArrayVec;
use snafu::{OptionExt as _, ensure};

use crate::{
    ContFramePool, FramePoolError,
    frame_pool_error::{OverlappingPoolSnafu, RegistryFullSnafu, UnknownFrameSnafu, UnknownPoolSnafu},
};

/// Handle to a pool registered in a [`FramePoolRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolId(usize);

impl PoolId {
    /// Returns the registration order of the pool, starting at zero.
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

/// Collection of frame pools with disjoint frame ranges.
///
/// The registry is what makes it possible to release a run of frames by its
/// first frame number alone: [`release_frames`](Self::release_frames) finds
/// the pool owning the frame and lets that pool free the run.
///
/// Pools are kept in registration order and are never removed.
#[derive(Debug)]
pub struct FramePoolRegistry<'a, const N: usize> {
    pools: ArrayVec<ContFramePool<'a>, N>,
}

impl<const N: usize> Default for FramePoolRegistry<'_, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, const N: usize> FramePoolRegistry<'a, N> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            pools: ArrayVec::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pools.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    /// Adds `pool` to the registry and returns its handle.
    ///
    /// Fails if the registry is full or if the frames of `pool` overlap those
    /// of an already registered pool.
    pub fn register(&mut self, pool: ContFramePool<'a>) -> Result<PoolId, FramePoolError> {
        ensure!(!self.pools.is_full(), RegistryFullSnafu { capacity: N });
        let range = pool.frame_range();
        let overlaps = self
            .pools
            .iter()
            .any(|p| p.base_frame_no() < range.end && range.start < p.frame_range().end);
        ensure!(
            !overlaps,
            OverlappingPoolSnafu {
                start: range.start,
                end: range.end,
            }
        );

        let id = PoolId(self.pools.len());
        self.pools.push(pool);
        log::debug!(
            "registered frame pool {:?}: frames {:#x}..{:#x}",
            id,
            range.start,
            range.end
        );
        Ok(id)
    }

    #[must_use]
    pub fn get(&self, id: PoolId) -> Option<&ContFramePool<'a>> {
        self.pools.get(id.0)
    }

    #[must_use]
    pub fn get_mut(&mut self, id: PoolId) -> Option<&mut ContFramePool<'a>> {
        self.pools.get_mut(id.0)
    }

    /// Returns the handle of the pool owning global frame `frame_no`.
    #[must_use]
    pub fn owner_of(&self, frame_no: usize) -> Option<PoolId> {
        self.pools
            .iter()
            .position(|pool| pool.contains(frame_no))
            .map(PoolId)
    }

    /// Allocates `n_frames` contiguous frames from the pool `id`.
    ///
    /// # Panics
    ///
    /// Panics if `n_frames` is zero.
    pub fn get_frames(&mut self, id: PoolId, n_frames: usize) -> Result<usize, FramePoolError> {
        let pool = self.get_mut(id).context(UnknownPoolSnafu { id })?;
        pool.get_frames(n_frames)
    }

    /// Releases the run whose first frame is `frame_no`, whichever pool it
    /// belongs to.
    ///
    /// Returns the number of frames released.
    pub fn release_frames(&mut self, frame_no: usize) -> Result<usize, FramePoolError> {
        let result = self
            .pools
            .iter_mut()
            .find(|pool| pool.contains(frame_no))
            .context(UnknownFrameSnafu { frame_no })
            .and_then(|pool| pool.release_frames(frame_no));
        if let Err(err) = &result {
            log::error!("failed to release frames at {frame_no:#x}: {err}");
        }
        result
    }

    pub fn iter(&self) -> impl Iterator<Item = (PoolId, &ContFramePool<'a>)> {
        self.pools
            .iter()
            .enumerate()
            .map(|(index, pool)| (PoolId(index), pool))
    }

    /// Returns the total number of free frames across all pools.
    #[must_use]
    pub fn n_free_frames(&self) -> usize {
        self.pools.iter().map(ContFramePool::n_free_frames).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BitmapPlacement, FrameState};

    #[test]
    fn test_release_by_frame_number() {
        let mut kernel_bitmap = [0_u8; 128];
        let mut process_bitmap = [0_u8; 256];
        let mut registry = FramePoolRegistry::<2>::new();

        let kernel = registry
            .register(ContFramePool::new(
                0x200,
                512,
                BitmapPlacement::SelfHosted,
                &mut kernel_bitmap,
            ))
            .unwrap();
        let process = registry
            .register(ContFramePool::new(
                0x400,
                1024,
                BitmapPlacement::External {
                    info_frame_no: 0x201,
                },
                &mut process_bitmap,
            ))
            .unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.n_free_frames(), 511 + 1024);

        let k = registry.get_frames(kernel, 4).unwrap();
        let p = registry.get_frames(process, 16).unwrap();
        assert_eq!(k, 0x201);
        assert_eq!(p, 0x400);
        assert_eq!(registry.owner_of(k), Some(kernel));
        assert_eq!(registry.owner_of(p), Some(process));

        assert_eq!(registry.release_frames(p).unwrap(), 16);
        assert_eq!(registry.release_frames(k).unwrap(), 4);
        assert_eq!(registry.n_free_frames(), 511 + 1024);
        for (_, pool) in registry.iter() {
            pool.check_invariants().unwrap();
        }
    }

    #[test]
    fn test_release_unknown_frame() {
        let mut bitmap = [0_u8; 16];
        let mut registry = FramePoolRegistry::<1>::new();
        registry
            .register(ContFramePool::new(
                0x10,
                64,
                BitmapPlacement::SelfHosted,
                &mut bitmap,
            ))
            .unwrap();
        assert!(matches!(
            registry.release_frames(0x50),
            Err(FramePoolError::UnknownFrame { frame_no: 0x50, .. })
        ));
        assert!(matches!(
            registry.release_frames(0x0f),
            Err(FramePoolError::UnknownFrame { .. })
        ));
        assert_eq!(registry.owner_of(0x50), None);
    }

    #[test]
    fn test_release_non_head_is_rejected() {
        let mut bitmap = [0_u8; 16];
        let mut registry = FramePoolRegistry::<1>::new();
        let id = registry
            .register(ContFramePool::new(
                0,
                64,
                BitmapPlacement::External { info_frame_no: 99 },
                &mut bitmap,
            ))
            .unwrap();
        let frame_no = registry.get_frames(id, 3).unwrap();
        assert!(matches!(
            registry.release_frames(frame_no + 1),
            Err(FramePoolError::NotHeadOfSequence { .. })
        ));
        let pool = registry.get(id).unwrap();
        assert_eq!(pool.state(frame_no), FrameState::HeadOfSequence);
        assert_eq!(pool.n_free_frames(), 61);
    }

    #[test]
    fn test_registry_full() {
        let mut a = [0_u8; 4];
        let mut b = [0_u8; 4];
        let mut registry = FramePoolRegistry::<1>::new();
        registry
            .register(ContFramePool::new(0, 16, BitmapPlacement::SelfHosted, &mut a))
            .unwrap();
        assert!(matches!(
            registry.register(ContFramePool::new(
                16,
                16,
                BitmapPlacement::SelfHosted,
                &mut b
            )),
            Err(FramePoolError::RegistryFull { capacity: 1, .. })
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_overlapping_pool() {
        let mut a = [0_u8; 4];
        let mut b = [0_u8; 4];
        let mut c = [0_u8; 4];
        let mut registry = FramePoolRegistry::<4>::new();
        registry
            .register(ContFramePool::new(0x10, 16, BitmapPlacement::SelfHosted, &mut a))
            .unwrap();
        assert!(matches!(
            registry.register(ContFramePool::new(
                0x1f,
                16,
                BitmapPlacement::SelfHosted,
                &mut b
            )),
            Err(FramePoolError::OverlappingPool {
                start: 0x1f,
                end: 0x2f,
                ..
            })
        ));
        // adjacent is fine
        registry
            .register(ContFramePool::new(0x20, 16, BitmapPlacement::SelfHosted, &mut c))
            .unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_unknown_pool_id() {
        let mut bitmap = [0_u8; 4];
        let mut other_bitmap = [0_u8; 4];
        let mut small = FramePoolRegistry::<2>::new();
        let mut other = FramePoolRegistry::<2>::new();
        other
            .register(ContFramePool::new(0, 16, BitmapPlacement::SelfHosted, &mut other_bitmap))
            .unwrap();
        let second = other
            .register(ContFramePool::new(16, 16, BitmapPlacement::SelfHosted, &mut bitmap))
            .unwrap();

        assert!(small.is_empty());
        assert!(matches!(
            small.get_frames(second, 1),
            Err(FramePoolError::UnknownPool { .. })
        ));
        assert_eq!(second.index(), 1);
    }
}
