use alloc::collections::BTreeMap;

use arrayvec::ArrayVec;
use frame_pool::{FRAME_SHIFT, FRAME_SIZE, FramePoolRegistry};
use snafu::ResultExt as _;
use spin::Mutex;
use vm_pool::{PageAlign as _, PageTable, RegisterPoolError, VmPoolRegistration};

use crate::{DIRECTORY_SHIFT, Entry, EntryFlags, FaultCode, SoftMmuError, VM_POOLS_MAX};

/// Page table kept in ordinary memory.
///
/// Frames are taken from and returned to the shared frame pool registry
/// `frames`. The registry lock is held only for the duration of a single
/// fault or page release.
#[derive(Debug)]
pub struct SoftPageTable<'r, 'a, const N: usize> {
    frames: &'r Mutex<FramePoolRegistry<'a, N>>,
    shared_size: usize,
    pools: ArrayVec<VmPoolRegistration, VM_POOLS_MAX>,
    /// Directory slot to the frame holding its second-level table.
    directory: BTreeMap<usize, usize>,
    /// Virtual page number to its mapping.
    pages: BTreeMap<usize, Entry>,
    loaded: bool,
    flush_count: usize,
}

impl<'r, 'a, const N: usize> SoftPageTable<'r, 'a, N> {
    /// Creates an empty page table whose first `shared_size` bytes are
    /// identity mapped.
    ///
    /// # Panics
    ///
    /// Panics if `shared_size` is not a multiple of the page size.
    #[must_use]
    pub fn new(frames: &'r Mutex<FramePoolRegistry<'a, N>>, shared_size: usize) -> Self {
        assert!(
            shared_size.is_page_aligned(),
            "shared size {shared_size:#x} is not page aligned"
        );
        Self {
            frames,
            shared_size,
            pools: ArrayVec::new(),
            directory: BTreeMap::new(),
            pages: BTreeMap::new(),
            loaded: false,
            flush_count: 0,
        }
    }

    /// Services a page fault at `address`.
    ///
    /// Returns the number of the frame now backing the faulting page. A
    /// fault on a page that is already mapped returns its current frame.
    pub fn handle_fault(&mut self, address: usize, code: FaultCode) -> Result<usize, SoftMmuError> {
        use crate::soft_mmu_error::*;

        if code.contains(FaultCode::PRESENT) {
            log::warn!("protection fault at {address:#x} ({code:?})");
            return ProtectionFaultSnafu { address }.fail();
        }
        if address < self.shared_size {
            return Ok(address >> FRAME_SHIFT);
        }

        let Some(pool) = self
            .pools
            .iter()
            .find(|pool| pool.is_legitimate(address))
            .copied()
        else {
            log::warn!("page fault at {address:#x} outside of every registered pool");
            return IllegitimateAddressSnafu { address }.fail();
        };

        let page_no = address >> FRAME_SHIFT;
        if let Some(entry) = self.pages.get(&page_no) {
            return Ok(entry.frame_no());
        }

        let mut frames = self.frames.lock();
        let dir_index = address >> DIRECTORY_SHIFT;
        let table_frame = if self.directory.contains_key(&dir_index) {
            None
        } else {
            let frame_no = frames
                .get_frames(pool.frame_pool, 1)
                .context(FrameSnafu { address })?;
            Some(frame_no)
        };
        let frame_no = match frames.get_frames(pool.frame_pool, 1) {
            Ok(frame_no) => frame_no,
            Err(source) => {
                if let Some(table_frame) = table_frame {
                    let _ = frames.release_frames(table_frame);
                }
                return Err(source).context(FrameSnafu { address });
            }
        };

        if let Some(table_frame) = table_frame {
            self.directory.insert(dir_index, table_frame);
            log::trace!("directory slot {dir_index:#x} backed by frame {table_frame:#x}");
        }
        self.pages
            .insert(page_no, Entry::new(frame_no, EntryFlags::from(code)));
        log::trace!(
            "page {:#x} backed by frame {frame_no:#x}",
            page_no << FRAME_SHIFT
        );
        Ok(frame_no)
    }

    /// Returns the physical address `address` is mapped to.
    #[must_use]
    pub fn translate(&self, address: usize) -> Option<usize> {
        if address < self.shared_size {
            return Some(address);
        }
        self.entry(address)
            .map(|entry| entry.phys_addr() + (address & (FRAME_SIZE - 1)))
    }

    /// Returns the mapping of the page containing `address`.
    #[must_use]
    pub fn entry(&self, address: usize) -> Option<Entry> {
        self.pages.get(&(address >> FRAME_SHIFT)).copied()
    }

    /// Returns the frame holding the second-level table that covers
    /// `address`.
    #[must_use]
    pub fn directory_frame(&self, address: usize) -> Option<usize> {
        self.directory.get(&(address >> DIRECTORY_SHIFT)).copied()
    }

    #[must_use]
    pub fn mapped_pages(&self) -> usize {
        self.pages.len()
    }

    #[must_use]
    pub fn pools(&self) -> &[VmPoolRegistration] {
        &self.pools
    }

    #[must_use]
    pub fn shared_size(&self) -> usize {
        self.shared_size
    }

    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Returns the number of times cached translations were discarded.
    #[must_use]
    pub fn flush_count(&self) -> usize {
        self.flush_count
    }

    fn flush_tlb(&mut self) {
        self.flush_count += 1;
    }
}

impl<const N: usize> PageTable for SoftPageTable<'_, '_, N> {
    fn register_pool(&mut self, pool: VmPoolRegistration) -> Result<(), RegisterPoolError> {
        if self.pools.try_push(pool).is_err() {
            log::warn!(
                "cannot register vm pool at {:#x}: page table is full",
                pool.base_address
            );
            return Err(RegisterPoolError::too_many_pools(VM_POOLS_MAX));
        }
        log::debug!(
            "registered vm pool {:#x}..{:#x}",
            pool.base_address,
            pool.base_address + pool.size
        );
        Ok(())
    }

    fn free_page(&mut self, virt_addr: usize) {
        let page_no = virt_addr >> FRAME_SHIFT;
        let Some(entry) = self.pages.remove(&page_no) else {
            return;
        };
        // failures are logged by the registry
        let _ = self.frames.lock().release_frames(entry.frame_no());
        self.flush_tlb();
        log::trace!(
            "freed page {:#x} (frame {:#x})",
            page_no << FRAME_SHIFT,
            entry.frame_no()
        );
    }

    fn load(&mut self) {
        self.loaded = true;
        self.flush_tlb();
        log::trace!("page table loaded");
    }
}

#[cfg(test)]
mod tests {
    use core::fmt;

    use frame_pool::{BitmapPlacement, ContFramePool, FramePoolError, FrameState, PoolId};
    use log::LevelFilter;
    use vm_pool::{PAGE_SIZE, Region, RegionStorage, VmPool, VmPoolError};

    use super::*;

    const KERNEL_BASE: usize = 0x200;
    const KERNEL_FRAMES: usize = 512;
    const PROCESS_BASE: usize = 0x400;
    const PROCESS_FRAMES: usize = 1024;
    const SHARED_SIZE: usize = 4 << 20;

    const CODE_BASE: usize = 0x4000_0000;
    const HEAP_BASE: usize = 0x5000_0000;
    const POOL_SIZE: usize = 0x10_0000;

    fn stderr_sink(args: fmt::Arguments<'_>) {
        eprint!("{args}");
    }

    fn with_frames<F>(test_fn: F)
    where
        F: FnOnce(&Mutex<FramePoolRegistry<'_, 2>>, PoolId, PoolId),
    {
        let _ = diag_log::init(stderr_sink, LevelFilter::Trace);

        let mut kernel_bitmap = [0_u8; KERNEL_FRAMES / 4];
        let mut process_bitmap = [0_u8; PROCESS_FRAMES / 4];
        let mut registry = FramePoolRegistry::new();
        let kernel = registry
            .register(ContFramePool::new(
                KERNEL_BASE,
                KERNEL_FRAMES,
                BitmapPlacement::SelfHosted,
                &mut kernel_bitmap,
            ))
            .unwrap();
        let info_frame_no = registry
            .get_frames(kernel, ContFramePool::needed_info_frames(PROCESS_FRAMES))
            .unwrap();
        let process = registry
            .register(ContFramePool::new(
                PROCESS_BASE,
                PROCESS_FRAMES,
                BitmapPlacement::External { info_frame_no },
                &mut process_bitmap,
            ))
            .unwrap();

        let frames = Mutex::new(registry);
        test_fn(&frames, kernel, process);
        for (_, pool) in frames.lock().iter() {
            pool.check_invariants().unwrap();
        }
    }

    fn free_frames(frames: &Mutex<FramePoolRegistry<'_, 2>>, id: PoolId) -> usize {
        frames.lock().get(id).unwrap().n_free_frames()
    }

    #[test]
    fn test_fault_backs_region_and_release_returns_frames() {
        with_frames(|frames, _kernel, process| {
            let page_table = Mutex::new(SoftPageTable::new(frames, SHARED_SIZE));
            page_table.lock().load();
            let mut slots = [Region::EMPTY; 16];
            let mut heap = VmPool::new(
                HEAP_BASE,
                POOL_SIZE,
                process,
                &page_table,
                RegionStorage::External(&mut slots),
            )
            .unwrap();
            let free_before = free_frames(frames, process);

            let region = heap.allocate(3 * PAGE_SIZE).unwrap();
            assert_eq!(region, HEAP_BASE);
            // allocation alone maps nothing
            assert_eq!(free_frames(frames, process), free_before);

            let first = page_table
                .lock()
                .handle_fault(region + 0x10, FaultCode::empty())
                .unwrap();
            let second = page_table
                .lock()
                .handle_fault(region + PAGE_SIZE + 4, FaultCode::WRITE)
                .unwrap();
            // one directory slot and two pages
            assert_eq!(free_frames(frames, process), free_before - 3);
            assert_eq!(first, PROCESS_BASE + 1);
            assert_eq!(second, PROCESS_BASE + 2);
            {
                let table = page_table.lock();
                assert_eq!(table.directory_frame(region), Some(PROCESS_BASE));
                assert_eq!(
                    table.translate(region + 0x10),
                    Some(first * FRAME_SIZE + 0x10)
                );
                assert_eq!(table.translate(region + 2 * PAGE_SIZE), None);
                assert_eq!(table.mapped_pages(), 2);
            }

            let flushes = page_table.lock().flush_count();
            let released = heap.release(region).unwrap();
            assert_eq!(released, Region::new(HEAP_BASE, 3 * PAGE_SIZE));

            let table = page_table.lock();
            assert_eq!(table.mapped_pages(), 0);
            assert_eq!(table.translate(region + 0x10), None);
            // two mapped pages and the reload
            assert_eq!(table.flush_count(), flushes + 3);
            assert!(table.is_loaded());
            drop(table);

            // the directory frame stays allocated
            assert_eq!(free_frames(frames, process), free_before - 1);
            let registry = frames.lock();
            let pool = registry.get(process).unwrap();
            assert_eq!(pool.state(first - PROCESS_BASE), FrameState::Free);
            assert_eq!(pool.state(second - PROCESS_BASE), FrameState::Free);
        });
    }

    #[test]
    fn test_frames_come_from_the_faulting_pool() {
        with_frames(|frames, kernel, process| {
            let page_table = Mutex::new(SoftPageTable::new(frames, SHARED_SIZE));
            let mut code_slots = [Region::EMPTY; vm_pool::MAX_VM_REGIONS];
            let mut heap_slots = [Region::EMPTY; 16];
            let mut code = VmPool::new(
                CODE_BASE,
                POOL_SIZE,
                kernel,
                &page_table,
                RegionStorage::SelfHosted(&mut code_slots),
            )
            .unwrap();
            let mut heap = VmPool::new(
                HEAP_BASE,
                POOL_SIZE,
                process,
                &page_table,
                RegionStorage::External(&mut heap_slots),
            )
            .unwrap();
            assert_eq!(page_table.lock().pools().len(), 2);

            let code_region = code.allocate(PAGE_SIZE).unwrap();
            let heap_region = heap.allocate(PAGE_SIZE).unwrap();
            assert_eq!(code_region, CODE_BASE + PAGE_SIZE);

            let mut table = page_table.lock();
            // the self-hosted region table is backed like any other page
            let header_frame = table.handle_fault(CODE_BASE, FaultCode::WRITE).unwrap();
            let code_frame = table.handle_fault(code_region, FaultCode::empty()).unwrap();
            let heap_frame = table.handle_fault(heap_region, FaultCode::USER).unwrap();
            assert_eq!(
                table.entry(heap_region).unwrap().flags(),
                EntryFlags::VALID | EntryFlags::WRITE | EntryFlags::USER
            );
            drop(table);

            let registry = frames.lock();
            assert_eq!(registry.owner_of(header_frame), Some(kernel));
            assert_eq!(registry.owner_of(code_frame), Some(kernel));
            assert_eq!(registry.owner_of(heap_frame), Some(process));
        });
    }

    #[test]
    fn test_repeated_fault_keeps_mapping() {
        with_frames(|frames, _kernel, process| {
            let page_table = Mutex::new(SoftPageTable::new(frames, SHARED_SIZE));
            let mut slots = [Region::EMPTY; 4];
            let mut heap = VmPool::new(
                HEAP_BASE,
                POOL_SIZE,
                process,
                &page_table,
                RegionStorage::External(&mut slots),
            )
            .unwrap();
            let region = heap.allocate(PAGE_SIZE).unwrap();

            let mut table = page_table.lock();
            let frame_no = table.handle_fault(region, FaultCode::empty()).unwrap();
            let free = free_frames(frames, process);
            assert_eq!(
                table.handle_fault(region + 8, FaultCode::WRITE).unwrap(),
                frame_no
            );
            assert_eq!(free_frames(frames, process), free);
            assert_eq!(table.mapped_pages(), 1);
        });
    }

    #[test]
    fn test_rejected_faults() {
        with_frames(|frames, _kernel, process| {
            let page_table = Mutex::new(SoftPageTable::new(frames, SHARED_SIZE));
            let mut slots = [Region::EMPTY; 4];
            let _heap = VmPool::new(
                HEAP_BASE,
                POOL_SIZE,
                process,
                &page_table,
                RegionStorage::External(&mut slots),
            )
            .unwrap();
            let free = free_frames(frames, process);

            let mut table = page_table.lock();
            assert!(matches!(
                table.handle_fault(HEAP_BASE, FaultCode::PRESENT | FaultCode::WRITE),
                Err(SoftMmuError::ProtectionFault {
                    address: HEAP_BASE,
                    ..
                })
            ));
            assert!(matches!(
                table.handle_fault(HEAP_BASE + POOL_SIZE + PAGE_SIZE, FaultCode::empty()),
                Err(SoftMmuError::IllegitimateAddress { .. })
            ));
            assert!(matches!(
                table.handle_fault(HEAP_BASE - 1, FaultCode::empty()),
                Err(SoftMmuError::IllegitimateAddress { .. })
            ));
            assert_eq!(table.mapped_pages(), 0);
            assert_eq!(free_frames(frames, process), free);

            // one past the end of the pool is still accepted
            table
                .handle_fault(HEAP_BASE + POOL_SIZE, FaultCode::empty())
                .unwrap();
            assert_eq!(table.mapped_pages(), 1);
        });
    }

    #[test]
    fn test_shared_region_is_identity_mapped() {
        with_frames(|frames, _kernel, _process| {
            let mut table = SoftPageTable::new(frames, SHARED_SIZE);
            assert_eq!(table.translate(0x1234), Some(0x1234));
            assert_eq!(table.translate(SHARED_SIZE - 1), Some(SHARED_SIZE - 1));
            assert_eq!(table.translate(SHARED_SIZE), None);
            assert_eq!(table.handle_fault(0x1234, FaultCode::empty()).unwrap(), 1);

            // nothing to free
            table.free_page(0x1000);
            assert_eq!(table.flush_count(), 0);
            assert!(!table.is_loaded());
        });
    }

    #[test]
    fn test_too_many_pools() {
        with_frames(|frames, _kernel, process| {
            let page_table = Mutex::new(SoftPageTable::new(frames, SHARED_SIZE));
            for i in 0..VM_POOLS_MAX {
                VmPool::new(
                    HEAP_BASE + i * POOL_SIZE,
                    POOL_SIZE,
                    process,
                    &page_table,
                    RegionStorage::External(&mut []),
                )
                .unwrap();
            }
            let mut slots = [Region::EMPTY; 1];
            let overflow = VmPool::new(
                HEAP_BASE + VM_POOLS_MAX * POOL_SIZE,
                POOL_SIZE,
                process,
                &page_table,
                RegionStorage::External(&mut slots),
            );
            assert!(matches!(
                overflow,
                Err(VmPoolError::Register {
                    source: RegisterPoolError::TooManyPools { capacity: VM_POOLS_MAX, .. },
                    ..
                })
            ));
            assert_eq!(page_table.lock().pools().len(), VM_POOLS_MAX);
        });
    }

    #[test]
    fn test_out_of_frames_leaves_table_untouched() {
        let _ = diag_log::init(stderr_sink, LevelFilter::Trace);

        let mut bitmap = [0_u8; 1];
        let mut registry = FramePoolRegistry::<1>::new();
        let id = registry
            .register(ContFramePool::new(
                0x800,
                1,
                BitmapPlacement::External { info_frame_no: 0x7ff },
                &mut bitmap,
            ))
            .unwrap();
        let frames = Mutex::new(registry);
        let page_table = Mutex::new(SoftPageTable::new(&frames, 0));
        let mut slots = [Region::EMPTY; 4];
        let mut heap = VmPool::new(
            HEAP_BASE,
            POOL_SIZE,
            id,
            &page_table,
            RegionStorage::External(&mut slots),
        )
        .unwrap();
        let region = heap.allocate(PAGE_SIZE).unwrap();

        // the directory slot takes the only frame, the page finds none
        let err = page_table
            .lock()
            .handle_fault(region, FaultCode::empty())
            .unwrap_err();
        assert!(matches!(
            err,
            SoftMmuError::Frame {
                source: FramePoolError::Exhausted { .. },
                ..
            }
        ));
        let table = page_table.lock();
        assert_eq!(table.directory_frame(region), None);
        assert_eq!(table.mapped_pages(), 0);
        drop(table);
        assert_eq!(frames.lock().n_free_frames(), 1);
    }
}
