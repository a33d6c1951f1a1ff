use bitflags::bitflags;
use frame_pool::FRAME_SIZE;

bitflags! {
    /// Flags of a page table or page directory entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u32 {
        /// The entry maps a frame.
        const VALID = 1 << 0;
        /// The page can be written.
        const WRITE = 1 << 1;
        /// The page is accessible from user mode.
        const USER = 1 << 2;
    }
}

bitflags! {
    /// Error code pushed by the CPU on a page fault.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FaultCode: u32 {
        /// The faulting page was present, so the access violated its
        /// protection. Clear for a not-present page.
        const PRESENT = 1 << 0;
        /// The faulting access was a write.
        const WRITE = 1 << 1;
        /// The faulting access came from user mode.
        const USER = 1 << 2;
    }
}

/// Mapping of one virtual page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    frame_no: usize,
    flags: EntryFlags,
}

impl Entry {
    pub(crate) fn new(frame_no: usize, flags: EntryFlags) -> Self {
        Self { frame_no, flags }
    }

    #[must_use]
    pub fn frame_no(&self) -> usize {
        self.frame_no
    }

    #[must_use]
    pub fn flags(&self) -> EntryFlags {
        self.flags
    }

    #[must_use]
    pub fn phys_addr(&self) -> usize {
        self.frame_no * FRAME_SIZE
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.flags.contains(EntryFlags::VALID)
    }
}

impl From<FaultCode> for EntryFlags {
    /// Flags for a page mapped in response to a fault with `code`.
    ///
    /// Pages are always writable; user-mode faults produce user pages.
    fn from(code: FaultCode) -> Self {
        let mut flags = Self::VALID | Self::WRITE;
        if code.contains(FaultCode::USER) {
            flags |= Self::USER;
        }
        flags
    }
}
