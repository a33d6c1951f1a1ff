/// Allocation state of a single frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameState {
    /// Not allocated.
    Free,
    /// Allocated, and not the first frame of its run.
    Used,
    /// First frame of an allocated run.
    ///
    /// A single-frame allocation is a `HeadOfSequence` frame with no `Used`
    /// frames after it.
    HeadOfSequence,
}

impl FrameState {
    /// Number of bits used to encode one state.
    pub const BITS: usize = 2;
    pub(crate) const MASK: u8 = (1 << Self::BITS) - 1;

    const FREE_BITS: u8 = 0b00;
    const USED_BITS: u8 = 0b11;
    const HEAD_BITS: u8 = 0b10;

    /// Returns the 2-bit encoding of this state.
    #[must_use]
    pub const fn to_bits(self) -> u8 {
        match self {
            Self::Free => Self::FREE_BITS,
            Self::Used => Self::USED_BITS,
            Self::HeadOfSequence => Self::HEAD_BITS,
        }
    }

    /// Decodes a state from the low two bits of `bits`.
    ///
    /// The unused pattern `01` decodes as `HeadOfSequence`: any non-zero
    /// pattern that is not `11` marks an allocated frame that starts a run.
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        match bits & Self::MASK {
            Self::FREE_BITS => Self::Free,
            Self::USED_BITS => Self::Used,
            _ => Self::HeadOfSequence,
        }
    }

    #[must_use]
    pub const fn is_free(self) -> bool {
        matches!(self, Self::Free)
    }
}
