use core::fmt;

use crate::FrameState;

/// Number of frame states packed into one bitmap byte.
const STATES_PER_BYTE: usize = u8::BITS as usize / FrameState::BITS;

/// Packed array of [`FrameState`]s, two bits per frame.
///
/// Frame `i` is stored in byte `i / 4` at bit offset `2 * (i % 4)`. The
/// bitmap borrows its storage, which in a kernel is the frame holding the
/// pool's management information.
pub struct FrameBitmap<'a> {
    bytes: &'a mut [u8],
    len: usize,
}

impl fmt::Debug for FrameBitmap<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBitmap")
            .field("len", &self.len)
            .field("bytes", &self.bytes.len())
            .finish()
    }
}

impl<'a> FrameBitmap<'a> {
    /// Returns the number of bytes needed to hold the states of `len` frames.
    #[must_use]
    pub const fn bytes_for(len: usize) -> usize {
        len.div_ceil(STATES_PER_BYTE)
    }

    /// Returns the number of frame states that fit into `bytes` bytes.
    #[must_use]
    pub const fn capacity_of(bytes: usize) -> usize {
        bytes * STATES_PER_BYTE
    }

    /// Creates a bitmap of `len` frames on top of `storage`.
    ///
    /// Only the first [`bytes_for(len)`](Self::bytes_for) bytes of `storage`
    /// are used. Their previous contents are kept; call
    /// [`fill`](Self::fill) to initialize them.
    ///
    /// # Panics
    ///
    /// Panics if `storage` is too small to hold `len` states.
    #[must_use]
    pub fn new(storage: &'a mut [u8], len: usize) -> Self {
        let needed = Self::bytes_for(len);
        assert!(
            storage.len() >= needed,
            "bitmap for {len} frames needs {needed} bytes, got {}",
            storage.len()
        );
        Self {
            bytes: &mut storage[..needed],
            len,
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

    fn position(&self, index: usize) -> (usize, usize) {
        assert!(
            index < self.len,
            "frame index {index} out of bounds for bitmap of {} frames",
            self.len
        );
        (
            index / STATES_PER_BYTE,
            (index % STATES_PER_BYTE) * FrameState::BITS,
        )
    }

    /// Returns the state of frame `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    #[must_use]
    pub fn get(&self, index: usize) -> FrameState {
        let (byte, shift) = self.position(index);
        FrameState::from_bits(self.bytes[byte] >> shift)
    }

    /// Sets the state of frame `index`, leaving the other frames sharing its
    /// byte untouched.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn set(&mut self, index: usize, state: FrameState) {
        let (byte, shift) = self.position(index);
        let cleared = self.bytes[byte] & !(FrameState::MASK << shift);
        self.bytes[byte] = cleared | (state.to_bits() << shift);
    }

    /// Sets every frame to `state`.
    pub fn fill(&mut self, state: FrameState) {
        for index in 0..self.len {
            self.set(index, state);
        }
    }

    /// Returns an iterator over the states of all frames in index order.
    pub fn iter(&self) -> impl Iterator<Item = FrameState> + '_ {
        (0..self.len).map(|index| self.get(index))
    }

    /// Returns the raw encoded bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.bytes
    }
}
