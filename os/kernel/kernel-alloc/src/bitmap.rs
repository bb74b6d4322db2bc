//! # Fixed-capacity bitset
//!
//! One bit per tracked item, packed into `u64` words. `1` means used.
//! The storage is borrowed or owned through [`AsRef`]/[`AsMut`] so the frame
//! allocator can place its words in physical memory while tests use arrays.
//!
//! Bits past `len` in the last word are kept set at all times, so word scans
//! never report them as clear.

/// Bits per storage word.
pub const BITS_PER_WORD: usize = u64::BITS as usize;

/// Number of words needed for `len` bits.
#[inline]
#[must_use]
pub const fn words_for(len: usize) -> usize {
    len.div_ceil(BITS_PER_WORD)
}

/// Word index and bit offset of `bit`.
///
/// ```rust
/// # use kernel_alloc::bitmap::locate;
/// assert_eq!(locate(0), (0, 0));
/// assert_eq!(locate(63), (0, 63));
/// assert_eq!(locate(64), (1, 0));
/// assert_eq!(locate(130), (2, 2));
/// ```
#[inline]
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn locate(bit: usize) -> (usize, u32) {
    (bit / BITS_PER_WORD, (bit % BITS_PER_WORD) as u32)
}

pub struct Bitmap<W> {
    words: W,
    len: usize,
}

impl<W: AsRef<[u64]>> Bitmap<W> {
    /// Number of tracked bits.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    #[must_use]
    pub fn words(&self) -> &[u64] {
        &self.words.as_ref()[..words_for(self.len)]
    }

    /// Whether `bit` is set. Bits outside `0..len` read as set.
    #[must_use]
    pub fn test(&self, bit: usize) -> bool {
        if bit >= self.len {
            return true;
        }
        let (index, offset) = locate(bit);
        self.words.as_ref()[index] & (1 << offset) != 0
    }

    /// Number of set bits in `0..len`.
    #[must_use]
    pub fn count_ones(&self) -> usize {
        let padding = words_for(self.len) * BITS_PER_WORD - self.len;
        let total: usize = self.words().iter().map(|w| w.count_ones() as usize).sum();
        total - padding
    }

    /// Lowest clear bit, scanning from word `from_word` upward.
    #[must_use]
    pub fn first_clear(&self, from_word: usize) -> Option<usize> {
        self.words()
            .iter()
            .enumerate()
            .skip(from_word)
            .find(|(_, w)| **w != u64::MAX)
            .map(|(index, w)| index * BITS_PER_WORD + (!w).trailing_zeros() as usize)
            .filter(|bit| *bit < self.len)
    }

    /// Start of the lowest run of `count` clear bits, if any.
    #[must_use]
    pub fn find_clear_run(&self, count: usize) -> Option<usize> {
        if count == 0 || count > self.len {
            return None;
        }
        let mut start = 0;
        let mut run = 0;
        for bit in 0..self.len {
            if self.test(bit) {
                run = 0;
                start = bit + 1;
                continue;
            }
            run += 1;
            if run == count {
                return Some(start);
            }
        }
        None
    }

    /// Whether every bit in `start..start + count` is set.
    #[must_use]
    pub fn all_set(&self, start: usize, count: usize) -> bool {
        (start..start.saturating_add(count)).all(|bit| self.test(bit))
    }
}

impl<W: AsRef<[u64]> + AsMut<[u64]>> Bitmap<W> {
    /// Wrap `words`, setting every bit to `used`.
    ///
    /// `None` if `words` holds fewer than [`words_for`]`(len)` words.
    pub fn new(words: W, len: usize, used: bool) -> Option<Self> {
        if words.as_ref().len() < words_for(len) {
            return None;
        }
        let mut bitmap = Self { words, len };
        bitmap.fill(used);
        Some(bitmap)
    }

    /// Set every bit to `used`, keeping the padding bits set.
    pub fn fill(&mut self, used: bool) {
        let count = words_for(self.len);
        let words = &mut self.words.as_mut()[..count];
        words.fill(if used { u64::MAX } else { 0 });
        let (last, offset) = locate(self.len);
        if offset != 0 {
            words[last] |= u64::MAX << offset;
        }
    }

    /// Set `bit`; returns whether it was clear before.
    pub fn set(&mut self, bit: usize) -> bool {
        debug_assert!(bit < self.len);
        let (index, offset) = locate(bit);
        let word = &mut self.words.as_mut()[index];
        let was_clear = *word & (1 << offset) == 0;
        *word |= 1 << offset;
        was_clear
    }

    /// Clear `bit`; returns whether it was set before.
    pub fn clear(&mut self, bit: usize) -> bool {
        debug_assert!(bit < self.len);
        let (index, offset) = locate(bit);
        let word = &mut self.words.as_mut()[index];
        let was_set = *word & (1 << offset) != 0;
        *word &= !(1 << offset);
        was_set
    }

    /// Set `start..start + count` (clamped to `len`); returns how many bits changed.
    pub fn set_range(&mut self, start: usize, count: usize) -> usize {
        let end = start.saturating_add(count).min(self.len);
        (start..end).filter(|bit| self.set(*bit)).count()
    }

    /// Clear `start..start + count` (clamped to `len`); returns how many bits changed.
    pub fn clear_range(&mut self, start: usize, count: usize) -> usize {
        let end = start.saturating_add(count).min(self.len);
        (start..end).filter(|bit| self.clear(*bit)).count()
    }
}
