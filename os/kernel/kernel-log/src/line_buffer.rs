use arrayvec::ArrayString;
use core::fmt;

/// Fixed-capacity UTF-8 buffer that formats without allocating.
///
/// Writes past the capacity are cut at the last character boundary that fits
/// and flag the buffer as [truncated](Self::is_truncated).
pub struct LineBuffer<const N: usize> {
    text: ArrayString<N>,
    truncated: bool,
}

impl<const N: usize> LineBuffer<N> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            text: ArrayString::new_const(),
            truncated: false,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        self.text.as_str()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.text.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    #[must_use]
    pub const fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn clear(&mut self) {
        self.text.clear();
        self.truncated = false;
    }

    /// If truncated, overwrite the tail with `marker`.
    pub fn mark_truncation(&mut self, marker: &str) {
        if !self.truncated || marker.len() > N {
            return;
        }
        let mut cut = self.text.len().min(N - marker.len());
        while !self.text.is_char_boundary(cut) {
            cut -= 1;
        }
        self.text.truncate(cut);
        // `cut` leaves room for the marker.
        self.text.push_str(marker);
    }
}

impl<const N: usize> Default for LineBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> fmt::Write for LineBuffer<N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let mut take = s.len().min(self.text.remaining_capacity());
        while !s.is_char_boundary(take) {
            take -= 1;
        }
        self.text.try_push_str(&s[..take]).map_err(|_| fmt::Error)?;
        if take < s.len() {
            self.truncated = true;
        }
        Ok(())
    }
}

impl<const N: usize> fmt::Debug for LineBuffer<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}
