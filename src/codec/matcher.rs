//! Boyer–Moore byte search using the bad-character rule

/// Finds every occurrence of a fixed byte pattern in a buffer.
#[derive(Debug, Clone)]
pub struct ByteMatcher {
    pattern: Vec<u8>,
    /// Right-most index of each byte value within the pattern
    last_occurrence: [Option<usize>; 256],
}

impl ByteMatcher {
    /// Build a matcher for `pattern`.
    ///
    /// # Panics
    ///
    /// Panics if `pattern` is empty.
    pub fn new(pattern: impl Into<Vec<u8>>) -> Self {
        Self::try_new(pattern).expect("ByteMatcher pattern must not be empty")
    }

    /// Build a matcher, returning `None` for an empty pattern
    pub fn try_new(pattern: impl Into<Vec<u8>>) -> Option<Self> {
        let pattern = pattern.into();
        if pattern.is_empty() {
            return None;
        }

        let mut last_occurrence = [None; 256];
        for (i, &b) in pattern.iter().enumerate() {
            last_occurrence[b as usize] = Some(i);
        }

        Some(Self {
            pattern,
            last_occurrence,
        })
    }

    pub fn pattern(&self) -> &[u8] {
        &self.pattern
    }

    /// All match positions in `buffer`, ascending, overlaps included
    pub fn find_all(&self, buffer: &[u8]) -> Vec<usize> {
        self.find_all_in(buffer, 0, buffer.len())
    }

    /// Match positions within `buffer[offset..offset + length]`.
    ///
    /// Returned indices are relative to the start of `buffer`.
    ///
    /// # Panics
    ///
    /// Panics if the range lies outside `buffer`.
    pub fn find_all_in(&self, buffer: &[u8], offset: usize, length: usize) -> Vec<usize> {
        let end = offset + length;
        assert!(end <= buffer.len(), "match range exceeds buffer");

        let n = self.pattern.len();
        let mut matches = Vec::new();
        let mut aligned_at = offset;

        while aligned_at + n <= end {
            let mut index_in_pattern = n;
            loop {
                index_in_pattern -= 1;
                let index_in_buffer = aligned_at + index_in_pattern;
                let x = buffer[index_in_buffer];

                if x != self.pattern[index_in_pattern] {
                    aligned_at = match self.last_occurrence[x as usize] {
                        None => index_in_buffer + 1,
                        Some(r) => {
                            let shift = index_in_buffer as isize - (aligned_at + r) as isize;
                            aligned_at + shift.max(1) as usize
                        }
                    };
                    break;
                }

                if index_in_pattern == 0 {
                    matches.push(aligned_at);
                    aligned_at += 1;
                    break;
                }
            }
        }

        matches
    }

    /// First match position in `buffer`, if any
    pub fn find_first(&self, buffer: &[u8]) -> Option<usize> {
        self.find_all(buffer).into_iter().next()
    }
}
