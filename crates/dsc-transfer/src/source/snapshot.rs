//! Multi-part snapshots
//!
//! A directory or object prefix is listed once when the source opens and
//! read as the concatenation of its parts in name order. Offsets are global
//! over that concatenation. A chunk never spans two parts, so every chunk
//! carries exactly one part name.

/// One file or object inside a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    pub name: String,
    /// Global offset of the part's first byte
    pub start: u64,
    pub len: u64,
}

impl Part {
    pub fn end(&self) -> u64 {
        self.start + self.len
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartIndex {
    parts: Vec<Part>,
}

impl PartIndex {
    /// Lays out `(name, len)` entries back to back in the given order.
    /// Empty entries carry no bytes and are dropped.
    pub fn new(entries: impl IntoIterator<Item = (String, u64)>) -> Self {
        let mut start = 0;
        let parts = entries
            .into_iter()
            .filter(|(_, len)| *len > 0)
            .map(|(name, len)| {
                let part = Part { name, start, len };
                start += len;
                part
            })
            .collect();
        Self { parts }
    }

    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    pub fn total_len(&self) -> u64 {
        self.parts.last().map_or(0, Part::end)
    }

    /// Position of the part holding byte `offset`.
    pub fn locate(&self, offset: u64) -> Option<usize> {
        let index = self.parts.partition_point(|part| part.end() <= offset);
        (index < self.parts.len()).then_some(index)
    }

    /// Part holding `offset` and the read length clamped to its end.
    pub fn span(&self, offset: u64, max_len: usize) -> Option<(usize, usize)> {
        let index = self.locate(offset)?;
        let remaining = self.parts[index].end() - offset;
        Some((index, (max_len as u64).min(remaining) as usize))
    }
}
