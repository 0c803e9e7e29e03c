//! # Translation Table Formats
//!
//! A [`TableFormat`] describes the radix tree one aperture uses: how many
//! levels there are, which virtual-address bits index each level, and the
//! entry size per level. The page size governed by a level falls out of its
//! low bit. Formats are detected once per device (hardware generation) and
//! are immutable afterwards; everything downstream takes the format by
//! reference and never re-detects.

use gpu_addresses::GpuVirtualAddress;

/// Hardware generations and the translation format each one uses.
///
/// Resolved exactly once, at device format detection. The walker itself is
/// format-agnostic; this enum is how the per-device context names its pick.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FormatKind {
    /// Two-level format of older parts: 64 KiB leaf pages, 32-bit VA.
    Legacy,
    /// Three-level format of current parts: 4 KiB leaf pages, 39-bit VA.
    Current,
}

impl FormatKind {
    /// The format description for this generation.
    #[must_use]
    pub const fn format(self) -> &'static TableFormat {
        match self {
            Self::Legacy => &LEGACY_FORMAT,
            Self::Current => &CURRENT_FORMAT,
        }
    }
}

/// Describes one level of the radix tree.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LevelFormat {
    /// Lowest virtual-address bit indexing this level. Also determines the
    /// page size governed by the level: `1 << va_lo_bit`.
    pub va_lo_bit: u32,
    /// Highest virtual-address bit indexing this level (inclusive).
    pub va_hi_bit: u32,
    /// Entry size in bytes.
    pub entry_size: u32,
}

impl LevelFormat {
    /// Number of entries in one table instance at this level.
    #[inline]
    #[must_use]
    pub const fn entry_count(&self) -> u64 {
        1 << (self.va_hi_bit - self.va_lo_bit + 1)
    }

    /// Bytes of backing storage for one table instance at this level.
    #[inline]
    #[must_use]
    pub const fn table_len(&self) -> u64 {
        self.entry_count() * self.entry_size as u64
    }

    /// Bytes of virtual address space governed by a single entry.
    #[inline]
    #[must_use]
    pub const fn entry_span(&self) -> u64 {
        1 << self.va_lo_bit
    }

    /// Extract this level's index from a virtual address.
    #[inline]
    #[must_use]
    pub const fn index(&self, va: GpuVirtualAddress) -> u64 {
        va.level_index(self.va_lo_bit, self.va_hi_bit)
    }
}

/// A complete multi-level format, root level first.
#[derive(Debug)]
pub struct TableFormat {
    levels: &'static [LevelFormat],
}

/// Rejected format descriptions.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    #[error("format has no levels")]
    Empty,
    #[error("level {level} bit span does not adjoin its parent")]
    NonContiguousSpan { level: usize },
    #[error("level {level} entry size {entry_size} is not supported")]
    UnsupportedEntrySize { level: usize, entry_size: u32 },
}

impl TableFormat {
    /// Validate a custom format description.
    ///
    /// Level bit spans must be contiguous from root to leaf and entries must
    /// be eight bytes wide (the only width current hardware uses).
    ///
    /// # Errors
    /// See [`FormatError`].
    pub const fn new(levels: &'static [LevelFormat]) -> Result<Self, FormatError> {
        if levels.is_empty() {
            return Err(FormatError::Empty);
        }
        let mut i = 0;
        while i < levels.len() {
            if levels[i].entry_size != 8 {
                return Err(FormatError::UnsupportedEntrySize {
                    level: i,
                    entry_size: levels[i].entry_size,
                });
            }
            if i > 0 && levels[i].va_hi_bit + 1 != levels[i - 1].va_lo_bit {
                return Err(FormatError::NonContiguousSpan { level: i });
            }
            i += 1;
        }
        Ok(Self { levels })
    }

    /// All levels, root first.
    #[inline]
    #[must_use]
    pub const fn levels(&self) -> &[LevelFormat] {
        self.levels
    }

    #[inline]
    #[must_use]
    pub const fn level(&self, idx: usize) -> &LevelFormat {
        &self.levels[idx]
    }

    /// Index of the leaf level.
    #[inline]
    #[must_use]
    pub const fn leaf_level(&self) -> usize {
        self.levels.len() - 1
    }

    /// Page size governed by the leaf level.
    #[inline]
    #[must_use]
    pub const fn page_size(&self) -> u64 {
        self.levels[self.levels.len() - 1].entry_span()
    }

    /// One past the highest representable virtual address.
    #[inline]
    #[must_use]
    pub const fn va_limit(&self) -> u64 {
        1 << (self.levels[0].va_hi_bit + 1)
    }
}

const fn level(va_lo_bit: u32, va_hi_bit: u32) -> LevelFormat {
    LevelFormat {
        va_lo_bit,
        va_hi_bit,
        entry_size: 8,
    }
}

/// Legacy two-level format: directory bits `[31:22]`, table bits `[21:16]`,
/// 64 KiB leaf pages.
static LEGACY_FORMAT: TableFormat = TableFormat {
    levels: &[level(22, 31), level(16, 21)],
};

/// Current three-level format: bits `[38:30]`, `[29:21]`, `[20:12]`,
/// 4 KiB leaf pages.
static CURRENT_FORMAT: TableFormat = TableFormat {
    levels: &[level(30, 38), level(21, 29), level(12, 20)],
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_format_geometry() {
        let fmt = FormatKind::Current.format();
        assert_eq!(fmt.levels().len(), 3);
        assert_eq!(fmt.page_size(), 4096);
        assert_eq!(fmt.va_limit(), 1 << 39);
        assert_eq!(fmt.level(0).entry_count(), 512);
        assert_eq!(fmt.level(2).table_len(), 512 * 8);
    }

    #[test]
    fn legacy_format_geometry() {
        let fmt = FormatKind::Legacy.format();
        assert_eq!(fmt.levels().len(), 2);
        assert_eq!(fmt.page_size(), 64 * 1024);
        assert_eq!(fmt.va_limit(), 1 << 32);
        assert_eq!(fmt.level(0).entry_count(), 1024);
        assert_eq!(fmt.level(1).entry_count(), 64);
    }

    #[test]
    fn index_extraction_matches_spans() {
        let fmt = FormatKind::Current.format();
        let va = GpuVirtualAddress::new((3 << 30) | (5 << 21) | (7 << 12) | 0x123);
        assert_eq!(fmt.level(0).index(va), 3);
        assert_eq!(fmt.level(1).index(va), 5);
        assert_eq!(fmt.level(2).index(va), 7);
    }

    #[test]
    fn custom_format_validation() {
        static GAPPY: &[LevelFormat] = &[level(30, 38), level(12, 20)];
        assert_eq!(
            TableFormat::new(GAPPY).unwrap_err(),
            FormatError::NonContiguousSpan { level: 1 }
        );

        static WIDE: &[LevelFormat] = &[LevelFormat {
            va_lo_bit: 12,
            va_hi_bit: 20,
            entry_size: 16,
        }];
        assert_eq!(
            TableFormat::new(WIDE).unwrap_err(),
            FormatError::UnsupportedEntrySize {
                level: 0,
                entry_size: 16
            }
        );
    }
}
