//! # Virtual Address Range Allocator
//!
//! First-fit over an address-ordered free list with coalescing on free.
//! Pure bookkeeping: the allocator hands out ranges of one aperture's VA
//! space and never touches tables or hardware.

use alloc::vec::Vec;
use gpu_addresses::GpuVirtualAddress;

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VaError {
    /// Recoverable: no free range satisfies the request right now.
    #[error("no free range of {len:#x} bytes (alignment {align:#x})")]
    NoVaSpace { len: u64, align: u64 },
    /// The requested fixed range is not entirely free.
    #[error("range {at}..+{len:#x} is not free")]
    NotFree { at: GpuVirtualAddress, len: u64 },
    /// Zero-length or overflowing request.
    #[error("invalid request of {len:#x} bytes")]
    InvalidRequest { len: u64 },
}

#[derive(Debug, Copy, Clone)]
struct FreeRange {
    start: u64,
    len: u64,
}

/// Free-VA accounting for one aperture.
#[derive(Debug)]
pub struct VaRangeAllocator {
    /// Disjoint, sorted by `start`, never adjacent (coalesced eagerly).
    free: Vec<FreeRange>,
}

impl VaRangeAllocator {
    /// An allocator owning the single free range `[start, start + len)`.
    #[must_use]
    pub fn new(start: GpuVirtualAddress, len: u64) -> Self {
        let mut free = Vec::with_capacity(8);
        if len > 0 {
            free.push(FreeRange {
                start: start.as_u64(),
                len,
            });
        }
        Self { free }
    }

    /// First free range that fits `len` bytes at `align`.
    ///
    /// # Errors
    /// [`VaError::NoVaSpace`] when nothing fits; [`VaError::InvalidRequest`]
    /// for zero length or a non-power-of-two alignment.
    pub fn alloc(&mut self, len: u64, align: u64) -> Result<GpuVirtualAddress, VaError> {
        if len == 0 || align == 0 || !align.is_power_of_two() {
            return Err(VaError::InvalidRequest { len });
        }
        for i in 0..self.free.len() {
            let r = self.free[i];
            let at = (r.start + align - 1) & !(align - 1);
            let pad = at - r.start;
            if pad + len > r.len {
                continue;
            }
            // Carve [at, at + len) out of the range.
            let tail_len = r.len - pad - len;
            if pad == 0 && tail_len == 0 {
                self.free.remove(i);
            } else if pad == 0 {
                self.free[i] = FreeRange {
                    start: at + len,
                    len: tail_len,
                };
            } else if tail_len == 0 {
                self.free[i].len = pad;
            } else {
                self.free[i].len = pad;
                self.free.insert(
                    i + 1,
                    FreeRange {
                        start: at + len,
                        len: tail_len,
                    },
                );
            }
            return Ok(GpuVirtualAddress::new(at));
        }
        Err(VaError::NoVaSpace { len, align })
    }

    /// Claim the fixed range `[at, at + len)`.
    ///
    /// # Errors
    /// [`VaError::NotFree`] unless the range lies entirely inside one free
    /// range.
    pub fn alloc_at(&mut self, at: GpuVirtualAddress, len: u64) -> Result<(), VaError> {
        if len == 0 {
            return Err(VaError::InvalidRequest { len });
        }
        let (start, end) = (at.as_u64(), at.as_u64() + len);
        for i in 0..self.free.len() {
            let r = self.free[i];
            if start < r.start || end > r.start + r.len {
                continue;
            }
            let pad = start - r.start;
            let tail_len = (r.start + r.len) - end;
            if pad == 0 && tail_len == 0 {
                self.free.remove(i);
            } else if pad == 0 {
                self.free[i] = FreeRange {
                    start: end,
                    len: tail_len,
                };
            } else if tail_len == 0 {
                self.free[i].len = pad;
            } else {
                self.free[i].len = pad;
                self.free.insert(i + 1, FreeRange { start: end, len: tail_len });
            }
            return Ok(());
        }
        Err(VaError::NotFree { at, len })
    }

    /// Return `[at, at + len)` to the free pool, merging with neighbors.
    pub fn free(&mut self, at: GpuVirtualAddress, len: u64) {
        if len == 0 {
            return;
        }
        let start = at.as_u64();
        let i = self.free.partition_point(|r| r.start < start);
        debug_assert!(i == 0 || self.free[i - 1].start + self.free[i - 1].len <= start);
        debug_assert!(i == self.free.len() || start + len <= self.free[i].start);
        self.free.insert(i, FreeRange { start, len });
        // Merge with the right, then the left neighbor.
        if i + 1 < self.free.len() && self.free[i].start + self.free[i].len == self.free[i + 1].start
        {
            self.free[i].len += self.free[i + 1].len;
            self.free.remove(i + 1);
        }
        if i > 0 && self.free[i - 1].start + self.free[i - 1].len == self.free[i].start {
            self.free[i - 1].len += self.free[i].len;
            self.free.remove(i);
        }
    }

    /// Length of the largest free range.
    #[must_use]
    pub fn largest_free(&self) -> u64 {
        self.free.iter().map(|r| r.len).max().unwrap_or(0)
    }

    /// Sum of all free bytes.
    #[must_use]
    pub fn total_free(&self) -> u64 {
        self.free.iter().map(|r| r.len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn va(v: u64) -> GpuVirtualAddress {
        GpuVirtualAddress::new(v)
    }

    #[test]
    fn first_fit_respects_alignment() {
        let mut a = VaRangeAllocator::new(va(0x1000), 0x10_000);
        assert_eq!(a.alloc(0x1000, 0x1000).unwrap(), va(0x1000));
        // 0x2000 is free but a 16 KiB-aligned request skips to 0x4000.
        assert_eq!(a.alloc(0x1000, 0x4000).unwrap(), va(0x4000));
        assert_eq!(a.alloc(0x2000, 0x1000).unwrap(), va(0x2000));
    }

    #[test]
    fn free_coalesces_both_sides() {
        let mut a = VaRangeAllocator::new(va(0), 0x6000);
        let x = a.alloc(0x2000, 0x1000).unwrap();
        let y = a.alloc(0x2000, 0x1000).unwrap();
        let z = a.alloc(0x2000, 0x1000).unwrap();
        assert_eq!(a.total_free(), 0);
        a.free(x, 0x2000);
        a.free(z, 0x2000);
        a.free(y, 0x2000);
        assert_eq!(a.total_free(), 0x6000);
        assert_eq!(a.largest_free(), 0x6000);
    }

    #[test]
    fn exhaustion_is_recoverable() {
        let mut a = VaRangeAllocator::new(va(0), 0x2000);
        let x = a.alloc(0x2000, 0x1000).unwrap();
        assert_eq!(
            a.alloc(0x1000, 0x1000).unwrap_err(),
            VaError::NoVaSpace {
                len: 0x1000,
                align: 0x1000
            }
        );
        a.free(x, 0x2000);
        assert!(a.alloc(0x1000, 0x1000).is_ok());
    }

    #[test]
    fn fixed_claims() {
        let mut a = VaRangeAllocator::new(va(0), 0x8000);
        a.alloc_at(va(0x3000), 0x1000).unwrap();
        assert_eq!(
            a.alloc_at(va(0x3000), 0x1000).unwrap_err(),
            VaError::NotFree {
                at: va(0x3000),
                len: 0x1000
            }
        );
        // First-fit now skips the hole.
        assert_eq!(a.alloc(0x4000, 0x1000).unwrap(), va(0x4000));
    }
}
