//! Color-code allocation for the visibility id pass
//!
//! Every tracked object renders into the offscreen target with a flat
//! color that doubles as its identity. Codes come from a bounded 24-bit
//! pool; released codes are reused LIFO so live codes stay compact and
//! the pixel scan touches a dense code range.

use crate::core::error::Error;
use crate::core::types::Result;

/// Highest allocatable code. Code 0 is the clear color and never handed
/// out.
pub const MAX_COLOR_CODE: u32 = 0x00FF_FFFF;

/// A 24-bit RGB identifier uniquely bound to one tracked object during
/// one tracking epoch
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ColorCode(u32);

impl ColorCode {
    /// Wrap a raw code. Returns `None` for 0 (background) and anything
    /// beyond the 24-bit pool.
    pub fn new(raw: u32) -> Option<Self> {
        (raw > 0 && raw <= MAX_COLOR_CODE).then_some(Self(raw))
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// The flat material color for the id pass
    pub fn to_rgb(&self) -> [u8; 3] {
        [
            ((self.0 >> 16) & 0xFF) as u8,
            ((self.0 >> 8) & 0xFF) as u8,
            (self.0 & 0xFF) as u8,
        ]
    }

    /// Recover a code from a readback texel. Background texels decode to
    /// `None`.
    pub fn from_rgb(rgb: [u8; 3]) -> Option<Self> {
        Self::new(((rgb[0] as u32) << 16) | ((rgb[1] as u32) << 8) | rgb[2] as u32)
    }
}

/// Monotonic counter plus LIFO free list over the bounded code pool
pub struct ColorCodeAllocator {
    next: u32,
    free: Vec<ColorCode>,
    live: usize,
}

impl ColorCodeAllocator {
    pub fn new() -> Self {
        Self {
            next: 1,
            free: Vec::new(),
            live: 0,
        }
    }

    /// Hand out a code not held by any live allocation.
    ///
    /// Fails with `ColorPoolExhausted` when the pool bound is reached;
    /// callers must release codes for objects no longer tracked before
    /// more can be allocated.
    pub fn allocate(&mut self) -> Result<ColorCode> {
        let code = match self.free.pop() {
            Some(code) => code,
            None => {
                if self.next > MAX_COLOR_CODE {
                    return Err(Error::ColorPoolExhausted { live: self.live });
                }
                let code = ColorCode(self.next);
                self.next += 1;
                code
            }
        };
        self.live += 1;
        Ok(code)
    }

    /// Return a code to the pool for reuse
    pub fn release(&mut self, code: ColorCode) {
        debug_assert!(!self.free.contains(&code), "double release of {code:?}");
        self.live = self.live.saturating_sub(1);
        self.free.push(code);
    }

    /// Number of currently live allocations
    pub fn live(&self) -> usize {
        self.live
    }
}

impl Default for ColorCodeAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_codes_unique_while_live() {
        let mut allocator = ColorCodeAllocator::new();
        let mut live = HashSet::new();
        for _ in 0..1000 {
            let code = allocator.allocate().unwrap();
            assert!(live.insert(code), "duplicate live code {code:?}");
        }
        assert_eq!(allocator.live(), 1000);
    }

    #[test]
    fn test_release_reuses_lifo() {
        let mut allocator = ColorCodeAllocator::new();
        let a = allocator.allocate().unwrap();
        let b = allocator.allocate().unwrap();
        allocator.release(a);
        allocator.release(b);
        // Most recently released comes back first
        assert_eq!(allocator.allocate().unwrap(), b);
        assert_eq!(allocator.allocate().unwrap(), a);
    }

    #[test]
    fn test_interleaved_track_untrack_never_duplicates() {
        let mut allocator = ColorCodeAllocator::new();
        let mut live = HashSet::new();
        for round in 0..100 {
            let code = allocator.allocate().unwrap();
            assert!(live.insert(code));
            if round % 3 == 0 {
                let victim = *live.iter().next().unwrap();
                live.remove(&victim);
                allocator.release(victim);
            }
        }
    }

    #[test]
    fn test_exhaustion_and_recovery() {
        let mut allocator = ColorCodeAllocator {
            next: MAX_COLOR_CODE, // pool with 1 remaining fresh code
            free: Vec::new(),
            live: 0,
        };
        let code = allocator.allocate().unwrap();
        assert!(matches!(
            allocator.allocate(),
            Err(Error::ColorPoolExhausted { live: 1 })
        ));
        allocator.release(code);
        assert_eq!(allocator.allocate().unwrap(), code);
    }

    #[test]
    fn test_rgb_round_trip() {
        let code = ColorCode::new(0x00AB_CDEF).unwrap();
        assert_eq!(code.to_rgb(), [0xAB, 0xCD, 0xEF]);
        assert_eq!(ColorCode::from_rgb([0xAB, 0xCD, 0xEF]), Some(code));
        assert_eq!(ColorCode::from_rgb([0, 0, 0]), None);
    }
}
