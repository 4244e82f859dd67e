/// Repeat count for sizes below the threshold.
pub const BASE_REPEAT: usize = 1000;

/// Repeats halve for every bit of `bytes >> REPEAT_SHIFT`.
pub const REPEAT_SHIFT: u32 = 16;

/// Repeat count for a unit moving `bytes`: 1000, halved once per bit above
/// 64 KiB, never below 1.
pub fn repeat_for(bytes: usize) -> usize {
    let mut repeat = BASE_REPEAT;
    let mut n = bytes >> REPEAT_SHIFT;
    while n != 0 {
        repeat >>= 1;
        n >>= 1;
    }
    repeat.max(1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepPoint {
    /// Bytes for two-sided and RMA sweeps, u64 elements for atomics.
    pub units: usize,
    pub bytes: usize,
    pub repeat: usize,
}

/// Powers of two from a lower to an upper bound, each with its repeat count.
#[derive(Debug, Clone)]
pub struct SizeSweep {
    next: Option<usize>,
    max: usize,
    unit_size: usize,
}

impl SizeSweep {
    pub fn bytes(min: usize, max: usize) -> Self {
        Self { next: Some(min.max(1)), max, unit_size: 1 }
    }

    /// Element counts `1, 2, 4, ..` up to `max_count` elements of `elem_size`.
    pub fn elements(max_count: usize, elem_size: usize) -> Self {
        Self { next: Some(1), max: max_count, unit_size: elem_size }
    }
}

impl Iterator for SizeSweep {
    type Item = SweepPoint;

    fn next(&mut self) -> Option<SweepPoint> {
        let units = self.next.filter(|&u| u <= self.max)?;
        self.next = units.checked_mul(2);
        let bytes = units * self.unit_size;
        Some(SweepPoint { units, bytes, repeat: repeat_for(bytes) })
    }
}
