//! Request-size classes for the report histogram.
//!
//! Classes run from 16 bytes to 32KB. A request falls into the smallest class
//! that holds it; anything above `MAX_SMALL_SIZE` lands in the large bucket.

use serde::{Deserialize, Serialize};

/// Smallest class (bytes).
pub const MIN_SIZE: usize = 16;

/// Largest small class (bytes). Above this, requests count as large.
pub const MAX_SMALL_SIZE: usize = 32 * 1024; // 32KB

/// Number of small classes.
pub const NUM_SIZE_CLASSES: usize = 32;

/// Bins 0-7: 16-byte steps, 8-15: 32-byte steps, then wider steps up to 32KB.
const SIZE_TABLE: [usize; NUM_SIZE_CLASSES] = [
    16, 32, 48, 64, 80, 96, 112, 128, // 16-byte steps
    160, 192, 224, 256, 288, 320, 352, 384, // 32-byte steps
    448, 512, 640, 768, 896, 1024, 1280, 1536, // wider steps
    2048, 2560, 3072, 4096, 8192, 16384, 24576, 32768, // large small classes
];

/// Class index for a request of `size` bytes; `NUM_SIZE_CLASSES` means large.
#[must_use]
pub fn bin_index(size: usize) -> usize {
    let size = size.max(MIN_SIZE);
    if size > MAX_SMALL_SIZE {
        return NUM_SIZE_CLASSES;
    }
    SIZE_TABLE
        .iter()
        .position(|&class_size| size <= class_size)
        .unwrap_or(NUM_SIZE_CLASSES)
}

/// Upper bound of a class, 0 for the large bucket or out-of-range indices.
#[must_use]
pub fn bin_size(index: usize) -> usize {
    SIZE_TABLE.get(index).copied().unwrap_or(0)
}

/// One histogram row in the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeClassBucket {
    /// Largest request in this class; `None` for the large bucket.
    pub max_size: Option<usize>,
    pub count: u64,
    pub bytes: u64,
}

/// Request counts per size class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeClassHistogram {
    counts: [u64; NUM_SIZE_CLASSES + 1],
    bytes: [u64; NUM_SIZE_CLASSES + 1],
}

impl SizeClassHistogram {
    #[must_use]
    pub fn new() -> Self {
        Self {
            counts: [0; NUM_SIZE_CLASSES + 1],
            bytes: [0; NUM_SIZE_CLASSES + 1],
        }
    }

    /// Count one request of `size` bytes.
    pub fn add(&mut self, size: usize) {
        let bin = bin_index(size);
        self.counts[bin] = self.counts[bin].saturating_add(1);
        self.bytes[bin] = self.bytes[bin].saturating_add(size as u64);
    }

    /// Non-empty classes in ascending size order, large bucket last.
    #[must_use]
    pub fn buckets(&self) -> Vec<SizeClassBucket> {
        (0..=NUM_SIZE_CLASSES)
            .filter(|&bin| self.counts[bin] > 0)
            .map(|bin| SizeClassBucket {
                max_size: (bin < NUM_SIZE_CLASSES).then(|| bin_size(bin)),
                count: self.counts[bin],
                bytes: self.bytes[bin],
            })
            .collect()
    }
}

impl Default for SizeClassHistogram {
    fn default() -> Self {
        Self::new()
    }
}
