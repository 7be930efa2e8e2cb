//! Fixed-capacity bit vector over borrowed storage.
//!
//! The allocator's bitmaps live in memory it does not own (a fixed region
//! set up before any allocation exists, or pages of the kernel heap), so the
//! bitmap only borrows its bytes. Bit `i` is bit `i % 8` of byte `i / 8`.

pub struct Bitmap<'a> {
    bytes: &'a mut [u8],
    bits: u32,
}

impl<'a> Bitmap<'a> {
    /// Tracks `bits` bits in `bytes`. The contents are taken as they are.
    ///
    /// # Panics
    /// If `bytes` is too short to hold `bits` bits.
    pub fn new(bytes: &'a mut [u8], bits: u32) -> Self {
        assert!(
            bytes.len() >= bits.div_ceil(8) as usize,
            "{} bytes cannot hold {bits} bits",
            bytes.len()
        );
        Self { bytes, bits }
    }

    #[must_use]
    pub const fn bits(&self) -> u32 {
        self.bits
    }

    /// Lowest index starting a run of `count` clear bits.
    #[must_use]
    pub fn scan(&self, count: u32) -> Option<u32> {
        if count == 0 || count > self.bits {
            return None;
        }
        let mut run = 0;
        let mut i = 0;
        while i < self.bits {
            // Whole bytes of set bits can never start or extend a run.
            if run == 0 && i % 8 == 0 && self.bytes[(i / 8) as usize] == 0xff {
                i += 8;
                continue;
            }
            if self.test(i) {
                run = 0;
            } else {
                run += 1;
                if run == count {
                    return Some(i + 1 - count);
                }
            }
            i += 1;
        }
        None
    }

    /// # Panics
    /// If `index` is out of range.
    #[must_use]
    pub fn test(&self, index: u32) -> bool {
        let (byte, mask) = self.locate(index);
        self.bytes[byte] & mask != 0
    }

    /// # Panics
    /// If `index` is out of range.
    pub fn set(&mut self, index: u32, value: bool) {
        let (byte, mask) = self.locate(index);
        if value {
            self.bytes[byte] |= mask;
        } else {
            self.bytes[byte] &= !mask;
        }
    }

    /// # Panics
    /// If the range does not fit.
    pub fn set_range(&mut self, start: u32, count: u32, value: bool) {
        for index in start..start + count {
            self.set(index, value);
        }
    }

    /// Whether all of `start..start + count` are set (`false` if out of range).
    #[must_use]
    pub fn all_set(&self, start: u32, count: u32) -> bool {
        start
            .checked_add(count)
            .is_some_and(|end| end <= self.bits && (start..end).all(|i| self.test(i)))
    }

    pub fn clear_all(&mut self) {
        self.bytes[..self.bits.div_ceil(8) as usize].fill(0);
    }

    #[must_use]
    pub fn count_set(&self) -> u32 {
        (0..self.bits).map(|i| u32::from(self.test(i))).sum()
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.bits.div_ceil(8) as usize]
    }

    fn locate(&self, index: u32) -> (usize, u8) {
        assert!(index < self.bits, "bit {index} out of range ({} bits)", self.bits);
        ((index / 8) as usize, 1 << (index % 8))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_is_first_fit() {
        let mut storage = [0u8; 4];
        let mut bitmap = Bitmap::new(&mut storage, 32);

        assert_eq!(bitmap.scan(3), Some(0));
        bitmap.set_range(0, 3, true);
        assert_eq!(bitmap.scan(2), Some(3));
        bitmap.set_range(3, 2, true);
        bitmap.set_range(0, 3, false);
        assert_eq!(bitmap.scan(3), Some(0));
        assert_eq!(bitmap.scan(4), Some(5));
        assert_eq!(bitmap.as_bytes()[0], 0b0001_1000);
    }

    #[test]
    fn scan_skips_full_bytes_and_respects_capacity() {
        let mut storage = [0xffu8, 0xff, 0b0000_0111];
        let bitmap = Bitmap::new(&mut storage, 20);

        assert_eq!(bitmap.scan(1), Some(19));
        assert_eq!(bitmap.scan(2), None);
        assert_eq!(bitmap.scan(0), None);
    }

    #[test]
    fn capacity_is_bit_precise() {
        let mut storage = [0u8; 2];
        let mut bitmap = Bitmap::new(&mut storage, 10);

        assert_eq!(bitmap.scan(10), Some(0));
        assert_eq!(bitmap.scan(11), None);
        bitmap.set(9, true);
        assert!(bitmap.test(9));
        assert_eq!(bitmap.scan(10), None);
        assert_eq!(bitmap.count_set(), 1);
    }

    #[test]
    fn clear_all_only_touches_tracked_bytes() {
        let mut storage = [0xffu8; 3];
        {
            let mut bitmap = Bitmap::new(&mut storage, 9);
            bitmap.clear_all();
            assert_eq!(bitmap.count_set(), 0);
            assert!(!bitmap.all_set(0, 1));
        }
        assert_eq!(storage, [0, 0, 0xff]);
    }

    #[test]
    fn all_set_checks_bounds() {
        let mut storage = [0u8; 1];
        let mut bitmap = Bitmap::new(&mut storage, 8);
        bitmap.set_range(2, 3, true);
        assert!(bitmap.all_set(2, 3));
        assert!(!bitmap.all_set(2, 4));
        assert!(!bitmap.all_set(7, 2));
        assert!(!bitmap.all_set(u32::MAX, 2));
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn out_of_range_bit_panics() {
        let mut storage = [0u8; 1];
        let bitmap = Bitmap::new(&mut storage, 4);
        let _ = bitmap.test(4);
    }
}
