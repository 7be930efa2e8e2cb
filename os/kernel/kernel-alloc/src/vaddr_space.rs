//! Page-granular bookkeeping of virtual address ranges.

use crate::bitmap::Bitmap;
use crate::error::{InvariantViolation, ensure};
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::{Size4K, VirtualAddress};

/// A range of virtual pages starting at `start`; bit `i` of the bitmap is set
/// while page `start + i * PAGE_SIZE` is reserved.
///
/// There is one for the kernel heap and one per process.
pub struct VirtualAddressSpace<'a> {
    start: VirtualAddress,
    bitmap: Bitmap<'a>,
}

impl<'a> VirtualAddressSpace<'a> {
    /// A space with nothing reserved.
    pub fn new(start: VirtualAddress, mut bitmap: Bitmap<'a>) -> Self {
        debug_assert!(start.is_aligned::<Size4K>());
        bitmap.clear_all();
        Self { start, bitmap }
    }

    #[must_use]
    pub const fn start(&self) -> VirtualAddress {
        self.start
    }

    #[must_use]
    pub const fn pages(&self) -> u32 {
        self.bitmap.bits()
    }

    #[must_use]
    pub fn reserved_pages(&self) -> u32 {
        self.bitmap.count_set()
    }

    #[must_use]
    pub fn bitmap(&self) -> &Bitmap<'a> {
        &self.bitmap
    }

    #[must_use]
    pub fn contains(&self, va: VirtualAddress) -> bool {
        self.index_of(va).is_some()
    }

    /// Reserves the lowest run of `count` free pages.
    pub fn reserve(&mut self, count: u32) -> Option<VirtualAddress> {
        let first = self.bitmap.scan(count)?;
        self.bitmap.set_range(first, count, true);
        Some(self.start + first * PAGE_SIZE)
    }

    /// Reserves exactly the page at `va`.
    ///
    /// # Errors
    /// `va` is outside the space or already reserved.
    pub fn reserve_at(&mut self, va: VirtualAddress) -> Result<(), InvariantViolation> {
        let index = self.index_of(va).ok_or(InvariantViolation::OutsideSpace { va })?;
        ensure(!self.bitmap.test(index), InvariantViolation::AlreadyReserved { va })?;
        self.bitmap.set(index, true);
        Ok(())
    }

    /// Checks that all `count` pages from `va` are reserved.
    ///
    /// # Errors
    /// The range leaves the space or contains a free page.
    pub fn check_reserved(&self, va: VirtualAddress, count: u32) -> Result<(), InvariantViolation> {
        let index = self.index_of(va).ok_or(InvariantViolation::OutsideSpace { va })?;
        ensure(self.bitmap.all_set(index, count), InvariantViolation::NotReserved { va })
    }

    /// Gives back `count` pages from `va`.
    ///
    /// # Errors
    /// Same as [`check_reserved`](Self::check_reserved); nothing is released then.
    pub fn release(&mut self, va: VirtualAddress, count: u32) -> Result<(), InvariantViolation> {
        self.check_reserved(va, count)?;
        let index = (va.as_u32() - self.start.as_u32()) / PAGE_SIZE;
        self.bitmap.set_range(index, count, false);
        Ok(())
    }

    /// Forgets every reservation.
    pub fn clear(&mut self) {
        self.bitmap.clear_all();
    }

    fn index_of(&self, va: VirtualAddress) -> Option<u32> {
        if !va.is_aligned::<Size4K>() {
            return None;
        }
        let index = va.checked_offset_from(self.start)? / PAGE_SIZE;
        (index < self.bitmap.bits()).then_some(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const START: VirtualAddress = VirtualAddress::new(0xc010_0000);

    #[test]
    fn reserve_first_fit_and_reuse() {
        let mut storage = [0u8; 2];
        let mut space = VirtualAddressSpace::new(START, Bitmap::new(&mut storage, 16));

        let a = space.reserve(3).unwrap();
        let b = space.reserve(2).unwrap();
        assert_eq!(a, START);
        assert_eq!(b, START + 3 * PAGE_SIZE);

        space.release(a, 3).unwrap();
        assert_eq!(space.reserve(3), Some(START));
        assert_eq!(space.reserved_pages(), 5);
        assert_eq!(space.bitmap().as_bytes()[0], 0b0001_1111);
    }

    #[test]
    fn reserve_fails_without_a_long_enough_run() {
        let mut storage = [0u8; 1];
        let mut space = VirtualAddressSpace::new(START, Bitmap::new(&mut storage, 8));
        space.reserve_at(START + 4 * PAGE_SIZE).unwrap();
        assert_eq!(space.reserve(5), None);
        assert_eq!(space.reserve(4), Some(START));
    }

    #[test]
    fn fixed_reservation_rules() {
        let mut storage = [0u8; 1];
        let mut space = VirtualAddressSpace::new(START, Bitmap::new(&mut storage, 8));
        let page = START + 2 * PAGE_SIZE;

        space.reserve_at(page).unwrap();
        assert_eq!(space.reserve_at(page), Err(InvariantViolation::AlreadyReserved { va: page }));

        let past = START + 8 * PAGE_SIZE;
        assert_eq!(space.reserve_at(past), Err(InvariantViolation::OutsideSpace { va: past }));
        let below = VirtualAddress::new(0xc00f_f000);
        assert_eq!(space.reserve_at(below), Err(InvariantViolation::OutsideSpace { va: below }));
    }

    #[test]
    fn releasing_unreserved_pages_is_refused() {
        let mut storage = [0u8; 1];
        let mut space = VirtualAddressSpace::new(START, Bitmap::new(&mut storage, 8));
        let a = space.reserve(2).unwrap();

        assert_eq!(space.release(a, 3), Err(InvariantViolation::NotReserved { va: a }));
        assert_eq!(space.reserved_pages(), 2);
        space.release(a, 2).unwrap();
        assert_eq!(space.release(a, 1), Err(InvariantViolation::NotReserved { va: a }));
    }
}
