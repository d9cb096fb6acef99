// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-sector space accounting, and the placement policy built on it.

use crate::low_level::CleaningHeader;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct SectorSpace {
    /// Bytes still free at the end of the sector. Zero while pending.
    pub bytes_remaining: u32,
    /// `CleaningHeader::NOT_PENDING` unless the sector is marked for
    /// cleaning.
    pub clean_order: u32,
}

impl SectorSpace {
    const UNUSED: Self = Self {
        bytes_remaining: 0,
        clean_order: CleaningHeader::NOT_PENDING,
    };

    pub fn is_pending(&self) -> bool {
        self.clean_order != CleaningHeader::NOT_PENDING
    }
}

pub(crate) struct SpaceMap<const S: usize> {
    sectors: [SectorSpace; S],
    count: usize,
    /// Remaining bytes of a freshly reset sector.
    usable: u32,
}

impl<const S: usize> SpaceMap<S> {
    pub fn new() -> Self {
        Self {
            sectors: [SectorSpace::UNUSED; S],
            count: 0,
            usable: 0,
        }
    }

    /// Starts tracking `count` sectors, all considered empty.
    pub fn reset(&mut self, count: usize, usable: u32) {
        self.count = count;
        self.usable = usable;
        for s in &mut self.sectors[..count] {
            *s = SectorSpace {
                bytes_remaining: usable,
                clean_order: CleaningHeader::NOT_PENDING,
            };
        }
    }

    pub fn count(&self) -> u32 {
        self.count as u32
    }

    pub fn get(&self, sector: u32) -> &SectorSpace {
        &self.sectors[..self.count][sector as usize]
    }

    pub fn get_mut(&mut self, sector: u32) -> &mut SectorSpace {
        &mut self.sectors[..self.count][sector as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = &SectorSpace> + '_ {
        self.sectors[..self.count].iter()
    }

    /// A sector is empty if nothing was ever appended since its last reset.
    pub fn is_empty(&self, sector: u32) -> bool {
        let s = self.get(sector);
        !s.is_pending() && s.bytes_remaining == self.usable
    }

    pub fn empty_count(&self) -> usize {
        (0..self.count()).filter(|&s| self.is_empty(s)).count()
    }

    /// Whether `sector` is the only empty sector left.
    pub fn is_last_free(&self, sector: u32) -> bool {
        self.is_empty(sector) && self.empty_count() == 1
    }

    pub fn is_pending(&self, sector: u32) -> bool {
        self.get(sector).is_pending()
    }

    /// Marks `sector` restored to its freshly-reset state.
    pub fn restore(&mut self, sector: u32) {
        let usable = self.usable;
        *self.get_mut(sector) = SectorSpace {
            bytes_remaining: usable,
            clean_order: CleaningHeader::NOT_PENDING,
        };
    }

    /// Takes `sector` out of the set of write targets.
    pub fn mark_pending(&mut self, sector: u32, clean_order: u32) {
        *self.get_mut(sector) = SectorSpace {
            bytes_remaining: 0,
            clean_order,
        };
    }

    /// Stops appends to `sector` until it is reset, without marking it
    /// pending. Used when a write into it failed partway and the bytes after
    /// its last good chunk can no longer be trusted to be erased.
    pub fn retire(&mut self, sector: u32) {
        self.get_mut(sector).bytes_remaining = 0;
    }

    /// Records `len` bytes appended to `sector`.
    pub fn consume(&mut self, sector: u32, len: u32) {
        let s = self.get_mut(sector);
        s.bytes_remaining = s.bytes_remaining.saturating_sub(len);
    }

    /// Picks a sector with room for `len` bytes.
    ///
    /// The first empty sector found is held back, so that writes fill
    /// partially used sectors before eating into the last free one; it is
    /// only returned if nothing else fits.
    pub fn find_space(&self, len: u32) -> Option<u32> {
        if len > self.usable {
            return None;
        }

        let mut reserved = None;
        for sector in 0..self.count() {
            if reserved.is_none() && self.is_empty(sector) {
                reserved = Some(sector);
                continue;
            }
            if self.get(sector).bytes_remaining >= len {
                return Some(sector);
            }
        }
        reserved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(count: usize) -> SpaceMap<8> {
        let mut m = SpaceMap::new();
        m.reset(count, 100);
        m
    }

    #[test]
    fn first_empty_sector_is_held_back() {
        let m = map(3);
        assert_eq!(m.find_space(10), Some(1));
        assert_eq!(m.empty_count(), 3);
        assert!(!m.is_last_free(0));
    }

    #[test]
    fn partially_used_sector_preferred_over_later_empty() {
        let mut m = map(3);
        m.consume(1, 50);
        assert_eq!(m.find_space(40), Some(1));
        assert_eq!(m.find_space(60), Some(2));
        m.consume(2, 100);
        assert_eq!(m.find_space(60), Some(0));
    }

    #[test]
    fn reserved_sector_is_last_resort() {
        let mut m = map(2);
        m.consume(1, 90);
        assert_eq!(m.find_space(20), Some(0));
        assert!(m.is_last_free(0));
        assert_eq!(m.find_space(10), Some(1));
    }

    #[test]
    fn oversized_requests_never_fit() {
        let m = map(2);
        assert_eq!(m.find_space(101), None);
        assert_eq!(m.find_space(100), Some(1));
    }

    #[test]
    fn pending_sectors_are_not_targets() {
        let mut m = map(2);
        m.consume(0, 10);
        m.mark_pending(0, 3);
        assert!(m.is_pending(0));
        assert!(!m.is_empty(0));
        // Sector 1 is the only empty one, and also the only candidate.
        assert_eq!(m.find_space(10), Some(1));
        assert!(m.is_last_free(1));

        m.restore(0);
        assert!(!m.is_pending(0));
        assert_eq!(m.empty_count(), 2);
    }

    #[test]
    fn retired_sector_is_not_a_target() {
        let mut m = map(3);
        m.consume(1, 10);
        m.retire(1);
        assert!(!m.is_pending(1));
        assert!(!m.is_empty(1));
        assert_eq!(m.find_space(10), Some(2));
        m.restore(1);
        assert_eq!(m.empty_count(), 3);
    }

    #[test]
    fn single_sector_uses_reserved() {
        let mut m = map(1);
        assert_eq!(m.find_space(60), Some(0));
        m.consume(0, 60);
        assert_eq!(m.find_space(40), Some(0));
        assert_eq!(m.find_space(41), None);
    }
}
