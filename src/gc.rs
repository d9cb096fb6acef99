// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Space reclamation.
//!
//! A sector is reclaimed in two steps. First a cleaning header carrying the
//! next clean order is written into it, which takes it out of the set of
//! write targets for good. Then every chunk the index still points into it is
//! copied elsewhere and the sector is erased and reformatted. Power loss
//! between the two steps is harmless: the boot scan sees the cleaning header,
//! and where a key turns up both in the pending sector and in its new home,
//! the copy outside the pending sector wins.

use crate::low_level::{self, CleaningHeader, EraseError, Flash, WORKING_BUFFER_LEN};
use crate::{Error, Store};
use tracing::{debug, info, warn};

impl<F: Flash, const KEYS: usize, const SECTORS: usize> Store<F, KEYS, SECTORS> {
    /// Reclaims everything reclaimable: every sector already marked for
    /// cleaning, then every other sector holding data. Live chunks end up
    /// packed together, which leaves the most contiguous free space.
    pub fn garbage_collect(&mut self) -> Result<(), Error<F::Error>> {
        self.check_enabled()?;
        info!("full garbage collection requested");
        self.full_garbage_collect()
    }

    /// Erases and reformats `sector`. Devices that can't erase are tolerated
    /// as long as the sector is already blank.
    pub(crate) fn reset_sector(&mut self, sector: u32) -> Result<(), Error<F::Error>> {
        let g = self.geometry;
        match self.flash.erase(sector, 1) {
            Ok(()) => (),
            Err(EraseError::Unsupported) => {
                if !self.flash.is_erased(g.sector_base(sector), g.sector_size)? {
                    warn!(sector, "can't erase sector, and it isn't blank");
                    return Err(Error::Unimplemented);
                }
            }
            Err(EraseError::Flash(e)) => return Err(Error::Flash(e)),
        }
        low_level::write_sector_header(&mut self.flash, &g, sector)?;
        self.space.restore(sector);
        Ok(())
    }

    /// Writes the cleaning header for `sector` using the next clean order.
    /// A sector that's already pending keeps its order.
    pub(crate) fn mark_sector_for_clean(&mut self, sector: u32) -> Result<(), Error<F::Error>> {
        if self.space.is_pending(sector) {
            return Ok(());
        }
        let order = self.next_clean_order;
        if order == CleaningHeader::NOT_PENDING {
            warn!("clean order counter exhausted");
            return Err(Error::Internal);
        }

        let written = low_level::write_cleaning_header(&mut self.flash, &self.geometry, sector, order);
        // Even a failed write may have programmed part of the header, so the
        // sector is pending from here on and the order is spent. Cleaning
        // erases it regardless.
        self.space.mark_pending(sector, order);
        self.next_clean_order = order + 1;
        if let Err(e) = written {
            warn!(sector, "cleaning header write failed");
            return Err(Error::Flash(e));
        }
        debug!(sector, clean_order = order, "sector marked for cleaning");
        Ok(())
    }

    /// Moves every chunk the index points at out of the pending `sector`,
    /// then resets it.
    ///
    /// A tombstone is only needed while an older value for its key might
    /// still be on flash. That can only be in a pending sector, so tombstones
    /// are dropped when no other sector is pending and relocated otherwise.
    pub(crate) fn clean_sector(&mut self, sector: u32) -> Result<(), Error<F::Error>> {
        let others_pending = (0..self.space.count())
            .any(|s| s != sector && self.space.is_pending(s));

        let mut index = 0;
        while index < self.keys.len() {
            let entry = *self.keys.get(index);
            if self.geometry.sector_of(entry.address) != sector {
                index += 1;
                continue;
            }
            if entry.tombstone && !others_pending {
                debug!(key = ?entry.key, sector, "dropping tombstone");
                // The last entry moves into this slot; look at it next.
                self.keys.swap_remove(index);
                continue;
            }
            self.relocate_entry(index)?;
            index += 1;
        }

        self.reset_sector(sector)?;
        debug!(sector, "sector cleaned");
        Ok(())
    }

    /// Copies the chunk of entry `index` verbatim to wherever there's room,
    /// and repoints the entry at the copy.
    fn relocate_entry(&mut self, index: usize) -> Result<(), Error<F::Error>> {
        let entry = *self.keys.get(index);
        let g = self.geometry;

        if low_level::probe_chunk_header(&self.flash, entry.address)?.is_none() {
            warn!(key = ?entry.key, address = entry.address, "index points at something that isn't a chunk");
            return Err(Error::DataLoss);
        }

        let len = g.chunk_len(entry.key.len(), usize::from(entry.value_len));
        let sector = self.space.find_space(len).ok_or(Error::ResourceExhausted)?;
        let to = self.next_free_address(sector);

        let mut buffer = [0u8; WORKING_BUFFER_LEN];
        let piece = WORKING_BUFFER_LEN - WORKING_BUFFER_LEN % g.alignment as usize;
        if let Err(e) = self.flash.copy_within(entry.address, to, len, &mut buffer[..piece]) {
            warn!(sector, to, "relocation copy failed; retiring sector");
            self.space.retire(sector);
            return Err(Error::Flash(e));
        }
        self.space.consume(sector, len);
        self.keys.get_mut(index).address = to;

        debug!(key = ?entry.key, from = entry.address, to, "relocated chunk");
        Ok(())
    }

    /// Makes sure one sector is left empty, cleaning sectors until one is.
    /// Sectors already pending go first, oldest-numbered first; after that,
    /// whichever sector comes first is marked and cleaned.
    pub(crate) fn enforce_free_sector(&mut self) -> Result<(), Error<F::Error>> {
        let count = self.space.count();
        if count <= 1 || self.space.empty_count() > 0 {
            return Ok(());
        }

        for sector in 0..count {
            if self.space.is_pending(sector) {
                self.clean_sector(sector)?;
                if self.space.empty_count() > 0 {
                    return Ok(());
                }
            }
        }
        for sector in 0..count {
            if !self.space.is_pending(sector) {
                self.mark_sector_for_clean(sector)?;
                self.clean_sector(sector)?;
                if self.space.empty_count() > 0 {
                    return Ok(());
                }
            }
        }

        warn!("no sector could be freed");
        Err(Error::ResourceExhausted)
    }

    /// Runs `enforce_free_sector` after a mutation has already landed.
    /// Running short of space at this point isn't the caller's problem: it's
    /// logged, and the next write that can't be placed will fail.
    pub(crate) fn settle(&mut self) -> Result<(), Error<F::Error>> {
        match self.enforce_free_sector() {
            Err(Error::ResourceExhausted) => {
                warn!("unable to keep a sector free");
                Ok(())
            }
            result => result,
        }
    }

    pub(crate) fn full_garbage_collect(&mut self) -> Result<(), Error<F::Error>> {
        let count = self.space.count();

        for sector in 0..count {
            if self.space.is_pending(sector) {
                self.clean_sector(sector)?;
            }
        }

        if count <= 1 {
            // Nowhere to move live data to.
            return Ok(());
        }

        // Only sectors that held data going in; the ones we relocate into
        // are already compact.
        let mut occupied = [false; SECTORS];
        for sector in 0..count {
            occupied[sector as usize] = !self.space.is_empty(sector);
        }
        for sector in 0..count {
            if occupied[sector as usize] {
                self.mark_sector_for_clean(sector)?;
                self.clean_sector(sector)?;
            }
        }
        Ok(())
    }
}
