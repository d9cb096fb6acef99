// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A key-value store for raw NOR-style flash.
//!
//! The partition is split into sectors. Each sector starts with a small header
//! and then holds an append-only run of chunks, one per write of a key. The
//! newest chunk for a key wins; erasing a key appends a tombstone. An index in
//! RAM maps every key to its newest chunk and is rebuilt at `Store::enable` by
//! scanning flash. Sectors are reclaimed by marking them for cleaning, copying
//! their live chunks elsewhere and erasing them. The store always tries to keep
//! one sector completely empty so that there is room to do that.
//!
//! Memory use is fixed at compile time by the `KEYS` and `SECTORS` parameters
//! of `Store`; nothing allocates.

#![cfg_attr(not(test), no_std)]

pub mod low_level;

mod gc;
mod key_map;
mod space;

pub use crate::key_map::Key;
pub use crate::low_level::{
    EraseError, Flash, Geometry, MAX_KEY_LENGTH, MAX_VALUE_LENGTH,
};

use crate::key_map::{KeyMap, KeyMapEntry};
use crate::low_level::{
    ChunkHeader, ChunkKind, CleaningHeader, SectorHeader, WORKING_BUFFER_LEN,
};
use crate::space::SpaceMap;
use tracing::{debug, info, warn};

/// Things that can go wrong with store operations.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Error<E> {
    /// The call was malformed: bad key, misaligned offset, out-of-bounds
    /// read, oversized value.
    InvalidArgument,
    /// The key is absent or has been erased.
    NotFound,
    /// No space could be found even after garbage collection, or the index
    /// is full.
    ResourceExhausted,
    /// Flash contents at an address we trusted don't check out.
    DataLoss,
    /// The store isn't enabled, or flash holds a format we don't support.
    FailedPrecondition,
    /// The store was configured too small for what's on flash.
    Internal,
    /// The flash device lacks a capability we needed.
    Unimplemented,
    /// An underlying flash access error occurred.
    Flash(E),
}

impl<E> From<E> for Error<E> {
    fn from(e: E) -> Self {
        Self::Flash(e)
    }
}

/// Occupancy figures, as reported by `Store::stats`.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Stats {
    pub sectors: u32,
    /// Sectors with nothing in them since their last reset.
    pub empty_sectors: u32,
    /// Sectors marked for cleaning and not yet reclaimed.
    pub pending_sectors: u32,
    /// Free bytes across all sectors that can still be written.
    pub bytes_remaining: u32,
    pub keys: usize,
    /// Erased keys whose tombstones are still on flash.
    pub tombstones: usize,
}

/// The key-value store.
///
/// `KEYS` bounds the number of distinct keys (tombstones included) and
/// `SECTORS` the number of sectors the partition may have.
///
/// All mutation goes through `&mut self`, which serializes it; reads take
/// `&self`. A store shared between contexts must be wrapped in a lock by its
/// owner.
pub struct Store<F: Flash, const KEYS: usize = 64, const SECTORS: usize = 32> {
    flash: F,
    geometry: Geometry,
    keys: KeyMap<KEYS>,
    space: SpaceMap<SECTORS>,
    /// Clean order for the next sector marked for cleaning. Recovered at
    /// boot as one past the largest on flash.
    next_clean_order: u32,
    enabled: bool,
}

impl<F: Flash, const KEYS: usize, const SECTORS: usize> Store<F, KEYS, SECTORS> {
    /// Wraps `flash`. Nothing is read until `enable`.
    pub fn new(flash: F) -> Self {
        let geometry = Geometry::of(&flash);
        Self {
            flash,
            geometry,
            keys: KeyMap::new(),
            space: SpaceMap::new(),
            next_clean_order: 0,
            enabled: false,
        }
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    /// Gives the flash device back, dropping the in-memory index.
    pub fn into_inner(self) -> F {
        self.flash
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Forgets the in-memory index. Everything but `enable` fails with
    /// `FailedPrecondition` until the store is enabled again.
    pub fn disable(&mut self) {
        self.enabled = false;
        self.keys.clear();
        self.space.reset(0, 0);
    }

    /// Scans the partition and rebuilds the index. Sectors that were never
    /// initialized are formatted.
    ///
    /// Calling this on an enabled store does nothing.
    pub fn enable(&mut self) -> Result<(), Error<F::Error>> {
        if self.enabled {
            return Ok(());
        }

        let geometry = Geometry::of(&self.flash);
        if !geometry.is_valid() {
            warn!(?geometry, "partition geometry unusable");
            return Err(Error::FailedPrecondition);
        }
        if geometry.sector_count as usize > SECTORS {
            warn!(
                sectors = geometry.sector_count,
                capacity = SECTORS,
                "partition has more sectors than the store can track"
            );
            return Err(Error::Internal);
        }

        self.geometry = geometry;
        self.keys.clear();
        self.space.reset(geometry.sector_count as usize, geometry.usable_bytes());

        let mut max_clean_order = None;
        let mut dirty = [false; SECTORS];
        for sector in 0..geometry.sector_count {
            dirty[sector as usize] = self.scan_sector(sector)?;

            let order = self.space.get(sector).clean_order;
            if order != CleaningHeader::NOT_PENDING {
                max_clean_order = max_clean_order.max(Some(order));
            }
        }
        self.next_clean_order = max_clean_order.map_or(0, |o| o.saturating_add(1));

        for sector in 0..geometry.sector_count {
            if dirty[sector as usize] {
                warn!(sector, "unexpected data past end of sector; retiring it");
                self.mark_sector_for_clean(sector)?;
            }
        }

        self.settle()?;
        self.enabled = true;

        info!(
            keys = self.keys.len(),
            sectors = geometry.sector_count,
            next_clean_order = self.next_clean_order,
            "store enabled"
        );
        Ok(())
    }

    /// Indexes every valid chunk in `sector` and works out its free space.
    ///
    /// Returns `true` if a sector that isn't pending has something other than
    /// erased flash after its last valid chunk, meaning it can't safely be
    /// appended to.
    fn scan_sector(&mut self, sector: u32) -> Result<bool, Error<F::Error>> {
        let g = self.geometry;

        let header = match low_level::read_sector_header(&self.flash, &g, sector)? {
            Some(header) => header,
            None => {
                debug!(sector, "sector not initialized; resetting");
                self.reset_sector(sector)?;
                return Ok(false);
            }
        };
        if header.version != SectorHeader::VERSION {
            warn!(sector, version = header.version, "unsupported sector version");
            return Err(Error::FailedPrecondition);
        }
        if u32::from(header.alignment) != g.alignment {
            warn!(
                sector,
                alignment = header.alignment,
                expected = g.alignment,
                "sector formatted with different alignment"
            );
            return Err(Error::FailedPrecondition);
        }

        let clean_order = low_level::read_clean_order(&self.flash, &g, sector)?;
        if clean_order != CleaningHeader::NOT_PENDING {
            debug!(sector, clean_order, "sector pending cleaning");
            self.space.mark_pending(sector, clean_order);
        }

        let base = g.sector_base(sector);
        let mut offset = g.chunk_start();
        let mut buffer = [0u8; WORKING_BUFFER_LEN];

        while offset + g.chunk_header_len() <= g.sector_size {
            let address = base + offset;
            let header = match low_level::read_chunk_header(&self.flash, address)? {
                Some(header) => header,
                None => break,
            };
            let len = g.chunk_len(
                usize::from(header.key_len.get()),
                usize::from(header.value_len.get()),
            );
            if offset + len > g.sector_size {
                warn!(sector, offset, len, "chunk overruns its sector");
                break;
            }
            offset += len;

            let crc = low_level::checksum_on_flash(&self.flash, &g, address, &header, &mut buffer)?;
            if crc != header.crc.get() {
                // Most likely a write cut short by power loss. Whatever this
                // chunk replaced is still the current value.
                warn!(address, "skipping chunk with bad checksum");
                continue;
            }

            let mut raw = [0u8; MAX_KEY_LENGTH];
            let key = low_level::read_key(&self.flash, &g, address, &header, &mut raw)?;
            // Can't fail: `read_chunk_header` already bounded `key_len`.
            let key = Key::new(key).ok_or(Error::DataLoss)?;
            self.index_chunk(key, address, &header, clean_order)?;
        }

        if self.space.is_pending(sector) {
            return Ok(false);
        }
        self.space.get_mut(sector).bytes_remaining = g.sector_size - offset;

        let tail = g.sector_size - offset;
        Ok(tail > 0 && !self.flash.is_erased(base + offset, tail)?)
    }

    /// Records a chunk found during the boot scan, unless the index already
    /// holds a newer one for the same key.
    ///
    /// Within a sector later chunks are newer. Across sectors, the copy in the
    /// sector with the greater clean order is newer; sectors that aren't
    /// pending compare greatest of all, since anything relocated out of a
    /// pending sector lands in one of them.
    fn index_chunk(
        &mut self,
        key: Key,
        address: u32,
        header: &ChunkHeader,
        clean_order: u32,
    ) -> Result<(), Error<F::Error>> {
        let entry = KeyMapEntry::new(
            key,
            address,
            header.value_len.get(),
            header.is_tombstone(),
        );

        match self.keys.find(key.as_bytes()) {
            None => {
                if self.keys.insert(entry).is_none() {
                    warn!(capacity = KEYS, "key map overflowed during scan");
                    return Err(Error::Internal);
                }
            }
            Some(index) => {
                let existing = self.keys.get_mut(index);
                let existing_sector = self.geometry.sector_of(existing.address);
                let existing_order = self.space.get(existing_sector).clean_order;

                if clean_order >= existing_order {
                    if clean_order == existing_order
                        && clean_order != CleaningHeader::NOT_PENDING
                        && existing_sector != self.geometry.sector_of(address)
                    {
                        // Can't happen unless flash was tampered with. Keep
                        // the copy from the higher-numbered sector.
                        warn!(?key, clean_order, "two pending sectors share a clean order");
                    }
                    *existing = entry;
                }
            }
        }
        Ok(())
    }

    /// Reads `out.len()` bytes of the value of `key`, starting `offset` bytes
    /// in. `offset` must be a multiple of the partition alignment.
    ///
    /// Only a read of the entire value is checked against the chunk checksum.
    pub fn get(
        &self,
        key: &[u8],
        offset: usize,
        out: &mut [u8],
    ) -> Result<(), Error<F::Error>> {
        self.check_enabled()?;
        let key = Self::validate_key(key)?;
        if offset % self.geometry.alignment as usize != 0 {
            return Err(Error::InvalidArgument);
        }
        let entry = self.live_entry(&key)?;

        let header = low_level::probe_chunk_header(&self.flash, entry.address)?
            .ok_or(Error::DataLoss)?;
        if header.value_len.get() != entry.value_len {
            return Err(Error::DataLoss);
        }

        let end = offset.checked_add(out.len()).ok_or(Error::InvalidArgument)?;
        if end > usize::from(entry.value_len) {
            return Err(Error::InvalidArgument);
        }

        let value_address = self.geometry.value_address(entry.address, key.len());
        self.flash.read(value_address + offset as u32, out)?;

        if offset == 0
            && out.len() == usize::from(entry.value_len)
            && low_level::checksum(key.as_bytes(), out) != header.crc.get()
        {
            warn!(?key, address = entry.address, "value fails checksum");
            return Err(Error::DataLoss);
        }
        Ok(())
    }

    /// Length of the current value of `key`.
    pub fn get_value_size(&self, key: &[u8]) -> Result<u16, Error<F::Error>> {
        self.check_enabled()?;
        let key = Self::validate_key(key)?;
        Ok(self.live_entry(&key)?.value_len)
    }

    /// Stores `value` as the value of `key`, replacing any previous value.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), Error<F::Error>> {
        self.check_enabled()?;
        let key = Self::validate_key(key)?;
        if value.len() > MAX_VALUE_LENGTH {
            return Err(Error::InvalidArgument);
        }

        if let Some(index) = self.keys.find(key.as_bytes()) {
            return self.rewrite(index, ChunkKind::Value, value);
        }
        if self.keys.is_full() && self.keys.iter().any(|e| e.tombstone) {
            debug!("key map full of tombstones; collecting first");
            match self.full_garbage_collect() {
                Ok(()) | Err(Error::ResourceExhausted) => {}
                Err(e) => return Err(e),
            }
        }
        if self.keys.is_full() {
            warn!(capacity = KEYS, "key map full");
            return Err(Error::ResourceExhausted);
        }

        let len = self.geometry.chunk_len(key.len(), value.len());
        let mut sector = self.space.find_space(len).ok_or(Error::ResourceExhausted)?;

        if self.space.count() > 1 && self.space.is_last_free(sector) {
            debug!(len, "write would use the last free sector; collecting first");
            match self.full_garbage_collect() {
                Ok(()) | Err(Error::ResourceExhausted) => {}
                Err(e) => return Err(e),
            }
            sector = self.space.find_space(len).ok_or(Error::ResourceExhausted)?;
            if self.space.is_last_free(sector) {
                return Err(Error::ResourceExhausted);
            }
        }

        let address = self.append(sector, ChunkKind::Value, key.as_bytes(), value)?;
        self.keys
            .insert(KeyMapEntry::new(key, address, value.len() as u16, false))
            .ok_or(Error::Internal)?;

        self.settle()
    }

    /// Erases `key` by appending a tombstone.
    pub fn erase(&mut self, key: &[u8]) -> Result<(), Error<F::Error>> {
        self.check_enabled()?;
        let key = Self::validate_key(key)?;
        let index = self.keys.find(key.as_bytes())
            .filter(|&i| !self.keys.get(i).tombstone)
            .ok_or(Error::NotFound)?;
        self.rewrite(index, ChunkKind::Tombstone, &[])
    }

    /// Supersedes the chunk of the existing entry at `index`.
    fn rewrite(
        &mut self,
        index: usize,
        kind: ChunkKind,
        value: &[u8],
    ) -> Result<(), Error<F::Error>> {
        let entry = *self.keys.get(index);
        let tombstone = kind == ChunkKind::Tombstone;

        if usize::from(entry.value_len) == value.len()
            && entry.tombstone == tombstone
            && (tombstone || self.stored_value_matches(&entry, value)?)
        {
            debug!(key = ?entry.key, "value unchanged; skipping write");
            return Ok(());
        }

        let g = self.geometry;
        let len = g.chunk_len(entry.key.len(), value.len());
        let current = g.sector_of(entry.address);
        let sector = if self.space.get(current).bytes_remaining >= len {
            current
        } else {
            self.mark_sector_for_clean(current)?;
            self.space.find_space(len).ok_or(Error::ResourceExhausted)?
        };

        let address = self.append(sector, kind, entry.key.as_bytes(), value)?;
        let e = self.keys.get_mut(index);
        e.address = address;
        e.value_len = value.len() as u16;
        e.tombstone = tombstone;

        self.settle()
    }

    /// Checks whether the chunk behind `entry` already holds `value`: checksum
    /// first, then the bytes themselves.
    fn stored_value_matches(
        &self,
        entry: &KeyMapEntry,
        value: &[u8],
    ) -> Result<bool, Error<F::Error>> {
        let header = match low_level::probe_chunk_header(&self.flash, entry.address)? {
            Some(header) => header,
            None => return Ok(false),
        };
        if header.crc.get() != low_level::checksum(entry.key.as_bytes(), value) {
            return Ok(false);
        }

        let mut buffer = [0u8; WORKING_BUFFER_LEN];
        let at = self.geometry.value_address(entry.address, entry.key.len());
        Ok(self.flash.compare_contents(at, value, &mut buffer)?)
    }

    /// Writes a chunk at the end of `sector` and returns its address.
    fn append(
        &mut self,
        sector: u32,
        kind: ChunkKind,
        key: &[u8],
        value: &[u8],
    ) -> Result<u32, Error<F::Error>> {
        let address = self.next_free_address(sector);
        match low_level::write_chunk(&mut self.flash, &self.geometry, address, kind, key, value) {
            Ok(len) => {
                self.space.consume(sector, len);
                Ok(address)
            }
            Err(e) => {
                // Part of the chunk may be programmed. Nothing more goes in
                // after it; the sector is reclaimed by cleaning.
                warn!(sector, address, "chunk write failed; retiring sector");
                self.space.retire(sector);
                Err(Error::Flash(e))
            }
        }
    }

    fn next_free_address(&self, sector: u32) -> u32 {
        self.geometry.sector_base(sector + 1) - self.space.get(sector).bytes_remaining
    }

    /// Number of keys that currently have a value.
    pub fn key_count(&self) -> usize {
        self.iter().count()
    }

    /// The `ordinal`th key that currently has a value, with its value length.
    ///
    /// Ordinals shift whenever keys are erased or sectors cleaned, so don't
    /// hold on to them across mutations.
    pub fn key_at(&self, ordinal: usize) -> Result<(Key, u16), Error<F::Error>> {
        self.check_enabled()?;
        self.iter().nth(ordinal).ok_or(Error::NotFound)
    }

    /// Iterates over the keys that currently have a value, with their value
    /// lengths.
    pub fn iter(&self) -> impl Iterator<Item = (Key, u16)> + '_ {
        self.keys.iter()
            .filter(|e| !e.tombstone)
            .map(|e| (e.key, e.value_len))
    }

    pub fn stats(&self) -> Stats {
        Stats {
            sectors: self.space.count(),
            empty_sectors: self.space.empty_count() as u32,
            pending_sectors: self.space.iter().filter(|s| s.is_pending()).count() as u32,
            bytes_remaining: self.space.iter().map(|s| s.bytes_remaining).sum(),
            keys: self.key_count(),
            tombstones: self.keys.iter().filter(|e| e.tombstone).count(),
        }
    }

    fn check_enabled(&self) -> Result<(), Error<F::Error>> {
        if self.enabled {
            Ok(())
        } else {
            Err(Error::FailedPrecondition)
        }
    }

    fn validate_key(key: &[u8]) -> Result<Key, Error<F::Error>> {
        Key::new(key).ok_or(Error::InvalidArgument)
    }

    fn live_entry(&self, key: &Key) -> Result<KeyMapEntry, Error<F::Error>> {
        self.keys.find(key.as_bytes())
            .map(|i| *self.keys.get(i))
            .filter(|e| !e.tombstone)
            .ok_or(Error::NotFound)
    }
}
