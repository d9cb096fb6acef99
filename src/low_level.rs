// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! On-flash layout and the chunk-level primitives the store is built from.
//!
//! Nothing in here keeps state: every function takes the flash device and the
//! partition `Geometry` explicitly, which makes these routines usable from
//! tooling that wants to poke at an image without enabling a full store.

use core::mem::size_of;
use zerocopy::{AsBytes, FromBytes, Unaligned};
use num_traits::FromPrimitive;

//////////////////////////////////////////////////////////////////////////////
// Convenience wrappers for zerocopy.

/// Decodes a `T` from the front of `bytes`, copying it out.
///
/// Returns `None` if `bytes` is too short. Flash contents are untrusted, so
/// this never hands out references into the source buffer.
pub fn decode<T>(bytes: &[u8]) -> Option<T>
    where T: FromBytes + Unaligned + Copy,
{
    zerocopy::LayoutVerified::<_, T>::new_unaligned_from_prefix(bytes)
        .map(|(lv, _)| *lv)
}

//////////////////////////////////////////////////////////////////////////////
// At-rest layout.

/// Shorthand for a `u16` in little-endian representation.
type U16LE = zerocopy::U16<byteorder::LittleEndian>;
/// Shorthand for a `u32` in little-endian representation.
type U32LE = zerocopy::U32<byteorder::LittleEndian>;

/// Value of every byte in an erased region of flash.
pub const ERASED_BYTE: u8 = 0xFF;

/// Longest key, in bytes, the store accepts.
pub const MAX_KEY_LENGTH: usize = 32;

/// Longest value, in bytes. Bounded by the width of `ChunkHeader::value_len`.
pub const MAX_VALUE_LENGTH: usize = u16::MAX as usize;

/// Largest write granularity we support. Also the size of the scratch buffer
/// used to pad the tail of a write.
pub const MAX_ALIGNMENT: u32 = 128;

/// Size of the scratch buffers used to move data between flash and checksum
/// or flash and flash.
pub(crate) const WORKING_BUFFER_LEN: usize = 256;

/// Header written to the start of every initialized sector.
#[derive(Copy, Clone, Debug, FromBytes, AsBytes, Unaligned, Eq, PartialEq)]
#[repr(C)]
pub struct SectorHeader {
    /// Marker (`EXPECTED_MAGIC`) distinguishing this from erased or arbitrary
    /// data.
    pub magic: U16LE,
    /// Format version; must be `VERSION`.
    pub version: u8,
    /// Write alignment of the partition that formatted this sector. All
    /// sectors in a partition must agree.
    pub alignment: u8,
    /// Reserved, written as zero.
    pub pad: U16LE,
}

impl SectorHeader {
    /// Bits we expect to find in the `magic` field.
    pub const EXPECTED_MAGIC: u16 = 0xAB_CD;
    /// The only format version this implementation reads or writes.
    pub const VERSION: u8 = 4;

    pub fn new(alignment: u32) -> Self {
        Self {
            magic: Self::EXPECTED_MAGIC.into(),
            version: Self::VERSION,
            alignment: alignment as u8,
            pad: 0.into(),
        }
    }
}

/// Header written just after the `SectorHeader` when a sector is marked for
/// cleaning. It stays erased for sectors that are not pending.
#[derive(Copy, Clone, Debug, FromBytes, AsBytes, Unaligned, Eq, PartialEq)]
#[repr(C)]
pub struct CleaningHeader {
    /// Position of this sector in the global order in which sectors were
    /// marked for cleaning.
    pub clean_order: U32LE,
}

impl CleaningHeader {
    /// Clean order of a sector that is not pending. Reads back from an erased
    /// header, and compares greater than every real clean order.
    pub const NOT_PENDING: u32 = u32::MAX;
}

/// Header at the start of every chunk. Followed by the key and the value, each
/// padded to the partition alignment.
#[derive(Copy, Clone, Debug, FromBytes, AsBytes, Unaligned, Eq, PartialEq)]
#[repr(C)]
pub struct ChunkHeader {
    /// Marker (`EXPECTED_MAGIC`) designating a chunk.
    pub magic: U16LE,
    /// CRC-16 over the key bytes followed by the value bytes.
    pub crc: U16LE,
    /// See `ChunkKind` for defined values.
    pub flags: u8,
    /// Length of the key in bytes, without padding.
    pub key_len: U16LE,
    /// Length of the value in bytes, without padding. Zero for tombstones.
    pub value_len: U16LE,
}

impl ChunkHeader {
    /// Bits we expect to find in the `magic` field.
    pub const EXPECTED_MAGIC: u16 = 0x55_AA;

    pub fn new(kind: ChunkKind, key: &[u8], value: &[u8]) -> Self {
        Self {
            magic: Self::EXPECTED_MAGIC.into(),
            crc: checksum(key, value).into(),
            flags: kind as u8,
            key_len: (key.len() as u16).into(),
            value_len: (value.len() as u16).into(),
        }
    }

    pub fn kind(&self) -> Option<ChunkKind> {
        ChunkKind::from_u8(self.flags)
    }

    pub fn is_tombstone(&self) -> bool {
        self.kind() == Some(ChunkKind::Tombstone)
    }

    /// Basic internal integrity check of the header. This can't see the
    /// checksum (that needs the chunk body) or the sector bounds.
    pub fn check(&self) -> bool {
        let key_len = usize::from(self.key_len.get());
        self.magic.get() == Self::EXPECTED_MAGIC
            && key_len > 0
            && key_len <= MAX_KEY_LENGTH
            && match self.kind() {
                Some(ChunkKind::Value) => true,
                Some(ChunkKind::Tombstone) => self.value_len.get() == 0,
                None => false,
            }
    }
}

/// Defined values for the `ChunkHeader::flags` field. Bit 0 marks a
/// tombstone; the remaining bits are reserved and must be clear.
#[derive(Copy, Clone, Debug, Eq, PartialEq, num_derive::FromPrimitive)]
pub enum ChunkKind {
    /// A chunk carrying the current value of its key.
    Value = 0x00,
    /// A chunk recording that its key was erased. Has no value bytes.
    Tombstone = 0x01,
}

//////////////////////////////////////////////////////////////////////////////
// Checksum.

static CHECKSUM: crc::Crc<u16> = crc::Crc::<u16>::new(&crc::CRC_16_IBM_3740);

/// Computes the chunk checksum over `key` followed by `value`.
pub fn checksum(key: &[u8], value: &[u8]) -> u16 {
    let mut digest = CHECKSUM.digest();
    digest.update(key);
    digest.update(value);
    digest.finalize()
}

//////////////////////////////////////////////////////////////////////////////
// Flash device interface.

/// Trait describing a flash partition for the purposes of our datastore.
///
/// Addresses are byte offsets from the start of the partition; sector `n`
/// begins at `n * sector_size()`.
pub trait Flash {
    /// Error type that can be produced during flash accesses.
    type Error;

    /// Size of the smallest independently erasable region, in bytes. Note
    /// that this operation cannot fail; it's expected to always return the
    /// same result.
    fn sector_size(&self) -> u32;

    /// Number of sectors in the partition.
    fn sector_count(&self) -> u32;

    /// Minimum write granularity, in bytes. The store only ever issues writes
    /// whose address and length are multiples of this.
    fn alignment(&self) -> u32;

    /// Reads `dest.len()` bytes starting at `address`.
    ///
    /// On failure, you can leave `dest` partially or completely untouched.
    fn read(&self, address: u32, dest: &mut [u8]) -> Result<(), Self::Error>;

    /// Programs `data` at `address`. The target range is always erased.
    ///
    /// On error the range _may or may not_ contain the data.
    fn write(&mut self, address: u32, data: &[u8]) -> Result<(), Self::Error>;

    /// Erases `count` sectors starting with sector `index`.
    ///
    /// Devices that cannot erase (for example partitions smaller than a
    /// sector) return `EraseError::Unsupported`; the store tolerates that
    /// only when the sector already reads as erased.
    fn erase(
        &mut self,
        index: u32,
        count: u32,
    ) -> Result<(), EraseError<Self::Error>>;

    /// Checks whether `len` bytes starting at `address` are in the erased
    /// state. Headers are never trusted without asking this first.
    ///
    /// The default implementation reads the range and compares against
    /// `ERASED_BYTE`. Devices whose erased state doesn't read back that way
    /// (encrypted flash, for instance, returns noise) must override it.
    fn is_erased(&self, address: u32, len: u32) -> Result<bool, Self::Error> {
        let mut buffer = [0u8; 64];
        let mut done = 0;
        while done < len {
            let n = usize::min(buffer.len(), (len - done) as usize);
            let piece = &mut buffer[..n];
            self.read(address + done, piece)?;
            if piece.iter().any(|&b| b != ERASED_BYTE) {
                return Ok(false);
            }
            done += n as u32;
        }
        Ok(true)
    }

    /// Compares `data.len()` bytes starting at `address` for equality with
    /// `data`.
    ///
    /// This is a "pushed compare" operation to take advantage of situations
    /// where we can do the compare without reading everything into RAM, such
    /// as directly-addressable flash.
    ///
    /// The `buffer` argument is loaned to the driver, which may arbitrarily
    /// scribble over its contents while doing the compare.
    ///
    /// The default implementation uses `read`.
    fn compare_contents(
        &self,
        address: u32,
        mut data: &[u8],
        buffer: &mut [u8],
    ) -> Result<bool, Self::Error> {
        let mut address = address;
        while !data.is_empty() {
            let n = usize::min(buffer.len(), data.len());
            let (this_data, next_data) = data.split_at(n);
            self.read(address, &mut buffer[..n])?;
            if buffer[..n] != *this_data {
                return Ok(false);
            }
            address += n as u32;
            data = next_data;
        }
        Ok(true)
    }

    /// Copies `len` bytes from `from` to `to` within the partition.
    ///
    /// `len` and `buffer.len()` are multiples of the alignment, so every
    /// piece written is aligned. Drivers that can do a flash-to-flash copy
    /// without going through RAM can implement this to do so. The default
    /// implementation uses `read`/`write`.
    fn copy_within(
        &mut self,
        from: u32,
        to: u32,
        len: u32,
        buffer: &mut [u8],
    ) -> Result<(), Self::Error> {
        let mut done = 0;
        while done < len {
            let n = usize::min(buffer.len(), (len - done) as usize);
            let piece = &mut buffer[..n];
            self.read(from + done, piece)?;
            self.write(to + done, piece)?;
            done += n as u32;
        }
        Ok(())
    }
}

/// Things that can go wrong with `Flash::erase`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EraseError<E> {
    /// The device can't erase this range at all.
    Unsupported,
    Flash(E),
}

impl<E> From<E> for EraseError<E> {
    fn from(e: E) -> Self {
        Self::Flash(e)
    }
}

/// Shape of a partition, captured from its `Flash` implementation, plus the
/// derived layout of a sector.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Geometry {
    pub sector_size: u32,
    pub sector_count: u32,
    pub alignment: u32,
}

impl Geometry {
    pub fn of<F: Flash>(flash: &F) -> Self {
        Self {
            sector_size: flash.sector_size(),
            sector_count: flash.sector_count(),
            alignment: flash.alignment(),
        }
    }

    /// Checks that the partition can hold this format at all: alignment in
    /// range, sectors made of whole write units and big enough for the
    /// headers plus the smallest chunk, and every address fitting in a `u32`.
    pub fn is_valid(&self) -> bool {
        if self.alignment == 0 || self.alignment > MAX_ALIGNMENT {
            return false;
        }
        if self.sector_count == 0 || self.sector_size % self.alignment != 0 {
            return false;
        }
        let total = u64::from(self.sector_size) * u64::from(self.sector_count);
        total <= u64::from(u32::MAX)
            && self.sector_size >= self.chunk_start() + self.chunk_len(1, 0)
    }

    /// Rounds `len` up to the next multiple of the alignment.
    pub fn align(&self, len: u32) -> u32 {
        (len + self.alignment - 1) / self.alignment * self.alignment
    }

    pub fn sector_header_len(&self) -> u32 {
        self.align(size_of::<SectorHeader>() as u32)
    }

    /// Offset of the `CleaningHeader` within a sector.
    pub fn cleaning_header_offset(&self) -> u32 {
        self.sector_header_len()
    }

    pub fn cleaning_header_len(&self) -> u32 {
        self.align(size_of::<CleaningHeader>() as u32)
    }

    /// Offset within a sector of its first chunk.
    pub fn chunk_start(&self) -> u32 {
        self.sector_header_len() + self.cleaning_header_len()
    }

    /// Bytes available for chunks in an empty sector.
    pub fn usable_bytes(&self) -> u32 {
        self.sector_size - self.chunk_start()
    }

    pub fn chunk_header_len(&self) -> u32 {
        self.align(size_of::<ChunkHeader>() as u32)
    }

    /// Number of bytes a chunk occupies on flash, padding included.
    pub fn chunk_len(&self, key_len: usize, value_len: usize) -> u32 {
        self.chunk_header_len()
            + self.align(key_len as u32)
            + self.align(value_len as u32)
    }

    pub fn sector_base(&self, sector: u32) -> u32 {
        sector * self.sector_size
    }

    pub fn sector_of(&self, address: u32) -> u32 {
        address / self.sector_size
    }

    /// Address of the key bytes of the chunk at `address`.
    pub fn key_address(&self, address: u32) -> u32 {
        address + self.chunk_header_len()
    }

    /// Address of the value bytes of the chunk at `address`.
    pub fn value_address(&self, address: u32, key_len: usize) -> u32 {
        self.key_address(address) + self.align(key_len as u32)
    }
}

//////////////////////////////////////////////////////////////////////////////
// Reading.

/// Reads and validates the sector header of `sector`.
///
/// Returns `Ok(None)` for an uninitialized sector: one whose header region
/// is erased or doesn't carry the magic number. Version and alignment are
/// left to the caller.
pub fn read_sector_header<F: Flash>(
    flash: &F,
    geometry: &Geometry,
    sector: u32,
) -> Result<Option<SectorHeader>, F::Error> {
    let address = geometry.sector_base(sector);
    let len = size_of::<SectorHeader>();
    if flash.is_erased(address, len as u32)? {
        return Ok(None);
    }
    let mut raw = [0u8; size_of::<SectorHeader>()];
    flash.read(address, &mut raw)?;
    Ok(decode::<SectorHeader>(&raw)
        .filter(|h| h.magic.get() == SectorHeader::EXPECTED_MAGIC))
}

/// Reads the clean order of `sector`, or `CleaningHeader::NOT_PENDING` if its
/// cleaning header is erased.
pub fn read_clean_order<F: Flash>(
    flash: &F,
    geometry: &Geometry,
    sector: u32,
) -> Result<u32, F::Error> {
    let address = geometry.sector_base(sector) + geometry.cleaning_header_offset();
    let len = size_of::<CleaningHeader>();
    if flash.is_erased(address, len as u32)? {
        return Ok(CleaningHeader::NOT_PENDING);
    }
    let mut raw = [0u8; size_of::<CleaningHeader>()];
    flash.read(address, &mut raw)?;
    Ok(decode::<CleaningHeader>(&raw)
        .map_or(CleaningHeader::NOT_PENDING, |h| h.clean_order.get()))
}

/// Reads the chunk header at `address`.
///
/// Returns `Ok(None)` if the header region is erased or fails
/// `ChunkHeader::check`; either way this is the end of valid data in the
/// sector.
pub fn read_chunk_header<F: Flash>(
    flash: &F,
    address: u32,
) -> Result<Option<ChunkHeader>, F::Error> {
    let len = size_of::<ChunkHeader>();
    if flash.is_erased(address, len as u32)? {
        return Ok(None);
    }
    let mut raw = [0u8; size_of::<ChunkHeader>()];
    flash.read(address, &mut raw)?;
    Ok(decode::<ChunkHeader>(&raw).filter(ChunkHeader::check))
}

/// Reads the chunk header at `address` checking only its magic, as a cheap
/// check that an address taken from the index still points at a chunk.
pub fn probe_chunk_header<F: Flash>(
    flash: &F,
    address: u32,
) -> Result<Option<ChunkHeader>, F::Error> {
    let mut raw = [0u8; size_of::<ChunkHeader>()];
    flash.read(address, &mut raw)?;
    Ok(decode::<ChunkHeader>(&raw)
        .filter(|h| h.magic.get() == ChunkHeader::EXPECTED_MAGIC))
}

/// Reads the key of the chunk at `address` into `out`, returning the filled
/// prefix.
pub fn read_key<'o, F: Flash>(
    flash: &F,
    geometry: &Geometry,
    address: u32,
    header: &ChunkHeader,
    out: &'o mut [u8; MAX_KEY_LENGTH],
) -> Result<&'o [u8], F::Error> {
    let key = &mut out[..usize::from(header.key_len.get())];
    flash.read(geometry.key_address(address), key)?;
    Ok(key)
}

/// Recomputes the checksum of the chunk at `address` from its contents on
/// flash. `buffer` will be scribbled on as scratch.
pub fn checksum_on_flash<F: Flash>(
    flash: &F,
    geometry: &Geometry,
    address: u32,
    header: &ChunkHeader,
    buffer: &mut [u8],
) -> Result<u16, F::Error> {
    let mut digest = CHECKSUM.digest();
    let key_len = usize::from(header.key_len.get());
    let spans = [
        (geometry.key_address(address), key_len),
        (geometry.value_address(address, key_len), usize::from(header.value_len.get())),
    ];
    for (mut at, mut remaining) in spans {
        while remaining > 0 {
            let n = usize::min(buffer.len(), remaining);
            flash.read(at, &mut buffer[..n])?;
            digest.update(&buffer[..n]);
            at += n as u32;
            remaining -= n;
        }
    }
    Ok(digest.finalize())
}

//////////////////////////////////////////////////////////////////////////////
// Writing.

/// Writes `data` at `address`, zero-padding the final partial write unit.
/// Returns the number of bytes consumed on flash.
pub(crate) fn write_padded<F: Flash>(
    flash: &mut F,
    geometry: &Geometry,
    address: u32,
    data: &[u8],
) -> Result<u32, F::Error> {
    let alignment = geometry.alignment as usize;
    let aligned = data.len() - data.len() % alignment;
    let (body, tail) = data.split_at(aligned);

    if !body.is_empty() {
        flash.write(address, body)?;
    }
    if !tail.is_empty() {
        let mut padded = [0u8; MAX_ALIGNMENT as usize];
        padded[..tail.len()].copy_from_slice(tail);
        flash.write(address + aligned as u32, &padded[..alignment])?;
    }

    Ok(geometry.align(data.len() as u32))
}

/// Writes (formats) the sector header of `sector`. The sector must be erased.
pub(crate) fn write_sector_header<F: Flash>(
    flash: &mut F,
    geometry: &Geometry,
    sector: u32,
) -> Result<(), F::Error> {
    let header = SectorHeader::new(geometry.alignment);
    write_padded(flash, geometry, geometry.sector_base(sector), header.as_bytes())?;
    Ok(())
}

/// Writes the cleaning header of `sector`, marking it pending with
/// `clean_order`.
pub(crate) fn write_cleaning_header<F: Flash>(
    flash: &mut F,
    geometry: &Geometry,
    sector: u32,
    clean_order: u32,
) -> Result<(), F::Error> {
    let header = CleaningHeader {
        clean_order: clean_order.into(),
    };
    let address = geometry.sector_base(sector) + geometry.cleaning_header_offset();
    write_padded(flash, geometry, address, header.as_bytes())?;
    Ok(())
}

/// Appends a chunk at `address`: header, then key, then value, each padded.
///
/// Pieces are written strictly in order, so on a write failure the header
/// may be present with a body that won't checksum. The boot scan skips such
/// chunks.
///
/// On success returns the number of bytes consumed, which is always
/// `geometry.chunk_len(key.len(), value.len())`.
pub(crate) fn write_chunk<F: Flash>(
    flash: &mut F,
    geometry: &Geometry,
    address: u32,
    kind: ChunkKind,
    key: &[u8],
    value: &[u8],
) -> Result<u32, F::Error> {
    let header = ChunkHeader::new(kind, key, value);

    let mut at = address;
    at += write_padded(flash, geometry, at, header.as_bytes())?;
    at += write_padded(flash, geometry, at, key)?;
    at += write_padded(flash, geometry, at, value)?;

    Ok(at - address)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// RAM-backed NOR flash.
    ///
    /// Programming a byte that isn't erased, or issuing a misaligned write,
    /// panics: the store must never do either.
    pub struct FakeFlash {
        data: Vec<u8>,
        sector_size: u32,
        alignment: u32,
        /// Number of successful `write` calls.
        pub writes: usize,
        /// Number of sectors erased.
        pub erases: usize,
        /// Makes `erase` report `EraseError::Unsupported`.
        pub erase_unsupported: bool,
        /// Fails one upcoming `write` without programming anything: `Some(n)`
        /// lets `n` more writes through first.
        pub fail_write: Option<usize>,
    }

    impl FakeFlash {
        pub fn new(sector_size: u32, sector_count: u32, alignment: u32) -> Self {
            Self {
                data: vec![ERASED_BYTE; (sector_size * sector_count) as usize],
                sector_size,
                alignment,
                writes: 0,
                erases: 0,
                erase_unsupported: false,
                fail_write: None,
            }
        }

        pub fn bytes(&self) -> &[u8] {
            &self.data
        }

        /// Raw access that bypasses programming rules, for corrupting things.
        pub fn bytes_mut(&mut self) -> &mut [u8] {
            &mut self.data
        }
    }

    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub enum FakeFlashError {
        OutOfBounds,
        /// Requested through `FakeFlash::fail_write`.
        Injected,
    }

    impl FakeFlash {
        fn range(&self, address: u32, len: usize) -> Result<core::ops::Range<usize>, FakeFlashError> {
            let start = address as usize;
            let end = start.checked_add(len).ok_or(FakeFlashError::OutOfBounds)?;
            if end > self.data.len() {
                return Err(FakeFlashError::OutOfBounds);
            }
            Ok(start..end)
        }
    }

    impl Flash for FakeFlash {
        type Error = FakeFlashError;

        fn sector_size(&self) -> u32 {
            self.sector_size
        }

        fn sector_count(&self) -> u32 {
            self.data.len() as u32 / self.sector_size
        }

        fn alignment(&self) -> u32 {
            self.alignment
        }

        fn read(&self, address: u32, dest: &mut [u8]) -> Result<(), Self::Error> {
            let range = self.range(address, dest.len())?;
            dest.copy_from_slice(&self.data[range]);
            Ok(())
        }

        fn write(&mut self, address: u32, data: &[u8]) -> Result<(), Self::Error> {
            if address % self.alignment != 0 || data.len() as u32 % self.alignment != 0 {
                panic!("misaligned write of {} bytes at {address:#x}", data.len());
            }
            match self.fail_write {
                Some(0) => {
                    self.fail_write = None;
                    return Err(FakeFlashError::Injected);
                }
                Some(n) => self.fail_write = Some(n - 1),
                None => (),
            }
            let range = self.range(address, data.len())?;
            let target = &mut self.data[range];
            if target.iter().any(|&b| b != ERASED_BYTE) {
                panic!("attempt to double-program at {address:#x}");
            }
            target.copy_from_slice(data);
            self.writes += 1;
            Ok(())
        }

        fn erase(&mut self, index: u32, count: u32) -> Result<(), EraseError<Self::Error>> {
            if self.erase_unsupported {
                return Err(EraseError::Unsupported);
            }
            let start = self.sector_size * index;
            let range = self.range(start, (self.sector_size * count) as usize)?;
            self.data[range].fill(ERASED_BYTE);
            self.erases += count as usize;
            Ok(())
        }
    }

    fn geometry(flash: &FakeFlash) -> Geometry {
        Geometry::of(flash)
    }

    #[test]
    fn geometry_layout_alignment_4() {
        let flash = FakeFlash::new(4096, 2, 4);
        let g = geometry(&flash);
        assert!(g.is_valid());
        assert_eq!(g.sector_header_len(), 8);
        assert_eq!(g.cleaning_header_offset(), 8);
        assert_eq!(g.cleaning_header_len(), 4);
        assert_eq!(g.chunk_start(), 12);
        assert_eq!(g.usable_bytes(), 4084);
        assert_eq!(g.chunk_header_len(), 12);
        assert_eq!(g.chunk_len(1, 100), 12 + 4 + 100);
        assert_eq!(g.chunk_len(1, 0), 16);
        assert_eq!(g.sector_of(4096 + 12), 1);
    }

    #[test]
    fn geometry_rejects_nonsense() {
        let bad = [
            Geometry { sector_size: 4096, sector_count: 2, alignment: 0 },
            Geometry { sector_size: 4096, sector_count: 2, alignment: 256 },
            Geometry { sector_size: 4096, sector_count: 0, alignment: 4 },
            Geometry { sector_size: 4098, sector_count: 2, alignment: 4 },
            Geometry { sector_size: 16, sector_count: 2, alignment: 4 },
        ];
        for g in bad {
            assert!(!g.is_valid(), "{g:?} should be rejected");
        }
    }

    #[test]
    fn checksum_is_ccitt_false() {
        // Standard check value for CRC-16/IBM-3740 over "123456789".
        assert_eq!(checksum(b"1234", b"56789"), 0x29B1);
    }

    #[test]
    fn write_chunk_layout() {
        let mut flash = FakeFlash::new(256, 1, 4);
        let g = geometry(&flash);

        let used = write_chunk(&mut flash, &g, 12, ChunkKind::Value, b"abcde", b"xyz")
            .expect("write should succeed");
        assert_eq!(used, g.chunk_len(5, 3));
        assert_eq!(used, 12 + 8 + 4);

        let crc = checksum(b"abcde", b"xyz").to_le_bytes();
        let bytes = &flash.bytes()[12..12 + used as usize];
        assert_eq!(bytes, &[
            0xAA, 0x55, crc[0], crc[1], 0x00, 5, 0, 3,
            0, 0, 0, 0,
            b'a', b'b', b'c', b'd', b'e', 0, 0, 0,
            b'x', b'y', b'z', 0,
        ]);
        // Header and key each need a body write and a padded tail; the value
        // is shorter than one write unit.
        assert_eq!(flash.writes, 5);
    }

    #[test]
    fn write_tombstone_has_no_value() {
        let mut flash = FakeFlash::new(256, 1, 8);
        let g = geometry(&flash);

        let used = write_chunk(&mut flash, &g, 16, ChunkKind::Tombstone, b"gone", b"")
            .expect("write should succeed");
        assert_eq!(used, 16 + 8);

        let header = read_chunk_header(&flash, 16)
            .expect("read should succeed")
            .expect("header should validate");
        assert!(header.is_tombstone());
        assert_eq!(header.value_len.get(), 0);
        // Nothing past the padded key.
        assert!(flash.is_erased(16 + used, 64).unwrap());
    }

    #[test]
    fn read_chunk_header_rejects_erased_and_garbage() {
        let mut flash = FakeFlash::new(256, 1, 4);
        assert_eq!(read_chunk_header(&flash, 12), Ok(None));

        flash.bytes_mut()[12..24].copy_from_slice(&[0x12; 12]);
        assert_eq!(read_chunk_header(&flash, 12), Ok(None));

        // Right magic, but reserved flag bits set.
        let g = geometry(&flash);
        write_chunk(&mut flash, &g, 40, ChunkKind::Value, b"k", b"v").unwrap();
        flash.bytes_mut()[40 + 4] = 0x80;
        assert_eq!(read_chunk_header(&flash, 40), Ok(None));
        assert!(probe_chunk_header(&flash, 40).unwrap().is_some());
    }

    #[test]
    fn checksum_on_flash_matches_checksum() {
        let mut flash = FakeFlash::new(1024, 1, 4);
        let g = geometry(&flash);
        let value: Vec<u8> = (0..700).map(|i| i as u8).collect();
        write_chunk(&mut flash, &g, 12, ChunkKind::Value, b"long-one", &value).unwrap();

        let header = read_chunk_header(&flash, 12).unwrap().unwrap();
        let mut buffer = [0u8; 64];
        let on_flash = checksum_on_flash(&flash, &g, 12, &header, &mut buffer).unwrap();
        assert_eq!(on_flash, checksum(b"long-one", &value));
        assert_eq!(on_flash, header.crc.get());
    }

    #[test]
    fn sector_and_cleaning_headers() {
        let mut flash = FakeFlash::new(256, 2, 4);
        let g = geometry(&flash);

        assert_eq!(read_sector_header(&flash, &g, 1), Ok(None));
        write_sector_header(&mut flash, &g, 1).unwrap();
        let header = read_sector_header(&flash, &g, 1).unwrap().unwrap();
        assert_eq!(header.version, SectorHeader::VERSION);
        assert_eq!(header.alignment, 4);

        assert_eq!(read_clean_order(&flash, &g, 1), Ok(CleaningHeader::NOT_PENDING));
        write_cleaning_header(&mut flash, &g, 1, 17).unwrap();
        assert_eq!(read_clean_order(&flash, &g, 1), Ok(17));
        assert_eq!(read_clean_order(&flash, &g, 0), Ok(CleaningHeader::NOT_PENDING));
    }

    #[test]
    fn compare_and_copy_defaults() {
        let mut flash = FakeFlash::new(256, 2, 4);
        let g = geometry(&flash);
        let used = write_chunk(&mut flash, &g, 12, ChunkKind::Value, b"key", b"some value").unwrap();

        let mut buffer = [0u8; 8];
        let value_at = g.value_address(12, 3);
        assert!(flash.compare_contents(value_at, b"some value", &mut buffer).unwrap());
        assert!(!flash.compare_contents(value_at, b"some valuf", &mut buffer).unwrap());

        flash.copy_within(12, 256 + 12, used, &mut buffer).unwrap();
        assert_eq!(
            flash.bytes()[12..12 + used as usize],
            flash.bytes()[256 + 12..256 + 12 + used as usize],
        );
    }
}
