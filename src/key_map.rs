// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The in-RAM index from key to the address of its most recent chunk.
//!
//! Entries live in a fixed array, packed at the front. Removal swaps the last
//! entry into the hole, so indices are only stable until the next removal.

use core::fmt;
use crate::low_level::MAX_KEY_LENGTH;

/// A key, held by value in a fixed-size buffer.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct Key {
    bytes: [u8; MAX_KEY_LENGTH],
    len: u8,
}

impl Key {
    /// Copies `key` in, or returns `None` if it is empty or longer than
    /// `MAX_KEY_LENGTH`.
    pub fn new(key: &[u8]) -> Option<Self> {
        if key.is_empty() || key.len() > MAX_KEY_LENGTH {
            return None;
        }
        let mut bytes = [0; MAX_KEY_LENGTH];
        bytes[..key.len()].copy_from_slice(key);
        Some(Self {
            bytes,
            len: key.len() as u8,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..usize::from(self.len)]
    }

    pub fn len(&self) -> usize {
        usize::from(self.len)
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match core::str::from_utf8(self.as_bytes()) {
            Ok(s) => write!(f, "{s:?}"),
            Err(_) => write!(f, "{:?}", self.as_bytes()),
        }
    }
}

/// Computes the hash value corresponding to a particular key. Used to skip
/// most byte comparisons during lookup.
pub fn hash_key(key: &[u8]) -> u32 {
    const KEY_HASH_KEY: u64 = 0;

    use core::hash::{Hash, Hasher};

    let mut hasher = fnv::FnvHasher::with_key(KEY_HASH_KEY);
    key.hash(&mut hasher);
    let h = hasher.finish();
    h as u32 ^ (h >> 32) as u32
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct KeyMapEntry {
    pub key: Key,
    pub hash: u32,
    /// Flash address of the latest chunk for `key`.
    pub address: u32,
    pub value_len: u16,
    pub tombstone: bool,
}

impl KeyMapEntry {
    const EMPTY: Self = Self {
        key: Key {
            bytes: [0; MAX_KEY_LENGTH],
            len: 0,
        },
        hash: 0,
        address: 0,
        value_len: 0,
        tombstone: false,
    };

    pub fn new(key: Key, address: u32, value_len: u16, tombstone: bool) -> Self {
        Self {
            key,
            hash: hash_key(key.as_bytes()),
            address,
            value_len,
            tombstone,
        }
    }
}

pub(crate) struct KeyMap<const N: usize> {
    entries: [KeyMapEntry; N],
    len: usize,
}

impl<const N: usize> KeyMap<N> {
    pub fn new() -> Self {
        Self {
            entries: [KeyMapEntry::EMPTY; N],
            len: 0,
        }
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_full(&self) -> bool {
        self.len == N
    }

    pub fn find(&self, key: &[u8]) -> Option<usize> {
        let hash = hash_key(key);
        self.iter()
            .position(|e| e.hash == hash && e.key.as_bytes() == key)
    }

    pub fn get(&self, index: usize) -> &KeyMapEntry {
        &self.entries[..self.len][index]
    }

    pub fn get_mut(&mut self, index: usize) -> &mut KeyMapEntry {
        &mut self.entries[..self.len][index]
    }

    /// Appends `entry`, returning its index, or `None` if the map is full.
    /// Doesn't check for an existing entry with the same key.
    pub fn insert(&mut self, entry: KeyMapEntry) -> Option<usize> {
        let slot = self.entries.get_mut(self.len)?;
        *slot = entry;
        self.len += 1;
        Some(self.len - 1)
    }

    /// Removes the entry at `index` by moving the last entry into its place.
    pub fn swap_remove(&mut self, index: usize) -> KeyMapEntry {
        let removed = self.entries[..self.len][index];
        self.len -= 1;
        self.entries[index] = self.entries[self.len];
        removed
    }

    pub fn iter(&self) -> impl Iterator<Item = &KeyMapEntry> + '_ {
        self.entries[..self.len].iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &[u8], address: u32) -> KeyMapEntry {
        KeyMapEntry::new(Key::new(key).unwrap(), address, 4, false)
    }

    #[test]
    fn key_bounds() {
        assert!(Key::new(b"").is_none());
        assert!(Key::new(&[b'x'; MAX_KEY_LENGTH + 1]).is_none());
        let k = Key::new(&[b'x'; MAX_KEY_LENGTH]).unwrap();
        assert_eq!(k.len(), MAX_KEY_LENGTH);
        assert_eq!(format!("{:?}", Key::new(b"abc").unwrap()), "\"abc\"");
    }

    #[test]
    fn insert_find_and_capacity() {
        let mut map = KeyMap::<3>::new();
        assert_eq!(map.insert(entry(b"a", 10)), Some(0));
        assert_eq!(map.insert(entry(b"b", 20)), Some(1));
        assert_eq!(map.insert(entry(b"c", 30)), Some(2));
        assert!(map.is_full());
        assert_eq!(map.insert(entry(b"d", 40)), None);

        assert_eq!(map.find(b"b"), Some(1));
        assert_eq!(map.get(map.find(b"c").unwrap()).address, 30);
        assert_eq!(map.find(b"d"), None);
        // A prefix is a different key.
        assert_eq!(map.find(b""), None);
    }

    #[test]
    fn swap_remove_compacts() {
        let mut map = KeyMap::<4>::new();
        for (i, k) in [b"a", b"b", b"c"].iter().enumerate() {
            map.insert(entry(*k, i as u32));
        }

        let removed = map.swap_remove(0);
        assert_eq!(removed.key.as_bytes(), b"a");
        assert_eq!(map.len(), 2);
        // The last entry moved into the hole.
        assert_eq!(map.find(b"c"), Some(0));
        assert_eq!(map.find(b"b"), Some(1));
        assert_eq!(map.find(b"a"), None);

        map.swap_remove(1);
        assert_eq!(map.iter().count(), 1);
        assert_eq!(map.insert(entry(b"z", 9)), Some(1));
    }

    #[test]
    fn clear_forgets_everything() {
        let mut map = KeyMap::<2>::new();
        map.insert(entry(b"a", 1));
        map.clear();
        assert_eq!(map.len(), 0);
        assert_eq!(map.find(b"a"), None);
    }
}
