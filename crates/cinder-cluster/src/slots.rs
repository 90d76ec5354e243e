//! Hash slots: key hashing, per-node slot bitmaps, and the cluster-wide
//! slot ownership table.
//!
//! Keys map to one of 16384 slots through CRC16 (XMODEM), honoring
//! `{hash tags}` so related keys can be forced into the same slot.

use std::fmt;

use crate::NodeId;

/// Total number of hash slots.
pub const SLOT_COUNT: u16 = 16384;

/// Bytes in a serialized slot bitmap (one bit per slot).
pub const SLOT_BITMAP_BYTES: usize = SLOT_COUNT as usize / 8;

const BITMAP_WORDS: usize = SLOT_COUNT as usize / 64;

/// CRC16 lookup table, CCITT polynomial 0x1021.
#[rustfmt::skip]
static CRC16_TABLE: [u16; 256] = [
    0x0000, 0x1021, 0x2042, 0x3063, 0x4084, 0x50a5, 0x60c6, 0x70e7,
    0x8108, 0x9129, 0xa14a, 0xb16b, 0xc18c, 0xd1ad, 0xe1ce, 0xf1ef,
    0x1231, 0x0210, 0x3273, 0x2252, 0x52b5, 0x4294, 0x72f7, 0x62d6,
    0x9339, 0x8318, 0xb37b, 0xa35a, 0xd3bd, 0xc39c, 0xf3ff, 0xe3de,
    0x2462, 0x3443, 0x0420, 0x1401, 0x64e6, 0x74c7, 0x44a4, 0x5485,
    0xa56a, 0xb54b, 0x8528, 0x9509, 0xe5ee, 0xf5cf, 0xc5ac, 0xd58d,
    0x3653, 0x2672, 0x1611, 0x0630, 0x76d7, 0x66f6, 0x5695, 0x46b4,
    0xb75b, 0xa77a, 0x9719, 0x8738, 0xf7df, 0xe7fe, 0xd79d, 0xc7bc,
    0x48c4, 0x58e5, 0x6886, 0x78a7, 0x0840, 0x1861, 0x2802, 0x3823,
    0xc9cc, 0xd9ed, 0xe98e, 0xf9af, 0x8948, 0x9969, 0xa90a, 0xb92b,
    0x5af5, 0x4ad4, 0x7ab7, 0x6a96, 0x1a71, 0x0a50, 0x3a33, 0x2a12,
    0xdbfd, 0xcbdc, 0xfbbf, 0xeb9e, 0x9b79, 0x8b58, 0xbb3b, 0xab1a,
    0x6ca6, 0x7c87, 0x4ce4, 0x5cc5, 0x2c22, 0x3c03, 0x0c60, 0x1c41,
    0xedae, 0xfd8f, 0xcdec, 0xddcd, 0xad2a, 0xbd0b, 0x8d68, 0x9d49,
    0x7e97, 0x6eb6, 0x5ed5, 0x4ef4, 0x3e13, 0x2e32, 0x1e51, 0x0e70,
    0xff9f, 0xefbe, 0xdfdd, 0xcffc, 0xbf1b, 0xaf3a, 0x9f59, 0x8f78,
    0x9188, 0x81a9, 0xb1ca, 0xa1eb, 0xd10c, 0xc12d, 0xf14e, 0xe16f,
    0x1080, 0x00a1, 0x30c2, 0x20e3, 0x5004, 0x4025, 0x7046, 0x6067,
    0x83b9, 0x9398, 0xa3fb, 0xb3da, 0xc33d, 0xd31c, 0xe37f, 0xf35e,
    0x02b1, 0x1290, 0x22f3, 0x32d2, 0x4235, 0x5214, 0x6277, 0x7256,
    0xb5ea, 0xa5cb, 0x95a8, 0x8589, 0xf56e, 0xe54f, 0xd52c, 0xc50d,
    0x34e2, 0x24c3, 0x14a0, 0x0481, 0x7466, 0x6447, 0x5424, 0x4405,
    0xa7db, 0xb7fa, 0x8799, 0x97b8, 0xe75f, 0xf77e, 0xc71d, 0xd73c,
    0x26d3, 0x36f2, 0x0691, 0x16b0, 0x6657, 0x7676, 0x4615, 0x5634,
    0xd94c, 0xc96d, 0xf90e, 0xe92f, 0x99c8, 0x89e9, 0xb98a, 0xa9ab,
    0x5844, 0x4865, 0x7806, 0x6827, 0x18c0, 0x08e1, 0x3882, 0x28a3,
    0xcb7d, 0xdb5c, 0xeb3f, 0xfb1e, 0x8bf9, 0x9bd8, 0xabbb, 0xbb9a,
    0x4a75, 0x5a54, 0x6a37, 0x7a16, 0x0af1, 0x1ad0, 0x2ab3, 0x3a92,
    0xfd2e, 0xed0f, 0xdd6c, 0xcd4d, 0xbdaa, 0xad8b, 0x9de8, 0x8dc9,
    0x7c26, 0x6c07, 0x5c64, 0x4c45, 0x3ca2, 0x2c83, 0x1ce0, 0x0cc1,
    0xef1f, 0xff3e, 0xcf5d, 0xdf7c, 0xaf9b, 0xbfba, 0x8fd9, 0x9ff8,
    0x6e17, 0x7e36, 0x4e55, 0x5e74, 0x2e93, 0x3eb2, 0x0ed1, 0x1ef0,
];

fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        let idx = ((crc >> 8) ^ (byte as u16)) as usize;
        crc = (crc << 8) ^ CRC16_TABLE[idx];
    }
    crc
}

/// Extracts the hashable portion of a key.
///
/// The tag is the content between the first `{` and the first `}` after
/// it. An empty tag (`foo{}bar`) or a missing close brace means the
/// whole key is hashed.
fn hash_tag(key: &[u8]) -> &[u8] {
    let Some(open) = key.iter().position(|&b| b == b'{') else {
        return key;
    };
    let after_open = &key[open + 1..];
    match after_open.iter().position(|&b| b == b'}') {
        Some(0) | None => key,
        Some(close) => &after_open[..close],
    }
}

/// Computes the hash slot for a key. Always in `[0, 16383]`.
pub fn key_hash_slot(key: &[u8]) -> u16 {
    crc16(hash_tag(key)) % SLOT_COUNT
}

/// A contiguous, inclusive range of slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRange {
    pub start: u16,
    pub end: u16,
}

impl SlotRange {
    /// # Panics
    ///
    /// Panics if `start > end` or `end >= SLOT_COUNT`.
    pub fn new(start: u16, end: u16) -> Self {
        assert!(start <= end, "SlotRange requires start <= end");
        assert!(end < SLOT_COUNT, "slot must be < {SLOT_COUNT}");
        Self { start, end }
    }

    pub fn single(slot: u16) -> Self {
        Self::new(slot, slot)
    }

    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u16 {
        self.end - self.start + 1
    }

    pub fn contains(&self, slot: u16) -> bool {
        slot >= self.start && slot <= self.end
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }
}

impl fmt::Display for SlotRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// The set of slots a single node claims, one bit per slot.
#[derive(Clone, PartialEq, Eq)]
pub struct SlotBitmap {
    words: Box<[u64; BITMAP_WORDS]>,
}

impl Default for SlotBitmap {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotBitmap {
    pub fn new() -> Self {
        Self {
            words: Box::new([0; BITMAP_WORDS]),
        }
    }

    pub fn contains(&self, slot: u16) -> bool {
        if slot >= SLOT_COUNT {
            return false;
        }
        (self.words[slot as usize / 64] >> (slot % 64)) & 1 == 1
    }

    /// Sets a slot. Returns true if it was not already set.
    pub fn insert(&mut self, slot: u16) -> bool {
        if slot >= SLOT_COUNT || self.contains(slot) {
            return false;
        }
        self.words[slot as usize / 64] |= 1 << (slot % 64);
        true
    }

    /// Clears a slot. Returns true if it was set.
    pub fn remove(&mut self, slot: u16) -> bool {
        if !self.contains(slot) {
            return false;
        }
        self.words[slot as usize / 64] &= !(1 << (slot % 64));
        true
    }

    pub fn clear(&mut self) {
        self.words.fill(0);
    }

    /// Number of slots set.
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        (0..SLOT_COUNT).filter(move |&slot| self.contains(slot))
    }

    /// Collapses the set slots into sorted, maximal ranges.
    pub fn ranges(&self) -> Vec<SlotRange> {
        let mut ranges = Vec::new();
        let mut open: Option<(u16, u16)> = None;
        for slot in self.iter() {
            open = match open {
                Some((start, end)) if end + 1 == slot => Some((start, slot)),
                Some((start, end)) => {
                    ranges.push(SlotRange::new(start, end));
                    Some((slot, slot))
                }
                None => Some((slot, slot)),
            };
        }
        if let Some((start, end)) = open {
            ranges.push(SlotRange::new(start, end));
        }
        ranges
    }

    /// Serializes to 2048 bytes, slot 0 in the lowest bit of byte 0.
    pub fn to_bytes(&self) -> [u8; SLOT_BITMAP_BYTES] {
        let mut out = [0u8; SLOT_BITMAP_BYTES];
        for (i, word) in self.words.iter().enumerate() {
            out[i * 8..i * 8 + 8].copy_from_slice(&word.to_le_bytes());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8; SLOT_BITMAP_BYTES]) -> Self {
        let mut bitmap = Self::new();
        for (i, chunk) in bytes.chunks_exact(8).enumerate() {
            let mut word = [0u8; 8];
            word.copy_from_slice(chunk);
            bitmap.words[i] = u64::from_le_bytes(word);
        }
        bitmap
    }
}

impl fmt::Debug for SlotBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ranges: Vec<String> = self.ranges().iter().map(|r| r.to_string()).collect();
        write!(f, "SlotBitmap[{}]", ranges.join(" "))
    }
}

impl FromIterator<u16> for SlotBitmap {
    fn from_iter<I: IntoIterator<Item = u16>>(iter: I) -> Self {
        let mut bitmap = Self::new();
        for slot in iter {
            bitmap.insert(slot);
        }
        bitmap
    }
}

/// Outcome of offering a slot claim to the [`SlotTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotClaim {
    /// The claimant now owns the slot. `previous` lost it.
    Assigned { previous: Option<NodeId> },
    /// The claimant already owned the slot.
    Unchanged,
    /// The current owner has a strictly higher config epoch.
    Rejected { owner: NodeId },
    /// The current owner has the same config epoch. Nothing was changed;
    /// the caller resolves the tie.
    Conflict { owner: NodeId },
}

/// Maps each of the 16384 slots to at most one owning master.
#[derive(Debug, Clone)]
pub struct SlotTable {
    owners: Box<[Option<NodeId>]>,
}

impl Default for SlotTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotTable {
    /// Creates a table with every slot unowned.
    pub fn new() -> Self {
        Self {
            // heap-allocated: 16384 owners would not fit comfortably on the stack
            owners: vec![None; SLOT_COUNT as usize].into_boxed_slice(),
        }
    }

    pub fn owner_of(&self, slot: u16) -> Option<NodeId> {
        self.owners.get(slot as usize).copied().flatten()
    }

    /// Offers `slot` to `node`, which claims it at `epoch`.
    ///
    /// `owner_epoch` resolves the config epoch of whoever owns the slot
    /// today. A higher-epoch owner is never displaced; an equal-epoch
    /// owner is reported as a conflict and left in place.
    pub fn assign(
        &mut self,
        slot: u16,
        node: NodeId,
        epoch: u64,
        owner_epoch: impl Fn(&NodeId) -> u64,
    ) -> SlotClaim {
        let Some(entry) = self.owners.get_mut(slot as usize) else {
            return SlotClaim::Unchanged;
        };
        match *entry {
            None => {
                *entry = Some(node);
                SlotClaim::Assigned { previous: None }
            }
            Some(owner) if owner == node => SlotClaim::Unchanged,
            Some(owner) => {
                let current = owner_epoch(&owner);
                if current > epoch {
                    SlotClaim::Rejected { owner }
                } else if current == epoch {
                    SlotClaim::Conflict { owner }
                } else {
                    *entry = Some(node);
                    SlotClaim::Assigned {
                        previous: Some(owner),
                    }
                }
            }
        }
    }

    /// Sets the owner unconditionally, returning the previous one.
    pub fn set_owner(&mut self, slot: u16, node: NodeId) -> Option<NodeId> {
        self.owners
            .get_mut(slot as usize)
            .and_then(|entry| entry.replace(node))
    }

    /// Clears a slot, returning its previous owner.
    pub fn release(&mut self, slot: u16) -> Option<NodeId> {
        self.owners.get_mut(slot as usize).and_then(Option::take)
    }

    /// Clears every slot owned by `node`. Returns how many were cleared.
    pub fn release_all(&mut self, node: &NodeId) -> usize {
        let mut released = 0;
        for entry in self.owners.iter_mut() {
            if entry.as_ref() == Some(node) {
                *entry = None;
                released += 1;
            }
        }
        released
    }

    pub fn count_owned_by(&self, node: &NodeId) -> usize {
        self.owners
            .iter()
            .filter(|owner| owner.as_ref() == Some(node))
            .count()
    }

    pub fn assigned_count(&self) -> usize {
        self.owners.iter().filter(|owner| owner.is_some()).count()
    }

    /// Iterates `(slot, owner)` over every slot.
    pub fn iter(&self) -> impl Iterator<Item = (u16, Option<NodeId>)> + '_ {
        self.owners
            .iter()
            .enumerate()
            .map(|(slot, owner)| (slot as u16, *owner))
    }
}
