// Slotted 4 KiB page.
//
// Layout:
//   header (32 bytes): page_id u32 | page_lsn u64 | prev_page u32 |
//                      next_page u32 | free_space_offset u16 | slot_count u16 |
//                      reserved 8 B
//   slot directory, growing forward from the header: (offset u16, len u16)
//   tuple heap, growing backward from the end of the page
//
// Slot states: a live slot points into the heap; a tombstone is
// (offset=0, len=0) and is only reusable once vacuum marks it free
// (offset=0xFFFF, len=0); a forwarding slot has the high offset bit set and
// a 6-byte (page_id, slot) payload.

use crate::common::{PageId, Rid, SlotId, INVALID_PAGE_ID, PAGE_SIZE};
use crate::error::{DbError, Result};

pub const PAGE_HEADER_SIZE: usize = 32;
pub const SLOT_SIZE: usize = 4;

const OFFSET_PAGE_ID: usize = 0;
const OFFSET_LSN: usize = 4;
const OFFSET_PREV: usize = 12;
const OFFSET_NEXT: usize = 16;
const OFFSET_FREE_SPACE: usize = 20;
const OFFSET_SLOT_COUNT: usize = 22;

const FORWARD_FLAG: u16 = 0x8000;
const FREE_OFFSET: u16 = 0xFFFF;
const FORWARD_LEN: usize = 6;

/// State of one slot in the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Live,
    Tombstone,
    Free,
    Forward(Rid),
}

/// In-memory image of one page.
#[derive(Debug)]
pub struct Page {
    pub data: Box<[u8; PAGE_SIZE]>,
}

impl Page {
    /// Fresh, initialized page.
    pub fn new(page_id: PageId) -> Self {
        let mut page = Self {
            data: Box::new([0u8; PAGE_SIZE]),
        };
        page.init(page_id);
        page
    }

    /// Wraps raw bytes read from disk.
    pub fn from_bytes(data: Box<[u8; PAGE_SIZE]>) -> Self {
        Self { data }
    }

    /// (Re)initializes the header of an empty page.
    pub fn init(&mut self, page_id: PageId) {
        self.data.fill(0);
        self.write_u32(OFFSET_PAGE_ID, page_id);
        self.write_u32(OFFSET_PREV, INVALID_PAGE_ID);
        self.write_u32(OFFSET_NEXT, INVALID_PAGE_ID);
        self.write_u16(OFFSET_FREE_SPACE, PAGE_SIZE as u16);
        self.write_u16(OFFSET_SLOT_COUNT, 0);
    }

    /// A freshly zero-filled page has free_space_offset 0; any initialized
    /// page keeps it at or above the header size.
    pub fn is_initialized(&self) -> bool {
        self.read_u16(OFFSET_FREE_SPACE) as usize >= PAGE_HEADER_SIZE
    }

    // ------------------------------------------------------------------
    // Header accessors
    // ------------------------------------------------------------------

    pub fn page_id(&self) -> PageId {
        self.read_u32(OFFSET_PAGE_ID)
    }

    pub fn lsn(&self) -> u64 {
        self.read_u64(OFFSET_LSN)
    }

    pub fn set_lsn(&mut self, lsn: u64) {
        self.write_u64(OFFSET_LSN, lsn);
    }

    pub fn prev_page(&self) -> PageId {
        self.read_u32(OFFSET_PREV)
    }

    pub fn set_prev_page(&mut self, pid: PageId) {
        self.write_u32(OFFSET_PREV, pid);
    }

    pub fn next_page(&self) -> PageId {
        self.read_u32(OFFSET_NEXT)
    }

    pub fn set_next_page(&mut self, pid: PageId) {
        self.write_u32(OFFSET_NEXT, pid);
    }

    pub fn slot_count(&self) -> u16 {
        self.read_u16(OFFSET_SLOT_COUNT)
    }

    fn free_space_offset(&self) -> usize {
        self.read_u16(OFFSET_FREE_SPACE) as usize
    }

    /// Bytes available for one more tuple (accounting for a new directory
    /// entry).
    pub fn free_space(&self) -> usize {
        let used_front = PAGE_HEADER_SIZE + self.slot_count() as usize * SLOT_SIZE;
        self.free_space_offset().saturating_sub(used_front)
    }

    /// Whether a tuple of `len` bytes fits, reusing a free slot if any.
    pub fn fits(&self, len: usize) -> bool {
        let slot_cost = if self.find_free_slot().is_some() {
            0
        } else {
            SLOT_SIZE
        };
        self.free_space() >= len + slot_cost
    }

    // ------------------------------------------------------------------
    // Slot directory
    // ------------------------------------------------------------------

    fn slot_entry(&self, slot: SlotId) -> (u16, u16) {
        let base = PAGE_HEADER_SIZE + slot as usize * SLOT_SIZE;
        (self.read_u16(base), self.read_u16(base + 2))
    }

    fn set_slot_entry(&mut self, slot: SlotId, offset: u16, len: u16) {
        let base = PAGE_HEADER_SIZE + slot as usize * SLOT_SIZE;
        self.write_u16(base, offset);
        self.write_u16(base + 2, len);
    }

    /// Classifies a slot.
    pub fn slot_kind(&self, slot: SlotId) -> Option<SlotKind> {
        if slot >= self.slot_count() {
            return None;
        }
        let (offset, len) = self.slot_entry(slot);
        if offset == 0 && len == 0 {
            return Some(SlotKind::Tombstone);
        }
        if offset == FREE_OFFSET {
            return Some(SlotKind::Free);
        }
        if offset & FORWARD_FLAG != 0 {
            let at = (offset & !FORWARD_FLAG) as usize;
            let page_id = u32::from_le_bytes(self.data[at..at + 4].try_into().unwrap());
            let slot = u16::from_le_bytes(self.data[at + 4..at + 6].try_into().unwrap());
            return Some(SlotKind::Forward(Rid::new(page_id, slot)));
        }
        Some(SlotKind::Live)
    }

    fn find_free_slot(&self) -> Option<SlotId> {
        (0..self.slot_count()).find(|&s| self.slot_kind(s) == Some(SlotKind::Free))
    }

    // ------------------------------------------------------------------
    // Tuple operations
    // ------------------------------------------------------------------

    /// Inserts tuple bytes, returning the slot, or `None` when the page is
    /// full. Vacuumed slots are reused before the directory grows.
    pub fn insert_tuple(&mut self, bytes: &[u8]) -> Option<SlotId> {
        if bytes.is_empty() || bytes.len() > PAGE_SIZE {
            return None;
        }
        let reuse = self.find_free_slot();
        let slot_cost = if reuse.is_some() { 0 } else { SLOT_SIZE };
        if self.free_space() < bytes.len() + slot_cost {
            return None;
        }
        let new_fso = self.free_space_offset() - bytes.len();
        self.data[new_fso..new_fso + bytes.len()].copy_from_slice(bytes);
        self.write_u16(OFFSET_FREE_SPACE, new_fso as u16);
        let slot = match reuse {
            Some(slot) => slot,
            None => {
                let slot = self.slot_count();
                self.write_u16(OFFSET_SLOT_COUNT, slot + 1);
                slot
            }
        };
        self.set_slot_entry(slot, new_fso as u16, bytes.len() as u16);
        Some(slot)
    }

    /// Re-materializes a tuple at a specific slot (undo path). The slot must
    /// currently be a tombstone or free.
    pub fn restore_tuple(&mut self, slot: SlotId, bytes: &[u8]) -> Result<()> {
        match self.slot_kind(slot) {
            Some(SlotKind::Tombstone) | Some(SlotKind::Free) => {}
            _ => {
                return Err(DbError::Storage(format!(
                    "cannot restore into occupied slot {}",
                    slot
                )))
            }
        }
        let used_front = PAGE_HEADER_SIZE + self.slot_count() as usize * SLOT_SIZE;
        let new_fso = self
            .free_space_offset()
            .checked_sub(bytes.len())
            .filter(|fso| *fso >= used_front)
            .ok_or_else(|| DbError::Storage("page full during restore".to_string()))?;
        self.data[new_fso..new_fso + bytes.len()].copy_from_slice(bytes);
        self.write_u16(OFFSET_FREE_SPACE, new_fso as u16);
        self.set_slot_entry(slot, new_fso as u16, bytes.len() as u16);
        Ok(())
    }

    /// Returns the bytes of a live tuple.
    pub fn get_tuple(&self, slot: SlotId) -> Option<&[u8]> {
        match self.slot_kind(slot)? {
            SlotKind::Live => {
                let (offset, len) = self.slot_entry(slot);
                Some(&self.data[offset as usize..offset as usize + len as usize])
            }
            _ => None,
        }
    }

    /// Tombstones a slot, returning the old bytes for the undo image.
    pub fn delete_tuple(&mut self, slot: SlotId) -> Option<Vec<u8>> {
        let old = self.get_tuple(slot)?.to_vec();
        self.set_slot_entry(slot, 0, 0);
        Some(old)
    }

    /// In-place update. Returns the old bytes, or `None` when the new image
    /// does not fit (caller falls back to delete+insert with forwarding).
    pub fn update_tuple(&mut self, slot: SlotId, bytes: &[u8]) -> Option<Vec<u8>> {
        let old = self.get_tuple(slot)?.to_vec();
        let (offset, old_len) = self.slot_entry(slot);
        if bytes.len() <= old_len as usize {
            let at = offset as usize;
            self.data[at..at + bytes.len()].copy_from_slice(bytes);
            self.set_slot_entry(slot, offset, bytes.len() as u16);
            return Some(old);
        }
        if self.free_space() >= bytes.len() {
            let new_fso = self.free_space_offset() - bytes.len();
            self.data[new_fso..new_fso + bytes.len()].copy_from_slice(bytes);
            self.write_u16(OFFSET_FREE_SPACE, new_fso as u16);
            self.set_slot_entry(slot, new_fso as u16, bytes.len() as u16);
            return Some(old);
        }
        None
    }

    /// Replaces a tombstoned slot with a forwarding pointer to `target`.
    pub fn set_forwarding(&mut self, slot: SlotId, target: Rid) -> Result<()> {
        if self.slot_kind(slot) != Some(SlotKind::Tombstone) {
            return Err(DbError::Storage(
                "forwarding requires a tombstoned slot".to_string(),
            ));
        }
        let used_front = PAGE_HEADER_SIZE + self.slot_count() as usize * SLOT_SIZE;
        let new_fso = self
            .free_space_offset()
            .checked_sub(FORWARD_LEN)
            .filter(|fso| *fso >= used_front)
            .ok_or_else(|| DbError::Storage("page full during forward".to_string()))?;
        self.data[new_fso..new_fso + 4].copy_from_slice(&target.page_id.to_le_bytes());
        self.data[new_fso + 4..new_fso + 6].copy_from_slice(&target.slot.to_le_bytes());
        self.write_u16(OFFSET_FREE_SPACE, new_fso as u16);
        self.set_slot_entry(slot, new_fso as u16 | FORWARD_FLAG, FORWARD_LEN as u16);
        Ok(())
    }

    /// Redo support: grows the slot directory until `slot` exists, filling
    /// any gap with tombstone entries.
    pub fn ensure_slot(&mut self, slot: SlotId) {
        while self.slot_count() <= slot {
            let s = self.slot_count();
            self.write_u16(OFFSET_SLOT_COUNT, s + 1);
            self.set_slot_entry(s, 0, 0);
        }
    }

    /// Vacuum support: invalidates a tombstone so its slot number may be
    /// reused, then compacts the heap area.
    pub fn free_slot(&mut self, slot: SlotId) {
        if matches!(
            self.slot_kind(slot),
            Some(SlotKind::Tombstone) | Some(SlotKind::Forward(_))
        ) {
            self.set_slot_entry(slot, FREE_OFFSET, 0);
        }
    }

    /// Rebuilds the tuple heap, squeezing out dead space. Slot numbers are
    /// preserved.
    pub fn compact(&mut self) {
        let mut scratch = [0u8; PAGE_SIZE];
        let mut fso = PAGE_SIZE;
        let mut entries = Vec::with_capacity(self.slot_count() as usize);
        for slot in 0..self.slot_count() {
            let (offset, len) = self.slot_entry(slot);
            let kind = self.slot_kind(slot);
            match kind {
                Some(SlotKind::Live) | Some(SlotKind::Forward(_)) => {
                    let flag = offset & FORWARD_FLAG;
                    let at = (offset & !FORWARD_FLAG) as usize;
                    fso -= len as usize;
                    scratch[fso..fso + len as usize]
                        .copy_from_slice(&self.data[at..at + len as usize]);
                    entries.push((slot, fso as u16 | flag, len));
                }
                _ => {
                    let (o, l) = self.slot_entry(slot);
                    entries.push((slot, o, l));
                }
            }
        }
        self.data[fso..].copy_from_slice(&scratch[fso..]);
        self.write_u16(OFFSET_FREE_SPACE, fso as u16);
        for (slot, offset, len) in entries {
            self.set_slot_entry(slot, offset, len);
        }
    }

    // ------------------------------------------------------------------
    // Raw accessors
    // ------------------------------------------------------------------

    fn read_u16(&self, at: usize) -> u16 {
        u16::from_le_bytes(self.data[at..at + 2].try_into().unwrap())
    }

    fn read_u32(&self, at: usize) -> u32 {
        u32::from_le_bytes(self.data[at..at + 4].try_into().unwrap())
    }

    fn read_u64(&self, at: usize) -> u64 {
        u64::from_le_bytes(self.data[at..at + 8].try_into().unwrap())
    }

    fn write_u16(&mut self, at: usize, v: u16) {
        self.data[at..at + 2].copy_from_slice(&v.to_le_bytes());
    }

    fn write_u32(&mut self, at: usize, v: u32) {
        self.data[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }

    fn write_u64(&mut self, at: usize, v: u64) {
        self.data[at..at + 8].copy_from_slice(&v.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_page() {
        let page = Page::new(3);
        assert_eq!(page.page_id(), 3);
        assert_eq!(page.slot_count(), 0);
        assert_eq!(page.free_space(), PAGE_SIZE - PAGE_HEADER_SIZE);
        assert!(page.is_initialized());
        assert!(!Page::from_bytes(Box::new([0u8; PAGE_SIZE])).is_initialized());
    }

    #[test]
    fn test_insert_get_delete() {
        let mut page = Page::new(1);
        let slot = page.insert_tuple(b"hello").unwrap();
        assert_eq!(page.get_tuple(slot), Some(&b"hello"[..]));
        let old = page.delete_tuple(slot).unwrap();
        assert_eq!(old, b"hello");
        assert_eq!(page.slot_kind(slot), Some(SlotKind::Tombstone));
        assert!(page.get_tuple(slot).is_none());
    }

    #[test]
    fn test_tombstoned_slot_not_reused_until_freed() {
        let mut page = Page::new(1);
        let a = page.insert_tuple(b"aaaa").unwrap();
        page.delete_tuple(a).unwrap();
        let b = page.insert_tuple(b"bbbb").unwrap();
        assert_ne!(a, b);
        page.free_slot(a);
        let c = page.insert_tuple(b"cccc").unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn test_fill_to_boundary() {
        let mut page = Page::new(1);
        // Each insert costs len + SLOT_SIZE; drive free space to exactly 0.
        let payload = [0x55u8; 60];
        let mut slots = Vec::new();
        while page.fits(payload.len()) {
            slots.push(page.insert_tuple(&payload).unwrap());
        }
        assert!(page.insert_tuple(&payload).is_none());
        assert!(page.free_space() < payload.len() + SLOT_SIZE);
        for slot in slots {
            assert_eq!(page.get_tuple(slot), Some(&payload[..]));
        }
    }

    #[test]
    fn test_update_in_place_and_grow() {
        let mut page = Page::new(1);
        let slot = page.insert_tuple(b"abcdef").unwrap();
        // Shrinking update stays in place.
        let old = page.update_tuple(slot, b"xy").unwrap();
        assert_eq!(old, b"abcdef");
        assert_eq!(page.get_tuple(slot), Some(&b"xy"[..]));
        // Growing update relocates within the page.
        let old = page.update_tuple(slot, b"0123456789").unwrap();
        assert_eq!(old, b"xy");
        assert_eq!(page.get_tuple(slot), Some(&b"0123456789"[..]));
    }

    #[test]
    fn test_forwarding_record() {
        let mut page = Page::new(1);
        let slot = page.insert_tuple(b"tuple").unwrap();
        page.delete_tuple(slot).unwrap();
        page.set_forwarding(slot, Rid::new(9, 2)).unwrap();
        assert_eq!(page.slot_kind(slot), Some(SlotKind::Forward(Rid::new(9, 2))));
    }

    #[test]
    fn test_compact_reclaims_dead_space() {
        let mut page = Page::new(1);
        let a = page.insert_tuple(&[1u8; 1000]).unwrap();
        let b = page.insert_tuple(&[2u8; 1000]).unwrap();
        let before = page.free_space();
        page.delete_tuple(a).unwrap();
        page.free_slot(a);
        page.compact();
        assert!(page.free_space() >= before + 1000);
        assert_eq!(page.get_tuple(b), Some(&[2u8; 1000][..]));
    }
}
