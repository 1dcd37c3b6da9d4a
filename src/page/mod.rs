// # Slotted Page Layout
//
// A page is a fixed BLCKSZ byte array. From low to high offset:
//
// | Region          | Bytes                 |
// |-----------------|-----------------------|
// | checksum        | 0..8 (CRC-64)         |
// | pd_lower        | 8..10                 |
// | pd_upper        | 10..12                |
// | pd_special      | 12..14                |
// | pd_flags        | 14..16                |
// | line pointers   | 16..pd_lower          |
// | free space      | pd_lower..pd_upper    |
// | item data       | pd_upper..pd_special  |
// | special area    | pd_special..BLCKSZ    |
//
// Invariant: `pd_lower <= pd_upper <= pd_special <= BLCKSZ`. The line
// pointer array grows up; item data grows down. The special area is
// opaque to this module and belongs to the access method.

pub mod checksum;
pub mod item;

pub use checksum::{page_checksums_enabled, set_page_checksums, INIT_CRC64, INVALID_CRC64};
pub use item::{flags as item_flags, ItemId, ITEM_ID_SIZE};

use crate::common::{max_align, OffsetNumber, BLCKSZ, INVALID_OFFSET_NUMBER};
use crate::error::{DbError, Result};

/// Byte offset where the line-pointer array begins.
pub const PAGE_HEADER_SIZE: usize = 16;

const CHECKSUM_OFF: usize = 0;
const LOWER_OFF: usize = 8;
const UPPER_OFF: usize = 10;
const SPECIAL_OFF: usize = 12;
const FLAGS_OFF: usize = 14;

/// Placement policy for `add_item` when the caller supplies an offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageInsertMode {
    /// Shift existing line pointers up to make room at the offset.
    Shuffle,
    /// Reuse the slot at the offset; it must be unused and deallocated.
    Overwrite,
}

/// An in-memory copy of one disk page.
#[derive(Clone)]
pub struct Page {
    data: Box<[u8; BLCKSZ]>,
}

impl Default for Page {
    fn default() -> Self {
        Self::new()
    }
}

impl Page {
    /// Allocate a zeroed page. Call [`Page::init`] before use.
    pub fn new() -> Self {
        Self {
            data: vec![0u8; BLCKSZ].into_boxed_slice().try_into().unwrap(),
        }
    }

    /// Build a page from raw bytes read off disk.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != BLCKSZ {
            return Err(DbError::InvalidPage(format!(
                "expected {} bytes, got {}",
                BLCKSZ,
                bytes.len()
            )));
        }
        let mut page = Self::new();
        page.data.copy_from_slice(bytes);
        Ok(page)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..]
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data[..]
    }

    // ------------------------------------------------------------------
    // Header accessors
    // ------------------------------------------------------------------

    fn read_u16(&self, off: usize) -> u16 {
        u16::from_le_bytes([self.data[off], self.data[off + 1]])
    }

    fn write_u16(&mut self, off: usize, val: u16) {
        self.data[off..off + 2].copy_from_slice(&val.to_le_bytes());
    }

    pub fn lower(&self) -> u16 {
        self.read_u16(LOWER_OFF)
    }

    pub fn upper(&self) -> u16 {
        self.read_u16(UPPER_OFF)
    }

    pub fn special(&self) -> u16 {
        self.read_u16(SPECIAL_OFF)
    }

    pub fn page_flags(&self) -> u16 {
        self.read_u16(FLAGS_OFF)
    }

    fn set_lower(&mut self, val: u16) {
        self.write_u16(LOWER_OFF, val);
    }

    fn set_upper(&mut self, val: u16) {
        self.write_u16(UPPER_OFF, val);
    }

    pub fn stored_checksum(&self) -> u64 {
        u64::from_le_bytes(self.data[CHECKSUM_OFF..CHECKSUM_OFF + 8].try_into().unwrap())
    }

    fn store_checksum(&mut self, val: u64) {
        self.data[CHECKSUM_OFF..CHECKSUM_OFF + 8].copy_from_slice(&val.to_le_bytes());
    }

    /// Initialize the page: zero everything, place the free-space
    /// boundaries around an aligned special area of `special_size`
    /// bytes, and seed the checksum field.
    pub fn init(&mut self, special_size: usize) {
        assert!(special_size + PAGE_HEADER_SIZE < BLCKSZ);
        let special_size = max_align(special_size);
        self.data.fill(0);
        self.set_lower(PAGE_HEADER_SIZE as u16);
        self.set_upper((BLCKSZ - special_size) as u16);
        self.write_u16(SPECIAL_OFF, (BLCKSZ - special_size) as u16);
        self.write_u16(FLAGS_OFF, 0);
        self.store_checksum(INIT_CRC64);
    }

    /// True if the page has been initialized (boundaries are sane).
    pub fn is_initialized(&self) -> bool {
        let lower = self.lower() as usize;
        let upper = self.upper() as usize;
        let special = self.special() as usize;
        lower >= PAGE_HEADER_SIZE && lower <= upper && upper <= special && special <= BLCKSZ
    }

    /// True if no line pointers have been allocated.
    pub fn is_empty(&self) -> bool {
        self.lower() as usize <= PAGE_HEADER_SIZE
    }

    /// Number of line pointers on the page (the highest offset number).
    pub fn max_offset_number(&self) -> OffsetNumber {
        let lower = self.lower() as usize;
        if lower <= PAGE_HEADER_SIZE {
            0
        } else {
            ((lower - PAGE_HEADER_SIZE) / ITEM_ID_SIZE) as OffsetNumber
        }
    }

    /// Free (allocatable) space, already discounting the line pointer a
    /// new item would need.
    pub fn free_space(&self) -> usize {
        let upper = self.upper() as usize;
        let lower = self.lower() as usize;
        if upper < lower {
            return 0;
        }
        let space = upper - lower;
        if space < ITEM_ID_SIZE {
            0
        } else {
            space - ITEM_ID_SIZE
        }
    }

    // ------------------------------------------------------------------
    // Line pointers and item data
    // ------------------------------------------------------------------

    fn linp_pos(offnum: OffsetNumber) -> usize {
        PAGE_HEADER_SIZE + (offnum as usize - 1) * ITEM_ID_SIZE
    }

    /// Read the line pointer at `offnum` (1-based).
    pub fn item_id(&self, offnum: OffsetNumber) -> Result<ItemId> {
        if offnum == INVALID_OFFSET_NUMBER || offnum > self.max_offset_number() {
            return Err(DbError::InvalidPage(format!(
                "offset {} out of range 1..={}",
                offnum,
                self.max_offset_number()
            )));
        }
        let pos = Self::linp_pos(offnum);
        Ok(ItemId::decode(u32::from_le_bytes(
            self.data[pos..pos + 4].try_into().unwrap(),
        )))
    }

    fn set_item_id(&mut self, offnum: OffsetNumber, id: ItemId) {
        let pos = Self::linp_pos(offnum);
        self.data[pos..pos + 4].copy_from_slice(&id.encode().to_le_bytes());
    }

    /// Borrow the item bytes addressed by `offnum`.
    pub fn item(&self, offnum: OffsetNumber) -> Result<&[u8]> {
        let id = self.item_id(offnum)?;
        let start = id.off as usize;
        let end = start + id.len as usize;
        if end > BLCKSZ {
            return Err(DbError::InvalidPage(format!(
                "item {} points past page end",
                offnum
            )));
        }
        Ok(&self.data[start..end])
    }

    /// Mutable access to an item's bytes, for in-place header updates.
    pub fn item_mut(&mut self, offnum: OffsetNumber) -> Result<&mut [u8]> {
        let id = self.item_id(offnum)?;
        let start = id.off as usize;
        let end = start + id.len as usize;
        if end > BLCKSZ {
            return Err(DbError::InvalidPage(format!(
                "item {} points past page end",
                offnum
            )));
        }
        Ok(&mut self.data[start..end])
    }

    /// Add an item to the page.
    ///
    /// If `offset` is a valid offset number, the slot is claimed there —
    /// shuffling higher line pointers up, or overwriting a deallocated
    /// slot, per `mode`. Otherwise the first recyclable slot is reused,
    /// falling back to extending the line-pointer array.
    ///
    /// Returns `Ok(None)` when the item does not fit.
    pub fn add_item(
        &mut self,
        item: &[u8],
        offset: OffsetNumber,
        mode: PageInsertMode,
        flags: u8,
    ) -> Result<Option<OffsetNumber>> {
        let size = item.len();
        if size >= 1 << 15 {
            return Err(DbError::InvalidPage(format!("item too large: {}", size)));
        }
        let limit = self.max_offset_number() + 1;
        let mut offset = offset;
        let mut shuffled = false;

        if offset != INVALID_OFFSET_NUMBER {
            if offset > limit {
                return Err(DbError::InvalidPage(format!(
                    "offset {} beyond line pointer array (limit {})",
                    offset, limit
                )));
            }
            match mode {
                PageInsertMode::Shuffle => shuffled = true,
                PageInsertMode::Overwrite => {
                    if offset < limit {
                        let target = self.item_id(offset)?;
                        if target.is_used() || target.len != 0 {
                            return Err(DbError::InvalidPage(
                                "tried overwrite of used line pointer".into(),
                            ));
                        }
                    }
                }
            }
        } else {
            // Look for a recyclable (unused and deallocated) slot.
            offset = limit;
            for cand in 1..limit {
                if self.item_id(cand)?.is_recyclable() {
                    offset = cand;
                    break;
                }
            }
        }

        let lower = if offset == limit || shuffled {
            self.lower() + ITEM_ID_SIZE as u16
        } else {
            self.lower()
        };

        let aligned = max_align(size) as u16;
        let cur_upper = self.upper();
        if (cur_upper as usize) < aligned as usize || lower > cur_upper - aligned {
            return Ok(None);
        }
        let upper = cur_upper - aligned;

        if shuffled {
            // Shift line pointers up one slot to open the hole.
            let mut i = limit - 1;
            while i >= offset {
                let from = self.item_id(i)?;
                self.set_item_id(i + 1, from);
                i -= 1;
            }
        }

        self.set_item_id(offset, ItemId::new(upper, size as u16, flags));
        self.data[upper as usize..upper as usize + size].copy_from_slice(item);
        self.set_lower(lower);
        self.set_upper(upper);

        Ok(Some(offset))
    }

    /// Remove the line pointer at `offnum`, sliding higher pointers
    /// down and compacting the freed item data toward the special area.
    pub fn index_tuple_delete(&mut self, offnum: OffsetNumber) -> Result<()> {
        let nline = self.max_offset_number();
        let tup = self.item_id(offnum)?;
        let size = max_align(tup.len as usize) as u16;
        let locn = tup.off;

        // Drop the line pointer by copying the tail of the array back
        // one slot.
        for i in offnum..nline {
            let next = self.item_id(i + 1)?;
            self.set_item_id(i, next);
        }

        // Slide [upper, locn) forward so the hole closes against the
        // free-space boundary.
        let upper = self.upper();
        if locn != upper {
            let region = upper as usize..locn as usize;
            self.data.copy_within(region, upper as usize + size as usize);
        }

        self.set_upper(upper + size);
        self.set_lower(self.lower() - ITEM_ID_SIZE as u16);

        // Anything that lived below the deleted item moved up by `size`.
        if !self.is_empty() {
            for i in 1..=self.max_offset_number() {
                let mut id = self.item_id(i)?;
                if id.off <= locn {
                    id.off += size;
                    self.set_item_id(i, id);
                }
            }
        }
        Ok(())
    }

    /// Defragment the item-data area: live items are compacted against
    /// the special area, unused slots have their lengths zeroed so they
    /// become recyclable. Returns the number of unused line pointers.
    pub fn repair_fragmentation(&mut self) -> Result<usize> {
        let nline = self.max_offset_number();
        let mut used: Vec<(OffsetNumber, ItemId)> = Vec::new();
        let mut free = 0usize;

        for i in 1..=nline {
            let id = self.item_id(i)?;
            if id.is_used() {
                used.push((i, id));
            } else {
                free += 1;
                self.set_item_id(i, ItemId::new(id.off, 0, id.flags));
            }
        }

        if used.is_empty() {
            let special = self.special();
            self.set_upper(special);
            return Ok(free);
        }

        // Walk live items from highest current offset down, rewriting
        // each against the shrinking upper boundary.
        used.sort_by(|a, b| b.1.off.cmp(&a.1.off));

        let mut upper = self.special();
        for (offnum, id) in used {
            let aligned = max_align(id.len as usize) as u16;
            upper -= aligned;
            let src = id.off as usize..id.off as usize + id.len as usize;
            self.data.copy_within(src, upper as usize);
            self.set_item_id(offnum, ItemId::new(upper, id.len, id.flags));
        }
        self.set_upper(upper);
        Ok(free)
    }

    /// Trim trailing line pointers that are unused and deallocated,
    /// shrinking the array. Returns the new maximum offset number.
    pub fn compact(&mut self) -> Result<OffsetNumber> {
        let nline = self.max_offset_number();
        if nline == 0 {
            return Ok(0);
        }
        let mut keep = nline;
        while keep > 0 {
            let id = self.item_id(keep)?;
            if id.is_used() || id.len > 0 {
                break;
            }
            keep -= 1;
        }
        if keep != nline {
            self.set_lower((PAGE_HEADER_SIZE + keep as usize * ITEM_ID_SIZE) as u16);
        }
        Ok(keep)
    }

    /// Copy this page into a scratch page with an empty item area, for
    /// access methods that rebuild a page off to the side.
    pub fn get_temp_page(&self, special_size: usize) -> Page {
        let mut temp = self.clone();
        let special_size = max_align(special_size);
        temp.data[PAGE_HEADER_SIZE..BLCKSZ - special_size].fill(0);
        temp.set_lower(PAGE_HEADER_SIZE as u16);
        temp.set_upper((BLCKSZ - special_size) as u16);
        temp
    }

    /// Copy a scratch page produced by `get_temp_page` back in place.
    pub fn restore_temp_page(&mut self, temp: &Page) {
        self.data.copy_from_slice(&temp.data[..]);
    }

    /// Borrow the access-method special area.
    pub fn special_area(&self) -> &[u8] {
        &self.data[self.special() as usize..]
    }

    pub fn special_area_mut(&mut self) -> &mut [u8] {
        let special = self.special() as usize;
        &mut self.data[special..]
    }

    // ------------------------------------------------------------------
    // Checksums
    // ------------------------------------------------------------------

    /// Compute and store the page checksum. Stores the INVALID sentinel
    /// when checksums are disabled process-wide.
    pub fn set_checksum(&mut self) -> u64 {
        let value = if page_checksums_enabled() {
            checksum::crc64(&self.data[PAGE_HEADER_SIZE..])
        } else {
            INVALID_CRC64
        };
        self.store_checksum(value);
        value
    }

    /// Validate the stored checksum. Pages carrying the INIT or INVALID
    /// sentinel verify clean.
    pub fn verify_checksum(&self) -> bool {
        if !page_checksums_enabled() {
            return true;
        }
        let stored = self.stored_checksum();
        if stored == INIT_CRC64 || stored == INVALID_CRC64 {
            return true;
        }
        stored == checksum::crc64(&self.data[PAGE_HEADER_SIZE..])
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("lower", &self.lower())
            .field("upper", &self.upper())
            .field("special", &self.special())
            .field("items", &self.max_offset_number())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_page() -> Page {
        let mut page = Page::new();
        page.init(32);
        page
    }

    #[test]
    fn test_init_boundaries() {
        let page = fresh_page();
        assert_eq!(page.lower() as usize, PAGE_HEADER_SIZE);
        assert_eq!(page.upper() as usize, BLCKSZ - 32);
        assert_eq!(page.special() as usize, BLCKSZ - 32);
        assert!(page.is_initialized());
        assert!(page.is_empty());
        assert_eq!(page.stored_checksum(), INIT_CRC64);
    }

    #[test]
    fn test_add_item_assigns_offsets() {
        let mut page = fresh_page();
        let first = page
            .add_item(b"hello", 1, PageInsertMode::Shuffle, item_flags::USED)
            .unwrap();
        assert_eq!(first, Some(1));
        let second = page
            .add_item(
                b"world",
                INVALID_OFFSET_NUMBER,
                PageInsertMode::Shuffle,
                item_flags::USED,
            )
            .unwrap();
        assert_eq!(second, Some(2));
        assert_eq!(page.item(1).unwrap(), b"hello");
        assert_eq!(page.item(2).unwrap(), b"world");
        assert_eq!(page.max_offset_number(), 2);
    }

    #[test]
    fn test_add_item_page_full() {
        let mut page = fresh_page();
        let big = vec![0xAAu8; 4000];
        assert!(page
            .add_item(&big, 0, PageInsertMode::Shuffle, item_flags::USED)
            .unwrap()
            .is_some());
        assert!(page
            .add_item(&big, 0, PageInsertMode::Shuffle, item_flags::USED)
            .unwrap()
            .is_some());
        // Third copy cannot fit.
        assert!(page
            .add_item(&big, 0, PageInsertMode::Shuffle, item_flags::USED)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_overwrite_used_slot_rejected() {
        let mut page = fresh_page();
        page.add_item(b"x", 1, PageInsertMode::Shuffle, item_flags::USED)
            .unwrap();
        let err = page.add_item(b"y", 1, PageInsertMode::Overwrite, item_flags::USED);
        assert!(err.is_err());
    }

    #[test]
    fn test_index_tuple_delete_round_trip() {
        let mut page = fresh_page();
        let before = page.free_space();
        page.add_item(b"hello", 1, PageInsertMode::Shuffle, item_flags::USED)
            .unwrap();
        page.add_item(b"world", 2, PageInsertMode::Shuffle, item_flags::USED)
            .unwrap();
        page.index_tuple_delete(1).unwrap();

        assert_eq!(page.max_offset_number(), 1);
        assert_eq!(page.item(1).unwrap(), b"world");

        page.index_tuple_delete(1).unwrap();
        assert_eq!(page.max_offset_number(), 0);
        assert!(page.free_space() >= before);
    }

    #[test]
    fn test_repair_fragmentation_compacts() {
        let mut page = fresh_page();
        for payload in [&b"aaaa"[..], b"bbbbbbbb", b"cccc"] {
            page.add_item(payload, 0, PageInsertMode::Shuffle, item_flags::USED)
                .unwrap();
        }
        // Kill the middle item by clearing its USED flag.
        let id = page.item_id(2).unwrap();
        page.set_item_id(2, ItemId::new(id.off, id.len, 0));

        let freed = page.repair_fragmentation().unwrap();
        assert_eq!(freed, 1);
        assert_eq!(page.item(1).unwrap(), b"aaaa");
        assert_eq!(page.item(3).unwrap(), b"cccc");
        // Slot 2 is recyclable now.
        assert!(page.item_id(2).unwrap().is_recyclable());
        let reused = page
            .add_item(b"dd", 0, PageInsertMode::Shuffle, item_flags::USED)
            .unwrap();
        assert_eq!(reused, Some(2));
    }

    #[test]
    fn test_compact_trims_trailing_slots() {
        let mut page = fresh_page();
        for payload in [&b"aaaa"[..], b"bbbb", b"cccc"] {
            page.add_item(payload, 0, PageInsertMode::Shuffle, item_flags::USED)
                .unwrap();
        }
        for offnum in [3u16, 2u16] {
            let id = page.item_id(offnum).unwrap();
            page.set_item_id(offnum, ItemId::new(id.off, 0, 0));
        }
        assert_eq!(page.compact().unwrap(), 1);
        assert_eq!(page.max_offset_number(), 1);
    }

    #[test]
    fn test_checksum_round_trip() {
        let prev = set_page_checksums(true);
        let mut page = fresh_page();
        page.add_item(b"payload", 0, PageInsertMode::Shuffle, item_flags::USED)
            .unwrap();
        page.set_checksum();
        assert!(page.verify_checksum());

        // Corrupt one payload byte.
        let upper = page.upper() as usize;
        page.as_bytes_mut()[upper] ^= 0xFF;
        assert!(!page.verify_checksum());
        set_page_checksums(prev);
    }

    #[test]
    fn test_checksum_sentinels_accepted() {
        let prev = set_page_checksums(true);
        let page = fresh_page();
        // INIT sentinel left by init() verifies clean.
        assert!(page.verify_checksum());
        set_page_checksums(prev);
    }

    #[test]
    fn test_temp_page_round_trip() {
        let mut page = fresh_page();
        page.add_item(b"keep", 0, PageInsertMode::Shuffle, item_flags::USED)
            .unwrap();
        let mut temp = page.get_temp_page(32);
        assert!(temp.is_empty());
        temp.add_item(b"rebuilt", 0, PageInsertMode::Shuffle, item_flags::USED)
            .unwrap();
        page.restore_temp_page(&temp);
        assert_eq!(page.item(1).unwrap(), b"rebuilt");
    }
}
