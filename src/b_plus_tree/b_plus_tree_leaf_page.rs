use bincode::{Decode, Encode};
use std::fmt::Debug;

use crate::{
    common::rid::{Rid, RID_SIZE},
    disk_management::buffer_pool::{PageId, INVALID_PAGE_ID, PAGE_SIZE},
};

use super::LEAF_PAGE_TYPE;

pub const LEAF_HEADER_SIZE: usize = 21;

#[derive(Decode, Encode)]
struct BPlusTreeLeafPageHeader {
    page_type: u8,
    current_size: u32,
    max_size: u32,
    own_pid: u32,
    parent_pid: u32,
    next_leaf: u32,
}

/// Header (21 bytes):
/// ------------------------------------------------------------------------------------------------
/// | PAGE_TYPE (1) | CURRENT_SIZE (4) | MAX_SIZE (4) | OWN_PID (4) | PARENT_PID (4) | NEXT_LEAF (4) |
/// ------------------------------------------------------------------------------------------------
///
/// Content:
/// ---------------------------------------------------------------------
/// | HEADER (21) | KEY (k) 1 + RID (8) 1 | ... | KEY (k) n + RID (8) n |
/// ---------------------------------------------------------------------
///
/// Keys are kept strictly increasing; the leaves of a tree form a singly
/// linked list in key order through `next_leaf`.
pub struct BPlusTreeLeafPage<K: Ord + Copy + Debug + Encode + Decode<()>> {
    header: BPlusTreeLeafPageHeader,
    entries: Vec<(K, Rid)>,
}

impl<K: Ord + Copy + Debug + Encode + Decode<()>> BPlusTreeLeafPage<K> {
    /// `max_size` of 0 sizes the page to exactly fill [PAGE_SIZE].
    pub fn new(own_pid: PageId, parent_pid: PageId, max_size: u32) -> BPlusTreeLeafPage<K> {
        let max_size = if max_size == 0 {
            Self::page_capacity()
        } else {
            max_size
        };
        BPlusTreeLeafPage {
            header: BPlusTreeLeafPageHeader {
                page_type: LEAF_PAGE_TYPE,
                current_size: 0,
                max_size,
                own_pid,
                parent_pid,
                next_leaf: INVALID_PAGE_ID,
            },
            entries: Vec::new(),
        }
    }

    fn entry_size() -> usize {
        std::mem::size_of::<K>() + RID_SIZE
    }

    /// Largest number of entries that still fits the page.
    pub fn page_capacity() -> u32 {
        ((PAGE_SIZE - LEAF_HEADER_SIZE) / Self::entry_size()) as u32
    }

    pub fn from_page_data(data: &[u8; PAGE_SIZE]) -> Option<BPlusTreeLeafPage<K>> {
        let config = bincode::config::standard().with_fixed_int_encoding();
        let header: BPlusTreeLeafPageHeader =
            bincode::decode_from_slice(&data[0..LEAF_HEADER_SIZE], config)
                .ok()?
                .0;
        if header.page_type != LEAF_PAGE_TYPE {
            return None;
        }

        let entry_size = Self::entry_size();
        let mut entries = Vec::with_capacity(header.current_size as usize);
        let mut offset = LEAF_HEADER_SIZE;
        for _ in 0..header.current_size {
            let entry: (K, Rid) =
                bincode::decode_from_slice(&data[offset..offset + entry_size], config)
                    .ok()?
                    .0;
            entries.push(entry);
            offset += entry_size;
        }
        Some(BPlusTreeLeafPage { header, entries })
    }

    pub fn write_to_page(&mut self, data: &mut [u8; PAGE_SIZE]) {
        self.header.current_size = self.entries.len() as u32;
        let config = bincode::config::standard().with_fixed_int_encoding();
        data.fill(0);
        bincode::encode_into_slice(&self.header, &mut data[0..LEAF_HEADER_SIZE], config)
            .expect("could not encode the leaf page header");
        let entry_size = Self::entry_size();
        let mut offset = LEAF_HEADER_SIZE;
        for entry in &self.entries {
            bincode::encode_into_slice(entry, &mut data[offset..offset + entry_size], config)
                .expect("could not encode a leaf page entry");
            offset += entry_size;
        }
    }

    pub fn size(&self) -> u32 {
        self.entries.len() as u32
    }

    pub fn max_size(&self) -> u32 {
        self.header.max_size
    }

    pub fn min_size(&self) -> u32 {
        (self.header.max_size + 1) / 2
    }

    pub fn page_id(&self) -> PageId {
        self.header.own_pid
    }

    pub fn parent_page_id(&self) -> PageId {
        self.header.parent_pid
    }

    pub fn set_parent_page_id(&mut self, parent_pid: PageId) {
        self.header.parent_pid = parent_pid;
    }

    pub fn next_page_id(&self) -> PageId {
        self.header.next_leaf
    }

    pub fn set_next_page_id(&mut self, next_leaf: PageId) {
        self.header.next_leaf = next_leaf;
    }

    pub fn key_at(&self, index: usize) -> K {
        self.entries[index].0
    }

    pub fn item(&self, index: usize) -> (K, Rid) {
        self.entries[index]
    }

    /// First slot whose key is >= `key`; `size` when every key is smaller.
    pub fn key_index(&self, key: &K) -> usize {
        match self.entries.binary_search_by(|(k, _)| k.cmp(key)) {
            Ok(pos) => pos,
            Err(pos) => pos,
        }
    }

    pub fn lookup(&self, key: &K) -> Option<Rid> {
        let index = self.entries.binary_search_by(|(k, _)| k.cmp(key)).ok()?;
        Some(self.entries[index].1)
    }

    /// Inserts in key order and returns the size after insertion. The caller
    /// rules out duplicates beforehand.
    pub fn insert(&mut self, key: K, rid: Rid) -> u32 {
        let pos = self.key_index(&key);
        self.entries.insert(pos, (key, rid));
        self.entries.len() as u32
    }

    /// Moves the upper half to `recipient` and splices it into the sibling
    /// list right after this page.
    pub fn move_half_to(&mut self, recipient: &mut BPlusTreeLeafPage<K>) {
        let split_at = self.entries.len() / 2;
        recipient.entries.extend(self.entries.drain(split_at..));
        recipient.header.next_leaf = self.header.next_leaf;
        self.header.next_leaf = recipient.header.own_pid;
    }

    /// Appends every entry to `recipient` (the left sibling) and unlinks this
    /// page from the sibling list.
    pub fn move_all_to(&mut self, recipient: &mut BPlusTreeLeafPage<K>) {
        recipient.entries.append(&mut self.entries);
        recipient.header.next_leaf = self.header.next_leaf;
    }

    /// Returns the size after deletion; an unchanged size means the key was
    /// absent.
    pub fn remove_and_delete_record(&mut self, key: &K) -> u32 {
        if let Ok(pos) = self.entries.binary_search_by(|(k, _)| k.cmp(key)) {
            self.entries.remove(pos);
        }
        self.entries.len() as u32
    }

    /// Donates the smallest entry to the end of `recipient` (the neighbor to
    /// the left) and returns this page's new first key, which becomes the
    /// separator between the two.
    pub fn move_first_to_end_of(&mut self, recipient: &mut BPlusTreeLeafPage<K>) -> K {
        let entry = self.entries.remove(0);
        recipient.entries.push(entry);
        self.entries[0].0
    }

    /// Donates the largest entry to the front of `recipient` (the neighbor to
    /// the right) and returns the donated key, which becomes the separator
    /// between the two.
    pub fn move_last_to_front_of(&mut self, recipient: &mut BPlusTreeLeafPage<K>) -> K {
        let entry = self.entries.pop().expect("donor leaf is empty");
        recipient.entries.insert(0, entry);
        recipient.entries[0].0
    }
}

#[cfg(test)]
mod leaf_page_tests {
    use super::*;

    fn rid(n: u32) -> Rid {
        Rid::new(n, n)
    }

    #[test]
    fn codec_round_trip() {
        let mut leaf = BPlusTreeLeafPage::<u64>::new(5, 2, 8);
        leaf.insert(30, rid(3));
        leaf.insert(10, rid(1));
        leaf.insert(20, rid(2));
        leaf.set_next_page_id(9);

        let mut data = [0u8; PAGE_SIZE];
        leaf.write_to_page(&mut data);
        let decoded = BPlusTreeLeafPage::<u64>::from_page_data(&data).expect("leaf decodes");

        assert_eq!(decoded.size(), 3);
        assert_eq!(decoded.max_size(), 8);
        assert_eq!(decoded.page_id(), 5);
        assert_eq!(decoded.parent_page_id(), 2);
        assert_eq!(decoded.next_page_id(), 9);
        assert_eq!(decoded.key_at(0), 10);
        assert_eq!(decoded.key_at(2), 30);
        assert_eq!(decoded.lookup(&20), Some(rid(2)));
    }

    #[test]
    fn key_index_finds_lower_bound() {
        let mut leaf = BPlusTreeLeafPage::<u64>::new(1, INVALID_PAGE_ID, 8);
        for key in [10u64, 20, 30] {
            leaf.insert(key, rid(key as u32));
        }
        assert_eq!(leaf.key_index(&5), 0);
        assert_eq!(leaf.key_index(&10), 0);
        assert_eq!(leaf.key_index(&15), 1);
        assert_eq!(leaf.key_index(&30), 2);
        assert_eq!(leaf.key_index(&31), 3);
    }

    #[test]
    fn remove_absent_key_keeps_size() {
        let mut leaf = BPlusTreeLeafPage::<u64>::new(1, INVALID_PAGE_ID, 8);
        leaf.insert(10, rid(1));
        leaf.insert(20, rid(2));
        assert_eq!(leaf.remove_and_delete_record(&15), 2);
        assert_eq!(leaf.remove_and_delete_record(&10), 1);
        assert_eq!(leaf.key_at(0), 20);
    }

    #[test]
    fn move_half_splices_sibling_list() {
        let mut leaf = BPlusTreeLeafPage::<u64>::new(1, INVALID_PAGE_ID, 3);
        leaf.set_next_page_id(7);
        for key in [1u64, 2, 3, 4] {
            leaf.insert(key, rid(key as u32));
        }
        let mut sibling = BPlusTreeLeafPage::<u64>::new(2, INVALID_PAGE_ID, 3);
        leaf.move_half_to(&mut sibling);

        assert_eq!(leaf.size(), 2);
        assert_eq!(sibling.size(), 2);
        assert_eq!(sibling.key_at(0), 3);
        assert_eq!(leaf.next_page_id(), 2);
        assert_eq!(sibling.next_page_id(), 7);
    }

    #[test]
    fn rotations_report_the_new_separator() {
        let mut left = BPlusTreeLeafPage::<u64>::new(1, 0, 4);
        let mut right = BPlusTreeLeafPage::<u64>::new(2, 0, 4);
        for key in [1u64, 2, 3] {
            left.insert(key, rid(key as u32));
        }
        right.insert(10, rid(10));

        // Left donates its largest to the right neighbor.
        let separator = left.move_last_to_front_of(&mut right);
        assert_eq!(separator, 3);
        assert_eq!(right.key_at(0), 3);
        assert_eq!(left.size(), 2);

        // Right donates its smallest back.
        let separator = right.move_first_to_end_of(&mut left);
        assert_eq!(separator, 10);
        assert_eq!(left.key_at(left.size() as usize - 1), 3);
        assert_eq!(right.size(), 1);
    }
}
