use bincode::{Decode, Encode};
use std::fmt::Debug;

use crate::disk_management::buffer_pool::{PageId, PAGE_SIZE};

use super::INTERNAL_PAGE_TYPE;

pub const INTERNAL_HEADER_SIZE: usize = 17;
const CHILD_ID_SIZE: usize = 4;

#[derive(Decode, Encode)]
struct KeyPagePair<K> {
    key: K,
    page_id: u32,
}

#[derive(Decode, Encode)]
struct BPlusTreeInternalPageHeader {
    page_type: u8,
    current_size: u32,
    max_size: u32,
    own_pid: u32,
    parent_pid: u32,
}

/// Header (17 bytes):
/// ---------------------------------------------------------------------------
/// | PAGE_TYPE (1) | CURRENT_SIZE (4) | MAX_SIZE (4) | OWN_PID (4) | PARENT_PID (4) |
/// ---------------------------------------------------------------------------
///
/// Content:
/// -----------------------------------------------------------------------------
/// | HEADER (17) | KEY (k) 1 + PAGE_ID (4) 1 | ... | KEY (k) n + PAGE_ID (4) n |
/// -----------------------------------------------------------------------------
///
/// Slot 0's key is an unused sentinel; slot 0's child covers everything below
/// the key in slot 1. For every slot i >= 1, the subtree under slot i-1 holds
/// keys < keys[i] and the subtree under slot i holds keys >= keys[i].
pub struct BPlusTreeInternalPage<K: Ord + Copy + Debug + Encode + Decode<()>> {
    header: BPlusTreeInternalPageHeader,
    key_page_pairs: Vec<KeyPagePair<K>>,
}

impl<K: Ord + Copy + Debug + Encode + Decode<()>> BPlusTreeInternalPage<K> {
    /// `max_size` of 0 sizes the page to exactly fill [PAGE_SIZE].
    pub fn new(own_pid: PageId, parent_pid: PageId, max_size: u32) -> BPlusTreeInternalPage<K> {
        let max_size = if max_size == 0 {
            Self::page_capacity()
        } else {
            max_size
        };
        BPlusTreeInternalPage {
            header: BPlusTreeInternalPageHeader {
                page_type: INTERNAL_PAGE_TYPE,
                current_size: 0,
                max_size,
                own_pid,
                parent_pid,
            },
            key_page_pairs: Vec::new(),
        }
    }

    fn pair_size() -> usize {
        std::mem::size_of::<K>() + CHILD_ID_SIZE
    }

    /// Largest number of children that still fits the page.
    pub fn page_capacity() -> u32 {
        ((PAGE_SIZE - INTERNAL_HEADER_SIZE) / Self::pair_size()) as u32
    }

    pub fn from_page_data(data: &[u8; PAGE_SIZE]) -> Option<BPlusTreeInternalPage<K>> {
        let config = bincode::config::standard().with_fixed_int_encoding();
        let header: BPlusTreeInternalPageHeader =
            bincode::decode_from_slice(&data[0..INTERNAL_HEADER_SIZE], config)
                .ok()?
                .0;
        if header.page_type != INTERNAL_PAGE_TYPE {
            return None;
        }

        let pair_size = Self::pair_size();
        let mut key_page_pairs = Vec::with_capacity(header.current_size as usize);
        let mut offset = INTERNAL_HEADER_SIZE;
        for _ in 0..header.current_size {
            let pair: KeyPagePair<K> =
                bincode::decode_from_slice(&data[offset..offset + pair_size], config)
                    .ok()?
                    .0;
            key_page_pairs.push(pair);
            offset += pair_size;
        }
        Some(BPlusTreeInternalPage {
            header,
            key_page_pairs,
        })
    }

    pub fn write_to_page(&mut self, data: &mut [u8; PAGE_SIZE]) {
        self.header.current_size = self.key_page_pairs.len() as u32;
        let config = bincode::config::standard().with_fixed_int_encoding();
        data.fill(0);
        bincode::encode_into_slice(&self.header, &mut data[0..INTERNAL_HEADER_SIZE], config)
            .expect("could not encode the internal page header");
        let pair_size = Self::pair_size();
        let mut offset = INTERNAL_HEADER_SIZE;
        for pair in &self.key_page_pairs {
            bincode::encode_into_slice(pair, &mut data[offset..offset + pair_size], config)
                .expect("could not encode an internal page entry");
            offset += pair_size;
        }
    }

    pub fn size(&self) -> u32 {
        self.key_page_pairs.len() as u32
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

    pub fn key_at(&self, index: usize) -> K {
        self.key_page_pairs[index].key
    }

    pub fn set_key_at(&mut self, index: usize, key: K) {
        self.key_page_pairs[index].key = key;
    }

    pub fn value_at(&self, index: usize) -> PageId {
        self.key_page_pairs[index].page_id
    }

    /// Slot whose child is `page_id`, if any.
    pub fn value_index(&self, page_id: PageId) -> Option<usize> {
        self.key_page_pairs
            .iter()
            .position(|pair| pair.page_id == page_id)
    }

    pub fn values(&self) -> impl Iterator<Item = PageId> + '_ {
        self.key_page_pairs.iter().map(|pair| pair.page_id)
    }

    /// Child covering `key`: the child of the largest slot i >= 1 with
    /// keys[i] <= key, or the leftmost child when every key is larger.
    pub fn lookup(&self, key: &K) -> PageId {
        let slot = match self.key_page_pairs[1..].binary_search_by(|pair| pair.key.cmp(key)) {
            Ok(i) => i + 1,
            Err(i) => i,
        };
        self.key_page_pairs[slot].page_id
    }

    /// Turns this page into the root produced by a root split: the old root
    /// to the left of `key`, the new sibling to the right.
    pub fn populate_new_root(&mut self, left_child: PageId, key: K, right_child: PageId) {
        self.key_page_pairs = vec![
            KeyPagePair {
                key,
                page_id: left_child,
            },
            KeyPagePair {
                key,
                page_id: right_child,
            },
        ];
    }

    /// Inserts `(key, new_child)` right after the slot holding `old_child`.
    /// Returns the size after insertion.
    pub fn insert_node_after(&mut self, old_child: PageId, key: K, new_child: PageId) -> u32 {
        let index = self
            .value_index(old_child)
            .expect("split child is missing from its parent");
        self.key_page_pairs.insert(
            index + 1,
            KeyPagePair {
                key,
                page_id: new_child,
            },
        );
        self.key_page_pairs.len() as u32
    }

    /// Moves the upper half to `recipient` and returns the separator to push
    /// into the parent; the separator lands in the recipient's sentinel slot.
    /// The caller re-parents the moved children.
    pub fn move_half_to(&mut self, recipient: &mut BPlusTreeInternalPage<K>) -> K {
        let split_at = self.key_page_pairs.len() / 2;
        recipient
            .key_page_pairs
            .extend(self.key_page_pairs.drain(split_at..));
        recipient.key_page_pairs[0].key
    }

    /// Appends every slot to `recipient` (the left sibling), materializing
    /// the parent separator `middle_key` into the sentinel slot first. The
    /// caller re-parents the moved children.
    pub fn move_all_to(&mut self, recipient: &mut BPlusTreeInternalPage<K>, middle_key: K) {
        self.key_page_pairs[0].key = middle_key;
        recipient.key_page_pairs.append(&mut self.key_page_pairs);
    }

    /// Donates the leftmost child to the end of `recipient` (the neighbor to
    /// the left), gluing it there under the old parent separator. Returns the
    /// new separator and the moved child.
    pub fn move_first_to_end_of(
        &mut self,
        recipient: &mut BPlusTreeInternalPage<K>,
        separator: K,
    ) -> (K, PageId) {
        let first = self.key_page_pairs.remove(0);
        let new_separator = self.key_page_pairs[0].key;
        recipient.key_page_pairs.push(KeyPagePair {
            key: separator,
            page_id: first.page_id,
        });
        (new_separator, first.page_id)
    }

    /// Donates the rightmost child to the front of `recipient` (the neighbor
    /// to the right); the old parent separator moves into the recipient's
    /// previous sentinel slot. Returns the new separator and the moved child.
    pub fn move_last_to_front_of(
        &mut self,
        recipient: &mut BPlusTreeInternalPage<K>,
        separator: K,
    ) -> (K, PageId) {
        let last = self
            .key_page_pairs
            .pop()
            .expect("donor internal page is empty");
        recipient.key_page_pairs[0].key = separator;
        recipient.key_page_pairs.insert(
            0,
            KeyPagePair {
                key: last.key,
                page_id: last.page_id,
            },
        );
        (last.key, last.page_id)
    }

    /// Removes the slot at `index`, keeping the remaining slots contiguous.
    pub fn remove(&mut self, index: usize) {
        self.key_page_pairs.remove(index);
    }

    /// Removes and returns the only remaining child. Only meaningful while
    /// collapsing the root.
    pub fn remove_and_return_only_child(&mut self) -> PageId {
        let only = self.key_page_pairs.remove(0);
        debug_assert!(self.key_page_pairs.is_empty());
        only.page_id
    }
}
