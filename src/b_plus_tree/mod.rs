use bincode::{Decode, Encode};
use std::{
    fmt::Debug,
    marker::PhantomData,
    sync::atomic::{AtomicBool, AtomicU32, Ordering},
    sync::Arc,
};

use log::debug;

use crate::{
    common::{rid::Rid, rw_latch::RwLatch, transaction::Transaction},
    disk_management::buffer_pool::{BufferPool, Page, PageId, INVALID_PAGE_ID, PAGE_SIZE},
};

use self::{
    b_plus_tree_internal_page::BPlusTreeInternalPage,
    b_plus_tree_leaf_page::BPlusTreeLeafPage,
    header_page::{HeaderPage, HEADER_PAGE_ID},
};

pub mod b_plus_tree_internal_page;
pub mod b_plus_tree_leaf_page;
pub mod header_page;

pub(crate) const INTERNAL_PAGE_TYPE: u8 = 0;
pub(crate) const LEAF_PAGE_TYPE: u8 = 1;

// Both page headers start with PAGE_TYPE (1), CURRENT_SIZE (4), MAX_SIZE (4),
// OWN_PID (4), so the parent pointer sits at the same offset in either kind.
const PARENT_PID_OFFSET: usize = 13;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Operation {
    Read,
    Insert,
    Delete,
}

enum BPlusTreePage<K: Ord + Copy + Debug + Encode + Decode<()>> {
    InternalPage(BPlusTreeInternalPage<K>),
    LeafPage(BPlusTreeLeafPage<K>),
}

impl<K: Ord + Copy + Debug + Encode + Decode<()>> BPlusTreePage<K> {
    fn from_page_data(data: &[u8; PAGE_SIZE]) -> Option<BPlusTreePage<K>> {
        match data[0] {
            LEAF_PAGE_TYPE => Some(BPlusTreePage::LeafPage(BPlusTreeLeafPage::from_page_data(
                data,
            )?)),
            INTERNAL_PAGE_TYPE => Some(BPlusTreePage::InternalPage(
                BPlusTreeInternalPage::from_page_data(data)?,
            )),
            _ => None,
        }
    }

    fn size(&self) -> u32 {
        match self {
            BPlusTreePage::InternalPage(page) => page.size(),
            BPlusTreePage::LeafPage(page) => page.size(),
        }
    }

    fn max_size(&self) -> u32 {
        match self {
            BPlusTreePage::InternalPage(page) => page.max_size(),
            BPlusTreePage::LeafPage(page) => page.max_size(),
        }
    }

    fn min_size(&self) -> u32 {
        match self {
            BPlusTreePage::InternalPage(page) => page.min_size(),
            BPlusTreePage::LeafPage(page) => page.min_size(),
        }
    }

    fn page_id(&self) -> PageId {
        match self {
            BPlusTreePage::InternalPage(page) => page.page_id(),
            BPlusTreePage::LeafPage(page) => page.page_id(),
        }
    }

    fn parent_page_id(&self) -> PageId {
        match self {
            BPlusTreePage::InternalPage(page) => page.parent_page_id(),
            BPlusTreePage::LeafPage(page) => page.parent_page_id(),
        }
    }
}

fn read_parent_pointer(page: &Arc<Page>) -> PageId {
    u32::from_le_bytes(
        page.read_data()[PARENT_PID_OFFSET..PARENT_PID_OFFSET + 4]
            .try_into()
            .unwrap(),
    )
}

fn write_parent_pointer(page: &Arc<Page>, parent_pid: PageId) {
    page.write_data()[PARENT_PID_OFFSET..PARENT_PID_OFFSET + 4]
        .copy_from_slice(&parent_pid.to_le_bytes());
}

/// B+ tree index over the buffer pool: internal pages direct the search,
/// leaf pages hold `(key, rid)` records. Keys are unique; the tree grows and
/// shrinks dynamically and supports range scans through [IndexIterator].
///
/// Writers descend with latch coupling: a node's latch is released only once
/// the child below it is latched and known to absorb the structural change.
/// The root pointer is an atomic page id; write descents additionally
/// serialize on a tree-level root latch, while readers revalidate the root id
/// after latching, so no descent can act on a stale root.
pub struct BPlusTree<K: Ord + Copy + Debug + Encode + Decode<()>> {
    index_name: String,
    buffer_pool: Arc<BufferPool>,
    root_page_id: AtomicU32,
    root_latch: RwLatch,
    header_record_exists: AtomicBool,
    leaf_max_size: u32,
    internal_max_size: u32,
    phantom: PhantomData<K>,
}

impl<K: Ord + Copy + Debug + Encode + Decode<()>> BPlusTree<K> {
    /// Opens the index named `index_name`, recovering its root from the
    /// header page when the database file already contains it. Max sizes of 0
    /// let each page type fill [PAGE_SIZE].
    pub fn new(
        index_name: &str,
        buffer_pool: Arc<BufferPool>,
        leaf_max_size: u32,
        internal_max_size: u32,
    ) -> BPlusTree<K> {
        if buffer_pool.num_disk_pages() == 0 {
            let (page_id, _page) = buffer_pool
                .new_page()
                .expect("could not allocate the header page");
            debug_assert_eq!(page_id, HEADER_PAGE_ID);
            buffer_pool.unpin_page(page_id, true);
        }
        let root_page_id = {
            let header_page = buffer_pool
                .fetch_page(HEADER_PAGE_ID)
                .expect("header page unavailable");
            let root_page_id = HeaderPage::from_page_data(&header_page.read_data())
                .get_root_id(index_name);
            buffer_pool.unpin_page(HEADER_PAGE_ID, false);
            root_page_id
        };
        BPlusTree {
            index_name: index_name.to_string(),
            buffer_pool,
            root_page_id: AtomicU32::new(root_page_id.unwrap_or(INVALID_PAGE_ID)),
            root_latch: RwLatch::new(),
            header_record_exists: AtomicBool::new(root_page_id.is_some()),
            leaf_max_size,
            internal_max_size,
            phantom: PhantomData,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.root_page_id.load(Ordering::Acquire) == INVALID_PAGE_ID
    }

    /// Point lookup. [None] means the key is not in the tree.
    pub fn get_value(&self, key: &K) -> Option<Rid> {
        let mut transaction = Transaction::new();
        let leaf_page = match self.find_leaf_page(Some(key), Operation::Read, &mut transaction) {
            Some(page) => page,
            None => {
                self.unlock_unpin_pages(Operation::Read, &mut transaction);
                return None;
            }
        };
        let result = self.read_leaf(&leaf_page).lookup(key);
        self.unlock_unpin_pages(Operation::Read, &mut transaction);
        result
    }

    /// Inserts a unique key. Returns false when the key is already present
    /// (the tree is left untouched) or no frame could be claimed.
    pub fn insert(&self, key: K, rid: Rid) -> bool {
        let mut transaction = Transaction::new();
        let leaf_page = match self.find_leaf_page(Some(&key), Operation::Insert, &mut transaction)
        {
            Some(page) => page,
            None => {
                // Either the tree is empty (the root latch is still held) or
                // the pool is exhausted.
                let inserted = if self.is_empty() {
                    self.start_new_tree(key, rid)
                } else {
                    false
                };
                self.unlock_unpin_pages(Operation::Insert, &mut transaction);
                return inserted;
            }
        };

        let mut leaf = self.read_leaf(&leaf_page);
        if leaf.lookup(&key).is_some() {
            self.unlock_unpin_pages(Operation::Insert, &mut transaction);
            return false;
        }

        if leaf.size() < leaf.max_size() {
            leaf.insert(key, rid);
            self.write_leaf_page(&leaf_page, &mut leaf);
        } else {
            // Insert first; the transient overflow is resolved by the split
            // before anything reaches the page bytes.
            leaf.insert(key, rid);
            let (new_page_id, new_page) = match self.allocate_node(&mut transaction) {
                Some(allocated) => allocated,
                None => {
                    self.unlock_unpin_pages(Operation::Insert, &mut transaction);
                    return false;
                }
            };
            let mut new_leaf =
                BPlusTreeLeafPage::new(new_page_id, leaf.parent_page_id(), self.leaf_max_size);
            leaf.move_half_to(&mut new_leaf);
            let separator = new_leaf.key_at(0);
            debug!(
                "split leaf {} of \"{}\" into {}",
                leaf.page_id(),
                self.index_name,
                new_page_id
            );
            self.write_leaf_page(&leaf_page, &mut leaf);
            self.write_leaf_page(&new_page, &mut new_leaf);
            self.insert_into_parent(&leaf_page, separator, &new_page, &mut transaction);
        }

        self.unlock_unpin_pages(Operation::Insert, &mut transaction);
        true
    }

    /// Removes `key` if present, rebalancing underflowing nodes by
    /// redistribution or coalescing.
    pub fn remove(&self, key: &K) {
        let mut transaction = Transaction::new();
        let leaf_page = match self.find_leaf_page(Some(key), Operation::Delete, &mut transaction) {
            Some(page) => page,
            None => {
                self.unlock_unpin_pages(Operation::Delete, &mut transaction);
                return;
            }
        };

        let mut leaf = self.read_leaf(&leaf_page);
        let size_before_deletion = leaf.size();
        if leaf.remove_and_delete_record(key) == size_before_deletion {
            self.unlock_unpin_pages(Operation::Delete, &mut transaction);
            return;
        }
        self.write_leaf_page(&leaf_page, &mut leaf);

        if self.coalesce_or_redistribute(&leaf_page, &mut transaction) {
            transaction.add_deleted_page(leaf.page_id());
        }
        self.unlock_unpin_pages(Operation::Delete, &mut transaction);
    }

    /// Iterator over the whole tree in key order.
    pub fn iter(&self) -> IndexIterator<'_, K> {
        self.make_iter(None)
    }

    /// Iterator starting at the first key >= `key`.
    pub fn iter_from(&self, key: &K) -> IndexIterator<'_, K> {
        self.make_iter(Some(key))
    }

    fn make_iter(&self, key: Option<&K>) -> IndexIterator<'_, K> {
        let mut transaction = Transaction::new();
        match self.find_leaf_page(key, Operation::Read, &mut transaction) {
            Some(page) => {
                // The iterator takes over the leaf's read latch and pin.
                let pages = transaction.take_pages();
                debug_assert_eq!(pages.len(), 1);
                drop(pages);
                let leaf = self.read_leaf(&page);
                let index = match key {
                    Some(key) => leaf.key_index(key),
                    None => 0,
                };
                IndexIterator {
                    buffer_pool: &self.buffer_pool,
                    page: Some(page),
                    leaf: Some(leaf),
                    index,
                }
            }
            None => {
                self.unlock_unpin_pages(Operation::Read, &mut transaction);
                IndexIterator {
                    buffer_pool: &self.buffer_pool,
                    page: None,
                    leaf: None,
                    index: 0,
                }
            }
        }
    }

    /// Descends to the leaf responsible for `key` (the leftmost leaf when
    /// `key` is [None]), latch coupling along the way. Read descents latch
    /// shared and release the parent as soon as the child is latched; write
    /// descents latch exclusive and release every ancestor once the child
    /// cannot propagate a structural change. All latched pages are recorded
    /// in the transaction; the caller releases them through
    /// [Self::unlock_unpin_pages] on every path.
    fn find_leaf_page(
        &self,
        key: Option<&K>,
        op: Operation,
        transaction: &mut Transaction,
    ) -> Option<Arc<Page>> {
        if op != Operation::Read {
            self.root_latch.w_lock();
            transaction.set_root_locked(true);
        }

        let mut page = loop {
            let root_page_id = self.root_page_id.load(Ordering::Acquire);
            if root_page_id == INVALID_PAGE_ID {
                return None;
            }
            let page = self.buffer_pool.fetch_page(root_page_id)?;
            if op == Operation::Read {
                page.r_latch();
            } else {
                page.w_latch();
            }
            if self.root_page_id.load(Ordering::Acquire) == root_page_id {
                break page;
            }
            // The root moved while we were latching; retry against the new one.
            if op == Operation::Read {
                page.r_unlatch();
            } else {
                page.w_unlatch();
            }
            self.buffer_pool.unpin_page(root_page_id, false);
        };
        transaction.add_page(page.clone());

        loop {
            let internal = match self.read_node(&page) {
                BPlusTreePage::LeafPage(_) => return Some(page),
                BPlusTreePage::InternalPage(internal) => internal,
            };
            let child_page_id = match key {
                Some(key) => internal.lookup(key),
                None => internal.value_at(0),
            };
            let child = self.buffer_pool.fetch_page(child_page_id)?;
            match op {
                Operation::Read => {
                    child.r_latch();
                    self.unlock_unpin_pages(op, transaction);
                }
                _ => {
                    child.w_latch();
                    let child_node = self.read_node(&child);
                    debug_assert_eq!(child_node.parent_page_id(), page.page_id());
                    if Self::is_safe(&child_node, op) {
                        self.unlock_unpin_pages(op, transaction);
                    }
                }
            }
            transaction.add_page(child.clone());
            page = child;
        }
    }

    /// A node is safe for a write descent when the operation below it cannot
    /// propagate a split or merge through it.
    fn is_safe(node: &BPlusTreePage<K>, op: Operation) -> bool {
        match op {
            Operation::Insert => node.size() < node.max_size(),
            Operation::Delete => node.size() > node.min_size() + 1,
            Operation::Read => true,
        }
    }

    /// Releases every latch and pin recorded in the transaction (pages are
    /// unpinned dirty for write operations), deletes the pages scheduled for
    /// deletion, and gives the root latch back.
    fn unlock_unpin_pages(&self, op: Operation, transaction: &mut Transaction) {
        for page in transaction.take_pages() {
            let page_id = page.page_id();
            if op == Operation::Read {
                page.r_unlatch();
                self.buffer_pool.unpin_page(page_id, false);
            } else {
                page.w_unlatch();
                self.buffer_pool.unpin_page(page_id, true);
            }
        }
        for page_id in transaction.take_deleted_pages() {
            self.buffer_pool.delete_page(page_id);
        }
        if transaction.root_locked() {
            transaction.set_root_locked(false);
            self.root_latch.w_unlock();
        }
    }

    /// Plants the first leaf. Only called under the root latch on an empty
    /// tree.
    fn start_new_tree(&self, key: K, rid: Rid) -> bool {
        let (page_id, page) = match self.buffer_pool.new_page() {
            Some(allocated) => allocated,
            None => return false,
        };
        let mut root = BPlusTreeLeafPage::new(page_id, INVALID_PAGE_ID, self.leaf_max_size);
        root.insert(key, rid);
        self.write_leaf_page(&page, &mut root);
        self.root_page_id.store(page_id, Ordering::Release);
        self.update_root_page_id();
        self.buffer_pool.unpin_page(page_id, true);
        debug!("started \"{}\" with root page {}", self.index_name, page_id);
        true
    }

    /// Allocates a page for a freshly split node, write-latches it, and
    /// records it in the caller's transaction so it is released with the
    /// rest of the descent.
    fn allocate_node(&self, transaction: &mut Transaction) -> Option<(PageId, Arc<Page>)> {
        let (page_id, page) = self.buffer_pool.new_page()?;
        page.w_latch();
        transaction.add_page(page.clone());
        Some((page_id, page))
    }

    /// Hooks `new_page` (the right half of a split) into the parent of
    /// `old_page`, growing a new root when the split reached the top and
    /// splitting the parent recursively when it overflows in turn.
    fn insert_into_parent(
        &self,
        old_page: &Arc<Page>,
        separator: K,
        new_page: &Arc<Page>,
        transaction: &mut Transaction,
    ) {
        let parent_page_id = read_parent_pointer(old_page);
        if parent_page_id == INVALID_PAGE_ID {
            let (root_page_id, root_page) = self
                .buffer_pool
                .new_page()
                .expect("could not allocate a new root page");
            let mut root: BPlusTreeInternalPage<K> =
                BPlusTreeInternalPage::new(root_page_id, INVALID_PAGE_ID, self.internal_max_size);
            root.populate_new_root(old_page.page_id(), separator, new_page.page_id());
            self.write_internal_page(&root_page, &mut root);
            write_parent_pointer(old_page, root_page_id);
            write_parent_pointer(new_page, root_page_id);
            self.root_page_id.store(root_page_id, Ordering::Release);
            self.update_root_page_id();
            self.buffer_pool.unpin_page(root_page_id, true);
            debug!(
                "grew \"{}\" with new root page {}",
                self.index_name, root_page_id
            );
            return;
        }

        let parent_page = self
            .buffer_pool
            .fetch_page(parent_page_id)
            .expect("parent page of a split node is unavailable");
        let mut parent = self.read_internal(&parent_page);
        parent.insert_node_after(old_page.page_id(), separator, new_page.page_id());

        if parent.size() <= parent.max_size() {
            self.write_internal_page(&parent_page, &mut parent);
        } else {
            let (new_parent_id, new_parent_page) = self
                .allocate_node(transaction)
                .expect("could not allocate a page for an internal split");
            let mut new_parent: BPlusTreeInternalPage<K> = BPlusTreeInternalPage::new(
                new_parent_id,
                parent.parent_page_id(),
                self.internal_max_size,
            );
            let push_up = parent.move_half_to(&mut new_parent);
            debug!(
                "split internal {} of \"{}\" into {}",
                parent_page_id, self.index_name, new_parent_id
            );
            self.write_internal_page(&parent_page, &mut parent);
            self.write_internal_page(&new_parent_page, &mut new_parent);
            for child_page_id in new_parent.values() {
                self.reparent_child(child_page_id, new_parent_id);
            }
            self.insert_into_parent(&parent_page, push_up, &new_parent_page, transaction);
        }
        self.buffer_pool.unpin_page(parent_page_id, true);
    }

    /// Rebalances an underflowing node with a sibling. Returns true when the
    /// node was drained into its sibling and should be deleted by the caller.
    fn coalesce_or_redistribute(&self, page: &Arc<Page>, transaction: &mut Transaction) -> bool {
        let node = self.read_node(page);
        if node.parent_page_id() == INVALID_PAGE_ID {
            return self.adjust_root(page);
        }
        if node.size() >= node.min_size() {
            return false;
        }

        let parent_page_id = node.parent_page_id();
        let parent_page = self
            .buffer_pool
            .fetch_page(parent_page_id)
            .expect("parent page of an underflowing node is unavailable");
        let mut parent = self.read_internal(&parent_page);
        let index = parent
            .value_index(node.page_id())
            .expect("underflowing node is missing from its parent");
        // The leftmost node borrows from its right neighbor, everyone else
        // from the left.
        let sibling_index = if index == 0 { 1 } else { index - 1 };
        let sibling_page_id = parent.value_at(sibling_index);
        let sibling_page = self
            .buffer_pool
            .fetch_page(sibling_page_id)
            .expect("sibling page of an underflowing node is unavailable");
        sibling_page.w_latch();
        transaction.add_page(sibling_page.clone());

        let mut deleted_node = false;
        let mut coalesced = false;
        match (self.read_node(page), self.read_node(&sibling_page)) {
            (BPlusTreePage::LeafPage(mut node_leaf), BPlusTreePage::LeafPage(mut sibling_leaf)) => {
                if sibling_leaf.size() + node_leaf.size() > node_leaf.max_size() {
                    if index == 0 {
                        let separator = sibling_leaf.move_first_to_end_of(&mut node_leaf);
                        parent.set_key_at(1, separator);
                    } else {
                        let separator = sibling_leaf.move_last_to_front_of(&mut node_leaf);
                        parent.set_key_at(index, separator);
                    }
                    self.write_leaf_page(&sibling_page, &mut sibling_leaf);
                    self.write_leaf_page(page, &mut node_leaf);
                } else if index == 0 {
                    // Leftmost: the right sibling drains into this node.
                    sibling_leaf.move_all_to(&mut node_leaf);
                    parent.remove(1);
                    transaction.add_deleted_page(sibling_page_id);
                    self.write_leaf_page(page, &mut node_leaf);
                    coalesced = true;
                } else {
                    node_leaf.move_all_to(&mut sibling_leaf);
                    parent.remove(index);
                    self.write_leaf_page(&sibling_page, &mut sibling_leaf);
                    coalesced = true;
                    deleted_node = true;
                }
            }
            (
                BPlusTreePage::InternalPage(mut node_int),
                BPlusTreePage::InternalPage(mut sibling_int),
            ) => {
                if sibling_int.size() + node_int.size() > node_int.max_size() {
                    if index == 0 {
                        let separator = parent.key_at(1);
                        let (new_separator, moved_child) =
                            sibling_int.move_first_to_end_of(&mut node_int, separator);
                        parent.set_key_at(1, new_separator);
                        self.reparent_child(moved_child, node_int.page_id());
                    } else {
                        let separator = parent.key_at(index);
                        let (new_separator, moved_child) =
                            sibling_int.move_last_to_front_of(&mut node_int, separator);
                        parent.set_key_at(index, new_separator);
                        self.reparent_child(moved_child, node_int.page_id());
                    }
                    self.write_internal_page(&sibling_page, &mut sibling_int);
                    self.write_internal_page(page, &mut node_int);
                } else if index == 0 {
                    let separator = parent.key_at(1);
                    let moved: Vec<PageId> = sibling_int.values().collect();
                    sibling_int.move_all_to(&mut node_int, separator);
                    parent.remove(1);
                    transaction.add_deleted_page(sibling_page_id);
                    self.write_internal_page(page, &mut node_int);
                    for child_page_id in moved {
                        self.reparent_child(child_page_id, node_int.page_id());
                    }
                    coalesced = true;
                } else {
                    let separator = parent.key_at(index);
                    let moved: Vec<PageId> = node_int.values().collect();
                    node_int.move_all_to(&mut sibling_int, separator);
                    parent.remove(index);
                    self.write_internal_page(&sibling_page, &mut sibling_int);
                    for child_page_id in moved {
                        self.reparent_child(child_page_id, sibling_page_id);
                    }
                    coalesced = true;
                    deleted_node = true;
                }
            }
            _ => unreachable!("node and sibling page kinds differ"),
        }

        self.write_internal_page(&parent_page, &mut parent);
        if coalesced && self.coalesce_or_redistribute(&parent_page, transaction) {
            transaction.add_deleted_page(parent_page_id);
        }
        self.buffer_pool.unpin_page(parent_page_id, true);
        deleted_node
    }

    /// Handles underflow at the root: an empty leaf root empties the whole
    /// tree, an internal root with one child hands the root role down.
    /// Returns true when the old root page should be deleted.
    fn adjust_root(&self, page: &Arc<Page>) -> bool {
        match self.read_node(page) {
            BPlusTreePage::LeafPage(leaf) => {
                if leaf.size() == 0 {
                    self.root_page_id.store(INVALID_PAGE_ID, Ordering::Release);
                    self.update_root_page_id();
                    debug!("index \"{}\" is empty again", self.index_name);
                    true
                } else {
                    false
                }
            }
            BPlusTreePage::InternalPage(mut internal) => {
                if internal.size() == 1 {
                    let child_page_id = internal.remove_and_return_only_child();
                    self.root_page_id.store(child_page_id, Ordering::Release);
                    self.update_root_page_id();
                    self.reparent_child(child_page_id, INVALID_PAGE_ID);
                    debug!(
                        "collapsed root of \"{}\" into page {}",
                        self.index_name, child_page_id
                    );
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Rewrites the parent pointer of a page that is not latched by this
    /// descent. Safe because every structural change above it is still
    /// covered by our write latches.
    fn reparent_child(&self, child_page_id: PageId, parent_page_id: PageId) {
        let child_page = self
            .buffer_pool
            .fetch_page(child_page_id)
            .expect("child page unavailable while re-parenting");
        write_parent_pointer(&child_page, parent_page_id);
        self.buffer_pool.unpin_page(child_page_id, true);
    }

    /// Persists the current root page id under this index's name in the
    /// header page. Called after every root change.
    fn update_root_page_id(&self) {
        let header_page = self
            .buffer_pool
            .fetch_page(HEADER_PAGE_ID)
            .expect("header page unavailable");
        header_page.w_latch();
        {
            let mut data = header_page.write_data();
            let mut header = HeaderPage::from_page_data(&data);
            let root_page_id = self.root_page_id.load(Ordering::Acquire);
            if self.header_record_exists.load(Ordering::Acquire) {
                header.update_record(&self.index_name, root_page_id);
            } else if header.insert_record(&self.index_name, root_page_id) {
                self.header_record_exists.store(true, Ordering::Release);
            }
            header.write_to_page(&mut data);
        }
        header_page.w_unlatch();
        self.buffer_pool.unpin_page(HEADER_PAGE_ID, true);
    }

    fn read_node(&self, page: &Arc<Page>) -> BPlusTreePage<K> {
        BPlusTreePage::from_page_data(&page.read_data()).expect("corrupt b+ tree page")
    }

    fn read_leaf(&self, page: &Arc<Page>) -> BPlusTreeLeafPage<K> {
        match self.read_node(page) {
            BPlusTreePage::LeafPage(leaf) => leaf,
            BPlusTreePage::InternalPage(_) => unreachable!("expected a leaf page"),
        }
    }

    fn read_internal(&self, page: &Arc<Page>) -> BPlusTreeInternalPage<K> {
        match self.read_node(page) {
            BPlusTreePage::InternalPage(internal) => internal,
            BPlusTreePage::LeafPage(_) => unreachable!("expected an internal page"),
        }
    }

    fn write_leaf_page(&self, page: &Arc<Page>, leaf: &mut BPlusTreeLeafPage<K>) {
        leaf.write_to_page(&mut page.write_data());
    }

    fn write_internal_page(&self, page: &Arc<Page>, internal: &mut BPlusTreeInternalPage<K>) {
        internal.write_to_page(&mut page.write_data());
    }
}

/// Forward scan over the leaves. Holds a read latch and a pin on exactly one
/// leaf at a time; the current leaf is released before the next one is
/// latched, so a scan never stalls writers behind it for long.
pub struct IndexIterator<'a, K: Ord + Copy + Debug + Encode + Decode<()>> {
    buffer_pool: &'a BufferPool,
    page: Option<Arc<Page>>,
    leaf: Option<BPlusTreeLeafPage<K>>,
    index: usize,
}

impl<K: Ord + Copy + Debug + Encode + Decode<()>> IndexIterator<'_, K> {
    pub fn is_end(&self) -> bool {
        match &self.leaf {
            Some(leaf) => {
                self.index >= leaf.size() as usize && leaf.next_page_id() == INVALID_PAGE_ID
            }
            None => true,
        }
    }

    fn release_current(&mut self) {
        if let Some(page) = self.page.take() {
            page.r_unlatch();
            self.buffer_pool.unpin_page(page.page_id(), false);
        }
        self.leaf = None;
    }
}

impl<K: Ord + Copy + Debug + Encode + Decode<()>> Iterator for IndexIterator<'_, K> {
    type Item = (K, Rid);

    fn next(&mut self) -> Option<(K, Rid)> {
        loop {
            let leaf = self.leaf.as_ref()?;
            if self.index < leaf.size() as usize {
                let item = leaf.item(self.index);
                self.index += 1;
                return Some(item);
            }
            let next_page_id = leaf.next_page_id();
            self.release_current();
            if next_page_id == INVALID_PAGE_ID {
                return None;
            }
            let page = self.buffer_pool.fetch_page(next_page_id)?;
            page.r_latch();
            let leaf = BPlusTreeLeafPage::from_page_data(&page.read_data())
                .expect("sibling link does not point at a leaf");
            self.page = Some(page);
            self.leaf = Some(leaf);
            self.index = 0;
        }
    }
}

impl<K: Ord + Copy + Debug + Encode + Decode<()>> Drop for IndexIterator<'_, K> {
    fn drop(&mut self) {
        self.release_current();
    }
}

#[cfg(test)]
mod b_plus_tree_tests {
    use std::sync::Mutex;
    use std::thread;

    use super::*;
    use crate::disk_management::disk_manager::{temp_db_file, DiskManager};

    fn test_tree(
        tag: &str,
        leaf_max_size: u32,
        internal_max_size: u32,
        pool_size: usize,
    ) -> (Arc<BufferPool>, BPlusTree<u64>) {
        let file_manager = Arc::new(Mutex::new(
            DiskManager::new(temp_db_file(tag)).expect("could not open test database"),
        ));
        let buffer_pool = Arc::new(BufferPool::new(pool_size, file_manager));
        let tree = BPlusTree::new(tag, buffer_pool.clone(), leaf_max_size, internal_max_size);
        (buffer_pool, tree)
    }

    fn rid_for(key: u64) -> Rid {
        Rid::new((key >> 32) as u32, key as u32)
    }

    /// Depths of every leaf reachable from `page_id`, for structural checks.
    fn leaf_depths(buffer_pool: &BufferPool, page_id: PageId, depth: u32, out: &mut Vec<u32>) {
        let page = buffer_pool.fetch_page(page_id).expect("page readable");
        let node = BPlusTreePage::<u64>::from_page_data(&page.read_data()).expect("page decodes");
        match node {
            BPlusTreePage::LeafPage(_) => out.push(depth),
            BPlusTreePage::InternalPage(internal) => {
                for child in internal.values() {
                    leaf_depths(buffer_pool, child, depth + 1, out);
                }
            }
        }
        buffer_pool.unpin_page(page_id, false);
    }

    #[test]
    fn unsorted_inserts_come_back_sorted() {
        let (_buffer_pool, tree) = test_tree("tree_sorted_iter", 3, 3, 32);
        for key in [1u64, 4, 2, 5, 3] {
            assert!(tree.insert(key, rid_for(key)));
        }
        let items: Vec<(u64, Rid)> = tree.iter().collect();
        assert_eq!(
            items,
            vec![
                (1, rid_for(1)),
                (2, rid_for(2)),
                (3, rid_for(3)),
                (4, rid_for(4)),
                (5, rid_for(5)),
            ]
        );
    }

    #[test]
    fn single_leaf_holds_sorted_keys() {
        let (buffer_pool, tree) = test_tree("tree_single_leaf", 3, 3, 32);
        for key in [3u64, 1, 2] {
            assert!(tree.insert(key, rid_for(key)));
        }
        let keys: Vec<u64> = tree.iter().map(|(key, _)| key).collect();
        assert_eq!(keys, vec![1, 2, 3]);

        // Three keys fit one leaf, so the root must still be a leaf.
        let root_page_id = tree.root_page_id.load(Ordering::Acquire);
        let root_page = buffer_pool.fetch_page(root_page_id).expect("root readable");
        let root =
            BPlusTreePage::<u64>::from_page_data(&root_page.read_data()).expect("root decodes");
        assert!(matches!(root, BPlusTreePage::LeafPage(_)));
        buffer_pool.unpin_page(root_page_id, false);
    }

    #[test]
    fn first_split_keeps_every_key_reachable() {
        let (buffer_pool, tree) = test_tree("tree_first_split", 3, 3, 32);
        for key in 1..=4u64 {
            assert!(tree.insert(key, rid_for(key)));
        }
        for key in 1..=4u64 {
            assert_eq!(tree.get_value(&key), Some(rid_for(key)));
        }

        // The fourth insert split the root leaf.
        let root_page_id = tree.root_page_id.load(Ordering::Acquire);
        let root_page = buffer_pool.fetch_page(root_page_id).expect("root readable");
        let root =
            BPlusTreePage::<u64>::from_page_data(&root_page.read_data()).expect("root decodes");
        assert!(matches!(root, BPlusTreePage::InternalPage(_)));
        buffer_pool.unpin_page(root_page_id, false);
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let (_buffer_pool, tree) = test_tree("tree_duplicate", 3, 3, 32);
        assert!(tree.insert(7, rid_for(7)));
        assert!(!tree.insert(7, Rid::new(9, 9)));
        assert_eq!(tree.get_value(&7), Some(rid_for(7)));
    }

    #[test]
    fn get_value_misses_absent_keys() {
        let (_buffer_pool, tree) = test_tree("tree_absent", 3, 3, 32);
        assert_eq!(tree.get_value(&1), None);
        assert!(tree.insert(2, rid_for(2)));
        assert_eq!(tree.get_value(&1), None);
        assert_eq!(tree.get_value(&3), None);
    }

    #[test]
    fn removing_one_key_keeps_the_rest() {
        let (buffer_pool, tree) = test_tree("tree_remove_middle", 3, 3, 32);
        for key in 1..=10u64 {
            assert!(tree.insert(key, rid_for(key)));
        }
        tree.remove(&5);

        let keys: Vec<u64> = tree.iter().map(|(key, _)| key).collect();
        assert_eq!(keys, vec![1, 2, 3, 4, 6, 7, 8, 9, 10]);
        assert_eq!(tree.get_value(&5), None);

        // Ten keys at fanout 3 need at least two levels, and deleting one key
        // must not flatten the tree.
        let root_page_id = tree.root_page_id.load(Ordering::Acquire);
        let root_page = buffer_pool.fetch_page(root_page_id).expect("root readable");
        let root =
            BPlusTreePage::<u64>::from_page_data(&root_page.read_data()).expect("root decodes");
        assert!(matches!(root, BPlusTreePage::InternalPage(_)));
        buffer_pool.unpin_page(root_page_id, false);

        let mut depths = Vec::new();
        leaf_depths(&buffer_pool, root_page_id, 0, &mut depths);
        assert!(depths.windows(2).all(|pair| pair[0] == pair[1]));
    }

    #[test]
    fn removing_everything_empties_the_tree() {
        let (_buffer_pool, tree) = test_tree("tree_remove_all", 3, 3, 32);
        for key in 1..=10u64 {
            assert!(tree.insert(key, rid_for(key)));
        }
        for key in 1..=10u64 {
            tree.remove(&key);
        }
        assert!(tree.is_empty());
        assert_eq!(tree.root_page_id.load(Ordering::Acquire), INVALID_PAGE_ID);
        assert_eq!(tree.iter().count(), 0);

        // The tree is usable again afterwards.
        assert!(tree.insert(42, rid_for(42)));
        assert_eq!(tree.get_value(&42), Some(rid_for(42)));
    }

    #[test]
    fn removing_in_reverse_order_works_too() {
        let (buffer_pool, tree) = test_tree("tree_remove_reverse", 3, 3, 32);
        for key in 1..=32u64 {
            assert!(tree.insert(key, rid_for(key)));
        }
        for key in (9..=32u64).rev() {
            tree.remove(&key);
        }
        let keys: Vec<u64> = tree.iter().map(|(key, _)| key).collect();
        assert_eq!(keys, vec![1, 2, 3, 4, 5, 6, 7, 8]);

        let root_page_id = tree.root_page_id.load(Ordering::Acquire);
        let mut depths = Vec::new();
        leaf_depths(&buffer_pool, root_page_id, 0, &mut depths);
        assert!(depths.windows(2).all(|pair| pair[0] == pair[1]));
    }

    #[test]
    fn range_scan_starts_at_the_lower_bound() {
        let (_buffer_pool, tree) = test_tree("tree_range_scan", 3, 3, 32);
        for key in (2..=20u64).step_by(2) {
            assert!(tree.insert(key, rid_for(key)));
        }
        let keys: Vec<u64> = tree.iter_from(&7).map(|(key, _)| key).collect();
        assert_eq!(keys, vec![8, 10, 12, 14, 16, 18, 20]);

        let keys: Vec<u64> = tree.iter_from(&8).map(|(key, _)| key).collect();
        assert_eq!(keys[0], 8);

        assert_eq!(tree.iter_from(&21).count(), 0);
    }

    #[test]
    fn root_survives_reopen() {
        let path = temp_db_file("tree_reopen");
        let keys: Vec<u64> = (1..=50).collect();
        {
            let file_manager = Arc::new(Mutex::new(
                DiskManager::new(path.clone()).expect("could not open test database"),
            ));
            let buffer_pool = Arc::new(BufferPool::new(16, file_manager));
            let tree: BPlusTree<u64> = BPlusTree::new("reopened_index", buffer_pool.clone(), 4, 4);
            for key in &keys {
                assert!(tree.insert(*key, rid_for(*key)));
            }
            buffer_pool.flush_all_pages();
        }

        let file_manager = Arc::new(Mutex::new(
            DiskManager::new(path).expect("could not reopen test database"),
        ));
        let buffer_pool = Arc::new(BufferPool::new(16, file_manager));
        let tree: BPlusTree<u64> = BPlusTree::new("reopened_index", buffer_pool, 4, 4);
        assert!(!tree.is_empty());
        for key in &keys {
            assert_eq!(tree.get_value(key), Some(rid_for(*key)));
        }
    }

    #[test]
    fn concurrent_disjoint_inserts() {
        let (_buffer_pool, tree) = test_tree("tree_concurrent", 16, 16, 64);
        let tree = Arc::new(tree);

        let mut handles = Vec::new();
        for t in 0..8u64 {
            let tree = tree.clone();
            handles.push(thread::spawn(move || {
                for i in 0..1000u64 {
                    let key = t * 1000 + i;
                    assert!(tree.insert(key, rid_for(key)));
                }
            }));
        }
        for handle in handles {
            handle.join().expect("insert thread panicked");
        }

        let keys: Vec<u64> = tree.iter().map(|(key, _)| key).collect();
        assert_eq!(keys.len(), 8000);
        assert!(keys.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(keys.first(), Some(&0));
        assert_eq!(keys.last(), Some(&7999));
        for key in (0..8000u64).step_by(997) {
            assert_eq!(tree.get_value(&key), Some(rid_for(key)));
        }
    }

    #[test]
    fn concurrent_removals_leave_the_complement() {
        let (_buffer_pool, tree) = test_tree("tree_concurrent_remove", 16, 16, 64);
        for key in 0..2000u64 {
            assert!(tree.insert(key, rid_for(key)));
        }
        let tree = Arc::new(tree);

        let mut handles = Vec::new();
        for t in 0..4u64 {
            let tree = tree.clone();
            handles.push(thread::spawn(move || {
                for i in 0..250u64 {
                    let key = (t * 250 + i) * 2;
                    tree.remove(&key);
                }
            }));
        }
        for handle in handles {
            handle.join().expect("remove thread panicked");
        }

        // Every even key is gone, every odd key still there.
        let keys: Vec<u64> = tree.iter().map(|(key, _)| key).collect();
        assert!(keys.iter().all(|key| key % 2 == 1));
        assert_eq!(keys.len(), 1000);
    }
}
