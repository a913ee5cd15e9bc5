use std::collections::VecDeque;
use std::sync::Arc;

use crate::disk_management::buffer_pool::{Page, PageId};

/// Bookkeeping for a single index operation: the pages latched along the
/// descent and the pages scheduled for deletion once the structural change
/// commits. Threaded through the call chain as an explicit value.
pub struct Transaction {
    page_set: VecDeque<Arc<Page>>,
    deleted_page_set: Vec<PageId>,
    root_locked: bool,
}

impl Transaction {
    pub fn new() -> Transaction {
        Transaction {
            page_set: VecDeque::new(),
            deleted_page_set: Vec::new(),
            root_locked: false,
        }
    }

    pub fn add_page(&mut self, page: Arc<Page>) {
        self.page_set.push_back(page);
    }

    /// Drains the latched page set; the caller becomes responsible for
    /// releasing every latch and pin.
    pub fn take_pages(&mut self) -> VecDeque<Arc<Page>> {
        std::mem::take(&mut self.page_set)
    }

    pub fn add_deleted_page(&mut self, page_id: PageId) {
        if !self.deleted_page_set.contains(&page_id) {
            self.deleted_page_set.push(page_id);
        }
    }

    pub fn take_deleted_pages(&mut self) -> Vec<PageId> {
        std::mem::take(&mut self.deleted_page_set)
    }

    pub fn root_locked(&self) -> bool {
        self.root_locked
    }

    pub fn set_root_locked(&mut self, root_locked: bool) {
        self.root_locked = root_locked;
    }
}

impl Default for Transaction {
    fn default() -> Transaction {
        Transaction::new()
    }
}
