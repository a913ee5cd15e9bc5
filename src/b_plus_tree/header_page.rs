use crate::disk_management::buffer_pool::{PageId, PAGE_SIZE};

/// The header page lives at a well-known page id and maps index names to
/// their root page ids, so an index can find its root again after the
/// database file is reopened.
pub const HEADER_PAGE_ID: PageId = 0;

// PAGE FORMAT:
//
// ----------------------------------------------------------------------------------
// | RECORD_COUNT [u32] | NAME (0) [32 bytes] + ROOT_PID (0) [u32] | ... | NAME (n) |
// ----------------------------------------------------------------------------------
//
// Names shorter than 32 bytes are zero padded; the record count caps how many
// indexes one database file can host.

const RECORD_NAME_SIZE: usize = 32;
const RECORD_SIZE: usize = RECORD_NAME_SIZE + 4;
const MAX_RECORDS: usize = (PAGE_SIZE - 4) / RECORD_SIZE;

pub struct HeaderPage {
    records: Vec<(String, PageId)>,
}

impl HeaderPage {
    pub fn from_page_data(data: &[u8; PAGE_SIZE]) -> HeaderPage {
        let count = u32::from_le_bytes(data[0..4].try_into().unwrap()) as usize;
        let count = count.min(MAX_RECORDS);
        let mut records = Vec::with_capacity(count);
        for i in 0..count {
            let offset = 4 + i * RECORD_SIZE;
            let name_bytes = &data[offset..offset + RECORD_NAME_SIZE];
            let name_len = name_bytes
                .iter()
                .position(|byte| *byte == 0)
                .unwrap_or(RECORD_NAME_SIZE);
            let name = String::from_utf8_lossy(&name_bytes[..name_len]).into_owned();
            let root_page_id = u32::from_le_bytes(
                data[offset + RECORD_NAME_SIZE..offset + RECORD_SIZE]
                    .try_into()
                    .unwrap(),
            );
            records.push((name, root_page_id));
        }
        HeaderPage { records }
    }

    pub fn write_to_page(&self, data: &mut [u8; PAGE_SIZE]) {
        data.fill(0);
        data[0..4].copy_from_slice(&(self.records.len() as u32).to_le_bytes());
        for (i, (name, root_page_id)) in self.records.iter().enumerate() {
            let offset = 4 + i * RECORD_SIZE;
            let name_bytes = name.as_bytes();
            data[offset..offset + name_bytes.len()].copy_from_slice(name_bytes);
            data[offset + RECORD_NAME_SIZE..offset + RECORD_SIZE]
                .copy_from_slice(&root_page_id.to_le_bytes());
        }
    }

    /// Adds a record for a new index. Fails when the name is taken, too long
    /// for a record slot, or the page is full.
    pub fn insert_record(&mut self, name: &str, root_page_id: PageId) -> bool {
        if name.len() >= RECORD_NAME_SIZE
            || self.records.len() >= MAX_RECORDS
            || self.get_root_id(name).is_some()
        {
            return false;
        }
        self.records.push((name.to_string(), root_page_id));
        true
    }

    /// Updates the root id of an existing record; fails when absent.
    pub fn update_record(&mut self, name: &str, root_page_id: PageId) -> bool {
        match self.records.iter_mut().find(|(n, _)| n == name) {
            Some(record) => {
                record.1 = root_page_id;
                true
            }
            None => false,
        }
    }

    pub fn delete_record(&mut self, name: &str) -> bool {
        let before = self.records.len();
        self.records.retain(|(n, _)| n != name);
        self.records.len() != before
    }

    pub fn get_root_id(&self, name: &str) -> Option<PageId> {
        self.records
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, root_page_id)| *root_page_id)
    }

    pub fn num_records(&self) -> usize {
        self.records.len()
    }
}
