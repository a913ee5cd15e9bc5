use std::fs::OpenOptions;
use std::io::{self, Read, Seek, SeekFrom, Write};

use super::buffer_pool::{PageId, PAGE_SIZE};

/// Block-addressable persistent storage. Pages live at fixed offsets of a
/// single database file; page ids are assigned in file order.
pub struct DiskManager {
    db_file_path: String,
    file: std::fs::File,
}

impl DiskManager {
    pub fn new(db_file_path: String) -> io::Result<DiskManager> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&db_file_path)?;
        Ok(DiskManager { db_file_path, file })
    }

    pub fn write_page(&mut self, page_id: PageId, data: &[u8; PAGE_SIZE]) -> io::Result<()> {
        self.file
            .seek(SeekFrom::Start(page_id as u64 * PAGE_SIZE as u64))?;
        self.file.write_all(data)?;
        self.file.flush()
    }

    /// Reads a page into `buffer`. Reading past the current end of the file
    /// leaves the missing tail zeroed, which matches the contents of a page
    /// that was allocated but never written back.
    pub fn read_page(&mut self, page_id: PageId, buffer: &mut [u8; PAGE_SIZE]) -> io::Result<()> {
        buffer.fill(0);
        self.file
            .seek(SeekFrom::Start(page_id as u64 * PAGE_SIZE as u64))?;
        let mut filled = 0;
        while filled < PAGE_SIZE {
            let read = self.file.read(&mut buffer[filled..])?;
            if read == 0 {
                break;
            }
            filled += read;
        }
        Ok(())
    }

    /// Extends the database file by one zeroed page and returns its id.
    pub fn allocate_page(&mut self) -> io::Result<PageId> {
        let page_id = (self.file.metadata()?.len() / PAGE_SIZE as u64) as PageId;
        self.write_page(page_id, &[0; PAGE_SIZE])?;
        Ok(page_id)
    }

    /// File space is not reclaimed; a freed id simply becomes garbage until
    /// the file is compacted offline.
    pub fn deallocate_page(&mut self, page_id: PageId) {
        log::trace!("deallocated page {} of {}", page_id, self.db_file_path);
    }

    pub fn num_pages(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len() / PAGE_SIZE as u64)
    }
}

/// Unique throwaway database file under the system temp directory.
#[cfg(test)]
pub(crate) fn temp_db_file(tag: &str) -> String {
    let mut path = std::env::temp_dir();
    path.push(format!("pagedb_{}_{}.db", tag, rand::random::<u32>()));
    path.to_string_lossy().into_owned()
}
