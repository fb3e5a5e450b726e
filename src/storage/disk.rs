// Page-granular I/O against the single data file.
//
// All reads and writes are 4 KiB aligned. Reads past the current extent
// yield a zero page, which is how never-written pages come into existence.

use crate::common::{PageId, PAGE_SIZE};
use crate::error::{DbError, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

/// Disk manager for one paged data file.
pub struct DiskManager {
    file: Mutex<File>,
    path: PathBuf,
    next_page_id: AtomicU32,
}

impl DiskManager {
    /// Opens (or creates) the data file and derives the allocation cursor
    /// from its length.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let len = file.metadata()?.len();
        let pages = (len as usize + PAGE_SIZE - 1) / PAGE_SIZE;
        // Page 0 is always the catalog header.
        let next = pages.max(1) as u32;
        Ok(Self {
            file: Mutex::new(file),
            path,
            next_page_id: AtomicU32::new(next),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Allocates the next page id. The id is monotonic; the extent grows
    /// lazily on first write.
    pub fn allocate_page(&self) -> PageId {
        self.next_page_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Guarantees the allocation cursor is past `page_id`. Used by redo,
    /// which replays NEW_PAGE records from the log.
    pub fn ensure_allocated(&self, page_id: PageId) {
        self.next_page_id.fetch_max(page_id + 1, Ordering::SeqCst);
    }

    /// Number of pages the allocator has handed out.
    pub fn allocated_pages(&self) -> u32 {
        self.next_page_id.load(Ordering::SeqCst)
    }

    /// Reads one page into `buf`. Short reads beyond the extent zero-fill.
    pub fn read_page(&self, page_id: PageId, buf: &mut [u8; PAGE_SIZE]) -> Result<()> {
        let mut file = self.file.lock();
        let offset = page_id as u64 * PAGE_SIZE as u64;
        file.seek(SeekFrom::Start(offset))?;
        let mut read = 0;
        while read < PAGE_SIZE {
            match file.read(&mut buf[read..]) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(DbError::Io(e)),
            }
        }
        buf[read..].fill(0);
        Ok(())
    }

    /// Writes one page at its aligned offset and syncs file data.
    pub fn write_page(&self, page_id: PageId, buf: &[u8; PAGE_SIZE]) -> Result<()> {
        let mut file = self.file.lock();
        let offset = page_id as u64 * PAGE_SIZE as u64;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_then_read() {
        let dir = tempdir().unwrap();
        let dm = DiskManager::open(dir.path().join("data.db")).unwrap();
        let pid = dm.allocate_page();
        let mut page = [0u8; PAGE_SIZE];
        page[0] = 0xAB;
        page[PAGE_SIZE - 1] = 0xCD;
        dm.write_page(pid, &page).unwrap();

        let mut back = [0u8; PAGE_SIZE];
        dm.read_page(pid, &mut back).unwrap();
        assert_eq!(back[0], 0xAB);
        assert_eq!(back[PAGE_SIZE - 1], 0xCD);
    }

    #[test]
    fn test_unwritten_page_reads_as_zero() {
        let dir = tempdir().unwrap();
        let dm = DiskManager::open(dir.path().join("data.db")).unwrap();
        let mut buf = [0xFFu8; PAGE_SIZE];
        dm.read_page(42, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_allocation_is_monotonic_and_resumes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.db");
        {
            let dm = DiskManager::open(&path).unwrap();
            let a = dm.allocate_page();
            let b = dm.allocate_page();
            assert!(b > a);
            let page = [7u8; PAGE_SIZE];
            dm.write_page(b, &page).unwrap();
        }
        let dm = DiskManager::open(&path).unwrap();
        let c = dm.allocate_page();
        assert!(c >= 3);
    }
}
