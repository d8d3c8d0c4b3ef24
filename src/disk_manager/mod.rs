use crate::pages::traits::Serialize;
use crate::pages::{Page, PageNo, INVALID_PAGE_NO, PAGE_SIZE};
use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Process-unique identity of an open paged file; part of the buffer pool's
/// lookup key so one pool can serve many files.
pub type FileId = u32;

pub type FileHandle = Arc<PagedFile>;

static NEXT_FILE_ID: AtomicU32 = AtomicU32::new(1);

/// A file of fixed-size pages addressed by 1-based page number. Page 0 is
/// never allocated; it stays free as the "none" sentinel.
#[derive(Debug)]
pub struct PagedFile {
    id: FileId,
    path: PathBuf,
    file: Mutex<File>,
}

impl PagedFile {
    pub fn open(path: impl AsRef<Path>, create: bool) -> Result<FileHandle> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(&path)
            .with_context(|| format!("opening paged file {}", path.display()))?;

        Ok(Arc::new(Self {
            id: NEXT_FILE_ID.fetch_add(1, Ordering::Relaxed),
            path,
            file: Mutex::new(file),
        }))
    }

    pub fn exists(path: impl AsRef<Path>) -> bool {
        path.as_ref().is_file()
    }

    pub fn id(&self) -> FileId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn first_page_no(&self) -> PageNo {
        1
    }

    pub fn page_count(&self) -> Result<u32> {
        let len = self.file.lock().metadata()?.len();
        Ok((len / PAGE_SIZE as u64) as u32)
    }

    /// Extend the file by one zeroed page and return it with its number set.
    pub fn allocate_page(&self) -> Result<Page> {
        let mut file = self.file.lock();
        let end = file.seek(SeekFrom::End(0))?;

        let mut page = Page::new();
        page.set_page_no((end / PAGE_SIZE as u64) as PageNo + 1);
        file.write_all(page.as_bytes())
            .with_context(|| format!("extending {}", self.path.display()))?;

        Ok(page)
    }

    pub fn read_page(&self, page_no: PageNo) -> Result<Page> {
        if page_no == INVALID_PAGE_NO {
            return Err(anyhow!("asked to read page 0 of {}", self.path.display()));
        }

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(Self::offset(page_no)))?;

        let mut buf = [0u8; PAGE_SIZE];
        file.read_exact(&mut buf)
            .with_context(|| format!("reading page {page_no} of {}", self.path.display()))?;

        let mut page = Page::from_bytes(&buf);
        page.set_page_no(page_no);
        Ok(page)
    }

    pub fn write_page(&self, page: &Page) -> Result<()> {
        if page.page_no() == INVALID_PAGE_NO {
            return Err(anyhow!("asked to write a page with no page number"));
        }

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(Self::offset(page.page_no())))?;
        file.write_all(page.as_bytes())
            .with_context(|| format!("writing page {} of {}", page.page_no(), self.path.display()))
    }

    /// Zero the page on disk. Page numbers are never reused, so there is no
    /// free list to maintain.
    pub fn delete_page(&self, page_no: PageNo) -> Result<()> {
        let mut page = Page::new();
        page.set_page_no(page_no);
        self.write_page(&page)
    }

    fn offset(page_no: PageNo) -> u64 {
        (page_no as u64 - 1) * PAGE_SIZE as u64
    }
}

#[cfg(test)]
pub fn test_file_path() -> PathBuf {
    use uuid::Uuid;

    std::env::temp_dir().join(format!("burrowdb_test_{}", Uuid::new_v4()))
}
