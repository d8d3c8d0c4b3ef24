mod frame;
mod replacer;

use crate::dbglog;
use crate::disk_manager::{FileHandle, FileId};
use crate::errors::Error;
use crate::pages::PageNo;
use anyhow::{bail, Result};
use parking_lot::FairMutex;
use replacer::ClockReplacer;
use std::collections::HashMap;
use std::sync::Arc;

pub use frame::{Frame, FrameId};

pub type ArcBufferPool = Arc<FairMutex<BufferPoolManager>>;

/// Fixed-size cache of disk pages shared by every paged file a caller opens.
///
/// Each successful `read_page`/`alloc_page` hands back a pinned frame and
/// must be balanced by exactly one `unpin_page`; a pinned frame is never
/// replaced. Replacement is second-chance, driven by [`ClockReplacer`].
#[derive(Debug)]
pub struct BufferPoolManager {
    frames: Vec<Frame>,
    page_table: HashMap<(FileId, PageNo), FrameId>,
    replacer: ClockReplacer,
}

impl BufferPoolManager {
    pub fn new(pool_size: usize) -> Self {
        let frames = (0..pool_size).map(Frame::new).collect();

        Self {
            frames,
            // sized ~1.2x the frame count, one entry per resident page
            page_table: HashMap::with_capacity(pool_size + pool_size / 5),
            replacer: ClockReplacer::new(pool_size),
        }
    }

    pub fn shared(pool_size: usize) -> ArcBufferPool {
        Arc::new(FairMutex::new(Self::new(pool_size)))
    }

    pub fn pool_size(&self) -> usize {
        self.frames.len()
    }

    fn lookup_frame(&self, file: &FileHandle, page_no: PageNo) -> Result<FrameId> {
        match self.page_table.get(&(file.id(), page_no)) {
            Some(&frame_id) => Ok(frame_id),
            None => bail!(Error::HashNotFound),
        }
    }

    /// Free up a frame with the clock. A valid victim is written back when
    /// dirty and dropped from the lookup table before being handed out.
    fn alloc_frame(&mut self) -> Result<FrameId> {
        let frames = &mut self.frames;
        let page_table = &mut self.page_table;

        let frame_id = self.replacer.pick(frames)?;
        let frame = &mut frames[frame_id];
        if frame.valid() {
            if let Some(file) = frame.file() {
                dbglog!(
                    "evicting page {} (frame {}), dirty: {}",
                    frame.page_no(),
                    frame_id,
                    frame.page().is_dirty()
                );
                if frame.page().is_dirty() {
                    file.write_page(frame.page())?;
                }
                page_table.remove(&(file.id(), frame.page_no()));
            }
            frame.clear();
        }

        Ok(frame_id)
    }

    /// Pin the page, reading it from disk if it is not resident.
    pub fn read_page(&mut self, file: &FileHandle, page_no: PageNo) -> Result<&mut Frame> {
        if let Ok(frame_id) = self.lookup_frame(file, page_no) {
            let frame = &mut self.frames[frame_id];
            frame.set_refbit(true);
            frame.pin();
            return Ok(frame);
        }

        let frame_id = self.alloc_frame()?;
        let page = file.read_page(page_no)?;
        self.frames[frame_id].install(file.clone(), page);
        self.page_table.insert((file.id(), page_no), frame_id);

        Ok(&mut self.frames[frame_id])
    }

    /// Grow the file by one page and pin it. The frame is claimed first so a
    /// saturated pool fails before the file is touched.
    pub fn alloc_page(&mut self, file: &FileHandle) -> Result<&mut Frame> {
        let frame_id = self.alloc_frame()?;

        let page = file.allocate_page()?;
        let page_no = page.page_no();
        dbglog!("allocated page {} into frame {}", page_no, frame_id);

        self.frames[frame_id].install(file.clone(), page);
        self.page_table.insert((file.id(), page_no), frame_id);

        Ok(&mut self.frames[frame_id])
    }

    /// Drop one pin, folding `dirty` into the frame. Unpinning a page that is
    /// not resident is a silent no-op so teardown paths stay idempotent.
    pub fn unpin_page(&mut self, file: &FileHandle, page_no: PageNo, dirty: bool) -> Result<()> {
        let frame_id = match self.lookup_frame(file, page_no) {
            Ok(frame_id) => frame_id,
            Err(_) => return Ok(()),
        };

        let frame = &mut self.frames[frame_id];
        if frame.pin_count() == 0 {
            bail!(Error::PageNotPinned(page_no));
        }
        if dirty {
            frame.page_mut().mark_dirty();
        }
        frame.unpin();

        Ok(())
    }

    /// Write back and release every frame of the file. Refuses when any of
    /// them is still pinned, and reports descriptors that claim the file
    /// without being valid.
    pub fn flush_file(&mut self, file: &FileHandle) -> Result<()> {
        let frames = &mut self.frames;
        let page_table = &mut self.page_table;

        for (frame_id, frame) in frames.iter_mut().enumerate() {
            if !frame.claims(file.id()) {
                continue;
            }
            if frame.pin_count() > 0 {
                bail!(Error::PagePinned(frame.page_no()));
            }
            if !frame.valid() {
                bail!(Error::BadBuffer(frame_id));
            }
            if frame.page().is_dirty() {
                file.write_page(frame.page())?;
                frame.page_mut().mark_clean();
            }
            page_table.remove(&(file.id(), frame.page_no()));
            frame.clear();
        }

        Ok(())
    }

    /// Release the frame (if resident) and delete the page on disk.
    pub fn dispose_page(&mut self, file: &FileHandle, page_no: PageNo) -> Result<()> {
        if let Ok(frame_id) = self.lookup_frame(file, page_no) {
            self.frames[frame_id].clear();
            self.page_table.remove(&(file.id(), page_no));
        }
        file.delete_page(page_no)
    }

    #[cfg(test)]
    pub fn pin_count(&self, file: &FileHandle, page_no: PageNo) -> Option<u32> {
        let frame_id = *self.page_table.get(&(file.id(), page_no))?;
        Some(self.frames[frame_id].pin_count())
    }

    #[cfg(test)]
    pub fn total_pins(&self) -> u32 {
        self.frames.iter().map(Frame::pin_count).sum()
    }

    #[cfg(test)]
    pub fn is_resident(&self, file: &FileHandle, page_no: PageNo) -> bool {
        self.page_table.contains_key(&(file.id(), page_no))
    }

    #[cfg(test)]
    pub fn corrupt_frame(&mut self, file: &FileHandle, page_no: PageNo) {
        let frame_id = self.page_table[&(file.id(), page_no)];
        self.frames[frame_id].force_invalid();
    }
}

impl Drop for BufferPoolManager {
    fn drop(&mut self) {
        for frame in &mut self.frames {
            if frame.pin_count() != 0 {
                dbglog!(
                    "frame {} dropped with pin count {}",
                    frame.id(),
                    frame.pin_count()
                );
            }
            if !frame.valid() || !frame.page().is_dirty() {
                continue;
            }
            if let Some(file) = frame.file() {
                let _ = file.write_page(frame.page());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk_manager::{test_file_path, PagedFile};
    use crate::pages::PAGE_SIZE;
    use std::fs::remove_file;
    use std::path::PathBuf;

    struct TestFile {
        path: PathBuf,
        handle: FileHandle,
    }

    impl TestFile {
        /// Fresh paged file pre-populated with `pages` numbered pages.
        fn with_pages(pages: u32) -> Result<Self> {
            let path = test_file_path();
            let handle = PagedFile::open(&path, true)?;
            for _ in 0..pages {
                handle.allocate_page()?;
            }
            Ok(Self { path, handle })
        }
    }

    impl Drop for TestFile {
        fn drop(&mut self) {
            let _ = remove_file(&self.path);
        }
    }

    #[test]
    fn test_read_hit_increments_pin() -> Result<()> {
        let file = TestFile::with_pages(1)?;
        let mut bpm = BufferPoolManager::new(3);

        bpm.read_page(&file.handle, 1)?;
        bpm.read_page(&file.handle, 1)?;
        assert_eq!(bpm.pin_count(&file.handle, 1), Some(2));

        bpm.unpin_page(&file.handle, 1, false)?;
        bpm.unpin_page(&file.handle, 1, false)?;
        assert_eq!(bpm.pin_count(&file.handle, 1), Some(0));
        assert_eq!(bpm.total_pins(), 0);
        Ok(())
    }

    #[test]
    fn test_unpin_below_zero_is_refused() -> Result<()> {
        let file = TestFile::with_pages(1)?;
        let mut bpm = BufferPoolManager::new(2);

        bpm.read_page(&file.handle, 1)?;
        bpm.unpin_page(&file.handle, 1, false)?;

        let err = bpm.unpin_page(&file.handle, 1, false).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::PageNotPinned(1))
        ));

        // a page that is not resident at all unpins silently
        bpm.unpin_page(&file.handle, 999, false)?;
        Ok(())
    }

    #[test]
    fn test_second_chance_evicts_oldest_unreferenced() -> Result<()> {
        let file = TestFile::with_pages(4)?;
        let mut bpm = BufferPoolManager::new(3);

        for page_no in 1..=3 {
            bpm.read_page(&file.handle, page_no)?;
            bpm.unpin_page(&file.handle, page_no, false)?;
        }

        // one full refbit-clearing revolution, then page 1's frame is taken
        bpm.read_page(&file.handle, 4)?;
        assert!(!bpm.is_resident(&file.handle, 1));
        assert!(bpm.is_resident(&file.handle, 2));
        assert!(bpm.is_resident(&file.handle, 3));

        // page 1 comes back only through a fresh disk read
        bpm.unpin_page(&file.handle, 4, false)?;
        bpm.read_page(&file.handle, 1)?;
        assert!(bpm.is_resident(&file.handle, 1));
        bpm.unpin_page(&file.handle, 1, false)?;
        Ok(())
    }

    #[test]
    fn test_all_pinned_exceeds_pool() -> Result<()> {
        let file = TestFile::with_pages(3)?;
        let mut bpm = BufferPoolManager::new(2);

        bpm.read_page(&file.handle, 1)?;
        bpm.read_page(&file.handle, 2)?;

        let err = bpm.read_page(&file.handle, 3).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::BufferExceeded)
        ));

        // releasing one pin makes the pool usable again
        bpm.unpin_page(&file.handle, 1, false)?;
        assert!(bpm.read_page(&file.handle, 3).is_ok());
        bpm.unpin_page(&file.handle, 3, false)?;
        bpm.unpin_page(&file.handle, 2, false)?;
        Ok(())
    }

    #[test]
    fn test_clock_progress_with_one_free_frame() -> Result<()> {
        let file = TestFile::with_pages(12)?;
        let mut bpm = BufferPoolManager::new(3);

        bpm.read_page(&file.handle, 1)?;
        bpm.read_page(&file.handle, 2)?;

        // two frames stay pinned; every further read must cycle through the
        // single remaining frame without ever failing
        for page_no in 3..=12 {
            bpm.read_page(&file.handle, page_no)?;
            bpm.unpin_page(&file.handle, page_no, false)?;
        }

        bpm.unpin_page(&file.handle, 1, false)?;
        bpm.unpin_page(&file.handle, 2, false)?;
        Ok(())
    }

    #[test]
    fn test_flush_refuses_pinned_file() -> Result<()> {
        let file = TestFile::with_pages(1)?;
        let mut bpm = BufferPoolManager::new(2);

        bpm.read_page(&file.handle, 1)?;
        let err = bpm.flush_file(&file.handle).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::PagePinned(1))
        ));

        bpm.unpin_page(&file.handle, 1, false)?;
        bpm.flush_file(&file.handle)?;
        assert!(!bpm.is_resident(&file.handle, 1));
        Ok(())
    }

    #[test]
    fn test_flush_reports_corrupted_descriptor() -> Result<()> {
        let file = TestFile::with_pages(1)?;
        let mut bpm = BufferPoolManager::new(2);

        bpm.read_page(&file.handle, 1)?;
        bpm.unpin_page(&file.handle, 1, false)?;
        bpm.corrupt_frame(&file.handle, 1);

        let err = bpm.flush_file(&file.handle).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::BadBuffer(_))
        ));
        Ok(())
    }

    #[test]
    fn test_flush_persists_dirty_writes() -> Result<()> {
        let file = TestFile::with_pages(1)?;
        let mut bpm = BufferPoolManager::new(2);

        bpm.read_page(&file.handle, 1)?
            .page_mut()
            .write_bytes(0, 5, b"nidus");
        bpm.unpin_page(&file.handle, 1, true)?;
        bpm.flush_file(&file.handle)?;

        // the pool no longer holds the page; this is a fresh disk read
        let frame = bpm.read_page(&file.handle, 1)?;
        assert_eq!(frame.page().read_bytes(0, 5), b"nidus");
        bpm.unpin_page(&file.handle, 1, false)?;
        Ok(())
    }

    #[test]
    fn test_eviction_writes_back_dirty_page() -> Result<()> {
        let file = TestFile::with_pages(3)?;
        let mut bpm = BufferPoolManager::new(2);

        bpm.read_page(&file.handle, 1)?
            .page_mut()
            .write_bytes(0, 4, &[9, 9, 9, 9]);
        bpm.unpin_page(&file.handle, 1, true)?;

        // force page 1 out of the pool
        for page_no in 2..=3 {
            bpm.read_page(&file.handle, page_no)?;
            bpm.unpin_page(&file.handle, page_no, false)?;
        }
        bpm.read_page(&file.handle, 2)?;
        bpm.unpin_page(&file.handle, 2, false)?;
        assert!(!bpm.is_resident(&file.handle, 1));

        assert_eq!(file.handle.read_page(1)?.read_bytes(0, 4), &[9, 9, 9, 9]);
        Ok(())
    }

    #[test]
    fn test_alloc_page_pins_new_page() -> Result<()> {
        let file = TestFile::with_pages(0)?;
        let mut bpm = BufferPoolManager::new(2);

        let page_no = bpm.alloc_page(&file.handle)?.page_no();
        assert_eq!(page_no, 1);
        assert_eq!(bpm.pin_count(&file.handle, page_no), Some(1));

        bpm.unpin_page(&file.handle, page_no, false)?;
        assert_eq!(bpm.alloc_page(&file.handle)?.page_no(), 2);
        bpm.unpin_page(&file.handle, 2, false)?;
        Ok(())
    }

    #[test]
    fn test_dispose_page_clears_residency() -> Result<()> {
        let file = TestFile::with_pages(0)?;
        let mut bpm = BufferPoolManager::new(2);

        let page_no = {
            let frame = bpm.alloc_page(&file.handle)?;
            frame.page_mut().write_bytes(0, 2, &[7, 7]);
            frame.page_no()
        };
        bpm.unpin_page(&file.handle, page_no, true)?;
        bpm.dispose_page(&file.handle, page_no)?;

        assert!(!bpm.is_resident(&file.handle, page_no));
        assert_eq!(
            file.handle.read_page(page_no)?.read_bytes(0, PAGE_SIZE),
            &[0u8; PAGE_SIZE]
        );
        Ok(())
    }

    #[test]
    fn test_pool_serves_multiple_files() -> Result<()> {
        let first = TestFile::with_pages(1)?;
        let second = TestFile::with_pages(1)?;
        let mut bpm = BufferPoolManager::new(4);

        bpm.read_page(&first.handle, 1)?
            .page_mut()
            .write_bytes(0, 1, &[1]);
        bpm.read_page(&second.handle, 1)?
            .page_mut()
            .write_bytes(0, 1, &[2]);

        // same page number, distinct frames
        assert_eq!(bpm.read_page(&first.handle, 1)?.page().read_bytes(0, 1), &[1]);
        assert_eq!(bpm.read_page(&second.handle, 1)?.page().read_bytes(0, 1), &[2]);

        for _ in 0..2 {
            bpm.unpin_page(&first.handle, 1, true)?;
            bpm.unpin_page(&second.handle, 1, true)?;
        }
        bpm.flush_file(&first.handle)?;
        bpm.flush_file(&second.handle)?;
        Ok(())
    }

    #[test]
    fn test_drop_flushes_dirty_frames() -> Result<()> {
        let file = TestFile::with_pages(1)?;
        {
            let mut bpm = BufferPoolManager::new(2);
            bpm.read_page(&file.handle, 1)?
                .page_mut()
                .write_bytes(0, 3, b"end");
            bpm.unpin_page(&file.handle, 1, true)?;
        }

        assert_eq!(file.handle.read_page(1)?.read_bytes(0, 3), b"end");
        Ok(())
    }
}
