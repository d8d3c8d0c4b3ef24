use crate::disk_manager::{FileHandle, FileId};
use crate::pages::{Page, PageNo};

pub type FrameId = usize;

/// One buffer slot: the page buffer together with its descriptor bits.
///
/// An invalid frame holds no file, no pin, no refbit and a clean page; a
/// valid frame is owned by exactly one (file, page) pair and is protected
/// from replacement while `pin_count > 0`.
#[derive(Debug)]
pub struct Frame {
    id: FrameId,
    file: Option<FileHandle>,
    pin_count: u32,
    refbit: bool,
    valid: bool,
    page: Page,
}

impl Frame {
    pub(super) fn new(id: FrameId) -> Self {
        Self {
            id,
            file: None,
            pin_count: 0,
            refbit: false,
            valid: false,
            page: Page::new(),
        }
    }

    pub fn id(&self) -> FrameId {
        self.id
    }

    pub fn file(&self) -> Option<&FileHandle> {
        self.file.as_ref()
    }

    pub fn file_id(&self) -> Option<FileId> {
        self.file.as_ref().map(|f| f.id())
    }

    pub fn claims(&self, file_id: FileId) -> bool {
        self.file_id() == Some(file_id)
    }

    pub fn page_no(&self) -> PageNo {
        self.page.page_no()
    }

    pub fn pin_count(&self) -> u32 {
        self.pin_count
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    pub fn refbit(&self) -> bool {
        self.refbit
    }

    pub(super) fn set_refbit(&mut self, refbit: bool) {
        self.refbit = refbit;
    }

    pub(super) fn pin(&mut self) {
        self.pin_count += 1;
    }

    pub(super) fn unpin(&mut self) {
        self.pin_count -= 1;
    }

    pub fn page(&self) -> &Page {
        &self.page
    }

    pub fn page_mut(&mut self) -> &mut Page {
        &mut self.page
    }

    /// Take ownership of a freshly read or allocated page. Leaves the frame
    /// valid, referenced and pinned once.
    pub(super) fn install(&mut self, file: FileHandle, page: Page) {
        self.file = Some(file);
        self.pin_count = 1;
        self.refbit = true;
        self.valid = true;
        self.page = page;
    }

    /// Return the frame to the invalid state.
    pub(super) fn clear(&mut self) {
        self.file = None;
        self.pin_count = 0;
        self.refbit = false;
        self.valid = false;
        self.page = Page::new();
    }

    /// Flip the valid bit while keeping the file claim, to exercise the
    /// corrupted-descriptor path of `flush_file`.
    #[cfg(test)]
    pub(super) fn force_invalid(&mut self) {
        self.valid = false;
    }

    /// Mark the frame valid without installing a page, for replacer tests.
    #[cfg(test)]
    pub(super) fn force_valid(&mut self) {
        self.valid = true;
    }
}
