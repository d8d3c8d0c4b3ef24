use crate::pages::PageNo;

/// Error kinds surfaced by the storage layer. Callers receive them wrapped in
/// [`anyhow::Error`] and match through `downcast_ref::<Error>()`.
#[derive(Debug)]
pub enum Error {
    /// Every frame is pinned, the clock sweep has nothing to evict.
    BufferExceeded,
    /// A (file, page) pair is not resident in the pool.
    HashNotFound,
    /// Unpin attempted on a resident frame whose pin count is already zero.
    PageNotPinned(PageNo),
    /// A flush was refused because a frame of the file is still pinned.
    PagePinned(PageNo),
    /// An invalid frame claims to belong to the flushed file.
    BadBuffer(usize),
    /// On-disk index metadata does not match the caller's attribute info.
    BadIndexInfo(String),
    /// Scan range with a low bound above the high bound.
    BadScanrange,
    /// Scan opcodes outside {GT, GTE} / {LT, LTE}.
    BadOpcodes,
    /// Reserved for point lookups.
    NoSuchKeyFound,
    /// Scan operation without a running scan.
    ScanNotInitialized,
    /// The running scan has no further matching entries.
    IndexScanCompleted,
    /// The relation scan is exhausted; terminates bulk loads.
    EndOfFile,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::BufferExceeded => write!(f, "Buffer pool exceeded: all frames are pinned."),
            Error::HashNotFound => write!(f, "Page is not resident in the buffer pool."),
            Error::PageNotPinned(page_no) => {
                write!(f, "Page {page_no} is resident but not pinned.")
            }
            Error::PagePinned(page_no) => {
                write!(f, "Page {page_no} is still pinned.")
            }
            Error::BadBuffer(frame_no) => {
                write!(f, "Frame {frame_no} is in an invalid state.")
            }
            Error::BadIndexInfo(index) => {
                write!(f, "Index {index} does not match the requested attribute.")
            }
            Error::BadScanrange => write!(f, "Low scan bound is greater than the high bound."),
            Error::BadOpcodes => write!(f, "Unsupported scan operators."),
            Error::NoSuchKeyFound => write!(f, "Key not found in the index."),
            Error::ScanNotInitialized => write!(f, "No scan is running."),
            Error::IndexScanCompleted => write!(f, "Scan has consumed all matching entries."),
            Error::EndOfFile => write!(f, "Relation scan reached the end of the file."),
        }
    }
}

impl std::error::Error for Error {}
