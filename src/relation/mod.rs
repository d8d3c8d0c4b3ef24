use crate::errors::Error;
use crate::pages::btree_page::RecordId;
use anyhow::{bail, Result};

/// Record source an index bulk-loads from. `scan_next` yields records until
/// the relation is exhausted, then fails with [`Error::EndOfFile`].
pub trait RelationScan {
    fn scan_next(&mut self) -> Result<(RecordId, Vec<u8>)>;
}

/// In-memory relation for tests and embedders that have no heap file.
pub struct MemoryScan {
    records: Vec<(RecordId, Vec<u8>)>,
    cursor: usize,
}

impl MemoryScan {
    pub fn new(records: Vec<(RecordId, Vec<u8>)>) -> Self {
        Self { records, cursor: 0 }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }
}

impl RelationScan for MemoryScan {
    fn scan_next(&mut self) -> Result<(RecordId, Vec<u8>)> {
        if self.cursor == self.records.len() {
            bail!(Error::EndOfFile);
        }
        let record = self.records[self.cursor].clone();
        self.cursor += 1;
        Ok(record)
    }
}
