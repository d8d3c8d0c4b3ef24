use super::{Page, PageNo, PAGE_SIZE};
use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Fixed width of the relation name stored in the meta block.
pub const REL_NAME_LEN: usize = 20;

/// Type of the indexed attribute. Only `Int` is implemented; the other
/// variants reserve the typing hook for wider keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttrType {
    Int,
    Double,
    Str,
}

/// Contents of the index file's first page. Encoded with bincode; the
/// encoding is a few dozen bytes and always fits the page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMeta {
    pub relation_name: [u8; REL_NAME_LEN],
    pub attr_byte_offset: u32,
    pub attr_type: AttrType,
    pub root_page_no: PageNo,
    /// Kept explicitly instead of being inferred from the root page number,
    /// which stops meaning anything once the root has split.
    pub root_is_leaf: bool,
    pub leaf_occupancy: u32,
    pub node_occupancy: u32,
}

impl IndexMeta {
    pub fn new(
        relation: &str,
        attr_byte_offset: u32,
        attr_type: AttrType,
        root_page_no: PageNo,
        leaf_occupancy: u32,
        node_occupancy: u32,
    ) -> Self {
        let mut relation_name = [0u8; REL_NAME_LEN];
        let bytes = relation.as_bytes();
        let len = bytes.len().min(REL_NAME_LEN);
        relation_name[..len].copy_from_slice(&bytes[..len]);

        Self {
            relation_name,
            attr_byte_offset,
            attr_type,
            root_page_no,
            root_is_leaf: true,
            leaf_occupancy,
            node_occupancy,
        }
    }

    pub fn relation(&self) -> &str {
        let end = self
            .relation_name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(REL_NAME_LEN);
        std::str::from_utf8(&self.relation_name[..end]).unwrap_or("")
    }

    pub fn write_to(&self, page: &mut Page) -> Result<()> {
        let bytes = bincode::serialize(self)?;
        page.write_bytes(0, bytes.len(), &bytes);
        Ok(())
    }

    pub fn read_from(page: &Page) -> Result<Self> {
        Ok(bincode::deserialize(page.read_bytes(0, PAGE_SIZE))?)
    }
}
