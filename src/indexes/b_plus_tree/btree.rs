use super::scan::{Operator, ScanState};
use crate::buffer_pool::ArcBufferPool;
use crate::dbglog;
use crate::disk_manager::{FileHandle, PagedFile};
use crate::errors::Error;
use crate::pages::btree_page::{Key, LeafNode, NonLeafNode, RecordId, LEAF_CAP, NODE_CAP};
use crate::pages::meta_page::{AttrType, IndexMeta};
use crate::pages::traits::Serialize;
use crate::pages::{PageNo, INVALID_PAGE_NO, PAGE_SIZE};
use crate::relation::RelationScan;
use anyhow::{anyhow, bail, ensure, Result};
use std::mem;
use std::path::Path;

/// Persistent B+Tree over a fixed-width integer attribute of a relation.
///
/// Nodes live on pages of a dedicated index file served through the shared
/// buffer pool. Page 1 is the meta block, page 2 the initial root leaf;
/// further nodes are allocated as splits demand. The tree is grow-only.
#[derive(Debug)]
pub struct BTreeIndex {
    file: FileHandle,
    bpm: ArcBufferPool,
    index_name: String,
    meta_page_no: PageNo,
    meta: IndexMeta,
    scan: Option<ScanState>,
}

impl BTreeIndex {
    /// Open (or create) the index of `relation` on the integer attribute at
    /// `attr_byte_offset`. A fresh index bulk-loads every record `source`
    /// yields; an existing one is validated against the requested attribute
    /// and `source` is left untouched.
    pub fn open(
        bpm: ArcBufferPool,
        dir: &Path,
        relation: &str,
        attr_byte_offset: usize,
        attr_type: AttrType,
        source: &mut dyn RelationScan,
    ) -> Result<Self> {
        Self::open_with_occupancy(
            bpm,
            dir,
            relation,
            attr_byte_offset,
            attr_type,
            source,
            LEAF_CAP,
            NODE_CAP,
        )
    }

    /// Like [`BTreeIndex::open`] but with reduced node occupancies, so small
    /// trees split after a handful of entries. The occupancies are persisted
    /// in the meta block and restored on reopen.
    #[allow(clippy::too_many_arguments)]
    pub fn open_with_occupancy(
        bpm: ArcBufferPool,
        dir: &Path,
        relation: &str,
        attr_byte_offset: usize,
        attr_type: AttrType,
        source: &mut dyn RelationScan,
        leaf_occupancy: usize,
        node_occupancy: usize,
    ) -> Result<Self> {
        if attr_type != AttrType::Int {
            bail!(Error::BadIndexInfo(format!(
                "attribute type {attr_type:?} is not indexable"
            )));
        }
        ensure!(
            (2..=LEAF_CAP).contains(&leaf_occupancy) && (2..=NODE_CAP).contains(&node_occupancy),
            "occupancies out of range"
        );

        let index_name = format!("{relation}.{attr_byte_offset}");
        let path = dir.join(&index_name);

        if PagedFile::exists(&path) {
            let file = PagedFile::open(&path, false)?;
            let meta_page_no = file.first_page_no();

            let meta = {
                let mut pool = bpm.lock();
                let read = pool
                    .read_page(&file, meta_page_no)
                    .map(|frame| IndexMeta::read_from(frame.page()));
                pool.unpin_page(&file, meta_page_no, false)?;
                read??
            };
            if meta.attr_byte_offset as usize != attr_byte_offset || meta.attr_type != attr_type {
                bail!(Error::BadIndexInfo(index_name));
            }

            return Ok(Self {
                file,
                bpm,
                index_name,
                meta_page_no,
                meta,
                scan: None,
            });
        }

        let file = PagedFile::open(&path, true)?;
        let (meta_page_no, root_page_no) = {
            let mut pool = bpm.lock();
            let meta_page_no = pool.alloc_page(&file)?.page_no();
            let root_page_no = pool.alloc_page(&file)?.page_no();
            (meta_page_no, root_page_no)
        };

        let meta = IndexMeta::new(
            relation,
            attr_byte_offset as u32,
            attr_type,
            root_page_no,
            leaf_occupancy as u32,
            node_occupancy as u32,
        );

        let mut index = Self {
            file,
            bpm,
            index_name,
            meta_page_no,
            meta,
            scan: None,
        };
        index.write_meta()?;
        // a freshly allocated page is already the empty leaf: no entries, no
        // right sibling
        index.unpin(meta_page_no, false)?;
        index.unpin(root_page_no, false)?;

        loop {
            match source.scan_next() {
                Ok((rid, record)) => {
                    let key = key_at(&record, attr_byte_offset)?;
                    index.insert_entry(key, rid)?;
                }
                Err(e) if matches!(e.downcast_ref::<Error>(), Some(Error::EndOfFile)) => break,
                Err(e) => return Err(e),
            }
        }
        index.bpm.lock().flush_file(&index.file)?;

        Ok(index)
    }

    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    /// Insert one key / record-id pair. Duplicate keys are allowed and land
    /// to the right of their equals.
    pub fn insert_entry(&mut self, key: Key, rid: RecordId) -> Result<()> {
        let (leaf_no, mut leaf) = self.descend_for_insert(key)?;

        let len = leaf.occupied(self.leaf_occupancy());
        let pos = leaf.upper_bound(key, len);
        leaf.insert_at(pos, key, rid, len);

        self.store(leaf_no, &leaf)?;
        self.unpin(leaf_no, true)
    }

    /// Begin a range scan over `(low, low_op) .. (high, high_op)`. A scan
    /// that is already running is ended first.
    pub fn start_scan(
        &mut self,
        low: Key,
        low_op: Operator,
        high: Key,
        high_op: Operator,
    ) -> Result<()> {
        if low > high {
            bail!(Error::BadScanrange);
        }
        if !matches!(low_op, Operator::GT | Operator::GTE)
            || !matches!(high_op, Operator::LT | Operator::LTE)
        {
            bail!(Error::BadOpcodes);
        }
        if self.scan.is_some() {
            self.end_scan()?;
        }

        // pure descent: scans never split anything
        let mut leaf_no = self.meta.root_page_no;
        if !self.meta.root_is_leaf {
            loop {
                let node = self.load::<NonLeafNode>(leaf_no)?;
                let index = node.child_index(low, self.node_occupancy());
                let next = node.children[index];
                self.unpin(leaf_no, false)?;
                leaf_no = next;
                if node.level == 1 {
                    break;
                }
            }
        }

        let mut leaf = self.load::<LeafNode>(leaf_no)?;
        loop {
            let len = leaf.occupied(self.leaf_occupancy());
            if let Some(entry) = (0..len).find(|&i| low_op.admits_low(low, leaf.keys[i])) {
                self.scan = Some(ScanState {
                    high,
                    high_op,
                    leaf_no,
                    leaf,
                    next_entry: entry,
                });
                return Ok(());
            }

            // everything here is below the low bound; move one leaf right
            let sibling = leaf.right_sibling;
            self.unpin(leaf_no, false)?;
            if sibling == INVALID_PAGE_NO {
                self.scan = Some(ScanState {
                    high,
                    high_op,
                    leaf_no: INVALID_PAGE_NO,
                    leaf,
                    next_entry: 0,
                });
                return Ok(());
            }
            leaf_no = sibling;
            leaf = self.load::<LeafNode>(leaf_no)?;
        }
    }

    /// Yield the record id of the next entry inside the scan range.
    pub fn scan_next(&mut self) -> Result<RecordId> {
        let mut scan = match self.scan.take() {
            Some(scan) => scan,
            None => bail!(Error::ScanNotInitialized),
        };
        let result = self.advance_scan(&mut scan);
        self.scan = Some(scan);
        result
    }

    /// Stop the running scan and release its leaf.
    pub fn end_scan(&mut self) -> Result<()> {
        let scan = match self.scan.take() {
            Some(scan) => scan,
            None => bail!(Error::ScanNotInitialized),
        };
        if scan.leaf_no != INVALID_PAGE_NO {
            self.unpin(scan.leaf_no, false)?;
        }
        Ok(())
    }

    fn advance_scan(&mut self, scan: &mut ScanState) -> Result<RecordId> {
        if scan.leaf_no == INVALID_PAGE_NO {
            bail!(Error::IndexScanCompleted);
        }
        let key = scan.leaf.keys[scan.next_entry];
        if scan.high_op.past_high(scan.high, key) {
            bail!(Error::IndexScanCompleted);
        }

        let rid = scan.leaf.rids[scan.next_entry];
        scan.next_entry += 1;

        let leaf_consumed = scan.next_entry == self.leaf_occupancy()
            || scan.leaf.rids[scan.next_entry].page_no == INVALID_PAGE_NO;
        if leaf_consumed {
            let sibling = scan.leaf.right_sibling;
            self.unpin(scan.leaf_no, false)?;
            if sibling == INVALID_PAGE_NO {
                scan.leaf_no = INVALID_PAGE_NO;
            } else {
                scan.leaf = self.load::<LeafNode>(sibling)?;
                scan.leaf_no = sibling;
                scan.next_entry = 0;
            }
        }

        Ok(rid)
    }

    /// Walk to the leaf that takes `key`, splitting every full node on the
    /// way down so a child split always finds a non-full parent. Returns the
    /// leaf pinned together with a copy of its contents; it is never full.
    fn descend_for_insert(&mut self, key: Key) -> Result<(PageNo, LeafNode)> {
        if self.meta.root_is_leaf {
            let root_no = self.meta.root_page_no;
            let root = self.load::<LeafNode>(root_no)?;
            if !root.is_full(self.leaf_occupancy()) {
                return Ok((root_no, root));
            }
            return self.split_root_leaf(root_no, root, key);
        }

        let mut current_no = self.meta.root_page_no;
        let mut current = self.load::<NonLeafNode>(current_no)?;

        if current.is_full(self.node_occupancy()) {
            let (sibling_no, mut sibling) = self.alloc_node()?;
            let separator = current.split(&mut sibling, self.node_occupancy());
            self.store(current_no, &current)?;
            self.store(sibling_no, &sibling)?;
            self.promote_root(current_no, sibling_no, separator, current.level + 1)?;

            if key >= separator {
                self.unpin(current_no, true)?;
                current_no = sibling_no;
                current = sibling;
            } else {
                self.unpin(sibling_no, true)?;
            }
        }

        loop {
            let index = current.child_index(key, self.node_occupancy());
            let child_no = current.children[index];

            if current.level == 1 {
                let mut child = self.load::<LeafNode>(child_no)?;
                if !child.is_full(self.leaf_occupancy()) {
                    self.unpin(current_no, false)?;
                    return Ok((child_no, child));
                }

                let (sibling_no, mut sibling) = self.alloc_leaf()?;
                let separator = child.split(&mut sibling, sibling_no, self.leaf_occupancy());
                self.store(child_no, &child)?;
                self.store(sibling_no, &sibling)?;
                current.insert_child(index, separator, sibling_no, self.node_occupancy());
                self.store(current_no, &current)?;
                self.unpin(current_no, true)?;

                return if key < separator {
                    self.unpin(sibling_no, true)?;
                    Ok((child_no, child))
                } else {
                    self.unpin(child_no, true)?;
                    Ok((sibling_no, sibling))
                };
            }

            let mut child = self.load::<NonLeafNode>(child_no)?;
            if child.is_full(self.node_occupancy()) {
                let (sibling_no, mut sibling) = self.alloc_node()?;
                let separator = child.split(&mut sibling, self.node_occupancy());
                self.store(child_no, &child)?;
                self.store(sibling_no, &sibling)?;
                current.insert_child(index, separator, sibling_no, self.node_occupancy());
                self.store(current_no, &current)?;
                self.unpin(current_no, true)?;

                if key >= separator {
                    self.unpin(child_no, true)?;
                    current_no = sibling_no;
                    current = sibling;
                } else {
                    self.unpin(sibling_no, true)?;
                    current_no = child_no;
                    current = child;
                }
            } else {
                self.unpin(current_no, false)?;
                current_no = child_no;
                current = child;
            }
        }
    }

    /// Split the root while it still is a leaf and hand back the half that
    /// takes `key`, pinned.
    fn split_root_leaf(
        &mut self,
        root_no: PageNo,
        mut root: LeafNode,
        key: Key,
    ) -> Result<(PageNo, LeafNode)> {
        let (sibling_no, mut sibling) = self.alloc_leaf()?;
        let separator = root.split(&mut sibling, sibling_no, self.leaf_occupancy());
        self.store(root_no, &root)?;
        self.store(sibling_no, &sibling)?;
        self.promote_root(root_no, sibling_no, separator, 1)?;

        if key < separator {
            self.unpin(sibling_no, true)?;
            Ok((root_no, root))
        } else {
            self.unpin(root_no, true)?;
            Ok((sibling_no, sibling))
        }
    }

    /// Put a new non-leaf root above `left` and `right`. The new root is
    /// written first; the meta block is updated last, in a single write, so
    /// an interrupted split still leaves the old root reachable.
    fn promote_root(
        &mut self,
        left: PageNo,
        right: PageNo,
        separator: Key,
        level: i32,
    ) -> Result<()> {
        let (root_no, mut root) = self.alloc_node()?;
        root.level = level;
        root.keys[0] = separator;
        root.children[0] = left;
        root.children[1] = right;
        self.store(root_no, &root)?;
        self.unpin(root_no, true)?;
        dbglog!("promoted page {} to root at level {}", root_no, level);

        self.meta.root_page_no = root_no;
        self.meta.root_is_leaf = false;
        self.write_meta()
    }

    /// Read a node out of its pinned frame; the pin is kept.
    fn load<T: Serialize>(&self, page_no: PageNo) -> Result<T> {
        let mut pool = self.bpm.lock();
        let frame = pool.read_page(&self.file, page_no)?;
        Ok(T::from_bytes(frame.page().read_bytes(0, PAGE_SIZE)))
    }

    /// Write a node back into its frame and mark it dirty. Pin-neutral.
    fn store<T: Serialize>(&self, page_no: PageNo, node: &T) -> Result<()> {
        let bytes = node.as_bytes();
        let mut pool = self.bpm.lock();
        pool.read_page(&self.file, page_no)?
            .page_mut()
            .write_bytes(0, bytes.len(), bytes);
        pool.unpin_page(&self.file, page_no, true)
    }

    fn unpin(&self, page_no: PageNo, dirty: bool) -> Result<()> {
        self.bpm.lock().unpin_page(&self.file, page_no, dirty)
    }

    /// New pinned leaf page; freshly allocated pages are all zero, which is
    /// exactly the empty leaf.
    fn alloc_leaf(&self) -> Result<(PageNo, LeafNode)> {
        let page_no = self.bpm.lock().alloc_page(&self.file)?.page_no();
        Ok((page_no, LeafNode::new()))
    }

    fn alloc_node(&self) -> Result<(PageNo, NonLeafNode)> {
        let page_no = self.bpm.lock().alloc_page(&self.file)?.page_no();
        Ok((page_no, NonLeafNode::new()))
    }

    fn write_meta(&self) -> Result<()> {
        let mut pool = self.bpm.lock();
        let frame = pool.read_page(&self.file, self.meta_page_no)?;
        self.meta.write_to(frame.page_mut())?;
        pool.unpin_page(&self.file, self.meta_page_no, true)
    }

    fn leaf_occupancy(&self) -> usize {
        self.meta.leaf_occupancy as usize
    }

    fn node_occupancy(&self) -> usize {
        self.meta.node_occupancy as usize
    }
}

impl Drop for BTreeIndex {
    fn drop(&mut self) {
        if self.scan.is_some() {
            let _ = self.end_scan();
        }
        let _ = self.bpm.lock().flush_file(&self.file);
    }
}

/// Native-endian integer key at `offset` in a heap record.
fn key_at(record: &[u8], offset: usize) -> Result<Key> {
    let end = offset + mem::size_of::<Key>();
    if record.len() < end {
        return Err(anyhow!(
            "record of {} bytes has no key at offset {offset}",
            record.len()
        ));
    }
    Ok(Key::from_ne_bytes(record[offset..end].try_into().unwrap()))
}
