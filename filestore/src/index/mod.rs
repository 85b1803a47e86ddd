//! Disk-resident B-tree mapping file ids to the first block of their chain.
//!
//! # Layout
//! ======================================================
//! | root offset (i64) | node | node | node | ...      |
//! ======================================================
//!
//! Nodes are fixed-size records appended as they are created and rewritten in
//! place afterwards. The file is the source of truth: every operation starts
//! by reading the root from disk and holds nodes only while it descends.
//! Removal is lazy, removed keys stay in their node flagged as not in use.

mod node;

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{debug, info, trace, warn};

use crate::error::{Result, StoreError};

pub use node::{node_size, IndexEntry, Node, NO_BLOCK, NO_CHILD};
use node::UNWRITTEN;

/// Bytes reserved at the start of the file for the root offset.
pub const INDEX_HEADER_SIZE: u64 = 8;

pub struct BTreeIndex {
    file: File,
    path: PathBuf,
    /// Minimum degree.
    t: usize,
    node_size: usize,
    root_offset: i64,
}

impl BTreeIndex {
    /// Opens the index at `path`, creating it with an empty root leaf when the
    /// file is new. A root offset pointing outside the file, or at something
    /// that is not a node, is treated as corruption: a fresh empty root is
    /// written and the previous tree is abandoned.
    pub fn open<P: AsRef<Path>>(path: P, t: usize) -> Result<Self> {
        if t < 2 {
            return Err(StoreError::InvalidConfig(format!(
                "minimum degree {} must be at least 2",
                t
            )));
        }
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let mut index = Self {
            file,
            path,
            t,
            node_size: node_size(t),
            root_offset: UNWRITTEN,
        };

        let len = index.file.metadata()?.len();
        if len < INDEX_HEADER_SIZE {
            info!("Initializing new index at {}.", index.path.display());
            index.file.set_len(INDEX_HEADER_SIZE)?;
            index.reset_root()?;
            return Ok(index);
        }

        let mut raw = [0u8; 8];
        index.file.seek(SeekFrom::Start(0))?;
        index.file.read_exact(&mut raw)?;
        index.root_offset = i64::from_le_bytes(raw);

        if let Err(e) = index.read_node(index.root_offset) {
            warn!(
                "Index root at {} unusable ({}), starting an empty index.",
                index.root_offset, e
            );
            index.reset_root()?;
        } else {
            info!(
                "Opened index at {} with root at offset {}.",
                index.path.display(),
                index.root_offset
            );
        }
        Ok(index)
    }

    pub fn min_degree(&self) -> usize {
        self.t
    }

    pub fn root_offset(&self) -> i64 {
        self.root_offset
    }

    /// Looks up the live entry for `file_id`.
    pub fn search(&mut self, file_id: i32) -> Result<Option<IndexEntry>> {
        let limit = self.node_count()?;
        let mut offset = self.root_offset;
        let mut depth = 0;
        loop {
            check_depth(depth, limit, offset)?;
            depth += 1;
            let node = self.read_node(offset)?;
            match node.find(file_id) {
                Ok(i) => {
                    let entry = node.entries[i];
                    trace!("Index lookup of {} found {:?}.", file_id, entry);
                    return Ok(if entry.in_use { Some(entry) } else { None });
                }
                Err(_) if node.is_leaf => return Ok(None),
                Err(i) => {
                    offset = node.children[i];
                    if offset == NO_CHILD {
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Maps `file_id` to `first_block`, replacing (and reviving) any entry the
    /// id already has.
    pub fn insert(&mut self, file_id: i32, first_block: i32) -> Result<()> {
        let mut node = self.read_node(self.root_offset)?;

        if node.is_full(self.t) {
            debug!("Index root at {} is full, splitting.", node.offset);
            let mut new_root = Node::internal();
            new_root.children.push(node.offset);
            self.split_child(&mut new_root, 0, &mut node)?;
            self.root_offset = new_root.offset;
            self.write_root_offset()?;
            node = new_root;
        }

        let limit = self.node_count()?;
        let mut depth = 0;
        loop {
            check_depth(depth, limit, node.offset)?;
            depth += 1;
            let i = match node.find(file_id) {
                Ok(i) => {
                    node.entries[i].first_block = first_block;
                    node.entries[i].in_use = true;
                    self.write_node(&mut node)?;
                    trace!("Updated index entry {} -> {}.", file_id, first_block);
                    break;
                }
                Err(i) => i,
            };

            if node.is_leaf {
                node.entries.insert(i, IndexEntry::new(file_id, first_block));
                self.write_node(&mut node)?;
                trace!("Inserted index entry {} -> {}.", file_id, first_block);
                break;
            }

            let child_offset = node.children[i];
            if child_offset == NO_CHILD {
                return Err(StoreError::IndexCorruption(format!(
                    "internal node at {} has no child {}",
                    node.offset, i
                )));
            }
            let mut child = self.read_node(child_offset)?;
            if child.is_full(self.t) {
                let sibling = self.split_child(&mut node, i, &mut child)?;
                let median = node.entries[i].file_id;
                if median == file_id {
                    // The median just moved up is the key being written.
                    continue;
                }
                if median < file_id {
                    child = sibling;
                }
            }
            node = child;
        }

        self.write_root_offset()
    }

    /// Marks the live entry for `file_id` as removed. Returns false if there is
    /// none.
    pub fn remove(&mut self, file_id: i32) -> Result<bool> {
        let limit = self.node_count()?;
        let mut offset = self.root_offset;
        let mut depth = 0;
        loop {
            check_depth(depth, limit, offset)?;
            depth += 1;
            let mut node = self.read_node(offset)?;
            match node.find(file_id) {
                Ok(i) => {
                    if !node.entries[i].in_use {
                        return Ok(false);
                    }
                    node.entries[i].in_use = false;
                    node.entries[i].first_block = NO_BLOCK;
                    self.write_node(&mut node)?;
                    debug!("Marked index entry {} as removed.", file_id);
                    return Ok(true);
                }
                Err(_) if node.is_leaf => return Ok(false),
                Err(i) => {
                    offset = node.children[i];
                    if offset == NO_CHILD {
                        return Ok(false);
                    }
                }
            }
        }
    }

    /// Live file ids in ascending order.
    pub fn enumerate(&mut self) -> Result<Vec<i32>> {
        Ok(self.dump()?.into_iter().map(|e| e.file_id).collect())
    }

    /// Every live entry in key order.
    pub fn dump(&mut self) -> Result<Vec<IndexEntry>> {
        let limit = self.node_count()?;
        let mut visited = 1;
        let mut out = Vec::new();
        // In-order walk. A frame `(node, k)` resumes a node after its child
        // `k - 1` was visited: emit key `k - 1`, then descend into child `k`.
        let mut stack: Vec<(Node, usize)> = vec![(self.read_node(self.root_offset)?, 0)];
        while let Some((node, k)) = stack.pop() {
            if k > 0 {
                let entry = node.entries[k - 1];
                if entry.in_use {
                    out.push(entry);
                }
            }
            let child = if node.is_leaf {
                None
            } else {
                node.children.get(k).copied().filter(|&c| c != NO_CHILD)
            };
            if k < node.entries.len() {
                stack.push((node, k + 1));
            }
            if let Some(offset) = child {
                // A valid tree reads each node once.
                check_depth(visited, limit, offset)?;
                visited += 1;
                stack.push((self.read_node(offset)?, 0));
            }
        }
        debug!("Index holds {} live entries.", out.len());
        Ok(out)
    }

    /// Flushes index writes to stable storage.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Moves the median of the full `child` (at slot `i` of `parent`) up into
    /// `parent`, handing the upper half of `child` to a new sibling placed right
    /// after it. All three nodes are written; the sibling is returned.
    fn split_child(&mut self, parent: &mut Node, i: usize, child: &mut Node) -> Result<Node> {
        let t = self.t;
        let mut sibling = if child.is_leaf {
            Node::leaf()
        } else {
            Node::internal()
        };
        sibling.entries = child.entries.split_off(t);
        let median = child
            .entries
            .pop()
            .ok_or_else(|| StoreError::IndexCorruption("split of an empty node".to_string()))?;
        if !child.is_leaf {
            sibling.children = child.children.split_off(t);
        }

        self.write_node(child)?;
        self.write_node(&mut sibling)?;

        parent.children.insert(i + 1, sibling.offset);
        parent.entries.insert(i, median);
        self.write_node(parent)?;
        trace!(
            "Split node {} around {}, new sibling at {}.",
            child.offset,
            median.file_id,
            sibling.offset
        );
        Ok(sibling)
    }

    /// Number of node records the file has room for.
    fn node_count(&self) -> Result<usize> {
        let len = self.file.metadata()?.len();
        Ok((len.saturating_sub(INDEX_HEADER_SIZE) / self.node_size as u64) as usize)
    }

    fn read_node(&mut self, offset: i64) -> Result<Node> {
        let len = self.file.metadata()?.len();
        if offset < INDEX_HEADER_SIZE as i64 || offset as u64 + self.node_size as u64 > len {
            return Err(StoreError::IndexCorruption(format!(
                "node offset {} outside index of {} bytes",
                offset, len
            )));
        }
        let mut buf = vec![0; self.node_size];
        self.file.seek(SeekFrom::Start(offset as u64))?;
        self.file.read_exact(&mut buf)?;
        Node::decode(&buf, self.t, offset)
    }

    /// Writes `node` at its offset, appending it to the file (and assigning
    /// that offset) when it has never been written.
    fn write_node(&mut self, node: &mut Node) -> Result<()> {
        if node.offset == UNWRITTEN {
            let end = self.file.seek(SeekFrom::End(0))?;
            node.offset = end as i64;
        } else {
            self.file.seek(SeekFrom::Start(node.offset as u64))?;
        }
        self.file.write_all(&node.encode(self.t))?;
        Ok(())
    }

    fn write_root_offset(&mut self) -> Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&self.root_offset.to_le_bytes())?;
        Ok(())
    }

    fn reset_root(&mut self) -> Result<()> {
        let mut root = Node::leaf();
        self.write_node(&mut root)?;
        self.root_offset = root.offset;
        self.write_root_offset()?;
        debug!("Wrote empty index root at offset {}.", self.root_offset);
        Ok(())
    }
}

/// Fails once a walk has gone through more nodes than the file holds, which
/// only happens when child offsets form a cycle.
fn check_depth(depth: usize, limit: usize, offset: i64) -> Result<()> {
    if depth >= limit {
        return Err(StoreError::IndexCorruption(format!(
            "walk reached node {} after {} of {} nodes, child offsets loop",
            offset, depth, limit
        )));
    }
    Ok(())
}
