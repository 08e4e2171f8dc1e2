//! Open nodes and the per-volume open-node table.

use esfs_ondisk::{FileEntry, FileType};
use esfs_types::UniqueIdentifier;
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::Arc;

/// The mutable state of an open node.
///
/// `container_block` and the two offsets bind the in-memory entry to its
/// bytes on disk; removals in the same block shift them down.
#[derive(Debug)]
pub struct NodeInner {
    pub entry: FileEntry,
    /// Length `sync` writes back (through the attribute-list terminator).
    pub file_entry_length: usize,
    /// Global block holding the file entry.
    pub container_block: u64,
    /// Offset of the file entry within the container block.
    pub offset_into_block: u32,
    /// Offset of the enclosing directory entry within the container block.
    pub offset_into_block2: u32,
    /// Identifier of the directory this node was opened through; `None`
    /// for the root.
    pub parent: Option<UniqueIdentifier>,
    pub handles: u32,
}

/// A refcounted handle to an open file entry.
#[derive(Debug)]
pub struct Node {
    identifier: UniqueIdentifier,
    file_type: FileType,
    inner: Mutex<NodeInner>,
}

impl Node {
    #[must_use]
    pub fn new(file_type: FileType, inner: NodeInner) -> Self {
        Self {
            identifier: inner.entry.identifier,
            file_type,
            inner: Mutex::new(inner),
        }
    }

    #[must_use]
    pub fn identifier(&self) -> UniqueIdentifier {
        self.identifier
    }

    #[must_use]
    pub fn file_type(&self) -> FileType {
        self.file_type
    }

    pub fn lock(&self) -> MutexGuard<'_, NodeInner> {
        self.inner.lock()
    }
}

/// Identifier-keyed table of open nodes.
///
/// At most one live node exists per identifier; a handle count of zero
/// makes the node eligible for eviction.
#[derive(Debug, Default)]
pub struct NodeTable {
    map: Mutex<HashMap<UniqueIdentifier, Arc<Node>>>,
}

impl NodeTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly opened node.
    pub fn register(&self, node: Arc<Node>) {
        self.map.lock().insert(node.identifier(), node);
    }

    /// Look up an open node without touching its handle count.
    #[must_use]
    pub fn get(&self, identifier: UniqueIdentifier) -> Option<Arc<Node>> {
        self.map.lock().get(&identifier).cloned()
    }

    /// Look up an open node and take another handle against it.
    #[must_use]
    pub fn find_and_retain(&self, identifier: UniqueIdentifier) -> Option<Arc<Node>> {
        let map = self.map.lock();
        let node = map.get(&identifier).cloned()?;
        node.lock().handles += 1;
        Some(node)
    }

    /// Drop one handle; the node is evicted when none remain. Returns
    /// `true` when the node was evicted.
    pub fn release(&self, identifier: UniqueIdentifier) -> bool {
        let mut map = self.map.lock();
        let Some(node) = map.get(&identifier) else {
            return false;
        };
        let remaining = {
            let mut inner = node.lock();
            inner.handles = inner.handles.saturating_sub(1);
            inner.handles
        };
        if remaining == 0 {
            map.remove(&identifier);
            true
        } else {
            false
        }
    }

    /// Forcibly drop a node (its on-disk entry is gone).
    pub fn remove(&self, identifier: UniqueIdentifier) {
        self.map.lock().remove(&identifier);
    }
}
