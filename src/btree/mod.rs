//! Immutable, persistent, copy-on-write B-tree over an append-only store.
//!
//! A tree value is identified by the offset of its root node; mutations copy
//! the path from the touched leaf up to the root and append the new nodes,
//! leaving every previously committed tree intact as a readable snapshot.
//! Deleted space is never rewritten in place; it accumulates as `dirt` until
//! a compaction rebuilds the tree into a fresh file.

pub mod cursor;
pub mod node;

use std::ops::Bound;
use std::sync::{Arc, Mutex};

use crate::cache::Cache;
use crate::error::{Error, Result};
use crate::store::Store;

pub use cursor::{Range, RawRange, ValueRef};
use node::{latest_header, read_node, write_node, Entry, Header, Node};

/// Bounded offset-to-node map shared by every snapshot over one store.
/// Offsets are written exactly once, so entries never need invalidation.
pub struct NodeCache(Option<Mutex<Cache<u64, Arc<Node>>>>);

impl NodeCache {
    pub fn new(capacity: usize) -> Self {
        if capacity == 0 {
            NodeCache(None)
        } else {
            NodeCache(Some(Mutex::new(Cache::new(capacity))))
        }
    }

    fn get(&self, offset: u64) -> Option<Arc<Node>> {
        let cache = self.0.as_ref()?;
        cache.lock().expect("node cache lock poisoned").get(&offset)
    }

    fn put(&self, offset: u64, node: Arc<Node>) {
        if let Some(cache) = &self.0 {
            cache
                .lock()
                .expect("node cache lock poisoned")
                .insert(offset, node);
        }
    }
}

/// Reads the node at `offset`, keeping leaves, branches, and tombstones in
/// the cache. Values are not cached: they are read once per lookup and can
/// be arbitrarily large.
pub(crate) fn read_cached(store: &Store, cache: &NodeCache, offset: u64) -> Result<Arc<Node>> {
    if let Some(node) = cache.get(offset) {
        return Ok(node);
    }
    let node = Arc::new(read_node(store, offset)?);
    if !matches!(*node, Node::Value(_)) {
        cache.put(offset, Arc::clone(&node));
    }
    Ok(node)
}

/// An immutable B-tree snapshot. Cloning is cheap; mutating operations
/// return a new `Btree` sharing the same store.
#[derive(Clone)]
pub struct Btree {
    store: Arc<Store>,
    cache: Arc<NodeCache>,
    root: u64,
    size: u64,
    dirt: u64,
    order: usize,
}

/// Path of branch nodes copied during a mutation: for each level, the branch
/// entries and the index of the child the descent took.
struct Descent {
    branches: Vec<(Vec<Entry>, usize)>,
    leaf: Vec<Entry>,
}

impl Btree {
    /// Loads the tree committed in `store`, or bootstraps an empty tree (an
    /// empty leaf plus a header committing it) when the store holds none.
    pub fn open(store: Arc<Store>, order: usize, cache_size: usize) -> Result<Btree> {
        let cache = Arc::new(NodeCache::new(cache_size));

        if let Some((_, header)) = latest_header(&store)? {
            return Ok(Btree {
                store,
                cache,
                root: header.root,
                size: header.size,
                dirt: header.dirt,
                order,
            });
        }

        let root = write_node(&store, &Node::Leaf(Vec::new()))?;
        let tree = Btree {
            store,
            cache,
            root,
            size: 0,
            dirt: 0,
            order,
        };
        tree.commit()
    }

    /// Rehydrates a tree from already-known parts (used by the compactor
    /// after bulk-loading a fresh store).
    pub(crate) fn from_parts(
        store: Arc<Store>,
        cache: Arc<NodeCache>,
        root: u64,
        size: u64,
        dirt: u64,
        order: usize,
    ) -> Btree {
        Btree {
            store,
            cache,
            root,
            size,
            dirt,
            order,
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn root(&self) -> u64 {
        self.root
    }

    pub fn order(&self) -> usize {
        self.order
    }

    /// Count of live (non-tombstone) entries.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Count of mutating operations committed into this file since its
    /// creation.
    pub fn dirt(&self) -> u64 {
        self.dirt
    }

    /// Normalized overhead in [0, 1]: 0 for a freshly compacted file, and
    /// monotone non-decreasing in `dirt` at fixed `size`.
    pub fn dirt_factor(&self) -> f64 {
        self.dirt as f64 / (self.dirt + self.size + 1) as f64
    }

    fn read(&self, offset: u64) -> Result<Arc<Node>> {
        read_cached(&self.store, &self.cache, offset)
    }

    /// Returns the value for `key`, or `None` when absent or tombstoned.
    pub fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.leaf_ptr(key)? {
            Some(ptr) => self.read_value(ptr),
            None => Ok(None),
        }
    }

    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        match self.leaf_ptr(key)? {
            Some(ptr) => Ok(self.is_live(ptr)?),
            None => Ok(false),
        }
    }

    /// The value offset stored in the leaf for `key`, tombstone or not.
    fn leaf_ptr(&self, key: &[u8]) -> Result<Option<u64>> {
        let mut offset = self.root;
        loop {
            match &*self.read(offset)? {
                Node::Branch(entries) => {
                    let idx = entries.partition_point(|(k, _)| k.as_slice() <= key);
                    if idx == 0 {
                        return Ok(None);
                    }
                    offset = entries[idx - 1].1;
                }
                Node::Leaf(entries) => {
                    return Ok(entries
                        .binary_search_by(|(k, _)| k.as_slice().cmp(key))
                        .ok()
                        .map(|i| entries[i].1));
                }
                _ => {
                    return Err(Error::Corrupted(format!(
                        "expected branch or leaf at offset {offset}"
                    )))
                }
            }
        }
    }

    fn read_value(&self, ptr: u64) -> Result<Option<Vec<u8>>> {
        match &*self.read(ptr)? {
            Node::Value(bytes) => Ok(Some(bytes.clone())),
            Node::Deleted => Ok(None),
            _ => Err(Error::Corrupted(format!(
                "expected value or tombstone at offset {ptr}"
            ))),
        }
    }

    /// Like `lookup`, but distinguishes a tombstoned key from an absent one.
    pub(crate) fn raw_lookup(&self, key: &[u8]) -> Result<Option<ValueRef>> {
        match self.leaf_ptr(key)? {
            Some(ptr) => match &*self.read(ptr)? {
                Node::Value(bytes) => Ok(Some(ValueRef::Live(bytes.clone()))),
                Node::Deleted => Ok(Some(ValueRef::Tombstone)),
                _ => Err(Error::Corrupted(format!(
                    "expected value or tombstone at offset {ptr}"
                ))),
            },
            None => Ok(None),
        }
    }

    fn is_live(&self, ptr: u64) -> Result<bool> {
        match &*self.read(ptr)? {
            Node::Value(_) => Ok(true),
            Node::Deleted => Ok(false),
            _ => Err(Error::Corrupted(format!(
                "expected value or tombstone at offset {ptr}"
            ))),
        }
    }

    /// Inserts or replaces `key`. With `commit` false the new nodes are
    /// appended but no header is written; the caller publishes the tree with
    /// an explicit `commit`.
    pub fn insert(&self, key: &[u8], value: &[u8], commit: bool) -> Result<Btree> {
        self.write_leaf_entry(key, Node::Value(value.to_vec()), commit)
    }

    /// Writes an explicit tombstone at the leaf position, so a compactor
    /// consuming an older snapshot of this file observes the deletion.
    pub fn mark_deleted(&self, key: &[u8], commit: bool) -> Result<Btree> {
        self.write_leaf_entry(key, Node::Deleted, commit)
    }

    /// Removes `key` from the leaf if it is live. No merge or rebalance is
    /// performed; compaction reclaims the space. The attempt counts as a
    /// write even when the key is absent, so `dirt` always grows.
    pub fn delete(&self, key: &[u8], commit: bool) -> Result<Btree> {
        let Descent { branches, mut leaf } = self.descend(key)?;

        let next = match leaf.binary_search_by(|(k, _)| k.as_slice().cmp(key)) {
            Ok(i) if self.is_live(leaf[i].1)? => {
                leaf.remove(i);
                let root = self.write_path(branches, leaf)?;
                Btree {
                    root,
                    size: self.size - 1,
                    dirt: self.dirt + 1,
                    ..self.clone()
                }
            }
            _ => Btree {
                dirt: self.dirt + 1,
                ..self.clone()
            },
        };

        if commit {
            next.commit()
        } else {
            Ok(next)
        }
    }

    fn write_leaf_entry(&self, key: &[u8], child: Node, commit: bool) -> Result<Btree> {
        let Descent { branches, mut leaf } = self.descend(key)?;
        let inserting_live = matches!(child, Node::Value(_));
        let ptr = write_node(&self.store, &child)?;

        let was_live = match leaf.binary_search_by(|(k, _)| k.as_slice().cmp(key)) {
            Ok(i) => {
                let old = leaf[i].1;
                leaf[i].1 = ptr;
                self.is_live(old)?
            }
            Err(i) => {
                leaf.insert(i, (key.to_vec(), ptr));
                false
            }
        };

        let size = match (was_live, inserting_live) {
            (false, true) => self.size + 1,
            (true, false) => self.size - 1,
            _ => self.size,
        };

        let root = self.write_path(branches, leaf)?;
        let next = Btree {
            root,
            size,
            dirt: self.dirt + 1,
            ..self.clone()
        };

        if commit {
            next.commit()
        } else {
            Ok(next)
        }
    }

    /// Emits a header for the current root. All prior appends are synced
    /// before the header is written, and the header is synced before the
    /// commit is reported back.
    pub fn commit(&self) -> Result<Btree> {
        self.store.sync()?;
        write_node(
            &self.store,
            &Node::Header(Header {
                root: self.root,
                size: self.size,
                dirt: self.dirt,
            }),
        )?;
        self.store.sync()?;
        Ok(self.clone())
    }

    fn descend(&self, key: &[u8]) -> Result<Descent> {
        let mut branches = Vec::new();
        let mut offset = self.root;
        loop {
            match &*self.read(offset)? {
                Node::Branch(entries) => {
                    let idx = entries.partition_point(|(k, _)| k.as_slice() <= key);
                    let idx = idx.saturating_sub(1);
                    offset = entries[idx].1;
                    branches.push((entries.clone(), idx));
                }
                Node::Leaf(entries) => {
                    return Ok(Descent {
                        branches,
                        leaf: entries.clone(),
                    })
                }
                _ => {
                    return Err(Error::Corrupted(format!(
                        "expected branch or leaf at offset {offset}"
                    )))
                }
            }
        }
    }

    /// Writes the copied path bottom-up, splitting overflowing nodes, and
    /// returns the offset of the new root.
    fn write_path(&self, branches: Vec<(Vec<Entry>, usize)>, leaf: Vec<Entry>) -> Result<u64> {
        let mut replacement = if leaf.is_empty() {
            // A leaf emptied by a delete keeps its slot; reuse the parent's
            // min key since the leaf no longer has one of its own.
            let offset = write_node(&self.store, &Node::Leaf(leaf))?;
            let min_key = branches
                .last()
                .map(|(entries, idx)| entries[*idx].0.clone())
                .unwrap_or_default();
            vec![(min_key, offset)]
        } else {
            self.write_split(leaf, true)?
        };

        for (mut entries, idx) in branches.into_iter().rev() {
            entries.splice(idx..idx + 1, replacement);
            replacement = self.write_split(entries, false)?;
        }

        if replacement.len() == 1 {
            Ok(replacement[0].1)
        } else {
            write_node(&self.store, &Node::Branch(replacement))
        }
    }

    /// Writes `entries` as one node, or as two when they overflow the order.
    /// Returns the `(min key, offset)` parent entries for what was written.
    fn write_split(&self, mut entries: Vec<Entry>, leaf: bool) -> Result<Vec<Entry>> {
        let make = |entries: Vec<Entry>| {
            if leaf {
                Node::Leaf(entries)
            } else {
                Node::Branch(entries)
            }
        };

        if entries.len() <= self.order {
            let min_key = entries[0].0.clone();
            let offset = write_node(&self.store, &make(entries))?;
            return Ok(vec![(min_key, offset)]);
        }

        let right = entries.split_off(entries.len() / 2);
        let left_min = entries[0].0.clone();
        let right_min = right[0].0.clone();
        let left_offset = write_node(&self.store, &make(entries))?;
        let right_offset = write_node(&self.store, &make(right))?;
        Ok(vec![(left_min, left_offset), (right_min, right_offset)])
    }

    /// Ordered traversal of live entries within the bounds, skipping
    /// tombstones. Lazy: nodes are read as the iterator advances.
    pub fn range(&self, min: Bound<Vec<u8>>, max: Bound<Vec<u8>>, reverse: bool) -> Range {
        Range::new(RawRange::new(
            Arc::clone(&self.store),
            Arc::clone(&self.cache),
            self.root,
            min,
            max,
            reverse,
        ))
    }

    /// Full traversal including tombstones, for compaction catch-up.
    pub fn raw_range(&self) -> RawRange {
        RawRange::new(
            Arc::clone(&self.store),
            Arc::clone(&self.cache),
            self.root,
            Bound::Unbounded,
            Bound::Unbounded,
            false,
        )
    }
}
