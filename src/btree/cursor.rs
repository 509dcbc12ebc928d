//! Lazy ordered traversal over a tree snapshot.
//!
//! The cursor keeps a stack of `(node entries, position)` frames. Advancing
//! pops exhausted frames and descends into the next child, so a select over
//! a large range streams entries without materializing the result. Frames
//! are seeded against the near bound at creation; the far bound terminates
//! the scan at the first out-of-range leaf entry.

use std::ops::Bound;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::store::Store;

use super::node::{Entry, Node};
use super::{read_cached, NodeCache};

/// A leaf entry's target: decoded value bytes, or a tombstone.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueRef {
    Live(Vec<u8>),
    Tombstone,
}

struct Frame {
    entries: Vec<Entry>,
    leaf: bool,
    pos: usize,
}

/// Ordered traversal including tombstones.
pub struct RawRange {
    store: Arc<Store>,
    cache: Arc<NodeCache>,
    root: u64,
    min: Bound<Vec<u8>>,
    max: Bound<Vec<u8>>,
    reverse: bool,
    frames: Vec<Frame>,
    started: bool,
    done: bool,
}

impl RawRange {
    pub(crate) fn new(
        store: Arc<Store>,
        cache: Arc<NodeCache>,
        root: u64,
        min: Bound<Vec<u8>>,
        max: Bound<Vec<u8>>,
        reverse: bool,
    ) -> Self {
        RawRange {
            store,
            cache,
            root,
            min,
            max,
            reverse,
            frames: Vec::new(),
            started: false,
            done: false,
        }
    }

    fn make_frame(&self, offset: u64) -> Result<Frame> {
        let node = read_cached(&self.store, &self.cache, offset)?;
        let (mut entries, leaf) = match &*node {
            Node::Leaf(entries) => (entries.clone(), true),
            Node::Branch(entries) => (entries.clone(), false),
            _ => {
                return Err(Error::Corrupted(format!(
                    "expected branch or leaf at offset {offset}"
                )))
            }
        };
        if self.reverse {
            entries.reverse();
        }
        let pos = self.seek_pos(&entries, leaf);
        Ok(Frame { entries, leaf, pos })
    }

    /// Number of leading entries that lie entirely before the near bound.
    fn seek_pos(&self, entries: &[Entry], leaf: bool) -> usize {
        if !self.reverse {
            match (&self.min, leaf) {
                (Bound::Unbounded, _) => 0,
                (Bound::Included(m), true) => {
                    entries.partition_point(|(k, _)| k.as_slice() < m.as_slice())
                }
                (Bound::Excluded(m), true) => {
                    entries.partition_point(|(k, _)| k.as_slice() <= m.as_slice())
                }
                // A child whose min key is <= the bound may still contain
                // entries in range; start at the last such child.
                (Bound::Included(m) | Bound::Excluded(m), false) => entries
                    .partition_point(|(k, _)| k.as_slice() <= m.as_slice())
                    .saturating_sub(1),
            }
        } else {
            // Entries are reversed: descending order.
            match (&self.max, leaf) {
                (Bound::Unbounded, _) => 0,
                (Bound::Included(m), true) => {
                    entries.partition_point(|(k, _)| k.as_slice() > m.as_slice())
                }
                (Bound::Excluded(m), true) => {
                    entries.partition_point(|(k, _)| k.as_slice() >= m.as_slice())
                }
                (Bound::Included(m), false) => {
                    entries.partition_point(|(k, _)| k.as_slice() > m.as_slice())
                }
                (Bound::Excluded(m), false) => {
                    entries.partition_point(|(k, _)| k.as_slice() >= m.as_slice())
                }
            }
        }
    }

    fn past_far_bound(&self, key: &[u8]) -> bool {
        if !self.reverse {
            match &self.max {
                Bound::Unbounded => false,
                Bound::Included(m) => key > m.as_slice(),
                Bound::Excluded(m) => key >= m.as_slice(),
            }
        } else {
            match &self.min {
                Bound::Unbounded => false,
                Bound::Included(m) => key < m.as_slice(),
                Bound::Excluded(m) => key <= m.as_slice(),
            }
        }
    }

    fn advance(&mut self) -> Result<Option<(Vec<u8>, ValueRef)>> {
        if !self.started {
            self.started = true;
            let frame = self.make_frame(self.root)?;
            self.frames.push(frame);
        }

        loop {
            let Some(frame) = self.frames.last_mut() else {
                self.done = true;
                return Ok(None);
            };
            if frame.pos >= frame.entries.len() {
                self.frames.pop();
                continue;
            }

            let (key, ptr) = frame.entries[frame.pos].clone();
            frame.pos += 1;

            if frame.leaf {
                if self.past_far_bound(&key) {
                    self.done = true;
                    return Ok(None);
                }
                let value = match &*read_cached(&self.store, &self.cache, ptr)? {
                    Node::Value(bytes) => ValueRef::Live(bytes.clone()),
                    Node::Deleted => ValueRef::Tombstone,
                    _ => {
                        return Err(Error::Corrupted(format!(
                            "expected value or tombstone at offset {ptr}"
                        )))
                    }
                };
                return Ok(Some((key, value)));
            }

            let child = self.make_frame(ptr)?;
            self.frames.push(child);
        }
    }
}

impl Iterator for RawRange {
    type Item = Result<(Vec<u8>, ValueRef)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.advance() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => None,
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Ordered traversal of live entries; tombstones are skipped.
pub struct Range(RawRange);

impl Range {
    pub(crate) fn new(inner: RawRange) -> Self {
        Range(inner)
    }
}

impl Iterator for Range {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.0.next()? {
                Ok((key, ValueRef::Live(value))) => return Some(Ok((key, value))),
                Ok((_, ValueRef::Tombstone)) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::Btree;

    fn build_tree(order: usize, n: u32) -> (tempfile::TempDir, Btree) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("0.cub")).unwrap());
        let mut tree = Btree::open(store, order, 64).unwrap();
        for i in 0..n {
            tree = tree
                .insert(format!("k{i:04}").as_bytes(), format!("v{i}").as_bytes(), true)
                .unwrap();
        }
        (dir, tree)
    }

    fn keys(entries: &[(Vec<u8>, Vec<u8>)]) -> Vec<String> {
        entries
            .iter()
            .map(|(k, _)| String::from_utf8(k.clone()).unwrap())
            .collect()
    }

    #[test]
    fn full_scan_in_order() {
        let (_dir, tree) = build_tree(4, 50);
        let entries: Vec<_> = tree
            .range(Bound::Unbounded, Bound::Unbounded, false)
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(entries.len(), 50);
        let ks = keys(&entries);
        let mut sorted = ks.clone();
        sorted.sort();
        assert_eq!(ks, sorted);
    }

    #[test]
    fn reverse_scan() {
        let (_dir, tree) = build_tree(4, 50);
        let forward: Vec<_> = tree
            .range(Bound::Unbounded, Bound::Unbounded, false)
            .collect::<Result<Vec<_>>>()
            .unwrap();
        let mut backward: Vec<_> = tree
            .range(Bound::Unbounded, Bound::Unbounded, true)
            .collect::<Result<Vec<_>>>()
            .unwrap();
        backward.reverse();
        assert_eq!(forward, backward);
    }

    #[test]
    fn inclusive_and_exclusive_bounds() {
        let (_dir, tree) = build_tree(4, 20);

        let entries: Vec<_> = tree
            .range(
                Bound::Included(b"k0005".to_vec()),
                Bound::Included(b"k0010".to_vec()),
                false,
            )
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(
            keys(&entries),
            vec!["k0005", "k0006", "k0007", "k0008", "k0009", "k0010"]
        );

        let entries: Vec<_> = tree
            .range(
                Bound::Excluded(b"k0005".to_vec()),
                Bound::Excluded(b"k0010".to_vec()),
                false,
            )
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(keys(&entries), vec!["k0006", "k0007", "k0008", "k0009"]);
    }

    #[test]
    fn reverse_respects_bounds() {
        let (_dir, tree) = build_tree(4, 20);

        let entries: Vec<_> = tree
            .range(
                Bound::Included(b"k0005".to_vec()),
                Bound::Excluded(b"k0008".to_vec()),
                true,
            )
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(keys(&entries), vec!["k0007", "k0006", "k0005"]);
    }

    #[test]
    fn bounds_between_keys() {
        let (_dir, tree) = build_tree(4, 10);

        // Bounds that match no key exactly.
        let entries: Vec<_> = tree
            .range(
                Bound::Included(b"k0003x".to_vec()),
                Bound::Included(b"k0006x".to_vec()),
                false,
            )
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(keys(&entries), vec!["k0004", "k0005", "k0006"]);
    }

    #[test]
    fn empty_range() {
        let (_dir, tree) = build_tree(4, 10);
        let entries: Vec<_> = tree
            .range(
                Bound::Included(b"x".to_vec()),
                Bound::Included(b"z".to_vec()),
                false,
            )
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert!(entries.is_empty());
    }
}
