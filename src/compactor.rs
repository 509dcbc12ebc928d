//! Background compaction: streams the live entries of a snapshot, in key
//! order, into a fresh store, producing a dense tree with zero dirt.

use std::mem;
use std::ops::Bound;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::btree::node::{write_node, Entry, Node};
use crate::btree::{Btree, NodeCache};
use crate::coordinator::Control;
use crate::error::Result;
use crate::store::Store;

/// Bottom-up bulk loader. Entries must be added in strictly ascending key
/// order; leaves and branches are emitted as they fill, so the loader holds
/// at most one partial node per level.
pub struct BulkLoader {
    store: Arc<Store>,
    order: usize,
    levels: Vec<Vec<Entry>>,
    size: u64,
}

impl BulkLoader {
    pub fn new(store: Arc<Store>, order: usize) -> Self {
        BulkLoader {
            store,
            order,
            levels: Vec::new(),
            size: 0,
        }
    }

    /// Appends a value node and stages its leaf entry.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let ptr = write_node(&self.store, &Node::Value(value.to_vec()))?;
        self.push_entry(0, (key.to_vec(), ptr))?;
        self.size += 1;
        Ok(())
    }

    fn push_entry(&mut self, level: usize, entry: Entry) -> Result<()> {
        if self.levels.len() == level {
            self.levels.push(Vec::new());
        }
        self.levels[level].push(entry);
        if self.levels[level].len() == self.order {
            self.flush_level(level)?;
        }
        Ok(())
    }

    fn flush_level(&mut self, level: usize) -> Result<()> {
        let entries = mem::take(&mut self.levels[level]);
        if entries.is_empty() {
            return Ok(());
        }
        let min_key = entries[0].0.clone();
        let node = if level == 0 {
            Node::Leaf(entries)
        } else {
            Node::Branch(entries)
        };
        let offset = write_node(&self.store, &node)?;
        self.push_entry(level + 1, (min_key, offset))
    }

    /// Flushes the partial levels and returns the root offset and entry
    /// count of the loaded tree.
    pub fn finish(mut self) -> Result<(u64, u64)> {
        if self.size == 0 {
            let root = write_node(&self.store, &Node::Leaf(Vec::new()))?;
            return Ok((root, 0));
        }

        let mut level = 0;
        loop {
            let top = self.levels.len() - 1;
            if level == top && level > 0 && self.levels[level].len() == 1 {
                let (_, root) = self.levels[level].pop().expect("top entry present");
                return Ok((root, self.size));
            }
            self.flush_level(level)?;
            level += 1;
        }
    }
}

/// Runs a full compaction of `snapshot` into `target` and reports the result
/// to the coordinator. The source snapshot is never touched; on failure the
/// target file is simply abandoned for the next compaction's cleanup.
pub(crate) fn spawn(
    snapshot: Btree,
    target: Arc<Store>,
    cache_size: usize,
    control: mpsc::UnboundedSender<Control>,
) {
    tokio::spawn(async move {
        let path = target.path();
        match compact(&snapshot, target, cache_size) {
            Ok(compacted) => {
                tracing::info!(
                    file = %path.display(),
                    entries = compacted.size(),
                    "compaction completed"
                );
                let _ = control.send(Control::CompactionCompleted { compacted });
            }
            Err(error) => {
                tracing::error!(file = %path.display(), error = %error, "compaction failed");
                let _ = control.send(Control::CompactionFailed { error });
            }
        }
    });
}

fn compact(snapshot: &Btree, target: Arc<Store>, cache_size: usize) -> Result<Btree> {
    tracing::debug!(
        source = %snapshot.store().path().display(),
        target = %target.path().display(),
        entries = snapshot.size(),
        "starting compaction"
    );

    let mut loader = BulkLoader::new(Arc::clone(&target), snapshot.order());
    for entry in snapshot.range(Bound::Unbounded, Bound::Unbounded, false) {
        let (key, value) = entry?;
        loader.add(&key, &value)?;
    }
    let (root, size) = loader.finish()?;

    let compacted = Btree::from_parts(
        target,
        Arc::new(NodeCache::new(cache_size)),
        root,
        size,
        0,
        snapshot.order(),
    );
    compacted.commit()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_tree(path: &std::path::Path, order: usize) -> Btree {
        let store = Arc::new(Store::open(path).unwrap());
        Btree::open(store, order, 64).unwrap()
    }

    #[test]
    fn compaction_preserves_contents_and_resets_dirt() {
        let dir = tempfile::tempdir().unwrap();
        let mut tree = open_tree(&dir.path().join("0.cub"), 8);

        for i in 0..500u32 {
            let key = format!("key{i:04}");
            tree = tree
                .insert(key.as_bytes(), format!("v{i}").as_bytes(), true)
                .unwrap();
        }
        // Overwrites and deletes accumulate dirt.
        for i in (0..500u32).step_by(3) {
            let key = format!("key{i:04}");
            tree = tree
                .insert(key.as_bytes(), format!("w{i}").as_bytes(), true)
                .unwrap();
        }
        for i in (0..500u32).step_by(7) {
            tree = tree.delete(format!("key{i:04}").as_bytes(), true).unwrap();
        }
        assert!(tree.dirt_factor() > 0.0);

        let target = Arc::new(Store::open(dir.path().join("1.compact")).unwrap());
        let compacted = compact(&tree, target, 64).unwrap();

        assert_eq!(compacted.size(), tree.size());
        assert_eq!(compacted.dirt(), 0);
        assert_eq!(compacted.dirt_factor(), 0.0);

        for i in 0..500u32 {
            let key = format!("key{i:04}");
            assert_eq!(
                compacted.lookup(key.as_bytes()).unwrap(),
                tree.lookup(key.as_bytes()).unwrap(),
                "mismatch for {key}"
            );
        }

        let source: Vec<_> = tree
            .range(Bound::Unbounded, Bound::Unbounded, false)
            .collect::<Result<Vec<_>>>()
            .unwrap();
        let dense: Vec<_> = compacted
            .range(Bound::Unbounded, Bound::Unbounded, false)
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(source, dense);
    }

    #[test]
    fn tombstones_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut tree = open_tree(&dir.path().join("0.cub"), 4);

        tree = tree.insert(b"a", b"1", true).unwrap();
        tree = tree.insert(b"b", b"2", true).unwrap();
        tree = tree.mark_deleted(b"a", true).unwrap();

        let target = Arc::new(Store::open(dir.path().join("1.compact")).unwrap());
        let compacted = compact(&tree, target, 0).unwrap();

        assert_eq!(compacted.size(), 1);
        let raw: Vec<_> = compacted
            .raw_range()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(raw.len(), 1);
        assert_eq!(raw[0].0, b"b".to_vec());
    }

    #[test]
    fn empty_snapshot_compacts_to_empty_tree() {
        let dir = tempfile::tempdir().unwrap();
        let tree = open_tree(&dir.path().join("0.cub"), 4);

        let target = Arc::new(Store::open(dir.path().join("1.compact")).unwrap());
        let compacted = compact(&tree, target, 0).unwrap();
        assert_eq!(compacted.size(), 0);
        assert_eq!(compacted.lookup(b"anything").unwrap(), None);
    }

    #[test]
    fn bulk_loaded_tree_is_reopenable() {
        let dir = tempfile::tempdir().unwrap();
        let mut tree = open_tree(&dir.path().join("0.cub"), 4);
        for i in 0..100u32 {
            tree = tree
                .insert(format!("k{i:03}").as_bytes(), b"v", true)
                .unwrap();
        }

        let target_path = dir.path().join("1.compact");
        let target = Arc::new(Store::open(&target_path).unwrap());
        let compacted = compact(&tree, target, 0).unwrap();
        drop(compacted);

        let reopened = open_tree(&target_path, 4);
        assert_eq!(reopened.size(), 100);
        assert_eq!(reopened.dirt(), 0);
        assert_eq!(reopened.lookup(b"k050").unwrap(), Some(b"v".to_vec()));
    }
}
