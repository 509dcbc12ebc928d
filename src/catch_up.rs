//! Catch-up: after a compaction finishes, the live tree may have advanced
//! past the snapshot the compactor consumed. A catch-up pass replays the
//! difference between the live tree and that snapshot onto the compacted
//! tree, committing once at the end. The coordinator keeps scheduling passes
//! (advancing the diff base each round) until a pass lands exactly on the
//! live root.

use tokio::sync::mpsc;

use crate::btree::{Btree, ValueRef};
use crate::coordinator::Control;
use crate::error::Result;

pub(crate) fn spawn(
    compacted: Btree,
    original: Btree,
    latest: Btree,
    control: mpsc::UnboundedSender<Control>,
) {
    tokio::spawn(async move {
        match catch_up(&compacted, &original, &latest) {
            Ok(caught_up) => {
                let _ = control.send(Control::CatchUpCompleted {
                    compacted: caught_up,
                    latest,
                });
            }
            Err(error) => {
                tracing::error!(error = %error, "catch-up failed");
                let _ = control.send(Control::CatchUpFailed { error });
            }
        }
    });
}

/// Applies to `compacted` every entry of `latest` that differs from
/// `original` (the snapshot the previous round was built from): changed or
/// new values are re-inserted, tombstones written during the compaction
/// window become deletions.
fn catch_up(compacted: &Btree, original: &Btree, latest: &Btree) -> Result<Btree> {
    let mut tree = compacted.clone();
    let mut changed = false;

    for entry in latest.raw_range() {
        let (key, value) = entry?;
        if original.raw_lookup(&key)?.as_ref() == Some(&value) {
            continue;
        }
        tree = match value {
            ValueRef::Live(bytes) => tree.insert(&key, &bytes, false)?,
            ValueRef::Tombstone => tree.delete(&key, false)?,
        };
        changed = true;
    }

    if !changed {
        return Ok(compacted.clone());
    }

    tracing::debug!(
        target = %tree.store().path().display(),
        "catch-up pass applied divergent entries"
    );
    tree.commit()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use std::ops::Bound;
    use std::sync::Arc;

    fn open_tree(path: &std::path::Path) -> Btree {
        let store = Arc::new(Store::open(path).unwrap());
        Btree::open(store, 4, 0).unwrap()
    }

    fn compact_into(snapshot: &Btree, path: &std::path::Path) -> Btree {
        let target = Arc::new(Store::open(path).unwrap());
        let mut loader = crate::compactor::BulkLoader::new(Arc::clone(&target), snapshot.order());
        for entry in snapshot.range(Bound::Unbounded, Bound::Unbounded, false) {
            let (key, value) = entry.unwrap();
            loader.add(&key, &value).unwrap();
        }
        let (root, size) = loader.finish().unwrap();
        Btree::from_parts(
            target,
            Arc::new(crate::btree::NodeCache::new(0)),
            root,
            size,
            0,
            snapshot.order(),
        )
        .commit()
        .unwrap()
    }

    fn entries(tree: &Btree) -> Vec<(Vec<u8>, Vec<u8>)> {
        tree.range(Bound::Unbounded, Bound::Unbounded, false)
            .collect::<Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn replays_writes_made_during_compaction() {
        let dir = tempfile::tempdir().unwrap();
        let mut tree = open_tree(&dir.path().join("0.cub"));
        for i in 0..50u32 {
            tree = tree
                .insert(format!("k{i:02}").as_bytes(), b"old", true)
                .unwrap();
        }

        // Compaction runs off this snapshot.
        let original = tree.clone();
        let compacted = compact_into(&original, &dir.path().join("1.compact"));

        // Meanwhile the live tree advances: an update, an insert, and a
        // deletion written as a tombstone so the snapshot diff observes it.
        let mut latest = tree;
        latest = latest.insert(b"k10", b"new", true).unwrap();
        latest = latest.insert(b"zz", b"fresh", true).unwrap();
        latest = latest.mark_deleted(b"k20", true).unwrap();

        let caught_up = catch_up(&compacted, &original, &latest).unwrap();

        assert_eq!(entries(&caught_up), entries(&latest));
        assert_eq!(caught_up.size(), latest.size());
        assert_eq!(caught_up.lookup(b"k10").unwrap(), Some(b"new".to_vec()));
        assert_eq!(caught_up.lookup(b"zz").unwrap(), Some(b"fresh".to_vec()));
        assert_eq!(caught_up.lookup(b"k20").unwrap(), None);
    }

    #[test]
    fn no_divergence_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let mut tree = open_tree(&dir.path().join("0.cub"));
        for i in 0..10u32 {
            tree = tree
                .insert(format!("k{i}").as_bytes(), b"v", true)
                .unwrap();
        }

        let compacted = compact_into(&tree, &dir.path().join("1.compact"));
        let caught_up = catch_up(&compacted, &tree, &tree).unwrap();

        assert_eq!(caught_up.root(), compacted.root());
        assert_eq!(caught_up.dirt(), 0);
    }

    #[test]
    fn second_round_only_applies_new_divergence() {
        let dir = tempfile::tempdir().unwrap();
        let mut tree = open_tree(&dir.path().join("0.cub"));
        for i in 0..10u32 {
            tree = tree
                .insert(format!("k{i}").as_bytes(), b"v", true)
                .unwrap();
        }

        let original = tree.clone();
        let compacted = compact_into(&original, &dir.path().join("1.compact"));

        // Round one: a write landed during compaction.
        let latest1 = original.insert(b"k3", b"changed", true).unwrap();
        let round1 = catch_up(&compacted, &original, &latest1).unwrap();
        let dirt_after_round1 = round1.dirt();

        // Round two: another write landed during round one. The diff base
        // advances to latest1, so only the new write is replayed.
        let latest2 = latest1.insert(b"k7", b"also changed", true).unwrap();
        let round2 = catch_up(&round1, &latest1, &latest2).unwrap();

        assert_eq!(round2.dirt(), dirt_after_round1 + 1);
        assert_eq!(entries(&round2), entries(&latest2));
    }
}
