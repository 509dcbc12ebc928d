//! The coordinator: single-threaded authority over the current tree and all
//! background lifecycles. Commands arrive over a mailbox and are handled to
//! completion, one at a time; reads are dispatched to reader tasks without
//! blocking the mailbox, and compaction, catch-up, and cleanup report back
//! over a control channel.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};

use crate::btree::Btree;
use crate::clean_up::{self, CleanUpJob};
use crate::config::AutoCompact;
use crate::error::{Error, Result};
use crate::flock::FileLock;
use crate::reader::ReadTask;
use crate::store::{file_path, parse_file_id, Store, COMPACTION_SUFFIX, DATA_SUFFIX};
use crate::{catch_up, compactor, reader};

/// Lifecycle notifications, delivered to subscribers on a best-effort
/// broadcast channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    CompactionStarted,
    CompactionCompleted,
    CatchUpCompleted,
    CleanUpStarted,
}

type Reply<T> = oneshot::Sender<Result<T>>;

/// Writes returned by a transaction function: puts are applied first, in the
/// given order, then deletes.
pub(crate) struct TxWrites {
    pub puts: Vec<(Vec<u8>, Vec<u8>)>,
    pub deletes: Vec<Vec<u8>>,
}

pub(crate) type TxFunc =
    Box<dyn FnOnce(&BTreeMap<Vec<u8>, Vec<u8>>) -> Result<TxWrites> + Send>;

pub(crate) enum Command {
    Read { task: ReadTask },
    Put { key: Vec<u8>, value: Vec<u8>, reply: Reply<()> },
    Delete { key: Vec<u8>, reply: Reply<()> },
    Transact { keys: Vec<Vec<u8>>, func: TxFunc, reply: Reply<()> },
    Compact { reply: Reply<()> },
    SetAutoCompact { policy: AutoCompact, reply: Reply<()> },
    Size { reply: Reply<u64> },
    DirtFactor { reply: Reply<f64> },
    Path { reply: Reply<PathBuf> },
    Subscribe { reply: Reply<broadcast::Receiver<Event>> },
}

/// Results reported by background tasks.
pub(crate) enum Control {
    CompactionCompleted { compacted: Btree },
    CompactionFailed { error: Error },
    CatchUpCompleted { compacted: Btree, latest: Btree },
    CatchUpFailed { error: Error },
    ReaderDone { path: PathBuf },
}

/// Compaction in flight: `original` is the snapshot the running pass diffs
/// against (the compactor's input, advanced after each catch-up round), and
/// `target` the file being written, which cleanup must spare.
struct CompactionState {
    original: Btree,
    target: PathBuf,
}

pub(crate) struct Coordinator {
    current: Btree,
    dir: PathBuf,
    cache_size: usize,
    auto_compact: AutoCompact,
    compaction: Option<CompactionState>,
    cleanup: mpsc::UnboundedSender<CleanUpJob>,
    cleanup_pending: bool,
    busy_files: HashMap<PathBuf, usize>,
    events: broadcast::Sender<Event>,
    control: mpsc::UnboundedSender<Control>,
    _lock: FileLock,
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        current: Btree,
        dir: PathBuf,
        cache_size: usize,
        auto_compact: AutoCompact,
        cleanup: mpsc::UnboundedSender<CleanUpJob>,
        events: broadcast::Sender<Event>,
        control: mpsc::UnboundedSender<Control>,
        lock: FileLock,
    ) -> Self {
        Coordinator {
            current,
            dir,
            cache_size,
            auto_compact,
            compaction: None,
            cleanup,
            cleanup_pending: false,
            busy_files: HashMap::new(),
            events,
            control,
            _lock: lock,
        }
    }

    /// Event loop. Runs until every database handle is dropped; control
    /// messages are drained first so reader check-outs and compaction
    /// results are never starved by the command stream.
    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut control: mpsc::UnboundedReceiver<Control>,
    ) {
        loop {
            tokio::select! {
                biased;
                Some(message) = control.recv() => self.handle_control(message),
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
            }
        }
        tracing::debug!(dir = %self.dir.display(), "coordinator stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Read { task } => {
                self.check_in(self.current.store().path());
                reader::spawn(self.current.clone(), task, self.control.clone());
            }
            Command::Put { key, value, reply } => {
                let result = match self.current.insert(&key, &value, true) {
                    Ok(tree) => {
                        self.current = tree;
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let ok = result.is_ok();
                let _ = reply.send(result);
                if ok {
                    self.maybe_auto_compact();
                }
            }
            Command::Delete { key, reply } => {
                // While a compaction consumes a snapshot of this file, the
                // deletion must stay visible to it as a tombstone.
                let result = if self.compaction.is_some() {
                    self.current.mark_deleted(&key, true)
                } else {
                    self.current.delete(&key, true)
                };
                let result = match result {
                    Ok(tree) => {
                        self.current = tree;
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let ok = result.is_ok();
                let _ = reply.send(result);
                if ok {
                    self.maybe_auto_compact();
                }
            }
            Command::Transact { keys, func, reply } => {
                let result = self.transact(keys, func);
                let ok = result.is_ok();
                let _ = reply.send(result);
                if ok {
                    self.maybe_auto_compact();
                }
            }
            Command::Compact { reply } => {
                let _ = reply.send(self.start_compaction());
            }
            Command::SetAutoCompact { policy, reply } => {
                let result = policy.validate().map(|()| {
                    self.auto_compact = policy;
                });
                let _ = reply.send(result);
            }
            Command::Size { reply } => {
                let _ = reply.send(Ok(self.current.size()));
            }
            Command::DirtFactor { reply } => {
                let _ = reply.send(Ok(self.current.dirt_factor()));
            }
            Command::Path { reply } => {
                let _ = reply.send(Ok(self.current.store().path()));
            }
            Command::Subscribe { reply } => {
                let _ = reply.send(Ok(self.events.subscribe()));
            }
        }
    }

    fn handle_control(&mut self, message: Control) {
        match message {
            Control::CompactionCompleted { compacted } => {
                let _ = self.events.send(Event::CompactionCompleted);
                let Some(state) = &self.compaction else {
                    return;
                };
                catch_up::spawn(
                    compacted,
                    state.original.clone(),
                    self.current.clone(),
                    self.control.clone(),
                );
            }
            Control::CompactionFailed { error } => {
                tracing::warn!(error = %error, "compaction abandoned");
                self.compaction = None;
            }
            Control::CatchUpCompleted { compacted, latest } => {
                if self.compaction.is_none() {
                    return;
                }
                if latest.root() == self.current.root() {
                    self.promote(compacted);
                } else {
                    // More writes landed during the pass; diff the next
                    // round against what this one already covered.
                    catch_up::spawn(
                        compacted,
                        latest,
                        self.current.clone(),
                        self.control.clone(),
                    );
                }
            }
            Control::CatchUpFailed { error } => {
                tracing::warn!(error = %error, "catch-up abandoned");
                self.compaction = None;
            }
            Control::ReaderDone { path } => {
                self.check_out(&path);
                if self.cleanup_pending && !self.any_busy_non_current() {
                    self.dispatch_cleanup();
                }
            }
        }
    }

    /// The compacted tree has caught up with the live one: promote it. The
    /// target file is renamed to a database file, the coordinator swaps its
    /// current tree, and obsolete files are cleaned once no reader holds
    /// them.
    fn promote(&mut self, compacted: Btree) {
        let compact_path = compacted.store().path();
        let id = match parse_file_id(&compact_path, COMPACTION_SUFFIX) {
            Some(id) => id,
            None => {
                tracing::error!(file = %compact_path.display(), "malformed compaction file name");
                self.compaction = None;
                return;
            }
        };
        let data_path = file_path(&self.dir, id, DATA_SUFFIX);
        if let Err(error) = compacted.store().rename(&data_path) {
            tracing::error!(error = %error, "failed to promote compacted file");
            self.compaction = None;
            return;
        }

        tracing::info!(
            file = %data_path.display(),
            entries = compacted.size(),
            "switched to compacted data file"
        );
        self.current = compacted;
        self.compaction = None;
        let _ = self.events.send(Event::CatchUpCompleted);

        if self.any_busy_non_current() {
            // Some reader is still scanning the old file; the last check-out
            // triggers the cleanup.
            self.cleanup_pending = true;
        } else {
            self.dispatch_cleanup();
        }
    }

    fn transact(&mut self, keys: Vec<Vec<u8>>, func: TxFunc) -> Result<()> {
        let mut found = BTreeMap::new();
        for key in keys {
            if let Some(value) = self.current.lookup(&key)? {
                found.insert(key, value);
            }
        }

        let writes = func(&found)?;

        let mut tree = self.current.clone();
        for (key, value) in writes.puts {
            tree = tree.insert(&key, &value, false)?;
        }
        for key in writes.deletes {
            tree = if self.compaction.is_some() {
                tree.mark_deleted(&key, false)?
            } else {
                tree.delete(&key, false)?
            };
        }

        // A single commit publishes the whole transaction; on failure the
        // coordinator keeps the previous tree and nothing becomes visible.
        self.current = tree.commit()?;
        Ok(())
    }

    fn start_compaction(&mut self) -> Result<()> {
        if self.compaction.is_some() {
            return Err(Error::PendingCompaction);
        }

        let id = next_file_id(&self.dir)?;
        let target_path = file_path(&self.dir, id, COMPACTION_SUFFIX);
        let target = Arc::new(Store::open(&target_path)?);

        match clean_up::obsolete_compaction_files(&self.dir, &target_path) {
            Ok(files) if !files.is_empty() => {
                let _ = self.cleanup.send(CleanUpJob { files });
            }
            Ok(_) => {}
            Err(error) => {
                tracing::warn!(error = %error, "failed to list stale compaction files");
            }
        }

        compactor::spawn(
            self.current.clone(),
            target,
            self.cache_size,
            self.control.clone(),
        );
        self.compaction = Some(CompactionState {
            original: self.current.clone(),
            target: target_path,
        });
        let _ = self.events.send(Event::CompactionStarted);
        Ok(())
    }

    fn maybe_auto_compact(&mut self) {
        let AutoCompact::On { min_writes, min_dirt_factor } = self.auto_compact else {
            return;
        };
        if self.compaction.is_some()
            || self.current.dirt() < min_writes
            || self.current.dirt_factor() < min_dirt_factor
        {
            return;
        }
        if let Err(error) = self.start_compaction() {
            tracing::warn!(error = %error, "auto-compaction failed to start");
        }
    }

    fn check_in(&mut self, path: PathBuf) {
        *self.busy_files.entry(path).or_insert(0) += 1;
    }

    fn check_out(&mut self, path: &Path) {
        if let Some(count) = self.busy_files.get_mut(path) {
            *count -= 1;
            if *count == 0 {
                self.busy_files.remove(path);
            }
        }
    }

    fn any_busy_non_current(&self) -> bool {
        let current = self.current.store().path();
        self.busy_files
            .iter()
            .any(|(path, count)| *count > 0 && *path != current)
    }

    fn dispatch_cleanup(&mut self) {
        self.cleanup_pending = false;

        let mut keep = vec![self.current.store().path()];
        if let Some(state) = &self.compaction {
            keep.push(state.target.clone());
        }
        match clean_up::obsolete_data_files(&self.dir, &keep) {
            Ok(files) if !files.is_empty() => {
                let _ = self.events.send(Event::CleanUpStarted);
                let _ = self.cleanup.send(CleanUpJob { files });
            }
            Ok(_) => {}
            Err(error) => {
                tracing::warn!(error = %error, "failed to list obsolete data files");
            }
        }
    }
}

/// Picks the next data file id: strictly greater than any existing database
/// or compaction file in the directory.
fn next_file_id(dir: &Path) -> Result<u64> {
    let mut max_id = None;
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let id = parse_file_id(&path, DATA_SUFFIX)
            .or_else(|| parse_file_id(&path, COMPACTION_SUFFIX));
        if let Some(id) = id {
            max_id = Some(max_id.map_or(id, |m: u64| m.max(id)));
        }
    }
    Ok(max_id.map_or(0, |m| m + 1))
}

/// Finds the data file holding the newest committed tree, if any.
pub(crate) fn newest_data_file(dir: &Path) -> Result<Option<PathBuf>> {
    let mut newest: Option<(u64, PathBuf)> = None;
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if let Some(id) = parse_file_id(&path, DATA_SUFFIX) {
            if newest.as_ref().map_or(true, |(max, _)| id > *max) {
                newest = Some((id, path));
            }
        }
    }
    Ok(newest.map(|(_, path)| path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_id_selection() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(next_file_id(dir.path()).unwrap(), 0);
        assert_eq!(newest_data_file(dir.path()).unwrap(), None);

        for name in ["0.cub", "a.cub", "2a.cub", "1f.compact", "junk.txt"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }

        // 0x2a is the largest database or compaction id.
        assert_eq!(next_file_id(dir.path()).unwrap(), 0x2b);
        assert_eq!(
            newest_data_file(dir.path()).unwrap(),
            Some(dir.path().join("2a.cub"))
        );
    }
}
