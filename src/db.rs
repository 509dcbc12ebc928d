//! Public database handle.
//!
//! `Database<K, V>` is a cheap-to-clone handle over the coordinator task.
//! Keys and values are encoded at this layer (order-preserving keycode for
//! keys, bincode for values); the engine underneath operates on opaque byte
//! strings. Every operation sends a typed command to the coordinator and
//! awaits the reply under the configured deadline.

use std::marker::PhantomData;
use std::ops::{Bound, RangeBounds};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};

use crate::btree::Btree;
use crate::clean_up;
use crate::config::{AutoCompact, Config};
use crate::coordinator::{newest_data_file, Command, Coordinator, Event, TxWrites};
use crate::encoding::{Key, Value};
use crate::error::{Error, Result};
use crate::flock::FileLock;
use crate::reader::{PipeOp, ReadTask, SelectQuery};
use crate::store::{file_path, Store, DATA_SUFFIX};

const LOCK_FILE: &str = "emberdb.lock";

enum TypedOp<K, V> {
    Filter(Box<dyn FnMut(&K, &V) -> bool + Send>),
    Map(Box<dyn FnMut(K, V) -> (K, V) + Send>),
    Take(usize),
    Skip(usize),
    TakeWhile(Box<dyn FnMut(&K, &V) -> bool + Send>),
    SkipWhile(Box<dyn FnMut(&K, &V) -> bool + Send>),
}

/// Options for an ordered range select: bounds, direction, and a pipeline of
/// operations applied lazily, in the given order, to the streamed entries.
pub struct SelectOptions<K, V> {
    min: Bound<K>,
    max: Bound<K>,
    reverse: bool,
    ops: Vec<TypedOp<K, V>>,
}

impl<K: Key, V: Value> Default for SelectOptions<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Key, V: Value> SelectOptions<K, V> {
    pub fn new() -> Self {
        SelectOptions {
            min: Bound::Unbounded,
            max: Bound::Unbounded,
            reverse: false,
            ops: Vec::new(),
        }
    }

    /// Restrict the scan to the given key range.
    pub fn range(mut self, range: impl RangeBounds<K>) -> Self {
        self.min = clone_bound(range.start_bound());
        self.max = clone_bound(range.end_bound());
        self
    }

    /// Iterate in descending key order.
    pub fn reverse(mut self) -> Self {
        self.reverse = true;
        self
    }

    pub fn filter(mut self, f: impl FnMut(&K, &V) -> bool + Send + 'static) -> Self {
        self.ops.push(TypedOp::Filter(Box::new(f)));
        self
    }

    pub fn map(mut self, f: impl FnMut(K, V) -> (K, V) + Send + 'static) -> Self {
        self.ops.push(TypedOp::Map(Box::new(f)));
        self
    }

    pub fn take(mut self, n: usize) -> Self {
        self.ops.push(TypedOp::Take(n));
        self
    }

    pub fn skip(mut self, n: usize) -> Self {
        self.ops.push(TypedOp::Skip(n));
        self
    }

    pub fn take_while(mut self, f: impl FnMut(&K, &V) -> bool + Send + 'static) -> Self {
        self.ops.push(TypedOp::TakeWhile(Box::new(f)));
        self
    }

    pub fn skip_while(mut self, f: impl FnMut(&K, &V) -> bool + Send + 'static) -> Self {
        self.ops.push(TypedOp::SkipWhile(Box::new(f)));
        self
    }

    /// Lowers the typed options onto the byte-level engine.
    fn into_query(self) -> SelectQuery {
        let ops = self
            .ops
            .into_iter()
            .map(|op| match op {
                TypedOp::Filter(mut f) => PipeOp::Filter(decode_pred(move |k, v| f(k, v))),
                TypedOp::Map(mut f) => PipeOp::Map(Box::new(move |k, v| {
                    let (k, v) = f(K::decode(&k)?, V::decode(&v)?);
                    Ok((k.encode(), v.encode()))
                })),
                TypedOp::Take(n) => PipeOp::Take(n),
                TypedOp::Skip(n) => PipeOp::Skip(n),
                TypedOp::TakeWhile(mut f) => PipeOp::TakeWhile(decode_pred(move |k, v| f(k, v))),
                TypedOp::SkipWhile(mut f) => {
                    PipeOp::SkipWhile(decode_pred(move |k, v| f(k, v)), true)
                }
            })
            .collect();

        SelectQuery {
            min: encode_bound(self.min),
            max: encode_bound(self.max),
            reverse: self.reverse,
            ops,
        }
    }
}

fn decode_pred<K: Key, V: Value>(
    mut f: impl FnMut(&K, &V) -> bool + Send + 'static,
) -> Box<dyn FnMut(&[u8], &[u8]) -> Result<bool> + Send> {
    Box::new(move |k, v| Ok(f(&K::decode(k)?, &V::decode(v)?)))
}

fn clone_bound<K: Clone>(bound: Bound<&K>) -> Bound<K> {
    match bound {
        Bound::Included(k) => Bound::Included(k.clone()),
        Bound::Excluded(k) => Bound::Excluded(k.clone()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

fn encode_bound<K: Key>(bound: Bound<K>) -> Bound<Vec<u8>> {
    match bound {
        Bound::Included(k) => Bound::Included(k.encode()),
        Bound::Excluded(k) => Bound::Excluded(k.encode()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

/// An embedded key-value database handle. Clones share the same underlying
/// coordinator; the database shuts down when the last handle is dropped.
pub struct Database<K, V> {
    commands: mpsc::Sender<Command>,
    timeout: Duration,
    _marker: PhantomData<fn(K, V) -> (K, V)>,
}

impl<K, V> Clone for Database<K, V> {
    fn clone(&self) -> Self {
        Database {
            commands: self.commands.clone(),
            timeout: self.timeout,
            _marker: PhantomData,
        }
    }
}

impl<K: Key, V: Value> Database<K, V> {
    /// Opens the database in `config.dir`, creating the directory and an
    /// initial data file as needed. The newest committed data file is
    /// recovered; orphan compaction files are left for the next compaction's
    /// cleanup.
    pub async fn open(config: Config) -> Result<Database<K, V>> {
        config.validate()?;
        std::fs::create_dir_all(&config.dir)?;

        let lock = FileLock::lock(config.dir.join(LOCK_FILE))
            .map_err(|e| Error::Locked(e.to_string()))?;

        let path = newest_data_file(&config.dir)?
            .unwrap_or_else(|| file_path(&config.dir, 0, DATA_SUFFIX));
        let store = Arc::new(Store::open(&path)?);
        let current = Btree::open(store, config.btree_order, config.node_cache_size)?;

        tracing::info!(
            dir = %config.dir.display(),
            file = %path.display(),
            entries = current.size(),
            "opened database"
        );

        let cleanup = clean_up::spawn(config.dir.clone());
        let (events, _) = broadcast::channel(64);
        let (command_tx, command_rx) = mpsc::channel(64);
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let coordinator = Coordinator::new(
            current,
            config.dir.clone(),
            config.node_cache_size,
            config.auto_compact,
            cleanup,
            events,
            control_tx,
            lock,
        );
        tokio::spawn(coordinator.run(command_rx, control_rx));

        Ok(Database {
            commands: command_tx,
            timeout: config.op_timeout,
            _marker: PhantomData,
        })
    }

    async fn call<T>(&self, build: impl FnOnce(oneshot::Sender<Result<T>>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        let command = build(reply);
        let exchange = async {
            self.commands
                .send(command)
                .await
                .map_err(|_| Error::Closed)?;
            rx.await.map_err(|_| Error::Closed)?
        };
        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| Error::Timeout)?
    }

    /// Returns the value for `key`, or `None` when absent.
    pub async fn get(&self, key: &K) -> Result<Option<V>> {
        let key = key.encode();
        let bytes = self
            .call(|reply| Command::Read {
                task: ReadTask::Get { key, reply },
            })
            .await?;
        bytes.map(|b| V::decode(&b)).transpose()
    }

    /// Returns the value for `key`, or `default` when absent.
    pub async fn get_or(&self, key: &K, default: V) -> Result<V> {
        Ok(self.get(key).await?.unwrap_or(default))
    }

    /// Returns the value for `key`, failing with `NotFound` when absent.
    pub async fn fetch(&self, key: &K) -> Result<V> {
        self.get(key).await?.ok_or(Error::NotFound)
    }

    pub async fn has_key(&self, key: &K) -> Result<bool> {
        let key = key.encode();
        self.call(|reply| Command::Read {
            task: ReadTask::Has { key, reply },
        })
        .await
    }

    pub async fn put(&self, key: K, value: V) -> Result<()> {
        let key = key.encode();
        let value = value.encode();
        self.call(|reply| Command::Put { key, value, reply }).await
    }

    pub async fn delete(&self, key: &K) -> Result<()> {
        let key = key.encode();
        self.call(|reply| Command::Delete { key, reply }).await
    }

    /// Atomically updates `key`: when present, the stored value becomes
    /// `f(current)`; when absent, `initial` is stored as-is.
    pub async fn update<F>(&self, key: K, initial: V, f: F) -> Result<()>
    where
        F: FnOnce(V) -> V + Send + 'static,
    {
        self.get_and_update(key, move |current| match current {
            Some(value) => ((), Some(f(value))),
            None => ((), Some(initial)),
        })
        .await
    }

    /// Atomically reads and updates `key`. `f` receives the current value;
    /// returning `Some` stores a new value, `None` deletes the key. The
    /// first element of the pair is returned to the caller.
    pub async fn get_and_update<R, F>(&self, key: K, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(Option<V>) -> (R, Option<V>) + Send + 'static,
    {
        let update_key = key.clone();
        self.get_and_update_multi(vec![key], move |entries| {
            let current = entries.into_iter().next().map(|(_, v)| v);
            let (result, new) = f(current);
            match new {
                Some(value) => Ok((result, vec![(update_key, value)], Vec::new())),
                None => Ok((result, Vec::new(), vec![update_key])),
            }
        })
        .await
    }

    /// Atomic multi-key transaction. `f` runs on the writer with the
    /// requested entries read from one consistent snapshot (absent keys are
    /// omitted) and returns `(result, entries_to_put, keys_to_delete)`. Puts
    /// are applied in the given order, then deletes, then a single commit.
    /// An error from `f` aborts the transaction: nothing is committed.
    pub async fn get_and_update_multi<R, F>(&self, keys: Vec<K>, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(Vec<(K, V)>) -> Result<(R, Vec<(K, V)>, Vec<K>)> + Send + 'static,
    {
        let keys: Vec<Vec<u8>> = keys.iter().map(Key::encode).collect();
        let (result_tx, result_rx) = oneshot::channel();

        let func = Box::new(move |found: &std::collections::BTreeMap<Vec<u8>, Vec<u8>>| {
            let mut entries = Vec::with_capacity(found.len());
            for (k, v) in found {
                entries.push((K::decode(k)?, V::decode(v)?));
            }
            let (result, puts, deletes) = f(entries)?;
            let _ = result_tx.send(result);
            Ok(TxWrites {
                puts: puts
                    .into_iter()
                    .map(|(k, v)| (k.encode(), v.encode()))
                    .collect(),
                deletes: deletes.iter().map(Key::encode).collect(),
            })
        });

        self.call(|reply| Command::Transact { keys, func, reply })
            .await?;
        result_rx.await.map_err(|_| Error::Closed)
    }

    /// Runs an ordered range select and collects the surviving entries.
    pub async fn select(&self, options: SelectOptions<K, V>) -> Result<Vec<(K, V)>> {
        self.select_fold(options, Vec::new(), |mut acc, entry| {
            acc.push(entry);
            Ok(acc)
        })
        .await
    }

    /// Runs an ordered range select, folding the streamed entries without
    /// materializing them. An error from `f` discards the partial result.
    pub async fn select_fold<A, F>(&self, options: SelectOptions<K, V>, init: A, mut f: F) -> Result<A>
    where
        F: FnMut(A, (K, V)) -> Result<A>,
    {
        let query = options.into_query();
        let (out, mut rx) = mpsc::channel(64);

        let run = async {
            self.commands
                .send(Command::Read {
                    task: ReadTask::Select { query, out },
                })
                .await
                .map_err(|_| Error::Closed)?;

            let mut acc = init;
            while let Some(item) = rx.recv().await {
                let (k, v) = item?;
                acc = f(acc, (K::decode(&k)?, V::decode(&v)?))?;
            }
            Ok(acc)
        };
        tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| Error::Timeout)?
    }

    /// Like `select_fold`, but seeds the accumulator with the first streamed
    /// entry. Fails with `NotFound` when the select produces no entries.
    pub async fn select_reduce<F>(&self, options: SelectOptions<K, V>, mut f: F) -> Result<(K, V)>
    where
        F: FnMut((K, V), (K, V)) -> Result<(K, V)>,
    {
        let reduced = self
            .select_fold(options, None, |acc, entry| match acc {
                None => Ok(Some(entry)),
                Some(acc) => Ok(Some(f(acc, entry)?)),
            })
            .await?;
        reduced.ok_or(Error::NotFound)
    }

    /// Count of live entries.
    pub async fn size(&self) -> Result<u64> {
        self.call(|reply| Command::Size { reply }).await
    }

    /// Current compaction heuristic in [0, 1].
    pub async fn dirt_factor(&self) -> Result<f64> {
        self.call(|reply| Command::DirtFactor { reply }).await
    }

    /// Starts a background compaction of the current tree. Fails with
    /// `PendingCompaction` when one is already in flight.
    pub async fn compact(&self) -> Result<()> {
        self.call(|reply| Command::Compact { reply }).await
    }

    /// Reconfigures the automatic compaction policy. An invalid policy is
    /// rejected without changing the current one.
    pub async fn set_auto_compact(&self, policy: AutoCompact) -> Result<()> {
        self.call(|reply| Command::SetAutoCompact { policy, reply })
            .await
    }

    /// Path of the current data file.
    pub async fn path(&self) -> Result<PathBuf> {
        self.call(|reply| Command::Path { reply }).await
    }

    /// Subscribes to lifecycle events.
    pub async fn subscribe(&self) -> Result<broadcast::Receiver<Event>> {
        self.call(|reply| Command::Subscribe { reply }).await
    }
}
