//! Read workers. Each read request runs as its own task against a frozen
//! tree snapshot, in parallel with the writer and with other readers. When
//! the task finishes, normally or not, a drop guard reports check-out to
//! the coordinator so the busy count of the snapshot's file is released.

use std::ops::Bound;
use std::path::PathBuf;

use tokio::sync::{mpsc, oneshot};

use crate::btree::Btree;
use crate::coordinator::Control;
use crate::error::Result;

type EntryFn = Box<dyn FnMut(&[u8], &[u8]) -> Result<bool> + Send>;
type MapFn = Box<dyn FnMut(Vec<u8>, Vec<u8>) -> Result<(Vec<u8>, Vec<u8>)> + Send>;

/// One stage of a select pipeline, operating on encoded entries. The typed
/// layer lowers user closures onto these.
pub(crate) enum PipeOp {
    Filter(EntryFn),
    Map(MapFn),
    Take(usize),
    Skip(usize),
    TakeWhile(EntryFn),
    SkipWhile(EntryFn, bool),
}

/// A select request: bounds, direction, and pipeline.
pub(crate) struct SelectQuery {
    pub min: Bound<Vec<u8>>,
    pub max: Bound<Vec<u8>>,
    pub reverse: bool,
    pub ops: Vec<PipeOp>,
}

pub(crate) enum ReadTask {
    Get {
        key: Vec<u8>,
        reply: oneshot::Sender<Result<Option<Vec<u8>>>>,
    },
    Has {
        key: Vec<u8>,
        reply: oneshot::Sender<Result<bool>>,
    },
    Select {
        query: SelectQuery,
        out: mpsc::Sender<Result<(Vec<u8>, Vec<u8>)>>,
    },
}

enum Step {
    Emit((Vec<u8>, Vec<u8>)),
    Skip,
    Done,
}

/// Feeds one entry through the pipeline stages in caller-given order.
fn feed(ops: &mut [PipeOp], mut entry: (Vec<u8>, Vec<u8>)) -> Result<Step> {
    for op in ops.iter_mut() {
        match op {
            PipeOp::Filter(f) => {
                if !f(&entry.0, &entry.1)? {
                    return Ok(Step::Skip);
                }
            }
            PipeOp::Map(f) => {
                entry = f(entry.0, entry.1)?;
            }
            PipeOp::Take(n) => {
                if *n == 0 {
                    return Ok(Step::Done);
                }
                *n -= 1;
            }
            PipeOp::Skip(n) => {
                if *n > 0 {
                    *n -= 1;
                    return Ok(Step::Skip);
                }
            }
            PipeOp::TakeWhile(f) => {
                if !f(&entry.0, &entry.1)? {
                    return Ok(Step::Done);
                }
            }
            PipeOp::SkipWhile(f, skipping) => {
                if *skipping {
                    if f(&entry.0, &entry.1)? {
                        return Ok(Step::Skip);
                    }
                    *skipping = false;
                }
            }
        }
    }
    Ok(Step::Emit(entry))
}

/// Sends check-out on drop, so a reader that fails or is cancelled still
/// releases its file reference.
struct CheckOutGuard {
    path: PathBuf,
    control: mpsc::UnboundedSender<Control>,
}

impl Drop for CheckOutGuard {
    fn drop(&mut self) {
        let _ = self.control.send(Control::ReaderDone {
            path: std::mem::take(&mut self.path),
        });
    }
}

/// Spawns a reader task for `task` against `snapshot`. The coordinator has
/// already checked the snapshot's file in; the guard checks it out.
pub(crate) fn spawn(snapshot: Btree, task: ReadTask, control: mpsc::UnboundedSender<Control>) {
    let guard = CheckOutGuard {
        path: snapshot.store().path(),
        control,
    };

    tokio::spawn(async move {
        let _guard = guard;
        match task {
            ReadTask::Get { key, reply } => {
                let _ = reply.send(snapshot.lookup(&key));
            }
            ReadTask::Has { key, reply } => {
                let _ = reply.send(snapshot.contains(&key));
            }
            ReadTask::Select { query, out } => {
                run_select(&snapshot, query, out).await;
            }
        }
    });
}

async fn run_select(
    snapshot: &Btree,
    mut query: SelectQuery,
    out: mpsc::Sender<Result<(Vec<u8>, Vec<u8>)>>,
) {
    for entry in snapshot.range(query.min.clone(), query.max.clone(), query.reverse) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let _ = out.send(Err(e)).await;
                return;
            }
        };
        match feed(&mut query.ops, entry) {
            Ok(Step::Emit(entry)) => {
                // The receiver hanging up (collected enough, or timed out)
                // ends the scan.
                if out.send(Ok(entry)).await.is_err() {
                    return;
                }
            }
            Ok(Step::Skip) => {}
            Ok(Step::Done) => return,
            Err(e) => {
                let _ = out.send(Err(e)).await;
                return;
            }
        }
    }
}
