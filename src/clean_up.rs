//! Serial cleanup worker. Owns a mailbox of file-removal jobs so deletions
//! never race each other. The coordinator decides which files are obsolete
//! at dispatch time, when it knows the current tree's file and any active
//! compaction target, and only hands the worker a frozen list of victims.
//! File ids grow strictly, so a file that was obsolete at dispatch time can
//! never become live again.

use std::path::{Path, PathBuf};

use tokio::sync::mpsc;

use crate::error::Result;
use crate::store::{parse_file_id, COMPACTION_SUFFIX, DATA_SUFFIX};

#[derive(Debug)]
pub(crate) struct CleanUpJob {
    pub files: Vec<PathBuf>,
}

/// All database and compaction files in `dir` except the ones in `keep`.
pub(crate) fn obsolete_data_files(dir: &Path, keep: &[PathBuf]) -> Result<Vec<PathBuf>> {
    list_matching(dir, |path| {
        !keep.iter().any(|p| p.as_path() == path)
            && (parse_file_id(path, DATA_SUFFIX).is_some()
                || parse_file_id(path, COMPACTION_SUFFIX).is_some())
    })
}

/// Leftover compaction targets from earlier attempts, sparing the one now
/// being written.
pub(crate) fn obsolete_compaction_files(dir: &Path, keep: &Path) -> Result<Vec<PathBuf>> {
    list_matching(dir, |path| {
        path != keep && parse_file_id(path, COMPACTION_SUFFIX).is_some()
    })
}

fn list_matching(dir: &Path, obsolete: impl Fn(&Path) -> bool) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if obsolete(&path) {
            files.push(path);
        }
    }
    Ok(files)
}

pub(crate) fn spawn(dir: PathBuf) -> mpsc::UnboundedSender<CleanUpJob> {
    let (tx, mut rx) = mpsc::unbounded_channel::<CleanUpJob>();
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            run_job(job);
        }
    });
    tx
}

fn run_job(job: CleanUpJob) {
    for path in job.files {
        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::info!(file = %path.display(), "deleted obsolete data file");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(file = %path.display(), error = %e, "failed to delete data file");
            }
        }
    }
}
