use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use crate::error::{Error, Result};

/// Data file suffix for committed database files.
pub const DATA_SUFFIX: &str = "cub";
/// Data file suffix for in-progress compaction targets.
pub const COMPACTION_SUFFIX: &str = "compact";

/// Append-only block device over a single file.
///
/// Appends go through positional writes at an in-memory end-of-file offset,
/// and reads use positional I/O, so concurrent snapshot readers never contend
/// with the writer on a file cursor. Appended data is not durable until
/// `sync` is called.
pub struct Store {
    file: File,
    path: RwLock<PathBuf>,
    len: Mutex<u64>,
}

impl Store {
    /// Opens the file at `path`, creating it if missing. Existing content is
    /// preserved; new appends go to the end.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        let len = file.metadata()?.len();

        Ok(Self {
            file,
            path: RwLock::new(path),
            len: Mutex::new(len),
        })
    }

    /// Appends `bytes` and returns the offset where writing began.
    pub fn append(&self, bytes: &[u8]) -> Result<u64> {
        let mut len = self.len.lock().expect("store length lock poisoned");
        let offset = *len;
        self.write_all_at(bytes, offset)?;
        *len += bytes.len() as u64;
        Ok(offset)
    }

    /// Appends `bytes` starting at the next multiple of `align`, zero-padding
    /// the gap. Returns the aligned offset where `bytes` begin.
    pub fn append_aligned(&self, bytes: &[u8], align: u64) -> Result<u64> {
        let mut len = self.len.lock().expect("store length lock poisoned");
        let mut offset = *len;
        let rem = offset % align;
        if rem != 0 {
            let padding = vec![0u8; (align - rem) as usize];
            self.write_all_at(&padding, offset)?;
            offset += padding.len() as u64;
        }
        self.write_all_at(bytes, offset)?;
        *len = offset + bytes.len() as u64;
        Ok(offset)
    }

    /// Random read of `len` bytes at `offset`.
    pub fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let end = offset + len as u64;
        if end > self.len() {
            return Err(Error::Corrupted(format!(
                "read of {len} bytes at offset {offset} past end of file"
            )));
        }
        let mut buf = vec![0u8; len];
        self.read_exact_at(&mut buf, offset)?;
        Ok(buf)
    }

    /// Flushes OS buffers to disk.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Current end-of-file offset.
    pub fn len(&self) -> u64 {
        *self.len.lock().expect("store length lock poisoned")
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Path of the backing file.
    pub fn path(&self) -> PathBuf {
        self.path.read().expect("store path lock poisoned").clone()
    }

    /// Renames the backing file in place; the open handle stays valid.
    pub fn rename(&self, new_path: impl Into<PathBuf>) -> Result<()> {
        let new_path = new_path.into();
        let mut path = self.path.write().expect("store path lock poisoned");
        std::fs::rename(&*path, &new_path)?;
        *path = new_path;
        Ok(())
    }

    #[cfg(unix)]
    fn write_all_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    #[cfg(unix)]
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    #[cfg(windows)]
    fn write_all_at(&self, mut buf: &[u8], mut offset: u64) -> Result<()> {
        use std::os::windows::fs::FileExt;
        while !buf.is_empty() {
            let written = self.file.seek_write(buf, offset)?;
            buf = &buf[written..];
            offset += written as u64;
        }
        Ok(())
    }

    #[cfg(windows)]
    fn read_exact_at(&self, mut buf: &mut [u8], mut offset: u64) -> Result<()> {
        use std::os::windows::fs::FileExt;
        while !buf.is_empty() {
            let read = self.file.seek_read(buf, offset)?;
            if read == 0 {
                return Err(Error::Io("unexpected end of file".to_string()));
            }
            buf = &mut buf[read..];
            offset += read as u64;
        }
        Ok(())
    }
}

/// Parses a data file name of the form `<hex id>.<suffix>`.
pub fn parse_file_id(path: &Path, suffix: &str) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_suffix(&format!(".{suffix}"))?;
    u64::from_str_radix(stem, 16).ok()
}

/// Builds the path of the data file with the given id and suffix.
pub fn file_path(dir: &Path, id: u64, suffix: &str) -> PathBuf {
    dir.join(format!("{id:x}.{suffix}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("0.cub")).unwrap();
        (dir, store)
    }

    #[test]
    fn append_returns_offsets() {
        let (_dir, store) = temp_store();
        assert!(store.is_empty());

        let a = store.append(b"hello").unwrap();
        let b = store.append(b"world").unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 5);
        assert_eq!(store.len(), 10);

        assert_eq!(store.read_at(0, 5).unwrap(), b"hello");
        assert_eq!(store.read_at(5, 5).unwrap(), b"world");
    }

    #[test]
    fn aligned_append_pads_with_zeros() {
        let (_dir, store) = temp_store();
        store.append(b"xyz").unwrap();

        let offset = store.append_aligned(b"header", 16).unwrap();
        assert_eq!(offset, 16);
        assert_eq!(store.read_at(3, 13).unwrap(), vec![0u8; 13]);
        assert_eq!(store.read_at(16, 6).unwrap(), b"header");

        // already aligned: no padding
        let offset = store.append_aligned(b"ab", 2).unwrap();
        assert_eq!(offset, 22);
        assert_eq!(store.len(), 24);
    }

    #[test]
    fn read_past_end_is_rejected() {
        let (_dir, store) = temp_store();
        store.append(b"abc").unwrap();
        assert!(store.read_at(0, 4).is_err());
        assert!(store.read_at(100, 1).is_err());
    }

    #[test]
    fn reopen_preserves_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0.cub");

        {
            let store = Store::open(&path).unwrap();
            store.append(b"persistent").unwrap();
            store.sync().unwrap();
        }

        let store = Store::open(&path).unwrap();
        assert_eq!(store.len(), 10);
        assert_eq!(store.read_at(0, 10).unwrap(), b"persistent");
    }

    #[test]
    fn rename_keeps_handle_usable() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("1.compact");
        let new = dir.path().join("1.cub");

        let store = Store::open(&old).unwrap();
        store.append(b"data").unwrap();
        store.rename(&new).unwrap();

        assert!(!old.exists());
        assert!(new.exists());
        assert_eq!(store.path(), new);
        assert_eq!(store.read_at(0, 4).unwrap(), b"data");
        store.append(b"more").unwrap();
        assert_eq!(store.len(), 8);
    }

    #[test]
    fn file_id_parsing() {
        assert_eq!(parse_file_id(Path::new("/db/0.cub"), DATA_SUFFIX), Some(0));
        assert_eq!(
            parse_file_id(Path::new("/db/2a.cub"), DATA_SUFFIX),
            Some(0x2a)
        );
        assert_eq!(
            parse_file_id(Path::new("/db/1.compact"), COMPACTION_SUFFIX),
            Some(1)
        );
        assert_eq!(parse_file_id(Path::new("/db/1.compact"), DATA_SUFFIX), None);
        assert_eq!(parse_file_id(Path::new("/db/zz.cub"), DATA_SUFFIX), None);

        assert_eq!(
            file_path(Path::new("/db"), 42, DATA_SUFFIX),
            PathBuf::from("/db/2a.cub")
        );
    }
}
