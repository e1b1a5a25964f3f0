//! Disk storage for torrent content.
//!
//! The torrent's files form one concatenated byte space; pieces address
//! into it and may span file boundaries. [`Storage`] maps global offsets
//! to per-file ranges and performs positional reads and writes, serialized
//! per file by a per-file lock. Handles are opened lazily and shared, so a
//! `Storage` is cheap to clone into worker tasks behind an `Arc`.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use parking_lot::Mutex;
use thiserror::Error;

use crate::metainfo::Info;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("offset {offset} + {len} bytes is outside the torrent of {total} bytes")]
    OutOfBounds { offset: u64, len: u64, total: u64 },
}

struct StorageFile {
    path: PathBuf,
    length: u64,
    offset: u64,
    handle: Mutex<Option<File>>,
}

/// Thread-safe positional I/O over the torrent's file layout.
pub struct Storage {
    root: PathBuf,
    files: Vec<StorageFile>,
    total_length: u64,
}

impl Storage {
    /// Lays out storage for `info` under the `root` download directory.
    /// No files are touched until [`Storage::allocate_file`] or a write.
    pub fn new(root: impl Into<PathBuf>, info: &Info) -> Self {
        let root = root.into();
        let files = info
            .files
            .iter()
            .map(|f| StorageFile {
                path: root.join(&f.path),
                length: f.length,
                offset: f.offset,
                handle: Mutex::new(None),
            })
            .collect();
        Self {
            root,
            files,
            total_length: info.total_length,
        }
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Creates or extends one file to its declared length, returning that
    /// length. Existing longer files are truncated. Idempotent.
    pub fn allocate_file(&self, index: usize) -> Result<u64, StorageError> {
        let file = &self.files[index];
        if let Some(dir) = file.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let mut guard = file.handle.lock();
        let handle = open_rw(&file.path)?;
        if handle.metadata()?.len() != file.length {
            handle.set_len(file.length)?;
        }
        *guard = Some(handle);
        Ok(file.length)
    }

    /// Reads `buf.len()` bytes starting at the global `offset`, crossing
    /// file boundaries as needed.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        self.check_bounds(offset, buf.len() as u64)?;
        let mut filled = 0usize;
        for (file, in_file, len) in self.spans(offset, buf.len() as u64) {
            let mut guard = file.handle.lock();
            let handle = ensure_open(&mut guard, &file.path)?;
            handle.seek(SeekFrom::Start(in_file))?;
            handle.read_exact(&mut buf[filled..filled + len as usize])?;
            filled += len as usize;
        }
        Ok(())
    }

    /// Writes `data` starting at the global `offset`, crossing file
    /// boundaries as needed.
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        self.check_bounds(offset, data.len() as u64)?;
        let mut taken = 0usize;
        for (file, in_file, len) in self.spans(offset, data.len() as u64) {
            let mut guard = file.handle.lock();
            let handle = ensure_open(&mut guard, &file.path)?;
            handle.seek(SeekFrom::Start(in_file))?;
            handle.write_all(&data[taken..taken + len as usize])?;
            taken += len as usize;
        }
        Ok(())
    }

    fn check_bounds(&self, offset: u64, len: u64) -> Result<(), StorageError> {
        if offset + len > self.total_length {
            return Err(StorageError::OutOfBounds {
                offset,
                len,
                total: self.total_length,
            });
        }
        Ok(())
    }

    /// Iterates the per-file ranges covering `[offset, offset + len)` as
    /// `(file, offset_in_file, span_len)`.
    fn spans(&self, offset: u64, len: u64) -> impl Iterator<Item = (&StorageFile, u64, u64)> {
        let end = offset + len;
        self.files
            .iter()
            .filter(move |f| f.length > 0 && f.offset < end && f.offset + f.length > offset)
            .map(move |f| {
                let start = offset.max(f.offset);
                let stop = end.min(f.offset + f.length);
                (f, start - f.offset, stop - start)
            })
    }
}

fn open_rw(path: &PathBuf) -> Result<File, StorageError> {
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?)
}

fn ensure_open<'a>(
    guard: &'a mut Option<File>,
    path: &PathBuf,
) -> Result<&'a mut File, StorageError> {
    if guard.is_none() {
        *guard = Some(open_rw(path)?);
    }
    Ok(guard.as_mut().expect("handle just opened"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha1::{Digest, Sha1};

    fn multi_file_info() -> Info {
        // two files, 5 and 11 bytes, one 16-byte piece
        let mut data = Vec::new();
        data.extend_from_slice(b"d5:filesl");
        data.extend_from_slice(b"d6:lengthi5e4:pathl1:aee");
        data.extend_from_slice(b"d6:lengthi11e4:pathl3:dir1:bee");
        data.extend_from_slice(b"e4:name1:t12:piece lengthi16e6:pieces20:");
        data.extend_from_slice(&[0u8; 20]);
        data.push(b'e');
        Info::from_bytes(&data).unwrap()
    }

    #[test]
    fn allocate_creates_files_at_length() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path(), &multi_file_info());
        let mut total = 0;
        for i in 0..storage.file_count() {
            total += storage.allocate_file(i).unwrap();
        }
        assert_eq!(total, 16);
        assert_eq!(dir.path().join("t/a").metadata().unwrap().len(), 5);
        assert_eq!(dir.path().join("t/dir/b").metadata().unwrap().len(), 11);

        // idempotent
        assert_eq!(storage.allocate_file(0).unwrap(), 5);
    }

    #[test]
    fn write_read_across_file_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path(), &multi_file_info());
        for i in 0..storage.file_count() {
            storage.allocate_file(i).unwrap();
        }

        let data: Vec<u8> = (0..16).collect();
        storage.write_at(0, &data).unwrap();

        let mut back = vec![0u8; 16];
        storage.read_at(0, &mut back).unwrap();
        assert_eq!(back, data);

        // straddling read
        let mut straddle = vec![0u8; 4];
        storage.read_at(3, &mut straddle).unwrap();
        assert_eq!(straddle, &data[3..7]);

        // the split lands in the right files
        assert_eq!(std::fs::read(dir.path().join("t/a")).unwrap(), &data[..5]);
        assert_eq!(
            std::fs::read(dir.path().join("t/dir/b")).unwrap(),
            &data[5..]
        );
    }

    #[test]
    fn rehashing_written_piece_matches() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path(), &multi_file_info());
        for i in 0..storage.file_count() {
            storage.allocate_file(i).unwrap();
        }
        let piece: Vec<u8> = (100..116).collect();
        let expected: [u8; 20] = Sha1::digest(&piece).into();

        storage.write_at(0, &piece).unwrap();
        let mut back = vec![0u8; 16];
        storage.read_at(0, &mut back).unwrap();
        let actual: [u8; 20] = Sha1::digest(&back).into();
        assert_eq!(actual, expected);
    }

    #[test]
    fn out_of_bounds_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path(), &multi_file_info());
        let mut buf = vec![0u8; 2];
        assert!(matches!(
            storage.read_at(15, &mut buf),
            Err(StorageError::OutOfBounds { .. })
        ));
    }
}
