//! Purpose: File-backed ordered backend: append-only frame log plus an in-memory sorted index.
//! Exports: `LogBackend`, `open`, `NAME`, `DATA_FILE`.
//! Role: Persistent `log` storage registered by default.
//! Invariants: A batch is visible only once its trailing commit frame is on disk.
//! Invariants: Frames past the last commit are truncated on open.
//! Invariants: The data file is exclusively locked for the lifetime of the handle.
//! Invariants: Iteration walks the index in key order and slices values from a read-only map.
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use libc::{EACCES, EPERM};
use memmap2::Mmap;
use tracing::{debug, info, warn};

use crate::core::error::{Error, ErrorKind};
use crate::core::frame::{FRAME_HEADER_LEN, FrameHeader, FrameKind, MAX_ENTRY_PART};
use crate::core::storage::{Backend, BatchLimits, Durability, OpenRequest, Visit, WriteBatch};

pub const NAME: &str = "log";
pub const DATA_FILE: &str = "data.log";

pub fn open(request: &OpenRequest<'_>) -> Result<Box<dyn Backend>, Error> {
    let dir = request.dir.ok_or_else(|| {
        Error::new(ErrorKind::StorageOpen)
            .with_message("log storage needs a directory")
            .with_hint("Open the store at a path instead of in memory.")
    })?;
    Ok(Box::new(LogBackend::open(
        dir,
        request.durability,
        request.limits,
    )?))
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct ValueLoc {
    offset: u64,
    len: u32,
}

pub struct LogBackend {
    dir: PathBuf,
    path: PathBuf,
    file: File,
    index: BTreeMap<Vec<u8>, ValueLoc>,
    end: u64,
    durability: Durability,
    limits: BatchLimits,
    closed: bool,
}

impl LogBackend {
    pub fn open(
        dir: impl AsRef<Path>,
        durability: Durability,
        limits: BatchLimits,
    ) -> Result<Self, Error> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|err| open_error(&dir, err))?;
        let path = dir.join(DATA_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| open_error(&path, err))?;

        file.try_lock_exclusive().map_err(|err| {
            Error::new(lock_error_kind(&err))
                .with_message("store is locked by another handle")
                .with_path(&path)
                .with_source(err)
        })?;

        let len = file
            .metadata()
            .map(|meta| meta.len())
            .map_err(|err| open_error(&path, err))?;
        let (index, committed_end) = scan(&file, len, &path)?;
        if committed_end < len {
            warn!(
                path = %path.display(),
                discarded_bytes = len - committed_end,
                "discarding uncommitted log tail"
            );
            file.set_len(committed_end)
                .map_err(|err| open_error(&path, err))?;
        }
        info!(path = %path.display(), entries = index.len(), "log storage opened");

        Ok(Self {
            dir,
            path,
            file,
            index,
            end: committed_end,
            durability,
            limits,
            closed: false,
        })
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn data_path(&self) -> &Path {
        &self.path
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.closed {
            return Err(Error::new(ErrorKind::Internal)
                .with_message("log storage is closed")
                .with_path(&self.path));
        }
        Ok(())
    }
}

impl Backend for LogBackend {
    fn name(&self) -> &'static str {
        NAME
    }

    fn location(&self) -> Option<&Path> {
        Some(&self.dir)
    }

    fn files(&self) -> Vec<PathBuf> {
        vec![self.path.clone()]
    }

    fn batch_limits(&self) -> BatchLimits {
        self.limits
    }

    fn apply(&mut self, batch: WriteBatch) -> Result<(), Error> {
        self.ensure_open()?;
        if batch.is_empty() {
            return Ok(());
        }

        let mut buf = Vec::with_capacity(
            batch.bytes() + (batch.len() + 1) * FRAME_HEADER_LEN,
        );
        let mut placed = Vec::with_capacity(batch.len());
        for (key, value) in batch.entries() {
            if key.len() > MAX_ENTRY_PART || value.len() > MAX_ENTRY_PART {
                return Err(Error::new(ErrorKind::Write)
                    .with_message("entry exceeds log frame limits")
                    .with_path(&self.path));
            }
            let header = FrameHeader::put(key.len() as u32, value.len() as u32);
            buf.extend_from_slice(&header.encode());
            buf.extend_from_slice(key);
            let offset = self.end + buf.len() as u64;
            buf.extend_from_slice(value);
            placed.push(ValueLoc {
                offset,
                len: value.len() as u32,
            });
        }
        buf.extend_from_slice(&FrameHeader::commit().encode());

        if let Err(err) = write_at(&mut self.file, self.end, &buf, self.durability) {
            let _ = self.file.set_len(self.end);
            return Err(Error::new(ErrorKind::Write)
                .with_message("failed to append batch")
                .with_path(&self.path)
                .with_source(err));
        }

        let count = placed.len();
        for ((key, _), loc) in batch.into_entries().into_iter().zip(placed) {
            self.index.insert(key, loc);
        }
        self.end += buf.len() as u64;
        debug!(entries = count, log_bytes = self.end, "log batch committed");
        Ok(())
    }

    fn iterate(&self, visit: &mut Visit<'_>) -> Result<(), Error> {
        self.ensure_open()?;
        if self.index.is_empty() {
            return Ok(());
        }
        let map = unsafe {
            Mmap::map(&self.file).map_err(|err| {
                Error::new(ErrorKind::Iteration)
                    .with_message("failed to map log")
                    .with_path(&self.path)
                    .with_source(err)
            })?
        };
        for (key, loc) in &self.index {
            let start = loc.offset as usize;
            let value = map.get(start..start + loc.len as usize).ok_or_else(|| {
                Error::new(ErrorKind::Iteration)
                    .with_message("indexed value lies outside the log")
                    .with_path(&self.path)
            })?;
            visit(key, value)?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let synced = self.file.sync_all();
        let _ = FileExt::unlock(&self.file);
        self.index.clear();
        synced.map_err(|err| {
            Error::new(ErrorKind::Write)
                .with_message("failed to sync log on close")
                .with_path(&self.path)
                .with_source(err)
        })
    }
}

fn write_at(file: &mut File, offset: u64, buf: &[u8], durability: Durability) -> io::Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(buf)?;
    file.flush()?;
    if durability == Durability::Flush {
        file.sync_data()?;
    }
    Ok(())
}

/// Rebuilds the index from committed frames; returns it with the committed length.
fn scan(file: &File, len: u64, path: &Path) -> Result<(BTreeMap<Vec<u8>, ValueLoc>, u64), Error> {
    let mut index = BTreeMap::new();
    if len == 0 {
        return Ok((index, 0));
    }
    let map = unsafe { Mmap::map(file).map_err(|err| open_error(path, err))? };
    let len = map.len();

    let mut pending = Vec::new();
    let mut offset = 0usize;
    let mut committed_end = 0usize;
    while offset + FRAME_HEADER_LEN <= len {
        let header = match FrameHeader::decode(&map[offset..offset + FRAME_HEADER_LEN]) {
            Ok(header) => header,
            Err(_) => break,
        };
        let body_start = offset + FRAME_HEADER_LEN;
        let body_end = body_start + header.body_len();
        if body_end > len {
            break;
        }
        match header.kind {
            FrameKind::Put => {
                let key_end = body_start + header.key_len as usize;
                pending.push((
                    map[body_start..key_end].to_vec(),
                    ValueLoc {
                        offset: key_end as u64,
                        len: header.value_len,
                    },
                ));
            }
            FrameKind::Commit => {
                for (key, loc) in pending.drain(..) {
                    index.insert(key, loc);
                }
                committed_end = body_end;
            }
        }
        offset = body_end;
    }
    Ok((index, committed_end as u64))
}

fn open_error(path: &Path, err: io::Error) -> Error {
    Error::new(ErrorKind::StorageOpen)
        .with_message("failed to open log storage")
        .with_path(path)
        .with_source(err)
}

fn lock_error_kind(err: &io::Error) -> ErrorKind {
    let errno = err.raw_os_error().unwrap_or_default();
    if errno == EACCES || errno == EPERM {
        return ErrorKind::StorageOpen;
    }
    match err.kind() {
        io::ErrorKind::WouldBlock => ErrorKind::Busy,
        _ => ErrorKind::StorageOpen,
    }
}
