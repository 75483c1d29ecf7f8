//! Purpose: Contract every ordered key-value backend satisfies, plus the name registry.
//! Exports: `Backend`, `Writer`, `WriteBatch`, `BatchLimits`, `Durability`, `OpenRequest`, `Registry`.
//! Role: Seam between the record writer / merge engine and concrete storage engines.
//! Invariants: `Backend::iterate` visits every entry once, in ascending key-byte order.
//! Invariants: Duplicate keys resolve last-write-wins inside the backend.
//! Invariants: Batch rollover is owned by `Writer`; callers only see `insert` and `commit`.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::core::error::{Error, ErrorKind};

pub mod log;
pub mod memory;

pub type Visit<'v> = dyn FnMut(&[u8], &[u8]) -> Result<(), Error> + 'v;

pub trait Backend: Send {
    fn name(&self) -> &'static str;

    /// Directory holding persisted state, if any.
    fn location(&self) -> Option<&Path>;

    /// Files the backend created under its location; `Store::destroy` removes them.
    fn files(&self) -> Vec<PathBuf> {
        Vec::new()
    }

    fn batch_limits(&self) -> BatchLimits;

    /// Makes every entry of `batch` visible to later iteration.
    fn apply(&mut self, batch: WriteBatch) -> Result<(), Error>;

    fn iterate(&self, visit: &mut Visit<'_>) -> Result<(), Error>;

    fn close(&mut self) -> Result<(), Error>;
}

impl<'b> dyn Backend + 'b {
    pub fn new_writer(&mut self) -> Writer<'_> {
        Writer::new(self)
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Durability {
    #[default]
    Fast,
    Flush,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BatchLimits {
    pub max_entries: usize,
    pub max_bytes: usize,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            max_entries: 100_000,
            max_bytes: 64 * 1024 * 1024,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BatchFull;

#[derive(Debug)]
pub struct WriteBatch {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    bytes: usize,
    limits: BatchLimits,
}

impl WriteBatch {
    pub fn new(limits: BatchLimits) -> Self {
        Self {
            entries: Vec::new(),
            bytes: 0,
            limits,
        }
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), BatchFull> {
        let size = key.len() + value.len();
        if self.entries.len() + 1 > self.limits.max_entries
            || self.bytes + size > self.limits.max_bytes
        {
            return Err(BatchFull);
        }
        self.entries.push((key.to_vec(), value.to_vec()));
        self.bytes += size;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn entries(&self) -> &[(Vec<u8>, Vec<u8>)] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.entries
    }
}

/// Single write stream over a backend; swaps in a fresh batch when the current one fills.
pub struct Writer<'a> {
    backend: &'a mut dyn Backend,
    batch: WriteBatch,
    inserted: u64,
    rollovers: u64,
}

impl<'a> Writer<'a> {
    pub fn new(backend: &'a mut dyn Backend) -> Self {
        let batch = WriteBatch::new(backend.batch_limits());
        Self {
            backend,
            batch,
            inserted: 0,
            rollovers: 0,
        }
    }

    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        if self.batch.put(key, value).is_err() {
            if self.batch.is_empty() {
                return Err(oversized_entry(key.len() + value.len()));
            }
            let full = std::mem::replace(
                &mut self.batch,
                WriteBatch::new(self.backend.batch_limits()),
            );
            warn!(
                backend = self.backend.name(),
                entries = full.len(),
                bytes = full.bytes(),
                "batch full; committing and starting a new one"
            );
            self.backend.apply(full).map_err(write_error)?;
            self.rollovers += 1;
            self.batch
                .put(key, value)
                .map_err(|_| oversized_entry(key.len() + value.len()))?;
        }
        self.inserted += 1;
        Ok(())
    }

    pub fn inserted(&self) -> u64 {
        self.inserted
    }

    pub fn rollovers(&self) -> u64 {
        self.rollovers
    }

    pub fn commit(mut self) -> Result<u64, Error> {
        let batch = std::mem::replace(
            &mut self.batch,
            WriteBatch::new(self.backend.batch_limits()),
        );
        if !batch.is_empty() {
            self.backend.apply(batch).map_err(write_error)?;
        }
        debug!(
            backend = self.backend.name(),
            inserted = self.inserted,
            rollovers = self.rollovers,
            "write stream committed"
        );
        Ok(self.inserted)
    }
}

fn write_error(err: Error) -> Error {
    match err.kind() {
        ErrorKind::Write => err,
        _ => err.into_kind(ErrorKind::Write),
    }
}

fn oversized_entry(size: usize) -> Error {
    Error::new(ErrorKind::Write)
        .with_message(format!("entry of {size} bytes does not fit in an empty batch"))
}

#[derive(Clone, Copy, Debug)]
pub struct OpenRequest<'a> {
    pub dir: Option<&'a Path>,
    pub durability: Durability,
    pub limits: BatchLimits,
}

pub type OpenFn = fn(&OpenRequest<'_>) -> Result<Box<dyn Backend>, Error>;

/// Backend constructors selectable by name.
#[derive(Clone)]
pub struct Registry {
    backends: BTreeMap<String, OpenFn>,
}

impl Registry {
    pub fn empty() -> Self {
        Self {
            backends: BTreeMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register(memory::NAME, memory::open);
        registry.register(log::NAME, log::open);
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, open: OpenFn) {
        self.backends.insert(name.into(), open);
    }

    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.backends.keys().map(String::as_str)
    }

    pub fn open(&self, name: &str, request: &OpenRequest<'_>) -> Result<Box<dyn Backend>, Error> {
        let open = self.backends.get(name).ok_or_else(|| {
            let known = self.names().collect::<Vec<_>>().join(", ");
            Error::new(ErrorKind::StorageOpen)
                .with_message(format!("unknown storage {name:?}"))
                .with_hint(format!("Registered storages: {known}."))
        })?;
        open(request)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
