//! Purpose: Store lifecycle: create or reopen at a location, ingest records, group, destroy.
//! Exports: `Store`, `StoreOptions`, `StoreLocation`, `GroupBy`.
//! Role: Facade tying schema, descriptor, backend registry, record writer, and merge engine.
//! Invariants: The schema is fixed once `open` returns; reopen never rewrites the descriptor.
//! Invariants: The backend is closed when the store is closed, destroyed, or dropped.
//! Invariants: `destroy` removes a directory only when the store created it; otherwise it
//! removes just the files the store wrote. It is a no-op for in-memory stores.
//! Invariants: Directory locations require a backend that persists there.
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;

use tracing::{debug, info, warn};

use crate::core::aggregate::{AggregatorRegistry, NamedAggregation};
use crate::core::codec::FieldKind;
use crate::core::descriptor::SchemaDescriptor;
use crate::core::error::{Error, ErrorKind};
use crate::core::merge::{MergeStats, Merger};
use crate::core::schema::{Field, Schema};
use crate::core::storage::{
    self, Backend, BatchLimits, Durability, OpenRequest, Registry,
};
use crate::core::value::Record;
use crate::core::writer::RecordWriter;

pub const DEFAULT_STORAGE: &str = storage::log::NAME;
pub const TEMP_PREFIX: &str = "mergekv-";

#[derive(Clone, Debug, Default)]
pub struct StoreOptions {
    /// Backend name; `None` means the persisted one on reopen, else the default.
    pub storage: Option<String>,
    pub keys: Vec<Field>,
    pub values: Vec<Field>,
    pub durability: Durability,
    pub limits: BatchLimits,
}

impl StoreOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_storage(mut self, name: impl Into<String>) -> Self {
        self.storage = Some(name.into());
        self
    }

    pub fn with_key(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.keys.push(Field::new(name, kind));
        self
    }

    pub fn with_value(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.values.push(Field::new(name, kind));
        self
    }

    pub fn with_durability(mut self, durability: Durability) -> Self {
        self.durability = durability;
        self
    }

    pub fn with_limits(mut self, limits: BatchLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn has_fields(&self) -> bool {
        !self.keys.is_empty() || !self.values.is_empty()
    }

    pub fn schema(&self) -> Result<Schema, Error> {
        let mut builder = Schema::builder();
        for field in &self.keys {
            builder = builder.key_field(field.clone());
        }
        for field in &self.values {
            builder = builder.value_field(field.clone());
        }
        builder.build()
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StoreLocation {
    /// No backing location; state lives only as long as the store.
    Memory,
    /// Open or create exactly this directory.
    Path(PathBuf),
    /// Create a fresh uniquely named directory under this parent.
    TempIn(PathBuf),
}

pub struct Store {
    schema: Schema,
    storage: String,
    dir: Option<PathBuf>,
    owns_dir: bool,
    backend: Box<dyn Backend>,
}

impl Store {
    pub fn open(
        location: StoreLocation,
        options: &StoreOptions,
        registry: &Registry,
    ) -> Result<Self, Error> {
        match location {
            StoreLocation::Memory => {
                let schema = options.schema()?;
                let storage = options
                    .storage
                    .clone()
                    .unwrap_or_else(|| storage::memory::NAME.to_string());
                let backend = registry.open(
                    &storage,
                    &OpenRequest {
                        dir: None,
                        durability: options.durability,
                        limits: options.limits,
                    },
                )?;
                debug!(storage = %storage, "in-memory store opened");
                Ok(Self {
                    schema,
                    storage,
                    dir: None,
                    owns_dir: false,
                    backend,
                })
            }
            StoreLocation::Path(dir) => {
                let created = !dir.exists();
                Self::open_dir(dir, created, options, registry)
            }
            StoreLocation::TempIn(parent) => {
                let dir = create_temp_dir(&parent)?;
                Self::open_dir(dir, true, options, registry)
            }
        }
    }

    fn open_dir(
        dir: PathBuf,
        created: bool,
        options: &StoreOptions,
        registry: &Registry,
    ) -> Result<Self, Error> {
        let opened = Self::open_in(&dir, options, registry);
        match opened {
            Ok((schema, storage, backend)) => Ok(Self {
                schema,
                storage,
                dir: Some(dir),
                owns_dir: created,
                backend,
            }),
            Err(err) if created => {
                if let Err(cleanup) = fs::remove_dir_all(&dir) {
                    warn!(
                        path = %dir.display(),
                        error = %cleanup,
                        "failed to remove store directory after open failure"
                    );
                }
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    fn open_in(
        dir: &Path,
        options: &StoreOptions,
        registry: &Registry,
    ) -> Result<(Schema, String, Box<dyn Backend>), Error> {
        fs::create_dir_all(dir).map_err(|err| {
            Error::new(ErrorKind::StorageOpen)
                .with_message("failed to create store directory")
                .with_path(dir)
                .with_source(err)
        })?;

        let requested = options.schema()?;
        let (schema, storage, fresh) = match SchemaDescriptor::load(dir)? {
            Some(descriptor) => {
                let persisted = descriptor.schema()?;
                if options.has_fields() && requested != persisted {
                    return Err(Error::new(ErrorKind::Schema)
                        .with_message("schema mismatch on reopen")
                        .with_path(SchemaDescriptor::path_in(dir))
                        .with_hint("Omit field declarations to reuse the persisted schema."));
                }
                match options.storage.as_deref() {
                    Some(name) if name != descriptor.store => warn!(
                        requested = name,
                        persisted = %descriptor.store,
                        "ignoring storage override on reopen"
                    ),
                    _ => {}
                }
                (persisted, descriptor.store, false)
            }
            None => {
                let storage = options
                    .storage
                    .clone()
                    .unwrap_or_else(|| DEFAULT_STORAGE.to_string());
                (requested, storage, true)
            }
        };

        let backend = registry.open(
            &storage,
            &OpenRequest {
                dir: Some(dir),
                durability: options.durability,
                limits: options.limits,
            },
        )?;
        if backend.location().is_none() {
            return Err(Error::new(ErrorKind::StorageOpen)
                .with_message(format!("storage {storage:?} cannot persist at a path"))
                .with_path(dir)
                .with_hint(
                    "Use the in-memory location for this storage, or a persistent one like \"log\".",
                ));
        }
        if fresh {
            SchemaDescriptor::new(storage.as_str(), &schema).save(dir)?;
        }
        info!(
            path = %dir.display(),
            storage = %storage,
            fresh,
            keys = schema.keys().len(),
            values = schema.values().len(),
            "store opened"
        );
        Ok((schema, storage, backend))
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn storage_name(&self) -> &str {
        &self.storage
    }

    pub fn location(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn writer(&mut self) -> RecordWriter<'_> {
        RecordWriter::new(&self.schema, self.backend.new_writer())
    }

    /// Writes every record through one write stream and commits once.
    pub fn write_records<I>(&mut self, records: I) -> Result<u64, Error>
    where
        I: IntoIterator<Item = Record>,
    {
        let mut writer = self.writer();
        for mut record in records {
            writer.write(&mut record)?;
        }
        writer.commit()
    }

    /// Drains `records` until every sender hangs up.
    ///
    /// On the first failure the records accepted so far are still committed, the
    /// receiver is dropped so the producer observes the hang-up, and the failure is
    /// returned.
    pub fn receive(&mut self, records: Receiver<Record>) -> Result<u64, Error> {
        let mut writer = self.writer();
        let mut failure = None;
        for mut record in records.iter() {
            if let Err(err) = writer.write(&mut record) {
                failure = Some(err);
                break;
            }
        }
        drop(records);
        if failure.is_some() {
            debug!(accepted = writer.written(), "ingest stopped; committing accepted records");
        }
        let committed = writer.commit();
        match failure {
            Some(err) => {
                if let Err(commit_err) = committed {
                    warn!(error = %commit_err, "commit after ingest failure also failed");
                }
                Err(err)
            }
            None => committed,
        }
    }

    pub fn group_by(&self) -> GroupBy<'_> {
        GroupBy {
            store: self,
            registry: AggregatorRegistry::with_builtins(),
            partial_keys: Vec::new(),
            aggregations: Vec::new(),
        }
    }

    pub fn close(mut self) -> Result<(), Error> {
        self.backend.close()
    }

    /// Closes the store and removes its persisted state.
    ///
    /// A directory the store created is removed whole. In a directory that existed
    /// before, only the backend files and the schema descriptor are removed, and the
    /// directory itself only if nothing else is left in it.
    pub fn destroy(mut self) -> Result<(), Error> {
        let files = self.backend.files();
        self.backend.close()?;
        let Some(dir) = self.dir.take() else {
            return Ok(());
        };
        if self.owns_dir {
            fs::remove_dir_all(&dir).map_err(|err| remove_error(&dir, err))?;
            info!(path = %dir.display(), "store destroyed");
            return Ok(());
        }

        let owned = files
            .into_iter()
            .filter(|path| path.starts_with(&dir))
            .chain([
                SchemaDescriptor::path_in(&dir),
                SchemaDescriptor::staging_path_in(&dir),
            ]);
        for path in owned {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(remove_error(&path, err)),
            }
        }
        let leftover = fs::read_dir(&dir)
            .map_err(|err| remove_error(&dir, err))?
            .next()
            .is_some();
        if leftover {
            info!(path = %dir.display(), "store files removed; directory kept");
        } else {
            fs::remove_dir(&dir).map_err(|err| remove_error(&dir, err))?;
            info!(path = %dir.display(), "store destroyed");
        }
        Ok(())
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if let Err(err) = self.backend.close() {
            warn!(error = %err, "failed to close storage backend");
        }
    }
}

/// Pending grouped iteration: partial-key fields plus `output = op(field)` aggregations.
pub struct GroupBy<'s> {
    store: &'s Store,
    registry: AggregatorRegistry,
    partial_keys: Vec<String>,
    aggregations: Vec<(String, String)>,
}

impl GroupBy<'_> {
    pub fn registry(mut self, registry: AggregatorRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn partial_key(mut self, name: impl Into<String>) -> Self {
        self.partial_keys.push(name.into());
        self
    }

    pub fn partial_keys<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.partial_keys.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn aggregate(mut self, output: impl Into<String>, expr: impl Into<String>) -> Self {
        self.aggregations.push((output.into(), expr.into()));
        self
    }

    pub fn merger(&self) -> Result<Merger, Error> {
        let mut aggs = Vec::with_capacity(self.aggregations.len());
        for (output, expr) in &self.aggregations {
            let aggregator = self
                .registry
                .parse(expr)
                .map_err(|err| err.with_field(output.as_str()))?;
            aggs.push(NamedAggregation::new(output.as_str(), aggregator));
        }
        Merger::new(&self.store.schema, &self.partial_keys, aggs)
    }

    pub fn for_each<F>(self, mut callback: F) -> Result<MergeStats, Error>
    where
        F: FnMut(Record) -> Result<(), Error>,
    {
        let merger = self.merger()?;
        merger.run(self.store.backend.as_ref(), &mut callback)
    }

    pub fn collect(self) -> Result<Vec<Record>, Error> {
        let mut out = Vec::new();
        self.for_each(|record| {
            out.push(record);
            Ok(())
        })?;
        Ok(out)
    }
}

fn remove_error(path: &Path, err: io::Error) -> Error {
    Error::new(ErrorKind::Io)
        .with_message("failed to remove store state")
        .with_path(path)
        .with_source(err)
}

fn create_temp_dir(parent: &Path) -> Result<PathBuf, Error> {
    fs::create_dir_all(parent).map_err(|err| {
        Error::new(ErrorKind::StorageOpen)
            .with_message("failed to create temp parent directory")
            .with_path(parent)
            .with_source(err)
    })?;
    for _ in 0..16 {
        let mut suffix = [0u8; 8];
        getrandom::fill(&mut suffix).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message(format!("failed to generate temp directory name: {err}"))
        })?;
        let name: String = suffix.iter().map(|byte| format!("{byte:02x}")).collect();
        let candidate = parent.join(format!("{TEMP_PREFIX}{name}"));
        match fs::create_dir(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(err) => {
                return Err(Error::new(ErrorKind::StorageOpen)
                    .with_message("failed to create temp store directory")
                    .with_path(&candidate)
                    .with_source(err));
            }
        }
    }
    Err(Error::new(ErrorKind::StorageOpen)
        .with_message("could not find an unused temp directory name")
        .with_path(parent))
}

#[cfg(test)]
mod tests {
    use super::{Store, StoreLocation, StoreOptions, TEMP_PREFIX};
    use crate::core::codec::FieldKind;
    use crate::core::descriptor::DESCRIPTOR_FILE;
    use crate::core::storage::log::DATA_FILE;
    use crate::core::error::ErrorKind;
    use crate::core::storage::{BatchLimits, Registry};
    use crate::core::value::{Record, Value, record_from_json};
    use serde_json::json;
    use std::sync::mpsc;

    fn options() -> StoreOptions {
        StoreOptions::new()
            .with_key("k", FieldKind::Int32)
            .with_key("_i_", FieldKind::Int32)
            .with_value("v", FieldKind::String)
    }

    fn rows() -> Vec<Record> {
        [
            json!({"k": 1, "_i_": 0, "v": "a"}),
            json!({"k": 1, "_i_": 1, "v": "b"}),
            json!({"k": 2, "_i_": 2, "v": "c"}),
        ]
        .into_iter()
        .map(|row| record_from_json(row).expect("record"))
        .collect()
    }

    fn tallies(store: &Store) -> Vec<Record> {
        store
            .group_by()
            .partial_key("k")
            .aggregate("t", "tally(v)")
            .collect()
            .expect("group")
    }

    #[test]
    fn memory_store_groups_and_tallies() {
        let registry = Registry::with_builtins();
        let mut store = Store::open(StoreLocation::Memory, &options(), &registry).expect("open");
        assert_eq!(store.storage_name(), "memory");
        assert!(store.location().is_none());
        assert_eq!(store.write_records(rows()).expect("write"), 3);

        let out = tallies(&store);
        assert_eq!(
            out,
            vec![
                Record::from([
                    ("k".to_string(), Value::Int32(1)),
                    ("t".to_string(), Value::Json(json!({"a": 1, "b": 1}))),
                ]),
                Record::from([
                    ("k".to_string(), Value::Int32(2)),
                    ("t".to_string(), Value::Json(json!({"c": 1}))),
                ]),
            ]
        );
        store.destroy().expect("destroy is a no-op");
    }

    #[test]
    fn log_storage_rejects_memory_location() {
        let registry = Registry::with_builtins();
        let err = match Store::open(
            StoreLocation::Memory,
            &options().with_storage("log"),
            &registry,
        ) {
            Ok(_) => panic!("log storage needs a directory"),
            Err(err) => err,
        };
        assert_eq!(err.kind(), ErrorKind::StorageOpen);
    }

    #[test]
    fn memory_storage_rejects_path_location() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = Registry::with_builtins();
        let fresh = dir.path().join("fresh");
        let err = match Store::open(
            StoreLocation::Path(fresh.clone()),
            &options().with_storage("memory"),
            &registry,
        ) {
            Ok(_) => panic!("memory storage cannot persist at a path"),
            Err(err) => err,
        };
        assert_eq!(err.kind(), ErrorKind::StorageOpen);
        assert!(!fresh.exists());

        let existing = dir.path();
        let err = match Store::open(
            StoreLocation::Path(existing.to_path_buf()),
            &options().with_storage("memory"),
            &registry,
        ) {
            Ok(_) => panic!("memory storage cannot persist at a path"),
            Err(err) => err,
        };
        assert_eq!(err.kind(), ErrorKind::StorageOpen);
        assert!(existing.exists());
        assert!(!existing.join(DESCRIPTOR_FILE).exists());
    }

    #[test]
    fn destroy_in_existing_directory_keeps_foreign_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = Registry::with_builtins();
        let precious = dir.path().join("precious.txt");
        std::fs::write(&precious, b"keep me").expect("write");

        let location = StoreLocation::Path(dir.path().to_path_buf());
        let mut store = Store::open(location, &options(), &registry).expect("open");
        store.write_records(rows()).expect("write");
        store.destroy().expect("destroy");

        assert!(precious.exists());
        assert!(!dir.path().join(DATA_FILE).exists());
        assert!(!dir.path().join(DESCRIPTOR_FILE).exists());

        let reopened = Store::open(
            StoreLocation::Path(dir.path().to_path_buf()),
            &StoreOptions::new(),
            &registry,
        )
        .expect("reopen as fresh");
        assert!(reopened.schema().keys().is_empty());
    }

    #[test]
    fn destroy_removes_directory_it_created() {
        let parent = tempfile::tempdir().expect("tempdir");
        let registry = Registry::with_builtins();
        let path = parent.path().join("store");
        let mut store =
            Store::open(StoreLocation::Path(path.clone()), &options(), &registry).expect("open");
        store.write_records(rows()).expect("write");
        store.destroy().expect("destroy");
        assert!(!path.exists());

        std::fs::create_dir(&path).expect("mkdir");
        let store =
            Store::open(StoreLocation::Path(path.clone()), &options(), &registry).expect("open");
        store.destroy().expect("destroy");
        assert!(!path.exists());
    }

    #[test]
    fn path_store_reopens_with_persisted_schema() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("store");
        let registry = Registry::with_builtins();
        {
            let mut store = Store::open(StoreLocation::Path(path.clone()), &options(), &registry)
                .expect("create");
            assert_eq!(store.storage_name(), "log");
            store.write_records(rows()).expect("write");
            store.close().expect("close");
        }

        let reopened = Store::open(
            StoreLocation::Path(path.clone()),
            &StoreOptions::new(),
            &registry,
        )
        .expect("reopen");
        assert_eq!(reopened.schema().keys().len(), 2);
        assert_eq!(tallies(&reopened).len(), 2);
        drop(reopened);

        let same = Store::open(StoreLocation::Path(path.clone()), &options(), &registry)
            .expect("matching fields reopen");
        drop(same);

        let mismatch = StoreOptions::new().with_key("k", FieldKind::Int64);
        let err = match Store::open(StoreLocation::Path(path), &mismatch, &registry) {
            Ok(_) => panic!("schema mismatch"),
            Err(err) => err,
        };
        assert_eq!(err.kind(), ErrorKind::Schema);
    }

    #[test]
    fn second_open_of_same_path_is_busy() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = Registry::with_builtins();
        let location = StoreLocation::Path(dir.path().join("s"));
        let _first = Store::open(location.clone(), &options(), &registry).expect("first");
        let err = match Store::open(location, &StoreOptions::new(), &registry) {
            Ok(_) => panic!("expected busy"),
            Err(err) => err,
        };
        assert_eq!(err.kind(), ErrorKind::Busy);
    }

    #[test]
    fn temp_store_is_uniquely_named_and_destroyed() {
        let parent = tempfile::tempdir().expect("tempdir");
        let registry = Registry::with_builtins();
        let a = Store::open(
            StoreLocation::TempIn(parent.path().to_path_buf()),
            &options(),
            &registry,
        )
        .expect("a");
        let b = Store::open(
            StoreLocation::TempIn(parent.path().to_path_buf()),
            &options(),
            &registry,
        )
        .expect("b");
        let a_dir = a.location().expect("a dir").to_path_buf();
        assert_ne!(Some(a_dir.as_path()), b.location());
        let name = a_dir.file_name().and_then(|n| n.to_str()).expect("name");
        assert!(name.starts_with(TEMP_PREFIX));
        assert_eq!(name.len(), TEMP_PREFIX.len() + 16);

        a.destroy().expect("destroy");
        assert!(!a_dir.exists());
        b.destroy().expect("destroy");
    }

    #[test]
    fn receive_drains_channel_with_rollover() {
        let registry = Registry::with_builtins();
        let opts = options().with_limits(BatchLimits {
            max_entries: 2,
            max_bytes: 1024,
        });
        let mut store = Store::open(StoreLocation::Memory, &opts, &registry).expect("open");
        let (tx, rx) = mpsc::sync_channel(1);
        let producer = std::thread::spawn(move || {
            for (i, letter) in ["x", "y", "x", "z", "x"].into_iter().enumerate() {
                let row = json!({"k": 7, "_i_": i, "v": letter});
                tx.send(record_from_json(row).expect("record")).expect("send");
            }
        });
        assert_eq!(store.receive(rx).expect("receive"), 5);
        producer.join().expect("producer");

        let out = tallies(&store);
        assert_eq!(out.len(), 1);
        assert_eq!(
            out[0].get("t"),
            Some(&Value::Json(json!({"x": 3, "y": 1, "z": 1})))
        );
    }

    #[test]
    fn receive_commits_accepted_records_before_reporting_failure() {
        let registry = Registry::with_builtins();
        let mut store = Store::open(StoreLocation::Memory, &options(), &registry).expect("open");
        let (tx, rx) = mpsc::sync_channel(4);
        tx.send(record_from_json(json!({"k": 1, "_i_": 0, "v": "ok"})).expect("record"))
            .expect("send");
        tx.send(
            record_from_json(json!({"k": 1, "_i_": 1, "v": "x".repeat(70_000)})).expect("record"),
        )
        .expect("send");
        drop(tx);
        let err = store.receive(rx).expect_err("oversized");
        assert_eq!(err.kind(), ErrorKind::Encoding);
        assert_eq!(err.field(), Some("v"));

        let out = tallies(&store);
        assert_eq!(out[0].get("t"), Some(&Value::Json(json!({"ok": 1}))));
    }

    #[test]
    fn empty_store_yields_single_degenerate_record() {
        let registry = Registry::with_builtins();
        let store = Store::open(StoreLocation::Memory, &options(), &registry).expect("open");
        let out = store
            .group_by()
            .partial_key("k")
            .aggregate("n", "count(v)")
            .collect()
            .expect("group");
        assert_eq!(out, vec![Record::from([("n".to_string(), Value::Int64(0))])]);
    }

    #[test]
    fn bad_aggregation_is_reported_before_iteration() {
        let registry = Registry::with_builtins();
        let store = Store::open(StoreLocation::Memory, &options(), &registry).expect("open");
        let err = store
            .group_by()
            .aggregate("n", "median(v)")
            .collect()
            .expect_err("unknown op");
        assert_eq!(err.kind(), ErrorKind::Schema);
        assert_eq!(err.field(), Some("n"));
    }
}
