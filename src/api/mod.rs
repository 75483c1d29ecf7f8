//! Purpose: Define the stable public Rust API boundary for mergekv.
//! Exports: Store lifecycle, schema and field kinds, values, aggregators, backends, errors.
//! Role: Public, additive-only surface used by the CLI and embedding callers.
//! Invariants: Everything the CLI needs is reachable from here without naming `core` paths.

#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::aggregate::{Aggregator, AggregatorCtor, AggregatorRegistry, NamedAggregation};
pub use crate::core::codec::{FieldKind, MAX_VARLEN};
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::merge::{MergeStats, Merger};
pub use crate::core::schema::{Field, Schema, SchemaBuilder};
pub use crate::core::storage::{
    Backend, BatchLimits, Durability, OpenFn, OpenRequest, Registry, Visit, WriteBatch, Writer,
};
pub use crate::core::store::{GroupBy, Store, StoreLocation, StoreOptions};
pub use crate::core::value::{Record, Value, record_from_json, record_to_json};
pub use crate::core::writer::{RecordWriter, encode_record};
pub use crate::core::descriptor::{DESCRIPTOR_FILE, FieldSpec, SchemaDescriptor};
