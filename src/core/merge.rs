//! Purpose: Streaming group-by over a backend's ascending iteration.
//! Exports: `Merger`, `MergeStats`.
//! Role: Detects partial-key group boundaries, decodes values, runs aggregations per group.
//! Invariants: One pass, no sorting; memory is bounded by the largest single group.
//! Invariants: The partial key is always a leading prefix of the key fields.
//! Invariants: An empty store still emits exactly one record (unset keys, empty aggregations).
//! Invariants: A failing sink stops iteration immediately; no later group is emitted.
use tracing::debug;

use crate::core::aggregate::NamedAggregation;
use crate::core::error::{Error, ErrorKind};
use crate::core::schema::{Field, Schema};
use crate::core::storage::Backend;
use crate::core::value::Record;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct MergeStats {
    pub entries: u64,
    pub groups: u64,
}

#[derive(Debug)]
pub struct Merger {
    partial_keys: Vec<Field>,
    values: Vec<Field>,
    mask_width: usize,
    aggs: Vec<NamedAggregation>,
}

struct Group {
    prefix: Vec<u8>,
    key: Record,
    values: Vec<Record>,
}

enum GroupState {
    Idle,
    InGroup(Group),
}

impl Merger {
    pub fn new(
        schema: &Schema,
        partial_keys: &[String],
        aggs: Vec<NamedAggregation>,
    ) -> Result<Self, Error> {
        let prefix = schema.partial_key_prefix(partial_keys)?;
        for (i, agg) in aggs.iter().enumerate() {
            let source = agg.aggregator.field();
            if schema.value_position(source).is_none() {
                let message = if schema.key_position(source).is_some() {
                    "aggregation source is a key field, not a value field"
                } else {
                    "unknown aggregation field"
                };
                return Err(Error::new(ErrorKind::Schema)
                    .with_message(message)
                    .with_field(source));
            }
            if aggs[..i].iter().any(|prior| prior.output == agg.output)
                || partial_keys.contains(&agg.output)
            {
                return Err(Error::new(ErrorKind::Schema)
                    .with_message("aggregation output name is already in use")
                    .with_field(agg.output.as_str()));
            }
        }
        Ok(Self {
            partial_keys: schema.keys()[..prefix].to_vec(),
            values: schema.values().to_vec(),
            mask_width: schema.mask_width(),
            aggs,
        })
    }

    /// Decodes the partial-key prefix; returns the bytes it spans and the decoded fields.
    pub fn restore_key<'k>(&self, key: &'k [u8]) -> Result<(&'k [u8], Record), Error> {
        let mut record = Record::new();
        let mut offset = 0usize;
        for field in &self.partial_keys {
            let (value, used) = field
                .kind
                .decode(&key[offset..])
                .map_err(|err| err.with_field(field.name.as_str()))?;
            offset += used;
            record.insert(field.name.clone(), value);
        }
        Ok((&key[..offset], record))
    }

    pub fn restore_value(&self, value: &[u8]) -> Result<Record, Error> {
        let mask = value.get(..self.mask_width).ok_or_else(|| {
            Error::new(ErrorKind::Encoding).with_message(format!(
                "value payload of {} bytes is shorter than its {}-byte null bitmask",
                value.len(),
                self.mask_width
            ))
        })?;
        let body = &value[self.mask_width..];
        let mut record = Record::new();
        let mut offset = 0usize;
        for (i, field) in self.values.iter().enumerate() {
            if mask[i / 8] & (1 << (7 - (i % 8))) != 0 {
                continue;
            }
            let (decoded, used) = field
                .kind
                .decode(&body[offset..])
                .map_err(|err| err.with_field(field.name.as_str()))?;
            offset += used;
            record.insert(field.name.clone(), decoded);
        }
        Ok(record)
    }

    pub fn merge(&self, mut key: Record, values: &[Record]) -> Record {
        for agg in &self.aggs {
            agg.apply(&mut key, values);
        }
        key
    }

    pub fn run(
        &self,
        backend: &dyn Backend,
        emit: &mut dyn FnMut(Record) -> Result<(), Error>,
    ) -> Result<MergeStats, Error> {
        let mut stats = MergeStats::default();
        let mut state = GroupState::Idle;
        let mut spare: Vec<Record> = Vec::new();

        let mut finish = |group: Group, stats: &mut MergeStats| -> Result<Vec<Record>, Error> {
            let Group {
                key, mut values, ..
            } = group;
            let merged = self.merge(key, &values);
            stats.groups += 1;
            emit(merged).map_err(callback_error)?;
            values.clear();
            Ok(values)
        };

        let iterated = backend.iterate(&mut |key, value| {
            stats.entries += 1;
            let (prefix, key_record) = self.restore_key(key).map_err(decode_error)?;
            let boundary = match &state {
                GroupState::Idle => true,
                GroupState::InGroup(group) => group.prefix.as_slice() != prefix,
            };
            if boundary {
                if let GroupState::InGroup(done) = std::mem::replace(&mut state, GroupState::Idle)
                {
                    spare = finish(done, &mut stats)?;
                }
                state = GroupState::InGroup(Group {
                    prefix: prefix.to_vec(),
                    key: key_record,
                    values: std::mem::take(&mut spare),
                });
            }
            if self.values.is_empty() {
                return Ok(());
            }
            let decoded = self.restore_value(value).map_err(decode_error)?;
            if let GroupState::InGroup(group) = &mut state {
                group.values.push(decoded);
            }
            Ok(())
        });
        iterated.map_err(iteration_error)?;

        let last = match state {
            GroupState::InGroup(group) => group,
            GroupState::Idle => Group {
                prefix: Vec::new(),
                key: Record::new(),
                values: Vec::new(),
            },
        };
        finish(last, &mut stats)?;
        debug!(entries = stats.entries, groups = stats.groups, "merge finished");
        Ok(stats)
    }
}

fn decode_error(err: Error) -> Error {
    err.into_kind(ErrorKind::Iteration)
}

fn iteration_error(err: Error) -> Error {
    match err.kind() {
        ErrorKind::Callback | ErrorKind::Iteration => err,
        _ => err.into_kind(ErrorKind::Iteration),
    }
}

fn callback_error(err: Error) -> Error {
    match err.kind() {
        ErrorKind::Callback => err,
        _ => Error::new(ErrorKind::Callback)
            .with_message("result sink failed")
            .with_source(err),
    }
}
