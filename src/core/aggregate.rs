//! Purpose: Named reductions applied to the decoded value records of one group.
//! Exports: `Aggregator`, `NamedAggregation`, `AggregatorRegistry`, builtin reducers.
//! Role: Pluggable reduction step invoked by the merge engine once per group.
//! Invariants: Operators are resolved through the registry; unknown names fail at configuration.
//! Invariants: Integer reducers accept every integer width and compare as `i64`.
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde_json::{Map, Value as JsonValue};

use crate::core::error::{Error, ErrorKind};
use crate::core::value::{Record, Value};

pub trait Aggregator: fmt::Debug + Send + Sync {
    /// Source field the reducer reads from each record.
    fn field(&self) -> &str;

    fn reduce(&self, records: &[Record]) -> Value;
}

pub type AggregatorCtor = fn(String) -> Box<dyn Aggregator>;

#[derive(Debug)]
pub struct NamedAggregation {
    pub output: String,
    pub aggregator: Box<dyn Aggregator>,
}

impl NamedAggregation {
    pub fn new(output: impl Into<String>, aggregator: Box<dyn Aggregator>) -> Self {
        Self {
            output: output.into(),
            aggregator,
        }
    }

    pub fn apply(&self, target: &mut Record, records: &[Record]) {
        target.insert(self.output.clone(), self.aggregator.reduce(records));
    }
}

#[derive(Clone)]
pub struct AggregatorRegistry {
    ctors: BTreeMap<String, AggregatorCtor>,
}

impl AggregatorRegistry {
    pub fn empty() -> Self {
        Self {
            ctors: BTreeMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("first", |field| Box::new(First { field }));
        registry.register("first_not_null", |field| Box::new(FirstNotNull { field }));
        registry.register("min", |field| Box::new(Min { field }));
        registry.register("max", |field| Box::new(Max { field }));
        registry.register("sum", |field| Box::new(Sum { field }));
        registry.register("count", |field| Box::new(Count { field }));
        registry.register("count_distinct", |field| Box::new(CountDistinct { field }));
        registry.register("tally", |field| Box::new(Tally { field }));
        registry
    }

    pub fn register(&mut self, op: impl Into<String>, ctor: AggregatorCtor) {
        self.ctors.insert(op.into(), ctor);
    }

    pub fn operators(&self) -> impl Iterator<Item = &str> + '_ {
        self.ctors.keys().map(String::as_str)
    }

    pub fn build(&self, op: &str, field: &str) -> Result<Box<dyn Aggregator>, Error> {
        let ctor = self.ctors.get(op).ok_or_else(|| {
            let known = self.operators().collect::<Vec<_>>().join(", ");
            Error::new(ErrorKind::Schema)
                .with_message(format!("unsupported aggregation operator {op:?}"))
                .with_hint(format!("Known operators: {known}."))
        })?;
        Ok(ctor(field.to_string()))
    }

    /// Parses `op(field)`; `op{field}` is accepted for shells that mangle parentheses.
    pub fn parse(&self, expr: &str) -> Result<Box<dyn Aggregator>, Error> {
        let (op, field) = split_call(expr).ok_or_else(|| {
            Error::new(ErrorKind::Usage)
                .with_message(format!("aggregation {expr:?} must look like op(field)"))
        })?;
        self.build(op, field)
    }
}

impl Default for AggregatorRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

fn split_call(expr: &str) -> Option<(&str, &str)> {
    let expr = expr.trim();
    let open = expr.find(['(', '{'])?;
    let close = match expr.as_bytes()[open] {
        b'(' => ')',
        _ => '}',
    };
    let inner = expr[open + 1..].strip_suffix(close)?;
    let op = expr[..open].trim();
    let field = inner.trim();
    if op.is_empty() || field.is_empty() {
        return None;
    }
    Some((op, field))
}

fn occurrences<'r>(records: &'r [Record], field: &'r str) -> impl Iterator<Item = &'r Value> + 'r {
    records.iter().filter_map(move |record| record.get(field))
}

fn integers<'r>(records: &'r [Record], field: &'r str) -> impl Iterator<Item = i64> + 'r {
    occurrences(records, field).filter_map(Value::as_i64)
}

#[derive(Debug)]
pub struct First {
    field: String,
}

impl Aggregator for First {
    fn field(&self) -> &str {
        &self.field
    }

    fn reduce(&self, records: &[Record]) -> Value {
        records
            .first()
            .and_then(|record| record.get(&self.field))
            .cloned()
            .unwrap_or(Value::Null)
    }
}

#[derive(Debug)]
pub struct FirstNotNull {
    field: String,
}

impl Aggregator for FirstNotNull {
    fn field(&self) -> &str {
        &self.field
    }

    fn reduce(&self, records: &[Record]) -> Value {
        occurrences(records, &self.field)
            .find(|value| !value.is_null())
            .cloned()
            .unwrap_or(Value::Null)
    }
}

#[derive(Debug)]
pub struct Min {
    field: String,
}

impl Aggregator for Min {
    fn field(&self) -> &str {
        &self.field
    }

    fn reduce(&self, records: &[Record]) -> Value {
        integers(records, &self.field)
            .min()
            .map_or(Value::Null, Value::Int64)
    }
}

#[derive(Debug)]
pub struct Max {
    field: String,
}

impl Aggregator for Max {
    fn field(&self) -> &str {
        &self.field
    }

    fn reduce(&self, records: &[Record]) -> Value {
        integers(records, &self.field)
            .max()
            .map_or(Value::Null, Value::Int64)
    }
}

#[derive(Debug)]
pub struct Sum {
    field: String,
}

impl Aggregator for Sum {
    fn field(&self) -> &str {
        &self.field
    }

    fn reduce(&self, records: &[Record]) -> Value {
        Value::Int64(integers(records, &self.field).fold(0i64, i64::wrapping_add))
    }
}

#[derive(Debug)]
pub struct Count {
    field: String,
}

impl Aggregator for Count {
    fn field(&self) -> &str {
        &self.field
    }

    fn reduce(&self, records: &[Record]) -> Value {
        Value::Int64(occurrences(records, &self.field).count() as i64)
    }
}

#[derive(Debug)]
pub struct CountDistinct {
    field: String,
}

impl Aggregator for CountDistinct {
    fn field(&self) -> &str {
        &self.field
    }

    fn reduce(&self, records: &[Record]) -> Value {
        let distinct: BTreeSet<String> = occurrences(records, &self.field)
            .filter(|value| !value.is_null())
            .map(|value| value.to_json().to_string())
            .collect();
        Value::Int64(distinct.len() as i64)
    }
}

#[derive(Debug)]
pub struct Tally {
    field: String,
}

impl Aggregator for Tally {
    fn field(&self) -> &str {
        &self.field
    }

    fn reduce(&self, records: &[Record]) -> Value {
        let mut counts: BTreeMap<String, u64> = BTreeMap::new();
        for value in occurrences(records, &self.field).filter(|value| !value.is_null()) {
            *counts.entry(value.display_key()).or_default() += 1;
        }
        let map: Map<String, JsonValue> = counts
            .into_iter()
            .map(|(key, count)| (key, JsonValue::from(count)))
            .collect();
        Value::Json(JsonValue::Object(map))
    }
}
