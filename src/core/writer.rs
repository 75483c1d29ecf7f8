// Record writer: dynamic record -> (key bytes, null bitmask + value bytes) -> backend insert.
use crate::core::error::Error;
use crate::core::schema::Schema;
use crate::core::storage::Writer;
use crate::core::value::{Record, Value};

/// Encodes `record` under `schema`, removing the consumed key fields from it.
pub fn encode_record(schema: &Schema, record: &mut Record) -> Result<(Vec<u8>, Vec<u8>), Error> {
    let mut key = Vec::new();
    for field in schema.keys() {
        let value = record
            .remove(&field.name)
            .unwrap_or_else(|| field.kind.default_value());
        field
            .kind
            .encode_into(&value, &mut key)
            .map_err(|err| err.with_field(field.name.as_str()))?;
    }

    let mut payload = Vec::new();
    if !schema.values().is_empty() {
        payload.resize(schema.mask_width(), 0u8);
        for (i, field) in schema.values().iter().enumerate() {
            match record.get(&field.name) {
                None | Some(Value::Null) => payload[i / 8] |= 1 << (7 - (i % 8)),
                Some(value) => field
                    .kind
                    .encode_into(value, &mut payload)
                    .map_err(|err| err.with_field(field.name.as_str()))?,
            }
        }
    }
    Ok((key, payload))
}

pub struct RecordWriter<'a> {
    schema: &'a Schema,
    inner: Writer<'a>,
}

impl<'a> RecordWriter<'a> {
    pub fn new(schema: &'a Schema, inner: Writer<'a>) -> Self {
        Self { schema, inner }
    }

    pub fn write(&mut self, record: &mut Record) -> Result<(), Error> {
        let (key, value) = encode_record(self.schema, record)?;
        self.inner.insert(&key, &value)
    }

    pub fn written(&self) -> u64 {
        self.inner.inserted()
    }

    pub fn commit(self) -> Result<u64, Error> {
        self.inner.commit()
    }
}

#[cfg(test)]
mod tests {
    use super::{RecordWriter, encode_record};
    use crate::core::codec::FieldKind;
    use crate::core::error::ErrorKind;
    use crate::core::schema::Schema;
    use crate::core::storage::memory::MemoryBackend;
    use crate::core::storage::{Backend, BatchLimits};
    use crate::core::value::{Record, Value};

    fn record(pairs: &[(&str, Value)]) -> Record {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn key_fields_concatenate_in_schema_order_and_are_consumed() {
        let schema = Schema::builder()
            .key("a", FieldKind::Int16)
            .key("b", FieldKind::String)
            .build()
            .expect("schema");
        let mut rec = record(&[
            ("b", Value::from("hi")),
            ("a", Value::Int64(2)),
            ("extra", Value::Int64(9)),
        ]);
        let (key, value) = encode_record(&schema, &mut rec).expect("encode");
        assert_eq!(key, vec![0, 2, 0, 2, b'h', b'i']);
        assert!(value.is_empty());
        assert!(!rec.contains_key("a"));
        assert!(!rec.contains_key("b"));
        assert!(rec.contains_key("extra"));
    }

    #[test]
    fn missing_key_field_uses_the_kind_default() {
        let schema = Schema::builder()
            .key("n", FieldKind::Int32)
            .key("s", FieldKind::String)
            .build()
            .expect("schema");
        let (key, _) = encode_record(&schema, &mut Record::new()).expect("encode");
        assert_eq!(key, vec![0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn absent_and_null_values_set_mask_bits_without_payload() {
        let mut builder = Schema::builder().key("k", FieldKind::Int8);
        for i in 0..10 {
            builder = builder.value(format!("v{i}"), FieldKind::Int8);
        }
        let schema = builder.build().expect("schema");

        let mut rec = record(&[("k", Value::Int8(1)), ("v0", Value::Int8(5))]);
        for i in 1..10 {
            if i != 9 {
                rec.insert(format!("v{i}"), Value::Int8(i as i8));
            }
        }
        rec.insert("v3".into(), Value::Null);

        let (_, value) = encode_record(&schema, &mut rec).expect("encode");
        assert_eq!(value.len(), 2 + 8);
        assert_eq!(value[0], 0b0001_0000);
        assert_eq!(value[1], 0b0100_0000);
        assert_eq!(&value[2..], &[5, 1, 2, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn encoding_failures_name_the_field() {
        let schema = Schema::builder()
            .key("k", FieldKind::Int8)
            .value("body", FieldKind::String)
            .build()
            .expect("schema");
        let mut rec = record(&[("body", Value::String("x".repeat(70_000)))]);
        let err = encode_record(&schema, &mut rec).expect_err("oversized");
        assert_eq!(err.kind(), ErrorKind::Encoding);
        assert_eq!(err.field(), Some("body"));
    }

    #[test]
    fn record_writer_counts_only_accepted_records() {
        let schema = Schema::builder()
            .key("k", FieldKind::Int8)
            .value("body", FieldKind::String)
            .build()
            .expect("schema");
        let mut backend: Box<dyn Backend> = Box::new(MemoryBackend::new(BatchLimits::default()));
        let mut writer = RecordWriter::new(&schema, backend.new_writer());
        let mut ok = record(&[("k", Value::Int8(1)), ("body", Value::from("hi"))]);
        writer.write(&mut ok).expect("write");
        assert!(!ok.contains_key("k"));
        let mut too_big = record(&[
            ("k", Value::Int8(2)),
            ("body", Value::String("x".repeat(70_000))),
        ]);
        writer.write(&mut too_big).expect_err("oversized");
        assert_eq!(writer.written(), 1);
        assert_eq!(writer.commit().expect("commit"), 1);
    }
}
