// Schema model: ordered key fields, ordered value fields, and the null bitmask they imply.
use std::collections::HashSet;

use crate::core::codec::FieldKind;
use crate::core::error::{Error, ErrorKind};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Field {
    pub name: String,
    pub kind: FieldKind,
}

impl Field {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    /// Parses the `name:kind` form used on the command line.
    pub fn parse(spec: &str) -> Result<Self, Error> {
        let (name, kind) = spec.split_once(':').ok_or_else(|| {
            Error::new(ErrorKind::Usage)
                .with_message(format!("field spec {spec:?} must look like name:kind"))
        })?;
        if name.is_empty() {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("field spec {spec:?} has an empty name")));
        }
        Ok(Self::new(name, kind.parse()?))
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Schema {
    keys: Vec<Field>,
    values: Vec<Field>,
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    pub fn keys(&self) -> &[Field] {
        &self.keys
    }

    pub fn values(&self) -> &[Field] {
        &self.values
    }

    /// Bytes of null bitmask prepended to each value payload.
    pub fn mask_width(&self) -> usize {
        self.values.len().div_ceil(8).max(1)
    }

    pub fn key_position(&self, name: &str) -> Option<usize> {
        self.keys.iter().position(|field| field.name == name)
    }

    pub fn value_position(&self, name: &str) -> Option<usize> {
        self.values.iter().position(|field| field.name == name)
    }

    /// Resolves partial-key names to the number of leading key fields they cover.
    pub fn partial_key_prefix(&self, names: &[String]) -> Result<usize, Error> {
        for (slot, name) in names.iter().enumerate() {
            let position = self.key_position(name).ok_or_else(|| {
                Error::new(ErrorKind::Schema)
                    .with_message("unknown partial key field")
                    .with_field(name.as_str())
            })?;
            if position != slot {
                return Err(Error::new(ErrorKind::Schema)
                    .with_message(format!(
                        "partial key field is key #{} but was selected as #{}",
                        position + 1,
                        slot + 1
                    ))
                    .with_field(name.as_str())
                    .with_hint("Select leading key fields in declaration order."));
            }
        }
        Ok(names.len())
    }
}

#[derive(Clone, Debug, Default)]
pub struct SchemaBuilder {
    keys: Vec<Field>,
    values: Vec<Field>,
}

impl SchemaBuilder {
    pub fn key(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.keys.push(Field::new(name, kind));
        self
    }

    pub fn value(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.values.push(Field::new(name, kind));
        self
    }

    pub fn key_field(mut self, field: Field) -> Self {
        self.keys.push(field);
        self
    }

    pub fn value_field(mut self, field: Field) -> Self {
        self.values.push(field);
        self
    }

    pub fn build(self) -> Result<Schema, Error> {
        let mut seen = HashSet::new();
        for field in self.keys.iter().chain(self.values.iter()) {
            if field.name.is_empty() {
                return Err(Error::new(ErrorKind::Schema).with_message("field name is empty"));
            }
            if !seen.insert(field.name.as_str()) {
                return Err(Error::new(ErrorKind::Schema)
                    .with_message("field declared more than once")
                    .with_field(field.name.as_str()));
            }
        }
        Ok(Schema {
            keys: self.keys,
            values: self.values,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{Field, Schema};
    use crate::core::codec::FieldKind;
    use crate::core::error::ErrorKind;

    fn schema_with_values(count: usize) -> Schema {
        let mut builder = Schema::builder().key("k", FieldKind::Int32);
        for i in 0..count {
            builder = builder.value(format!("v{i}"), FieldKind::Int8);
        }
        builder.build().expect("schema")
    }

    #[test]
    fn mask_width_rounds_up_with_floor_of_one() {
        assert_eq!(schema_with_values(0).mask_width(), 1);
        assert_eq!(schema_with_values(1).mask_width(), 1);
        assert_eq!(schema_with_values(8).mask_width(), 1);
        assert_eq!(schema_with_values(9).mask_width(), 2);
        assert_eq!(schema_with_values(17).mask_width(), 3);
    }

    #[test]
    fn field_spec_parsing() {
        let field = Field::parse("amount:int64").expect("parse");
        assert_eq!(field, Field::new("amount", FieldKind::Int64));

        let err = Field::parse("amount").expect_err("missing kind");
        assert_eq!(err.kind(), ErrorKind::Usage);

        let err = Field::parse("amount:decimal").expect_err("bad kind");
        assert_eq!(err.kind(), ErrorKind::Schema);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let err = Schema::builder()
            .key("id", FieldKind::Int32)
            .value("id", FieldKind::String)
            .build()
            .expect_err("duplicate");
        assert_eq!(err.kind(), ErrorKind::Schema);
        assert_eq!(err.field(), Some("id"));
    }

    #[test]
    fn partial_key_must_be_a_leading_prefix() {
        let schema = Schema::builder()
            .key("a", FieldKind::Int32)
            .key("b", FieldKind::String)
            .key("c", FieldKind::Int8)
            .build()
            .expect("schema");

        assert_eq!(schema.partial_key_prefix(&[]).expect("empty"), 0);
        assert_eq!(
            schema
                .partial_key_prefix(&["a".into(), "b".into()])
                .expect("prefix"),
            2
        );

        let err = schema
            .partial_key_prefix(&["b".into()])
            .expect_err("not leading");
        assert_eq!(err.kind(), ErrorKind::Schema);
        assert_eq!(err.field(), Some("b"));

        let err = schema
            .partial_key_prefix(&["a".into(), "a".into()])
            .expect_err("repeated");
        assert_eq!(err.kind(), ErrorKind::Schema);

        let err = schema
            .partial_key_prefix(&["zzz".into()])
            .expect_err("unknown");
        assert_eq!(err.kind(), ErrorKind::Schema);
        assert!(err.message().unwrap().contains("unknown"));
    }
}
