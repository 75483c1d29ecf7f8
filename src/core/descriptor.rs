//! Purpose: Persist the schema and backend choice beside a store so it reopens identically.
//! Exports: `SchemaDescriptor`, `FieldSpec`, `DESCRIPTOR_FILE`.
//! Role: Sidecar contract between store creation and later reopen.
//! Invariants: JSON shape is `{store, keys: [{name, kind}], values: [{name, kind}]}`.
//! Invariants: Written once at creation; readers never rewrite it.
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::error::{Error, ErrorKind};
use crate::core::schema::{Field, Schema};

pub const DESCRIPTOR_FILE: &str = "schema.json";

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: String,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    pub store: String,
    pub keys: Vec<FieldSpec>,
    pub values: Vec<FieldSpec>,
}

impl SchemaDescriptor {
    pub fn new(store: impl Into<String>, schema: &Schema) -> Self {
        Self {
            store: store.into(),
            keys: schema.keys().iter().map(field_spec).collect(),
            values: schema.values().iter().map(field_spec).collect(),
        }
    }

    pub fn schema(&self) -> Result<Schema, Error> {
        let mut builder = Schema::builder();
        for spec in &self.keys {
            builder = builder.key_field(Field::new(spec.name.as_str(), spec.kind.parse()?));
        }
        for spec in &self.values {
            builder = builder.value_field(Field::new(spec.name.as_str(), spec.kind.parse()?));
        }
        builder.build()
    }

    pub fn path_in(dir: &Path) -> PathBuf {
        dir.join(DESCRIPTOR_FILE)
    }

    /// Temporary file `save` writes before renaming it into place.
    pub fn staging_path_in(dir: &Path) -> PathBuf {
        dir.join(format!("{DESCRIPTOR_FILE}.tmp"))
    }

    /// Reads the descriptor in `dir`, or `None` when the directory holds no store yet.
    pub fn load(dir: &Path) -> Result<Option<Self>, Error> {
        let path = Self::path_in(dir);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(Error::new(ErrorKind::StorageOpen)
                    .with_message("failed to read schema descriptor")
                    .with_path(&path)
                    .with_source(err));
            }
        };
        let descriptor = serde_json::from_slice(&bytes).map_err(|err| {
            Error::new(ErrorKind::Encoding)
                .with_message("malformed schema descriptor")
                .with_path(&path)
                .with_source(err)
        })?;
        Ok(Some(descriptor))
    }

    pub fn save(&self, dir: &Path) -> Result<(), Error> {
        let path = Self::path_in(dir);
        let tmp = Self::staging_path_in(dir);
        let body = serde_json::to_vec_pretty(self).map_err(|err| {
            Error::new(ErrorKind::Encoding)
                .with_message("failed to serialize schema descriptor")
                .with_source(err)
        })?;
        let io_err = |err: std::io::Error| {
            Error::new(ErrorKind::Io)
                .with_message("failed to write schema descriptor")
                .with_path(&path)
                .with_source(err)
        };
        let mut file = fs::File::create(&tmp).map_err(io_err)?;
        file.write_all(&body).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        fs::rename(&tmp, &path).map_err(io_err)?;
        Ok(())
    }
}

fn field_spec(field: &Field) -> FieldSpec {
    FieldSpec {
        name: field.name.clone(),
        kind: field.kind.as_str().to_string(),
    }
}
