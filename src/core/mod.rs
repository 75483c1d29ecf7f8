// Core modules: value model, field codec, schema, storage, writer, merge engine.
pub mod aggregate;
pub mod codec;
pub mod descriptor;
pub mod error;
pub mod frame;
pub mod merge;
pub mod schema;
pub mod storage;
pub mod store;
pub mod value;
pub mod writer;
