//! Purpose: Shared library crate behind the `mergekv` CLI and tests.
//! Exports: `api` (stable surface), `core` (codec, storage backends, merge engine, errors).
//! Role: Embeddable ordered-store engine; the binary is a thin stdin/stdout driver over it.
//! Invariants: Callers should depend on `api`; `core` layout may change between releases.
//! Invariants: Core modules prefer explicit inputs/outputs over hidden state.
pub mod api;
pub mod core;
