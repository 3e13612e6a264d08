//! Streaming CSV parsing with dialect guessing and per-cell type inference.
//!
//! The decoder turns arbitrarily sliced byte chunks into rows backed by
//! append-only arenas; field access is zero-copy, with quoted escapes
//! materialized lazily. `reader::CsvReader` is the synchronous pull facade
//! over any `source::ByteSource`; `stream::AsyncCsvReader` is the same loop
//! over an async chunk stream.

pub mod decoder;
pub mod dialect;
pub mod errors;
pub mod infer;
pub mod reader;
pub mod row;
pub mod source;
pub mod stream;
