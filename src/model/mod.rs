//! Core data model of the ingest path.
//!
//! A [`Record`] is the raw unit a source adapter emits; related records are
//! folded into a typed [`Document`]; oversized documents are split into
//! chunks (documents whose serialization fits a bound); chunks yield atomic
//! [`Fact`]s. The persisted form of a fact lives in [`crate::store`].

mod document;
mod fact;
mod record;

pub use document::{Document, DocumentBody, Turn, chunk_id, normalize_tag, parent_document_id};
pub use fact::Fact;
pub use record::Record;
