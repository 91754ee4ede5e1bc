//! Data models for the Cometa store.
//!
//! Records are schemaless JSON objects; the typed models here are the envelopes the
//! store and backup pipeline put around them.

mod datastore;
mod manifest;
mod metadata;
mod record;

pub use datastore::*;
pub use manifest::*;
pub use metadata::*;
pub use record::*;
