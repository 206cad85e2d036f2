//! Metadata storage layer.
//!
//! The metadata store keeps track of stored files and resolves backend
//! object ids to the descriptors the streaming engine needs.  The
//! [`store::MetadataStore`] trait defines the interface;
//! [`sqlite::SqliteMetadataStore`] is the default implementation.

pub mod memory;
pub mod sqlite;
pub mod store;
