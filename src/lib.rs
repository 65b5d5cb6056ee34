// ABOUTME: Library crate for the MySQL binlog to Groonga command replicator
// ABOUTME: Exposes the config, mapping, source, and importer building blocks

pub mod command;
pub mod config;
pub mod error;
pub mod importer;
pub mod mapping;
pub mod schema;
pub mod source;
pub mod state;

pub use error::ReplicateError;
