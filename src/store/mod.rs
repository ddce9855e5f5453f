//! Persistence layer: libSQL-backed storage for customers, conversations
//! and prompt experiments.

mod libsql_backend;
mod migrations;
mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{Database, UnrepliedQuery};
