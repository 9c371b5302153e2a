//! Persistence layer — libSQL-backed storage for outgoing and incoming mail.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlRepository;
pub use traits::Repository;
