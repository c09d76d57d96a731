//! Persistence layer: libSQL-backed storage for accounts, cursors,
//! conversation threads and the relay job queue table.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{Account, ConversationThread, Database, NewAccount, Watermark};
