// Database module
// SQLite holds sources, chunks, cache, failures and migration jobs; LanceDB holds vectors

pub mod lancedb;
pub mod sqlite;

pub use sqlite::*;
