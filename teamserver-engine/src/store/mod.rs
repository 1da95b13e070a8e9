//! SQLite persistence for user identities and issued leaf certificates.
//!
//! A single [`Database`] owns the connection behind a mutex so writers are
//! serialized; the user and certificate tables are exposed through
//! [`SqliteCredentialStore`] and the leaf helpers in [`certificates`].

pub mod certificates;
mod db;
mod users;

pub use db::Database;
pub use users::{CredentialStore, SqliteCredentialStore, UserRecord, validate_user_name};
