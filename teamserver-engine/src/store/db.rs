use std::path::Path;

use parking_lot::Mutex;
use rusqlite::Connection;
use teamserver_core::error::{Error, Result};

/// SQLite connection shared by the credential store and the certificate
/// manager.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Opens (or creates) the database at `path` and applies migrations.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(store_error)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(store_error)?;
        Self::with_connection(conn)
    }

    /// Opens a private in-memory database, used by tests and embedders that
    /// do not want anything on disk.
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory().map_err(store_error)?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(store_error)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Runs `f` with exclusive access to the connection.
    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let mut conn = self.conn.lock();
        f(&mut conn).map_err(store_error)
    }

    fn run_migrations(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "
                CREATE TABLE IF NOT EXISTS users (
                    id          TEXT PRIMARY KEY,
                    name        TEXT NOT NULL UNIQUE,
                    created_at  TEXT NOT NULL,
                    last_seen   TEXT
                );

                CREATE TABLE IF NOT EXISTS user_tokens (
                    token_hash  TEXT PRIMARY KEY,
                    user_id     TEXT NOT NULL,
                    issued_at   TEXT NOT NULL,
                    FOREIGN KEY(user_id) REFERENCES users(id) ON DELETE CASCADE
                );

                CREATE INDEX IF NOT EXISTS idx_user_tokens_user
                    ON user_tokens(user_id);

                CREATE TABLE IF NOT EXISTS certificates (
                    ca_type     TEXT NOT NULL,
                    namespace   TEXT NOT NULL,
                    subject     TEXT NOT NULL,
                    cert_pem    TEXT NOT NULL,
                    key_pem     TEXT NOT NULL,
                    created_at  TEXT NOT NULL,
                    PRIMARY KEY (ca_type, namespace, subject)
                );
                ",
            )
        })?;

        tracing::debug!("database migrations completed");
        Ok(())
    }
}

pub(crate) fn store_error(err: rusqlite::Error) -> Error {
    Error::Store(err.to_string())
}
