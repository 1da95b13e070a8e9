use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use serde::Serialize;
use teamserver_core::error::{Error, Result};
use uuid::Uuid;

use super::db::Database;

/// A stored user identity. The bearer token itself is never stored, only
/// its SHA-256 hash in the `user_tokens` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserRecord {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub last_seen: Option<DateTime<Utc>>,
}

/// User identity persistence, as seen by the auth middleware and the server.
pub trait CredentialStore: Send + Sync {
    /// Records `token_hash` for `name`, creating the user on first issuance.
    ///
    /// Issuing again for an existing user adds a token; earlier tokens stay
    /// valid until the user is deleted.
    fn issue_token(&self, name: &str, token_hash: &str) -> Result<UserRecord>;

    /// Resolves a token hash to its owner.
    fn user_by_token_hash(&self, token_hash: &str) -> Result<Option<UserRecord>>;

    fn user_by_name(&self, name: &str) -> Result<Option<UserRecord>>;

    /// All users, ordered by name.
    fn list_users(&self) -> Result<Vec<UserRecord>>;

    /// Deletes the user and every token issued to it. Returns whether it
    /// existed.
    fn delete_user(&self, name: &str) -> Result<bool>;

    fn touch_last_seen(&self, name: &str, at: DateTime<Utc>) -> Result<()>;
}

/// User names are restricted to `[A-Za-z0-9_-]+` so they are safe in file
/// names and certificate subjects.
pub fn validate_user_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "invalid user name {name:?}: expected 1-64 characters of [A-Za-z0-9_-]"
        )))
    }
}

pub struct SqliteCredentialStore {
    db: Arc<Database>,
}

impl SqliteCredentialStore {
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRecord> {
        let id: String = row.get(0)?;
        let created_at: String = row.get(2)?;
        let last_seen: Option<String> = row.get(3)?;

        let id = Uuid::parse_str(&id).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?;

        Ok(UserRecord {
            id,
            name: row.get(1)?,
            created_at: parse_timestamp(&created_at, 2)?,
            last_seen: last_seen.map(|ts| parse_timestamp(&ts, 3)).transpose()?,
        })
    }
}

fn parse_timestamp(value: &str, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                column,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

const USER_COLUMNS: &str = "u.id, u.name, u.created_at, u.last_seen";

impl CredentialStore for SqliteCredentialStore {
    fn issue_token(&self, name: &str, token_hash: &str) -> Result<UserRecord> {
        validate_user_name(name)?;
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT OR IGNORE INTO users (id, name, created_at) VALUES (?1, ?2, ?3)",
                params![Uuid::new_v4().to_string(), name, now],
            )?;
            let user = tx.query_row(
                &format!("SELECT {USER_COLUMNS} FROM users u WHERE u.name = ?1"),
                params![name],
                Self::row_to_user,
            )?;
            tx.execute(
                "INSERT INTO user_tokens (token_hash, user_id, issued_at) VALUES (?1, ?2, ?3)",
                params![token_hash, user.id.to_string(), now],
            )?;
            tx.commit()?;
            Ok(user)
        })
    }

    fn user_by_token_hash(&self, token_hash: &str) -> Result<Option<UserRecord>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {USER_COLUMNS} FROM users u
                     JOIN user_tokens t ON t.user_id = u.id
                     WHERE t.token_hash = ?1"
                ),
                params![token_hash],
                Self::row_to_user,
            )
            .optional()
        })
    }

    fn user_by_name(&self, name: &str) -> Result<Option<UserRecord>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {USER_COLUMNS} FROM users u WHERE u.name = ?1"),
                params![name],
                Self::row_to_user,
            )
            .optional()
        })
    }

    fn list_users(&self) -> Result<Vec<UserRecord>> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {USER_COLUMNS} FROM users u ORDER BY u.name"))?;
            let rows = stmt.query_map([], Self::row_to_user)?;
            rows.collect()
        })
    }

    fn delete_user(&self, name: &str) -> Result<bool> {
        let deleted = self
            .db
            .with_conn(|conn| conn.execute("DELETE FROM users WHERE name = ?1", params![name]))?;
        Ok(deleted > 0)
    }

    fn touch_last_seen(&self, name: &str, at: DateTime<Utc>) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE users SET last_seen = ?1 WHERE name = ?2",
                params![at.to_rfc3339(), name],
            )
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SqliteCredentialStore {
        SqliteCredentialStore::new(Arc::new(Database::open_in_memory().unwrap()))
    }

    #[test]
    fn given_issued_token_when_looking_up_hash_then_owner_is_returned() {
        let store = store();
        let created = store.issue_token("alice", "hash-a").unwrap();

        let found = store.user_by_token_hash("hash-a").unwrap().unwrap();
        assert_eq!(found, created);
        assert!(found.last_seen.is_none());
        assert!(store.user_by_token_hash("hash-b").unwrap().is_none());
    }

    #[test]
    fn given_reissued_user_when_looking_up_both_hashes_then_both_resolve_to_same_user() {
        let store = store();
        let first = store.issue_token("alice", "hash-1").unwrap();
        let second = store.issue_token("alice", "hash-2").unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(store.user_by_token_hash("hash-1").unwrap().unwrap().id, first.id);
        assert_eq!(store.user_by_token_hash("hash-2").unwrap().unwrap().id, first.id);
        assert_eq!(store.list_users().unwrap().len(), 1);
    }

    #[test]
    fn given_duplicate_token_hash_when_issuing_then_store_error() {
        let store = store();
        store.issue_token("alice", "same").unwrap();
        let err = store.issue_token("bob", "same").unwrap_err();
        assert!(matches!(err, Error::Store(_)));
        // The failed transaction must not leave bob behind.
        assert!(store.user_by_name("bob").unwrap().is_none());
    }

    #[test]
    fn given_deleted_user_when_looking_up_tokens_then_none() {
        let store = store();
        store.issue_token("alice", "hash-1").unwrap();
        store.issue_token("alice", "hash-2").unwrap();

        assert!(store.delete_user("alice").unwrap());
        assert!(store.user_by_token_hash("hash-1").unwrap().is_none());
        assert!(store.user_by_token_hash("hash-2").unwrap().is_none());
        assert!(!store.delete_user("alice").unwrap());
    }

    #[test]
    fn given_users_when_listing_then_ordered_by_name() {
        let store = store();
        store.issue_token("zoe", "z").unwrap();
        store.issue_token("alice", "a").unwrap();
        let names: Vec<_> = store.list_users().unwrap().into_iter().map(|u| u.name).collect();
        assert_eq!(names, ["alice", "zoe"]);
    }

    #[test]
    fn given_touch_when_reading_user_then_last_seen_is_set() {
        let store = store();
        store.issue_token("alice", "a").unwrap();
        let at = Utc::now();
        store.touch_last_seen("alice", at).unwrap();
        let seen = store.user_by_name("alice").unwrap().unwrap().last_seen.unwrap();
        assert_eq!(seen.timestamp(), at.timestamp());
    }

    #[test]
    fn given_invalid_names_when_validating_then_rejected() {
        for name in ["", "a b", "../etc", "al!ce", "x".repeat(65).as_str()] {
            assert!(validate_user_name(name).is_err(), "{name:?} should be rejected");
        }
        for name in ["alice", "Bob_2", "ops-team"] {
            assert!(validate_user_name(name).is_ok());
        }
    }
}
