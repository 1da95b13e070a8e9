//! Rows of the `certificates` table: issued leaf certificates keyed by
//! authority type, namespace and subject.

use chrono::Utc;
use rusqlite::{OptionalExtension, params};
use teamserver_core::error::Result;
use teamserver_core::tls::CertKeyPair;

use super::db::Database;

impl Database {
    /// Inserts or replaces the leaf stored for `(ca_type, namespace, subject)`.
    pub(crate) fn upsert_leaf(
        &self,
        ca_type: &str,
        namespace: &str,
        subject: &str,
        pair: &CertKeyPair,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO certificates
                 (ca_type, namespace, subject, cert_pem, key_pem, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    ca_type,
                    namespace,
                    subject,
                    pair.cert_pem,
                    pair.key_pem,
                    Utc::now().to_rfc3339()
                ],
            )
        })?;
        Ok(())
    }

    pub(crate) fn get_leaf(
        &self,
        ca_type: &str,
        namespace: &str,
        subject: &str,
    ) -> Result<Option<CertKeyPair>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT cert_pem, key_pem FROM certificates
                 WHERE ca_type = ?1 AND namespace = ?2 AND subject = ?3",
                params![ca_type, namespace, subject],
                |row| {
                    Ok(CertKeyPair {
                        cert_pem: row.get(0)?,
                        key_pem: row.get(1)?,
                    })
                },
            )
            .optional()
        })
    }

    /// Returns whether a row was deleted.
    pub(crate) fn delete_leaf(&self, ca_type: &str, namespace: &str, subject: &str) -> Result<bool> {
        let deleted = self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM certificates WHERE ca_type = ?1 AND namespace = ?2 AND subject = ?3",
                params![ca_type, namespace, subject],
            )
        })?;
        Ok(deleted > 0)
    }

    pub(crate) fn list_leaf_subjects(&self, ca_type: &str, namespace: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT subject FROM certificates
                 WHERE ca_type = ?1 AND namespace = ?2 ORDER BY subject",
            )?;
            let rows = stmt.query_map(params![ca_type, namespace], |row| row.get(0))?;
            rows.collect()
        })
    }
}
