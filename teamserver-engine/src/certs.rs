//! Certificate authority manager.
//!
//! Authorities are namespaced by [`CaType`] and persisted as PEM pairs under
//! the application's `certs/` directory. Leaf certificates are signed by the
//! authority of their type and stored in the database, split into the client
//! and server [`Namespace`]s.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use teamserver_core::error::{Error, Result};
use teamserver_core::tls::{self, CertKeyPair, LeafRole};
use tracing::{debug, info};

use crate::store::Database;

/// Purpose tag of a certificate authority, e.g. `user`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CaType(String);

impl CaType {
    /// Authority for user identities and the server leaf presented to them.
    pub const USER: &'static str = "user";

    pub fn new(tag: &str) -> Result<Self> {
        let valid = !tag.is_empty()
            && tag
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if valid {
            Ok(Self(tag.to_string()))
        } else {
            Err(Error::Certificate(format!("invalid authority type {tag:?}")))
        }
    }

    #[must_use]
    pub fn user() -> Self {
        Self(Self::USER.to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Client,
    Server,
}

impl Namespace {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Server => "server",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives synchronous notification when a leaf certificate is revoked.
pub trait RevocationListener: Send + Sync {
    fn on_revoked(&self, ca_type: &CaType, namespace: Namespace, subject: &str);
}

pub struct CertificateManager {
    app: String,
    certs_dir: PathBuf,
    db: Arc<Database>,
    generation: Mutex<()>,
    listeners: RwLock<Vec<Arc<dyn RevocationListener>>>,
}

impl CertificateManager {
    pub fn new(app: &str, certs_dir: impl Into<PathBuf>, db: Arc<Database>) -> Self {
        Self {
            app: app.to_string(),
            certs_dir: certs_dir.into(),
            db,
            generation: Mutex::new(()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn add_revocation_listener(&self, listener: Arc<dyn RevocationListener>) {
        self.listeners.write().push(listener);
    }

    fn ca_paths(&self, ca_type: &CaType) -> (PathBuf, PathBuf) {
        let stem = format!("{}_{}", self.app, ca_type);
        (
            self.certs_dir.join(format!("{stem}-ca-cert.pem")),
            self.certs_dir.join(format!("{stem}-ca-key.pem")),
        )
    }

    /// Loads the authority of `ca_type`, generating and persisting it on
    /// first use. Concurrent first calls produce a single authority.
    pub fn get_or_create_ca(&self, ca_type: &CaType) -> Result<CertKeyPair> {
        let _guard = self.generation.lock();
        if let Some(ca) = self.load_ca(ca_type)? {
            return Ok(ca);
        }

        let ca = tls::generate_ca(&format!("{}_{}-ca", self.app, ca_type))
            .map_err(|e| Error::Certificate(format!("{e:#}")))?;
        self.persist_ca(ca_type, &ca)?;
        info!(ca_type = %ca_type, dir = %self.certs_dir.display(), "Generated certificate authority");
        Ok(ca)
    }

    fn load_ca(&self, ca_type: &CaType) -> Result<Option<CertKeyPair>> {
        let (cert_path, key_path) = self.ca_paths(ca_type);
        let cert_pem = read_optional(&cert_path)?;
        let key_pem = read_optional(&key_path)?;
        match (cert_pem, key_pem) {
            (Some(cert_pem), Some(key_pem)) => {
                check_ca_pair(&cert_pem, &key_pem)?;
                Ok(Some(CertKeyPair { cert_pem, key_pem }))
            }
            (None, None) => Ok(None),
            _ => Err(Error::Certificate(format!(
                "incomplete {ca_type} authority in {}: both certificate and key are required",
                self.certs_dir.display()
            ))),
        }
    }

    fn persist_ca(&self, ca_type: &CaType, ca: &CertKeyPair) -> Result<()> {
        let (cert_path, key_path) = self.ca_paths(ca_type);
        for (path, pem) in [(&key_path, &ca.key_pem), (&cert_path, &ca.cert_pem)] {
            teamserver_core::fs::write_atomic(path, pem.as_bytes())
                .map_err(|e| Error::Certificate(format!("{e:#}")))?;
        }
        Ok(())
    }

    /// Issues a leaf for `common_name` signed by the `ca_type` authority and
    /// stores it, replacing any earlier leaf for the same subject.
    pub fn issue_leaf_certificate(
        &self,
        ca_type: &CaType,
        common_name: &str,
        is_server: bool,
    ) -> Result<CertKeyPair> {
        let ca = self.get_or_create_ca(ca_type)?;
        let (role, namespace) = if is_server {
            (LeafRole::Server, Namespace::Server)
        } else {
            (LeafRole::Client, Namespace::Client)
        };

        let leaf = tls::issue_leaf(&ca, common_name, role)
            .map_err(|e| Error::Certificate(format!("{e:#}")))?;
        self.db
            .upsert_leaf(ca_type.as_str(), namespace.as_str(), common_name, &leaf)?;
        debug!(ca_type = %ca_type, namespace = %namespace, subject = common_name, "Issued leaf certificate");
        Ok(leaf)
    }

    pub fn get_leaf_certificate(
        &self,
        ca_type: &CaType,
        namespace: Namespace,
        name: &str,
    ) -> Result<CertKeyPair> {
        self.db
            .get_leaf(ca_type.as_str(), namespace.as_str(), name)?
            .ok_or_else(|| Error::NotFound(format!("{namespace} certificate {name:?}")))
    }

    pub fn list_leaf_certificates(&self, ca_type: &CaType, namespace: Namespace) -> Result<Vec<String>> {
        self.db.list_leaf_subjects(ca_type.as_str(), namespace.as_str())
    }

    /// Deletes the stored leaf and notifies every revocation listener before
    /// returning.
    pub fn revoke_leaf_certificate(
        &self,
        ca_type: &CaType,
        namespace: Namespace,
        name: &str,
    ) -> Result<()> {
        if !self.db.delete_leaf(ca_type.as_str(), namespace.as_str(), name)? {
            return Err(Error::NotFound(format!("{namespace} certificate {name:?}")));
        }

        let listeners = self.listeners.read().clone();
        for listener in &listeners {
            listener.on_revoked(ca_type, namespace, name);
        }
        info!(ca_type = %ca_type, namespace = %namespace, subject = name, "Revoked leaf certificate");
        Ok(())
    }

    /// Replaces the `ca_type` authority with externally supplied material.
    ///
    /// Leaves issued by a previous authority are not re-signed.
    pub fn import_ca(&self, ca_type: &CaType, cert_pem: &str, key_pem: &str) -> Result<()> {
        check_ca_pair(cert_pem, key_pem)?;
        let _guard = self.generation.lock();
        self.persist_ca(
            ca_type,
            &CertKeyPair {
                cert_pem: cert_pem.to_string(),
                key_pem: key_pem.to_string(),
            },
        )?;
        info!(ca_type = %ca_type, "Imported certificate authority");
        Ok(())
    }

    /// Returns the persisted authority of `ca_type`, generating it first if
    /// needed.
    pub fn export_ca(&self, ca_type: &CaType) -> Result<CertKeyPair> {
        self.get_or_create_ca(ca_type)
    }
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(pem) => Ok(Some(pem)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::Certificate(format!(
            "failed to read {}: {e}",
            path.display()
        ))),
    }
}

fn check_ca_pair(cert_pem: &str, key_pem: &str) -> Result<()> {
    let is_ca = tls::is_ca_certificate(cert_pem).map_err(|e| Error::Certificate(format!("{e:#}")))?;
    if !is_ca {
        return Err(Error::Certificate("certificate is not a CA".into()));
    }
    let matches = tls::key_matches_certificate(cert_pem, key_pem)
        .map_err(|e| Error::Certificate(format!("{e:#}")))?;
    if !matches {
        return Err(Error::Certificate(
            "private key does not match the authority certificate".into(),
        ));
    }
    Ok(())
}
