//! Client connection descriptors.
//!
//! A descriptor is everything a remote client needs to reach and
//! authenticate to a team server: address, bearer token, the authority to
//! trust and the client leaf to present. It is written once at user
//! issuance and never modified afterwards.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::tls::CertKeyPair;

/// File suffix of descriptors stored in a client config directory.
pub const DESCRIPTOR_SUFFIX: &str = ".teamclient.cfg";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    pub user: String,
    pub host: String,
    pub port: u16,
    pub token: String,
    pub ca_certificate: String,
    pub private_key: String,
    pub certificate: String,
}

impl ConnectionDescriptor {
    /// `host:port` suitable for socket address resolution.
    #[must_use]
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Preferred file name: `<user>_<host>.teamclient.cfg`.
    #[must_use]
    pub fn file_name(&self) -> String {
        format!("{}_{}{DESCRIPTOR_SUFFIX}", self.user, self.host)
    }

    /// The client leaf certificate carried by this descriptor.
    #[must_use]
    pub fn client_identity(&self) -> CertKeyPair {
        CertKeyPair {
            cert_pem: self.certificate.clone(),
            key_pem: self.private_key.clone(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let descriptor: Self = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("invalid connection descriptor: {e}")))?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read descriptor {}: {e}", path.display()))
        })?;
        Self::from_json(&json)
    }

    /// Writes the descriptor into `dir` under [`Self::file_name`]. Earlier
    /// descriptors are never replaced: when the name is taken, a numbered
    /// name (`<user>_<host>_2.teamclient.cfg`, ...) is used instead.
    pub fn save_in(&self, dir: &Path) -> Result<PathBuf> {
        let json = self.to_json()?;
        let stem = format!("{}_{}", self.user, self.host);
        for n in 1..=MAX_NAME_ATTEMPTS {
            let name = if n == 1 {
                self.file_name()
            } else {
                format!("{stem}_{n}{DESCRIPTOR_SUFFIX}")
            };
            let path = dir.join(name);
            if create(&path, &json)? {
                return Ok(path);
            }
        }
        Err(Error::Config(format!(
            "too many descriptors named {stem} in {}",
            dir.display()
        )))
    }

    /// Writes the descriptor to `path`, which must not exist yet.
    pub fn save(&self, path: &Path) -> Result<()> {
        if create(path, &self.to_json()?)? {
            Ok(())
        } else {
            Err(Error::Config(format!(
                "descriptor {} already exists",
                path.display()
            )))
        }
    }

    fn validate(&self) -> Result<()> {
        let missing = [
            ("user", self.user.is_empty()),
            ("host", self.host.is_empty()),
            ("token", self.token.is_empty()),
            ("ca_certificate", self.ca_certificate.is_empty()),
            ("private_key", self.private_key.is_empty()),
            ("certificate", self.certificate.is_empty()),
        ];
        if let Some((field, _)) = missing.iter().find(|(_, empty)| *empty) {
            return Err(Error::Config(format!("descriptor field `{field}` is empty")));
        }
        if self.port == 0 {
            return Err(Error::Config("descriptor port must be non-zero".into()));
        }
        Ok(())
    }
}

const MAX_NAME_ATTEMPTS: u32 = 1000;

fn create(path: &Path, json: &str) -> Result<bool> {
    crate::fs::create_atomic(path, json.as_bytes()).map_err(|e| Error::Config(format!("{e:#}")))
}

/// Lists descriptor files in `dir`, sorted by path. A missing directory
/// yields an empty list.
pub fn list_descriptors(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut paths = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let is_descriptor = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(DESCRIPTOR_SUFFIX));
        if is_descriptor && path.is_file() {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}
