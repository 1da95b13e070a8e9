//! Application directories and the server configuration file.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use teamserver_core::error::{Error, Result};

pub const DEFAULT_DAEMON_HOST: &str = "0.0.0.0";
pub const DEFAULT_DAEMON_PORT: u16 = 31337;

/// On-disk layout of one application's team server state.
///
/// ```text
/// <root>/
///   certs/                  authority PEM pairs
///   configs/<app>.teamserver.json
///   <app>.db                users and leaf certificates
///   teamclient/configs/     client connection descriptors
/// ```
#[derive(Debug, Clone)]
pub struct AppPaths {
    app: String,
    root: PathBuf,
}

impl AppPaths {
    /// Resolves the root from `$<APP>_ROOT_DIR`, falling back to
    /// `$HOME/.<app>`.
    pub fn resolve(app: &str) -> Result<Self> {
        let var = root_env_var(app);
        if let Some(root) = std::env::var_os(&var).filter(|v| !v.is_empty()) {
            return Ok(Self::with_root(app, root));
        }
        let home = dirs_next::home_dir().ok_or_else(|| {
            Error::Config(format!("cannot determine home directory; set {var}"))
        })?;
        Ok(Self::with_root(app, home.join(format!(".{app}"))))
    }

    pub fn with_root(app: &str, root: impl Into<PathBuf>) -> Self {
        Self {
            app: app.to_string(),
            root: root.into(),
        }
    }

    #[must_use]
    pub fn app(&self) -> &str {
        &self.app
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn certs_dir(&self) -> PathBuf {
        self.root.join("certs")
    }

    #[must_use]
    pub fn configs_dir(&self) -> PathBuf {
        self.root.join("configs")
    }

    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.root.join(format!("{}.db", self.app))
    }

    #[must_use]
    pub fn server_config_path(&self) -> PathBuf {
        self.configs_dir()
            .join(format!("{}.teamserver.json", self.app))
    }

    #[must_use]
    pub fn client_configs_dir(&self) -> PathBuf {
        self.root.join("teamclient").join("configs")
    }

    /// Creates every directory of the layout.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [self.certs_dir(), self.configs_dir(), self.client_configs_dir()] {
            std::fs::create_dir_all(&dir).map_err(|e| {
                Error::Config(format!("failed to create {}: {e}", dir.display()))
            })?;
        }
        Ok(())
    }
}

/// `teamserver` → `TEAMSERVER_ROOT_DIR`, `my-app` → `MY_APP_ROOT_DIR`.
#[must_use]
pub fn root_env_var(app: &str) -> String {
    let upper: String = app
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("{upper}_ROOT_DIR")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub host: String,
    pub port: u16,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_DAEMON_HOST.to_string(),
            port: DEFAULT_DAEMON_PORT,
        }
    }
}

/// Durable record of a persistent listener. `id` is the job ID of the
/// listener currently serving it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerEntry {
    pub host: String,
    pub port: u16,
    pub transport: String,
    pub id: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub listeners: Vec<ListenerEntry>,
}

/// Read-modify-write access to the server config file.
///
/// Writers in this process are serialized; concurrent writers from other
/// processes are not coordinated.
pub struct ConfigStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ConfigStore {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the config; a missing file yields the defaults.
    pub fn load(&self) -> Result<ServerConfig> {
        let _guard = self.lock.lock();
        self.read()
    }

    /// Applies `f` to the current config and writes the result back.
    pub fn update<T>(&self, f: impl FnOnce(&mut ServerConfig) -> T) -> Result<T> {
        let _guard = self.lock.lock();
        let mut config = self.read()?;
        let out = f(&mut config);
        let json = serde_json::to_vec_pretty(&config)?;
        teamserver_core::fs::write_atomic(&self.path, &json)
            .map_err(|e| Error::Config(format!("{e:#}")))?;
        Ok(out)
    }

    fn read(&self) -> Result<ServerConfig> {
        match std::fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                Error::Config(format!("invalid server config {}: {e}", self.path.display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ServerConfig::default()),
            Err(e) => Err(e.into()),
        }
    }
}
