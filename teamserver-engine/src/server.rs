//! The team server: lazily initialized storage, authorities and
//! authentication, plus the operations that serve and administer it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use teamserver_core::descriptor::ConnectionDescriptor;
use teamserver_core::error::{Error, Result};
use teamserver_core::tls::CertKeyPair;
use teamserver_core::token::{generate_token, hash_token};

use crate::auth::{Authenticator, Caller};
use crate::certs::{CaType, CertificateManager, Namespace};
use crate::client::Client;
use crate::config::{AppPaths, ConfigStore, DaemonConfig, ListenerEntry};
use crate::handler::{ServedListener, ServerContext};
use crate::jobs::{JobId, JobInfo, Jobs};
use crate::local::{LOCAL_TRANSPORT, LocalDialer, LocalHandler};
use crate::quic::{QUIC_TRANSPORT, QuicHandler};
use crate::rpc::Dispatcher;
use crate::store::{CredentialStore, Database, SqliteCredentialStore, validate_user_name};

/// One row of `users.list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserStatus {
    pub name: String,
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Reply of `server.version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerVersion {
    pub app: String,
    pub version: String,
}

impl ServerVersion {
    /// Version of this build serving `app`.
    #[must_use]
    pub fn current(app: &str) -> Self {
        Self {
            app: app.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

struct Core {
    store: Arc<SqliteCredentialStore>,
    certs: Arc<CertificateManager>,
    auth: Arc<Authenticator>,
    jobs: Arc<Jobs>,
    config: Arc<ConfigStore>,
    ctx: ServerContext,
}

enum InitState {
    Uninitialized,
    Ready(Arc<Core>),
    Failed(String),
}

pub struct Server {
    paths: AppPaths,
    state: Mutex<InitState>,
}

impl Server {
    /// A server rooted at `$<APP>_ROOT_DIR` or `~/.<app>`. Nothing is
    /// touched on disk until the first operation.
    pub fn new(app: &str) -> Result<Self> {
        Ok(Self::with_paths(AppPaths::resolve(app)?))
    }

    #[must_use]
    pub fn with_paths(paths: AppPaths) -> Self {
        Self {
            paths,
            state: Mutex::new(InitState::Uninitialized),
        }
    }

    #[must_use]
    pub fn paths(&self) -> &AppPaths {
        &self.paths
    }

    #[must_use]
    pub fn app(&self) -> &str {
        self.paths.app()
    }

    /// Initializes on first use. A failed initialization is remembered and
    /// reported to every later caller.
    fn core(&self) -> Result<Arc<Core>> {
        let mut state = self.state.lock();
        match &*state {
            InitState::Ready(core) => Ok(Arc::clone(core)),
            InitState::Failed(reason) => Err(Error::Init(reason.clone())),
            InitState::Uninitialized => match initialize(&self.paths) {
                Ok(core) => {
                    let core = Arc::new(core);
                    *state = InitState::Ready(Arc::clone(&core));
                    Ok(core)
                }
                Err(e) => {
                    error!(app = self.app(), error = %e, "Server initialization failed");
                    let reason = e.to_string();
                    *state = InitState::Failed(reason.clone());
                    Err(Error::Init(reason))
                }
            },
        }
    }

    /// Registers an application method on every transport this server serves.
    pub fn register<F, Fut>(&self, method: &str, handler: F) -> Result<()>
    where
        F: Fn(Caller, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.core()?.ctx.dispatcher.register(method, handler);
        Ok(())
    }

    // ── Serving ─────────────────────────────────────────────────────

    /// Serves `client` in-process: starts the local listener, then connects
    /// the client to it. No descriptor is involved.
    pub async fn serve(&self, client: &Client) -> Result<JobId> {
        let core = self.core()?;
        let (id, served) = core
            .jobs
            .start_listener(&core.ctx, LocalHandler::new(), LOCAL_TRANSPORT, 0, false)
            .await?;

        client.set_dialer(LocalDialer::new(served.connector())).await;
        if let Err(e) = client.connect().await {
            let _ = core.jobs.close_listener(id).await;
            return Err(e);
        }
        Ok(id)
    }

    /// Serves the network on `host:port` until the listener is closed.
    pub async fn serve_addr(&self, host: &str, port: u16) -> Result<JobInfo> {
        self.start_listener(host, port, false).await
    }

    /// Starts a QUIC listener; a persistent one is restarted by the daemon.
    pub async fn start_listener(&self, host: &str, port: u16, persistent: bool) -> Result<JobInfo> {
        let core = self.core()?;
        let (id, served) = core
            .jobs
            .start_listener(&core.ctx, QuicHandler::new(), host, port, persistent)
            .await?;
        Ok(JobInfo {
            id,
            transport: QUIC_TRANSPORT.to_string(),
            address: served.local_addr(),
            persistent,
        })
    }

    pub async fn close_listener(&self, id: JobId) -> Result<()> {
        self.core()?.jobs.close_listener(id).await
    }

    pub fn listeners(&self) -> Result<Vec<JobInfo>> {
        Ok(self.core()?.jobs.list())
    }

    pub fn persistent_listeners(&self) -> Result<Vec<ListenerEntry>> {
        self.core()?.jobs.persistent_entries()
    }

    pub fn add_persistent_listener(&self, host: &str, port: u16) -> Result<ListenerEntry> {
        self.core()?.jobs.add_persistent_entry(host, port, QUIC_TRANSPORT)
    }

    pub fn remove_persistent(&self, id: JobId) -> Result<()> {
        self.core()?.jobs.remove_persistent(id)
    }

    /// The `daemon` section of the server config.
    pub fn daemon_config(&self) -> Result<DaemonConfig> {
        Ok(self.core()?.config.load()?.daemon)
    }

    /// Serves `host:port` and every persistent listener until SIGINT or
    /// SIGTERM.
    pub async fn serve_daemon(&self, host: &str, port: u16, continue_on_error: bool) -> Result<()> {
        let shutdown = CancellationToken::new();
        let trigger = shutdown.clone();
        let signals = tokio::spawn(async move {
            wait_for_signal().await;
            info!("Shutdown signal received");
            trigger.cancel();
        });

        let result = self
            .serve_daemon_until(host, port, continue_on_error, shutdown)
            .await;
        signals.abort();
        result
    }

    /// [`serve_daemon`](Self::serve_daemon) stopped by `shutdown` instead of
    /// a signal.
    pub async fn serve_daemon_until(
        &self,
        host: &str,
        port: u16,
        continue_on_error: bool,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let core = self.core()?;
        let primary = self.serve_addr(host, port).await?;

        if let Err(e) = core
            .jobs
            .start_persistent_listeners(&core.ctx, continue_on_error, Some((host, port)))
            .await
        {
            core.jobs.close_all().await;
            return Err(e);
        }

        info!(addr = %primary.address, jobs = core.jobs.list().len(), "Team server ready");
        shutdown.cancelled().await;

        if let Err(e) = core.jobs.close_listener(primary.id).await {
            warn!(id = primary.id, error = %e, "Failed to close daemon listener");
        }
        core.jobs.close_all().await;
        info!("Team server stopped");
        Ok(())
    }

    /// Stops every active listener.
    pub async fn shutdown(&self) -> Result<()> {
        self.core()?.jobs.close_all().await;
        Ok(())
    }

    // ── Users ───────────────────────────────────────────────────────

    /// Creates `name` (or re-issues it) and returns a descriptor pointing at
    /// `host:port`. Earlier descriptors of the user stay valid.
    pub fn user_create(&self, name: &str, host: &str, port: u16) -> Result<ConnectionDescriptor> {
        validate_user_name(name)?;
        let core = self.core()?;
        let ca_type = CaType::user();

        let token = generate_token();
        core.store.issue_token(name, &hash_token(&token))?;
        let leaf = core.certs.issue_leaf_certificate(&ca_type, name, false)?;
        let ca = core.certs.export_ca(&ca_type)?;

        info!(user = name, host, port, "User credentials issued");
        Ok(ConnectionDescriptor {
            user: name.to_string(),
            host: host.to_string(),
            port,
            token,
            ca_certificate: ca.cert_pem,
            private_key: leaf.key_pem,
            certificate: leaf.cert_pem,
        })
    }

    /// Deletes `name`, revokes its client certificate and drops its cached
    /// authentication before returning.
    pub fn user_delete(&self, name: &str) -> Result<()> {
        let core = self.core()?;
        if !core.store.delete_user(name)? {
            return Err(Error::NotFound(format!("user {name}")));
        }
        match core
            .certs
            .revoke_leaf_certificate(&CaType::user(), Namespace::Client, name)
        {
            Ok(()) => {}
            Err(Error::NotFound(_)) => core.auth.invalidate_user(name),
            Err(e) => {
                core.auth.invalidate_user(name);
                return Err(e);
            }
        }
        info!(user = name, "User deleted");
        Ok(())
    }

    pub fn users(&self) -> Result<Vec<UserStatus>> {
        let core = self.core()?;
        user_statuses(core.store.as_ref(), &core.auth)
    }

    // ── Authorities ─────────────────────────────────────────────────

    pub fn export_ca(&self, ca_type: &CaType) -> Result<CertKeyPair> {
        self.core()?.certs.export_ca(ca_type)
    }

    pub fn import_ca(&self, ca_type: &CaType, cert_pem: &str, key_pem: &str) -> Result<()> {
        self.core()?.certs.import_ca(ca_type, cert_pem, key_pem)
    }

    #[must_use]
    pub fn version(&self) -> ServerVersion {
        ServerVersion::current(self.app())
    }
}

fn initialize(paths: &AppPaths) -> Result<Core> {
    paths.ensure_dirs()?;
    let db = Arc::new(Database::open(&paths.database_path())?);
    let store = Arc::new(SqliteCredentialStore::new(Arc::clone(&db)));

    let certs = Arc::new(CertificateManager::new(
        paths.app(),
        paths.certs_dir(),
        Arc::clone(&db),
    ));
    certs.get_or_create_ca(&CaType::user())?;

    let auth = Arc::new(Authenticator::new(store.clone()));
    certs.add_revocation_listener(auth.clone());

    let config = Arc::new(ConfigStore::new(paths.server_config_path()));
    let jobs = Arc::new(Jobs::new(Arc::clone(&config)));

    let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&auth)));
    register_builtins(&dispatcher, paths.app(), &store, &auth, &jobs);

    info!(app = paths.app(), root = %paths.root().display(), "Server initialized");
    Ok(Core {
        store,
        auth,
        jobs,
        config,
        ctx: ServerContext {
            app: paths.app().to_string(),
            dispatcher,
            certs: Arc::clone(&certs),
        },
        certs,
    })
}

fn register_builtins(
    dispatcher: &Dispatcher,
    app: &str,
    store: &Arc<SqliteCredentialStore>,
    auth: &Arc<Authenticator>,
    jobs: &Arc<Jobs>,
) {
    let (store, auth) = (Arc::clone(store), Arc::clone(auth));
    dispatcher.register("users.list", move |_caller: Caller, _body: Value| {
        let (store, auth) = (Arc::clone(&store), Arc::clone(&auth));
        async move {
            let statuses = tokio::task::spawn_blocking(move || user_statuses(store.as_ref(), &auth))
                .await
                .map_err(|e| Error::Store(format!("user listing task failed: {e}")))??;
            Ok(serde_json::to_value(statuses)?)
        }
    });

    let version = ServerVersion::current(app);
    dispatcher.register("server.version", move |_caller: Caller, _body: Value| {
        let version = version.clone();
        async move { Ok(serde_json::to_value(version)?) }
    });

    let jobs = Arc::clone(jobs);
    dispatcher.register("listeners.list", move |_caller: Caller, _body: Value| {
        let listeners = jobs.list();
        async move { Ok(serde_json::to_value(listeners)?) }
    });
}

fn user_statuses(store: &dyn CredentialStore, auth: &Authenticator) -> Result<Vec<UserStatus>> {
    Ok(store
        .list_users()?
        .into_iter()
        .map(|u| UserStatus {
            online: auth.is_online(&u.name),
            name: u.name,
            last_seen: u.last_seen,
        })
        .collect())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "Cannot watch SIGTERM, waiting for Ctrl-C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn server() -> (tempfile::TempDir, Server) {
        let dir = tempfile::tempdir().unwrap();
        let server = Server::with_paths(AppPaths::with_root("teamserver", dir.path()));
        (dir, server)
    }

    #[test]
    fn given_fresh_root_when_first_used_then_layout_and_authority_are_created() {
        let (dir, server) = server();
        assert!(server.users().unwrap().is_empty());
        assert!(dir.path().join("teamserver.db").exists());
        assert!(
            dir.path()
                .join("certs")
                .join("teamserver_user-ca-cert.pem")
                .exists()
        );
    }

    #[test]
    fn given_created_user_when_listing_then_offline_and_never_seen() {
        let (_dir, server) = server();
        let descriptor = server.user_create("alice", "127.0.0.1", 31337).unwrap();
        assert_eq!(descriptor.user, "alice");
        assert_eq!(descriptor.port, 31337);
        assert_eq!(
            descriptor.ca_certificate,
            server.export_ca(&CaType::user()).unwrap().cert_pem
        );

        let users = server.users().unwrap();
        assert_eq!(
            users,
            vec![UserStatus {
                name: "alice".into(),
                online: false,
                last_seen: None,
            }]
        );
    }

    #[test]
    fn given_invalid_user_name_when_creating_then_config_error_before_init() {
        let (dir, server) = server();
        assert!(matches!(
            server.user_create("bad name", "h", 1),
            Err(Error::Config(_))
        ));
        assert!(!dir.path().join("teamserver.db").exists());
    }

    #[test]
    fn given_unknown_user_when_deleting_then_not_found() {
        let (_dir, server) = server();
        assert!(matches!(server.user_delete("ghost"), Err(Error::NotFound(_))));
    }

    #[test]
    fn given_user_when_deleted_then_leaf_is_revoked() {
        let (_dir, server) = server();
        server.user_create("bob", "localhost", 31337).unwrap();
        server.user_delete("bob").unwrap();

        let core = server.core().unwrap();
        assert!(matches!(
            core.certs
                .get_leaf_certificate(&CaType::user(), Namespace::Client, "bob"),
            Err(Error::NotFound(_))
        ));
        assert!(server.users().unwrap().is_empty());
    }

    #[test]
    fn given_offline_entry_when_recorded_then_listed_and_removable() {
        let (_dir, server) = server();
        let entry = server.add_persistent_listener("127.0.0.1", 4444).unwrap();
        assert_eq!(entry.transport, QUIC_TRANSPORT);
        assert_eq!(server.persistent_listeners().unwrap(), vec![entry.clone()]);

        server.remove_persistent(entry.id).unwrap();
        assert!(server.persistent_listeners().unwrap().is_empty());
    }

    #[tokio::test]
    async fn given_in_process_client_when_served_then_builtins_answer_as_local() {
        let (_dir, server) = server();
        server
            .register("whoami", |caller: Caller, _| async move { Ok(json!(caller.user)) })
            .unwrap();
        let client = Client::builder("teamserver").build();
        server.serve(&client).await.unwrap();

        assert_eq!(client.call("whoami", Value::Null).await.unwrap(), json!("local"));
        assert_eq!(client.version().await.unwrap(), server.version());
        server.user_create("alice", "127.0.0.1", 31337).unwrap();
        let users = client.users().await.unwrap();
        assert_eq!(users.len(), 1);
        assert!(!users[0].online);

        let listeners: Vec<JobInfo> =
            serde_json::from_value(client.call("listeners.list", Value::Null).await.unwrap())
                .unwrap();
        assert_eq!(listeners.len(), 1);
        assert_eq!(listeners[0].transport, LOCAL_TRANSPORT);

        server.shutdown().await.unwrap();
    }
}
