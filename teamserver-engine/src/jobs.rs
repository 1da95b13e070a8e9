//! Listener supervisor: one job per served listener, plus the durable list of
//! persistent listeners restarted by the daemon.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use teamserver_core::error::{Error, Result};

use crate::config::{ConfigStore, ListenerEntry};
use crate::handler::{Lifecycle, ServedListener, ServerContext, TransportHandler};
use crate::quic::{QUIC_TRANSPORT, QuicHandler};

pub type JobId = u32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: JobId,
    pub transport: String,
    /// Address actually bound.
    pub address: String,
    pub persistent: bool,
}

struct Job {
    info: JobInfo,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Formats `host:port`, bracketing IPv6 literals.
#[must_use]
pub fn bind_address(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

pub struct Jobs {
    active: Mutex<HashMap<JobId, Job>>,
    config: Arc<ConfigStore>,
}

impl Jobs {
    pub fn new(config: Arc<ConfigStore>) -> Self {
        Self {
            active: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Drives `handler` through init, listen and serve, then registers the
    /// job. A persistent job also gets a durable entry; a requested port of 0
    /// is recorded as the port actually bound so a restart reuses it.
    pub async fn start_listener<H: TransportHandler>(
        &self,
        ctx: &ServerContext,
        handler: H,
        host: &str,
        port: u16,
        persistent: bool,
    ) -> Result<(JobId, H::Served)> {
        let transport = handler.name();
        let (id, served) = self.launch(ctx, handler, host, port, persistent).await?;

        if persistent {
            let entry = ListenerEntry {
                host: host.to_string(),
                port: match port {
                    0 => served.port().unwrap_or(0),
                    port => port,
                },
                transport: transport.to_string(),
                id,
            };
            if let Err(e) = self.config.update(|c| c.listeners.push(entry)) {
                let _ = self.close_listener(id).await;
                return Err(e);
            }
        }
        Ok((id, served))
    }

    async fn launch<H: TransportHandler>(
        &self,
        ctx: &ServerContext,
        handler: H,
        host: &str,
        port: u16,
        persistent: bool,
    ) -> Result<(JobId, H::Served)> {
        let addr = bind_address(host, port);
        let mut lifecycle = Lifecycle::new(handler);
        let transport = lifecycle.name();

        let served = match start(&mut lifecycle, ctx, &addr).await {
            Ok(served) => served,
            Err(e) => {
                error!(transport, addr = %addr, error = %e, "Failed to start listener");
                let _ = lifecycle.close().await;
                return Err(e);
            }
        };

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            token.cancelled().await;
            if let Err(e) = lifecycle.close().await {
                warn!(transport, error = %e, "Listener close failed");
            }
        });

        let info = JobInfo {
            id: 0,
            transport: transport.to_string(),
            address: served.local_addr(),
            persistent,
        };
        let id = {
            let mut active = self.active.lock();
            let id = fresh_id(&active);
            active.insert(
                id,
                Job {
                    info: JobInfo { id, ..info },
                    cancel,
                    task,
                },
            );
            id
        };
        info!(id, transport, addr = %served.local_addr(), persistent, "Listener started");
        Ok((id, served))
    }

    /// Stops job `id` and returns once its address is released. Closing a
    /// persistent job also drops its durable entry.
    pub async fn close_listener(&self, id: JobId) -> Result<()> {
        let job = self
            .active
            .lock()
            .remove(&id)
            .ok_or_else(|| Error::NotFound(format!("listener {id}")))?;
        let persistent = job.info.persistent;
        stop(job).await?;

        if persistent {
            self.config.update(|c| c.listeners.retain(|e| e.id != id))?;
            info!(id, "Persistent listener removed");
        }
        Ok(())
    }

    /// Stops every job. Durable entries are kept for the next daemon start.
    pub async fn close_all(&self) {
        let jobs: Vec<Job> = self.active.lock().drain().map(|(_, job)| job).collect();
        for job in jobs {
            let id = job.info.id;
            if let Err(e) = stop(job).await {
                warn!(id, error = %e, "Failed to stop listener");
            }
        }
    }

    /// Active jobs ordered by ID.
    #[must_use]
    pub fn list(&self) -> Vec<JobInfo> {
        let mut jobs: Vec<_> = self.active.lock().values().map(|j| j.info.clone()).collect();
        jobs.sort_by_key(|j| j.id);
        jobs
    }

    pub fn persistent_entries(&self) -> Result<Vec<ListenerEntry>> {
        Ok(self.config.load()?.listeners)
    }

    /// Records a durable entry without starting it; the daemon picks it up on
    /// its next start.
    pub fn add_persistent_entry(&self, host: &str, port: u16, transport: &str) -> Result<ListenerEntry> {
        let entry = self.config.update(|c| {
            let id = loop {
                let id: JobId = rand::random();
                if id != 0 && c.listeners.iter().all(|e| e.id != id) {
                    break id;
                }
            };
            let entry = ListenerEntry {
                host: host.to_string(),
                port,
                transport: transport.to_string(),
                id,
            };
            c.listeners.push(entry.clone());
            entry
        })?;
        info!(id = entry.id, host, port, transport, "Persistent listener recorded");
        Ok(entry)
    }

    /// Deletes the durable entry recorded under `id`. An active job with
    /// that ID keeps running.
    pub fn remove_persistent(&self, id: JobId) -> Result<()> {
        let removed = self.config.update(|c| {
            let before = c.listeners.len();
            c.listeners.retain(|e| e.id != id);
            before != c.listeners.len()
        })?;
        if removed {
            info!(id, "Persistent listener removed");
            Ok(())
        } else {
            Err(Error::NotFound(format!("persistent listener {id}")))
        }
    }

    /// Restarts every durable listener except the one at `primary`, which the
    /// daemon already serves. Each restarted entry is re-keyed to its new job
    /// ID. A failing entry aborts the restart unless `continue_on_error`.
    pub async fn start_persistent_listeners(
        &self,
        ctx: &ServerContext,
        continue_on_error: bool,
        primary: Option<(&str, u16)>,
    ) -> Result<Vec<JobId>> {
        let mut started = Vec::new();
        for entry in self.persistent_entries()? {
            if primary.is_some_and(|(host, port)| host == entry.host && port == entry.port) {
                info!(host = %entry.host, port = entry.port, "Persistent listener is the daemon listener, skipping");
                continue;
            }

            match self.restart(ctx, &entry).await {
                Ok(id) => started.push(id),
                Err(e) if continue_on_error => {
                    warn!(host = %entry.host, port = entry.port, error = %e, "Skipping persistent listener");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(started)
    }

    async fn restart(&self, ctx: &ServerContext, entry: &ListenerEntry) -> Result<JobId> {
        let id = match entry.transport.as_str() {
            QUIC_TRANSPORT => {
                self.launch(ctx, QuicHandler::new(), &entry.host, entry.port, true)
                    .await?
                    .0
            }
            other => return Err(Error::Listener(format!("unknown transport {other:?}"))),
        };

        let old = entry.id;
        self.config.update(|c| {
            if let Some(e) = c.listeners.iter_mut().find(|e| {
                e.id == old && e.host == entry.host && e.port == entry.port && e.transport == entry.transport
            }) {
                e.id = id;
            }
        })?;
        Ok(id)
    }
}

async fn start<H: TransportHandler>(
    lifecycle: &mut Lifecycle<H>,
    ctx: &ServerContext,
    addr: &str,
) -> Result<H::Served> {
    lifecycle.init(ctx)?;
    lifecycle.listen(addr).await?;
    lifecycle.serve()
}

async fn stop(job: Job) -> Result<()> {
    job.cancel.cancel();
    job.task
        .await
        .map_err(|e| Error::Listener(format!("listener task failed: {e}")))?;
    info!(id = job.info.id, "Listener stopped");
    Ok(())
}

fn fresh_id(active: &HashMap<JobId, Job>) -> JobId {
    loop {
        let id: JobId = rand::random();
        if id != 0 && !active.contains_key(&id) {
            return id;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Authenticator;
    use crate::certs::CertificateManager;
    use crate::local::LocalHandler;
    use crate::rpc::Dispatcher;
    use crate::store::{Database, SqliteCredentialStore};

    struct Fixture {
        dir: tempfile::TempDir,
        ctx: ServerContext,
        jobs: Jobs,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::open_in_memory().unwrap());
        let store = Arc::new(SqliteCredentialStore::new(Arc::clone(&db)));
        let ctx = ServerContext {
            app: "teamserver".into(),
            dispatcher: Arc::new(Dispatcher::new(Arc::new(Authenticator::new(store)))),
            certs: Arc::new(CertificateManager::new("teamserver", dir.path().join("certs"), db)),
        };
        let jobs = Jobs::new(Arc::new(ConfigStore::new(dir.path().join("server.json"))));
        Fixture { dir, ctx, jobs }
    }

    #[test]
    fn given_ipv6_host_when_formatting_then_bracketed() {
        assert_eq!(bind_address("::1", 80), "[::1]:80");
        assert_eq!(bind_address("[::1]", 80), "[::1]:80");
        assert_eq!(bind_address("127.0.0.1", 80), "127.0.0.1:80");
    }

    #[tokio::test]
    async fn given_started_listener_when_closed_twice_then_second_is_not_found() {
        let fx = fixture();
        let (id, served) = fx
            .jobs
            .start_listener(&fx.ctx, LocalHandler::new(), "local", 0, false)
            .await
            .unwrap();
        assert_ne!(id, 0);
        assert_eq!(fx.jobs.list()[0].address, served.local_addr());

        fx.jobs.close_listener(id).await.unwrap();
        assert!(fx.jobs.list().is_empty());
        assert!(matches!(
            fx.jobs.close_listener(id).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn given_closed_local_listener_when_connecting_then_refused() {
        let fx = fixture();
        let (id, served) = fx
            .jobs
            .start_listener(&fx.ctx, LocalHandler::new(), "local", 0, false)
            .await
            .unwrap();
        fx.jobs.close_listener(id).await.unwrap();
        assert!(served.connector().connect().await.is_err());
    }

    #[tokio::test]
    async fn given_persistent_listener_when_closed_then_no_entry_outlives_it() {
        let fx = fixture();
        let (id, _) = fx
            .jobs
            .start_listener(&fx.ctx, LocalHandler::new(), "local", 0, true)
            .await
            .unwrap();

        let entries = fx.jobs.persistent_entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, id);
        assert_eq!(entries[0].transport, "local");

        fx.jobs.close_listener(id).await.unwrap();
        assert!(fx.jobs.list().is_empty());
        assert!(fx.jobs.persistent_entries().unwrap().is_empty());
        assert!(matches!(fx.jobs.remove_persistent(id), Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn given_persistent_listener_when_closing_all_then_entry_is_kept() {
        let fx = fixture();
        let (id, _) = fx
            .jobs
            .start_listener(&fx.ctx, LocalHandler::new(), "local", 0, true)
            .await
            .unwrap();

        fx.jobs.close_all().await;
        let entries = fx.jobs.persistent_entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, id);

        fx.jobs.remove_persistent(id).unwrap();
        assert!(fx.jobs.persistent_entries().unwrap().is_empty());
    }

    #[tokio::test]
    async fn given_persistent_quic_listener_on_port_zero_when_started_then_bound_port_is_recorded() {
        let fx = fixture();
        let (id, served) = fx
            .jobs
            .start_listener(&fx.ctx, QuicHandler::new(), "127.0.0.1", 0, true)
            .await
            .unwrap();

        let entries = fx.jobs.persistent_entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_ne!(entries[0].port, 0);
        assert_eq!(Some(entries[0].port), served.port());
        assert_eq!(bind_address(&entries[0].host, entries[0].port), served.local_addr());

        fx.jobs.close_listener(id).await.unwrap();
    }

    #[tokio::test]
    async fn given_several_listeners_when_closing_all_then_none_remain() {
        let fx = fixture();
        for _ in 0..3 {
            fx.jobs
                .start_listener(&fx.ctx, LocalHandler::new(), "local", 0, false)
                .await
                .unwrap();
        }
        let ids: Vec<_> = fx.jobs.list().iter().map(|j| j.id).collect();
        assert_eq!(ids.len(), 3);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));

        fx.jobs.close_all().await;
        assert!(fx.jobs.list().is_empty());
    }

    #[tokio::test]
    async fn given_unknown_transport_entry_when_restarting_then_flag_decides() {
        let fx = fixture();
        let store = ConfigStore::new(fx.dir.path().join("server.json"));
        store
            .update(|c| {
                c.listeners.push(ListenerEntry {
                    host: "127.0.0.1".into(),
                    port: 0,
                    transport: "carrier-pigeon".into(),
                    id: 7,
                });
            })
            .unwrap();

        let err = fx
            .jobs
            .start_persistent_listeners(&fx.ctx, false, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Listener(_)));

        let started = fx
            .jobs
            .start_persistent_listeners(&fx.ctx, true, None)
            .await
            .unwrap();
        assert!(started.is_empty());
    }

    #[tokio::test]
    async fn given_entry_matching_primary_when_restarting_then_skipped() {
        let fx = fixture();
        let store = ConfigStore::new(fx.dir.path().join("server.json"));
        store
            .update(|c| {
                c.listeners.push(ListenerEntry {
                    host: "0.0.0.0".into(),
                    port: 31337,
                    transport: "carrier-pigeon".into(),
                    id: 7,
                });
            })
            .unwrap();

        let started = fx
            .jobs
            .start_persistent_listeners(&fx.ctx, false, Some(("0.0.0.0", 31337)))
            .await
            .unwrap();
        assert!(started.is_empty());
    }
}
