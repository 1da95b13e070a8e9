//! In-process transport: client and server share a process and talk over a
//! buffered `tokio::io::duplex` pipe. Calls carried here are tagged
//! [`CallOrigin::Local`] and skip credential lookup.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use teamserver_core::descriptor::ConnectionDescriptor;
use teamserver_core::error::{Error, Result};
use teamserver_core::transport::Connection;

use crate::auth::CallOrigin;
use crate::client::Dialer;
use crate::handler::{ServedListener, ServerContext, TransportHandler};
use crate::rpc::{Channel, RpcClient};
use crate::session::{CallSession, SessionHandler};

pub const LOCAL_TRANSPORT: &str = "local";

const PIPE_CAPACITY: usize = 64 * 1024;
const PENDING_CONNECTIONS: usize = 16;

/// One end of an in-process pipe.
pub struct PipeConnection {
    stream: DuplexStream,
    peer: &'static str,
}

impl PipeConnection {
    #[must_use]
    pub fn new(stream: DuplexStream, peer: &'static str) -> Self {
        Self { stream, peer }
    }

    #[must_use]
    pub fn into_inner(self) -> DuplexStream {
        self.stream
    }
}

impl Connection for PipeConnection {
    fn peer(&self) -> String {
        self.peer.to_string()
    }

    fn read<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = anyhow::Result<usize>> + Send + 'a {
        async move {
            self.stream
                .read(buf)
                .await
                .context("failed to read from local pipe")
        }
    }

    fn write_all<'a>(
        &'a mut self,
        buf: &'a [u8],
    ) -> impl Future<Output = anyhow::Result<()>> + Send + 'a {
        async move {
            self.stream
                .write_all(buf)
                .await
                .context("failed to write to local pipe")
        }
    }

    fn shutdown(&mut self) -> impl Future<Output = anyhow::Result<()>> + Send + '_ {
        async move {
            self.stream
                .shutdown()
                .await
                .context("failed to shut down local pipe")
        }
    }
}

/// Opens new pipes to a served [`LocalHandler`].
#[derive(Clone)]
pub struct LocalConnector {
    tx: mpsc::Sender<DuplexStream>,
}

impl LocalConnector {
    pub async fn connect(&self) -> Result<PipeConnection> {
        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        self.tx
            .send(server)
            .await
            .map_err(|_| Error::Transport("local listener is closed".into()))?;
        Ok(PipeConnection::new(client, "local-server"))
    }
}

pub struct LocalBound {
    tx: mpsc::Sender<DuplexStream>,
    rx: mpsc::Receiver<DuplexStream>,
}

/// What a served [`LocalHandler`] hands back: a way in.
#[derive(Clone)]
pub struct LocalServed {
    connector: LocalConnector,
}

impl LocalServed {
    #[must_use]
    pub fn connector(&self) -> LocalConnector {
        self.connector.clone()
    }
}

impl ServedListener for LocalServed {
    fn local_addr(&self) -> String {
        LOCAL_TRANSPORT.to_string()
    }
}

#[derive(Default)]
pub struct LocalHandler {
    session: Option<Arc<CallSession>>,
    running: Option<(CancellationToken, JoinHandle<()>)>,
}

impl LocalHandler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl TransportHandler for LocalHandler {
    type Bound = LocalBound;
    type Served = LocalServed;

    fn name(&self) -> &'static str {
        LOCAL_TRANSPORT
    }

    fn init(&mut self, ctx: &ServerContext) -> Result<()> {
        self.session = Some(Arc::new(CallSession::new(Arc::clone(&ctx.dispatcher))));
        Ok(())
    }

    async fn listen(&mut self, _addr: &str) -> Result<LocalBound> {
        let (tx, rx) = mpsc::channel(PENDING_CONNECTIONS);
        Ok(LocalBound { tx, rx })
    }

    fn serve(&mut self, bound: LocalBound) -> Result<LocalServed> {
        let session = self
            .session
            .clone()
            .ok_or_else(|| Error::Listener("local handler used before init".into()))?;
        let LocalBound { tx, mut rx } = bound;
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            let mut sessions = tokio::task::JoinSet::new();
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    accepted = rx.recv() => {
                        let Some(stream) = accepted else { break };
                        let session = Arc::clone(&session);
                        let token = token.child_token();
                        sessions.spawn(async move {
                            session
                                .handle(PipeConnection::new(stream, "local"), CallOrigin::Local, token)
                                .await;
                        });
                    }
                    Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
                }
            }
            sessions.shutdown().await;
            debug!("Local accept loop stopped");
        });

        self.running = Some((cancel, task));
        info!("In-process listener serving");
        Ok(LocalServed {
            connector: LocalConnector { tx },
        })
    }

    async fn close(&mut self) -> Result<()> {
        if let Some((cancel, task)) = self.running.take() {
            cancel.cancel();
            task.await
                .map_err(|e| Error::Listener(format!("local accept loop failed: {e}")))?;
        }
        Ok(())
    }
}

/// Dialer for [`LocalHandler`]; needs no descriptor and sends no token.
pub struct LocalDialer {
    connector: LocalConnector,
}

impl LocalDialer {
    #[must_use]
    pub fn new(connector: LocalConnector) -> Self {
        Self { connector }
    }
}

#[async_trait]
impl Dialer for LocalDialer {
    fn name(&self) -> &'static str {
        LOCAL_TRANSPORT
    }

    fn requires_descriptor(&self) -> bool {
        false
    }

    async fn init(&mut self, _descriptor: Option<&ConnectionDescriptor>) -> Result<()> {
        Ok(())
    }

    async fn dial(&mut self) -> Result<Arc<dyn Channel>> {
        let conn = self.connector.connect().await?;
        Ok(Arc::new(RpcClient::new(conn, None)))
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
