//! Networked transport: QUIC with mutual TLS.
//!
//! The server presents a leaf from the `user` authority and only accepts
//! client certificates issued by that same authority; each call additionally
//! carries the user's bearer token.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use teamserver_core::descriptor::ConnectionDescriptor;
use teamserver_core::error::{Error, Result};
use teamserver_core::tls::{self, CertKeyPair, SERVER_NAME};
use teamserver_core::transport::Connection;

use crate::auth::CallOrigin;
use crate::certs::{CaType, CertificateManager, Namespace};
use crate::client::Dialer;
use crate::handler::{ServedListener, ServerContext, TransportHandler};
use crate::rpc::{Channel, RpcClient};
use crate::session::{CallSession, SessionHandler};

pub const QUIC_TRANSPORT: &str = "quic";

/// A QUIC connection carrying calls over a single bi-directional stream.
///
/// On the accepting side stream establishment is lazy: the stream is
/// accepted on the first [`read`](Connection::read) or
/// [`write_all`](Connection::write_all), since QUIC only announces a stream
/// once the client writes to it.
pub struct QuicConnection {
    connection: quinn::Connection,

    send: Option<quinn::SendStream>,
    recv: Option<quinn::RecvStream>,
    peer_addr: String,
}

impl QuicConnection {
    fn accepted(connection: quinn::Connection) -> Self {
        let peer_addr = connection.remote_address().to_string();
        Self {
            connection,
            send: None,
            recv: None,
            peer_addr,
        }
    }

    async fn open(connection: quinn::Connection) -> anyhow::Result<Self> {
        let (send, recv) = connection
            .open_bi()
            .await
            .context("failed to open bi-directional QUIC stream")?;
        let peer_addr = connection.remote_address().to_string();
        Ok(Self {
            connection,
            send: Some(send),
            recv: Some(recv),
            peer_addr,
        })
    }

    async fn ensure_streams(
        &mut self,
    ) -> anyhow::Result<(&mut quinn::SendStream, &mut quinn::RecvStream)> {
        if self.send.is_none() || self.recv.is_none() {
            let (send, recv) = self
                .connection
                .accept_bi()
                .await
                .context("failed to accept bi-directional QUIC stream")?;
            self.send = Some(send);
            self.recv = Some(recv);
        }
        match (self.send.as_mut(), self.recv.as_mut()) {
            (Some(send), Some(recv)) => Ok((send, recv)),
            _ => anyhow::bail!("QUIC streams unavailable"),
        }
    }
}

impl Connection for QuicConnection {
    fn peer(&self) -> String {
        self.peer_addr.clone()
    }

    fn read<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = anyhow::Result<usize>> + Send + 'a {
        async move {
            let (_, recv) = self.ensure_streams().await?;
            // `None` marks a finished stream.
            Ok(recv
                .read(buf)
                .await
                .context("failed to read from QUIC stream")?
                .unwrap_or(0))
        }
    }

    fn write_all<'a>(
        &'a mut self,
        buf: &'a [u8],
    ) -> impl Future<Output = anyhow::Result<()>> + Send + 'a {
        async move {
            let (send, _) = self.ensure_streams().await?;
            send.write_all(buf)
                .await
                .context("failed to write to QUIC stream")
        }
    }

    fn shutdown(&mut self) -> impl Future<Output = anyhow::Result<()>> + Send + '_ {
        async move {
            if let Some(ref mut send) = self.send {
                send.finish().context("failed to finish QUIC send stream")
            } else {
                Ok(())
            }
        }
    }
}

// ── Server side ─────────────────────────────────────────────────────

pub struct QuicBound {
    endpoint: quinn::Endpoint,
    local_addr: SocketAddr,
}

#[derive(Debug, Clone)]
pub struct QuicServed {
    local_addr: SocketAddr,
}

impl QuicServed {
    #[must_use]
    pub fn socket_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl ServedListener for QuicServed {
    fn local_addr(&self) -> String {
        self.local_addr.to_string()
    }

    fn port(&self) -> Option<u16> {
        Some(self.local_addr.port())
    }
}

struct Running {
    endpoint: quinn::Endpoint,
    cancel: CancellationToken,
    accept_loop: JoinHandle<()>,
}

/// QUIC transport handler authenticated by the `user` authority.
#[derive(Default)]
pub struct QuicHandler {
    server_config: Option<quinn::ServerConfig>,
    session: Option<Arc<CallSession>>,
    running: Option<Running>,
}

impl QuicHandler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// Returns the stored server leaf, issuing a fresh one when there is none or
/// when it no longer chains to the current authority.
fn server_identity(certs: &CertificateManager) -> Result<(CertKeyPair, CertKeyPair)> {
    let ca_type = CaType::user();
    let ca = certs.get_or_create_ca(&ca_type)?;
    let leaf = match certs.get_leaf_certificate(&ca_type, Namespace::Server, SERVER_NAME) {
        Ok(leaf) if tls::verify_issued_by(&leaf.cert_pem, &ca.cert_pem).is_ok() => leaf,
        Ok(_) | Err(Error::NotFound(_)) => {
            certs.issue_leaf_certificate(&ca_type, SERVER_NAME, true)?
        }
        Err(e) => return Err(e),
    };
    Ok((ca, leaf))
}

impl TransportHandler for QuicHandler {
    type Bound = QuicBound;
    type Served = QuicServed;

    fn name(&self) -> &'static str {
        QUIC_TRANSPORT
    }

    fn init(&mut self, ctx: &ServerContext) -> Result<()> {
        let (ca, leaf) = server_identity(&ctx.certs)?;
        let tls_config = tls::build_server_config(&ca.cert_pem, &leaf)
            .map_err(|e| Error::Certificate(format!("{e:#}")))?;
        let quic_config = QuicServerConfig::try_from(tls_config)
            .map_err(|e| Error::Certificate(format!("failed to build QUIC server config: {e}")))?;

        self.server_config = Some(quinn::ServerConfig::with_crypto(Arc::new(quic_config)));
        self.session = Some(Arc::new(CallSession::new(Arc::clone(&ctx.dispatcher))));
        Ok(())
    }

    async fn listen(&mut self, addr: &str) -> Result<QuicBound> {
        let server_config = self
            .server_config
            .clone()
            .ok_or_else(|| Error::Listener("QUIC handler used before init".into()))?;

        let socket_addr = resolve(addr)
            .await
            .map_err(|e| Error::Listener(format!("{e:#}")))?;

        let endpoint = quinn::Endpoint::server(server_config, socket_addr)
            .map_err(|e| Error::Listener(format!("failed to bind QUIC endpoint on {addr}: {e}")))?;

        let local_addr = endpoint.local_addr()?;
        info!(addr = %local_addr, "QUIC listener bound");
        Ok(QuicBound {
            endpoint,
            local_addr,
        })
    }

    fn serve(&mut self, bound: QuicBound) -> Result<QuicServed> {
        let session = self
            .session
            .clone()
            .ok_or_else(|| Error::Listener("QUIC handler used before init".into()))?;
        let QuicBound {
            endpoint,
            local_addr,
        } = bound;
        let cancel = CancellationToken::new();

        let accept_loop = tokio::spawn(accept_loop(endpoint.clone(), session, cancel.clone()));
        self.running = Some(Running {
            endpoint,
            cancel,
            accept_loop,
        });
        Ok(QuicServed { local_addr })
    }

    async fn close(&mut self) -> Result<()> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };
        running.cancel.cancel();
        if let Err(e) = running.accept_loop.await {
            warn!(error = %e, "QUIC accept loop ended abnormally");
        }
        running
            .endpoint
            .close(quinn::VarInt::from_u32(0), b"listener closed");
        running.endpoint.wait_idle().await;
        info!("QUIC listener closed");
        Ok(())
    }
}

async fn accept_loop(endpoint: quinn::Endpoint, session: Arc<CallSession>, cancel: CancellationToken) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            incoming = endpoint.accept() => {
                let Some(incoming) = incoming else {
                    debug!("QUIC endpoint closed");
                    break;
                };
                let session = Arc::clone(&session);
                let token = cancel.child_token();
                connections.spawn(async move {
                    match incoming.await {
                        Ok(connection) => {
                            let conn = QuicConnection::accepted(connection);
                            let origin = CallOrigin::Remote { peer: conn.peer() };
                            session.handle(conn, origin, token).await;
                        }
                        // Includes clients whose certificate the authority did not sign.
                        Err(e) => debug!(error = %e, "QUIC handshake failed"),
                    }
                });
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
    connections.shutdown().await;
}

async fn resolve(addr: &str) -> anyhow::Result<SocketAddr> {
    tokio::net::lookup_host(addr)
        .await
        .with_context(|| format!("invalid address: {addr}"))?
        .next()
        .with_context(|| format!("address resolved to nothing: {addr}"))
}

// ── Client side ─────────────────────────────────────────────────────

struct DialTarget {
    address: String,
    token: String,
    client_config: quinn::ClientConfig,
}

/// Dials a remote team server described by a [`ConnectionDescriptor`].
#[derive(Default)]
pub struct QuicDialer {
    target: Option<DialTarget>,
    endpoint: Option<quinn::Endpoint>,
}

impl QuicDialer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// Builds a QUIC client config trusting only the descriptor's authority and
/// presenting its client leaf.
pub fn client_config(descriptor: &ConnectionDescriptor) -> Result<quinn::ClientConfig> {
    let tls_config = tls::build_client_config(&descriptor.ca_certificate, &descriptor.client_identity())
        .map_err(|e| Error::Config(format!("invalid descriptor credentials: {e:#}")))?;
    let quic_config = QuicClientConfig::try_from(tls_config)
        .map_err(|e| Error::Config(format!("failed to build QUIC client config: {e}")))?;
    Ok(quinn::ClientConfig::new(Arc::new(quic_config)))
}

#[async_trait]
impl Dialer for QuicDialer {
    fn name(&self) -> &'static str {
        QUIC_TRANSPORT
    }

    fn requires_descriptor(&self) -> bool {
        true
    }

    async fn init(&mut self, descriptor: Option<&ConnectionDescriptor>) -> Result<()> {
        let descriptor = descriptor
            .ok_or_else(|| Error::Config("QUIC dialer needs a connection descriptor".into()))?;
        self.target = Some(DialTarget {
            address: descriptor.address(),
            token: descriptor.token.clone(),
            client_config: client_config(descriptor)?,
        });
        Ok(())
    }

    async fn dial(&mut self) -> Result<Arc<dyn Channel>> {
        let target = self
            .target
            .as_ref()
            .ok_or_else(|| Error::Config("QUIC dialer used before init".into()))?;

        let remote = resolve(&target.address)
            .await
            .map_err(|e| Error::Config(format!("{e:#}")))?;
        let bind: SocketAddr = if remote.is_ipv4() {
            (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };

        let mut endpoint = quinn::Endpoint::client(bind)?;
        endpoint.set_default_client_config(target.client_config.clone());

        let connection = endpoint
            .connect(remote, SERVER_NAME)
            .map_err(|e| Error::Transport(format!("failed to start QUIC connection: {e}")))?
            .await
            .map_err(|e| Error::Transport(format!("QUIC handshake with {remote} failed: {e}")))?;
        let conn = QuicConnection::open(connection)
            .await
            .map_err(|e| Error::transport(&e))?;

        debug!(peer = %remote, "QUIC connection established");
        self.endpoint = Some(endpoint);
        Ok(Arc::new(RpcClient::new(conn, Some(target.token.clone()))))
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(endpoint) = self.endpoint.take() {
            endpoint.close(quinn::VarInt::from_u32(0), b"client closed");
            endpoint.wait_idle().await;
        }
        Ok(())
    }
}
