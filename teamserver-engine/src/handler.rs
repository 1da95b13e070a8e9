//! The transport handler contract and the lifecycle wrapper that drives it.

use std::fmt;
use std::sync::Arc;

use teamserver_core::error::{Error, Result};

use crate::certs::CertificateManager;
use crate::rpc::Dispatcher;

/// What a handler receives from the server it is bound to.
#[derive(Clone)]
pub struct ServerContext {
    pub app: String,
    pub dispatcher: Arc<Dispatcher>,
    pub certs: Arc<CertificateManager>,
}

/// Handle returned once a handler is serving.
pub trait ServedListener: Clone + Send + Sync + 'static {
    /// Address actually bound, e.g. `127.0.0.1:31337`.
    fn local_addr(&self) -> String;

    /// Port actually bound, for transports that have one.
    fn port(&self) -> Option<u16> {
        None
    }
}

/// A transport the server can listen on.
///
/// Implementations do not track their own state: call order is enforced by
/// [`Lifecycle`]. `serve` must not block; the accept loop runs in its own
/// task until `close`.
pub trait TransportHandler: Send + 'static {
    /// A bound but not yet accepting listener.
    type Bound: Send + 'static;
    type Served: ServedListener;

    /// Transport name as recorded in persistent listener entries.
    fn name(&self) -> &'static str;

    fn init(&mut self, ctx: &ServerContext) -> Result<()>;

    fn listen(&mut self, addr: &str) -> impl Future<Output = Result<Self::Bound>> + Send;

    fn serve(&mut self, bound: Self::Bound) -> Result<Self::Served>;

    /// Stops accepting, ends live sessions and releases the address.
    fn close(&mut self) -> impl Future<Output = Result<()>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Uninitialized,
    Initialized,
    Listening,
    Serving,
    Closed,
}

impl fmt::Display for HandlerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Initialized => "initialized",
            Self::Listening => "listening",
            Self::Serving => "serving",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Drives a [`TransportHandler`] through
/// `Uninitialized → Initialized → Listening → Serving → Closed`.
///
/// Out-of-order calls fail with [`Error::InvalidState`] without reaching the
/// handler. `close` is accepted from any state and is idempotent.
pub struct Lifecycle<H: TransportHandler> {
    handler: H,
    state: HandlerState,
    bound: Option<H::Bound>,
}

impl<H: TransportHandler> Lifecycle<H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            state: HandlerState::Uninitialized,
            bound: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> HandlerState {
        self.state
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.handler.name()
    }

    fn require(&self, op: &'static str, expected: HandlerState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(Error::InvalidState {
                op,
                state: self.state.to_string(),
            })
        }
    }

    pub fn init(&mut self, ctx: &ServerContext) -> Result<()> {
        self.require("init", HandlerState::Uninitialized)?;
        self.handler.init(ctx)?;
        self.state = HandlerState::Initialized;
        Ok(())
    }

    pub async fn listen(&mut self, addr: &str) -> Result<()> {
        self.require("listen", HandlerState::Initialized)?;
        self.bound = Some(self.handler.listen(addr).await?);
        self.state = HandlerState::Listening;
        Ok(())
    }

    pub fn serve(&mut self) -> Result<H::Served> {
        self.require("serve", HandlerState::Listening)?;
        let bound = self.bound.take().ok_or(Error::InvalidState {
            op: "serve",
            state: "listening without a bound listener".into(),
        })?;
        let served = self.handler.serve(bound)?;
        self.state = HandlerState::Serving;
        Ok(served)
    }

    pub async fn close(&mut self) -> Result<()> {
        match self.state {
            HandlerState::Closed => Ok(()),
            HandlerState::Uninitialized => {
                self.state = HandlerState::Closed;
                Ok(())
            }
            _ => {
                self.bound = None;
                self.state = HandlerState::Closed;
                self.handler.close().await
            }
        }
    }
}
