//! Client-side connection bootstrap: pick a connection descriptor, dial, run
//! post-connect hooks.

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

use teamserver_core::descriptor::{ConnectionDescriptor, list_descriptors};
use teamserver_core::error::{Error, Result};

use crate::config::AppPaths;
use crate::quic::QuicDialer;
use crate::rpc::{BoxFuture, Channel, call_as};
use crate::server::{ServerVersion, UserStatus};

pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// The client half of a transport.
#[async_trait]
pub trait Dialer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether [`init`](Dialer::init) needs a connection descriptor.
    fn requires_descriptor(&self) -> bool;

    async fn init(&mut self, descriptor: Option<&ConnectionDescriptor>) -> Result<()>;

    async fn dial(&mut self) -> Result<Arc<dyn Channel>>;

    async fn close(&mut self) -> Result<()>;
}

/// Picks one descriptor among several, returning its index.
pub type Selector = Arc<dyn Fn(&[ConnectionDescriptor]) -> Result<usize> + Send + Sync>;

/// Runs once the channel is up; a failing hook fails the connection.
pub type PostConnectHook = Arc<dyn Fn(Arc<dyn Channel>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

pub struct ClientBuilder {
    app: String,
    dialer: Option<Box<dyn Dialer>>,
    descriptor: Option<ConnectionDescriptor>,
    descriptor_path: Option<PathBuf>,
    config_dir: Option<PathBuf>,
    selector: Selector,
    hooks: Vec<PostConnectHook>,
    dial_timeout: Duration,
}

impl ClientBuilder {
    #[must_use]
    pub fn dialer(mut self, dialer: impl Dialer + 'static) -> Self {
        self.dialer = Some(Box::new(dialer));
        self
    }

    #[must_use]
    pub fn descriptor(mut self, descriptor: ConnectionDescriptor) -> Self {
        self.descriptor = Some(descriptor);
        self
    }

    #[must_use]
    pub fn descriptor_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.descriptor_path = Some(path.into());
        self
    }

    /// Directory scanned for `*.teamclient.cfg` files when no descriptor is
    /// given. Defaults to the application's `teamclient/configs`.
    #[must_use]
    pub fn config_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn selector<F>(mut self, select: F) -> Self
    where
        F: Fn(&[ConnectionDescriptor]) -> Result<usize> + Send + Sync + 'static,
    {
        self.selector = Arc::new(select);
        self
    }

    #[must_use]
    pub fn post_connect<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Arc<dyn Channel>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.hooks.push(Arc::new(move |channel: Arc<dyn Channel>| {
            Box::pin(hook(channel)) as BoxFuture<'static, Result<()>>
        }));
        self
    }

    #[must_use]
    pub fn dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    #[must_use]
    pub fn build(self) -> Client {
        Client {
            app: self.app,
            dialer: Mutex::new(self.dialer),
            descriptor: self.descriptor,
            descriptor_path: self.descriptor_path,
            config_dir: self.config_dir,
            selector: self.selector,
            hooks: self.hooks,
            dial_timeout: self.dial_timeout,
            channel: OnceCell::new(),
        }
    }
}

/// A team client. Connects at most once: the first successful
/// [`connect`](Client::connect) is latched, a failed one can be retried.
pub struct Client {
    app: String,
    dialer: Mutex<Option<Box<dyn Dialer>>>,
    descriptor: Option<ConnectionDescriptor>,
    descriptor_path: Option<PathBuf>,
    config_dir: Option<PathBuf>,
    selector: Selector,
    hooks: Vec<PostConnectHook>,
    dial_timeout: Duration,
    channel: OnceCell<Arc<dyn Channel>>,
}

impl Client {
    /// Starts a builder using the QUIC dialer and the interactive stdin
    /// selector unless told otherwise.
    #[must_use]
    pub fn builder(app: &str) -> ClientBuilder {
        ClientBuilder {
            app: app.to_string(),
            dialer: None,
            descriptor: None,
            descriptor_path: None,
            config_dir: None,
            selector: Arc::new(stdin_selector),
            hooks: Vec::new(),
            dial_timeout: DIAL_TIMEOUT,
        }
    }

    #[must_use]
    pub fn app(&self) -> &str {
        &self.app
    }

    /// Replaces the dialer. Has no effect on an already connected client.
    pub async fn set_dialer(&self, dialer: impl Dialer + 'static) {
        *self.dialer.lock().await = Some(Box::new(dialer));
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.channel.initialized()
    }

    /// The connected channel, if any.
    #[must_use]
    pub fn channel(&self) -> Option<Arc<dyn Channel>> {
        self.channel.get().cloned()
    }

    pub async fn connect(&self) -> Result<Arc<dyn Channel>> {
        self.channel
            .get_or_try_init(|| self.establish())
            .await
            .cloned()
    }

    async fn establish(&self) -> Result<Arc<dyn Channel>> {
        let mut guard = self.dialer.lock().await;
        let dialer = guard.get_or_insert_with(|| Box::new(QuicDialer::new()) as Box<dyn Dialer>);

        let descriptor = if dialer.requires_descriptor() {
            Some(self.resolve_descriptor().await?)
        } else {
            None
        };

        match self.dial(&mut **dialer, descriptor.as_ref()).await {
            Ok(channel) => {
                info!(transport = dialer.name(), "Connected");
                Ok(channel)
            }
            Err(e) => {
                warn!(transport = dialer.name(), error = %e, "Connection failed");
                if let Err(close_err) = dialer.close().await {
                    debug!(error = %close_err, "Dialer close after failure failed");
                }
                Err(e)
            }
        }
    }

    async fn dial(
        &self,
        dialer: &mut dyn Dialer,
        descriptor: Option<&ConnectionDescriptor>,
    ) -> Result<Arc<dyn Channel>> {
        dialer.init(descriptor).await?;
        let channel = tokio::time::timeout(self.dial_timeout, dialer.dial())
            .await
            .map_err(|_| Error::Timeout(self.dial_timeout))??;

        for hook in &self.hooks {
            if let Err(e) = hook(Arc::clone(&channel)).await {
                let _ = channel.close().await;
                return Err(e);
            }
        }
        Ok(channel)
    }

    async fn resolve_descriptor(&self) -> Result<ConnectionDescriptor> {
        if let Some(descriptor) = &self.descriptor {
            return Ok(descriptor.clone());
        }
        if let Some(path) = &self.descriptor_path {
            return ConnectionDescriptor::load(path);
        }

        let dir = match &self.config_dir {
            Some(dir) => dir.clone(),
            None => AppPaths::resolve(&self.app)?.client_configs_dir(),
        };
        let paths = list_descriptors(&dir)?;
        match paths.as_slice() {
            [] => Err(Error::Config(format!(
                "no connection descriptor found in {}",
                dir.display()
            ))),
            [only] => ConnectionDescriptor::load(only),
            _ => {
                let descriptors = paths
                    .iter()
                    .map(|p| ConnectionDescriptor::load(p))
                    .collect::<Result<Vec<_>>>()?;
                let select = Arc::clone(&self.selector);
                let (index, mut descriptors) = tokio::task::spawn_blocking(move || {
                    select(&descriptors).map(|i| (i, descriptors))
                })
                .await
                .map_err(|e| Error::Config(format!("descriptor selection aborted: {e}")))??;

                if index >= descriptors.len() {
                    return Err(Error::Config(format!("no descriptor at index {index}")));
                }
                Ok(descriptors.swap_remove(index))
            }
        }
    }

    /// Connects if needed, then issues one call.
    pub async fn call(&self, method: &str, body: Value) -> Result<Value> {
        self.connect().await?.call(method, body).await
    }

    pub async fn users(&self) -> Result<Vec<UserStatus>> {
        let channel = self.connect().await?;
        call_as(channel.as_ref(), "users.list", Value::Null).await
    }

    pub async fn version(&self) -> Result<ServerVersion> {
        let channel = self.connect().await?;
        call_as(channel.as_ref(), "server.version", Value::Null).await
    }

    /// Closes the channel and the dialer. The client stays latched.
    pub async fn close(&self) -> Result<()> {
        if let Some(channel) = self.channel.get() {
            channel.close().await?;
        }
        if let Some(dialer) = self.dialer.lock().await.as_mut() {
            dialer.close().await?;
        }
        Ok(())
    }
}

/// Lists the descriptors on stderr and reads a 1-based choice from stdin.
pub fn stdin_selector(descriptors: &[ConnectionDescriptor]) -> Result<usize> {
    let mut stderr = std::io::stderr().lock();
    writeln!(stderr, "Several team servers are configured:")?;
    for (i, d) in descriptors.iter().enumerate() {
        writeln!(stderr, "  [{}] {}@{}", i + 1, d.user, d.address())?;
    }
    write!(stderr, "Select a server: ")?;
    stderr.flush()?;

    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    match line.trim().parse::<usize>() {
        Ok(n) if (1..=descriptors.len()).contains(&n) => Ok(n - 1),
        _ => Err(Error::Config(format!("invalid selection {:?}", line.trim()))),
    }
}
