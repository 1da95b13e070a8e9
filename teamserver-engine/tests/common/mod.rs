#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use teamserver_core::descriptor::ConnectionDescriptor;
use teamserver_engine::Client;
use teamserver_engine::Server;
use teamserver_engine::config::AppPaths;

pub const APP: &str = "teamserver";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("teamserver=debug,warn")
        .try_init();
}

pub fn server(root: &Path) -> Arc<Server> {
    init_tracing();
    Arc::new(Server::with_paths(AppPaths::with_root(APP, root)))
}

pub fn quic_client(descriptor: ConnectionDescriptor) -> Client {
    Client::builder(APP)
        .descriptor(descriptor)
        .dial_timeout(Duration::from_secs(5))
        .build()
}

/// Polls `check` until it holds or five seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}
