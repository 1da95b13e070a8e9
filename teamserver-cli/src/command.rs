use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

use teamserver_core::fs::write_atomic;
use teamserver_engine::certs::CaType;
use teamserver_engine::{Client, Server};

use crate::ui::{print_banner, print_entries, print_users};

/// Handles `daemon`: flags override the `daemon` section of the server
/// config.
pub async fn daemon(
    server: &Server,
    host: Option<String>,
    port: Option<u16>,
    continue_on_error: bool,
) -> Result<()> {
    let defaults = server.daemon_config()?;
    let host = host.unwrap_or(defaults.host);
    let port = port.unwrap_or(defaults.port);

    print_banner(server.app(), &host, port, server.paths().root());
    server.serve_daemon(&host, port, continue_on_error).await?;
    Ok(())
}

pub fn user_add(server: &Server, name: &str, host: &str, port: Option<u16>, out: &Path) -> Result<()> {
    let port = match port {
        Some(port) => port,
        None => server.daemon_config()?.port,
    };
    let descriptor = server.user_create(name, host, port)?;
    let path = descriptor
        .save_in(out)
        .with_context(|| format!("failed to write descriptor to {}", out.display()))?;
    println!("Wrote connection descriptor for {name} to {}", path.display());
    println!("Keep it private: it holds the user's key and token.");
    Ok(())
}

pub fn user_rm(server: &Server, name: &str) -> Result<()> {
    server.user_delete(name)?;
    println!("Deleted user {name}");
    Ok(())
}

pub fn user_list(server: &Server) -> Result<()> {
    print_users(&server.users()?);
    Ok(())
}

pub fn ca_export(server: &Server, ca_type: &str, out: &Path) -> Result<()> {
    let ca_type = CaType::new(ca_type)?;
    let ca = server.export_ca(&ca_type)?;
    let stem = format!("{}_{}", server.app(), ca_type);

    let cert_path = out.join(format!("{stem}-ca-cert.pem"));
    let key_path = out.join(format!("{stem}-ca-key.pem"));
    write_atomic(&cert_path, ca.cert_pem.as_bytes())?;
    write_atomic(&key_path, ca.key_pem.as_bytes())?;

    info!(ca_type = %ca_type, "Authority exported");
    println!("{}", cert_path.display());
    println!("{}", key_path.display());
    Ok(())
}

pub fn ca_import(server: &Server, ca_type: &str, cert: &Path, key: &Path) -> Result<()> {
    let ca_type = CaType::new(ca_type)?;
    let cert_pem =
        std::fs::read_to_string(cert).with_context(|| format!("failed to read {}", cert.display()))?;
    let key_pem =
        std::fs::read_to_string(key).with_context(|| format!("failed to read {}", key.display()))?;
    server.import_ca(&ca_type, &cert_pem, &key_pem)?;
    println!("Imported {ca_type} authority; reissue user descriptors signed by the old one.");
    Ok(())
}

pub fn listener_add(server: &Server, host: &str, port: u16) -> Result<()> {
    let entry = server.add_persistent_listener(host, port)?;
    println!("Recorded persistent listener {} on {host}:{port}", entry.id);
    Ok(())
}

pub fn listener_rm(server: &Server, id: u32) -> Result<()> {
    server.remove_persistent(id)?;
    println!("Removed persistent listener {id}");
    Ok(())
}

pub fn listener_list(server: &Server) -> Result<()> {
    print_entries(&server.persistent_listeners()?);
    Ok(())
}

/// Handles `client users`: connects with `config` or the configured
/// descriptors, prompting when several exist.
pub async fn client_users(app: &str, config: Option<PathBuf>) -> Result<()> {
    let mut builder = Client::builder(app);
    if let Some(path) = config {
        builder = builder.descriptor_path(path);
    }
    let client = builder.build();

    let users = client.users().await.context("failed to query the team server")?;
    print_users(&users);
    client.close().await?;
    Ok(())
}
