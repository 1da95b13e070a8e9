mod command;
mod ui;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt};

use teamserver_engine::Server;

/// Team server: multi-user connections over mutually authenticated QUIC.
///
/// Runs the daemon, manages users and their connection descriptors,
/// authorities and persistent listeners, and queries a running server as a
/// client.
#[derive(Parser, Debug)]
#[command(name = "teamserver", version, about)]
struct Args {
    /// Application name; selects `~/.<app>` and `$<APP>_ROOT_DIR`.
    #[arg(long, global = true, default_value = "teamserver")]
    app: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the network and every persistent listener until interrupted.
    Daemon {
        /// Host to listen on (defaults to the server config).
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on (defaults to the server config).
        #[arg(long)]
        port: Option<u16>,
        /// Skip persistent listeners that fail to start instead of exiting.
        #[arg(long)]
        continue_on_error: bool,
    },
    /// Manage users.
    #[command(subcommand)]
    User(UserCommand),
    /// Export or import certificate authorities.
    #[command(subcommand)]
    Ca(CaCommand),
    /// Manage persistent listeners.
    #[command(subcommand)]
    Listener(ListenerCommand),
    /// Talk to a running server.
    #[command(subcommand)]
    Client(ClientCommand),
}

#[derive(Subcommand, Debug)]
enum UserCommand {
    /// Create a user (or re-issue its credentials) and write its descriptor.
    Add {
        name: String,
        /// Host clients dial.
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        /// Port clients dial (defaults to the daemon port).
        #[arg(long)]
        port: Option<u16>,
        /// Directory the descriptor is written to.
        #[arg(long, default_value = ".")]
        out: PathBuf,
    },
    /// Delete a user and revoke its credentials.
    Rm { name: String },
    /// List users.
    List,
}

#[derive(Subcommand, Debug)]
enum CaCommand {
    /// Write an authority's certificate and key as PEM files.
    Export {
        #[arg(long, default_value = "user")]
        ca_type: String,
        #[arg(long, default_value = ".")]
        out: PathBuf,
    },
    /// Replace an authority with the given certificate and key.
    Import {
        #[arg(long, default_value = "user")]
        ca_type: String,
        #[arg(long)]
        cert: PathBuf,
        #[arg(long)]
        key: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum ListenerCommand {
    /// Record a persistent listener started by the next daemon run.
    Add {
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        #[arg(long)]
        port: u16,
    },
    /// Remove a persistent listener.
    Rm { id: u32 },
    /// List persistent listeners.
    List,
}

#[derive(Subcommand, Debug)]
enum ClientCommand {
    /// List the server's users and who is online.
    Users {
        /// Connection descriptor to use instead of the configured ones.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Logs go to stderr so command output on stdout stays clean.
    fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("teamserver=info,warn")),
        )
        .init();

    let server = Server::new(&args.app)?;

    match args.command {
        Command::Daemon {
            host,
            port,
            continue_on_error,
        } => command::daemon(&server, host, port, continue_on_error).await?,
        Command::User(UserCommand::Add {
            name,
            host,
            port,
            out,
        }) => command::user_add(&server, &name, &host, port, &out)?,
        Command::User(UserCommand::Rm { name }) => command::user_rm(&server, &name)?,
        Command::User(UserCommand::List) => command::user_list(&server)?,
        Command::Ca(CaCommand::Export { ca_type, out }) => command::ca_export(&server, &ca_type, &out)?,
        Command::Ca(CaCommand::Import { ca_type, cert, key }) => {
            command::ca_import(&server, &ca_type, &cert, &key)?;
        }
        Command::Listener(ListenerCommand::Add { host, port }) => {
            command::listener_add(&server, &host, port)?;
        }
        Command::Listener(ListenerCommand::Rm { id }) => command::listener_rm(&server, id)?,
        Command::Listener(ListenerCommand::List) => command::listener_list(&server)?,
        Command::Client(ClientCommand::Users { config }) => {
            command::client_users(&args.app, config).await?;
        }
    }
    Ok(())
}
