//! ghostmux - a session multiplexer that remembers where you were.
//!
//! **Server mode** (`ghostmux server`): runs the daemon that owns every
//! session, restores the previous run's sessions as ghosts and listens on a
//! Unix socket.
//!
//! Every other subcommand is a thin client for one daemon operation.

use std::io::Write;
use std::path::PathBuf;

use clap::{Parser as ClapParser, Subcommand};
use ghostmux::{
    client::Client,
    config::{self, Config, ConfigError},
    protocol::{Event, Request, Response},
    server,
    session::{EntryId, SessionId},
    supervisor::Supervisor,
};
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// ghostmux - a session multiplexer that remembers where you were.
#[derive(ClapParser, Debug)]
#[command(name = "ghostmux", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the Unix domain socket
    #[arg(long, env = "GHOSTMUX_SOCKET", global = true)]
    socket: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the ghostmux daemon
    Server {
        /// Config file (default: <config dir>/ghostmux/config.toml)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    #[command(flatten)]
    Client(ClientCommand),
}

/// Subcommands that talk to a running daemon.
#[derive(Subcommand, Debug)]
enum ClientCommand {
    /// Ask the daemon's directory picker for a working directory
    Pick,

    /// Start a session (default directory: home)
    Create { dir: Option<PathBuf> },

    /// List live sessions and ghosts
    List,

    /// Kill a live session
    Kill { id: SessionId },

    /// Forget a ghost
    GhostRm { index: usize },

    /// Turn a ghost back into a live session
    Respawn { index: usize },

    /// Set the display name of a directory
    Rename { dir: PathBuf, name: String },

    /// Reorder live sessions
    Order {
        #[arg(required = true)]
        ids: Vec<SessionId>,
    },

    /// Type text into a session
    Send {
        id: SessionId,
        text: String,

        /// Do not append a newline
        #[arg(long, short = 'n')]
        no_newline: bool,
    },

    /// Resize a session's terminal
    Resize { id: SessionId, cols: u16, rows: u16 },

    /// List favorite directories
    Favorites,

    /// Add a favorite directory
    FavAdd { dir: PathBuf },

    /// Remove a favorite directory
    FavRm { dir: PathBuf },

    /// Show recently exited sessions
    History,

    /// Show the recent output of every live session
    Tails,

    /// Stream output and lifecycle events
    Watch,
}

#[derive(Error, Debug)]
pub enum CliError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected response from server: {0:?}")]
    Unexpected(Box<Response>),
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let cli = Cli::parse();
    init_tracing();

    let socket_path = cli.socket.unwrap_or_else(server::default_socket_path);
    match cli.command {
        Commands::Server { config } => run_server(socket_path, config).await,
        Commands::Client(command) => {
            let mut client = Client::connect(&socket_path).await?;
            run_client(&mut client, command).await
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "ghostmux=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

// ── Server mode ────────────────────────────────────────────────────

async fn run_server(socket_path: PathBuf, config_path: Option<PathBuf>) -> Result<(), CliError> {
    let config_path = config_path.unwrap_or_else(config::default_config_path);
    let config = Config::load(&config_path)?;
    tracing::info!(
        config = %config_path.display(),
        data_dir = %config.data_dir().display(),
        "ghostmux server starting"
    );

    let supervisor = Supervisor::new(config).with_socket_path(&socket_path);
    supervisor.restore().await;

    let cancel = tokio_util::sync::CancellationToken::new();
    let mut socket_handle = tokio::spawn({
        let supervisor = supervisor.clone();
        let cancel = cancel.clone();
        let socket_path = socket_path.clone();
        async move { server::serve(supervisor, &socket_path, cancel).await }
    });

    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let serve_result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received Ctrl+C");
            None
        }
        _ = terminate.recv() => {
            tracing::info!("received SIGTERM");
            None
        }
        result = &mut socket_handle => Some(result),
    };

    cancel.cancel();
    if let Some(drain) = supervisor.shutdown().await {
        if let Err(e) = drain.await {
            tracing::warn!(?e, "session drain task panicked");
        }
    }

    let result = match serve_result {
        Some(result) => result?.map_err(CliError::from),
        None => {
            // The accept loop exits promptly once cancelled.
            if let Err(e) = socket_handle.await {
                tracing::warn!(?e, "socket server task panicked");
            }
            // Remove the socket file so a subsequent server can bind
            if socket_path.exists() {
                let _ = std::fs::remove_file(&socket_path);
                tracing::debug!(path = %socket_path.display(), "removed socket file");
            }
            Ok(())
        }
    };

    tracing::info!("ghostmux server exiting");
    result
}

// ── Client mode ────────────────────────────────────────────────────

async fn run_client(client: &mut Client, command: ClientCommand) -> Result<(), CliError> {
    match command {
        ClientCommand::Pick => match client.request(&Request::SelectWorkingDirectory).await? {
            Response::Directory { path: Some(path) } => println!("{}", path.display()),
            Response::Directory { path: None } => std::process::exit(1),
            other => return Err(unexpected(other)),
        },
        ClientCommand::Create { dir } => {
            let session = client.create_session(dir.map(absolute)).await?;
            println!(
                "{}\t{}\t{}",
                session.id,
                session.title,
                session.working_directory.display()
            );
        }
        ClientCommand::List => {
            let sessions = client.list_sessions().await?;
            if sessions.is_empty() {
                println!("No sessions.");
                return Ok(());
            }
            println!("{:<10} {:<24} {}", "ID", "TITLE", "DIRECTORY");
            for s in &sessions {
                let id = match s.id {
                    EntryId::Live { id } => id.to_string(),
                    EntryId::Ghost { index } => format!("ghost:{}", index),
                };
                println!("{:<10} {:<24} {}", id, s.title, s.working_directory.display());
            }
        }
        ClientCommand::Kill { id } => expect_ok(client, &Request::KillSession { id }).await?,
        ClientCommand::GhostRm { index } => {
            match client.request(&Request::RemoveGhost { index }).await? {
                Response::GhostRemoved {
                    working_directory: Some(dir),
                } => println!("removed {}", dir.display()),
                Response::GhostRemoved {
                    working_directory: None,
                } => eprintln!("ghostmux: no ghost at index {}", index),
                other => return Err(unexpected(other)),
            }
        }
        ClientCommand::Respawn { index } => {
            match client.request(&Request::RespawnGhost { index }).await? {
                Response::Created { session } => println!(
                    "{}\t{}\t{}",
                    session.id,
                    session.title,
                    session.working_directory.display()
                ),
                other => return Err(unexpected(other)),
            }
        }
        ClientCommand::Rename { dir, name } => {
            expect_ok(
                client,
                &Request::RenameDirectory {
                    path: absolute(dir),
                    name,
                },
            )
            .await?
        }
        ClientCommand::Order { ids } => expect_ok(client, &Request::SetSessionOrder { ids }).await?,
        ClientCommand::Send {
            id,
            text,
            no_newline,
        } => {
            let mut data = text.into_bytes();
            if !no_newline {
                data.push(b'\n');
            }
            client.write_input(id, &data).await?;
        }
        ClientCommand::Resize { id, cols, rows } => {
            client.send(&Request::Resize { id, cols, rows }).await?
        }
        ClientCommand::Favorites => match client.request(&Request::Favorites).await? {
            Response::Favorites { favorites } => {
                for f in favorites {
                    println!("{:<24} {}", f.title, f.working_directory.display());
                }
            }
            other => return Err(unexpected(other)),
        },
        ClientCommand::FavAdd { dir } => {
            report_favorite(client, &Request::AddFavorite { path: absolute(dir) }, "already a favorite")
                .await?
        }
        ClientCommand::FavRm { dir } => {
            report_favorite(client, &Request::RemoveFavorite { path: absolute(dir) }, "not a favorite")
                .await?
        }
        ClientCommand::History => match client.request(&Request::ExitHistory).await? {
            Response::History { records } => {
                println!("{:<6} {:<6} {:<24} {}", "ID", "CODE", "TITLE", "EXITED");
                for r in records {
                    let code = r
                        .exit_code
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "-".to_string());
                    println!("{:<6} {:<6} {:<24} {}", r.id, code, r.title, r.timestamp);
                }
            }
            other => return Err(unexpected(other)),
        },
        ClientCommand::Tails => match client.request(&Request::LiveSessionTails).await? {
            Response::Tails { tails } => {
                for t in tails {
                    println!("── {} {} ({})", t.id, t.title, t.working_directory.display());
                    println!("{}", t.tail);
                }
            }
            other => return Err(unexpected(other)),
        },
        ClientCommand::Watch => {
            client.subscribe().await?;
            loop {
                match client.next_event().await? {
                    Event::Output { data, .. } => {
                        let mut stdout = std::io::stdout().lock();
                        stdout.write_all(&data)?;
                        stdout.flush()?;
                    }
                    Event::Created { id } => eprintln!("ghostmux: session {} created", id),
                    Event::Exited { id } => eprintln!("ghostmux: session {} exited", id),
                }
            }
        }
    }
    Ok(())
}

async fn expect_ok(client: &mut Client, request: &Request) -> Result<(), CliError> {
    match client.request(request).await? {
        Response::Ok => Ok(()),
        other => Err(unexpected(other)),
    }
}

async fn report_favorite(
    client: &mut Client,
    request: &Request,
    unchanged: &str,
) -> Result<(), CliError> {
    match client.request(request).await? {
        Response::FavoriteChanged { changed: true } => Ok(()),
        Response::FavoriteChanged { changed: false } => {
            eprintln!("ghostmux: {}", unchanged);
            Ok(())
        }
        other => Err(unexpected(other)),
    }
}

fn unexpected(response: Response) -> CliError {
    CliError::Unexpected(Box::new(response))
}

/// The daemon resolves paths against its own working directory, so send
/// absolute ones. Paths that do not exist are sent unchanged.
fn absolute(path: PathBuf) -> PathBuf {
    std::fs::canonicalize(&path).unwrap_or(path)
}
