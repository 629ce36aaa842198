use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crossbeam_channel::Receiver;
use once_cell::sync::OnceCell;
use tracing_subscriber::{fmt, EnvFilter};

use crate::app::{AlwaysConfirm, Collaborators, Confirm, NoteController, StdinConfirm};
use crate::config::ConfigLoader;
use crate::remote::SqliteDocumentStore;
use crate::session::FileCredentialProvider;
use crate::storage::{self, LocalStore};
use crate::sync::SyncEvent;

pub mod commands;

use self::commands::{
    AddArgs, DeleteArgs, EditArgs, LoginArgs, MoveArgs, SelectArgs, ShowArgs, StampArgs,
};

const SESSION_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(
    name = "notesync",
    version,
    about = "Tabbed notes kept locally or synced per user"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Override the config file location (takes precedence over NOTESYNC_CONFIG)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override the data directory (takes precedence over NOTESYNC_DATA)
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Minimum log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the note tabs in order (default)
    List,
    /// Print a note's content (the active note if no id is given)
    Show(ShowArgs),
    /// Open a new empty note and make it active
    Add(AddArgs),
    /// Replace a note's content
    Edit(EditArgs),
    /// Make a note the active one
    Select(SelectArgs),
    /// Delete a note after confirmation
    Delete(DeleteArgs),
    /// Move a tab from one position to another (0-based)
    Move(MoveArgs),
    /// Append the current date and time to a note (the active one by default)
    Stamp(StampArgs),
    /// Sign in and copy local notes to the signed-in user's collection
    Login(LoginArgs),
    /// Sign out and return to the notes kept on this machine
    Logout,
    /// Show the session and sync state
    Status,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    if let Some(path) = &cli.config {
        env::set_var("NOTESYNC_CONFIG", path);
    }
    if let Some(path) = &cli.data_dir {
        env::set_var("NOTESYNC_DATA", path);
    }

    let loader = ConfigLoader::discover()?;
    loader.paths().ensure_directories()?;
    init_tracing(&cli.log_level)
        .with_context(|| format!("initialising logging at level {}", cli.log_level))?;
    let config = loader.load_or_init()?;

    let local: Arc<dyn LocalStore> = Arc::new(
        storage::init(&config.storage.local_db_path, &config.storage)
            .context("opening local note store")?,
    );
    let remote = Arc::new(
        SqliteDocumentStore::open(&config.storage.remote_db_path, &config.storage)
            .context("opening document store")?,
    );
    let credentials = Arc::new(
        FileCredentialProvider::new(local.clone()).context("reading saved session")?,
    );

    let command = cli.command.unwrap_or(Commands::List);
    let confirm: Box<dyn Confirm> = match &command {
        Commands::Delete(args) if args.yes => Box::new(AlwaysConfirm),
        _ => Box::new(StdinConfirm),
    };

    let mut controller = NoteController::new(
        &config,
        Collaborators {
            local,
            remote,
            credentials: credentials.clone(),
            confirm,
        },
    )?;
    let sync_events = controller.sync_events();
    controller
        .await_session(SESSION_TIMEOUT)
        .context("resolving session")?;

    let output = match command {
        Commands::List => Ok(commands::list(&controller)),
        Commands::Show(args) => commands::show(&controller, args),
        Commands::Add(args) => commands::add(&mut controller, args),
        Commands::Edit(args) => commands::edit(&mut controller, args),
        Commands::Select(args) => commands::select(&mut controller, args),
        Commands::Delete(args) => commands::delete(&mut controller, args),
        Commands::Move(args) => commands::move_tab(&mut controller, args),
        Commands::Stamp(args) => commands::stamp(&mut controller, args),
        Commands::Login(args) => commands::login(&mut controller, &credentials, args),
        Commands::Logout => commands::logout(&mut controller),
        Commands::Status => Ok(commands::status(&controller)),
    };

    let flushed = controller.flush_remote();
    report_sync_failures(&controller, &sync_events);
    let output = output?;
    print!("{output}");
    if !flushed {
        eprintln!("warning: some remote writes did not finish before exit");
    }
    Ok(())
}

fn report_sync_failures(controller: &NoteController, events: &Receiver<SyncEvent>) {
    for event in events.try_iter() {
        match event {
            SyncEvent::Failed { op, message, .. } => {
                eprintln!("warning: remote {op} failed: {message}");
            }
            SyncEvent::Discarded { op, .. } => {
                eprintln!("warning: remote {op} dropped after the session changed");
            }
            _ => {}
        }
    }
    if let Some(error) = controller.last_error() {
        eprintln!("warning: {error}");
    }
}

fn init_tracing(level: &str) -> Result<()> {
    static INIT: OnceCell<()> = OnceCell::new();
    INIT.get_or_try_init(|| {
        let env_filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn"));
        fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
        Ok(())
    })
    .map(|_| ())
}
