//! SafeSync CLI
//!
//! Manages password databases in a local directory and syncs them with a
//! directory-backed remote.
//!
//! # Commands
//!
//! - `list` - Show registered databases and their sync status
//! - `create`, `import`, `rename`, `remove`, `duplicate` - Manage the registry
//! - `entries`, `add-entry` - Read and edit a database
//! - `mark`, `unmark` - Choose which databases are synced
//! - `sync` - Sync one database, resolving conflicts with `--strategy`

mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use commands::Session;
use safesync_sync::{EntryChoice, Strategy};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Password database registry and sync tool.
#[derive(Parser)]
#[command(name = "safesync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory holding the local databases
    #[arg(global = true, short, long, default_value = ".")]
    dir: PathBuf,

    /// Directory acting as the remote store
    #[arg(global = true, short, long)]
    remote: Option<PathBuf>,

    /// Passphrase for databases that must be unlocked
    #[arg(global = true, short, long, env = "SAFESYNC_PASSPHRASE", hide_env_values = true)]
    passphrase: Option<String>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered databases
    List {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Create an empty database
    Create {
        /// Friendly name
        name: String,

        /// Backing file name (generated if omitted)
        #[arg(long)]
        file: Option<String>,
    },

    /// Register an existing database file
    Import {
        /// Friendly name
        name: String,

        /// Path of the database file
        file: PathBuf,
    },

    /// Rename a database
    Rename {
        /// Current name
        old: String,
        /// New name
        new: String,
    },

    /// Remove a database and delete its file
    Remove {
        /// Friendly name
        name: String,
    },

    /// Copy a database under a new name
    Duplicate {
        /// Source name
        old: String,
        /// Name of the copy
        new: String,
    },

    /// List the entries of a database
    Entries {
        /// Friendly name
        name: String,
    },

    /// Add an entry to a database
    AddEntry {
        /// Friendly name
        name: String,

        /// Entry title
        #[arg(long)]
        title: String,

        /// User name
        #[arg(long)]
        user: String,

        /// Entry password
        #[arg(long)]
        password: String,

        /// URL
        #[arg(long, default_value = "")]
        url: String,

        /// Notes
        #[arg(long, default_value = "")]
        notes: String,
    },

    /// Include a database in sync
    Mark {
        /// Friendly name
        name: String,
    },

    /// Exclude a database from sync
    Unmark {
        /// Friendly name
        name: String,
    },

    /// Sync a database with the remote
    Sync {
        /// Friendly name
        name: String,

        /// How to resolve a conflict
        #[arg(short, long, value_enum)]
        strategy: Option<StrategyArg>,

        /// Side to keep for every conflicting entry when merging
        #[arg(long, value_enum)]
        prefer: Option<PreferArg>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum StrategyArg {
    KeepLocal,
    KeepRemote,
    Merge,
}

impl From<StrategyArg> for Strategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::KeepLocal => Strategy::KeepLocal,
            StrategyArg::KeepRemote => Strategy::KeepRemote,
            StrategyArg::Merge => Strategy::Merge,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum PreferArg {
    Local,
    Remote,
}

impl From<PreferArg> for EntryChoice {
    fn from(arg: PreferArg) -> Self {
        match arg {
            PreferArg::Local => EntryChoice::KeepLocal,
            PreferArg::Remote => EntryChoice::KeepRemote,
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let session = Session::open(&cli.dir)?;
    let passphrase = || commands::passphrase(cli.passphrase.as_deref());

    match cli.command {
        Commands::List { format } => commands::databases::list(&session, &format)?,
        Commands::Create { name, file } => {
            commands::databases::create(&session, &name, file.as_deref(), &passphrase()?)?;
        }
        Commands::Import { name, file } => {
            commands::databases::import(&session, &name, &file, &passphrase()?)?;
        }
        Commands::Rename { old, new } => commands::databases::rename(&session, &old, &new)?,
        Commands::Remove { name } => commands::databases::remove(&session, &name)?,
        Commands::Duplicate { old, new } => commands::databases::duplicate(&session, &old, &new)?,
        Commands::Entries { name } => commands::entries::list(&session, &name, &passphrase()?)?,
        Commands::AddEntry {
            name,
            title,
            user,
            password,
            url,
            notes,
        } => {
            let entry = safesync_storage::Entry::new(title, user, password)
                .with_url(url)
                .with_notes(notes);
            commands::entries::add(&session, &name, &passphrase()?, entry)?;
        }
        Commands::Mark { name } => commands::membership::mark(&session, &name)?,
        Commands::Unmark { name } => commands::membership::unmark(&session, &name)?,
        Commands::Sync {
            name,
            strategy,
            prefer,
        } => {
            let remote = cli.remote.as_deref().ok_or("Remote directory required for sync")?;
            commands::sync::run(
                &session,
                remote,
                &name,
                &passphrase()?,
                strategy.map(Strategy::from),
                prefer.map(EntryChoice::from),
            )?;
        }
    }

    Ok(())
}
