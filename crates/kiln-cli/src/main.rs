//! kiln: content-addressed build engine.
//!
//! CLI driver: imports terms into the store, normalises them to slices,
//! and realises slices on disk.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use kiln_core::{Expr, FsId, Term};
use kiln_engine::{default_system, Engine, EngineConfig, OutputIdPolicy};

/// kiln: content-addressed build engine
#[derive(Parser, Debug)]
#[command(name = "kiln")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Store root directory
    #[arg(long, default_value = "/kiln/store")]
    store: PathBuf,

    /// Database file
    #[arg(long, default_value = "/kiln/var/kiln.sqlite")]
    db: PathBuf,

    /// Directory receiving the shared build log
    #[arg(long, default_value = "/kiln/var/log")]
    log_dir: PathBuf,

    /// Platform tag (defaults to the running platform)
    #[arg(long)]
    system: Option<String>,

    /// Re-hash builder outputs instead of trusting declared ids
    #[arg(long)]
    verify_outputs: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Import a term file into the store and print its id
    Add {
        /// File holding a printed term
        file: PathBuf,
    },

    /// Print the term stored under an id
    Show {
        /// Id to look up
        id: String,
    },

    /// Rewrite a term to its normal form and print the resulting slice
    Normalise {
        /// Id of the term to normalise
        id: String,
    },

    /// Normalise a term and materialise the resulting slice
    Realise {
        /// Id of the term to realise
        id: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let engine = open_engine(&cli)?;

    match cli.command {
        Commands::Add { file } => {
            let text = fs::read_to_string(&file)
                .with_context(|| format!("reading `{}`", file.display()))?;
            let term = Term::parse(&text)
                .with_context(|| format!("parsing `{}`", file.display()))?;
            // Import only terms the engine can actually work with.
            Expr::from_term(&term)
                .with_context(|| format!("checking `{}`", file.display()))?;
            let id = engine.write_term(&term, "")?;
            println!("{id}");
        },

        Commands::Show { id } => {
            let term = engine.term_from_id(parse_id(&id)?)?;
            println!("{term}");
        },

        Commands::Normalise { id } => {
            let slice = engine.normalise(parse_id(&id)?)?;
            println!("{}", Expr::Slice(slice).to_term());
        },

        Commands::Realise { id } => {
            let slice = engine.normalise(parse_id(&id)?)?;
            engine.realise_slice(&slice)?;
            for elem in &slice.elems {
                println!("{}", elem.path.display());
            }
        },
    }

    Ok(())
}

fn open_engine(cli: &Cli) -> Result<Engine> {
    let policy = if cli.verify_outputs {
        OutputIdPolicy::Verify
    } else {
        OutputIdPolicy::Trust
    };
    let config = EngineConfig::builder()
        .system(cli.system.clone().unwrap_or_else(default_system))
        .store_dir(cli.store.clone())
        .log_dir(cli.log_dir.clone())
        .db_path(cli.db.clone())
        .output_id_policy(policy)
        .build()
        .context("invalid configuration")?;
    Ok(Engine::open(config)?)
}

fn parse_id(s: &str) -> Result<FsId> {
    s.parse().context("invalid id")
}
