//! # kiln-engine
//!
//! Normalisation and realisation engine for kiln, a content-addressed
//! build system.
//!
//! A caller hands the engine the id of a term. The engine rewrites it to
//! its *slice* (the transitive set of content-addressed filesystem
//! elements it denotes), building whatever is necessary along the way, and
//! memoises the rewrite in a successor table so repeat requests are table
//! lookups. The slice can then be *realised*: each element materialised at
//! its declared path.
//!
//! ## Example
//!
//! ```rust,no_run
//! use kiln_engine::{Engine, EngineConfig};
//!
//! # fn main() -> Result<(), kiln_engine::EngineError> {
//! let config = EngineConfig::builder()
//!     .store_dir("/kiln/store")
//!     .db_path("/kiln/var/kiln.sqlite")
//!     .log_dir("/kiln/var/log")
//!     .build()
//!     .expect("valid config");
//!
//! let engine = Engine::open(config)?;
//! let id = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef"
//!     .parse()
//!     .expect("valid id");
//! let slice = engine.normalise(id)?;
//! engine.realise_slice(&slice)?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod db;
pub mod error;
pub mod refs;
pub mod store;

mod normalise;
mod realise;
mod run;

use std::fs;

use tracing::info;

pub use config::{default_system, ConfigError, EngineConfig, EngineConfigBuilder, OutputIdPolicy};
pub use error::EngineError;
pub use run::RUN_LOG;

use db::Db;

/// The engine: configuration plus the embedded database.
///
/// One value per store; all operations take `&self`. A single invocation
/// is single-threaded; the only concurrency is the builder child between
/// spawn and wait. The underlying database may be shared with other
/// engine processes.
#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    db: Db,
}

impl Engine {
    /// Opens an engine over the configured store, creating the store and
    /// log directories and the database if they do not exist yet.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Io`] if a directory cannot be created and
    /// [`EngineError::Db`] if the database cannot be opened.
    pub fn open(config: EngineConfig) -> Result<Self, EngineError> {
        fs::create_dir_all(&config.store_dir).map_err(|e| {
            EngineError::io(
                format!("creating store directory `{}`", config.store_dir.display()),
                e,
            )
        })?;
        fs::create_dir_all(&config.log_dir).map_err(|e| {
            EngineError::io(
                format!("creating log directory `{}`", config.log_dir.display()),
                e,
            )
        })?;
        if let Some(parent) = config.db_path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                EngineError::io(
                    format!("creating database directory `{}`", parent.display()),
                    e,
                )
            })?;
        }
        let db = Db::open(&config.db_path)?;
        info!(store = %config.store_dir.display(), system = %config.system, "opened engine");
        Ok(Self { config, db })
    }

    /// The configuration this engine was opened with.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The underlying database handle.
    #[must_use]
    pub const fn db(&self) -> &Db {
        &self.db
    }
}
