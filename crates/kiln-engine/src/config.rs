//! Engine configuration.
//!
//! Everything the engine needs to know about its surroundings is resolved
//! once and carried in an [`EngineConfig`] value: the platform tag, the
//! store root, the build log directory, the database location, and the
//! output-id policy. The configuration is passed explicitly into
//! [`crate::Engine::open`] rather than read from process-wide state, so
//! tests can run each fixture against its own store.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How the engine derives the id a produced output is registered under.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputIdPolicy {
    /// Register the id the derivation declared, without re-hashing the
    /// produced content.
    #[default]
    Trust,
    /// Re-hash the produced content and fail the build if it differs from
    /// the declared id.
    Verify,
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Platform tag of this engine; a derivation builds only if its
    /// declared platform matches.
    pub system: String,

    /// Root directory of the managed store.
    pub store_dir: PathBuf,

    /// Directory receiving the shared builder log.
    pub log_dir: PathBuf,

    /// Location of the embedded database file.
    pub db_path: PathBuf,

    /// Output-id policy; see [`OutputIdPolicy`].
    #[serde(default)]
    pub output_id_policy: OutputIdPolicy,
}

impl EngineConfig {
    /// Creates a builder with the conventional defaults.
    #[must_use]
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }
}

/// Platform tag of the running engine, e.g. `x86_64-linux`.
#[must_use]
pub fn default_system() -> String {
    format!("{}-{}", std::env::consts::ARCH, std::env::consts::OS)
}

/// Configuration validation failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The platform tag is empty.
    #[error("system tag must not be empty")]
    EmptySystem,

    /// A configured directory is not absolute.
    #[error("`{name}` must be an absolute path, got `{path}`")]
    RelativePath {
        /// Which field was rejected.
        name: &'static str,
        /// The rejected value.
        path: PathBuf,
    },
}

/// Builder for [`EngineConfig`].
#[derive(Debug, Clone)]
pub struct EngineConfigBuilder {
    system: String,
    store_dir: PathBuf,
    log_dir: PathBuf,
    db_path: PathBuf,
    output_id_policy: OutputIdPolicy,
}

impl Default for EngineConfigBuilder {
    fn default() -> Self {
        Self {
            system: default_system(),
            store_dir: PathBuf::from("/kiln/store"),
            log_dir: PathBuf::from("/kiln/var/log"),
            db_path: PathBuf::from("/kiln/var/kiln.sqlite"),
            output_id_policy: OutputIdPolicy::Trust,
        }
    }
}

impl EngineConfigBuilder {
    /// Sets the platform tag.
    #[must_use]
    pub fn system(mut self, system: impl Into<String>) -> Self {
        self.system = system.into();
        self
    }

    /// Sets the store root.
    #[must_use]
    pub fn store_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.store_dir = dir.into();
        self
    }

    /// Sets the build log directory.
    #[must_use]
    pub fn log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = dir.into();
        self
    }

    /// Sets the database location.
    #[must_use]
    pub fn db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = path.into();
        self
    }

    /// Sets the output-id policy.
    #[must_use]
    pub const fn output_id_policy(mut self, policy: OutputIdPolicy) -> Self {
        self.output_id_policy = policy;
        self
    }

    /// Validates and builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the system tag is empty or a configured
    /// path is not absolute.
    pub fn build(self) -> Result<EngineConfig, ConfigError> {
        if self.system.is_empty() {
            return Err(ConfigError::EmptySystem);
        }
        check_absolute("store_dir", &self.store_dir)?;
        check_absolute("log_dir", &self.log_dir)?;
        check_absolute("db_path", &self.db_path)?;
        Ok(EngineConfig {
            system: self.system,
            store_dir: self.store_dir,
            log_dir: self.log_dir,
            db_path: self.db_path,
            output_id_policy: self.output_id_policy,
        })
    }
}

fn check_absolute(name: &'static str, path: &Path) -> Result<(), ConfigError> {
    if path.is_absolute() {
        Ok(())
    } else {
        Err(ConfigError::RelativePath {
            name,
            path: path.to_path_buf(),
        })
    }
}
