//! Engine error surface.
//!
//! One sum type covers everything a caller can observe from normalising or
//! realising. There is no hierarchy; every variant carries the operation
//! context and the offending id or path. Nothing is recovered locally
//! except the successor chase (missing successor or cycle); see
//! `normalise.rs`.

use std::path::PathBuf;

use thiserror::Error;

use kiln_core::{BadTerm, FsId};

use crate::db::DbError;

/// Errors produced by the engine.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// A term does not have one of the expected shapes.
    #[error(transparent)]
    BadTerm(#[from] BadTerm),

    /// The builder failed, or did not produce what it declared.
    #[error("build failed: {message}")]
    Build {
        /// What went wrong, including the builder or output path.
        message: String,
    },

    /// The derivation targets a different platform than this engine.
    #[error("a `{required}` is required, but this system is a `{running}`")]
    PlatformMismatch {
        /// Platform tag the derivation declared.
        required: String,
        /// Platform tag the engine was configured with.
        running: String,
    },

    /// A declared output path already exists before the build.
    #[error("path `{path}` exists")]
    PathExists {
        /// The occupied output path.
        path: PathBuf,
    },

    /// A declared path is occupied by content the engine cannot account
    /// for.
    #[error("path `{path}` obstructed")]
    Obstructed {
        /// The obstructed path.
        path: PathBuf,
    },

    /// No live materialisation of this id is known to the path store.
    #[error("cannot expand id `{id}`: no live path registered for it")]
    UnknownId {
        /// The id without a materialisation.
        id: FsId,
    },

    /// A database read or write failed.
    #[error(transparent)]
    Db(#[from] DbError),

    /// A filesystem operation failed.
    #[error("{context}: {source}")]
    Io {
        /// What the engine was doing.
        context: String,
        /// The underlying error.
        source: std::io::Error,
    },
}

impl EngineError {
    /// Wraps an I/O error with operation context.
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Builds a [`EngineError::Build`] with a formatted message.
    pub(crate) fn build(message: impl Into<String>) -> Self {
        Self::Build {
            message: message.into(),
        }
    }
}

