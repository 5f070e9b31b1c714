//! The slice realiser.
//!
//! [`Engine::realise_slice`] materialises every element of a slice at its
//! declared path. It first scans the whole slice for consistency: an
//! element is *installed* when the path registration matches its id,
//! *missing* when neither registration nor path exists, and an
//! *obstruction* otherwise. Obstruction is fatal and nothing is expanded.
//! If some element is missing, every element is (re-)expanded: expansion
//! is idempotent for installed ones, and a partially realised slice from
//! an earlier failure heals on retry because elements are
//! content-addressed.

use tracing::debug;

use kiln_core::{BadTerm, Expr, Slice};

use crate::error::EngineError;
use crate::store::path_exists;
use crate::Engine;

impl Engine {
    /// Materialises each element of `slice` at its declared path.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::BadTerm`] for an element-free slice,
    /// [`EngineError::Obstructed`] when a declared path is occupied by
    /// content the engine cannot account for, and
    /// [`EngineError::UnknownId`] or [`EngineError::Io`] from expansion.
    pub fn realise_slice(&self, slice: &Slice) -> Result<(), EngineError> {
        debug!(elems = slice.elems.len(), "realising slice");
        if slice.elems.is_empty() {
            return Err(EngineError::BadTerm(BadTerm::new(
                "empty slice",
                &Expr::Slice(slice.clone()).to_term(),
            )));
        }

        let mut missing = false;
        for elem in &slice.elems {
            match self.db().id_for_path(&elem.path)? {
                Some(id) if id == elem.id => {},
                Some(_) => {
                    return Err(EngineError::Obstructed {
                        path: elem.path.clone(),
                    });
                },
                None => {
                    if path_exists(&elem.path) {
                        return Err(EngineError::Obstructed {
                            path: elem.path.clone(),
                        });
                    }
                    missing = true;
                },
            }
        }

        if !missing {
            debug!("slice already installed");
            return Ok(());
        }

        for elem in &slice.elems {
            self.expand_id(elem.id, &elem.path)?;
        }
        Ok(())
    }
}
