//! The normaliser.
//!
//! [`Engine::normalise`] rewrites the term under an id to its slice:
//!
//! 1. Chase memoised successors (with a cycle guard) to skip work already
//!    done.
//! 2. Load the term. A slice is already normal; an include is followed; a
//!    derivation is built.
//! 3. For a derivation: check the platform, normalise and realise every
//!    input, assemble the declared environment, refuse pre-existing output
//!    paths, run the builder, verify and register the outputs, scan them
//!    for references to input paths, and close the resulting element set
//!    under those references.
//! 4. Persist the slice as a term and record the successor edge, so the
//!    next request is a table lookup.
//!
//! Within one invocation inputs are realised in declaration order and
//! outputs are registered in declaration order; the successor edge is
//! written only after the normal form is durable in the term store.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;

use tracing::{debug, info};

use kiln_core::{BadTerm, Derive, Expr, FsId, Slice, SliceElem};

use crate::config::OutputIdPolicy;
use crate::error::EngineError;
use crate::refs::filter_references;
use crate::run::run_builder;
use crate::store::{hash_path, path_exists};
use crate::Engine;

impl Engine {
    /// Rewrites the term under `id` to its normal form.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::BadTerm`] for malformed terms,
    /// [`EngineError::PlatformMismatch`] before any build on the wrong
    /// platform, [`EngineError::PathExists`] for occupied output paths,
    /// [`EngineError::Build`] for builder failures or missing outputs, and
    /// [`EngineError::Obstructed`] from realising inputs.
    pub fn normalise(&self, id: FsId) -> Result<Slice, EngineError> {
        let id = self.chase_successors(id)?;
        debug!(id = %id, "normalising");

        let term = self.term_from_id(id)?;
        match Expr::from_term(&term)? {
            Expr::Slice(slice) => Ok(slice),
            Expr::Include(inner) => self.normalise(inner),
            Expr::Derive(derive) => self.normalise_derive(id, &derive),
        }
    }

    /// Follows successor edges until none remains, stopping early if the
    /// chain revisits an id. A malformed memo table can contain cycles;
    /// they bound the chase instead of erroring.
    fn chase_successors(&self, mut id: FsId) -> Result<FsId, EngineError> {
        let mut seen = HashSet::from([id]);
        while let Some(next) = self.db().successor(id)? {
            let revisit = !seen.insert(next);
            debug!(from = %id, to = %next, "following successor");
            id = next;
            if revisit {
                debug!(id = %id, "successor cycle detected");
                break;
            }
        }
        Ok(id)
    }

    fn normalise_derive(&self, derive_id: FsId, derive: &Derive) -> Result<Slice, EngineError> {
        // Platform gate comes before inputs are realised or anything is
        // spawned.
        if derive.platform != self.config().system {
            return Err(EngineError::PlatformMismatch {
                required: derive.platform.clone(),
                running: self.config().system.clone(),
            });
        }

        // Normalise and realise every input, collecting elements in
        // first-appearance order, deduplicated by (path, id). The same
        // path under two different ids is a corrupt input.
        let mut input_elems: Vec<SliceElem> = Vec::new();
        let mut input_paths: Vec<PathBuf> = Vec::new();
        for input in &derive.inputs {
            let sub = self.normalise(*input)?;
            self.realise_slice(&sub)?;
            for elem in &sub.elems {
                match input_elems.iter().find(|e| e.path == elem.path) {
                    Some(existing) if existing.id == elem.id => {},
                    Some(_) => {
                        return Err(EngineError::BadTerm(BadTerm::new(
                            format!(
                                "conflicting ids for input path `{}`",
                                elem.path.display()
                            ),
                            &Expr::Slice(sub.clone()).to_term(),
                        )));
                    },
                    None => {
                        input_paths.push(elem.path.clone());
                        input_elems.push(elem.clone());
                    },
                }
            }
        }

        // The environment is exactly the declared bindings; a repeated
        // name keeps its last value.
        let env: BTreeMap<String, String> = derive.env.iter().cloned().collect();

        // No declared output may exist before the build.
        for (path, _) in &derive.outputs {
            if path_exists(path) {
                return Err(EngineError::PathExists { path: path.clone() });
            }
        }

        run_builder(&derive.builder, &env, &self.config().log_dir)?;

        // Verify and register the outputs in declaration order.
        let mut roots = Vec::new();
        for (path, declared) in &derive.outputs {
            if !path_exists(path) {
                return Err(EngineError::build(format!(
                    "builder `{}` did not produce output `{}`",
                    derive.builder.display(),
                    path.display()
                )));
            }
            let id = match self.config().output_id_policy {
                OutputIdPolicy::Trust => *declared,
                OutputIdPolicy::Verify => {
                    let actual = hash_path(path)?;
                    if actual != *declared {
                        return Err(EngineError::build(format!(
                            "output `{}` hashes to {actual}, but {declared} was declared",
                            path.display()
                        )));
                    }
                    actual
                },
            };
            self.register_path(path, id)?;
            roots.push(id);
        }

        // Scan each output for input paths that occur literally in its
        // bytes, and translate the hits back to ids.
        let elem_for_path: HashMap<&std::path::Path, &SliceElem> = input_elems
            .iter()
            .map(|elem| (elem.path.as_path(), elem))
            .collect();
        let mut elems = Vec::new();
        let mut referenced: Vec<FsId> = Vec::new();
        for ((path, _), id) in derive.outputs.iter().zip(&roots) {
            let ref_paths = filter_references(path, &input_paths)?;
            let refs: Vec<FsId> = ref_paths
                .iter()
                .filter_map(|p| elem_for_path.get(p.as_path()).map(|elem| elem.id))
                .collect();
            debug!(output = %path.display(), refs = refs.len(), "scanned output");
            referenced.extend(&refs);
            elems.push(SliceElem {
                path: path.clone(),
                id: *id,
                refs,
            });
        }

        // Close the element set under references, keeping input elements
        // in their first-appearance order.
        let mut elem_for_id: HashMap<FsId, &SliceElem> = HashMap::new();
        for elem in &input_elems {
            elem_for_id.entry(elem.id).or_insert(elem);
        }
        let mut included: HashSet<FsId> = HashSet::new();
        let mut work = referenced;
        while let Some(id) = work.pop() {
            if included.insert(id) {
                if let Some(elem) = elem_for_id.get(&id) {
                    work.extend(elem.refs.iter().copied());
                }
            }
        }
        elems.extend(
            input_elems
                .iter()
                .filter(|elem| included.contains(&elem.id))
                .cloned(),
        );

        let slice = Slice { roots, elems };

        // Persist the normal form, then memoise the rewrite. Order
        // matters: the successor edge must point at a durable term.
        let nf_term = Expr::Slice(slice.clone()).to_term();
        let nf_id = self.write_term(&nf_term, &format!("-s-{derive_id}"))?;
        self.db().set_successor(derive_id, nf_id)?;
        info!(id = %derive_id, normal_form = %nf_id, "normalised derivation");

        Ok(slice)
    }
}
