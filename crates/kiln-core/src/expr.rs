//! Typed views over raw terms.
//!
//! A term in the store has exactly three inhabited shapes: an `Include`
//! indirection, a `Derive` recipe, or a `Slice` normal form. [`Expr`] is
//! the tagged view of those shapes; [`Expr::from_term`] is the strict
//! parser that rejects anything else. Going through the typed view (rather
//! than matching tag strings at use sites) is what keeps malformed terms
//! from being half-accepted deep inside the engine.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::id::FsId;
use crate::term::Term;

/// A term that does not have one of the three expected shapes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{reason}, in `{term}`")]
pub struct BadTerm {
    /// What was wrong.
    pub reason: String,
    /// The printed offending (sub-)term.
    pub term: String,
}

impl BadTerm {
    /// Builds an error pointing at `term`.
    #[must_use]
    pub fn new(reason: impl Into<String>, term: &Term) -> Self {
        Self {
            reason: reason.into(),
            term: term.print(),
        }
    }
}

/// The typed view of a term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    /// Indirection: the real term lives under this id in the term store.
    Include(FsId),
    /// A recipe for producing outputs by running a builder.
    Derive(Derive),
    /// Normal form: a set of content-addressed filesystem elements.
    Slice(Slice),
}

/// A build recipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Derive {
    /// Declared output paths, each paired with the id its content will be
    /// registered under.
    pub outputs: Vec<(PathBuf, FsId)>,
    /// Ids of input terms, realised before the build runs.
    pub inputs: Vec<FsId>,
    /// The program to execute.
    pub builder: PathBuf,
    /// Platform tag the builder requires.
    pub platform: String,
    /// Environment the builder runs with, exactly as declared.
    pub env: Vec<(String, String)>,
}

/// One element of a slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceElem {
    /// Concrete on-disk path.
    pub path: PathBuf,
    /// Id of the content at that path.
    pub id: FsId,
    /// Ids of the other elements this one references.
    pub refs: Vec<FsId>,
}

/// A term in normal form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slice {
    /// Top-level output ids.
    pub roots: Vec<FsId>,
    /// All elements, closed under references.
    pub elems: Vec<SliceElem>,
}

impl Expr {
    /// Parses the typed view of a raw term.
    ///
    /// # Errors
    ///
    /// Returns [`BadTerm`] for an unknown tag, wrong arity, wrong atom
    /// type, a malformed id, or a non-absolute path.
    pub fn from_term(term: &Term) -> Result<Self, BadTerm> {
        let Term::App(name, args) = term else {
            return Err(BadTerm::new("expected Include, Derive or Slice", term));
        };
        match (name.as_str(), args.as_slice()) {
            ("Include", [id]) => Ok(Self::Include(parse_id(id)?)),
            ("Include", _) => Err(BadTerm::new("Include expects one id", term)),

            ("Derive", [Term::List(outs), Term::List(ins), builder, Term::Str(platform), Term::List(bindings)]) => {
                Ok(Self::Derive(Derive {
                    outputs: outs.iter().map(parse_output).collect::<Result<_, _>>()?,
                    inputs: ins.iter().map(parse_id).collect::<Result<_, _>>()?,
                    builder: parse_path(builder)?,
                    platform: platform.clone(),
                    env: bindings.iter().map(parse_binding).collect::<Result<_, _>>()?,
                }))
            },
            ("Derive", _) => Err(BadTerm::new(
                "Derive expects (outputs, inputs, builder, platform, bindings)",
                term,
            )),

            ("Slice", [Term::List(roots), Term::List(elems)]) => Ok(Self::Slice(Slice {
                roots: roots.iter().map(parse_id).collect::<Result<_, _>>()?,
                elems: elems.iter().map(parse_elem).collect::<Result<_, _>>()?,
            })),
            ("Slice", _) => Err(BadTerm::new("Slice expects (roots, elements)", term)),

            _ => Err(BadTerm::new(format!("unknown tag `{name}`"), term)),
        }
    }

    /// Renders the view back into a raw term.
    ///
    /// `from_term` and `to_term` are inverses, so the id of a round-tripped
    /// term is stable.
    #[must_use]
    pub fn to_term(&self) -> Term {
        match self {
            Self::Include(id) => Term::App("Include".into(), vec![id_term(*id)]),
            Self::Derive(d) => Term::App(
                "Derive".into(),
                vec![
                    Term::List(
                        d.outputs
                            .iter()
                            .map(|(path, id)| Term::Tuple(vec![path_term(path), id_term(*id)]))
                            .collect(),
                    ),
                    Term::List(d.inputs.iter().copied().map(id_term).collect()),
                    path_term(&d.builder),
                    Term::Str(d.platform.clone()),
                    Term::List(
                        d.env
                            .iter()
                            .map(|(name, value)| {
                                Term::Tuple(vec![Term::Str(name.clone()), Term::Str(value.clone())])
                            })
                            .collect(),
                    ),
                ],
            ),
            Self::Slice(s) => Term::App(
                "Slice".into(),
                vec![
                    Term::List(s.roots.iter().copied().map(id_term).collect()),
                    Term::List(
                        s.elems
                            .iter()
                            .map(|elem| {
                                Term::Tuple(vec![
                                    path_term(&elem.path),
                                    id_term(elem.id),
                                    Term::List(elem.refs.iter().copied().map(id_term).collect()),
                                ])
                            })
                            .collect(),
                    ),
                ],
            ),
        }
    }
}

fn id_term(id: FsId) -> Term {
    Term::Str(id.to_string())
}

fn path_term(path: &Path) -> Term {
    Term::Str(path.to_string_lossy().into_owned())
}

fn parse_id(term: &Term) -> Result<FsId, BadTerm> {
    let Term::Str(s) = term else {
        return Err(BadTerm::new("not an id", term));
    };
    s.parse().map_err(|e| BadTerm::new(format!("not an id: {e}"), term))
}

fn parse_path(term: &Term) -> Result<PathBuf, BadTerm> {
    let Term::Str(s) = term else {
        return Err(BadTerm::new("not a path", term));
    };
    if !s.starts_with('/') {
        return Err(BadTerm::new("path is not absolute", term));
    }
    Ok(PathBuf::from(s))
}

fn parse_output(term: &Term) -> Result<(PathBuf, FsId), BadTerm> {
    let Term::Tuple(fields) = term else {
        return Err(BadTerm::new("not an output pair", term));
    };
    let [path, id] = fields.as_slice() else {
        return Err(BadTerm::new("output expects (path, id)", term));
    };
    Ok((parse_path(path)?, parse_id(id)?))
}

fn parse_binding(term: &Term) -> Result<(String, String), BadTerm> {
    let Term::Tuple(fields) = term else {
        return Err(BadTerm::new("tuple of strings expected", term));
    };
    let [Term::Str(name), Term::Str(value)] = fields.as_slice() else {
        return Err(BadTerm::new("tuple of strings expected", term));
    };
    Ok((name.clone(), value.clone()))
}

fn parse_elem(term: &Term) -> Result<SliceElem, BadTerm> {
    let Term::Tuple(fields) = term else {
        return Err(BadTerm::new("not a slice element", term));
    };
    let [path, id, Term::List(refs)] = fields.as_slice() else {
        return Err(BadTerm::new("slice element expects (path, id, refs)", term));
    };
    Ok(SliceElem {
        path: parse_path(path)?,
        id: parse_id(id)?,
        refs: refs.iter().map(parse_id).collect::<Result<_, _>>()?,
    })
}
