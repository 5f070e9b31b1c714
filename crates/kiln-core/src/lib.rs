//! # kiln-core
//!
//! Core domain types for kiln, a content-addressed build engine.
//!
//! This crate is the pure data layer: it knows nothing about the store on
//! disk, the database, or builder processes. It provides:
//!
//! - **Content ids**: [`FsId`], a fixed-width BLAKE3 digest that identifies
//!   both serialised terms and materialised filesystem content.
//! - **Terms**: [`Term`], the labelled-tuple tree in which build state is
//!   expressed, with a canonical text serialisation.
//! - **Expression views**: [`Expr`] and friends, the typed views
//!   (`Include` / `Derive` / `Slice`) produced by a strict parser over raw
//!   terms.
//!
//! ## Example
//!
//! ```rust
//! use kiln_core::Term;
//!
//! let term = Term::parse("Slice([],[])").unwrap();
//! assert_eq!(term.print(), "Slice([],[])");
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod expr;
pub mod id;
pub mod term;

pub use expr::{BadTerm, Derive, Expr, Slice, SliceElem};
pub use id::{FsId, IdHasher, ParseIdError, hash_bytes, ID_BYTES};
pub use term::{Term, TermError};
