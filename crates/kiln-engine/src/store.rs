//! Term store and path store.
//!
//! The term store is an append-only mapping from id to serialised term:
//! [`Engine::write_term`] prints a term canonically, hashes the bytes, and
//! drops them at `<store>/<id><suffix>.kiln`; [`Engine::term_from_id`]
//! reads them back. Terms are immutable once written: re-writing the same
//! term is a no-op because the id determines the file name and content.
//!
//! The path store tracks which id each materialised store path carries
//! ([`Engine::register_path`]) and can re-materialise an id at a new path
//! ([`Engine::expand_id`]) by copying from any live registration.
//! Materialisation goes through a temporary sibling plus rename, so a
//! concurrent observer sees either nothing or the finished tree.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use kiln_core::{hash_bytes, BadTerm, FsId, IdHasher, Term};

use crate::error::EngineError;
use crate::Engine;

/// File extension for serialised terms in the store.
pub const TERM_EXT: &str = "kiln";

/// Disambiguates temporary names when one process expands several ids.
static EXPAND_COUNTER: AtomicU64 = AtomicU64::new(0);

impl Engine {
    /// Serialises `term`, stores it under its content id with the given
    /// file-name suffix, registers the path, and returns the id.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Io`] if the file cannot be written and
    /// [`EngineError::Db`] if registration fails.
    pub fn write_term(&self, term: &Term, suffix: &str) -> Result<FsId, EngineError> {
        let printed = term.print();
        let id = hash_bytes(printed.as_bytes());
        let path = self
            .config()
            .store_dir
            .join(format!("{id}{suffix}.{TERM_EXT}"));
        if !path_exists(&path) {
            write_atomic(&path, printed.as_bytes())?;
            debug!(id = %id, path = %path.display(), "wrote term");
        }
        self.register_path(&path, id)?;
        Ok(id)
    }

    /// Loads and parses the term stored under `id`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnknownId`] if no live path carries the id,
    /// [`EngineError::Io`] if the file cannot be read, and
    /// [`EngineError::BadTerm`] if its bytes do not parse.
    pub fn term_from_id(&self, id: FsId) -> Result<Term, EngineError> {
        let path = self
            .live_path_for(id)?
            .ok_or(EngineError::UnknownId { id })?;
        let text = fs::read_to_string(&path)
            .map_err(|e| EngineError::io(format!("reading term file `{}`", path.display()), e))?;
        Term::parse(&text).map_err(|e| {
            EngineError::BadTerm(BadTerm {
                reason: e.to_string(),
                term: snippet(&text),
            })
        })
    }

    /// Records that the content at `path` carries `id`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Db`] on write failure.
    pub fn register_path(&self, path: &Path, id: FsId) -> Result<(), EngineError> {
        self.db().set_path_id(path, id)?;
        Ok(())
    }

    /// Materialises the content registered under `id` at `target`.
    ///
    /// Idempotent: a target already carrying `id` is left alone. A target
    /// occupied by anything else is an obstruction.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Obstructed`] for an occupied target,
    /// [`EngineError::UnknownId`] when no live source path exists, and
    /// [`EngineError::Io`] on copy failure.
    pub fn expand_id(&self, id: FsId, target: &Path) -> Result<(), EngineError> {
        if path_exists(target) {
            return match self.db().id_for_path(target)? {
                Some(existing) if existing == id => Ok(()),
                _ => Err(EngineError::Obstructed {
                    path: target.to_path_buf(),
                }),
            };
        }
        let source = self
            .live_path_for(id)?
            .ok_or(EngineError::UnknownId { id })?;
        debug!(id = %id, source = %source.display(), target = %target.display(), "expanding id");

        let parent = target.parent().unwrap_or_else(|| Path::new("/"));
        let serial = EXPAND_COUNTER.fetch_add(1, Ordering::Relaxed);
        let tmp = parent.join(format!(".kiln-expand-{}-{serial}", std::process::id()));
        if let Err(e) = copy_tree(&source, &tmp) {
            let _ = remove_tree_quiet(&tmp);
            return Err(e);
        }
        if let Err(e) = fs::rename(&tmp, target) {
            let _ = remove_tree_quiet(&tmp);
            return Err(EngineError::io(
                format!("installing `{}`", target.display()),
                e,
            ));
        }
        self.register_path(target, id)
    }

    /// Deletes a path from disk and drops its registration.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Io`] on removal failure and
    /// [`EngineError::Db`] if unregistration fails.
    pub fn delete_from_store(&self, path: &Path) -> Result<(), EngineError> {
        if path_exists(path) {
            remove_tree(path)?;
        }
        self.db().remove_path(path)?;
        Ok(())
    }

    /// First registered path for `id` that still exists on disk.
    fn live_path_for(&self, id: FsId) -> Result<Option<PathBuf>, EngineError> {
        for path in self.db().paths_for_id(id)? {
            if path_exists(&path) {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }
}

/// `lstat`-style existence check; a dangling symlink counts as existing.
pub(crate) fn path_exists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

/// Content hash of a path.
///
/// A regular file hashes to the hash of its bytes. A directory hashes a
/// framed walk of its entries in name order, so tree hashes are
/// deterministic and two trees differing only in an entry name differ in
/// hash.
///
/// # Errors
///
/// Returns [`EngineError::Io`] on read failure or for path kinds the store
/// does not manage (sockets, devices).
pub fn hash_path(path: &Path) -> Result<FsId, EngineError> {
    let meta = fs::symlink_metadata(path)
        .map_err(|e| EngineError::io(format!("hashing `{}`", path.display()), e))?;
    if meta.is_file() {
        let bytes = fs::read(path)
            .map_err(|e| EngineError::io(format!("hashing `{}`", path.display()), e))?;
        Ok(hash_bytes(&bytes))
    } else if meta.is_dir() {
        let mut hasher = IdHasher::new();
        hasher.update(b"dir\0");
        for (name, entry) in sorted_entries(path)? {
            hasher.update(name.as_bytes());
            hasher.update(b"\0");
            hasher.update(hash_path(&entry)?.as_bytes());
        }
        Ok(hasher.finish())
    } else {
        Err(EngineError::io(
            format!("hashing `{}`", path.display()),
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "not a regular file or directory",
            ),
        ))
    }
}

/// Directory entries as `(name, path)`, sorted by name.
pub(crate) fn sorted_entries(dir: &Path) -> Result<Vec<(String, PathBuf)>, EngineError> {
    let ctx = || format!("listing `{}`", dir.display());
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| EngineError::io(ctx(), e))? {
        let entry = entry.map_err(|e| EngineError::io(ctx(), e))?;
        entries.push((entry.file_name().to_string_lossy().into_owned(), entry.path()));
    }
    entries.sort();
    Ok(entries)
}

/// Writes `bytes` at `path` through a temporary sibling plus rename.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), EngineError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("/"));
    let ctx = || format!("writing `{}`", path.display());
    let mut tmp = tempfile::Builder::new()
        .prefix(".kiln-term-")
        .tempfile_in(parent)
        .map_err(|e| EngineError::io(ctx(), e))?;
    io::Write::write_all(&mut tmp, bytes).map_err(|e| EngineError::io(ctx(), e))?;
    tmp.persist(path)
        .map_err(|e| EngineError::io(ctx(), e.error))?;
    Ok(())
}

fn copy_tree(source: &Path, dest: &Path) -> Result<(), EngineError> {
    let ctx = || {
        format!(
            "copying `{}` to `{}`",
            source.display(),
            dest.display()
        )
    };
    let meta = fs::symlink_metadata(source).map_err(|e| EngineError::io(ctx(), e))?;
    if meta.is_file() {
        fs::copy(source, dest).map_err(|e| EngineError::io(ctx(), e))?;
    } else if meta.is_dir() {
        fs::create_dir(dest).map_err(|e| EngineError::io(ctx(), e))?;
        for (name, entry) in sorted_entries(source)? {
            copy_tree(&entry, &dest.join(name))?;
        }
    } else {
        return Err(EngineError::io(
            ctx(),
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "not a regular file or directory",
            ),
        ));
    }
    Ok(())
}

fn remove_tree(path: &Path) -> Result<(), EngineError> {
    let ctx = || format!("deleting `{}`", path.display());
    let meta = fs::symlink_metadata(path).map_err(|e| EngineError::io(ctx(), e))?;
    if meta.is_dir() {
        fs::remove_dir_all(path).map_err(|e| EngineError::io(ctx(), e))
    } else {
        fs::remove_file(path).map_err(|e| EngineError::io(ctx(), e))
    }
}

fn remove_tree_quiet(path: &Path) -> Result<(), EngineError> {
    if path_exists(path) {
        remove_tree(path)
    } else {
        Ok(())
    }
}

fn snippet(text: &str) -> String {
    const MAX: usize = 120;
    if text.len() <= MAX {
        text.to_string()
    } else {
        let cut = text
            .char_indices()
            .take_while(|(i, _)| *i < MAX)
            .last()
            .map_or(0, |(i, c)| i + c.len_utf8());
        format!("{}...", &text[..cut])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use kiln_core::Expr;

    fn engine() -> (tempfile::TempDir, Engine) {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::builder()
            .system("test-system")
            .store_dir(dir.path().join("store"))
            .log_dir(dir.path().join("log"))
            .db_path(dir.path().join("kiln.sqlite"))
            .build()
            .unwrap();
        let engine = Engine::open(config).unwrap();
        (dir, engine)
    }

    fn slice_term(id: FsId, path: &Path) -> Term {
        Expr::Slice(kiln_core::Slice {
            roots: vec![id],
            elems: vec![kiln_core::SliceElem {
                path: path.to_path_buf(),
                id,
                refs: vec![],
            }],
        })
        .to_term()
    }

    #[test]
    fn test_write_term_stores_and_registers() {
        let (_dir, engine) = engine();
        let term = slice_term(hash_bytes(b"x"), Path::new("/store/x"));

        let id = engine.write_term(&term, "").unwrap();
        assert_eq!(id, hash_bytes(term.print().as_bytes()));

        let stored = engine.config().store_dir.join(format!("{id}.{TERM_EXT}"));
        assert!(stored.is_file());
        assert_eq!(engine.db().id_for_path(&stored).unwrap(), Some(id));
    }

    #[test]
    fn test_write_term_twice_is_noop() {
        let (_dir, engine) = engine();
        let term = slice_term(hash_bytes(b"x"), Path::new("/store/x"));

        let id1 = engine.write_term(&term, "").unwrap();
        let id2 = engine.write_term(&term, "").unwrap();
        assert_eq!(id1, id2);
    }

    #[test]
    fn test_term_round_trips_through_store() {
        let (_dir, engine) = engine();
        let term = slice_term(hash_bytes(b"y"), Path::new("/store/y"));

        let id = engine.write_term(&term, "-memo").unwrap();
        assert_eq!(engine.term_from_id(id).unwrap(), term);
    }

    #[test]
    fn test_term_from_unknown_id() {
        let (_dir, engine) = engine();
        let missing = hash_bytes(b"nothing stored here");
        assert!(matches!(
            engine.term_from_id(missing).unwrap_err(),
            EngineError::UnknownId { id } if id == missing
        ));
    }

    #[test]
    fn test_expand_id_copies_and_registers() {
        let (dir, engine) = engine();
        let source = dir.path().join("store/content");
        fs::write(&source, b"payload").unwrap();
        let id = hash_path(&source).unwrap();
        engine.register_path(&source, id).unwrap();

        let target = dir.path().join("store/copy");
        engine.expand_id(id, &target).unwrap();

        assert_eq!(fs::read(&target).unwrap(), b"payload");
        assert_eq!(engine.db().id_for_path(&target).unwrap(), Some(id));
    }

    #[test]
    fn test_expand_id_is_idempotent_on_consistent_target() {
        let (dir, engine) = engine();
        let source = dir.path().join("store/content");
        fs::write(&source, b"payload").unwrap();
        let id = hash_path(&source).unwrap();
        engine.register_path(&source, id).unwrap();

        engine.expand_id(id, &source).unwrap();
    }

    #[test]
    fn test_expand_id_rejects_occupied_target() {
        let (dir, engine) = engine();
        let source = dir.path().join("store/content");
        fs::write(&source, b"payload").unwrap();
        let id = hash_path(&source).unwrap();
        engine.register_path(&source, id).unwrap();

        let target = dir.path().join("store/occupied");
        fs::write(&target, b"something else").unwrap();
        assert!(matches!(
            engine.expand_id(id, &target).unwrap_err(),
            EngineError::Obstructed { path } if path == target
        ));
    }

    #[test]
    fn test_expand_id_without_live_source() {
        let (dir, engine) = engine();
        let id = hash_bytes(b"gone");
        assert!(matches!(
            engine.expand_id(id, &dir.path().join("store/out")).unwrap_err(),
            EngineError::UnknownId { .. }
        ));
    }

    #[test]
    fn test_expand_id_copies_directory_trees() {
        let (dir, engine) = engine();
        let source = dir.path().join("store/tree");
        fs::create_dir_all(source.join("sub")).unwrap();
        fs::write(source.join("a"), b"top").unwrap();
        fs::write(source.join("sub/b"), b"nested").unwrap();
        let id = hash_path(&source).unwrap();
        engine.register_path(&source, id).unwrap();

        let target = dir.path().join("store/tree-copy");
        engine.expand_id(id, &target).unwrap();

        assert_eq!(fs::read(target.join("a")).unwrap(), b"top");
        assert_eq!(fs::read(target.join("sub/b")).unwrap(), b"nested");
        assert_eq!(hash_path(&target).unwrap(), id);
    }

    #[test]
    fn test_delete_from_store() {
        let (dir, engine) = engine();
        let path = dir.path().join("store/victim");
        fs::write(&path, b"bytes").unwrap();
        let id = hash_path(&path).unwrap();
        engine.register_path(&path, id).unwrap();

        engine.delete_from_store(&path).unwrap();
        assert!(!path_exists(&path));
        assert_eq!(engine.db().id_for_path(&path).unwrap(), None);
    }

    #[test]
    fn test_hash_path_file_matches_byte_hash() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        fs::write(&file, b"exact bytes").unwrap();
        assert_eq!(hash_path(&file).unwrap(), hash_bytes(b"exact bytes"));
    }

    #[test]
    fn test_hash_path_directory_sensitive_to_names() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        fs::create_dir(&a).unwrap();
        fs::create_dir(&b).unwrap();
        fs::write(a.join("one"), b"content").unwrap();
        fs::write(b.join("two"), b"content").unwrap();

        assert_ne!(hash_path(&a).unwrap(), hash_path(&b).unwrap());

        let a2 = dir.path().join("a2");
        fs::create_dir(&a2).unwrap();
        fs::write(a2.join("one"), b"content").unwrap();
        assert_eq!(hash_path(&a).unwrap(), hash_path(&a2).unwrap());
    }
}
