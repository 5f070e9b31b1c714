//! Reference scanning.
//!
//! After a build, each output is scanned for the byte form of every input
//! path. A path whose string literally occurs somewhere in the output's
//! content (in any file, for directory outputs) is a reference; the
//! normaliser turns those back into ids when it assembles the slice. The
//! scan is purely textual; there is no interpretation of the bytes.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::EngineError;
use crate::store::sorted_entries;

/// Returns the subset of `candidates` whose string form occurs in the
/// bytes under `path`, preserving candidate order.
///
/// # Errors
///
/// Returns [`EngineError::Io`] if the output cannot be read.
pub fn filter_references(
    path: &Path,
    candidates: &[PathBuf],
) -> Result<Vec<PathBuf>, EngineError> {
    let mut found = vec![false; candidates.len()];
    scan(path, candidates, &mut found)?;
    Ok(candidates
        .iter()
        .zip(found)
        .filter_map(|(candidate, hit)| hit.then(|| candidate.clone()))
        .collect())
}

fn scan(path: &Path, candidates: &[PathBuf], found: &mut [bool]) -> Result<(), EngineError> {
    let meta = fs::symlink_metadata(path)
        .map_err(|e| EngineError::io(format!("scanning `{}`", path.display()), e))?;
    if meta.is_dir() {
        for (_, entry) in sorted_entries(path)? {
            scan(&entry, candidates, found)?;
        }
        return Ok(());
    }
    let content = fs::read(path)
        .map_err(|e| EngineError::io(format!("scanning `{}`", path.display()), e))?;
    for (candidate, hit) in candidates.iter().zip(found.iter_mut()) {
        if !*hit && contains(&content, candidate.to_string_lossy().as_bytes()) {
            *hit = true;
        }
    }
    Ok(())
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() || needle.len() > haystack.len() {
        return false;
    }
    haystack.windows(needle.len()).any(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finds_referenced_path() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        fs::write(&out, b"prefix /store/in1 suffix").unwrap();

        let candidates = vec![PathBuf::from("/store/in1"), PathBuf::from("/store/in2")];
        let refs = filter_references(&out, &candidates).unwrap();
        assert_eq!(refs, vec![PathBuf::from("/store/in1")]);
    }

    #[test]
    fn test_preserves_candidate_order() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        fs::write(&out, b"/store/b then /store/a").unwrap();

        let candidates = vec![PathBuf::from("/store/a"), PathBuf::from("/store/b")];
        let refs = filter_references(&out, &candidates).unwrap();
        assert_eq!(refs, candidates);
    }

    #[test]
    fn test_scans_directory_trees() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        fs::create_dir_all(out.join("nested")).unwrap();
        fs::write(out.join("top"), b"nothing here").unwrap();
        fs::write(out.join("nested/deep"), b"see /store/dep for details").unwrap();

        let candidates = vec![PathBuf::from("/store/dep")];
        let refs = filter_references(&out, &candidates).unwrap();
        assert_eq!(refs, candidates);
    }

    #[test]
    fn test_no_candidates_no_references() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        fs::write(&out, b"/store/whatever").unwrap();
        assert!(filter_references(&out, &[]).unwrap().is_empty());
    }

    #[test]
    fn test_missing_output_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = filter_references(&dir.path().join("absent"), &[]).unwrap_err();
        assert!(matches!(err, EngineError::Io { .. }));
    }
}
