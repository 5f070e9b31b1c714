//! Builder process runner.
//!
//! Runs one builder to completion: a fresh scratch directory as working
//! directory, exactly the declared environment (nothing inherited), stdin
//! closed, stdout and stderr streaming into the shared append-mode build
//! log, `argv[0]` set to the program's basename. The caller blocks until
//! the child exits; the scratch directory is removed on every exit path,
//! including failure, when its guard drops.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info};

use crate::error::EngineError;

/// Name of the shared builder log inside the log directory.
pub const RUN_LOG: &str = "run.log";

/// Disambiguates scratch directories of successive builds in one process.
static BUILD_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Runs `program` with environment `env`, logging to `<log_dir>/run.log`.
///
/// Success means exit status 0. A non-zero exit, death by signal, or a
/// failure to execute the program at all is a build failure.
pub(crate) fn run_builder(
    program: &Path,
    env: &BTreeMap<String, String>,
    log_dir: &Path,
) -> Result<(), EngineError> {
    let log_path = log_dir.join(RUN_LOG);
    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .map_err(|e| EngineError::io(format!("opening build log `{}`", log_path.display()), e))?;

    let serial = BUILD_COUNTER.fetch_add(1, Ordering::Relaxed);
    let scratch = tempfile::Builder::new()
        .prefix(&format!("kiln-{}-{serial}-", std::process::id()))
        .tempdir()
        .map_err(|e| EngineError::io("creating build scratch directory".to_string(), e))?;

    // The builder must be executable regardless of how it entered the
    // store; a chmod failure fails the build, like any failure to exec.
    make_executable(program)?;

    let basename = program
        .file_name()
        .map_or_else(|| program.as_os_str().to_os_string(), std::ffi::OsStr::to_os_string);

    info!(builder = %program.display(), scratch = %scratch.path().display(), "building");
    let log_for_stdout = log
        .try_clone()
        .map_err(|e| EngineError::io(format!("sharing build log `{}`", log_path.display()), e))?;
    let status = Command::new(program)
        .arg0(basename)
        .env_clear()
        .envs(env)
        .current_dir(scratch.path())
        .stdin(Stdio::null())
        .stdout(Stdio::from(log_for_stdout))
        .stderr(Stdio::from(log))
        .status()
        .map_err(|e| {
            EngineError::build(format!("unable to execute `{}`: {e}", program.display()))
        })?;

    if !status.success() {
        return Err(EngineError::build(format!(
            "builder `{}` failed: {status}",
            program.display()
        )));
    }
    debug!(builder = %program.display(), "builder finished");
    Ok(())
}

fn make_executable(program: &Path) -> Result<(), EngineError> {
    let fail = |e: std::io::Error| {
        EngineError::build(format!(
            "cannot make builder `{}` executable: {e}",
            program.display()
        ))
    };
    let mut perms = fs::metadata(program).map_err(fail)?.permissions();
    perms.set_mode(0o755);
    fs::set_permissions(program, perms).map_err(fail)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("log");
        fs::create_dir_all(&log_dir).unwrap();
        (dir, log_dir)
    }

    fn write_builder(dir: &Path, script: &str) -> std::path::PathBuf {
        let path = dir.join("builder.sh");
        fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
        path
    }

    #[test]
    fn test_successful_build_runs_in_scratch_dir() {
        let (dir, log_dir) = fixture();
        let marker = dir.path().join("marker");
        let builder = write_builder(dir.path(), &format!("pwd > {}", marker.display()));

        run_builder(&builder, &BTreeMap::new(), &log_dir).unwrap();

        let scratch = fs::read_to_string(&marker).unwrap();
        let scratch = Path::new(scratch.trim());
        assert!(
            !scratch.exists(),
            "scratch directory should be removed after the build"
        );
    }

    #[test]
    fn test_environment_is_exactly_as_declared() {
        let (dir, log_dir) = fixture();
        let marker = dir.path().join("marker");
        let builder = write_builder(
            dir.path(),
            &format!("printf '%s:%s' \"$GREETING\" \"$HOME\" > {}", marker.display()),
        );

        let mut env = BTreeMap::new();
        env.insert("GREETING".to_string(), "hello".to_string());
        run_builder(&builder, &env, &log_dir).unwrap();

        // HOME is not inherited from the parent.
        assert_eq!(fs::read_to_string(&marker).unwrap(), "hello:");
    }

    #[test]
    fn test_output_streams_into_shared_log() {
        let (dir, log_dir) = fixture();
        let builder = write_builder(dir.path(), "echo to-stdout\necho to-stderr >&2");

        run_builder(&builder, &BTreeMap::new(), &log_dir).unwrap();

        let log = fs::read_to_string(log_dir.join(RUN_LOG)).unwrap();
        assert!(log.contains("to-stdout"));
        assert!(log.contains("to-stderr"));
    }

    #[test]
    fn test_nonzero_exit_is_build_failure() {
        let (dir, log_dir) = fixture();
        let builder = write_builder(dir.path(), "exit 3");

        let err = run_builder(&builder, &BTreeMap::new(), &log_dir).unwrap_err();
        assert!(matches!(err, EngineError::Build { message } if message.contains("failed")));
    }

    #[test]
    fn test_missing_program_is_build_failure() {
        let (dir, log_dir) = fixture();
        let err = run_builder(&dir.path().join("absent"), &BTreeMap::new(), &log_dir).unwrap_err();
        assert!(matches!(err, EngineError::Build { .. }));
    }

    #[test]
    fn test_builder_is_made_executable() {
        let (dir, log_dir) = fixture();
        let marker = dir.path().join("marker");
        let builder = write_builder(dir.path(), &format!("echo ran > {}", marker.display()));
        // Written mode 0644; the runner must flip the execute bits itself.
        run_builder(&builder, &BTreeMap::new(), &log_dir).unwrap();
        assert!(marker.exists());
    }
}
