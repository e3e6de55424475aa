//! Pidfile-based start/stop for the coordinator daemon.
//!
//! No process supervisor is assumed to exist (this runs on a bare developer
//! machine as often as in a container), so `start`/`stop` manage liveness
//! themselves: an advisory exclusive lock on a well-known pidfile (via
//! `fs2`) both records the running pid and prevents a second `start` from
//! racing the first.

use directories::ProjectDirs;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::PathBuf;

fn project_dirs() -> anyhow::Result<ProjectDirs> {
    ProjectDirs::from("dev", "coordinator", "coordinator")
        .ok_or_else(|| anyhow::anyhow!("could not determine a data directory for this platform"))
}

/// Where the daemon's pidfile lives, creating the containing directory if
/// needed.
pub fn pidfile_path() -> anyhow::Result<PathBuf> {
    let dirs = project_dirs()?;
    let dir = dirs.data_dir();
    std::fs::create_dir_all(dir)?;
    Ok(dir.join("coordinatord.pid"))
}

/// Acquire the pidfile lock and stamp it with this process's pid. Fails if
/// another process already holds it (the daemon is already running).
pub fn acquire(path: &PathBuf) -> anyhow::Result<File> {
    let file = OpenOptions::new().create(true).read(true).write(true).open(path)?;
    file.try_lock_exclusive().map_err(|_| anyhow::anyhow!("coordinatord is already running ({})", path.display()))?;
    file.set_len(0)?;
    let mut file = file;
    write!(file, "{}", std::process::id())?;
    file.flush()?;
    Ok(file)
}

/// Read the pid recorded in an existing pidfile, if any.
pub fn read_pid(path: &PathBuf) -> anyhow::Result<Option<u32>> {
    if !path.exists() {
        return Ok(None);
    }
    let mut contents = String::new();
    File::open(path)?.read_to_string(&mut contents)?;
    Ok(contents.trim().parse().ok())
}
