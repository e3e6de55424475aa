//! `coordinatord stop` — signal a running daemon to shut down (§6).

use crate::output;
use crate::pidfile;

pub fn run() -> i32 {
    let path = match pidfile::pidfile_path() {
        Ok(path) => path,
        Err(err) => return output::usage_error(err.to_string()),
    };
    let pid = match pidfile::read_pid(&path) {
        Ok(Some(pid)) => pid,
        Ok(None) => return output::usage_error("coordinatord is not running (no pidfile)"),
        Err(err) => return output::usage_error(err.to_string()),
    };

    if !send_term(pid) {
        return output::usage_error(format!("failed to signal pid {pid}"));
    }
    output::ok(format!("sent shutdown signal to pid {pid}"), serde_json::json!({ "pid": pid }))
}

#[cfg(unix)]
fn send_term(pid: u32) -> bool {
    std::process::Command::new("kill")
        .arg("-TERM")
        .arg(pid.to_string())
        .status()
        .is_ok_and(|status| status.success())
}

#[cfg(not(unix))]
fn send_term(_pid: u32) -> bool {
    false
}
