use std::path::{Path, PathBuf};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use sysinfo::System;
use tracing::{debug, warn};

use crate::error::NbdError;

/// How to locate the running NBD server process to signal.
#[derive(Debug, Clone)]
pub enum ServerLocator {
    PidFile(PathBuf),
    ProcessName(String),
}

/// Sends `signal` to the NBD server so it reloads its configuration file.
/// Locates the process by pid file first, falling back to a process-name
/// scan if the pid file is absent or stale.
pub fn send_reload_signal(locator: &ServerLocator, signal: Signal) -> Result<(), NbdError> {
    let pid = locate_pid(locator)?;
    debug!(pid = pid.as_raw(), ?signal, "sending nbd reload signal");
    signal::kill(pid, signal).map_err(|e| NbdError::Signal(format!("kill({pid}, {signal:?}): {e}")))
}

fn locate_pid(locator: &ServerLocator) -> Result<Pid, NbdError> {
    match locator {
        ServerLocator::PidFile(path) => read_pid_file(path).or_else(|e| {
            warn!(error = %e, "pid file unreadable, falling back to process-name scan");
            scan_for_process("nbd-server")
        }),
        ServerLocator::ProcessName(name) => scan_for_process(name),
    }
}

fn read_pid_file(path: &Path) -> Result<Pid, NbdError> {
    let contents = std::fs::read_to_string(path).map_err(|e| NbdError::ServerNotFound(format!("reading {}: {e}", path.display())))?;
    let raw = contents
        .trim()
        .parse::<i32>()
        .map_err(|e| NbdError::ServerNotFound(format!("pid file {} contains {:?}: {e}", path.display(), contents.trim())))?;
    Ok(Pid::from_raw(raw))
}

fn scan_for_process(name: &str) -> Result<Pid, NbdError> {
    let mut system = System::new_all();
    system.refresh_all();
    system
        .processes_by_exact_name(name.as_ref())
        .next()
        .map(|p| Pid::from_raw(p.pid().as_u32() as i32))
        .ok_or_else(|| NbdError::ServerNotFound(format!("no running process named {name:?}")))
}
