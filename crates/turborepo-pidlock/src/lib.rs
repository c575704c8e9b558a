#![deny(clippy::all)]

//! Advisory pid-based lock files.
//!
//! A lock is "acquired" when a file exists at the given path containing
//! the pid of the locking process. The cache uses one lock per fingerprint
//! so separate invocations of the tool on the same machine never build the
//! same fingerprint concurrently. Stale files left by dead processes are
//! cleaned up on acquire.

use std::{
    fs,
    io::{self, Read, Write},
    path::PathBuf,
    process,
};

use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum PidlockError {
    /// A lock file exists and could not be classified as stale
    #[error("lock exists at \"{}\", please remove it", .0.display())]
    LockExists(PathBuf),
    /// An operation was attempted in the wrong state, e.g. releasing
    /// before acquiring.
    #[error("invalid state")]
    InvalidState,
    /// The lock is already owned by a running process
    #[error("already owned")]
    AlreadyOwned,
    #[error("pid file error: {0}")]
    File(#[from] PidFileError),
}

#[derive(Debug, Error)]
pub enum PidFileError {
    #[error("Error reading pid file {1}: {0}")]
    IO(io::Error, String),
    #[error("Invalid pid {contents} in file {file}")]
    Invalid { contents: String, file: String },
    #[error("Failed to remove stale pid file {1}: {0}")]
    FailedDelete(io::Error, String),
}

type PidlockResult = Result<(), PidlockError>;

#[derive(Debug, PartialEq)]
enum PidlockState {
    New,
    Acquired,
    Released,
}

/// Check whether a process exists, used to determine whether a pid file is
/// stale.
fn process_exists(pid: i32) -> bool {
    #[cfg(target_os = "windows")]
    unsafe {
        use windows_sys::Win32::{
            Foundation::{CloseHandle, STILL_ACTIVE},
            System::Threading::{GetExitCodeProcess, OpenProcess, PROCESS_QUERY_INFORMATION},
        };
        let handle = OpenProcess(PROCESS_QUERY_INFORMATION, 0, pid as u32);
        let mut code = 0;
        GetExitCodeProcess(handle, &mut code);
        CloseHandle(handle);
        code == STILL_ACTIVE as u32
    }

    #[cfg(not(target_os = "windows"))]
    unsafe {
        // Signal 0 performs error checking without delivering anything,
        // which is the portable liveness probe.
        libc::kill(pid, 0) == 0
    }
}

pub struct Pidlock {
    pid: u32,
    path: PathBuf,
    state: PidlockState,
}

impl Pidlock {
    pub fn new(path: PathBuf) -> Self {
        Pidlock {
            pid: process::id(),
            path,
            state: PidlockState::New,
        }
    }

    /// Acquire the lock, cleaning up a stale file if its recorded pid is
    /// no longer running.
    pub fn acquire(&mut self) -> PidlockResult {
        if self.state != PidlockState::New {
            return Err(PidlockError::InvalidState);
        }

        if self.get_owner()?.is_some() {
            return Err(PidlockError::AlreadyOwned);
        }

        if let Some(p) = self.path.parent() {
            // even if this fails, the create below may still succeed
            fs::create_dir_all(p).ok();
        }

        let mut file = match fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&self.path)
        {
            Ok(file) => file,
            // create_new loses the race when another process just acquired
            Err(_) => return Err(PidlockError::LockExists(self.path.clone())),
        };
        file.write_all(self.pid.to_string().as_bytes())
            .map_err(|e| PidFileError::IO(e, self.path.display().to_string()))?;

        self.state = PidlockState::Acquired;
        Ok(())
    }

    pub fn locked(&self) -> bool {
        self.state == PidlockState::Acquired
    }

    pub fn release(&mut self) -> PidlockResult {
        if self.state != PidlockState::Acquired {
            return Err(PidlockError::InvalidState);
        }

        fs::remove_file(&self.path)
            .map_err(|e| PidFileError::FailedDelete(e, self.path.display().to_string()))?;

        self.state = PidlockState::Released;
        Ok(())
    }

    /// Gets the live owner of this lock file. A missing file or a stale
    /// pid (cleaned up here) both report no owner.
    pub fn get_owner(&self) -> Result<Option<u32>, PidFileError> {
        let mut file = match fs::OpenOptions::new().read(true).open(&self.path) {
            Ok(file) => file,
            Err(io_err) if io_err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(io_err) => {
                return Err(PidFileError::IO(io_err, self.path.display().to_string()));
            }
        };

        let mut contents = String::new();
        if let Err(io_err) = file.read_to_string(&mut contents) {
            warn!("corrupted/invalid pid file at {:?}: {}", self.path, io_err);
            return Err(PidFileError::IO(io_err, self.path.display().to_string()));
        }

        let pid: i32 = contents
            .trim()
            .parse()
            .map_err(|_| PidFileError::Invalid {
                contents: contents.clone(),
                file: self.path.display().to_string(),
            })?;

        if process_exists(pid) {
            return Ok(Some(pid as u32));
        }

        warn!("removing stale pid file at {}", self.path.display());
        fs::remove_file(&self.path)
            .map_err(|e| PidFileError::FailedDelete(e, self.path.display().to_string()))?;
        Ok(None)
    }
}

impl Drop for Pidlock {
    fn drop(&mut self) {
        if self.state == PidlockState::Acquired {
            // best effort, the file is classified as stale if we fail here
            fs::remove_file(&self.path).ok();
        }
    }
}
