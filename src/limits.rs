//! OS-level ceilings installed in the child between fork and exec.

use crate::config::Limits;
use crate::workspace::Language;
use nix::sys::resource::{setrlimit, Resource};
use nix::unistd::alarm;
use std::io;

/// Largest file the program may write into its workspace.
const FILE_SIZE_BYTES: u64 = 16 * 1024 * 1024;
const OPEN_FILES: u64 = 256;

/// Limits resolved for one run. Plain data so it can be moved into a
/// `pre_exec` closure, where nothing may allocate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildLimits {
    pub alarm_secs: u32,
    pub cpu_secs: u64,
    pub address_space: Option<u64>,
    pub file_size: u64,
    pub open_files: u64,
}

impl ChildLimits {
    pub fn for_run(limits: &Limits, language: Language) -> Self {
        let secs = limits.timeout().as_secs().max(1);
        let alarm_secs = u32::try_from(secs).unwrap_or(u32::MAX);
        Self {
            alarm_secs,
            // Backs up the alarm for a program that blocks SIGALRM.
            cpu_secs: secs.saturating_add(1),
            address_space: language
                .honours_address_space_limit()
                .then(|| limits.memory_bytes()),
            file_size: FILE_SIZE_BYTES,
            open_files: OPEN_FILES,
        }
    }

    /// Install the limits on the calling process. Only call in the child.
    pub fn apply(&self) -> io::Result<()> {
        if let Some(bytes) = self.address_space {
            setrlimit(Resource::RLIMIT_AS, bytes, bytes)?;
        }
        setrlimit(Resource::RLIMIT_CPU, self.cpu_secs, self.cpu_secs)?;
        setrlimit(Resource::RLIMIT_FSIZE, self.file_size, self.file_size)?;
        setrlimit(Resource::RLIMIT_NOFILE, self.open_files, self.open_files)?;
        setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
        // Pending alarms survive execve, SIGALRM's default action terminates.
        alarm::set(self.alarm_secs);
        Ok(())
    }
}
