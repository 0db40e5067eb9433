//! Starting a run command under a pseudo-terminal with its resource limits.

use crate::error::SessionError;
use crate::limits::ChildLimits;
use crate::workspace::{RunCommand, Workspace};
use nix::errno::Errno;
use nix::fcntl::{fcntl, open, FcntlArg, OFlag};
use nix::pty::{grantpt, posix_openpt, ptsname_r, unlockpt};
use nix::sys::signal::{killpg, Signal};
use nix::sys::stat::Mode;
use nix::unistd::{setsid, Pid};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::process::Stdio;
use tokio::io::unix::AsyncFd;
use tokio::process::{Child, Command};
use tracing::{debug, info};

const FALLBACK_PATH: &str = "/usr/local/bin:/usr/bin:/bin";
const TERMINAL_ROWS: u16 = 24;
const TERMINAL_COLS: u16 = 80;

/// Non-blocking handle on the master side of a pseudo-terminal.
#[derive(Debug)]
pub struct PtyMaster {
    fd: AsyncFd<OwnedFd>,
}

impl PtyMaster {
    fn new(fd: OwnedFd) -> io::Result<Self> {
        let flags = fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL)?;
        let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
        fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags))?;
        Ok(Self {
            fd: AsyncFd::new(fd)?,
        })
    }

    /// Read whatever the terminal has buffered. `Ok(0)` means the slave side
    /// is gone; Linux reports that as EIO, which is folded into end-of-stream.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            let result = guard.try_io(|inner| {
                nix::unistd::read(inner.get_ref().as_raw_fd(), buf).map_err(io::Error::from)
            });
            match result {
                Ok(Err(e)) if e.raw_os_error() == Some(libc::EIO) => return Ok(0),
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    pub async fn write_all(&self, mut data: &[u8]) -> io::Result<()> {
        while !data.is_empty() {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| nix::unistd::write(inner.get_ref(), data).map_err(io::Error::from)) {
                Ok(Ok(n)) => data = &data[n..],
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }
}

impl AsRawFd for PtyMaster {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.get_ref().as_raw_fd()
    }
}

/// A process that has been started and not yet reaped.
#[derive(Debug)]
pub struct Launched {
    pub pid: Pid,
    pub child: Child,
    pub master: PtyMaster,
    /// Whether an address-space ceiling was installed.
    pub memory_capped: bool,
}

/// Allocate a master/slave pair. Both ends are close-on-exec so concurrent
/// launches never leak a terminal into each other's children.
pub fn open_pty() -> io::Result<(OwnedFd, OwnedFd)> {
    let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_CLOEXEC)?;
    grantpt(&master)?;
    unlockpt(&master)?;
    let slave_name = ptsname_r(&master)?;
    let slave = open(
        slave_name.as_str(),
        OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_CLOEXEC,
        Mode::empty(),
    )?;

    // SAFETY: both descriptors were just opened and are owned by nobody else.
    let master = unsafe { OwnedFd::from_raw_fd(master.into_raw_fd()) };
    let slave = unsafe { OwnedFd::from_raw_fd(slave) };

    let size = libc::winsize {
        ws_row: TERMINAL_ROWS,
        ws_col: TERMINAL_COLS,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: TIOCSWINSZ reads a winsize struct that outlives the call.
    if unsafe { libc::ioctl(master.as_raw_fd(), libc::TIOCSWINSZ, &size as *const libc::winsize) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((master, slave))
}

/// Start `command` inside `workspace` with the slave terminal as its
/// controlling tty and `limits` installed before exec. Never waits for the
/// process.
pub fn launch(
    command: &RunCommand,
    workspace: &Workspace,
    limits: ChildLimits,
) -> Result<Launched, SessionError> {
    let memory_capped = limits.address_space.is_some();
    let launch_err = |stage: &str, e: io::Error| SessionError::Launch(format!("{}: {}", stage, e));

    let (master, slave) = open_pty().map_err(|e| launch_err("openpty", e))?;
    let stdin = slave.try_clone().map_err(|e| launch_err("dup", e))?;
    let stdout = slave.try_clone().map_err(|e| launch_err("dup", e))?;

    let path = std::env::var("PATH").unwrap_or_else(|_| FALLBACK_PATH.to_string());
    let mut cmd = Command::new(command.program());
    cmd.args(command.args())
        .current_dir(workspace.path())
        .env_clear()
        .env("PATH", path)
        .env("HOME", workspace.path())
        .env("TERM", "xterm-256color")
        .env("LANG", "C.UTF-8")
        .stdin(Stdio::from(stdin))
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(slave))
        .kill_on_drop(true);

    // SAFETY: runs in the forked child before exec; only async-signal-safe
    // syscalls, no allocation. Stdio is already dup'ed onto 0/1/2 here.
    unsafe {
        cmd.pre_exec(move || {
            setsid()?;
            if libc::ioctl(0, libc::TIOCSCTTY as _, 0) < 0 {
                return Err(io::Error::last_os_error());
            }
            limits.apply()
        });
    }

    let child = cmd
        .spawn()
        .map_err(|e| launch_err(command.program(), e))?;
    // The command still holds our copies of the slave; the relay only sees
    // end-of-stream once every slave descriptor is closed.
    drop(cmd);

    let pid = child
        .id()
        .and_then(|id| i32::try_from(id).ok())
        .map(Pid::from_raw)
        .ok_or_else(|| SessionError::Launch("child exited before its pid was read".to_string()))?;
    let master = PtyMaster::new(master).map_err(|e| launch_err("pty master", e))?;

    info!(pid = pid.as_raw(), program = command.program(), "Process launched");
    Ok(Launched {
        pid,
        child,
        master,
        memory_capped,
    })
}

/// SIGKILL the process group led by `pid`. A group that is already gone is not an error.
pub fn kill_group(pid: Pid) {
    match killpg(pid, Signal::SIGKILL) {
        Ok(()) => debug!(pid = pid.as_raw(), "Sent SIGKILL to process group"),
        Err(Errno::ESRCH) => {}
        Err(e) => debug!(pid = pid.as_raw(), "killpg failed: {}", e),
    }
}
