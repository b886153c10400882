//! Process and descriptor plumbing shared by the engine client, the streamer
//! and the GPU sidecar.
//!
//! Children are always asked to stop with SIGTERM and are given a parent
//! death signal of SIGTERM, so an orphaned daemon takes its helpers down.

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::Pid;
use tokio::io::unix::AsyncFd;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio_util::task::TaskTracker;

/// How a watched process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    Code(i32),
    Signal(i32),
    /// The process was not our child, so its status is not observable.
    Unknown,
}

impl ProcessExit {
    pub fn from_status(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;

        match (status.code(), status.signal()) {
            (Some(code), _) => ProcessExit::Code(code),
            (None, Some(signal)) => ProcessExit::Signal(signal),
            (None, None) => ProcessExit::Unknown,
        }
    }
}

/// Sending half of an exit notification.
#[derive(Debug)]
pub struct ExitNotifier(watch::Sender<Option<ProcessExit>>);

impl ExitNotifier {
    pub fn notify(self, exit: ProcessExit) {
        self.0.send_replace(Some(exit));
    }
}

/// Resolves once the process backing an operation exits.
#[derive(Debug, Clone)]
pub struct ExitWaiter(watch::Receiver<Option<ProcessExit>>);

impl ExitWaiter {
    pub fn channel() -> (ExitNotifier, ExitWaiter) {
        let (tx, rx) = watch::channel(None);
        (ExitNotifier(tx), ExitWaiter(rx))
    }

    /// A waiter for a process that is already gone.
    pub fn exited(exit: ProcessExit) -> Self {
        let (_tx, rx) = watch::channel(Some(exit));
        ExitWaiter(rx)
    }

    pub async fn wait(&mut self) -> ProcessExit {
        match self.0.wait_for(Option::is_some).await {
            Ok(exit) => (*exit).unwrap_or(ProcessExit::Unknown),
            // Notifier dropped without reporting.
            Err(_) => ProcessExit::Unknown,
        }
    }

    pub fn try_exit(&self) -> Option<ProcessExit> {
        *self.0.borrow()
    }
}

/// A pidfd registered with the tokio reactor; readable once the process
/// exits.
pub struct PidFd(AsyncFd<OwnedFd>);

impl PidFd {
    pub fn open(pid: i32) -> io::Result<Self> {
        let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid, libc::PIDFD_NONBLOCK) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd as RawFd) };
        Ok(Self(AsyncFd::new(fd)?))
    }

    pub async fn exited(&self) -> io::Result<()> {
        let _guard = self.0.readable().await?;
        Ok(())
    }
}

impl AsRawFd for PidFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

/// Watches a process that is not our child (e.g. restored by the engine).
pub fn watch_pid(pid: i32, tracker: &TaskTracker) -> io::Result<ExitWaiter> {
    let pidfd = PidFd::open(pid)?;
    let (notifier, waiter) = ExitWaiter::channel();
    tracker.spawn(async move {
        if let Err(e) = pidfd.exited().await {
            tracing::warn!(pid = pid, error = %e, "Failed waiting on process exit");
        }
        // Reap in case it was ours after all.
        reap_zombie(pid);
        tracing::debug!(pid = pid, "Process exited");
        notifier.notify(ProcessExit::Unknown);
    });
    Ok(waiter)
}

/// Watches one of our children and reports its exit status.
pub fn watch_child(mut child: Child, tracker: &TaskTracker) -> ExitWaiter {
    let pid = child.id();
    let (notifier, waiter) = ExitWaiter::channel();
    tracker.spawn(async move {
        let exit = match child.wait().await {
            Ok(status) => ProcessExit::from_status(status),
            Err(e) => {
                tracing::warn!(pid = ?pid, error = %e, "Failed waiting on child");
                ProcessExit::Unknown
            }
        };
        tracing::debug!(pid = ?pid, exit = ?exit, "Child exited");
        notifier.notify(exit);
    });
    waiter
}

/// Sends SIGTERM. A process that is already gone is not an error.
pub fn terminate(pid: i32) -> io::Result<()> {
    send_signal(pid, Signal::SIGTERM)
}

pub fn send_signal(pid: i32, signal: Signal) -> io::Result<()> {
    match kill(Pid::from_raw(pid), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(io::Error::from(e)),
    }
}

/// Collects the exit status of a dead child so it does not linger as a
/// zombie. Returns whether something was reaped.
pub fn reap_zombie(pid: i32) -> bool {
    match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
        Ok(nix::sys::wait::WaitStatus::StillAlive) => false,
        Ok(_) => true,
        Err(_) => false,
    }
}

/// Whether a process with this PID exists.
pub fn process_exists(pid: i32) -> bool {
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// A close-on-exec pipe, returned as (read end, write end).
pub fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    Ok(nix::unistd::pipe2(OFlag::O_CLOEXEC)?)
}

/// Best-effort pipe buffer resize.
pub fn set_pipe_size(fd: BorrowedFd<'_>, size: usize) {
    if let Err(e) = fcntl(fd.as_raw_fd(), FcntlArg::F_SETPIPE_SZ(size as libc::c_int)) {
        tracing::trace!(fd = fd.as_raw_fd(), error = %e, "Could not resize pipe");
    }
}

pub fn set_nonblocking(fd: BorrowedFd<'_>) -> io::Result<()> {
    let flags = fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL)?;
    let flags = OFlag::from_bits_retain(flags) | OFlag::O_NONBLOCK;
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags))?;
    Ok(())
}

/// Arranges for `fds` to appear as descriptors 3, 4, ... in the child and
/// sets SIGTERM as the parent death signal. The descriptors must stay open
/// until the command is spawned.
pub fn inherit_fds(cmd: &mut Command, fds: &[BorrowedFd<'_>]) {
    let sources: Vec<RawFd> = fds.iter().map(|fd| fd.as_raw_fd()).collect();
    let mut staged: Vec<RawFd> = vec![-1; sources.len()];

    // SAFETY: the closure only calls async-signal-safe libc functions and
    // touches memory allocated before fork.
    unsafe {
        cmd.pre_exec(move || {
            if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) < 0 {
                return Err(io::Error::last_os_error());
            }

            // Move everything above the target range first so a source
            // that already sits on a target number is not clobbered.
            let floor = 3 + sources.len() as libc::c_int;
            for (slot, fd) in staged.iter_mut().zip(sources.iter()) {
                let dup = libc::fcntl(*fd, libc::F_DUPFD_CLOEXEC, floor);
                if dup < 0 {
                    return Err(io::Error::last_os_error());
                }
                *slot = dup;
            }
            for (index, fd) in staged.iter().enumerate() {
                // dup2 clears FD_CLOEXEC on the target.
                if libc::dup2(*fd, 3 + index as libc::c_int) < 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            Ok(())
        });
    }
}

/// Sends SIGTERM to a process when dropped, unless disarmed.
#[derive(Debug)]
pub struct TermOnDrop {
    pid: Option<i32>,
}

impl TermOnDrop {
    pub fn new(pid: i32) -> Self {
        Self { pid: Some(pid) }
    }

    pub fn disarm(&mut self) {
        self.pid = None;
    }
}

impl Drop for TermOnDrop {
    fn drop(&mut self) {
        if let Some(pid) = self.pid.take() {
            tracing::debug!(pid = pid, "Terminating abandoned child");
            if let Err(e) = terminate(pid) {
                tracing::warn!(pid = pid, error = %e, "Failed to terminate child");
            }
        }
    }
}

/// Borrow helper for lists of owned descriptors.
pub fn borrow_all(fds: &[OwnedFd]) -> Vec<BorrowedFd<'_>> {
    fds.iter().map(AsFd::as_fd).collect()
}

const MAX_RECV_FDS: usize = 16;

/// Sends one message with `fds` attached as SCM_RIGHTS.
pub fn send_with_fds(socket: RawFd, data: &[u8], fds: &[RawFd]) -> io::Result<usize> {
    use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags, UnixAddr};

    let iov = [io::IoSlice::new(data)];
    let cmsgs: Vec<ControlMessage<'_>> = if fds.is_empty() {
        Vec::new()
    } else {
        vec![ControlMessage::ScmRights(fds)]
    };
    Ok(sendmsg::<UnixAddr>(
        socket,
        &iov,
        &cmsgs,
        MsgFlags::MSG_NOSIGNAL,
        None,
    )?)
}

/// Receives one message and any descriptors passed with it. Received
/// descriptors are close-on-exec.
pub fn recv_with_fds(socket: RawFd, buf: &mut [u8]) -> io::Result<(usize, Vec<OwnedFd>)> {
    use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags};

    let mut control = nix::cmsg_space!([RawFd; MAX_RECV_FDS]);
    let mut iov = [io::IoSliceMut::new(buf)];
    let msg = recvmsg::<()>(
        socket,
        &mut iov,
        Some(&mut control),
        MsgFlags::MSG_CMSG_CLOEXEC,
    )?;

    let mut fds = Vec::new();
    for cmsg in msg.cmsgs()? {
        if let ControlMessageOwned::ScmRights(received) = cmsg {
            // SAFETY: SCM_RIGHTS installs fresh descriptors that nothing else owns.
            fds.extend(received.into_iter().map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }));
        }
    }

    if msg.flags.contains(MsgFlags::MSG_CTRUNC) {
        tracing::warn!(received = fds.len(), "Ancillary data truncated");
    }
    Ok((msg.bytes, fds))
}
