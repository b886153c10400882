//! Engine subprocess sessions.
//!
//! Every RPC call runs against a fresh `criu swrk` worker that talks over a
//! SOCK_SEQPACKET pair: one datagram per request, one per response, with
//! descriptors riding along as SCM_RIGHTS.

use std::fmt;
use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use tokio::io::unix::AsyncFd;
use tokio::process::Command;
use tokio_util::task::TaskTracker;

use crate::error::{CriuError, CryoResult};
use crate::sys::{self, ExitWaiter, ProcessExit, TermOnDrop};

/// One message read from the engine.
#[derive(Debug)]
pub struct Received {
    pub data: Vec<u8>,
    pub fds: Vec<OwnedFd>,
}

/// Message channel to a running engine.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, data: &[u8]) -> io::Result<()>;

    /// Reads one message of at most `max_len` bytes. An empty message means
    /// the engine closed its end.
    async fn recv(&mut self, max_len: usize) -> io::Result<Received>;
}

/// Descriptors handed to the engine at spawn time.
#[derive(Debug, Default)]
pub struct EngineFiles {
    pub stdin: Option<OwnedFd>,
    pub stdout: Option<OwnedFd>,
    pub stderr: Option<OwnedFd>,
    /// Inherited as descriptors 3, 4, ... in order.
    pub extra: Vec<OwnedFd>,
}

/// A live engine worker.
pub struct EngineSession {
    pub transport: Box<dyn Transport>,
    pub pid: i32,
    exit: ExitWaiter,
    guard: Option<TermOnDrop>,
}

impl EngineSession {
    pub fn new(transport: Box<dyn Transport>, pid: i32, exit: ExitWaiter) -> Self {
        Self {
            transport,
            pid,
            exit,
            guard: None,
        }
    }

    /// The worker gets SIGTERM if the session is dropped before it finishes.
    pub fn terminate_on_drop(mut self) -> Self {
        self.guard = Some(TermOnDrop::new(self.pid));
        self
    }

    /// Closes the channel and waits for the worker to exit on its own.
    pub async fn finish(self) -> ProcessExit {
        let EngineSession {
            transport,
            mut exit,
            guard,
            ..
        } = self;
        drop(transport);
        let status = exit.wait().await;
        if let Some(mut guard) = guard {
            guard.disarm();
        }
        status
    }
}

impl fmt::Debug for EngineSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineSession")
            .field("pid", &self.pid)
            .field("exit", &self.exit.try_exit())
            .finish()
    }
}

/// Starts engine workers.
#[async_trait]
pub trait EngineLauncher: Send + Sync + fmt::Debug {
    async fn launch(&self, files: EngineFiles) -> CryoResult<EngineSession>;
}

/// Launches `criu swrk <fd>`.
#[derive(Debug, Clone)]
pub struct SwrkLauncher {
    binary: PathBuf,
    tracker: TaskTracker,
}

impl SwrkLauncher {
    pub fn new(binary: impl Into<PathBuf>, tracker: TaskTracker) -> Self {
        Self {
            binary: binary.into(),
            tracker,
        }
    }

    pub fn binary(&self) -> &std::path::Path {
        &self.binary
    }
}

#[async_trait]
impl EngineLauncher for SwrkLauncher {
    async fn launch(&self, files: EngineFiles) -> CryoResult<EngineSession> {
        let (ours, theirs) = socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .map_err(|e| CriuError::SpawnFailed {
            reason: format!("socketpair: {}", e),
        })?;

        // The control socket goes last so the engine finds it after the
        // caller's extra files.
        let mut inherited = sys::borrow_all(&files.extra);
        inherited.push(theirs.as_fd());
        let socket_fd = 3 + files.extra.len();

        let mut cmd = Command::new(&self.binary);
        cmd.arg("swrk").arg(socket_fd.to_string());
        cmd.stdin(files.stdin.map_or_else(Stdio::null, Stdio::from));
        cmd.stdout(files.stdout.map_or_else(Stdio::null, Stdio::from));
        cmd.stderr(files.stderr.map_or_else(Stdio::null, Stdio::from));
        sys::inherit_fds(&mut cmd, &inherited);

        let child = cmd.spawn().map_err(|e| CriuError::SpawnFailed {
            reason: format!("{}: {}", self.binary.display(), e),
        })?;
        drop(inherited);
        drop(theirs);

        let pid = child.id().ok_or_else(|| CriuError::SpawnFailed {
            reason: "worker exited before its pid was read".to_string(),
        })? as i32;
        let exit = sys::watch_child(child, &self.tracker);

        let transport = SeqPacket::new(ours).map_err(|e| CriuError::Transport {
            reason: e.to_string(),
        })?;

        tracing::debug!(criu_pid = pid, binary = %self.binary.display(), "Started CRIU worker");
        Ok(EngineSession::new(Box::new(transport), pid, exit).terminate_on_drop())
    }
}

/// A non-blocking SOCK_SEQPACKET endpoint on the tokio reactor.
pub struct SeqPacket {
    fd: AsyncFd<OwnedFd>,
}

impl SeqPacket {
    pub fn new(fd: OwnedFd) -> io::Result<Self> {
        sys::set_nonblocking(fd.as_fd())?;
        Ok(Self {
            fd: AsyncFd::new(fd)?,
        })
    }
}

#[async_trait]
impl Transport for SeqPacket {
    async fn send(&mut self, data: &[u8]) -> io::Result<()> {
        loop {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| sys::send_with_fds(inner.as_raw_fd(), data, &[])) {
                Ok(Ok(n)) if n == data.len() => return Ok(()),
                Ok(Ok(n)) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        format!("short send: {} of {} bytes", n, data.len()),
                    ))
                }
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
    }

    async fn recv(&mut self, max_len: usize) -> io::Result<Received> {
        let mut buf = vec![0u8; max_len];
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| sys::recv_with_fds(inner.as_raw_fd(), &mut buf)) {
                Ok(result) => {
                    let (n, fds) = result?;
                    buf.truncate(n);
                    return Ok(Received { data: buf, fds });
                }
                Err(_would_block) => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_seqpacket_preserves_message_boundaries() {
        let (left, right) = socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .unwrap();
        let mut left = SeqPacket::new(left).unwrap();
        let mut right = SeqPacket::new(right).unwrap();

        left.send(b"first").await.unwrap();
        left.send(b"second").await.unwrap();

        assert_eq!(right.recv(64).await.unwrap().data, b"first");
        assert_eq!(right.recv(64).await.unwrap().data, b"second");

        drop(left);
        assert!(right.recv(64).await.unwrap().data.is_empty());
    }

    #[tokio::test]
    async fn test_swrk_launcher_missing_binary() {
        let launcher = SwrkLauncher::new("/nonexistent/criu", TaskTracker::new());
        let err = launcher.launch(EngineFiles::default()).await.unwrap_err();
        assert!(err.to_string().contains("/nonexistent/criu"));
    }

    #[tokio::test]
    async fn test_swrk_launcher_passes_socket_after_extra_files() {
        // Exits 0 only when invoked as `swrk 4` with the socket on fd 4.
        let dir = tempfile::TempDir::new().unwrap();
        let script = dir.path().join("fake-criu");
        std::fs::write(
            &script,
            "#!/bin/sh\n[ \"$1\" = swrk ] && [ \"$2\" = 4 ] && exec 4>&-\n",
        )
        .unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let (_r, w) = sys::pipe().unwrap();
        let launcher = SwrkLauncher::new(&script, TaskTracker::new());
        let session = launcher
            .launch(EngineFiles {
                extra: vec![w],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(session.finish().await, ProcessExit::Code(0));
    }
}
