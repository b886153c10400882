//! Streaming image filesystem.
//!
//! Instead of writing images to a directory, the engine hands every image
//! file to the streamer helper, which multiplexes them over N shard pipes.
//! Our side moves each shard between its pipe and checkpoint storage,
//! compressing on the way.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::protocol::{self, STOP_LISTENER};
use crate::compression::{self, Compression};
use crate::error::{CryoError, CryoResult, StreamerError};
use crate::storage::{ImageFs, Storage};
use crate::sys::{self, ExitWaiter, ProcessExit, TermOnDrop};

pub const CAPTURE_SOCK: &str = "streamer-capture.sock";
pub const SERVE_SOCK: &str = "streamer-serve.sock";
/// Printed on stderr once the control socket accepts connections.
pub const INIT_PROGRESS_MSG: &str = "socket-init";
pub const SHARD_PREFIX: &str = "img-";
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);
const PIPE_SIZE: usize = 4 * 1024 * 1024;

/// The streamer runs in exactly one direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Restore: shards are read from storage and served to the engine.
    Read,
    /// Dump: the engine's images are captured into shards.
    Write,
}

impl Mode {
    fn command(&self) -> &'static str {
        match self {
            Mode::Read => "serve",
            Mode::Write => "capture",
        }
    }

    fn socket(&self) -> &'static str {
        match self {
            Mode::Read => SERVE_SOCK,
            Mode::Write => CAPTURE_SOCK,
        }
    }
}

/// Everything needed to bring up one streaming session.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub binary: PathBuf,
    /// Directory the engine and the helper share for control sockets.
    pub images_dir: PathBuf,
    pub storage: Arc<dyn Storage>,
    /// Where shards live in `storage`.
    pub storage_path: String,
    pub streams: i32,
    pub mode: Mode,
    /// Used for writing; reads infer it from each shard's extension.
    pub compression: Compression,
    pub connection_timeout: Duration,
}

/// File access through the streamer's control socket.
#[derive(Debug)]
pub struct StreamingFs {
    mode: Mode,
    dir: PathBuf,
    conn: Mutex<Option<UnixStream>>,
}

impl StreamingFs {
    /// Starts the helper, begins shard I/O and connects to the control
    /// socket. The returned session must be [`wait`](StreamSession::wait)ed
    /// to flush the shards and collect I/O errors.
    pub async fn start(config: StreamConfig) -> CryoResult<(Arc<StreamingFs>, StreamSession)> {
        if config.streams < 1 {
            return Err(StreamerError::InvalidStreams {
                streams: config.streams,
            }
            .into());
        }
        let streams = config.streams as usize;
        let shards = shard_paths(
            config.storage.as_ref(),
            &config.storage_path,
            config.mode,
            streams,
            config.compression,
        )?;

        let mut io_tasks = Vec::with_capacity(streams);
        let mut helper_ends = Vec::with_capacity(streams);
        for (path, compression) in shards {
            let (read_end, write_end) =
                sys::pipe().map_err(|e| CryoError::io("failed to create shard pipe", e))?;
            sys::set_pipe_size(read_end.as_fd(), PIPE_SIZE);

            match config.mode {
                Mode::Read => {
                    let file = config
                        .storage
                        .open(&path)
                        .map_err(|e| CryoError::io(format!("failed to open shard {}", path), e))?;
                    helper_ends.push(read_end);
                    io_tasks.push(tokio::task::spawn_blocking(move || {
                        compression::read_from(file, File::from(write_end), compression)
                            .map(drop)
                            .map_err(|e| shard_error(&path, e))
                    }));
                }
                Mode::Write => {
                    let file = config
                        .storage
                        .create(&path)
                        .map_err(|e| CryoError::io(format!("failed to create shard {}", path), e))?;
                    helper_ends.push(write_end);
                    io_tasks.push(tokio::task::spawn_blocking(move || {
                        compression::write_to(File::from(read_end), file, compression)
                            .map(drop)
                            .map_err(|e| shard_error(&path, e))
                    }));
                }
            }
        }

        let shard_fds = (0..streams)
            .map(|i| (3 + i).to_string())
            .collect::<Vec<_>>()
            .join(",");
        let mut cmd = Command::new(&config.binary);
        cmd.arg("--images-dir")
            .arg(&config.images_dir)
            .arg("--shard-fds")
            .arg(&shard_fds)
            .arg(config.mode.command())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        let inherited = sys::borrow_all(&helper_ends);
        sys::inherit_fds(&mut cmd, &inherited);

        let mut child = cmd.spawn().map_err(|e| StreamerError::SpawnFailed {
            reason: format!("{}: {}", config.binary.display(), e),
        })?;
        drop(inherited);
        drop(helper_ends);

        let pid = child.id().ok_or_else(|| StreamerError::SpawnFailed {
            reason: "streamer exited before its pid was read".to_string(),
        })? as i32;
        let guard = TermOnDrop::new(pid);
        tracing::debug!(
            pid = pid,
            dir = %config.images_dir.display(),
            mode = config.mode.command(),
            streams = streams,
            "Started streamer"
        );

        let last_message = Arc::new(Mutex::new(String::new()));
        let (ready_tx, ready_rx) = oneshot::channel::<()>();
        let mut tasks = Vec::new();

        if let Some(stderr) = child.stderr.take() {
            let last_message = Arc::clone(&last_message);
            let dir = config.images_dir.clone();
            tasks.push(tokio::spawn(async move {
                let mut ready_tx = Some(ready_tx);
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if line == INIT_PROGRESS_MSG {
                        if let Some(tx) = ready_tx.take() {
                            let _ = tx.send(());
                        }
                    }
                    tracing::trace!(context = "streamer", dir = %dir.display(), "{}", line);
                    *last_message.lock().unwrap_or_else(PoisonError::into_inner) = line;
                }
            }));
        }

        let (notifier, exit) = ExitWaiter::channel();
        {
            let dir = config.images_dir.clone();
            tasks.push(tokio::spawn(async move {
                let status = match child.wait().await {
                    Ok(status) => ProcessExit::from_status(status),
                    Err(e) => {
                        tracing::trace!(error = %e, "Streamer wait failed");
                        ProcessExit::Unknown
                    }
                };
                tracing::debug!(dir = %dir.display(), exit = ?status, "Streamer exited");
                remove_sockets(&dir);
                notifier.notify(status);
            }));
        }

        let mut exited = exit.clone();
        tokio::select! {
            _ = tokio::time::sleep(config.connection_timeout) => {
                return Err(StreamerError::ReadyTimeout {
                    last_message: last(&last_message),
                }
                .into());
            }
            _ = ready_rx => {}
            _ = exited.wait() => {}
        }

        let socket = config.images_dir.join(config.mode.socket());
        let conn = UnixStream::connect(&socket).map_err(|e| StreamerError::ConnectFailed {
            reason: format!("{}: {}: {}", socket.display(), e, last(&last_message)),
        })?;
        tracing::debug!(dir = %config.images_dir.display(), "Streamer connected");

        let fs = Arc::new(StreamingFs {
            mode: config.mode,
            dir: config.images_dir,
            conn: Mutex::new(Some(conn)),
        });
        let session = StreamSession {
            fs: Arc::clone(&fs),
            io: io_tasks,
            pid,
            exit,
            tasks,
            guard,
        };
        Ok((fs, session))
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Asks the streamer for `name` and returns our end of a fresh pipe
    /// carrying its contents.
    fn open_fd(&self, name: &str) -> Result<OwnedFd, StreamerError> {
        let control = |reason: String| StreamerError::Control {
            file: name.to_string(),
            reason,
        };

        let (read_end, write_end) =
            sys::pipe().map_err(|e| control(format!("failed to create pipe: {}", e)))?;
        let (theirs, ours) = match self.mode {
            Mode::Read => (write_end, read_end),
            Mode::Write => (read_end, write_end),
        };

        let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let conn = conn
            .as_mut()
            .ok_or_else(|| control("connection already closed".to_string()))?;

        protocol::write_request(conn, name)
            .map_err(|e| control(format!("failed to send request: {}", e)))?;

        if self.mode == Mode::Read {
            let reply = protocol::read_reply(conn)
                .map_err(|e| control(format!("failed to read reply: {}", e)))?;
            if !reply.exists {
                return Err(StreamerError::FileNotFound {
                    file: name.to_string(),
                });
            }
        }

        // A stream socket needs at least one data byte to carry rights.
        sys::send_with_fds(conn.as_raw_fd(), &[0], &[theirs.as_raw_fd()])
            .map_err(|e| control(format!("failed to send descriptor: {}", e)))?;
        Ok(ours)
    }

    fn stop_listener(&self) -> io::Result<()> {
        let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        match conn.as_mut() {
            Some(conn) => protocol::write_request(conn, STOP_LISTENER),
            None => Ok(()),
        }
    }

    fn close(&self) {
        self.conn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl ImageFs for StreamingFs {
    fn open(&self, name: &str) -> io::Result<Box<dyn Read + Send>> {
        if self.mode != Mode::Read {
            return Err(into_io(StreamerError::WrongMode {
                operation: "reading",
            }));
        }
        let fd = self.open_fd(name).map_err(into_io)?;
        Ok(Box::new(File::from(fd)))
    }

    fn create(&self, name: &str) -> io::Result<Box<dyn Write + Send>> {
        if self.mode != Mode::Write {
            return Err(into_io(StreamerError::WrongMode {
                operation: "writing",
            }));
        }
        let fd = self.open_fd(name).map_err(into_io)?;
        Ok(Box::new(File::from(fd)))
    }

    fn root(&self) -> &Path {
        &self.dir
    }
}

/// Handle on a running streaming session.
#[derive(Debug)]
pub struct StreamSession {
    fs: Arc<StreamingFs>,
    io: Vec<JoinHandle<io::Result<()>>>,
    pid: i32,
    exit: ExitWaiter,
    tasks: Vec<JoinHandle<()>>,
    guard: TermOnDrop,
}

impl StreamSession {
    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Stops the streamer once all shard I/O has drained. Errors from
    /// every shard are reported together.
    pub async fn wait(mut self) -> CryoResult<()> {
        // Order matters: the helper flushes shards only after the listener
        // stops, and must not be signalled before the shards drain.
        if let Err(e) = self.fs.stop_listener() {
            tracing::debug!(error = %e, "Failed to stop streamer listener");
        }
        self.fs.close();

        let mut errors = Vec::new();
        for handle in self.io.drain(..) {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => errors.push(e),
                Err(e) => errors.push(io::Error::other(format!("shard task failed: {}", e))),
            }
        }

        if let Err(e) = sys::terminate(self.pid) {
            tracing::warn!(pid = self.pid, error = %e, "Failed to stop streamer");
        }
        self.exit.wait().await;
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        self.guard.disarm();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(StreamerError::ShardIo { errors }.into())
        }
    }
}

/// Number of streamed shards at `dir`, or 0 if it is not a directory.
/// A missing path also yields 0; the filesystem step reports it.
pub fn is_streamable(storage: &dyn Storage, dir: &str) -> CryoResult<i32> {
    let is_dir = match storage.is_dir(dir) {
        Ok(is_dir) => is_dir,
        Err(e) if e.kind() == io::ErrorKind::NotFound => false,
        Err(e) => {
            return Err(CryoError::io(
                format!("failed to check if {} is a directory", dir),
                e,
            ))
        }
    };
    if !is_dir {
        return Ok(0);
    }
    let names = storage
        .read_dir(dir)
        .map_err(|e| CryoError::io(format!("failed to read {}", dir), e))?;
    Ok(names.iter().filter(|n| is_shard(n)).count() as i32)
}

fn is_shard(name: &str) -> bool {
    Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with(SHARD_PREFIX))
}

/// `img-3.gz` -> 3. Unparseable names sort last.
fn shard_index(name: &str) -> u64 {
    name.strip_prefix(SHARD_PREFIX)
        .and_then(|rest| rest.split('.').next())
        .and_then(|digits| digits.parse().ok())
        .unwrap_or(u64::MAX)
}

/// Storage paths of the shards, with the compression each one uses.
fn shard_paths(
    storage: &dyn Storage,
    dir: &str,
    mode: Mode,
    streams: usize,
    compression: Compression,
) -> CryoResult<Vec<(String, Compression)>> {
    match mode {
        Mode::Read => {
            let mut names: Vec<String> = storage
                .read_dir(dir)
                .map_err(|e| CryoError::io(format!("failed to read {}", dir), e))?
                .into_iter()
                .filter(|n| is_shard(n))
                .collect();
            if names.len() != streams {
                return Err(StreamerError::ShardCountMismatch {
                    expected: streams,
                    found: names.len(),
                }
                .into());
            }
            names.sort_by_key(|n| (shard_index(n), n.clone()));
            names
                .into_iter()
                .map(|name| {
                    let path = format!("{}/{}", dir, name);
                    Compression::from_path(&path).map(|c| (path, c))
                })
                .collect()
        }
        Mode::Write => Ok((0..streams)
            .map(|i| {
                (
                    format!("{}/{}{}{}", dir, SHARD_PREFIX, i, compression.ext()),
                    compression,
                )
            })
            .collect()),
    }
}

fn shard_error(path: &str, e: io::Error) -> io::Error {
    io::Error::new(e.kind(), format!("shard {}: {}", path, e))
}

fn into_io(e: StreamerError) -> io::Error {
    let kind = match &e {
        StreamerError::FileNotFound { .. } => io::ErrorKind::NotFound,
        StreamerError::WrongMode { .. } => io::ErrorKind::Unsupported,
        _ => io::ErrorKind::Other,
    };
    io::Error::new(kind, e)
}

fn last(message: &Mutex<String>) -> String {
    message
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// The helper leaves its control sockets behind.
fn remove_sockets(dir: &Path) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "sock") {
            let _ = std::fs::remove_file(&path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::storage::LocalStorage;
    use tempfile::TempDir;

    fn fake_streamer() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/helpers/fake_streamer.py")
    }

    fn config(images: &TempDir, storage_dir: &TempDir, streams: i32, mode: Mode) -> StreamConfig {
        StreamConfig {
            binary: fake_streamer(),
            images_dir: images.path().to_path_buf(),
            storage: Arc::new(LocalStorage::new()),
            storage_path: storage_dir.path().to_string_lossy().into_owned(),
            streams,
            mode,
            compression: Compression::None,
            connection_timeout: Duration::from_secs(20),
        }
    }

    #[tokio::test]
    async fn test_invalid_stream_count() {
        let (images, storage) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let err = StreamingFs::start(config(&images, &storage, 0, Mode::Write))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid number of streams"));
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
    }

    #[tokio::test]
    async fn test_shard_count_mismatch_fails_before_spawn() {
        let (images, storage) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        for i in 0..3 {
            std::fs::write(storage.path().join(format!("img-{}", i)), b"").unwrap();
        }
        let mut cfg = config(&images, &storage, 4, Mode::Read);
        cfg.binary = PathBuf::from("/nonexistent/streamer");

        let err = StreamingFs::start(cfg).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Streamer error: expected 4 images, got 3. please specify correct number of streams"
        );
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
    }

    #[tokio::test]
    async fn test_helper_exiting_early_fails_to_connect() {
        let (images, storage) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let mut cfg = config(&images, &storage, 1, Mode::Write);
        cfg.binary = PathBuf::from("/bin/false");

        let err = StreamingFs::start(cfg).await.unwrap_err();
        assert!(err.to_string().contains("failed to connect to streamer"));
    }

    #[tokio::test]
    async fn test_capture_then_serve() {
        let storage = TempDir::new().unwrap();

        let images = TempDir::new().unwrap();
        let mut cfg = config(&images, &storage, 2, Mode::Write);
        cfg.compression = Compression::Gzip;
        let (fs, session) = StreamingFs::start(cfg).await.unwrap();
        for (name, body) in [("pages-1.img", b"pages".as_slice()), ("core-1.img", b"core")] {
            let mut file = fs.create(name).unwrap();
            file.write_all(body).unwrap();
        }
        assert!(fs.open("pages-1.img").is_err());
        session.wait().await.unwrap();

        assert!(storage.path().join("img-0.gz").exists());
        assert!(storage.path().join("img-1.gz").exists());
        assert!(!images.path().join(CAPTURE_SOCK).exists());
        let streams = is_streamable(
            &LocalStorage::new(),
            &storage.path().to_string_lossy(),
        )
        .unwrap();
        assert_eq!(streams, 2);

        let images = TempDir::new().unwrap();
        let (fs, session) = StreamingFs::start(config(&images, &storage, 2, Mode::Read))
            .await
            .unwrap();
        let mut body = String::new();
        fs.open("core-1.img")
            .unwrap()
            .read_to_string(&mut body)
            .unwrap();
        assert_eq!(body, "core");
        let err = fs.open("missing.img").err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(fs.create("new.img").is_err());
        session.wait().await.unwrap();
    }

    #[test]
    fn test_shard_order_is_numeric() {
        let storage = TempDir::new().unwrap();
        for name in ["img-10", "img-2", "img-1", "process_state.json"] {
            std::fs::write(storage.path().join(name), b"").unwrap();
        }
        let dir = storage.path().to_string_lossy().into_owned();
        let paths = shard_paths(&LocalStorage::new(), &dir, Mode::Read, 3, Compression::None)
            .unwrap();
        let names: Vec<_> = paths
            .iter()
            .map(|(p, _)| p.rsplit('/').next().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["img-1", "img-2", "img-10"]);
    }

    #[test]
    fn test_write_paths_carry_extension() {
        let paths = shard_paths(
            &LocalStorage::new(),
            "/ckpt/dump-1",
            Mode::Write,
            2,
            Compression::Zstd,
        )
        .unwrap();
        assert_eq!(paths[0].0, "/ckpt/dump-1/img-0.zst");
        assert_eq!(paths[1], ("/ckpt/dump-1/img-1.zst".to_string(), Compression::Zstd));
    }

    #[test]
    fn test_not_a_directory_is_not_streamable() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("ckpt.tar.gz");
        std::fs::write(&file, b"").unwrap();
        assert_eq!(
            is_streamable(&LocalStorage::new(), &file.to_string_lossy()).unwrap(),
            0
        );
    }
}
