//! Image directory steps.
//!
//! A dump gets a fresh `<dir>/<name>` directory, optionally packed into a
//! tarball afterwards. A restore uses a checkpoint directory in place or
//! unpacks a tarball into a temporary directory. When the checkpoint is
//! streamed, the streaming variants in [`super::streamer`] take over.

use std::fs::{DirBuilder, File};
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use super::defaults::unix_nanos;
use super::streamer::{prepare_streaming_dump, prepare_streaming_restore};
use super::{adapter, handler, wrap, Adapter, DumpAction, DumpReq, DumpResp, Opts};
use super::{RestoreReq, RestoreResp};
use crate::compression::{self, Compression};
use crate::criu::HookBundle;
use crate::error::{CryoError, CryoResult};
use crate::storage::{DirFs, Storage};
use crate::streamer;

/// Picks the streaming or the directory variant for a dump.
pub fn select_dump_fs() -> Adapter<DumpReq, DumpResp> {
    adapter(|next| {
        handler(move |opts, resp: &mut DumpResp, req: &mut DumpReq| {
            let next = next.clone();
            Box::pin(async move {
                let streams = if req.streams > 0 {
                    req.streams
                } else {
                    opts.config.checkpoint.streams
                };
                let next = if streams > 0 {
                    req.streams = streams;
                    wrap(next, &[prepare_streaming_dump()])
                } else {
                    wrap(next, &[prepare_dump_dir()])
                };
                next(opts, resp, req).await
            })
        })
    })
}

/// Picks the streaming or the directory variant for a restore. An explicit
/// shard count wins over detection.
pub fn select_restore_fs() -> Adapter<RestoreReq, RestoreResp> {
    adapter(|next| {
        handler(move |opts, resp: &mut RestoreResp, req: &mut RestoreReq| {
            let next = next.clone();
            Box::pin(async move {
                let streams = if req.streams > 0 {
                    req.streams
                } else {
                    streamer::is_streamable(opts.storage.as_ref(), &req.path)?
                };
                let next = if streams > 0 {
                    req.streams = streams;
                    wrap(next, &[prepare_streaming_restore()])
                } else {
                    wrap(next, &[prepare_restore_dir()])
                };
                next(opts, resp, req).await
            })
        })
    })
}

/// Compression of a dump, from the request or the configuration.
pub(crate) fn dump_compression(opts: &Opts, req: &DumpReq) -> CryoResult<Compression> {
    if !req.compression.is_empty() {
        return Compression::parse_supported(&req.compression);
    }
    let configured = opts.config.checkpoint.compression;
    if !configured.is_available() {
        return Err(CryoError::unimplemented(format!(
            "unsupported compression format '{}'",
            configured
        )));
    }
    Ok(configured)
}

pub(crate) fn check_dump_dir(dir: &str) -> CryoResult<()> {
    if !Path::new(dir).is_dir() {
        return Err(CryoError::invalid_argument(format!(
            "dump dir does not exist: {}",
            dir
        )));
    }
    Ok(())
}

/// Creates the images directory and opens it. The engine reads the
/// directory through our descriptor, so the file must outlive the call.
pub(crate) fn create_images_dir(path: &Path) -> CryoResult<File> {
    DirBuilder::new()
        .mode(0o755)
        .create(path)
        .map_err(|e| CryoError::io(format!("failed to create {}", path.display()), e))?;
    File::open(path).map_err(|e| {
        remove_dir(path);
        CryoError::io(format!("failed to open {}", path.display()), e)
    })
}

pub(crate) fn open_images_dir(path: &Path) -> CryoResult<File> {
    File::open(path).map_err(|e| CryoError::io(format!("failed to open {}", path.display()), e))
}

pub(crate) fn remove_dir(path: &Path) {
    if let Err(e) = std::fs::remove_dir_all(path) {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove directory");
        }
    }
}

/// Packs an images directory into a tarball in storage, once.
#[derive(Debug, Clone)]
struct Archive {
    storage: Arc<dyn Storage>,
    source: PathBuf,
    tarball: String,
    compression: Compression,
    packed: Arc<AtomicBool>,
}

impl Archive {
    async fn pack(&self) -> CryoResult<()> {
        if self.packed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let started = Instant::now();
        let storage = Arc::clone(&self.storage);
        let source = self.source.clone();
        let tarball = self.tarball.clone();
        let compression = self.compression;
        tokio::task::spawn_blocking(move || -> io::Result<()> {
            let file = storage.create(&tarball)?;
            compression::pack_dir(&source, file, compression)
        })
        .await
        .map_err(|e| CryoError::internal(format!("compression task failed: {}", e)))?
        .map_err(|e| CryoError::io(format!("failed to compress {}", self.tarball), e))?;

        self.packed.store(true, Ordering::SeqCst);
        tracing::debug!(
            tarball = %self.tarball,
            compression = %self.compression,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Compressed checkpoint"
        );
        Ok(())
    }

    fn discard(&self) {
        if !self.packed.load(Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.storage.delete(&self.tarball) {
            tracing::warn!(tarball = %self.tarball, error = %e, "Failed to remove partial tarball");
        }
    }
}

/// Sets up a local images directory for a dump and packs it afterwards when
/// a compression is requested.
///
/// If the process is not left running, packing happens in the post-dump
/// hook, so a failure still lets the engine resume the process. Otherwise it
/// happens once the dump returns.
pub fn prepare_dump_dir() -> Adapter<DumpReq, DumpResp> {
    adapter(|next| {
        handler(move |mut opts, resp: &mut DumpResp, req: &mut DumpReq| {
            let next = next.clone();
            Box::pin(async move {
                let compression = dump_compression(&opts, req)?;
                check_dump_dir(&req.dir)?;

                let images_dir = Path::new(&req.dir).join(&req.name);
                let images = create_images_dir(&images_dir)?;
                let images_str = images_dir.to_string_lossy().into_owned();
                req.criu.images_dir_fd = images.as_raw_fd();
                req.criu.images_dir = Some(images_str.clone());
                opts.dump_fs = Some(Arc::new(DirFs::new(&images_dir)));

                let archive = compression.is_archive().then(|| Archive {
                    storage: Arc::clone(&opts.storage),
                    source: images_dir.clone(),
                    tarball: Path::new(&req.dir)
                        .join(format!("{}.tar{}", req.name, compression.ext()))
                        .to_string_lossy()
                        .into_owned(),
                    compression,
                    packed: Arc::new(AtomicBool::new(false)),
                });
                let process_survives =
                    req.criu.leave_running() || req.action == DumpAction::PreDump;
                if let (Some(archive), false) = (&archive, process_survives) {
                    let archive = archive.clone();
                    opts.criu_callback
                        .register(HookBundle::new("compression").post_dump(move |_criu| {
                            let archive = archive.clone();
                            async move { archive.pack().await }
                        }));
                }

                let mut result = next(opts, &mut *resp, &mut *req).await;
                drop(images);

                // Also covers an engine that never reached post-dump.
                if let (Ok(_), Some(archive)) = (&result, &archive) {
                    if let Err(e) = archive.pack().await {
                        result = Err(e);
                    }
                }

                match &result {
                    Ok(_) => {
                        let path = match &archive {
                            Some(archive) => {
                                remove_dir(&images_dir);
                                archive.tarball.clone()
                            }
                            None => images_str,
                        };
                        tracing::info!(path = %path, compression = %compression, "Checkpoint written");
                        resp.path = path.clone();
                        resp.paths.push(path);
                    }
                    Err(_) => {
                        remove_dir(&images_dir);
                        if let Some(archive) = &archive {
                            archive.discard();
                        }
                    }
                }
                result
            })
        })
    })
}

/// Removes a temporary restore directory however the restore ends.
struct TempImages(PathBuf);

impl Drop for TempImages {
    fn drop(&mut self) {
        remove_dir(&self.0);
    }
}

/// Resolves a local checkpoint into an images directory for the engine.
pub fn prepare_restore_dir() -> Adapter<RestoreReq, RestoreResp> {
    adapter(|next| {
        handler(move |mut opts, resp: &mut RestoreResp, req: &mut RestoreReq| {
            let next = next.clone();
            Box::pin(async move {
                let is_dir = opts
                    .storage
                    .is_dir(&req.path)
                    .map_err(|_| CryoError::not_found(format!("path error: {}", req.path)))?;

                let mut temp = None;
                let images_dir = if is_dir {
                    PathBuf::from(&req.path)
                } else {
                    let compression = Compression::from_path(&req.path)?;
                    if !compression.is_archive() {
                        return Err(CryoError::invalid_argument(format!(
                            "{} is neither a directory nor a checkpoint archive",
                            req.path
                        )));
                    }
                    let dir = std::env::temp_dir().join(format!("restore-{}", unix_nanos()));
                    create_images_dir(&dir)?;
                    let guard = TempImages(dir.clone());
                    unpack(&opts, &req.path, &dir, compression).await?;
                    temp = Some(guard);
                    dir
                };

                let images = open_images_dir(&images_dir)?;
                req.criu.images_dir_fd = images.as_raw_fd();
                req.criu.images_dir = Some(images_dir.to_string_lossy().into_owned());
                opts.dump_fs = Some(Arc::new(DirFs::new(&images_dir)));

                let result = next(opts, resp, req).await;
                drop(images);
                drop(temp);
                result
            })
        })
    })
}

async fn unpack(opts: &Opts, tarball: &str, dest: &Path, compression: Compression) -> CryoResult<()> {
    let started = Instant::now();
    let storage = Arc::clone(&opts.storage);
    let src = tarball.to_string();
    let dest_dir = dest.to_path_buf();
    tokio::task::spawn_blocking(move || -> io::Result<()> {
        let file = storage.open(&src)?;
        compression::unpack_dir(file, &dest_dir, compression)
    })
    .await
    .map_err(|e| CryoError::internal(format!("decompression task failed: {}", e)))?
    .map_err(|e| CryoError::io(format!("failed to decompress {}", tarball), e))?;
    tracing::debug!(
        tarball = %tarball,
        dest = %dest.display(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Unpacked checkpoint"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::ErrorCode;
    use crate::pipeline::{Handler, Pipeline};
    use crate::plugins::StaticPlugins;
    use crate::storage::{load_json, save_json};
    use tempfile::TempDir;

    fn opts() -> Opts {
        Opts::new(Arc::new(Config::default()), Arc::new(StaticPlugins::default()))
    }

    /// Writes one image through the image filesystem, the way the engine
    /// fills the directory.
    fn write_image() -> Handler<DumpReq, DumpResp> {
        handler(|opts, _resp: &mut DumpResp, req: &mut DumpReq| {
            Box::pin(async move {
                assert!(req.criu.images_dir_fd >= 0);
                let fs = opts.dump_fs.clone().unwrap();
                save_json(fs.as_ref(), "core-1.img", &vec![1u32, 2, 3]).unwrap();
                Ok(None)
            })
        })
    }

    fn failing() -> Handler<DumpReq, DumpResp> {
        handler(|_opts, _resp, _req| Box::pin(async { Err(CryoError::internal("dump failed")) }))
    }

    fn dump_req(dir: &TempDir, compression: &str) -> DumpReq {
        DumpReq {
            dir: dir.path().to_string_lossy().into_owned(),
            name: "ckpt1".into(),
            compression: compression.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_uncompressed_dump_keeps_directory() {
        let dir = TempDir::new().unwrap();
        let pipeline = Pipeline::new().with(prepare_dump_dir()).build(write_image());
        let mut resp = DumpResp::default();
        pipeline(opts(), &mut resp, &mut dump_req(&dir, "none"))
            .await
            .unwrap();

        let images = dir.path().join("ckpt1");
        assert_eq!(resp.path, images.to_string_lossy());
        assert_eq!(resp.paths, vec![resp.path.clone()]);
        assert!(images.join("core-1.img").exists());
    }

    #[tokio::test]
    async fn test_compressed_dump_then_restore_from_tarball() {
        let dir = TempDir::new().unwrap();
        let pipeline = Pipeline::new().with(prepare_dump_dir()).build(write_image());
        let mut resp = DumpResp::default();
        pipeline(opts(), &mut resp, &mut dump_req(&dir, "zstd"))
            .await
            .unwrap();

        let tarball = dir.path().join("ckpt1.tar.zst");
        assert_eq!(resp.path, tarball.to_string_lossy());
        assert!(!dir.path().join("ckpt1").exists());

        let seen: Arc<std::sync::Mutex<Option<PathBuf>>> = Arc::default();
        let read_back = {
            let seen = Arc::clone(&seen);
            handler(move |opts: Opts, _resp: &mut RestoreResp, req: &mut RestoreReq| {
                let seen = Arc::clone(&seen);
                Box::pin(async move {
                    let fs = opts.dump_fs.clone().unwrap();
                    let image: Vec<u32> = load_json(fs.as_ref(), "core-1.img").unwrap();
                    assert_eq!(image, vec![1, 2, 3]);
                    *seen.lock().unwrap() = req.criu.images_dir.clone().map(PathBuf::from);
                    Ok(None)
                })
            })
        };
        let restore = Pipeline::new().with(prepare_restore_dir()).build(read_back);
        let mut req = RestoreReq {
            path: tarball.to_string_lossy().into_owned(),
            ..Default::default()
        };
        restore(opts(), &mut RestoreResp::default(), &mut req)
            .await
            .unwrap();

        let extracted = seen.lock().unwrap().clone().unwrap();
        assert!(extracted.starts_with(std::env::temp_dir()));
        assert!(!extracted.exists(), "temporary restore directory left behind");
    }

    #[tokio::test]
    async fn test_failed_dump_removes_images_dir() {
        let dir = TempDir::new().unwrap();
        let pipeline = Pipeline::new().with(prepare_dump_dir()).build(failing());
        let err = pipeline(opts(), &mut DumpResp::default(), &mut dump_req(&dir, "gzip"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "dump failed");
        assert!(!dir.path().join("ckpt1").exists());
        assert!(!dir.path().join("ckpt1.tar.gz").exists());
    }

    #[tokio::test]
    async fn test_dump_dir_must_exist() {
        let pipeline = Pipeline::new().with(prepare_dump_dir()).build(write_image());
        let mut req = DumpReq {
            dir: "/nonexistent/checkpoints".into(),
            name: "ckpt1".into(),
            ..Default::default()
        };
        let err = pipeline(opts(), &mut DumpResp::default(), &mut req)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
    }

    #[tokio::test]
    async fn test_unsupported_compression() {
        let dir = TempDir::new().unwrap();
        let pipeline = Pipeline::new().with(prepare_dump_dir()).build(write_image());
        let err = pipeline(opts(), &mut DumpResp::default(), &mut dump_req(&dir, "lz4"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Unimplemented);
        assert!(!dir.path().join("ckpt1").exists());
    }

    #[tokio::test]
    async fn test_restore_missing_path() {
        let pipeline = Pipeline::new()
            .with(select_restore_fs())
            .build(handler(|_opts, _resp: &mut RestoreResp, _req: &mut RestoreReq| {
                Box::pin(async { Ok(None) })
            }));
        let mut req = RestoreReq {
            path: "/nonexistent".into(),
            ..Default::default()
        };
        let err = pipeline(opts(), &mut RestoreResp::default(), &mut req)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
        assert_eq!(err.to_string(), "path error: /nonexistent");
    }
}
