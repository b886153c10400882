//! Streaming variants of the image directory steps.

use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::filesystem::{check_dump_dir, create_images_dir, dump_compression, open_images_dir, remove_dir};
use super::{adapter, handler, Adapter, DumpReq, DumpResp, Opts, RestoreReq, RestoreResp};
use crate::compression::Compression;
use crate::error::{CryoError, CryoResult};
use crate::plugins::{CRIU_PLUGIN, STREAMER_PLUGIN};
use crate::storage::ImageFs;
use crate::streamer::{Mode, StreamConfig, StreamingFs};

/// Both the patched engine and the helper must be installed.
fn streamer_binary(opts: &Opts) -> CryoResult<PathBuf> {
    if !opts.plugins.is_installed(CRIU_PLUGIN) {
        return Err(CryoError::failed_precondition(
            "Streaming C/R requires the CRIU plugin to be installed. Default CRIU is not supported yet.",
        ));
    }
    opts.plugins
        .binary(STREAMER_PLUGIN)
        .ok_or_else(|| CryoError::failed_precondition("Please install the streamer plugin to use streaming C/R"))
}

pub fn prepare_streaming_dump() -> Adapter<DumpReq, DumpResp> {
    adapter(|next| {
        handler(move |mut opts, resp: &mut DumpResp, req: &mut DumpReq| {
            let next = next.clone();
            Box::pin(async move {
                let compression = dump_compression(&opts, req)?;
                check_dump_dir(&req.dir)?;
                let binary = streamer_binary(&opts)?;

                let images_dir = Path::new(&req.dir).join(&req.name);
                let images = create_images_dir(&images_dir)?;
                let images_str = images_dir.to_string_lossy().into_owned();

                let started = StreamingFs::start(StreamConfig {
                    binary,
                    images_dir: images_dir.clone(),
                    storage: Arc::clone(&opts.storage),
                    storage_path: images_str.clone(),
                    streams: req.streams,
                    mode: Mode::Write,
                    compression,
                    connection_timeout: opts.config.streamer.connection_timeout,
                })
                .await;
                let (fs, session) = match started {
                    Ok(started) => started,
                    Err(e) => {
                        remove_dir(&images_dir);
                        return Err(e);
                    }
                };
                tracing::debug!(
                    streams = req.streams,
                    pid = session.pid(),
                    compression = %compression,
                    "Streaming dump started"
                );

                req.criu.stream = Some(true);
                req.criu.images_dir_fd = images.as_raw_fd();
                req.criu.images_dir = Some(images_str.clone());
                opts.dump_fs = Some(fs as Arc<dyn ImageFs>);

                let mut result = next(opts, &mut *resp, &mut *req).await;
                drop(images);
                if let Err(e) = session.wait().await {
                    result = Err(CryoError::join(result.err(), e));
                }

                match &result {
                    Ok(_) => {
                        resp.path = images_str.clone();
                        resp.paths.push(images_str);
                    }
                    Err(_) => remove_dir(&images_dir),
                }
                result
            })
        })
    })
}

pub fn prepare_streaming_restore() -> Adapter<RestoreReq, RestoreResp> {
    adapter(|next| {
        handler(move |mut opts, resp: &mut RestoreResp, req: &mut RestoreReq| {
            let next = next.clone();
            Box::pin(async move {
                let is_dir = opts
                    .storage
                    .is_dir(&req.path)
                    .map_err(|_| CryoError::not_found(format!("path error: {}", req.path)))?;
                if !is_dir {
                    return Err(CryoError::invalid_argument(format!(
                        "path must be a directory for streaming restore: {}",
                        req.path
                    )));
                }
                let binary = streamer_binary(&opts)?;

                let images_dir = PathBuf::from(&req.path);
                let (fs, session) = StreamingFs::start(StreamConfig {
                    binary,
                    images_dir: images_dir.clone(),
                    storage: Arc::clone(&opts.storage),
                    storage_path: req.path.clone(),
                    streams: req.streams,
                    mode: Mode::Read,
                    compression: Compression::None,
                    connection_timeout: opts.config.streamer.connection_timeout,
                })
                .await?;
                tracing::debug!(streams = req.streams, pid = session.pid(), "Streaming restore started");

                let images = open_images_dir(&images_dir)?;
                req.criu.stream = Some(true);
                req.criu.images_dir_fd = images.as_raw_fd();
                req.criu.images_dir = Some(req.path.clone());
                opts.dump_fs = Some(fs as Arc<dyn ImageFs>);

                let mut result = next(opts, resp, req).await;
                drop(images);
                if let Err(e) = session.wait().await {
                    result = Err(CryoError::join(result.err(), e));
                }
                result
            })
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::ErrorCode;
    use crate::pipeline::{handler, Handler, Pipeline};
    use crate::plugins::StaticPlugins;
    use tempfile::TempDir;

    fn noop<Req: Send + 'static, Resp: Send + 'static>() -> Handler<Req, Resp> {
        handler(|_opts, _resp, _req| Box::pin(async { Ok(None) }))
    }

    fn opts(plugins: StaticPlugins) -> Opts {
        Opts::new(Arc::new(Config::default()), Arc::new(plugins))
    }

    fn binary(dir: &TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, b"").unwrap();
        path
    }

    #[tokio::test]
    async fn test_streaming_dump_requires_plugins() {
        let dir = TempDir::new().unwrap();
        let pipeline = Pipeline::new().with(prepare_streaming_dump()).build(noop());
        let mut req = DumpReq {
            dir: dir.path().to_string_lossy().into_owned(),
            name: "ckpt".into(),
            streams: 2,
            ..Default::default()
        };

        let err = pipeline(opts(StaticPlugins::default()), &mut DumpResp::default(), &mut req)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::FailedPrecondition);
        assert!(err.to_string().contains("requires the CRIU plugin"));

        let plugins = StaticPlugins::default().with(CRIU_PLUGIN, binary(&dir, "criu"));
        let err = pipeline(opts(plugins), &mut DumpResp::default(), &mut req)
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Please install the streamer plugin to use streaming C/R"
        );
        assert!(!dir.path().join("ckpt").exists());
    }

    #[tokio::test]
    async fn test_streaming_restore_rejects_file() {
        let dir = TempDir::new().unwrap();
        let file = binary(&dir, "ckpt.tar");
        let pipeline = Pipeline::new().with(prepare_streaming_restore()).build(noop());
        let mut req = RestoreReq {
            path: file.to_string_lossy().into_owned(),
            streams: 2,
            ..Default::default()
        };
        let err = pipeline(opts(StaticPlugins::default()), &mut RestoreResp::default(), &mut req)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
    }
}
