//! RPC client for the CRIU worker protocol.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use prost::Message;
use tokio::sync::OnceCell;
use tokio_util::task::TaskTracker;

use super::notify::{NotifyRegistry, Phase};
use super::rpc::{
    CriuDumpResp, CriuFeatures, CriuOpts, CriuPageServerInfo, CriuReq, CriuReqType, CriuResp,
    CriuRestoreResp,
};
use super::transport::{EngineFiles, EngineLauncher, SwrkLauncher, Transport};
use super::version;
use crate::error::{CriuError, CryoError, CryoResult};

/// Receive buffer for one engine message. A message that fills it is
/// treated as truncated.
pub const RECV_BUF_SIZE: usize = 10 * 4096;

/// Talks to the engine. Each call runs in its own worker process; the
/// engine version is fetched once and cached.
#[derive(Debug)]
pub struct CriuClient {
    launcher: Arc<dyn EngineLauncher>,
    binary: Option<PathBuf>,
    version: OnceCell<i32>,
}

impl CriuClient {
    pub fn new(launcher: Arc<dyn EngineLauncher>) -> Self {
        Self {
            launcher,
            binary: None,
            version: OnceCell::new(),
        }
    }

    /// Client backed by `criu swrk` workers.
    pub fn swrk(binary: impl Into<PathBuf>, tracker: TaskTracker) -> Self {
        let binary = binary.into();
        Self {
            launcher: Arc::new(SwrkLauncher::new(binary.clone(), tracker)),
            binary: Some(binary),
            version: OnceCell::new(),
        }
    }

    pub fn binary(&self) -> Option<&Path> {
        self.binary.as_deref()
    }

    pub async fn dump(
        &self,
        opts: &CriuOpts,
        notify: Option<&NotifyRegistry>,
    ) -> CryoResult<CriuDumpResp> {
        let resp = self
            .call(
                CriuReqType::Dump,
                Some(opts.clone()),
                None,
                notify,
                EngineFiles::default(),
            )
            .await?;
        Ok(resp.dump.unwrap_or_default())
    }

    pub async fn pre_dump(&self, opts: &CriuOpts, notify: Option<&NotifyRegistry>) -> CryoResult<()> {
        self.call(
            CriuReqType::PreDump,
            Some(opts.clone()),
            None,
            notify,
            EngineFiles::default(),
        )
        .await?;
        Ok(())
    }

    /// Restores from the images in `opts`. The engine inherits `files`; the
    /// restored tree inherits the engine's stdio.
    pub async fn restore(
        &self,
        opts: &CriuOpts,
        notify: Option<&NotifyRegistry>,
        files: EngineFiles,
    ) -> CryoResult<CriuRestoreResp> {
        let resp = self
            .call(CriuReqType::Restore, Some(opts.clone()), None, notify, files)
            .await?;
        resp.restore.ok_or_else(|| {
            CriuError::MalformedResponse {
                reason: "restore response without a pid".to_string(),
            }
            .into()
        })
    }

    pub async fn start_page_server(&self, opts: &CriuOpts) -> CryoResult<()> {
        self.call(
            CriuReqType::PageServer,
            Some(opts.clone()),
            None,
            None,
            EngineFiles::default(),
        )
        .await?;
        Ok(())
    }

    /// Starts a detached page server and reports its pid and port.
    pub async fn start_page_server_chld(&self, opts: &CriuOpts) -> CryoResult<CriuPageServerInfo> {
        let resp = self
            .call(
                CriuReqType::PageServerChld,
                Some(opts.clone()),
                None,
                None,
                EngineFiles::default(),
            )
            .await?;
        Ok(resp.ps.unwrap_or_default())
    }

    /// The engine version as a single integer, fetched on first use.
    pub async fn version(&self) -> CryoResult<i32> {
        self.version
            .get_or_try_init(|| async {
                let resp = self
                    .call(CriuReqType::Version, None, None, None, EngineFiles::default())
                    .await?;
                let reply = resp.version.ok_or_else(|| CriuError::MalformedResponse {
                    reason: "version response without a version".to_string(),
                })?;
                let number = version::version_number(&reply);
                tracing::debug!(version = number, gitid = reply.gitid(), "CRIU version");
                Ok::<_, CryoError>(number)
            })
            .await
            .copied()
    }

    pub async fn is_at_least(&self, min: i32) -> CryoResult<bool> {
        Ok(self.version().await? >= min)
    }

    /// Asks the engine which of `wanted` it supports.
    pub async fn feature_check(&self, wanted: CriuFeatures) -> CryoResult<CriuFeatures> {
        let resp = self
            .call(
                CriuReqType::FeatureCheck,
                Some(CriuOpts::default()),
                Some(wanted),
                None,
                EngineFiles::default(),
            )
            .await?;
        Ok(resp.features.unwrap_or_default())
    }

    /// Fails with `MissingFeatures` unless every feature in `wanted` is
    /// supported.
    pub async fn check_features(&self, wanted: CriuFeatures) -> CryoResult<CriuFeatures> {
        let reported = self.feature_check(wanted.clone()).await?;
        let missing = version::missing_features(&wanted, &reported);
        if !missing.is_empty() {
            return Err(CriuError::MissingFeatures { features: missing }.into());
        }
        Ok(reported)
    }

    /// Runs `criu check` with extra flags and returns its combined output.
    pub async fn check(&self, flags: &[&str]) -> CryoResult<String> {
        let binary = self.binary.as_ref().ok_or(CriuError::BinaryNotFound)?;
        let output = tokio::process::Command::new(binary)
            .arg("check")
            .args(flags)
            .output()
            .await
            .map_err(|e| CriuError::SpawnFailed {
                reason: format!("{}: {}", binary.display(), e),
            })?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        if !output.status.success() {
            return Err(CryoError::failed_precondition(format!(
                "criu check failed: {}",
                text.trim()
            )));
        }
        Ok(text)
    }

    async fn call(
        &self,
        req_type: CriuReqType,
        mut opts: Option<CriuOpts>,
        features: Option<CriuFeatures>,
        notify: Option<&NotifyRegistry>,
        files: EngineFiles,
    ) -> CryoResult<CriuResp> {
        let notify = notify.filter(|n| !n.is_empty());
        if notify.is_some() {
            if let Some(opts) = opts.as_mut() {
                opts.notify_scripts = Some(true);
            }
        }
        let log_file = opts.as_ref().map(log_location).unwrap_or_default();
        let shared_opts = Arc::new(opts.clone().unwrap_or_default());
        let req = CriuReq {
            r#type: req_type as i32,
            opts,
            features,
            ..Default::default()
        };

        let started = std::time::Instant::now();
        let mut session = self.launcher.launch(files).await?;

        if let Some(registry) = notify {
            registry.initialize(session.pid).await?;
            match req_type {
                CriuReqType::Dump => registry.initialize_dump(&shared_opts).await?,
                CriuReqType::Restore => registry.initialize_restore(&shared_opts).await?,
                _ => {}
            }
        }

        let mut result = exchange(
            session.transport.as_mut(),
            req,
            notify,
            &shared_opts,
            &log_file,
        )
        .await;

        if let Some(registry) = notify {
            if result.is_err() {
                registry.on_error().await;
            }
            let finalized = match req_type {
                CriuReqType::Dump => registry.finalize_dump(&shared_opts).await,
                CriuReqType::Restore => registry.finalize_restore(&shared_opts).await,
                _ => Ok(()),
            };
            if let Err(e) = finalized {
                result = Err(CryoError::join(result.err(), e));
            }
        }

        match result {
            Ok(resp) => {
                let exit = session.finish().await;
                tracing::debug!(
                    request = req_type.name(),
                    exit = ?exit,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "CRIU call finished"
                );
                Ok(resp)
            }
            // Dropping the session terminates a worker that is still up.
            Err(e) => {
                tracing::debug!(request = req_type.name(), error = %e, "CRIU call failed");
                Err(e)
            }
        }
    }
}

/// Where the engine writes its log for these options.
pub fn log_location(opts: &CriuOpts) -> String {
    let file = opts.log_file();
    if file.is_empty() {
        return String::new();
    }
    match opts.images_dir.as_deref() {
        Some(dir) if !dir.is_empty() => Path::new(dir).join(file).to_string_lossy().into_owned(),
        _ => file.to_string(),
    }
}

/// Drives one request to completion, servicing notifications on the way.
async fn exchange(
    transport: &mut dyn Transport,
    mut req: CriuReq,
    notify: Option<&NotifyRegistry>,
    opts: &Arc<CriuOpts>,
    log_file: &str,
) -> CryoResult<CriuResp> {
    let req_type = req.r#type();
    loop {
        transport
            .send(&req.encode_to_vec())
            .await
            .map_err(|e| CriuError::Transport {
                reason: format!("send {}: {}", req.r#type().name(), e),
            })?;

        let received = transport
            .recv(RECV_BUF_SIZE)
            .await
            .map_err(|e| CriuError::Transport {
                reason: format!("receive: {}", e),
            })?;
        if received.data.is_empty() {
            return Err(CriuError::Transport {
                reason: "engine closed the connection".to_string(),
            }
            .into());
        }
        if received.data.len() >= RECV_BUF_SIZE {
            return Err(CriuError::ResponseTooLarge {
                size: RECV_BUF_SIZE,
            }
            .into());
        }

        let resp = CriuResp::decode(received.data.as_slice()).map_err(|e| {
            CriuError::MalformedResponse {
                reason: e.to_string(),
            }
        })?;

        if !resp.success {
            return Err(CriuError::OperationFailed {
                request: req_type.name(),
                message: resp.cr_errmsg().to_string(),
                errno: resp.cr_errno(),
                log_file: log_file.to_string(),
            }
            .into());
        }

        let resp_type = resp.r#type();
        if resp_type != CriuReqType::Notify {
            if resp_type != req_type {
                return Err(CriuError::UnexpectedResponse {
                    expected: req_type.name(),
                    got: resp_type.name(),
                }
                .into());
            }
            return Ok(resp);
        }

        let registry = notify.ok_or(CriuError::UnexpectedNotify)?;
        let (script, pid) = resp
            .notify
            .as_ref()
            .map(|n| (n.script(), n.pid()))
            .unwrap_or_default();
        match Phase::from_script(script) {
            Some(phase) => {
                tracing::debug!(phase = %phase, pid = pid, "CRIU notify");
                let fd = received.fds.into_iter().next();
                registry.fire(phase, opts, pid, fd).await?;
            }
            None => tracing::trace!(script = script, "Ignoring unknown notify script"),
        }

        req = CriuReq::notify_ack();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::criu::notify::HookBundle;
    use crate::criu::scripted::{self, ScriptedLauncher};
    use crate::error::ErrorCode;
    use std::sync::Mutex;

    fn client(launcher: &Arc<ScriptedLauncher>) -> CriuClient {
        CriuClient::new(Arc::clone(launcher) as Arc<dyn EngineLauncher>)
    }

    #[tokio::test]
    async fn test_dump_services_notifications_in_order() {
        let launcher = Arc::new(ScriptedLauncher::new(|req| match req.r#type() {
            CriuReqType::Dump => vec![
                scripted::notify("pre-dump", 0),
                scripted::notify("network-lock", 0),
                scripted::notify("status-ready", 0),
                scripted::notify("post-dump", 0),
                scripted::success(CriuReqType::Dump),
            ],
            _ => vec![scripted::failure(req.r#type(), 1, "unexpected")],
        }));

        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = NotifyRegistry::new();
        let (pre, post, lock) = (Arc::clone(&log), Arc::clone(&log), Arc::clone(&log));
        registry.register(
            HookBundle::new("recorder")
                .pre_dump(move |_| {
                    let log = Arc::clone(&pre);
                    async move {
                        log.lock().unwrap().push("pre-dump");
                        Ok(())
                    }
                })
                .post_dump(move |_| {
                    let log = Arc::clone(&post);
                    async move {
                        log.lock().unwrap().push("post-dump");
                        Ok(())
                    }
                })
                .network_lock(move || {
                    let log = Arc::clone(&lock);
                    async move {
                        log.lock().unwrap().push("network-lock");
                        Ok(())
                    }
                }),
        );

        let opts = CriuOpts {
            pid: Some(1234),
            ..Default::default()
        };
        client(&launcher).dump(&opts, Some(&registry)).await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["pre-dump", "network-lock", "post-dump"]
        );

        let requests = launcher.requests();
        assert_eq!(requests[0].r#type(), CriuReqType::Dump);
        assert_eq!(requests[0].opts.as_ref().unwrap().notify_scripts, Some(true));
        // One acknowledgement per notification, including unknown ones.
        let acks = requests
            .iter()
            .filter(|r| r.r#type() == CriuReqType::Notify && r.notify_success())
            .count();
        assert_eq!(acks, 4);
    }

    #[tokio::test]
    async fn test_hook_error_aborts_with_hook_error() {
        let launcher = Arc::new(ScriptedLauncher::new(|_| {
            vec![
                scripted::notify("post-restore", 77),
                scripted::success(CriuReqType::Restore),
            ]
        }));
        let registry = NotifyRegistry::new();
        registry.register(
            HookBundle::new("failing")
                .post_restore(|pid| async move { Err(CryoError::internal(format!("gpu restore for {}", pid))) }),
        );

        let err = client(&launcher)
            .restore(&CriuOpts::default(), Some(&registry), EngineFiles::default())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "gpu restore for 77");
        // The failed hook is never acknowledged.
        assert_eq!(launcher.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_engine_failure_reports_errno_and_log() {
        let launcher = Arc::new(ScriptedLauncher::new(|_| {
            vec![scripted::failure(CriuReqType::Dump, 3, "No such process")]
        }));
        let opts = CriuOpts {
            images_dir: Some("/tmp/ckpt".into()),
            log_file: Some("criu-dump.log".into()),
            ..Default::default()
        };
        let err = client(&launcher).dump(&opts, None).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Internal);
        let message = err.to_string();
        assert!(message.contains("No such process"));
        assert!(message.contains("err:3"));
        assert!(message.contains("/tmp/ckpt/criu-dump.log"));
    }

    #[tokio::test]
    async fn test_notify_without_registry_is_an_error() {
        let launcher = Arc::new(ScriptedLauncher::new(|_| {
            vec![scripted::notify("pre-dump", 0)]
        }));
        let err = client(&launcher)
            .dump(&CriuOpts::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CryoError::Criu(CriuError::UnexpectedNotify)));
    }

    #[tokio::test]
    async fn test_on_error_and_finalize_run_after_failure() {
        let launcher = Arc::new(ScriptedLauncher::new(|_| {
            vec![scripted::failure(CriuReqType::Restore, 5, "restore failed")]
        }));
        let log = Arc::new(Mutex::new(Vec::new()));
        let (on_error, finalize) = (Arc::clone(&log), Arc::clone(&log));
        let registry = NotifyRegistry::new();
        registry.register(
            HookBundle::new("lifecycle")
                .on_error(move || {
                    let log = Arc::clone(&on_error);
                    async move {
                        log.lock().unwrap().push("on-error");
                        Ok(())
                    }
                })
                .finalize_restore(move |_| {
                    let log = Arc::clone(&finalize);
                    async move {
                        log.lock().unwrap().push("finalize");
                        Err(CryoError::internal("cleanup failed"))
                    }
                }),
        );

        let err = client(&launcher)
            .restore(&CriuOpts::default(), Some(&registry), EngineFiles::default())
            .await
            .unwrap_err();
        assert_eq!(*log.lock().unwrap(), vec!["on-error", "finalize"]);
        let message = err.to_string();
        assert!(message.contains("restore failed"));
        assert!(message.contains("cleanup failed"));
        assert_eq!(err.code(), ErrorCode::Internal);
    }

    #[tokio::test]
    async fn test_version_is_fetched_once() {
        let launcher = Arc::new(ScriptedLauncher::new(|_| {
            vec![scripted::version(3, 19, Some(1), None)]
        }));
        let client = client(&launcher);
        assert_eq!(client.version().await.unwrap(), 31901);
        assert!(client.is_at_least(31900).await.unwrap());
        assert!(!client.is_at_least(40000).await.unwrap());
        assert_eq!(launcher.launches(), 1);
    }

    #[tokio::test]
    async fn test_missing_mem_track_is_failed_precondition() {
        let launcher = Arc::new(ScriptedLauncher::new(|_| {
            vec![scripted::features(CriuFeatures {
                mem_track: Some(false),
                ..Default::default()
            })]
        }));
        let wanted = CriuFeatures {
            mem_track: Some(true),
            ..Default::default()
        };
        let err = client(&launcher).check_features(wanted).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::FailedPrecondition);
        assert!(err.to_string().contains("CRIU is missing features"));
    }

    #[tokio::test]
    async fn test_mismatched_response_type() {
        let launcher = Arc::new(ScriptedLauncher::new(|_| {
            vec![scripted::success(CriuReqType::Restore)]
        }));
        let err = client(&launcher)
            .pre_dump(&CriuOpts::default(), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("expected PRE_DUMP, got RESTORE"));
    }

    #[test]
    fn test_log_location() {
        let mut opts = CriuOpts::default();
        assert_eq!(log_location(&opts), "");
        opts.log_file = Some("criu-restore.log".into());
        assert_eq!(log_location(&opts), "criu-restore.log");
        opts.images_dir = Some("/var/ckpt".into());
        assert_eq!(log_location(&opts), "/var/ckpt/criu-restore.log");
    }
}
