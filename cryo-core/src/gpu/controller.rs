//! GPU controller sidecars.
//!
//! A controller is a separate process that owns the device state of one
//! job. It is started as `<binary> <jid> --port <port>` and answers
//! [`GpuRequest`]s on that loopback port.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio_util::task::TaskTracker;

use super::rpc::{self, GpuCall, GpuRequest, GpuResponse, HealthCheckResp};
use crate::config::GpuConfig;
use crate::error::{CryoError, CryoResult, GpuError};
use crate::sys::{self, ExitWaiter, TermOnDrop};
use crate::types::JobId;

const CONNECT_RETRY: Duration = Duration::from_millis(50);

/// A live handle on one job's GPU state.
#[async_trait]
pub trait GpuController: Send + Sync + fmt::Debug {
    fn jid(&self) -> &JobId;

    async fn health_check(&self) -> CryoResult<HealthCheckResp>;

    /// Writes device state into `dir`. Returns once it is durable.
    async fn dump(&self, dir: &str, stream: bool) -> CryoResult<()>;

    async fn restore(&self, dir: &str, stream: bool) -> CryoResult<()>;

    /// Stops the controller. Idempotent.
    async fn terminate(&self);

    /// Resolves when the controller process exits, if it is observable.
    fn exited(&self) -> Option<ExitWaiter> {
        None
    }
}

/// Brings up a healthy controller for a job.
#[async_trait]
pub trait ControllerSpawner: Send + Sync + fmt::Debug {
    async fn spawn(&self, jid: &JobId) -> CryoResult<Arc<dyn GpuController>>;
}

#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub health: Duration,
    pub dump: Duration,
    pub restore: Duration,
}

impl From<&GpuConfig> for Timeouts {
    fn from(config: &GpuConfig) -> Self {
        Self {
            health: config.health_timeout,
            dump: config.dump_timeout,
            restore: config.restore_timeout,
        }
    }
}

/// Spawns controller processes from the GPU plugin binary.
#[derive(Debug, Clone)]
pub struct SidecarSpawner {
    binary: PathBuf,
    log_dir: Option<PathBuf>,
    timeouts: Timeouts,
    tracker: TaskTracker,
}

impl SidecarSpawner {
    pub fn new(binary: impl Into<PathBuf>, config: &GpuConfig, tracker: TaskTracker) -> Self {
        Self {
            binary: binary.into(),
            log_dir: config.log_dir.clone(),
            timeouts: Timeouts::from(config),
            tracker,
        }
    }

    fn stdout(&self, jid: &JobId) -> CryoResult<Stdio> {
        let Some(dir) = &self.log_dir else {
            return Ok(Stdio::null());
        };
        let path = dir.join(format!("gpu-controller-{}.log", jid));
        let file = std::fs::File::create(&path)
            .map_err(|e| CryoError::io(format!("failed to create {}", path.display()), e))?;
        Ok(Stdio::from(file))
    }
}

#[async_trait]
impl ControllerSpawner for SidecarSpawner {
    async fn spawn(&self, jid: &JobId) -> CryoResult<Arc<dyn GpuController>> {
        let port = free_port().map_err(|e| GpuError::SpawnFailed {
            reason: format!("no free port: {}", e),
        })?;

        let mut cmd = Command::new(&self.binary);
        cmd.arg(jid.as_str())
            .arg("--port")
            .arg(port.to_string())
            .stdin(Stdio::null())
            .stdout(self.stdout(jid)?)
            .stderr(Stdio::piped());
        sys::inherit_fds(&mut cmd, &[]);

        let mut child = cmd.spawn().map_err(|e| GpuError::SpawnFailed {
            reason: format!("{}: {}", self.binary.display(), e),
        })?;
        let pid = child.id().ok_or_else(|| GpuError::SpawnFailed {
            reason: "controller exited before its pid was read".to_string(),
        })? as i32;
        let guard = TermOnDrop::new(pid);

        let last_message = Arc::new(Mutex::new(String::new()));
        if let Some(stderr) = child.stderr.take() {
            let last_message = Arc::clone(&last_message);
            let jid = jid.clone();
            self.tracker.spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::trace!(context = "gpu", jid = %jid, "{}", line);
                    *last_message.lock().unwrap_or_else(PoisonError::into_inner) = line;
                }
            });
        }
        let exit = sys::watch_child(child, &self.tracker);

        let sidecar = Sidecar {
            jid: jid.clone(),
            pid,
            addr: SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
            timeouts: self.timeouts,
            exit,
            last_message,
            guard: Mutex::new(guard),
        };
        tracing::debug!(jid = %jid, pid = pid, port = port, "Started GPU controller");

        // Dropping the sidecar on failure terminates the process.
        let health = sidecar.wait_healthy().await?;
        tracing::info!(
            jid = %jid,
            pid = pid,
            devices = health.device_count,
            version = %health.version,
            driver = %health.driver_version,
            "GPU controller healthy"
        );
        Ok(Arc::new(sidecar))
    }
}

/// A spawned controller process.
#[derive(Debug)]
pub struct Sidecar {
    jid: JobId,
    pid: i32,
    addr: SocketAddr,
    timeouts: Timeouts,
    exit: ExitWaiter,
    last_message: Arc<Mutex<String>>,
    guard: Mutex<TermOnDrop>,
}

impl Sidecar {
    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Polls the health check until it answers, the timeout passes or the
    /// process exits, whichever comes first.
    async fn wait_healthy(&self) -> CryoResult<HealthCheckResp> {
        let poll = async {
            loop {
                match TcpStream::connect(self.addr).await {
                    Ok(stream) => return self.exchange(stream, &GpuRequest::health_check()).await,
                    Err(_) => tokio::time::sleep(CONNECT_RETRY).await,
                }
            }
        };
        let resp = self
            .bounded(GpuCall::HealthCheck, self.timeouts.health, poll)
            .await?;
        resp.health.ok_or_else(|| {
            GpuError::HealthCheckFailed {
                reason: "response carried no health report".to_string(),
            }
            .into()
        })
    }

    async fn call(&self, req: GpuRequest, timeout: Duration) -> CryoResult<GpuResponse> {
        let call = async {
            let stream = TcpStream::connect(self.addr)
                .await
                .map_err(|e| GpuError::CallFailed {
                    call: req.call().name(),
                    reason: format!("connect: {}", e),
                })?;
            self.exchange(stream, &req).await
        };
        self.bounded(req.call(), timeout, call).await
    }

    async fn exchange(&self, mut stream: TcpStream, req: &GpuRequest) -> CryoResult<GpuResponse> {
        let name = req.call().name();
        let transport = |e: std::io::Error| GpuError::CallFailed {
            call: name,
            reason: e.to_string(),
        };
        rpc::write_frame(&mut stream, req).await.map_err(transport)?;
        let resp: GpuResponse = rpc::read_frame(&mut stream).await.map_err(transport)?;
        if !resp.success {
            return Err(GpuError::CallFailed {
                call: name,
                reason: resp.error,
            }
            .into());
        }
        Ok(resp)
    }

    /// Races `fut` against the timeout and the controller's exit.
    async fn bounded<F>(&self, call: GpuCall, timeout: Duration, fut: F) -> CryoResult<GpuResponse>
    where
        F: std::future::Future<Output = CryoResult<GpuResponse>>,
    {
        let mut exit = self.exit.clone();
        tokio::select! {
            result = fut => result,
            status = exit.wait() => Err(GpuError::ControllerExited {
                detail: format!("{:?}: {}", status, self.last_message()),
            }
            .into()),
            _ = tokio::time::sleep(timeout) => Err(GpuError::Timeout {
                call: call.name(),
                timeout_ms: timeout.as_millis() as u64,
            }
            .into()),
        }
    }

    fn last_message(&self) -> String {
        self.last_message
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl GpuController for Sidecar {
    fn jid(&self) -> &JobId {
        &self.jid
    }

    async fn health_check(&self) -> CryoResult<HealthCheckResp> {
        let resp = self
            .call(GpuRequest::health_check(), self.timeouts.health)
            .await?;
        resp.health.ok_or_else(|| {
            GpuError::HealthCheckFailed {
                reason: "response carried no health report".to_string(),
            }
            .into()
        })
    }

    async fn dump(&self, dir: &str, stream: bool) -> CryoResult<()> {
        self.call(GpuRequest::dump(dir, stream), self.timeouts.dump)
            .await
            .map(drop)
    }

    async fn restore(&self, dir: &str, stream: bool) -> CryoResult<()> {
        self.call(GpuRequest::restore(dir, stream), self.timeouts.restore)
            .await
            .map(drop)
    }

    async fn terminate(&self) {
        if let Err(e) = sys::terminate(self.pid) {
            tracing::warn!(jid = %self.jid, pid = self.pid, error = %e, "Failed to stop GPU controller");
        }
        self.exit.clone().wait().await;
        self.guard
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .disarm();
        tracing::debug!(jid = %self.jid, pid = self.pid, "GPU controller stopped");
    }

    fn exited(&self) -> Option<ExitWaiter> {
        Some(self.exit.clone())
    }
}

/// Asks the kernel for an unused loopback port.
fn free_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    Ok(listener.local_addr()?.port())
}
