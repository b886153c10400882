//! Splices GPU controller calls into the engine's notify phases.
//!
//! Dumps block in pre-dump until device state is on disk. Restores start
//! the device restore in pre-restore and run it alongside the engine; the
//! restored process is not allowed to resume until it finishes.

use std::sync::Arc;
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{oneshot, Mutex};
use tokio_util::task::TaskTracker;

use super::controller::{ControllerSpawner, GpuController};
use crate::criu::HookBundle;
use crate::error::{CryoError, CryoResult, GpuError};
use crate::types::JobId;

/// Mount roots of NVIDIA driver files that stay outside the checkpoint.
const NVIDIA_MOUNT_ROOTS: &[&str] = &[
    "/driver/nvidia/gpus",
    "/nvidia",
    "/usr/bin/nvidia",
    "/usr/lib/firmware/nvidia",
    "/usr/lib/libcuda",
    "/usr/lib64/libcuda",
    "/usr/lib/libnvidia",
    "/usr/lib64/libnvidia",
    "/usr/lib/x86_64-linux-gnu/libnvidia",
    "/usr/lib64/x86_64-linux-gnu/libnvidia",
];

enum Slot {
    /// Spawn in flight. Counts as attached for exclusivity.
    Attaching,
    Attached(Arc<dyn GpuController>),
}

/// Owns at most one controller per job.
pub struct GpuCoordinator {
    spawner: Arc<dyn ControllerSpawner>,
    controllers: Arc<DashMap<JobId, Slot>>,
    tracker: TaskTracker,
}

impl GpuCoordinator {
    pub fn new(spawner: Arc<dyn ControllerSpawner>, tracker: TaskTracker) -> Self {
        Self {
            spawner,
            controllers: Arc::new(DashMap::new()),
            tracker,
        }
    }

    /// Spawns a controller for `jid` and waits until it is healthy.
    pub async fn attach(&self, jid: &JobId) -> CryoResult<Arc<dyn GpuController>> {
        match self.controllers.entry(jid.clone()) {
            Entry::Occupied(_) => {
                return Err(GpuError::AlreadyAttached { jid: jid.clone() }.into());
            }
            Entry::Vacant(entry) => {
                entry.insert(Slot::Attaching);
            }
        }

        let started = Instant::now();
        let controller = match self.spawner.spawn(jid).await {
            Ok(controller) => controller,
            Err(e) => {
                self.controllers.remove(jid);
                return Err(e);
            }
        };

        // A detach while spawning removes the slot; honour it.
        let attached = match self.controllers.get_mut(jid) {
            Some(mut slot) => {
                *slot = Slot::Attached(Arc::clone(&controller));
                true
            }
            None => false,
        };
        if !attached {
            controller.terminate().await;
            return Err(GpuError::NotAttached { jid: jid.clone() }.into());
        }

        self.forget_on_exit(jid, &controller);
        tracing::info!(
            jid = %jid,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Attached GPU controller"
        );
        Ok(controller)
    }

    /// Drops the slot of `jid` once its controller process dies, unless it
    /// was detached or replaced first.
    fn forget_on_exit(&self, jid: &JobId, controller: &Arc<dyn GpuController>) {
        let Some(mut exit) = controller.exited() else {
            return;
        };
        let controllers = Arc::clone(&self.controllers);
        let watched = Arc::clone(controller);
        let jid = jid.clone();
        self.tracker.spawn(async move {
            let status = exit.wait().await;
            let removed = controllers.remove_if(&jid, |_, slot| {
                matches!(slot, Slot::Attached(current) if Arc::ptr_eq(current, &watched))
            });
            if removed.is_some() {
                tracing::warn!(jid = %jid, status = ?status, "GPU controller exited; dropped");
            }
        });
    }

    /// Stops and forgets the controller of `jid`.
    pub async fn detach(&self, jid: &JobId) -> CryoResult<()> {
        match self.controllers.remove(jid) {
            Some((_, Slot::Attached(controller))) => {
                controller.terminate().await;
                tracing::debug!(jid = %jid, "Detached GPU controller");
                Ok(())
            }
            Some((_, Slot::Attaching)) => Ok(()),
            None => Err(GpuError::NotAttached { jid: jid.clone() }.into()),
        }
    }

    pub fn controller(&self, jid: &JobId) -> CryoResult<Arc<dyn GpuController>> {
        match self.controllers.get(jid).as_deref() {
            Some(Slot::Attached(controller)) => Ok(Arc::clone(controller)),
            _ => Err(GpuError::NotAttached { jid: jid.clone() }.into()),
        }
    }

    pub fn is_attached(&self, jid: &JobId) -> bool {
        self.controllers.contains_key(jid)
    }

    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }

    /// Stops every controller.
    pub async fn detach_all(&self) {
        let jids: Vec<JobId> = self.controllers.iter().map(|e| e.key().clone()).collect();
        for jid in jids {
            if let Err(e) = self.detach(&jid).await {
                tracing::debug!(jid = %jid, error = %e, "GPU detach skipped");
            }
        }
    }

    /// Hooks for dumping the device state of `jid`.
    pub fn dump_hooks(self: &Arc<Self>, jid: JobId) -> HookBundle {
        let this = Arc::clone(self);
        HookBundle::new("gpu").pre_dump(move |opts| {
            let this = Arc::clone(&this);
            let jid = jid.clone();
            async move {
                let controller = this.controller(&jid)?;
                let started = Instant::now();
                tracing::debug!(jid = %jid, "GPU dump starting");
                controller
                    .dump(opts.images_dir(), opts.stream())
                    .await
                    .map_err(|e| wrap("failed to dump GPU", e))?;
                tracing::info!(
                    jid = %jid,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "GPU dump complete"
                );
                Ok(())
            }
        })
    }

    /// Hooks for restoring the device state of `jid` alongside the engine.
    pub fn restore_hooks(self: &Arc<Self>, jid: JobId) -> HookBundle {
        let gate = Arc::new(RestoreGate::new(jid.clone()));

        let pre_restore = {
            let this = Arc::clone(self);
            let gate = Arc::clone(&gate);
            let jid = jid.clone();
            move |opts: Arc<crate::criu::rpc::CriuOpts>| {
                let this = Arc::clone(&this);
                let gate = Arc::clone(&gate);
                let jid = jid.clone();
                async move {
                    let controller = this.attach(&jid).await?;
                    let (tx, rx) = oneshot::channel();
                    gate.start(rx).await;
                    this.tracker.spawn(async move {
                        let started = Instant::now();
                        tracing::debug!(jid = %jid, "GPU restore starting");
                        let result = controller
                            .restore(opts.images_dir(), opts.stream())
                            .await
                            .map_err(|e| wrap("failed to restore GPU", e));
                        match &result {
                            Ok(()) => tracing::info!(
                                jid = %jid,
                                elapsed_ms = started.elapsed().as_millis() as u64,
                                "GPU restore complete"
                            ),
                            Err(e) => tracing::error!(jid = %jid, error = %e, "GPU restore failed"),
                        }
                        let _ = tx.send(result);
                    });
                    Ok(())
                }
            }
        };

        let post_restore = {
            let gate = Arc::clone(&gate);
            move |_pid: i32| {
                let gate = Arc::clone(&gate);
                async move { gate.wait().await }
            }
        };

        let pre_resume = {
            let gate = Arc::clone(&gate);
            move |_pid: i32| {
                let gate = Arc::clone(&gate);
                async move { gate.wait().await }
            }
        };

        let on_error = {
            let this = Arc::clone(self);
            move || {
                let this = Arc::clone(&this);
                let jid = jid.clone();
                async move {
                    if let Err(e) = this.detach(&jid).await {
                        tracing::debug!(jid = %jid, error = %e, "No GPU controller to detach");
                    }
                    Ok(())
                }
            }
        };

        HookBundle::new("gpu")
            .pre_restore(pre_restore)
            .post_restore(post_restore)
            .pre_resume(pre_resume)
            .on_error(on_error)
    }
}

impl std::fmt::Debug for GpuCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuCoordinator")
            .field("spawner", &self.spawner)
            .field("controllers", &self.controllers.len())
            .finish()
    }
}

/// Rejects dumps that would leave a GPU process running.
pub fn check_leave_running(gpu_enabled: bool, leave_running: bool) -> Result<(), GpuError> {
    if gpu_enabled && leave_running {
        return Err(GpuError::LeaveRunningUnsupported);
    }
    Ok(())
}

/// Whether a mount with this root holds NVIDIA driver files.
pub fn is_nvidia_mount(root: &str) -> bool {
    if let Some(rest) = root.strip_prefix("/dev/nvidia") {
        if rest.starts_with(|c: char| c.is_ascii_digit()) {
            return true;
        }
    }
    NVIDIA_MOUNT_ROOTS.iter().any(|prefix| root.starts_with(prefix))
}

/// Engine `external` entry for a mount point left out of the images.
pub fn external_mount(mount_point: &str) -> String {
    format!("mnt[{}]:{}", mount_point, mount_point)
}

fn wrap(context: &str, e: CryoError) -> CryoError {
    match e {
        CryoError::Gpu(GpuError::NotAttached { .. }) => e,
        other => CryoError::internal(format!("{}: {}", context, other)),
    }
}

enum GateState {
    Idle,
    Pending(oneshot::Receiver<CryoResult<()>>),
    /// Result already delivered; the error text is kept for later waiters.
    Done(Option<String>),
}

/// Single-use rendezvous between the async restore and the hooks that
/// must not let the process resume before it finishes.
struct RestoreGate {
    jid: JobId,
    state: Mutex<GateState>,
}

impl RestoreGate {
    fn new(jid: JobId) -> Self {
        Self {
            jid,
            state: Mutex::new(GateState::Idle),
        }
    }

    async fn start(&self, rx: oneshot::Receiver<CryoResult<()>>) {
        *self.state.lock().await = GateState::Pending(rx);
    }

    async fn wait(&self) -> CryoResult<()> {
        let mut state = self.state.lock().await;
        match std::mem::replace(&mut *state, GateState::Idle) {
            GateState::Idle => Err(GpuError::RestoreNotStarted {
                jid: self.jid.clone(),
            }
            .into()),
            GateState::Pending(rx) => {
                let result = rx.await.unwrap_or_else(|_| {
                    Err(GpuError::CallFailed {
                        call: "restore",
                        reason: "restore task ended without a result".to_string(),
                    }
                    .into())
                });
                *state = GateState::Done(result.as_ref().err().map(ToString::to_string));
                result
            }
            GateState::Done(error) => {
                *state = GateState::Done(error.clone());
                match error {
                    None => Ok(()),
                    Some(reason) => Err(CryoError::internal(reason)),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::criu::rpc::CriuOpts;
    use crate::criu::{NotifyRegistry, Phase};
    use crate::error::ErrorCode;
    use crate::gpu::rpc::HealthCheckResp;
    use crate::sys::{ExitNotifier, ExitWaiter, ProcessExit};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct FakeController {
        jid: Option<JobId>,
        work: Duration,
        fail_restore: bool,
        dumped: AtomicBool,
        restored: AtomicBool,
        terminated: AtomicBool,
        exit: Option<ExitWaiter>,
    }

    #[async_trait]
    impl GpuController for FakeController {
        fn jid(&self) -> &JobId {
            self.jid.as_ref().unwrap()
        }

        async fn health_check(&self) -> CryoResult<HealthCheckResp> {
            Ok(HealthCheckResp::default())
        }

        async fn dump(&self, _dir: &str, _stream: bool) -> CryoResult<()> {
            tokio::time::sleep(self.work).await;
            self.dumped.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn restore(&self, _dir: &str, _stream: bool) -> CryoResult<()> {
            tokio::time::sleep(self.work).await;
            if self.fail_restore {
                return Err(CryoError::internal("device lost"));
            }
            self.restored.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn terminate(&self) {
            self.terminated.store(true, Ordering::SeqCst);
        }

        fn exited(&self) -> Option<ExitWaiter> {
            self.exit.clone()
        }
    }

    #[derive(Debug, Default)]
    struct FakeSpawner {
        work: Duration,
        fail_restore: bool,
        fail_spawn: bool,
        track_exit: bool,
        spawned: AtomicUsize,
        last: std::sync::Mutex<Option<Arc<FakeController>>>,
        exits: std::sync::Mutex<Vec<ExitNotifier>>,
    }

    #[async_trait]
    impl ControllerSpawner for FakeSpawner {
        async fn spawn(&self, jid: &JobId) -> CryoResult<Arc<dyn GpuController>> {
            self.spawned.fetch_add(1, Ordering::SeqCst);
            if self.fail_spawn {
                return Err(GpuError::SpawnFailed {
                    reason: "no controller binary".to_string(),
                }
                .into());
            }
            let exit = self.track_exit.then(|| {
                let (notifier, waiter) = ExitWaiter::channel();
                self.exits.lock().unwrap().push(notifier);
                waiter
            });
            let controller = Arc::new(FakeController {
                jid: Some(jid.clone()),
                work: self.work,
                fail_restore: self.fail_restore,
                exit,
                ..Default::default()
            });
            *self.last.lock().unwrap() = Some(Arc::clone(&controller));
            Ok(controller)
        }
    }

    impl FakeSpawner {
        fn last(&self) -> Arc<FakeController> {
            self.last.lock().unwrap().clone().unwrap()
        }
    }

    fn coordinator(spawner: Arc<FakeSpawner>) -> Arc<GpuCoordinator> {
        Arc::new(GpuCoordinator::new(spawner, TaskTracker::new()))
    }

    fn jid(id: &str) -> JobId {
        JobId::new(id).unwrap()
    }

    fn opts() -> Arc<CriuOpts> {
        Arc::new(CriuOpts {
            images_dir: Some("/tmp/images".into()),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_one_controller_per_job() {
        let spawner = Arc::new(FakeSpawner::default());
        let gpus = coordinator(Arc::clone(&spawner));

        gpus.attach(&jid("a")).await.unwrap();
        let err = gpus.attach(&jid("a")).await.err().unwrap();
        assert_eq!(err.code(), ErrorCode::FailedPrecondition);
        assert_eq!(spawner.spawned.load(Ordering::SeqCst), 1);

        gpus.attach(&jid("b")).await.unwrap();
        assert_eq!(gpus.len(), 2);

        gpus.detach(&jid("a")).await.unwrap();
        assert!(!gpus.is_attached(&jid("a")));
        gpus.attach(&jid("a")).await.unwrap();

        let err = gpus.detach(&jid("missing")).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn test_pre_dump_blocks_until_device_state_written() {
        let spawner = Arc::new(FakeSpawner {
            work: Duration::from_millis(100),
            ..Default::default()
        });
        let gpus = coordinator(Arc::clone(&spawner));
        gpus.attach(&jid("job")).await.unwrap();

        let registry = NotifyRegistry::new();
        registry.register(gpus.dump_hooks(jid("job")));
        registry.fire(Phase::PreDump, &opts(), 0, None).await.unwrap();
        assert!(spawner.last().dumped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_pre_dump_without_controller_fails() {
        let gpus = coordinator(Arc::new(FakeSpawner::default()));
        let registry = NotifyRegistry::new();
        registry.register(gpus.dump_hooks(jid("job")));
        let err = registry
            .fire(Phase::PreDump, &opts(), 0, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("No GPU attached to job job"));
    }

    #[tokio::test]
    async fn test_restore_overlaps_engine_and_gates_resume() {
        let spawner = Arc::new(FakeSpawner {
            work: Duration::from_millis(150),
            ..Default::default()
        });
        let gpus = coordinator(Arc::clone(&spawner));
        let registry = NotifyRegistry::new();
        registry.register(gpus.restore_hooks(jid("job")));

        let started = Instant::now();
        registry
            .fire(Phase::PreRestore, &opts(), 0, None)
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_millis(100));

        registry
            .fire(Phase::PostRestore, &opts(), 4242, None)
            .await
            .unwrap();
        assert!(spawner.last().restored.load(Ordering::SeqCst));
        registry
            .fire(Phase::PreResume, &opts(), 4242, None)
            .await
            .unwrap();
        assert!(gpus.is_attached(&jid("job")));
    }

    #[tokio::test]
    async fn test_restore_failure_surfaces_at_every_gate() {
        let spawner = Arc::new(FakeSpawner {
            fail_restore: true,
            ..Default::default()
        });
        let gpus = coordinator(Arc::clone(&spawner));
        let registry = NotifyRegistry::new();
        registry.register(gpus.restore_hooks(jid("job")));

        registry
            .fire(Phase::PreRestore, &opts(), 0, None)
            .await
            .unwrap();
        let err = registry
            .fire(Phase::PostRestore, &opts(), 1, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("device lost"));
        let err = registry
            .fire(Phase::PreResume, &opts(), 1, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("device lost"));

        registry.on_error().await;
        assert!(spawner.last().terminated.load(Ordering::SeqCst));
        assert!(gpus.is_empty());
    }

    #[tokio::test]
    async fn test_pre_restore_fails_when_controller_cannot_start() {
        let spawner = Arc::new(FakeSpawner {
            fail_spawn: true,
            ..Default::default()
        });
        let gpus = coordinator(Arc::clone(&spawner));
        let registry = NotifyRegistry::new();
        registry.register(gpus.restore_hooks(jid("job")));

        let err = registry
            .fire(Phase::PreRestore, &opts(), 0, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no controller binary"));
        assert!(!gpus.is_attached(&jid("job")));

        // The restore never started, so resume cannot pass either.
        let err = registry
            .fire(Phase::PreResume, &opts(), 1, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("never started"));
    }

    #[tokio::test]
    async fn test_dead_controller_is_forgotten() {
        let spawner = Arc::new(FakeSpawner {
            track_exit: true,
            ..Default::default()
        });
        let gpus = coordinator(Arc::clone(&spawner));
        gpus.attach(&jid("job")).await.unwrap();

        let notifier = spawner.exits.lock().unwrap().remove(0);
        notifier.notify(ProcessExit::Signal(libc::SIGKILL));
        tokio::time::timeout(Duration::from_secs(5), async {
            while gpus.is_attached(&jid("job")) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("slot of dead controller was kept");

        gpus.attach(&jid("job")).await.unwrap();
        assert_eq!(spawner.spawned.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_resume_without_restore_start_fails() {
        let gpus = coordinator(Arc::new(FakeSpawner::default()));
        let registry = NotifyRegistry::new();
        registry.register(gpus.restore_hooks(jid("job")));
        let err = registry
            .fire(Phase::PreResume, &opts(), 1, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("never started"));
    }

    #[test]
    fn test_leave_running_rejected_with_gpu() {
        let err = check_leave_running(true, true).unwrap_err();
        assert_eq!(err.code(), ErrorCode::FailedPrecondition);
        assert!(check_leave_running(true, false).is_ok());
        assert!(check_leave_running(false, true).is_ok());
    }

    #[test]
    fn test_nvidia_mounts() {
        assert!(is_nvidia_mount("/dev/nvidia0"));
        assert!(is_nvidia_mount("/usr/lib/x86_64-linux-gnu/libnvidia-ml.so.1"));
        assert!(!is_nvidia_mount("/dev/nvidiactl"));
        assert!(!is_nvidia_mount("/home/user"));
        assert_eq!(external_mount("/dev/nvidia0"), "mnt[/dev/nvidia0]:/dev/nvidia0");
    }
}
