//! Hooks the engine calls back into while it dumps or restores.
//!
//! A [`HookBundle`] is a table of optional hooks, one slot per phase. Steps
//! register bundles into the operation's [`NotifyRegistry`]; when the engine
//! reaches a phase, every bundle's hook for it runs, newest first, and the
//! first error aborts the operation.

use std::fmt;
use std::future::Future;
use std::os::fd::OwnedFd;
use std::sync::{Arc, PoisonError, RwLock};

use futures::future::BoxFuture;

use super::rpc::CriuOpts;
use crate::error::{CriuError, CryoResult};

/// Named synchronization points reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    PreDump,
    PostDump,
    PreRestore,
    PostRestore,
    NetworkLock,
    NetworkUnlock,
    SetupNamespaces,
    PostSetupNamespaces,
    PreResume,
    PostResume,
    OrphanPtsMaster,
}

impl Phase {
    pub const ALL: [Phase; 11] = [
        Phase::PreDump,
        Phase::PostDump,
        Phase::PreRestore,
        Phase::PostRestore,
        Phase::NetworkLock,
        Phase::NetworkUnlock,
        Phase::SetupNamespaces,
        Phase::PostSetupNamespaces,
        Phase::PreResume,
        Phase::PostResume,
        Phase::OrphanPtsMaster,
    ];

    /// Script name used on the wire.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Phase::PreDump => "pre-dump",
            Phase::PostDump => "post-dump",
            Phase::PreRestore => "pre-restore",
            Phase::PostRestore => "post-restore",
            Phase::NetworkLock => "network-lock",
            Phase::NetworkUnlock => "network-unlock",
            Phase::SetupNamespaces => "setup-namespaces",
            Phase::PostSetupNamespaces => "post-setup-namespaces",
            Phase::PreResume => "pre-resume",
            Phase::PostResume => "post-resume",
            Phase::OrphanPtsMaster => "orphan-pts-master",
        }
    }

    pub fn from_script(script: &str) -> Option<Self> {
        Phase::ALL.into_iter().find(|p| p.as_str() == script)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type OptsHook = Arc<dyn Fn(Arc<CriuOpts>) -> BoxFuture<'static, CryoResult<()>> + Send + Sync>;
pub type PidHook = Arc<dyn Fn(i32) -> BoxFuture<'static, CryoResult<()>> + Send + Sync>;
pub type FdHook = Arc<dyn Fn(Arc<OwnedFd>) -> BoxFuture<'static, CryoResult<()>> + Send + Sync>;
pub type PlainHook = Arc<dyn Fn() -> BoxFuture<'static, CryoResult<()>> + Send + Sync>;

macro_rules! hook_setter {
    ($(#[$doc:meta])* $name:ident, $hook:ident, $arg:ty) => {
        $(#[$doc])*
        pub fn $name<F, Fut>(mut self, f: F) -> Self
        where
            F: Fn($arg) -> Fut + Send + Sync + 'static,
            Fut: Future<Output = CryoResult<()>> + Send + 'static,
        {
            self.$name = Some(Arc::new(move |arg| -> BoxFuture<'static, CryoResult<()>> {
                Box::pin(f(arg))
            }) as $hook);
            self
        }
    };
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        pub fn $name<F, Fut>(mut self, f: F) -> Self
        where
            F: Fn() -> Fut + Send + Sync + 'static,
            Fut: Future<Output = CryoResult<()>> + Send + 'static,
        {
            self.$name = Some(Arc::new(move || -> BoxFuture<'static, CryoResult<()>> {
                Box::pin(f())
            }) as PlainHook);
            self
        }
    };
}

/// One registrant's hooks. Empty slots are no-ops.
#[derive(Clone, Default)]
pub struct HookBundle {
    name: String,

    initialize: Option<PidHook>,
    initialize_dump: Option<OptsHook>,
    finalize_dump: Option<OptsHook>,
    initialize_restore: Option<OptsHook>,
    finalize_restore: Option<OptsHook>,

    pre_dump: Option<OptsHook>,
    post_dump: Option<OptsHook>,
    pre_restore: Option<OptsHook>,
    post_restore: Option<PidHook>,
    network_lock: Option<PlainHook>,
    network_unlock: Option<PlainHook>,
    setup_namespaces: Option<PidHook>,
    post_setup_namespaces: Option<PidHook>,
    pre_resume: Option<PidHook>,
    post_resume: Option<PidHook>,
    orphan_pts_master: Option<FdHook>,

    on_error: Option<PlainHook>,
}

impl HookBundle {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    hook_setter!(
        /// Runs once the engine worker is up, with its PID.
        initialize, PidHook, i32
    );
    hook_setter!(initialize_dump, OptsHook, Arc<CriuOpts>);
    hook_setter!(
        /// Runs after a dump whatever its outcome.
        finalize_dump, OptsHook, Arc<CriuOpts>
    );
    hook_setter!(initialize_restore, OptsHook, Arc<CriuOpts>);
    hook_setter!(
        /// Runs after a restore whatever its outcome.
        finalize_restore, OptsHook, Arc<CriuOpts>
    );
    hook_setter!(pre_dump, OptsHook, Arc<CriuOpts>);
    hook_setter!(post_dump, OptsHook, Arc<CriuOpts>);
    hook_setter!(pre_restore, OptsHook, Arc<CriuOpts>);
    hook_setter!(post_restore, PidHook, i32);
    hook_setter!(network_lock);
    hook_setter!(network_unlock);
    hook_setter!(setup_namespaces, PidHook, i32);
    hook_setter!(post_setup_namespaces, PidHook, i32);
    hook_setter!(pre_resume, PidHook, i32);
    hook_setter!(post_resume, PidHook, i32);
    hook_setter!(orphan_pts_master, FdHook, Arc<OwnedFd>);
    hook_setter!(
        /// Runs when the operation fails. Errors are logged, not returned.
        on_error
    );

    /// Names of the slots this bundle fills.
    pub fn hooks(&self) -> Vec<&'static str> {
        let slots = [
            ("initialize", self.initialize.is_some()),
            ("initialize-dump", self.initialize_dump.is_some()),
            ("finalize-dump", self.finalize_dump.is_some()),
            ("initialize-restore", self.initialize_restore.is_some()),
            ("finalize-restore", self.finalize_restore.is_some()),
            (Phase::PreDump.as_str(), self.pre_dump.is_some()),
            (Phase::PostDump.as_str(), self.post_dump.is_some()),
            (Phase::PreRestore.as_str(), self.pre_restore.is_some()),
            (Phase::PostRestore.as_str(), self.post_restore.is_some()),
            (Phase::NetworkLock.as_str(), self.network_lock.is_some()),
            (Phase::NetworkUnlock.as_str(), self.network_unlock.is_some()),
            (Phase::SetupNamespaces.as_str(), self.setup_namespaces.is_some()),
            (
                Phase::PostSetupNamespaces.as_str(),
                self.post_setup_namespaces.is_some(),
            ),
            (Phase::PreResume.as_str(), self.pre_resume.is_some()),
            (Phase::PostResume.as_str(), self.post_resume.is_some()),
            (Phase::OrphanPtsMaster.as_str(), self.orphan_pts_master.is_some()),
            ("on-error", self.on_error.is_some()),
        ];
        slots
            .into_iter()
            .filter_map(|(name, set)| set.then_some(name))
            .collect()
    }
}

impl fmt::Debug for HookBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookBundle")
            .field("name", &self.name)
            .field("hooks", &self.hooks())
            .finish()
    }
}

/// Append-only list of hook bundles shared by the steps of one operation.
#[derive(Clone, Default)]
pub struct NotifyRegistry {
    bundles: Arc<RwLock<Vec<Arc<HookBundle>>>>,
}

impl NotifyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, bundle: HookBundle) {
        tracing::debug!(bundle = %bundle.name, hooks = ?bundle.hooks(), "Registered notify hooks");
        self.bundles
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(bundle));
    }

    pub fn len(&self) -> usize {
        self.bundles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bundles newest first. Hooks run outside the lock.
    fn newest_first(&self) -> Vec<Arc<HookBundle>> {
        let bundles = self.bundles.read().unwrap_or_else(PoisonError::into_inner);
        bundles.iter().rev().cloned().collect()
    }

    async fn run_opts(
        &self,
        label: &'static str,
        opts: &Arc<CriuOpts>,
        slot: fn(&HookBundle) -> Option<&OptsHook>,
    ) -> CryoResult<()> {
        for bundle in self.newest_first() {
            if let Some(hook) = slot(&bundle) {
                tracing::trace!(bundle = %bundle.name, hook = label, "Running notify hook");
                hook(Arc::clone(opts)).await?;
            }
        }
        Ok(())
    }

    async fn run_pid(
        &self,
        label: &'static str,
        pid: i32,
        slot: fn(&HookBundle) -> Option<&PidHook>,
    ) -> CryoResult<()> {
        for bundle in self.newest_first() {
            if let Some(hook) = slot(&bundle) {
                tracing::trace!(bundle = %bundle.name, hook = label, pid = pid, "Running notify hook");
                hook(pid).await?;
            }
        }
        Ok(())
    }

    async fn run_plain(
        &self,
        label: &'static str,
        slot: fn(&HookBundle) -> Option<&PlainHook>,
    ) -> CryoResult<()> {
        for bundle in self.newest_first() {
            if let Some(hook) = slot(&bundle) {
                tracing::trace!(bundle = %bundle.name, hook = label, "Running notify hook");
                hook().await?;
            }
        }
        Ok(())
    }

    pub async fn initialize(&self, criu_pid: i32) -> CryoResult<()> {
        self.run_pid("initialize", criu_pid, |b| b.initialize.as_ref())
            .await
    }

    pub async fn initialize_dump(&self, opts: &Arc<CriuOpts>) -> CryoResult<()> {
        self.run_opts("initialize-dump", opts, |b| b.initialize_dump.as_ref())
            .await
    }

    pub async fn finalize_dump(&self, opts: &Arc<CriuOpts>) -> CryoResult<()> {
        self.run_opts("finalize-dump", opts, |b| b.finalize_dump.as_ref())
            .await
    }

    pub async fn initialize_restore(&self, opts: &Arc<CriuOpts>) -> CryoResult<()> {
        self.run_opts("initialize-restore", opts, |b| {
            b.initialize_restore.as_ref()
        })
        .await
    }

    pub async fn finalize_restore(&self, opts: &Arc<CriuOpts>) -> CryoResult<()> {
        self.run_opts("finalize-restore", opts, |b| b.finalize_restore.as_ref())
            .await
    }

    /// Fires every hook registered for `phase`. `pid` is the PID carried
    /// by the notification (zero when absent) and `fd` the descriptor
    /// passed alongside it.
    pub async fn fire(
        &self,
        phase: Phase,
        opts: &Arc<CriuOpts>,
        pid: i32,
        fd: Option<OwnedFd>,
    ) -> CryoResult<()> {
        let label = phase.as_str();
        match phase {
            Phase::PreDump => self.run_opts(label, opts, |b| b.pre_dump.as_ref()).await,
            Phase::PostDump => self.run_opts(label, opts, |b| b.post_dump.as_ref()).await,
            Phase::PreRestore => {
                self.run_opts(label, opts, |b| b.pre_restore.as_ref())
                    .await
            }
            Phase::PostRestore => {
                self.run_pid(label, pid, |b| b.post_restore.as_ref())
                    .await
            }
            Phase::NetworkLock => {
                self.run_plain(label, |b| b.network_lock.as_ref())
                    .await
            }
            Phase::NetworkUnlock => {
                self.run_plain(label, |b| b.network_unlock.as_ref())
                    .await
            }
            Phase::SetupNamespaces => {
                self.run_pid(label, pid, |b| b.setup_namespaces.as_ref())
                    .await
            }
            Phase::PostSetupNamespaces => {
                self.run_pid(label, pid, |b| b.post_setup_namespaces.as_ref())
                    .await
            }
            Phase::PreResume => self.run_pid(label, pid, |b| b.pre_resume.as_ref()).await,
            Phase::PostResume => {
                self.run_pid(label, pid, |b| b.post_resume.as_ref())
                    .await
            }
            Phase::OrphanPtsMaster => {
                let fd = Arc::new(fd.ok_or_else(|| CriuError::MalformedResponse {
                    reason: "orphan-pts-master notification carried no descriptor".to_string(),
                })?);
                for bundle in self.newest_first() {
                    if let Some(hook) = &bundle.orphan_pts_master {
                        hook(Arc::clone(&fd)).await?;
                    }
                }
                Ok(())
            }
        }
    }

    /// Runs every on-error hook. Hook failures are only logged.
    pub async fn on_error(&self) {
        for bundle in self.newest_first() {
            if let Some(hook) = &bundle.on_error {
                if let Err(e) = hook().await {
                    tracing::warn!(bundle = %bundle.name, error = %e, "on-error hook failed");
                }
            }
        }
    }
}

impl fmt::Debug for NotifyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.newest_first().iter().rev()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CryoError;
    use std::sync::Mutex;

    fn recording(name: &'static str, log: &Arc<Mutex<Vec<&'static str>>>) -> HookBundle {
        let log = Arc::clone(log);
        HookBundle::new(name).post_restore(move |_pid| {
            let log = Arc::clone(&log);
            async move {
                log.lock().unwrap().push(name);
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn test_hooks_fire_newest_first() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = NotifyRegistry::new();
        registry.register(recording("A", &log));
        registry.register(recording("B", &log));
        registry.register(recording("C", &log));

        let opts = Arc::new(CriuOpts::default());
        registry
            .fire(Phase::PostRestore, &opts, 42, None)
            .await
            .unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["C", "B", "A"]);
    }

    #[tokio::test]
    async fn test_hook_error_stops_older_bundles() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = NotifyRegistry::new();
        registry.register(recording("A", &log));
        registry.register(HookBundle::new("B").post_restore(|_pid| async {
            Err(CryoError::internal("B failed"))
        }));
        registry.register(recording("C", &log));

        let opts = Arc::new(CriuOpts::default());
        let err = registry
            .fire(Phase::PostRestore, &opts, 42, None)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "B failed");
        assert_eq!(*log.lock().unwrap(), vec!["C"]);
    }

    #[tokio::test]
    async fn test_empty_slots_are_noops() {
        let registry = NotifyRegistry::new();
        registry.register(HookBundle::new("only-network").network_lock(|| async { Ok(()) }));

        let opts = Arc::new(CriuOpts::default());
        for phase in Phase::ALL {
            if phase == Phase::OrphanPtsMaster {
                continue;
            }
            registry.fire(phase, &opts, 0, None).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_orphan_pts_master_requires_descriptor() {
        let registry = NotifyRegistry::new();
        let opts = Arc::new(CriuOpts::default());
        assert!(registry
            .fire(Phase::OrphanPtsMaster, &opts, 0, None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_on_error_swallows_failures() {
        let hit = Arc::new(Mutex::new(0));
        let registry = NotifyRegistry::new();
        let counter = Arc::clone(&hit);
        registry.register(HookBundle::new("counting").on_error(move || {
            let counter = Arc::clone(&counter);
            async move {
                *counter.lock().unwrap() += 1;
                Ok(())
            }
        }));
        registry.register(
            HookBundle::new("failing").on_error(|| async { Err(CryoError::internal("boom")) }),
        );

        registry.on_error().await;
        assert_eq!(*hit.lock().unwrap(), 1);
    }

    #[test]
    fn test_phase_script_names() {
        for phase in Phase::ALL {
            assert_eq!(Phase::from_script(phase.as_str()), Some(phase));
        }
        assert_eq!(Phase::from_script("status-ready"), None);
    }

    #[test]
    fn test_bundle_debug_lists_filled_slots() {
        let bundle = HookBundle::new("gpu")
            .pre_dump(|_opts| async { Ok(()) })
            .on_error(|| async { Ok(()) });
        assert_eq!(bundle.hooks(), vec!["pre-dump", "on-error"]);
        let debug = format!("{:?}", bundle);
        assert!(debug.contains("gpu"));
        assert!(debug.contains("pre-dump"));
    }
}
