//! Operation pipelines.
//!
//! A dump, restore or run is a terminal [`Handler`] wrapped in a stack of
//! [`Adapter`]s. Each adapter may prepare the request before calling the
//! next handler and inspect the response after it returns. The first
//! adapter given to a [`Pipeline`] is the outermost one.
//!
//! ```text
//! criu ─▶ defaults ─▶ validate ─▶ filesystem ─▶ process ─▶ gpu ─▶ check ─▶ handler
//! ```
//!
//! [`Opts`] travels by value, but its fields are shared handles: hooks a
//! step registers into `criu_callback` are the ones the terminal handler
//! hands to the engine.

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::Config;
use crate::criu::{CriuClient, NotifyRegistry};
use crate::error::CryoResult;
use crate::plugins::Plugins;
use crate::storage::{ImageFs, LocalStorage, Storage};
use crate::sys::ExitWaiter;

pub mod criu;
pub mod defaults;
pub mod filesystem;
pub mod gpu;
pub mod job;
pub mod network;
pub mod operations;
pub mod process;
mod request;
pub mod run;
pub mod streamer;
pub mod validation;

pub use operations::{dump_pipeline, restore_pipeline, run_pipeline, Services};
pub use request::{
    DumpAction, DumpReq, DumpResp, EngineRequest, RestoreReq, RestoreResp, RunReq, RunResp,
    StateResponse, PROCESS_KIND,
};

pub type HandlerFuture<'a> = BoxFuture<'a, CryoResult<Option<ExitWaiter>>>;

/// One step of an operation. Resolves to a waiter for the process the
/// operation leaves behind, if any.
pub type Handler<Req, Resp> =
    Arc<dyn for<'a> Fn(Opts, &'a mut Resp, &'a mut Req) -> HandlerFuture<'a> + Send + Sync>;

/// Wraps a handler into another handler of the same shape.
pub type Adapter<Req, Resp> = Arc<dyn Fn(Handler<Req, Resp>) -> Handler<Req, Resp> + Send + Sync>;

pub type DumpHandler = Handler<DumpReq, DumpResp>;
pub type RestoreHandler = Handler<RestoreReq, RestoreResp>;
pub type RunHandler = Handler<RunReq, RunResp>;

pub fn handler<Req, Resp, F>(f: F) -> Handler<Req, Resp>
where
    F: for<'a> Fn(Opts, &'a mut Resp, &'a mut Req) -> HandlerFuture<'a> + Send + Sync + 'static,
{
    Arc::new(f)
}

pub fn adapter<Req, Resp, F>(f: F) -> Adapter<Req, Resp>
where
    F: Fn(Handler<Req, Resp>) -> Handler<Req, Resp> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Wraps `next` in `adapters`, the first one outermost.
pub fn wrap<Req, Resp>(next: Handler<Req, Resp>, adapters: &[Adapter<Req, Resp>]) -> Handler<Req, Resp> {
    adapters
        .iter()
        .rev()
        .fold(next, |handler, adapter| adapter(handler))
}

/// Ordered list of adapters.
pub struct Pipeline<Req, Resp> {
    adapters: Vec<Adapter<Req, Resp>>,
}

impl<Req, Resp> Pipeline<Req, Resp> {
    pub fn new() -> Self {
        Self {
            adapters: Vec::new(),
        }
    }

    /// Appends an adapter inside the ones added so far.
    pub fn with(mut self, adapter: Adapter<Req, Resp>) -> Self {
        self.adapters.push(adapter);
        self
    }

    pub fn with_if(self, condition: bool, adapter: Adapter<Req, Resp>) -> Self {
        if condition {
            self.with(adapter)
        } else {
            self
        }
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    pub fn build(self, terminal: Handler<Req, Resp>) -> Handler<Req, Resp> {
        wrap(terminal, &self.adapters)
    }
}

impl<Req, Resp> Default for Pipeline<Req, Resp> {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-operation context shared by every step.
#[derive(Clone)]
pub struct Opts {
    pub config: Arc<Config>,
    /// Cancelled when the daemon shuts down. Processes started by the
    /// operation are tied to it.
    pub lifetime: CancellationToken,
    /// Background work spawned by the operation.
    pub tasks: TaskTracker,
    pub plugins: Arc<dyn Plugins>,
    pub storage: Arc<dyn Storage>,
    /// Set by the engine step, or up front by the caller.
    pub criu: Option<Arc<CriuClient>>,
    pub criu_callback: NotifyRegistry,
    /// The image directory of the operation, once a filesystem step ran.
    pub dump_fs: Option<Arc<dyn ImageFs>>,
}

impl Opts {
    pub fn new(config: Arc<Config>, plugins: Arc<dyn Plugins>) -> Self {
        Self {
            config,
            lifetime: CancellationToken::new(),
            tasks: TaskTracker::new(),
            plugins,
            storage: Arc::new(LocalStorage::new()),
            criu: None,
            criu_callback: NotifyRegistry::new(),
            dump_fs: None,
        }
    }

    pub fn with_criu(mut self, criu: Arc<CriuClient>) -> Self {
        self.criu = Some(criu);
        self
    }

    pub fn with_lifetime(mut self, lifetime: CancellationToken) -> Self {
        self.lifetime = lifetime;
        self
    }

    pub fn with_tasks(mut self, tasks: TaskTracker) -> Self {
        self.tasks = tasks;
        self
    }
}

impl fmt::Debug for Opts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Opts")
            .field("storage", &self.storage)
            .field("criu", &self.criu)
            .field("criu_callback", &self.criu_callback)
            .field("dump_fs", &self.dump_fs.as_ref().map(|fs| fs.root().to_path_buf()))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CryoError;
    use crate::plugins::StaticPlugins;
    use std::sync::Mutex;

    type Trace = Arc<Mutex<Vec<String>>>;

    fn opts() -> Opts {
        Opts::new(Arc::new(Config::default()), Arc::new(StaticPlugins::default()))
    }

    fn tracing_adapter(name: &'static str, trace: &Trace) -> Adapter<Vec<&'static str>, Vec<&'static str>> {
        let trace = Arc::clone(trace);
        adapter(move |next| {
            let trace = Arc::clone(&trace);
            handler(move |opts, resp: &mut Vec<&'static str>, req: &mut Vec<&'static str>| {
                let next = next.clone();
                let trace = Arc::clone(&trace);
                Box::pin(async move {
                    trace.lock().unwrap().push(format!("pre {}", name));
                    req.push(name);
                    let result = next(opts, &mut *resp, &mut *req).await;
                    if result.is_ok() {
                        trace.lock().unwrap().push(format!("post {}", name));
                        resp.push(name);
                    }
                    result
                })
            })
        })
    }

    fn terminal(fail: bool) -> Handler<Vec<&'static str>, Vec<&'static str>> {
        handler(move |_opts, _resp: &mut Vec<&'static str>, req: &mut Vec<&'static str>| {
            Box::pin(async move {
                req.push("handler");
                if fail {
                    return Err(CryoError::internal("engine failed"));
                }
                Ok(None)
            })
        })
    }

    #[tokio::test]
    async fn test_first_adapter_is_outermost() {
        let trace: Trace = Arc::default();
        let pipeline = Pipeline::new()
            .with(tracing_adapter("a", &trace))
            .with(tracing_adapter("b", &trace))
            .with(tracing_adapter("c", &trace))
            .build(terminal(false));

        let (mut resp, mut req) = (Vec::new(), Vec::new());
        pipeline(opts(), &mut resp, &mut req).await.unwrap();

        assert_eq!(req, vec!["a", "b", "c", "handler"]);
        assert_eq!(resp, vec!["c", "b", "a"]);
        assert_eq!(
            *trace.lock().unwrap(),
            vec!["pre a", "pre b", "pre c", "post c", "post b", "post a"]
        );
    }

    #[tokio::test]
    async fn test_error_skips_success_post_logic() {
        let trace: Trace = Arc::default();
        let pipeline = Pipeline::new()
            .with(tracing_adapter("a", &trace))
            .with(tracing_adapter("b", &trace))
            .build(terminal(true));

        let (mut resp, mut req) = (Vec::new(), Vec::new());
        let err = pipeline(opts(), &mut resp, &mut req).await.unwrap_err();
        assert_eq!(err.to_string(), "engine failed");
        assert!(resp.is_empty());
        assert_eq!(*trace.lock().unwrap(), vec!["pre a", "pre b"]);
    }

    #[tokio::test]
    async fn test_short_circuit_stops_inner_steps() {
        let trace: Trace = Arc::default();
        let reject = adapter(|_next: Handler<Vec<&'static str>, Vec<&'static str>>| {
            handler(|_opts, _resp, _req| {
                Box::pin(async { Err(CryoError::invalid_argument("missing dir")) })
            })
        });
        let pipeline = Pipeline::new()
            .with(tracing_adapter("a", &trace))
            .with(reject)
            .with(tracing_adapter("b", &trace))
            .build(terminal(false));

        let (mut resp, mut req) = (Vec::new(), Vec::new());
        let err = pipeline(opts(), &mut resp, &mut req).await.unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::InvalidArgument);
        assert_eq!(req, vec!["a"]);
    }

    #[tokio::test]
    async fn test_hooks_registered_by_steps_reach_handler() {
        let register = adapter(|next: Handler<(), usize>| {
            handler(move |opts, resp, req| {
                let next = next.clone();
                Box::pin(async move {
                    opts.criu_callback
                        .register(crate::criu::HookBundle::new("step"));
                    next(opts, resp, req).await
                })
            })
        });
        let count = handler(|opts: Opts, resp: &mut usize, _req: &mut ()| {
            Box::pin(async move {
                *resp = opts.criu_callback.len();
                Ok(None)
            })
        });

        let pipeline = Pipeline::new().with(register).build(count);
        let mut resp = 0;
        pipeline(opts(), &mut resp, &mut ()).await.unwrap();
        assert_eq!(resp, 1);
    }
}
