//! An in-process engine that answers requests from a script.
//!
//! Lets the notify loop and the pipeline run without a CRIU binary. The
//! script maps each top-level request to the sequence of responses the
//! engine sends back; notifications in that sequence wait for the client's
//! acknowledgement like the real engine does.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use prost::Message;

use super::rpc::{
    CriuDumpResp, CriuFeatures, CriuNotify, CriuReq, CriuReqType, CriuResp, CriuRestoreResp,
    CriuVersion,
};
use super::transport::{EngineFiles, EngineLauncher, EngineSession, Received, Transport};
use crate::error::CryoResult;
use crate::sys::{ExitWaiter, ProcessExit};

type Script = Arc<dyn Fn(&CriuReq) -> Vec<CriuResp> + Send + Sync>;

/// Launches scripted engine sessions and records every request they see.
pub struct ScriptedLauncher {
    script: Script,
    requests: Arc<Mutex<Vec<CriuReq>>>,
    launches: AtomicUsize,
}

impl ScriptedLauncher {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&CriuReq) -> Vec<CriuResp> + Send + Sync + 'static,
    {
        Self {
            script: Arc::new(script),
            requests: Arc::new(Mutex::new(Vec::new())),
            launches: AtomicUsize::new(0),
        }
    }

    /// Every request sent so far, acknowledgements included.
    pub fn requests(&self) -> Vec<CriuReq> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Requests other than notify acknowledgements.
    pub fn calls(&self) -> Vec<CriuReqType> {
        self.requests()
            .iter()
            .map(CriuReq::r#type)
            .filter(|t| *t != CriuReqType::Notify)
            .collect()
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for ScriptedLauncher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedLauncher")
            .field("launches", &self.launches())
            .finish()
    }
}

#[async_trait]
impl EngineLauncher for ScriptedLauncher {
    async fn launch(&self, _files: EngineFiles) -> CryoResult<EngineSession> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let transport = ScriptedTransport {
            script: Arc::clone(&self.script),
            requests: Arc::clone(&self.requests),
            pending: VecDeque::new(),
        };
        Ok(EngineSession::new(
            Box::new(transport),
            std::process::id() as i32,
            ExitWaiter::exited(ProcessExit::Code(0)),
        ))
    }
}

struct ScriptedTransport {
    script: Script,
    requests: Arc<Mutex<Vec<CriuReq>>>,
    pending: VecDeque<CriuResp>,
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&mut self, data: &[u8]) -> io::Result<()> {
        let req = CriuReq::decode(data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if req.r#type() != CriuReqType::Notify {
            self.pending = (self.script)(&req).into();
        }
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(req);
        Ok(())
    }

    async fn recv(&mut self, _max_len: usize) -> io::Result<Received> {
        let data = self
            .pending
            .pop_front()
            .map(|resp| resp.encode_to_vec())
            .unwrap_or_default();
        Ok(Received {
            data,
            fds: Vec::new(),
        })
    }
}

/// A successful terminal response for `req_type`.
pub fn success(req_type: CriuReqType) -> CriuResp {
    let mut resp = CriuResp {
        r#type: req_type as i32,
        success: true,
        ..Default::default()
    };
    match req_type {
        CriuReqType::Dump => resp.dump = Some(CriuDumpResp::default()),
        CriuReqType::Restore => resp.restore = Some(CriuRestoreResp { pid: 4242 }),
        _ => {}
    }
    resp
}

/// A successful restore that reports `pid`.
pub fn restored(pid: i32) -> CriuResp {
    CriuResp {
        restore: Some(CriuRestoreResp { pid }),
        ..success(CriuReqType::Restore)
    }
}

pub fn failure(req_type: CriuReqType, errno: i32, message: &str) -> CriuResp {
    CriuResp {
        r#type: req_type as i32,
        success: false,
        cr_errno: Some(errno),
        cr_errmsg: Some(message.to_string()),
        ..Default::default()
    }
}

pub fn notify(script: &str, pid: i32) -> CriuResp {
    CriuResp {
        r#type: CriuReqType::Notify as i32,
        success: true,
        notify: Some(CriuNotify {
            script: Some(script.to_string()),
            pid: Some(pid),
        }),
        ..Default::default()
    }
}

pub fn version(major: i32, minor: i32, sublevel: Option<i32>, gitid: Option<&str>) -> CriuResp {
    CriuResp {
        version: Some(CriuVersion {
            major_number: major,
            minor_number: minor,
            sublevel,
            gitid: gitid.map(str::to_string),
            ..Default::default()
        }),
        ..success(CriuReqType::Version)
    }
}

pub fn features(reported: CriuFeatures) -> CriuResp {
    CriuResp {
        features: Some(reported),
        ..success(CriuReqType::FeatureCheck)
    }
}
