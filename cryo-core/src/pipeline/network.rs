//! Network options derived from the process's open connections.

use super::{adapter, handler, Adapter, EngineRequest, StateResponse};

/// Lets the engine carry established TCP connections and external unix
/// sockets when the process has any.
pub fn detect_network_options<Req, Resp>() -> Adapter<Req, Resp>
where
    Req: EngineRequest,
    Resp: StateResponse,
{
    adapter(|next| {
        handler(move |opts, resp: &mut Resp, req: &mut Req| {
            let next = next.clone();
            Box::pin(async move {
                let state = resp.state();
                let tcp = state.has_tcp_established();
                let unix = state.has_unix_sockets();
                let criu = req.criu_opts_mut();
                if tcp {
                    criu.tcp_established = Some(true);
                }
                if unix {
                    criu.ext_unix_sk = Some(true);
                }
                tracing::debug!(tcp_established = tcp, ext_unix_sk = unix, "Network options");
                next(opts, resp, req).await
            })
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::pipeline::{DumpReq, DumpResp, Opts, Pipeline};
    use crate::plugins::StaticPlugins;
    use crate::process::{Connection, ConnectionKind, ProcessState};
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn test_sets_options_for_open_connections() {
        let seen = Arc::new(Mutex::new(None));
        let terminal = {
            let seen = Arc::clone(&seen);
            handler(move |_opts, _resp: &mut DumpResp, req: &mut DumpReq| {
                let seen = Arc::clone(&seen);
                Box::pin(async move {
                    *seen.lock().unwrap() = Some((req.criu.tcp_established, req.criu.ext_unix_sk));
                    Ok(None)
                })
            })
        };
        let pipeline = Pipeline::new().with(detect_network_options()).build(terminal);
        let opts = Opts::new(Arc::new(Config::default()), Arc::new(StaticPlugins::default()));

        let mut resp = DumpResp {
            state: ProcessState {
                connections: vec![Connection {
                    kind: ConnectionKind::Tcp,
                    inode: 7,
                }],
                ..Default::default()
            },
            ..Default::default()
        };
        pipeline(opts.clone(), &mut resp, &mut DumpReq::default())
            .await
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), Some((Some(true), None)));

        resp.state.connections = Vec::new();
        pipeline(opts, &mut resp, &mut DumpReq::default()).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), Some((None, None)));
    }
}
