//! Bridge lifecycle: owner of the introspection state and of the threads serving it.
//!
//! A running bridge has two threads. The I/O thread runs the transport server and blocks
//! on accept/read/write. The owner thread owns [`BridgeState`] and executes commands one
//! at a time, the I/O thread hands it decoded requests through the exchanger.

use crate::config::BridgeConfig;
use crate::dispatch::dispatch;
use crate::exchange::{self, ClientExchanger};
use crate::protocol::{self, Response, INTERNAL_ERROR};
use crate::provider::IntrospectionProvider;
use crate::resource::{BreakpointManager, ScanManager, WatchManager};
use crate::transport::{Endpoint, TransportCloser, TransportServer};
use crate::{cb_debug, cb_error, cb_info};
use anyhow::{anyhow, Context};
use serde_json::Value;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Everything the command handlers operate on.
pub struct BridgeState {
    pub provider: Box<dyn IntrospectionProvider>,
    pub breakpoints: BreakpointManager,
    pub watches: WatchManager,
    pub scan: ScanManager,
    session: Uuid,
    started: Instant,
}

/// Number of resources force-released by a sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub breakpoints: usize,
    pub watches: usize,
    pub scans: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.breakpoints == 0 && self.watches == 0 && self.scans == 0
    }
}

impl BridgeState {
    pub fn new(provider: Box<dyn IntrospectionProvider>, config: &BridgeConfig) -> Self {
        Self {
            provider,
            breakpoints: BreakpointManager::new(config.hardware_slots, config.max_hits_per_breakpoint),
            watches: WatchManager::new(),
            scan: ScanManager::new(),
            session: Uuid::new_v4(),
            started: Instant::now(),
        }
    }

    /// Identifier of the current bridge run, changes on every start.
    pub fn session(&self) -> Uuid {
        self.session
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    fn new_session(&mut self) {
        self.session = Uuid::new_v4();
        self.started = Instant::now();
    }

    /// Force-release every tracked breakpoint, watch and scan result set.
    ///
    /// Never fails, provider errors are logged. Running it twice releases nothing the
    /// second time.
    pub fn release_all(&mut self) -> SweepReport {
        let provider = self.provider.as_mut();
        SweepReport {
            breakpoints: self.breakpoints.clear_all(provider),
            watches: self.watches.release_all(provider),
            scans: usize::from(self.scan.release(provider)),
        }
    }
}

struct Running {
    endpoint: Endpoint,
    closer: TransportCloser,
    client: Arc<ClientExchanger<BridgeState>>,
    io_thread: JoinHandle<()>,
    owner_thread: JoinHandle<BridgeState>,
}

pub struct Bridge {
    config: BridgeConfig,
    /// State of a stopped bridge, moved to the owner thread while running.
    state: Option<BridgeState>,
    running: Option<Running>,
}

impl Bridge {
    pub fn new(provider: Box<dyn IntrospectionProvider>, config: BridgeConfig) -> Self {
        let state = BridgeState::new(provider, &config);
        Self {
            config,
            state: Some(state),
            running: None,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Endpoint of a running bridge, with the actual port if the configured one was `0`.
    pub fn local_endpoint(&self) -> Option<&Endpoint> {
        self.running.as_ref().map(|r| &r.endpoint)
    }

    /// State of a stopped bridge.
    pub fn state(&self) -> Option<&BridgeState> {
        self.state.as_ref()
    }

    /// Start serving. A running bridge is restarted, every resource left from a previous
    /// run is released before the transport accepts anyone.
    pub fn start(&mut self) -> anyhow::Result<()> {
        if self.is_running() {
            self.stop();
        }

        let state = self
            .state
            .as_mut()
            .ok_or_else(|| anyhow!("bridge state lost by a previous run"))?;
        sweep(state);

        let endpoint = self.config.endpoint()?;
        let server = TransportServer::bind(&endpoint, self.config.transport_options())
            .with_context(|| format!("bind {endpoint}"))?;
        let endpoint = server.local_endpoint().clone();
        let closer = server.closer();

        let mut state = self
            .state
            .take()
            .ok_or_else(|| anyhow!("bridge state lost by a previous run"))?;
        state.new_session();
        let session = state.session();

        let (owner, client) = exchange::exchanger::<BridgeState>();
        let client = Arc::new(client);
        let owner_thread = thread::spawn(move || exchange::serve(state, owner));

        let io_thread = thread::spawn({
            let client = client.clone();
            move || server.run(|payload| handle_frame(&client, payload))
        });

        cb_info!("bridge session {session} listening on {endpoint}");
        self.running = Some(Running {
            endpoint,
            closer,
            client,
            io_thread,
            owner_thread,
        });
        Ok(())
    }

    /// Stop serving and release every resource. Does nothing on a stopped bridge.
    pub fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        running.closer.close();
        if running.io_thread.join().is_err() {
            cb_error!("transport thread panicked");
        }

        running.client.disable_messaging();
        running.client.send_exit();
        match running.owner_thread.join() {
            Ok(state) => self.state = Some(state),
            Err(_) => cb_error!("owner thread panicked, bridge state is lost"),
        }

        if let Some(state) = self.state.as_mut() {
            sweep(state);
        }
        cb_info!("bridge on {} stopped", running.endpoint);
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.stop();
    }
}

fn sweep(state: &mut BridgeState) {
    let report = state.release_all();
    if !report.is_empty() {
        cb_info!(
            "released {} breakpoint(s), {} watch(es), {} scan(s)",
            report.breakpoints,
            report.watches,
            report.scans
        );
    }
}

/// Reply of last resort when a response can't be serialized at all.
const ENCODE_FAILURE: &[u8] =
    br#"{"error":{"code":-32603,"message":"response encoding failed"},"id":null}"#;

/// Decode a frame, execute it on the owner thread and encode the reply.
fn handle_frame(client: &ClientExchanger<BridgeState>, payload: &[u8]) -> Vec<u8> {
    let response = match protocol::decode_request(payload) {
        Ok(request) => {
            cb_debug!(target: "dispatch", "request {}", request.method);
            let id = request.id.clone();
            let jsonrpc = request.jsonrpc.clone();
            match client.request_sync(move |state: &mut BridgeState| dispatch(state, &request)) {
                Ok(response) => response,
                Err(e) => {
                    cb_error!(target: "dispatch", "request not executed: {e}");
                    let mut response = Response::error(id, INTERNAL_ERROR, e.to_string());
                    response.jsonrpc = jsonrpc;
                    response
                }
            }
        }
        Err(e) => {
            cb_debug!(target: "dispatch", "undecodable request: {e}");
            Response::error(Some(Value::Null), e.code(), e.to_string())
        }
    };

    match protocol::encode(&response) {
        Ok(bytes) => bytes,
        Err(e) => {
            cb_error!(target: "dispatch", "encode response: {e}");
            let fallback = Response::error(Some(response.id), INTERNAL_ERROR, "response encoding failed");
            protocol::encode(&fallback).unwrap_or_else(|_| ENCODE_FAILURE.to_vec())
        }
    }
}
