// Copyright 2024 Arras Core Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The computation environment: the `send`/`environment`/`setEnvironment`
//! façade a loaded plug-in sees, and `run_computation`, which drives a
//! worker through its entire lifecycle over one IPC connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use arras_protocol::{Address, ControlMessage, Envelope, ExecutorHeartbeat, ObjectContent, Uuid};
use tracing::{error, info, warn};

use crate::computation::SharedComputation;
use crate::control_filter::Controlled;
use crate::dispatcher::{DispatcherExitReason, MessageDispatcher};
use crate::limits::ExecutionLimits;
use crate::perf_monitor::{HeartbeatSink, PerfSource, PerformanceMonitor};
use crate::routing::{Addresser, ComputationMap, RoutingTable, SendTo};

/// `runComputation`'s go-wait window: how long the worker blocks for a
/// `go` control message before giving up and exiting with
/// `ProcessExitCode::ComputationGoTimeout`.
pub const GO_WAIT_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GoState {
    Pending,
    Go,
    Stopped,
}

/// Reacts to control commands arriving over the wire. Shared between
/// the dispatcher (as its `Controlled`) and `CompEnvironmentImpl` (to
/// wait on `go` and to rebuild the routing table on `update`).
pub struct ControlState {
    source_comp_id: Uuid,
    comp_map: Mutex<Arc<ComputationMap>>,
    addresser: Arc<Addresser>,
    go: Mutex<GoState>,
    go_cv: Condvar,
}

impl ControlState {
    pub fn new(source_comp_id: Uuid, comp_map: Arc<ComputationMap>, addresser: Arc<Addresser>) -> Self {
        ControlState {
            source_comp_id,
            comp_map: Mutex::new(comp_map),
            addresser,
            go: Mutex::new(GoState::Pending),
            go_cv: Condvar::new(),
        }
    }

    /// Blocks until `go` arrives or `timeout` elapses; returns `false`
    /// on timeout, `true` once `go` (or a `stop` that supersedes it) is
    /// observed.
    fn wait_for_go(&self, timeout: Duration) -> bool {
        let guard = self.go.lock().expect("go-state mutex poisoned");
        let (guard, result) = self
            .go_cv
            .wait_timeout_while(guard, timeout, |s| *s == GoState::Pending)
            .expect("go-state mutex poisoned");
        !result.timed_out() || *guard != GoState::Pending
    }
}

impl Controlled for ControlState {
    fn control_message(&self, command: &str, data: &str) {
        match command {
            "go" => {
                *self.go.lock().expect("go-state mutex poisoned") = GoState::Go;
                self.go_cv.notify_all();
            }
            "stop" | "abort" => {
                *self.go.lock().expect("go-state mutex poisoned") = GoState::Stopped;
                self.go_cv.notify_all();
            }
            "update" => {
                let parsed: Result<serde_json::Value, _> = serde_json::from_str(data);
                match parsed {
                    Ok(doc) => self.apply_update(&doc),
                    Err(e) => error!(error = %e, "malformed 'update' control message payload"),
                }
            }
            "ready" => {
                // Sent by workers, not received by them; a worker observing
                // its own echo (e.g. loopback testing) just ignores it.
            }
            other => warn!(command = other, "unrecognized control command, dropping"),
        }
    }
}

impl ControlState {
    fn apply_update(&self, doc: &serde_json::Value) {
        let Some(computations) = doc.get("computations") else {
            warn!("'update' control message missing 'computations'");
            return;
        };
        let session_id = self.addresser.current().source_address().session;
        let comp_map = match ComputationMap::new(session_id, computations) {
            Ok(m) => Arc::new(m),
            Err(e) => {
                error!(error = %e, "failed to rebuild computation map from 'update'");
                return;
            }
        };
        let filters = doc.get("messageFilter").cloned().unwrap_or_else(|| serde_json::json!({}));
        match RoutingTable::build(self.source_comp_id, &comp_map, &filters) {
            Ok(table) => {
                self.addresser.update(table);
                *self.comp_map.lock().expect("comp map mutex poisoned") = comp_map;
            }
            Err(e) => error!(error = %e, "failed to rebuild routing table from 'update'"),
        }
    }
}

/// Optional overrides for a single `send`; absent fields fall back to
/// the content's own default routing name / no explicit destination.
#[derive(Default)]
pub struct SendOptions {
    pub send_to: Option<SendTo>,
    pub routing_name: Option<String>,
    pub source_id: Option<Uuid>,
}

/// Result of `environment(name)`; mirrors the original's "unknown keys
/// return null" contract instead of erroring.
pub enum EnvironmentValue {
    String(String),
    Address(Address),
    Unknown,
}

/// How a computation's lifecycle finished. Folds the dispatcher's exit
/// reason together with any exception raised by `configure`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComputationExitReason {
    Normal,
    Timeout,
    StartException(String),
    StopException(String),
    Disconnected,
    MessageError,
    HandlerError,
}

/// Owns the loaded plug-in and exposes `send`/`environment` to it, and
/// drives `run_computation`'s ten-step startup/teardown sequence.
pub struct CompEnvironmentImpl {
    own_address: Address,
    dispatcher: Arc<MessageDispatcher>,
    addresser: Arc<Addresser>,
    control: Arc<ControlState>,
    computation_name: String,
    sent_any: AtomicBool,
}

impl CompEnvironmentImpl {
    pub fn new(
        own_address: Address,
        computation_name: impl Into<String>,
        dispatcher: Arc<MessageDispatcher>,
        addresser: Arc<Addresser>,
        control: Arc<ControlState>,
    ) -> Self {
        CompEnvironmentImpl {
            own_address,
            dispatcher,
            addresser,
            control,
            computation_name: computation_name.into(),
            sent_any: AtomicBool::new(false),
        }
    }

    /// Stamps metadata, resolves destinations, and enqueues. Returns the
    /// assembled envelope so callers can log or inspect it.
    pub fn send(&self, content: Arc<dyn ObjectContent>, options: SendOptions) -> Result<Envelope, crate::error::ShutdownError> {
        self.sent_any.store(true, Ordering::Relaxed);
        let mut env = Envelope::new(content);
        if let Some(name) = options.routing_name {
            env.metadata.routing_name = name;
        }
        if let Some(source_id) = options.source_id {
            env.metadata.source_id = source_id;
        }
        let send_to = options.send_to.unwrap_or_else(|| SendTo::RoutingName(env.metadata.routing_name.clone()));
        let (from, to) = self.addresser.resolve(&send_to);
        env.metadata.from = from;
        env.to = to;
        self.dispatcher.send(env.clone())?;
        Ok(env)
    }

    pub fn environment(&self, name: &str) -> EnvironmentValue {
        match name {
            "arras.apiVersion" => EnvironmentValue::String("4.0.0".to_string()),
            "computation.name" => EnvironmentValue::String(self.computation_name.clone()),
            "computation.address" => EnvironmentValue::Address(self.own_address),
            _ => EnvironmentValue::Unknown,
        }
    }

    /// Reserved by the original contract; every key is read-only.
    pub fn set_environment(&self, _name: &str, _value: &str) -> EnvironmentValue {
        EnvironmentValue::Unknown
    }
}

struct DispatcherPerfSource {
    dispatcher: Arc<MessageDispatcher>,
    hyperthreaded: bool,
}
impl PerfSource for DispatcherPerfSource {
    fn sent_messages(&self) -> u64 {
        self.dispatcher.sent_count()
    }
    fn received_messages(&self) -> u64 {
        self.dispatcher.received_count()
    }
    fn hyperthreaded(&self) -> bool {
        self.hyperthreaded
    }
}

struct DispatcherHeartbeatSink {
    dispatcher: Arc<MessageDispatcher>,
}
impl HeartbeatSink for DispatcherHeartbeatSink {
    fn send_heartbeat(&self, env: Envelope) {
        if let Err(e) = self.dispatcher.send(env) {
            warn!(error = %e, "failed to enqueue heartbeat, dispatcher has shut down");
        }
    }
}

/// Runs the ten-step sequence from installing filters through tearing
/// down the performance monitor. `wait_for_go` mirrors the original's
/// flag distinguishing a session that needs an explicit `go` from one
/// that dispatches immediately.
pub fn run_computation(
    env: Arc<CompEnvironmentImpl>,
    control: Arc<ControlState>,
    computation: SharedComputation,
    limits: ExecutionLimits,
    wait_for_go: bool,
    status: impl Fn() -> String + Send + 'static,
) -> ComputationExitReason {
    let hyperthreaded = computation.lock().expect("computation mutex poisoned").wants_hyperthreading();
    let source: Arc<dyn PerfSource> = Arc::new(DispatcherPerfSource { dispatcher: env.dispatcher.clone(), hyperthreaded });
    let sink: Arc<dyn HeartbeatSink> = Arc::new(DispatcherHeartbeatSink { dispatcher: env.dispatcher.clone() });
    let heartbeat_target = Address {
        session: env.own_address.session,
        node: env.own_address.node,
        computation: Uuid::NIL,
    };
    let monitor = PerformanceMonitor::spawn(source, sink, heartbeat_target, status);

    if let Err(e) = env.dispatcher.start_queueing() {
        error!(error = %e, "dispatcher already started");
    }

    if let Err(e) = env.dispatcher.send_control_direct(ControlMessage::command("ready")) {
        error!(error = %e, "failed to send 'ready' to supervisor");
        monitor.stop_and_join();
        return ComputationExitReason::Disconnected;
    }

    if wait_for_go {
        info!("waiting for 'go' from supervisor");
        if !control.wait_for_go(GO_WAIT_TIMEOUT) {
            warn!("timed out waiting for 'go'");
            env.dispatcher.post_quit();
            monitor.stop_and_join();
            return ComputationExitReason::Timeout;
        }
    }

    let start_result = {
        let mut comp = computation.lock().expect("computation mutex poisoned");
        std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| comp.configure("start")))
    };
    let start_exception = match start_result {
        Ok(Ok(())) => None,
        Ok(Err(msg)) => Some(msg),
        Err(_) => Some("computation panicked during configure(\"start\")".to_string()),
    };

    let dispatcher_reason = if start_exception.is_none() {
        if let Err(e) = env.dispatcher.start_dispatching(&limits, computation.clone()) {
            error!(error = %e, "dispatcher could not enter Dispatching state");
            DispatcherExitReason::MessageError
        } else {
            env.dispatcher.wait_for_exit()
        }
    } else {
        env.dispatcher.post_quit();
        env.dispatcher.wait_for_exit()
    };

    let stop_exception = if start_exception.is_none() {
        let mut comp = computation.lock().expect("computation mutex poisoned");
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| comp.configure("stop"))) {
            Ok(Ok(())) => None,
            Ok(Err(msg)) => Some(msg),
            Err(_) => Some("computation panicked during configure(\"stop\")".to_string()),
        }
    } else {
        None
    };

    monitor.stop_and_join();

    if let Some(msg) = start_exception {
        return ComputationExitReason::StartException(msg);
    }
    if let Some(msg) = stop_exception {
        return ComputationExitReason::StopException(msg);
    }
    match dispatcher_reason {
        DispatcherExitReason::None | DispatcherExitReason::Quit => ComputationExitReason::Normal,
        DispatcherExitReason::Disconnected => ComputationExitReason::Disconnected,
        DispatcherExitReason::MessageError => ComputationExitReason::MessageError,
        DispatcherExitReason::HandlerError => ComputationExitReason::HandlerError,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::chunking::ChunkingConfig;
    use crate::computation::{Computation, MessageOutcome};
    use crate::ipc::{IpcConnection, ShutdownHandle};
    use crate::registry::ContentRegistry;
    use std::os::unix::net::UnixStream;
    use std::sync::Mutex as StdMutex;
    use std::thread;

    struct NoOp;
    impl Computation for NoOp {
        fn on_message(&mut self, _env: &Envelope) -> MessageOutcome {
            MessageOutcome::Handled
        }
    }

    fn build_env() -> (Arc<CompEnvironmentImpl>, Arc<ControlState>, SharedComputation, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        let conn = IpcConnection::new(a.try_clone().unwrap());
        let (reader, writer) = conn.split().unwrap();
        let shutdown = ShutdownHandle::new(a);
        let registry = Arc::new(ContentRegistry::new());

        let session_id = Uuid::generate();
        let comp_id = Uuid::generate();
        let node_id = Uuid::generate();
        let data = serde_json::json!({ "worker": { "compId": comp_id.to_string(), "nodeId": node_id.to_string() } });
        let comp_map = Arc::new(ComputationMap::new(session_id, &data).unwrap());
        let table = RoutingTable::build(comp_id, &comp_map, &serde_json::json!({})).unwrap();
        let addresser = Arc::new(Addresser::new(table));

        let control = Arc::new(ControlState::new(comp_id, comp_map, addresser.clone()));
        let dispatcher = Arc::new(MessageDispatcher::new(
            reader,
            writer,
            shutdown,
            registry,
            control.clone() as Arc<dyn Controlled>,
            ChunkingConfig::default(),
        ));
        let own_address = Address { session: session_id, node: node_id, computation: comp_id };
        let env = Arc::new(CompEnvironmentImpl::new(own_address, "worker", dispatcher, addresser, control.clone()));
        let comp: SharedComputation = Arc::new(StdMutex::new(Box::new(NoOp) as Box<dyn Computation>));
        (env, control, comp, b)
    }

    #[test]
    fn environment_reports_known_keys() {
        let (env, _control, _comp, _peer) = build_env();
        match env.environment("computation.name") {
            EnvironmentValue::String(s) => assert_eq!(s, "worker"),
            _ => panic!("expected a string"),
        }
        assert!(matches!(env.environment("made.up"), EnvironmentValue::Unknown));
    }

    #[test]
    fn wait_for_go_returns_promptly_once_go_arrives() {
        // Exercises the wait/notify logic `run_computation` relies on
        // directly, rather than through `run_computation` itself, which
        // always waits up to the hardcoded 600s `GO_WAIT_TIMEOUT`.
        let (_env, control, _comp, _peer) = build_env();
        let control_for_go = control.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            control_for_go.control_message("go", "");
        });
        assert!(control.wait_for_go(Duration::from_secs(5)));
    }

    #[test]
    fn wait_for_go_times_out_when_nothing_arrives() {
        let (_env, control, _comp, _peer) = build_env();
        assert!(!control.wait_for_go(Duration::from_millis(20)));
    }

    #[test]
    fn send_resolves_through_addresser_and_enqueues() {
        let (env, _control, _comp, mut peer) = build_env();
        let content: Arc<dyn ObjectContent> = Arc::new(ExecutorHeartbeat::default());
        env.dispatcher.start_queueing().unwrap();
        let limits = ExecutionLimits::default();
        let comp: SharedComputation = Arc::new(StdMutex::new(Box::new(NoOp) as Box<dyn Computation>));
        env.dispatcher.start_dispatching(&limits, comp).unwrap();
        env.send(content, SendOptions::default()).unwrap();
        use std::io::Read;
        let mut len_buf = [0u8; 4];
        peer.read_exact(&mut len_buf).unwrap();
        assert!(u32::from_le_bytes(len_buf) > 0);
        env.dispatcher.post_quit();
        env.dispatcher.wait_for_exit();
    }
}
