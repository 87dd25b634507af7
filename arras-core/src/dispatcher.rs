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

//! The worker's I/O fabric: two `ThreadsafeQueue`s and a reader/writer/
//! handler thread that drain them, plus the control-message and
//! chunking filters sitting directly on the transport. A fourth,
//! "master" role exists in the original design purely to run the state
//! machine and act as the join barrier; here that role is folded into
//! the state mutex itself and `wait_for_exit`, since every transition
//! is already serialized through `Inner::state` and nothing is gained
//! by giving it its own OS thread.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use arras_protocol::{
    read_envelope, write_envelope, ControlMessage, Envelope, MessageChunk, MessageContent,
};
use tracing::{debug, error, warn};

use crate::chunking::{chunk_envelope, ChunkingConfig, UnchunkerTable};
use crate::computation::{MessageOutcome, SharedComputation};
use crate::control_filter::{filter_control_message, Controlled};
use crate::error::InternalError;
use crate::ipc::{read_frame, write_frame, IpcReader, IpcWriter, ShutdownHandle};
use crate::limits::ExecutionLimits;
use crate::queue::ThreadsafeQueue;
use crate::registry::ContentRegistry;

/// Default handler idle tick: chosen for latency, not throughput (see
/// the original design notes). Exposed as a constructor parameter so a
/// computation that only needs coarse idle callbacks can raise it.
pub const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_micros(40);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    NotStarted,
    Queueing,
    Dispatching,
    Exiting,
    Exited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherExitReason {
    None,
    Quit,
    Disconnected,
    MessageError,
    HandlerError,
}

/// Raised by `start_queueing`/`start_dispatching` when called from the
/// wrong state. The original reports this as a programming-error
/// exception; it is not part of the normal error taxonomy in §7.
#[derive(Debug, thiserror::Error)]
#[error("dispatcher state transition not valid from {from:?}")]
pub struct StateTransitionError {
    pub from: DispatcherState,
}

struct Inner {
    state: Mutex<DispatcherState>,
    state_cv: Condvar,
    exit_reason: Mutex<DispatcherExitReason>,
    sent: AtomicU64,
    received: AtomicU64,
    inbound: ThreadsafeQueue<Envelope>,
    outbound: ThreadsafeQueue<Envelope>,
    reader: Mutex<IpcReader>,
    writer: Mutex<IpcWriter>,
    shutdown: ShutdownHandle,
    registry: Arc<ContentRegistry>,
    controlled: Arc<dyn Controlled>,
    chunking: ChunkingConfig,
    idle_interval: Duration,
}

impl Inner {
    /// First-write-wins: only the first call among `post_error`/`post_quit`
    /// records a reason. Always idempotent in its side effects.
    fn post_reason(&self, reason: DispatcherExitReason) {
        {
            let mut current = self.exit_reason.lock().expect("exit reason mutex poisoned");
            if *current == DispatcherExitReason::None {
                *current = reason;
            }
        }
        self.inbound.shutdown();
        self.outbound.shutdown();
        self.shutdown.shutdown();
        let mut state = self.state.lock().expect("dispatcher state mutex poisoned");
        if !matches!(*state, DispatcherState::Exiting | DispatcherState::Exited) {
            *state = DispatcherState::Exiting;
            self.state_cv.notify_all();
        }
    }

    fn heartbeat_class_id(&self) -> arras_protocol::ClassId {
        arras_protocol::executor_heartbeat_class_id()
    }
}

/// Runs the worker's message pipeline over one IPC connection. Owns
/// both halves of the transport and the in/outbound queues; a
/// `CompEnvironmentImpl` sits above this to stamp addresses and drive
/// the plug-in lifecycle.
pub struct MessageDispatcher {
    inner: Arc<Inner>,
    reader_thread: Mutex<Option<JoinHandle<()>>>,
    writer_thread: Mutex<Option<JoinHandle<()>>>,
    handler_thread: Mutex<Option<JoinHandle<()>>>,
}

impl MessageDispatcher {
    pub fn new(
        reader: IpcReader,
        writer: IpcWriter,
        shutdown: ShutdownHandle,
        registry: Arc<ContentRegistry>,
        controlled: Arc<dyn Controlled>,
        chunking: ChunkingConfig,
    ) -> Self {
        MessageDispatcher {
            inner: Arc::new(Inner {
                state: Mutex::new(DispatcherState::NotStarted),
                state_cv: Condvar::new(),
                exit_reason: Mutex::new(DispatcherExitReason::None),
                sent: AtomicU64::new(0),
                received: AtomicU64::new(0),
                inbound: ThreadsafeQueue::new("dispatcher-inbound"),
                outbound: ThreadsafeQueue::new("dispatcher-outbound"),
                reader: Mutex::new(reader),
                writer: Mutex::new(writer),
                shutdown,
                registry,
                controlled,
                chunking,
                idle_interval: DEFAULT_IDLE_INTERVAL,
            }),
            reader_thread: Mutex::new(None),
            writer_thread: Mutex::new(None),
            handler_thread: Mutex::new(None),
        }
    }

    pub fn with_idle_interval(mut self, interval: Duration) -> Self {
        Arc::get_mut(&mut self.inner).expect("dispatcher not yet shared").idle_interval = interval;
        self
    }

    pub fn state(&self) -> DispatcherState {
        *self.inner.state.lock().expect("dispatcher state mutex poisoned")
    }

    /// Enqueues `env` for the writer thread to drain. Non-blocking
    /// modulo the queue's own push cost.
    pub fn send(&self, env: Envelope) -> Result<(), crate::error::ShutdownError> {
        self.inner.outbound.push(env)
    }

    /// Writes a control message directly to the transport, bypassing
    /// the outbound queue and writer thread. Needed because `ready` is
    /// sent during `Queueing`, before the writer thread exists: if it
    /// went through the queue it would sit unflushed until
    /// `start_dispatching`, deadlocking against a supervisor that is
    /// waiting on `ready` before it will ever send `go`.
    pub fn send_control_direct(&self, msg: ControlMessage) -> io::Result<()> {
        let env = Envelope::new(Arc::new(msg) as Arc<dyn arras_protocol::ObjectContent>);
        let mut buf = Vec::new();
        write_envelope(&env, &mut buf)?;
        let mut w = self.inner.writer.lock().expect("writer mutex poisoned");
        write_frame(&mut *w, &buf)
    }

    pub fn sent_count(&self) -> u64 {
        self.inner.sent.load(Ordering::Relaxed)
    }

    pub fn received_count(&self) -> u64 {
        self.inner.received.load(Ordering::Relaxed)
    }

    /// Starts the reader thread only, so the plug-in can observe
    /// startup state before any handler runs.
    pub fn start_queueing(&self) -> Result<(), StateTransitionError> {
        {
            let mut state = self.inner.state.lock().expect("dispatcher state mutex poisoned");
            if *state != DispatcherState::NotStarted {
                return Err(StateTransitionError { from: *state });
            }
            *state = DispatcherState::Queueing;
        }
        let inner = self.inner.clone();
        *self.reader_thread.lock().expect("reader thread handle mutex poisoned") =
            Some(thread::spawn(move || reader_loop(inner)));
        Ok(())
    }

    /// Applies execution limits, then starts the writer and handler
    /// threads and transitions to `Dispatching`.
    pub fn start_dispatching(
        &self,
        limits: &ExecutionLimits,
        computation: SharedComputation,
    ) -> Result<(), StateTransitionError> {
        {
            let mut state = self.inner.state.lock().expect("dispatcher state mutex poisoned");
            if *state != DispatcherState::Queueing {
                return Err(StateTransitionError { from: *state });
            }
            *state = DispatcherState::Dispatching;
        }
        limits.apply();

        let inner = self.inner.clone();
        *self.writer_thread.lock().expect("writer thread handle mutex poisoned") =
            Some(thread::spawn(move || writer_loop(inner)));

        let inner = self.inner.clone();
        *self.handler_thread.lock().expect("handler thread handle mutex poisoned") =
            Some(thread::spawn(move || handler_loop(inner, computation)));
        Ok(())
    }

    /// Idempotent. Marks the exit reason `Quit` if nothing else has
    /// already claimed the reason, and shuts everything down.
    pub fn post_quit(&self) {
        self.inner.post_reason(DispatcherExitReason::Quit);
    }

    fn post_error(&self, reason: DispatcherExitReason) {
        self.inner.post_reason(reason);
    }

    /// Blocks until the dispatcher reaches `Exiting`, joins every
    /// spawned thread, transitions to `Exited`, and returns the
    /// recorded exit reason.
    pub fn wait_for_exit(&self) -> DispatcherExitReason {
        {
            let state = self.inner.state.lock().expect("dispatcher state mutex poisoned");
            let _state = self
                .inner
                .state_cv
                .wait_while(state, |s| !matches!(*s, DispatcherState::Exiting | DispatcherState::Exited))
                .expect("dispatcher state mutex poisoned");
        }
        if let Some(h) = self.reader_thread.lock().expect("reader thread handle mutex poisoned").take() {
            let _ = h.join();
        }
        if let Some(h) = self.writer_thread.lock().expect("writer thread handle mutex poisoned").take() {
            let _ = h.join();
        }
        if let Some(h) = self.handler_thread.lock().expect("handler thread handle mutex poisoned").take() {
            let _ = h.join();
        }
        let mut state = self.inner.state.lock().expect("dispatcher state mutex poisoned");
        *state = DispatcherState::Exited;
        *self.inner.exit_reason.lock().expect("exit reason mutex poisoned")
    }
}

fn reader_loop(inner: Arc<Inner>) {
    let mut unchunker = UnchunkerTable::new();
    loop {
        let frame = {
            let mut r = inner.reader.lock().expect("reader mutex poisoned");
            read_frame(&mut *r)
        };
        let bytes = match frame {
            Ok(Some(b)) => b,
            Ok(None) => {
                debug!("inbound transport closed cleanly");
                inner.post_reason(DispatcherExitReason::Disconnected);
                return;
            }
            Err(e) => {
                // Also reached when our own `shutdown()` unblocks this read;
                // `post_reason` is idempotent so re-posting here is harmless.
                debug!(error = %e, "inbound transport read error or shutdown");
                inner.post_reason(DispatcherExitReason::Disconnected);
                return;
            }
        };

        let env = match read_envelope(&bytes, inner.registry.as_ref()) {
            Ok(env) => env,
            Err(e) => {
                error!(error = %e, "malformed envelope on inbound transport");
                inner.post_reason(DispatcherExitReason::MessageError);
                return;
            }
        };

        let env = match reassemble_if_chunk(&inner, &mut unchunker, env) {
            Ok(Some(env)) => env,
            Ok(None) => continue,
            Err(e) => {
                error!(error = %e, "chunk reassembly failed");
                inner.post_reason(DispatcherExitReason::MessageError);
                return;
            }
        };

        match filter_control_message(env, inner.controlled.as_ref()) {
            None => continue,
            Some(env) => {
                if inner.inbound.push(env).is_err() {
                    return;
                }
            }
        }
    }
}

/// Feeds a chunk envelope into the unchunker table; returns the
/// reassembled envelope once complete, `None` while more chunks are
/// pending, and the original envelope unchanged if it wasn't a chunk.
fn reassemble_if_chunk(
    inner: &Inner,
    unchunker: &mut UnchunkerTable,
    env: Envelope,
) -> Result<Option<Envelope>, InternalError> {
    let MessageContent::Object(content) = &env.content else {
        return Ok(Some(env));
    };
    let Some(chunk) = content.as_any().downcast_ref::<MessageChunk>() else {
        return Ok(Some(env));
    };
    let chunk = chunk.clone();
    match unchunker.add_chunk(chunk)? {
        None => Ok(None),
        Some((class_id, version, routing_name, instance_id, source_id, bytes)) => {
            let content = inner
                .registry
                .create(class_id, version, &bytes)
                .ok_or_else(|| InternalError::new("reassembled chunk's inner class is not registered"))?;
            let mut reassembled = Envelope::new(content);
            reassembled.metadata = env.metadata.clone();
            reassembled.metadata.instance_id = instance_id;
            reassembled.metadata.source_id = source_id;
            reassembled.metadata.routing_name = routing_name;
            reassembled.to = env.to;
            Ok(Some(reassembled))
        }
    }
}

fn writer_loop(inner: Arc<Inner>) {
    loop {
        let env = match inner.outbound.pop(None) {
            Ok(Some(env)) => env,
            Ok(None) => continue,
            Err(_) => return,
        };
        let is_heartbeat = env.class_id() == inner.heartbeat_class_id();
        match chunk_envelope(&env, &inner.chunking) {
            Ok(frames) => {
                for frame_env in frames {
                    let mut buf = Vec::new();
                    if let Err(e) = write_envelope(&frame_env, &mut buf) {
                        error!(error = %e, "failed to serialize outbound envelope");
                        inner.post_reason(DispatcherExitReason::MessageError);
                        return;
                    }
                    let write_result = {
                        let mut w = inner.writer.lock().expect("writer mutex poisoned");
                        write_frame(&mut *w, &buf)
                    };
                    if let Err(e) = write_result {
                        warn!(error = %e, "outbound transport write error");
                        inner.post_reason(DispatcherExitReason::Disconnected);
                        return;
                    }
                }
                if !is_heartbeat {
                    inner.sent.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(e) => {
                error!(error = %e, "failed to chunk outbound envelope");
                inner.post_reason(DispatcherExitReason::MessageError);
                return;
            }
        }
    }
}

fn handler_loop(inner: Arc<Inner>, computation: SharedComputation) {
    loop {
        match inner.inbound.pop(Some(inner.idle_interval)) {
            Ok(Some(env)) => {
                let mut comp = computation.lock().expect("computation mutex poisoned");
                let outcome =
                    std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| comp.on_message(&env)));
                match outcome {
                    Ok(MessageOutcome::Handled) => {
                        if env.class_id() != inner.heartbeat_class_id() {
                            inner.received.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    Ok(MessageOutcome::Invalid) => {
                        warn!("computation rejected a message as invalid");
                        drop(comp);
                        inner.post_reason(DispatcherExitReason::MessageError);
                        return;
                    }
                    Err(_) => {
                        error!("computation panicked while handling a message");
                        drop(comp);
                        inner.post_reason(DispatcherExitReason::HandlerError);
                        return;
                    }
                }
            }
            Ok(None) => {
                let mut comp = computation.lock().expect("computation mutex poisoned");
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| comp.on_idle()));
                if result.is_err() {
                    error!("computation panicked in on_idle");
                    drop(comp);
                    inner.post_reason(DispatcherExitReason::HandlerError);
                    return;
                }
            }
            Err(_) => return,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use arras_protocol::{NoContentFactory, ObjectContent};
    use std::any::Any;
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    struct Recorder;
    impl Controlled for Recorder {
        fn control_message(&self, _command: &str, _data: &str) {}
    }

    #[derive(Clone)]
    struct Ping(String);
    impl ObjectContent for Ping {
        fn class_id(&self) -> arras_protocol::ClassId {
            arras_protocol::Uuid::parse("33333333-3333-3333-3333-333333333333").unwrap()
        }
        fn class_version(&self) -> u32 {
            0
        }
        fn serialize(&self, w: &mut dyn Write) -> std::io::Result<()> {
            let bytes = self.0.as_bytes();
            arras_protocol::WireWrite::write_wire(&(bytes.len() as u32), w)?;
            w.write_all(bytes)
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn pair() -> (MessageDispatcher, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        let conn = crate::ipc::IpcConnection::new(a.try_clone().unwrap());
        let (reader, writer) = conn.split().unwrap();
        let shutdown = ShutdownHandle::new(a);
        let registry = Arc::new(ContentRegistry::new());
        let controlled: Arc<dyn Controlled> = Arc::new(Recorder);
        let dispatcher =
            MessageDispatcher::new(reader, writer, shutdown, registry, controlled, ChunkingConfig::default());
        (dispatcher, b)
    }

    #[test]
    fn starts_in_not_started_state() {
        let (dispatcher, _peer) = pair();
        assert_eq!(dispatcher.state(), DispatcherState::NotStarted);
    }

    #[test]
    fn start_dispatching_before_queueing_fails() {
        let (dispatcher, _peer) = pair();
        let limits = ExecutionLimits::default();
        let comp: SharedComputation = Arc::new(Mutex::new(Box::new(NoOpComputation) as Box<dyn crate::computation::Computation>));
        assert!(dispatcher.start_dispatching(&limits, comp).is_err());
    }

    #[test]
    fn post_quit_unblocks_wait_for_exit() {
        let (dispatcher, _peer) = pair();
        dispatcher.start_queueing().unwrap();
        dispatcher.post_quit();
        let reason = dispatcher.wait_for_exit();
        assert_eq!(reason, DispatcherExitReason::Quit);
    }

    #[test]
    fn disconnect_is_detected_when_peer_drops() {
        let (dispatcher, peer) = pair();
        dispatcher.start_queueing().unwrap();
        drop(peer);
        let reason = dispatcher.wait_for_exit();
        assert_eq!(reason, DispatcherExitReason::Disconnected);
    }

    struct NoOpComputation;
    impl crate::computation::Computation for NoOpComputation {
        fn on_message(&mut self, _env: &Envelope) -> MessageOutcome {
            MessageOutcome::Handled
        }
    }

    #[test]
    fn send_before_dispatching_buffers_until_writer_starts() {
        let (dispatcher, peer) = pair();
        dispatcher.start_queueing().unwrap();
        let content: Arc<dyn ObjectContent> = Arc::new(Ping("hi".to_string()));
        dispatcher.send(Envelope::new(content)).unwrap();
        let limits = ExecutionLimits::default();
        let comp: SharedComputation = Arc::new(Mutex::new(Box::new(NoOpComputation) as Box<dyn crate::computation::Computation>));
        dispatcher.start_dispatching(&limits, comp).unwrap();

        let mut peer = peer;
        let frame = read_frame(&mut peer).unwrap();
        assert!(frame.is_some());
        dispatcher.post_quit();
        dispatcher.wait_for_exit();
    }

    #[test]
    fn unregistered_inbound_envelope_is_not_fatal() {
        // read_envelope with NoContentFactory still succeeds (opaque content);
        // this just documents that an unknown class id alone isn't a MessageError.
        let content: Arc<dyn ObjectContent> = Arc::new(Ping("x".to_string()));
        let env = Envelope::new(content);
        let mut buf = Vec::new();
        write_envelope(&env, &mut buf).unwrap();
        let back = read_envelope(&buf, &NoContentFactory).unwrap();
        assert!(matches!(back.content, MessageContent::Opaque { .. }));
    }
}
