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

//! Emits one `ExecutorHeartbeat` every 5 seconds carrying CPU, memory,
//! thread, and message-count telemetry. The 60-second rolling figures
//! are kept in a 12-bucket ring so each tick only has to subtract the
//! bucket it's about to overwrite, not rescan 60 seconds of history.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use arras_protocol::{ArrasTime, Envelope, ExecutorHeartbeat};
use crossbeam_channel::{bounded, Sender};
use tracing::{debug, warn};

const TICK: Duration = Duration::from_secs(5);
const BUCKETS: usize = 12; // 12 * 5s = 60s of rolling history

/// Counters the monitor samples every tick. Implemented by the
/// dispatcher (sent/received) and read-only process stats on Linux.
pub trait PerfSource: Send + Sync {
    fn sent_messages(&self) -> u64;
    fn received_messages(&self) -> u64;
    fn hyperthreaded(&self) -> bool;
}

/// Where a completed heartbeat envelope should be delivered; normally
/// the dispatcher's outbound queue via `MessageDispatcher::send`.
pub trait HeartbeatSink: Send + Sync {
    fn send_heartbeat(&self, env: Envelope);
}

#[derive(Default)]
struct Ring {
    buckets: [u64; BUCKETS],
    index: usize,
    sum: u64,
}

impl Ring {
    /// Records the delta since the previous tick and returns the new
    /// 60-second rolling sum.
    fn record(&mut self, delta: u64) -> u64 {
        self.sum -= self.buckets[self.index];
        self.buckets[self.index] = delta;
        self.sum += delta;
        self.index = (self.index + 1) % BUCKETS;
        self.sum
    }
}

struct State {
    sent_ring: Ring,
    received_ring: Ring,
    cpu_ring_hundredths: Ring,
    last_sent: u64,
    last_received: u64,
    last_cpu_hundredths: u64,
}

pub struct PerformanceMonitor {
    stop: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl PerformanceMonitor {
    /// Spawns the monitor thread. `status` is an optional free-form
    /// string attached to every heartbeat (e.g. the current lifecycle
    /// stage), read fresh on each tick via the supplied closure.
    pub fn spawn<F>(source: Arc<dyn PerfSource>, sink: Arc<dyn HeartbeatSink>, from: arras_protocol::Address, status: F) -> Self
    where
        F: Fn() -> String + Send + 'static,
    {
        let (tx, rx) = bounded(1);
        let handle = thread::spawn(move || {
            let mut state = State {
                sent_ring: Ring::default(),
                received_ring: Ring::default(),
                cpu_ring_hundredths: Ring::default(),
                last_sent: 0,
                last_received: 0,
                last_cpu_hundredths: 0,
            };
            let start = std::time::Instant::now();
            loop {
                match rx.recv_timeout(TICK) {
                    Ok(()) => return,
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                        let hb = build_heartbeat(&mut state, source.as_ref(), start.elapsed(), status());
                        let mut env = Envelope::new(Arc::new(hb) as Arc<dyn arras_protocol::ObjectContent>);
                        env.to = vec![from];
                        sink.send_heartbeat(env);
                    }
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
                }
            }
        });
        PerformanceMonitor { stop: tx, handle: Some(handle) }
    }

    pub fn stop_and_join(mut self) {
        let _ = self.stop.send(());
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for PerformanceMonitor {
    fn drop(&mut self) {
        if self.handle.is_some() {
            let _ = self.stop.send(());
            if let Some(h) = self.handle.take() {
                let _ = h.join();
            }
        }
    }
}

fn build_heartbeat(state: &mut State, source: &dyn PerfSource, elapsed: Duration, status: String) -> ExecutorHeartbeat {
    let sent_total = source.sent_messages();
    let received_total = source.received_messages();
    let sent_5s = sent_total.saturating_sub(state.last_sent);
    let received_5s = received_total.saturating_sub(state.last_received);
    state.last_sent = sent_total;
    state.last_received = received_total;
    let sent_60s = state.sent_ring.record(sent_5s);
    let received_60s = state.received_ring.record(received_5s);

    let (memory_bytes, threads, cpu_hundredths_total) = read_proc_stats();
    let cpu_5s_hundredths = cpu_hundredths_total.saturating_sub(state.last_cpu_hundredths);
    state.last_cpu_hundredths = cpu_hundredths_total;
    let cpu_60s_hundredths = state.cpu_ring_hundredths.record(cpu_5s_hundredths);

    let _ = elapsed; // reserved for a future wall-clock cross-check against transmit_secs
    let now = ArrasTime::now();
    ExecutorHeartbeat {
        transmit_secs: now.seconds as u64,
        transmit_micros: now.micros as u32,
        threads,
        cpu_usage_5s: cpu_5s_hundredths as f32 / 100.0,
        cpu_usage_60s: cpu_60s_hundredths as f32 / 100.0,
        cpu_usage_total_secs: cpu_hundredths_total as f32 / 100.0,
        hyperthreaded: source.hyperthreaded(),
        memory_usage_bytes: memory_bytes,
        sent_messages_5s: sent_5s,
        sent_messages_60s: sent_60s,
        sent_messages_total: sent_total,
        received_messages_5s: received_5s,
        received_messages_60s: received_60s,
        received_messages_total: received_total,
        status,
    }
}

/// Reads RSS (bytes), thread count, and cumulative cpu-hundredths from
/// `/proc/self/{statm,stat}` on Linux. Falls back to zeros elsewhere or
/// on any parse failure, matching the original's "best-effort"
/// telemetry contract (a monitor that can't read `/proc` should not
/// take the worker down).
#[cfg(target_os = "linux")]
fn read_proc_stats() -> (u64, u16, u64) {
    let page_size = 4096u64;
    let memory_bytes = std::fs::read_to_string("/proc/self/statm")
        .ok()
        .and_then(|s| s.split_whitespace().nth(1).map(|p| p.to_string()))
        .and_then(|rss_pages| rss_pages.parse::<u64>().ok())
        .map(|pages| pages * page_size)
        .unwrap_or(0);

    let stat = std::fs::read_to_string("/proc/self/stat").unwrap_or_default();
    // Fields after the process name in parens are space-separated; the
    // name itself may contain spaces, so split on the closing paren.
    let after_name = stat.rsplit_once(')').map(|(_, rest)| rest).unwrap_or("");
    let fields: Vec<&str> = after_name.split_whitespace().collect();
    // utime is field 14 overall (index 11 after the 2 consumed + comm),
    // i.e. index 11 in `fields` (0-based after state at index 0).
    let utime: u64 = fields.get(11).and_then(|s| s.parse().ok()).unwrap_or(0);
    let stime: u64 = fields.get(12).and_then(|s| s.parse().ok()).unwrap_or(0);
    let clk_tck = 100u64; // sysconf(_SC_CLK_TCK) is 100 on every Linux target we run on
    let cpu_hundredths = (utime + stime) * (100 / clk_tck.max(1));

    let threads: u16 = fields.get(17).and_then(|s| s.parse().ok()).unwrap_or(1);

    if memory_bytes == 0 && threads == 1 {
        debug!("perf monitor could not read /proc/self stats, reporting zeros");
    }
    (memory_bytes, threads, cpu_hundredths)
}

#[cfg(not(target_os = "linux"))]
fn read_proc_stats() -> (u64, u16, u64) {
    warn!("perf monitor has no /proc source on this platform, reporting zeros");
    (0, 1, 0)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    struct FixedSource {
        sent: AtomicU64,
        received: AtomicU64,
    }
    impl PerfSource for FixedSource {
        fn sent_messages(&self) -> u64 {
            self.sent.load(Ordering::Relaxed)
        }
        fn received_messages(&self) -> u64 {
            self.received.load(Ordering::Relaxed)
        }
        fn hyperthreaded(&self) -> bool {
            false
        }
    }

    struct Capture(Mutex<Vec<Envelope>>);
    impl HeartbeatSink for Capture {
        fn send_heartbeat(&self, env: Envelope) {
            self.0.lock().unwrap().push(env);
        }
    }

    #[test]
    fn ring_tracks_rolling_sum_over_its_window() {
        let mut ring = Ring::default();
        for _ in 0..BUCKETS {
            ring.record(1);
        }
        assert_eq!(ring.sum, BUCKETS as u64);
        // one more tick evicts the oldest bucket but total stays bounded
        let sum = ring.record(2);
        assert_eq!(sum, BUCKETS as u64 - 1 + 2);
    }

    #[test]
    fn monitor_can_be_stopped_promptly() {
        let source = Arc::new(FixedSource { sent: AtomicU64::new(0), received: AtomicU64::new(0) });
        let sink = Arc::new(Capture(Mutex::new(Vec::new())));
        let monitor = PerformanceMonitor::spawn(source, sink, arras_protocol::Address::NULL, || String::new());
        monitor.stop_and_join();
    }
}
