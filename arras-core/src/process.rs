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

//! Minimal child-process supervision for the local-session supervisor:
//! spawn, signal, and a single reaper thread that waits on every
//! registered child and hands its exit status to the observer that
//! registered it.

use std::collections::HashMap;
use std::process::{Child, Command};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use arras_protocol::Uuid;
use tracing::{error, info, warn};

/// `{program, args, workingDirectory, environment, ...}` from §3,
/// narrowed to what `Process::spawn` actually needs; the resource
/// ceilings (`assignedMb`/`assignedCores`/`enforceMemory`/`enforceCores`)
/// are advisory in this revision (see `ExecutionLimits`, applied inside
/// the worker itself, not by the supervisor).
#[derive(Debug, Clone)]
pub struct SpawnArgs {
    pub program: String,
    pub args: Vec<String>,
    pub working_directory: Option<String>,
    pub environment: HashMap<String, String>,
    pub cleanup_process_group: bool,
}

impl SpawnArgs {
    pub fn new(program: impl Into<String>) -> Self {
        SpawnArgs {
            program: program.into(),
            args: Vec::new(),
            working_directory: None,
            environment: HashMap::new(),
            cleanup_process_group: true,
        }
    }
}

/// Invoked by the reaper thread when a registered child terminates.
pub trait ProcessObserver: Send + Sync {
    fn on_terminate(&self, comp_id: Uuid, expected: bool, raw_exit_code: i32);
}

struct Record {
    child: Child,
    observer: Arc<dyn ProcessObserver>,
    expecting_stop: Arc<Mutex<bool>>,
    group: bool,
}

/// Tracks every process this supervisor has spawned and reaps them as
/// they exit. One reaper thread per `ProcessManager`, mirroring the
/// teacher's single child-watcher thread rather than a thread per
/// child.
pub struct ProcessManager {
    records: Arc<Mutex<HashMap<Uuid, Record>>>,
    reaper: Option<JoinHandle<()>>,
    stop_reaper: Arc<Mutex<bool>>,
}

impl Default for ProcessManager {
    fn default() -> Self {
        ProcessManager::new()
    }
}

impl ProcessManager {
    pub fn new() -> Self {
        let records: Arc<Mutex<HashMap<Uuid, Record>>> = Arc::new(Mutex::new(HashMap::new()));
        let stop_reaper = Arc::new(Mutex::new(false));
        let reap_records = records.clone();
        let reap_stop = stop_reaper.clone();
        let reaper = thread::spawn(move || reaper_loop(reap_records, reap_stop));
        ProcessManager { records, reaper: Some(reaper), stop_reaper }
    }

    /// Spawns `args` under `comp_id`, registering `observer` to be
    /// notified when it exits. `cleanup_process_group` starts the child
    /// in its own session/process group so `terminate` can signal the
    /// whole group rather than a lone pid.
    pub fn spawn(&self, comp_id: Uuid, args: &SpawnArgs, observer: Arc<dyn ProcessObserver>) -> std::io::Result<()> {
        let mut cmd = Command::new(&args.program);
        cmd.args(&args.args);
        if let Some(dir) = &args.working_directory {
            cmd.current_dir(dir);
        }
        cmd.env_clear();
        cmd.envs(&args.environment);

        #[cfg(unix)]
        if args.cleanup_process_group {
            use std::os::unix::process::CommandExt;
            unsafe {
                cmd.pre_exec(|| {
                    nix::unistd::setsid().map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
                    Ok(())
                });
            }
        }

        let child = cmd.spawn()?;
        info!(pid = child.id(), %comp_id, program = %args.program, "spawned worker process");
        let record = Record {
            child,
            observer,
            expecting_stop: Arc::new(Mutex::new(false)),
            group: args.cleanup_process_group,
        };
        self.records.lock().expect("process table mutex poisoned").insert(comp_id, record);
        Ok(())
    }

    /// Sends SIGTERM and marks the termination as expected so the
    /// observer's `expected` flag reflects a supervisor-initiated stop
    /// rather than a crash.
    #[cfg(unix)]
    pub fn stop(&self, comp_id: Uuid) {
        self.signal(comp_id, nix::sys::signal::Signal::SIGTERM, true);
    }

    #[cfg(unix)]
    pub fn pause(&self, comp_id: Uuid) {
        self.signal(comp_id, nix::sys::signal::Signal::SIGSTOP, false);
    }

    #[cfg(unix)]
    pub fn resume(&self, comp_id: Uuid) {
        self.signal(comp_id, nix::sys::signal::Signal::SIGCONT, false);
    }

    #[cfg(unix)]
    fn signal(&self, comp_id: Uuid, sig: nix::sys::signal::Signal, expected: bool) {
        let records = self.records.lock().expect("process table mutex poisoned");
        let Some(record) = records.get(&comp_id) else {
            warn!(%comp_id, "signal requested for an unregistered process");
            return;
        };
        if expected {
            *record.expecting_stop.lock().expect("expecting-stop mutex poisoned") = true;
        }
        let pid = nix::unistd::Pid::from_raw(record.child.id() as i32);
        let target = if record.group { nix::unistd::Pid::from_raw(-pid.as_raw()) } else { pid };
        if let Err(e) = nix::sys::signal::kill(target, sig) {
            error!(%comp_id, signal = ?sig, error = %e, "failed to signal child process");
        }
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("process table mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for ProcessManager {
    fn drop(&mut self) {
        *self.stop_reaper.lock().expect("reaper stop flag mutex poisoned") = true;
        if let Some(h) = self.reaper.take() {
            let _ = h.join();
        }
    }
}

fn reaper_loop(records: Arc<Mutex<HashMap<Uuid, Record>>>, stop: Arc<Mutex<bool>>) {
    loop {
        if *stop.lock().expect("reaper stop flag mutex poisoned") {
            return;
        }
        let mut finished = Vec::new();
        {
            let mut table = records.lock().expect("process table mutex poisoned");
            for (comp_id, record) in table.iter_mut() {
                match record.child.try_wait() {
                    Ok(Some(status)) => {
                        let expected = *record.expecting_stop.lock().expect("expecting-stop mutex poisoned");
                        let raw = status.code().unwrap_or(-1);
                        finished.push((*comp_id, record.observer.clone(), expected, raw));
                    }
                    Ok(None) => {}
                    Err(e) => {
                        error!(%comp_id, error = %e, "failed to poll child process status");
                    }
                }
            }
            for (comp_id, ..) in &finished {
                table.remove(comp_id);
            }
        }
        for (comp_id, observer, expected, raw) in finished {
            observer.on_terminate(comp_id, expected, raw);
        }
        thread::sleep(Duration::from_millis(50));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

    struct Recorder {
        terminated: AtomicBool,
        expected: AtomicBool,
        code: AtomicI32,
    }
    impl ProcessObserver for Recorder {
        fn on_terminate(&self, _comp_id: Uuid, expected: bool, raw_exit_code: i32) {
            self.terminated.store(true, Ordering::SeqCst);
            self.expected.store(expected, Ordering::SeqCst);
            self.code.store(raw_exit_code, Ordering::SeqCst);
        }
    }

    #[test]
    fn spawned_process_is_reaped_and_observed() {
        let manager = ProcessManager::new();
        let observer = Arc::new(Recorder { terminated: AtomicBool::new(false), expected: AtomicBool::new(true), code: AtomicI32::new(-1) });
        let args = SpawnArgs::new("/bin/true");
        let comp_id = Uuid::generate();
        manager.spawn(comp_id, &args, observer.clone()).unwrap();

        for _ in 0..40 {
            if observer.terminated.load(Ordering::SeqCst) {
                break;
            }
            thread::sleep(Duration::from_millis(50));
        }
        assert!(observer.terminated.load(Ordering::SeqCst));
        assert_eq!(observer.code.load(Ordering::SeqCst), 0);
    }
}
