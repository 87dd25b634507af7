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

//! A small mutexed FIFO shared between the dispatcher's reader and
//! handler threads. Once shut down, every blocked and future `push`/`pop`
//! returns `Err(ShutdownError)` instead of hanging forever.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::error::ShutdownError;

struct State<T> {
    items: VecDeque<T>,
    shutdown: bool,
}

pub struct ThreadsafeQueue<T> {
    label: String,
    state: Mutex<State<T>>,
    not_empty: Condvar,
    empty: Condvar,
}

impl<T> ThreadsafeQueue<T> {
    pub fn new(label: impl Into<String>) -> Self {
        ThreadsafeQueue {
            label: label.into(),
            state: Mutex::new(State { items: VecDeque::new(), shutdown: false }),
            not_empty: Condvar::new(),
            empty: Condvar::new(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn push(&self, item: T) -> Result<(), ShutdownError> {
        let mut state = self.state.lock().expect("queue mutex poisoned");
        if state.shutdown {
            return Err(ShutdownError);
        }
        state.items.push_back(item);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Waits up to `timeout` for an item. `None` blocks indefinitely.
    /// Returns `Ok(None)` on timeout, `Ok(Some(item))` when one arrives.
    pub fn pop(&self, timeout: Option<Duration>) -> Result<Option<T>, ShutdownError> {
        let mut state = self.state.lock().expect("queue mutex poisoned");
        if state.shutdown && state.items.is_empty() {
            return Err(ShutdownError);
        }
        match timeout {
            Some(t) => {
                let (mut guard, wait_res) = self
                    .not_empty
                    .wait_timeout_while(state, t, |s| s.items.is_empty() && !s.shutdown)
                    .expect("queue mutex poisoned");
                if guard.items.is_empty() {
                    if guard.shutdown {
                        return Err(ShutdownError);
                    }
                    debug_assert!(wait_res.timed_out());
                    return Ok(None);
                }
                let item = guard.items.pop_front();
                if guard.items.is_empty() {
                    self.empty.notify_all();
                }
                Ok(item)
            }
            None => {
                state = self
                    .not_empty
                    .wait_while(state, |s| s.items.is_empty() && !s.shutdown)
                    .expect("queue mutex poisoned");
                if state.items.is_empty() && state.shutdown {
                    return Err(ShutdownError);
                }
                let item = state.items.pop_front();
                if state.items.is_empty() {
                    self.empty.notify_all();
                }
                Ok(item)
            }
        }
    }

    /// Blocks until the queue becomes empty, shutdown occurs, or
    /// `timeout` expires. Returns `true` if it returned because the
    /// queue was empty.
    pub fn wait_until_empty(&self, timeout: Option<Duration>) -> Result<bool, ShutdownError> {
        let state = self.state.lock().expect("queue mutex poisoned");
        if state.shutdown {
            return Err(ShutdownError);
        }
        match timeout {
            Some(t) => {
                let (guard, wait_res) =
                    self.empty.wait_timeout_while(state, t, |s| !s.items.is_empty() && !s.shutdown).expect("queue mutex poisoned");
                if guard.shutdown {
                    return Err(ShutdownError);
                }
                Ok(!wait_res.timed_out())
            }
            None => {
                let guard = self.empty.wait_while(state, |s| !s.items.is_empty() && !s.shutdown).expect("queue mutex poisoned");
                if guard.shutdown {
                    return Err(ShutdownError);
                }
                Ok(true)
            }
        }
    }

    pub fn shutdown(&self) {
        let mut state = self.state.lock().expect("queue mutex poisoned");
        state.shutdown = true;
        drop(state);
        self.not_empty.notify_all();
        self.empty.notify_all();
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("queue mutex poisoned").items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn push_then_pop_preserves_order() {
        let q = ThreadsafeQueue::new("test");
        q.push(1).unwrap();
        q.push(2).unwrap();
        assert_eq!(q.pop(None).unwrap(), Some(1));
        assert_eq!(q.pop(None).unwrap(), Some(2));
    }

    #[test]
    fn pop_times_out_when_empty() {
        let q: ThreadsafeQueue<i32> = ThreadsafeQueue::new("test");
        let got = q.pop(Some(Duration::from_millis(10))).unwrap();
        assert_eq!(got, None);
    }

    #[test]
    fn shutdown_wakes_blocked_pop() {
        let q = Arc::new(ThreadsafeQueue::<i32>::new("test"));
        let q2 = q.clone();
        let handle = thread::spawn(move || q2.pop(None));
        thread::sleep(Duration::from_millis(20));
        q.shutdown();
        let result = handle.join().unwrap();
        assert!(matches!(result, Err(ShutdownError)));
    }

    #[test]
    fn push_after_shutdown_fails() {
        let q = ThreadsafeQueue::new("test");
        q.shutdown();
        assert!(matches!(q.push(1), Err(ShutdownError)));
    }

    #[test]
    fn wait_until_empty_returns_true_once_drained() {
        let q = Arc::new(ThreadsafeQueue::new("test"));
        q.push(1).unwrap();
        let q2 = q.clone();
        let handle = thread::spawn(move || q2.wait_until_empty(Some(Duration::from_secs(1))));
        thread::sleep(Duration::from_millis(10));
        q.pop(None).unwrap();
        assert_eq!(handle.join().unwrap().unwrap(), true);
    }
}
