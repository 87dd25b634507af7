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

//! The plug-in boundary. A computation is a Rust type implementing
//! `Computation`, resolved at worker startup by name against a
//! process-wide registry rather than loaded as a dynamic library.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use arras_protocol::Envelope;
use lazy_static::lazy_static;

use crate::environment::CompEnvironmentImpl;
use crate::error::ComputationLoadError;
use crate::registry::ContentRegistry;

/// Outcome of handing a message to a computation's `on_message`. A
/// plug-in returning `Invalid` is treated the same as a wire-format
/// error: it becomes a `DispatchError::MessageFormat`-flavored exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    Handled,
    Invalid,
}

/// Implemented by a loaded plug-in. `environment` hands the computation
/// a handle it uses to `send` further messages and query read-only
/// environment keys; it is the same handle passed to every other
/// method, so implementations are free to stash a clone of it.
pub trait Computation: Send {
    /// Called once, before `configure("start")`, with the handle this
    /// computation should stash and use for every `send` thereafter.
    fn bind_environment(&mut self, env: Arc<CompEnvironmentImpl>) {
        let _ = env;
    }

    /// Called once before dispatch begins, so the computation can add
    /// its own `ObjectContent` types to the wire-format registry. The
    /// built-in chunk/control/heartbeat types are already present.
    fn register_content(&self, registry: &ContentRegistry) {
        let _ = registry;
    }

    /// `configure("start")` / `configure("stop")` bracket dispatch.
    /// A returned `Err` is recorded as `StartException`/`StopException`
    /// by the environment orchestration and does not panic the thread.
    fn configure(&mut self, stage: &str) -> Result<(), String> {
        let _ = stage;
        Ok(())
    }

    fn on_message(&mut self, env: &Envelope) -> MessageOutcome;

    /// Invoked by the handler thread whenever the idle interval elapses
    /// with nothing in the inbound queue.
    fn on_idle(&mut self) {}

    /// Hyperthreading is disabled by default unless a plug-in opts in.
    fn wants_hyperthreading(&self) -> bool {
        false
    }
}

type Factory = fn() -> Box<dyn Computation>;

#[derive(Default)]
struct Registry {
    factories: HashMap<String, Factory>,
}

lazy_static! {
    static ref REGISTRY: Mutex<Registry> = Mutex::new(Registry::default());
}

/// Registers a computation factory under `name`. Typically called once
/// per process from the binary's `main` before any session is started.
pub fn register_computation(name: impl Into<String>, factory: Factory) {
    REGISTRY.lock().expect("computation registry mutex poisoned").factories.insert(name.into(), factory);
}

/// Resolves `name` against the registry and constructs an instance.
pub fn load_computation(name: &str) -> Result<Box<dyn Computation>, ComputationLoadError> {
    let factory = REGISTRY
        .lock()
        .expect("computation registry mutex poisoned")
        .factories
        .get(name)
        .copied()
        .ok_or_else(|| ComputationLoadError::new(name, "no computation registered under this name"))?;
    Ok(factory())
}

/// Shared, `Send + Sync` handle a computation uses to emit heartbeats
/// and outbound traffic; defined here to avoid a cyclic dependency
/// between `computation` and `environment`.
pub type SharedComputation = Arc<Mutex<Box<dyn Computation>>>;

#[cfg(test)]
mod test {
    use super::*;

    struct Echo;
    impl Computation for Echo {
        fn on_message(&mut self, _env: &Envelope) -> MessageOutcome {
            MessageOutcome::Handled
        }
    }

    #[test]
    fn unregistered_name_fails_to_load() {
        let err = load_computation("definitely-not-registered").unwrap_err();
        assert_eq!(err.name, "definitely-not-registered");
    }

    #[test]
    fn registered_name_constructs() {
        register_computation("echo-test", || Box::new(Echo));
        let comp = load_computation("echo-test").unwrap();
        drop(comp);
    }
}
