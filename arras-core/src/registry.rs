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

//! Process-wide `ClassID -> factory` mapping. A computation plug-in
//! registers the content types it sends/receives, typically at load
//! time; the dispatcher (via the envelope codec's `ContentFactory`
//! seam) consults this registry to turn wire bytes back into a typed
//! `ObjectContent` whenever it recognizes the class-id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use arras_protocol::{
    control_message_class_id, executor_heartbeat_class_id, message_chunk_class_id, ClassId,
    ContentFactory, ControlMessage, ExecutorHeartbeat, MessageChunk, ObjectContent,
};
use tracing::warn;

type Factory = Arc<dyn Fn(u32, &[u8]) -> Option<Arc<dyn ObjectContent>> + Send + Sync>;

/// A registry keyed by `(class_id, version)` isn't needed: a single
/// factory per `class_id` is handed the version and decides whether it
/// can handle it, keeping the version negotiation internal to each
/// factory.
#[derive(Default)]
pub struct ContentRegistry {
    factories: Mutex<HashMap<ClassId, Factory>>,
}

impl ContentRegistry {
    /// A fresh registry already knows the three wire classes the
    /// runtime itself speaks (`ControlMessage`, `MessageChunk`,
    /// `ExecutorHeartbeat`); a plug-in's `register_content` only needs
    /// to add its own `ObjectContent` types on top of these.
    pub fn new() -> Self {
        let registry = ContentRegistry::default();
        registry.register(control_message_class_id(), |_v, bytes| {
            ControlMessage::deserialize(&mut &bytes[..]).ok().map(|m| Arc::new(m) as Arc<dyn ObjectContent>)
        });
        registry.register(message_chunk_class_id(), |_v, bytes| {
            MessageChunk::deserialize(&mut &bytes[..]).ok().map(|m| Arc::new(m) as Arc<dyn ObjectContent>)
        });
        registry.register(executor_heartbeat_class_id(), |_v, bytes| {
            ExecutorHeartbeat::deserialize(&mut &bytes[..]).ok().map(|m| Arc::new(m) as Arc<dyn ObjectContent>)
        });
        registry
    }

    /// Registers a factory for `class_id`. Idempotent: re-registering the
    /// same id is logged as a warning (a likely programming error) but is
    /// not fatal.
    pub fn register<F>(&self, class_id: ClassId, factory: F)
    where
        F: Fn(u32, &[u8]) -> Option<Arc<dyn ObjectContent>> + Send + Sync + 'static,
    {
        let mut factories = self.factories.lock().expect("registry mutex poisoned");
        if factories.contains_key(&class_id) {
            warn!(%class_id, "re-registering content factory for an already-registered class id");
        }
        factories.insert(class_id, Arc::new(factory));
    }

    pub fn is_registered(&self, class_id: ClassId) -> bool {
        self.factories.lock().expect("registry mutex poisoned").contains_key(&class_id)
    }

    pub fn create(&self, class_id: ClassId, version: u32, bytes: &[u8]) -> Option<Arc<dyn ObjectContent>> {
        let factory = self.factories.lock().expect("registry mutex poisoned").get(&class_id)?.clone();
        factory(version, bytes)
    }
}

impl ContentFactory for ContentRegistry {
    fn create(&self, class_id: ClassId, version: u32, bytes: &[u8]) -> Option<Arc<dyn ObjectContent>> {
        ContentRegistry::create(self, class_id, version, bytes)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use arras_protocol::Uuid;
    use std::any::Any;
    use std::io::Write;

    struct Dummy;
    impl ObjectContent for Dummy {
        fn class_id(&self) -> ClassId {
            Uuid::NIL
        }
        fn class_version(&self) -> u32 {
            0
        }
        fn serialize(&self, _w: &mut dyn Write) -> std::io::Result<()> {
            Ok(())
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn unregistered_class_returns_none() {
        let reg = ContentRegistry::new();
        assert!(reg.create(Uuid::generate(), 0, &[]).is_none());
    }

    #[test]
    fn registration_is_idempotent_and_logs_on_conflict() {
        let reg = ContentRegistry::new();
        let id = Uuid::generate();
        reg.register(id, |_v, _b| Some(Arc::new(Dummy)));
        assert!(reg.is_registered(id));
        // Re-registering the same id must not panic.
        reg.register(id, |_v, _b| Some(Arc::new(Dummy)));
        assert!(reg.is_registered(id));
    }

    #[test]
    fn registered_factory_is_used() {
        let reg = ContentRegistry::new();
        let id = Uuid::generate();
        reg.register(id, |_v, _b| Some(Arc::new(Dummy)));
        assert!(reg.create(id, 0, &[]).is_some());
    }
}
