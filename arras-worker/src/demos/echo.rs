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

//! A minimal computation plug-in used as the happy-path fixture: it
//! registers a `TestMessage` content type, and replies to every
//! `TestMessage` it receives by appending `" [reply from worker]"` to
//! the text and sending it back on the default routing name.

use std::any::Any;
use std::io::{Read, Write};
use std::sync::Arc;

use arras_core::{CompEnvironmentImpl, Computation, ContentRegistry, MessageOutcome, SendOptions};
use arras_protocol::{read_string, write_string, ClassId, Envelope, MessageFormatError, ObjectContent, Uuid};
use tracing::info;

pub const TEST_MESSAGE_CLASS_ID: &str = "7f6f5f8e-9f3a-4a7a-8f0a-3a7c6a2f9b10";

fn test_message_class_id() -> ClassId {
    Uuid::parse(TEST_MESSAGE_CLASS_ID).expect("valid static uuid literal")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestMessage {
    pub text: String,
}

impl TestMessage {
    pub fn new(text: impl Into<String>) -> Self {
        TestMessage { text: text.into() }
    }

    pub fn deserialize(r: &mut dyn Read) -> Result<Self, MessageFormatError> {
        let text = read_string(r)?;
        Ok(TestMessage { text })
    }
}

impl ObjectContent for TestMessage {
    fn class_id(&self) -> ClassId {
        test_message_class_id()
    }

    fn class_version(&self) -> u32 {
        0
    }

    fn default_routing_name(&self) -> &str {
        "test"
    }

    fn serialize(&self, w: &mut dyn Write) -> std::io::Result<()> {
        write_string(w, &self.text)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// The `echo` computation: on `configure("start")` it has nothing to
/// do but wait for messages; every `TestMessage` it receives is echoed
/// back with a fixed suffix appended.
#[derive(Default)]
pub struct Echo {
    env: Option<Arc<CompEnvironmentImpl>>,
    received: u64,
}

impl Computation for Echo {
    fn bind_environment(&mut self, env: Arc<CompEnvironmentImpl>) {
        self.env = Some(env);
    }

    fn register_content(&self, registry: &ContentRegistry) {
        registry.register(test_message_class_id(), |_version, bytes| {
            TestMessage::deserialize(&mut &bytes[..]).ok().map(|m| Arc::new(m) as Arc<dyn ObjectContent>)
        });
    }

    fn on_message(&mut self, env: &Envelope) -> MessageOutcome {
        let Some(msg) = env.content_as::<TestMessage>() else {
            return MessageOutcome::Invalid;
        };
        self.received += 1;
        info!(text = %msg.text, count = self.received, "echo received a message");
        let reply = TestMessage::new(format!("{} [reply from worker]", msg.text));
        if let Some(env) = &self.env {
            if env.send(Arc::new(reply), SendOptions::default()).is_err() {
                return MessageOutcome::Invalid;
            }
        }
        MessageOutcome::Handled
    }
}

pub fn register() {
    arras_core::register_computation("echo", || Box::new(Echo::default()));
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_message_round_trips() {
        let msg = TestMessage::new("ping");
        let mut buf = Vec::new();
        msg.serialize(&mut buf).unwrap();
        let back = TestMessage::deserialize(&mut &buf[..]).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn unregistered_recipient_reports_invalid() {
        let mut echo = Echo::default();
        let env = Envelope::new(Arc::new(arras_protocol::ExecutorHeartbeat::default()) as Arc<dyn ObjectContent>);
        assert_eq!(echo.on_message(&env), MessageOutcome::Invalid);
    }
}
