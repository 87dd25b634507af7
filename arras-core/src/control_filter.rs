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

//! Intercepts `ControlMessage` envelopes before they reach the
//! dispatcher's inbound queue and routes them straight to whatever
//! implements `Controlled` (normally the computation environment).
//! `go` in particular must take effect before regular dispatch even
//! starts, so it can't wait in line behind ordinary traffic.

use arras_protocol::{ControlMessage, Envelope};

/// Something that reacts to control commands (`ready`, `go`, `stop`,
/// `abort`, `update`, ...) synchronously on receipt.
pub trait Controlled: Send + Sync {
    fn control_message(&self, command: &str, data: &str);
}

/// Drains control messages out of a stream of envelopes, handing each
/// one to a `Controlled` and returning only the first non-control
/// envelope it sees.
pub fn filter_control_message(env: Envelope, controlled: &dyn Controlled) -> Option<Envelope> {
    if let Some(content) = env.content_as::<ControlMessage>() {
        controlled.control_message(&content.command, &content.data);
        None
    } else {
        Some(env)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Mutex;

    struct Recorder(Mutex<Vec<(String, String)>>);
    impl Controlled for Recorder {
        fn control_message(&self, command: &str, data: &str) {
            self.0.lock().unwrap().push((command.to_string(), data.to_string()));
        }
    }

    #[test]
    fn control_message_is_consumed_and_forwarded() {
        let recorder = Recorder(Mutex::new(Vec::new()));
        let env = Envelope::new(std::sync::Arc::new(ControlMessage::with_data("go", "")) as std::sync::Arc<dyn arras_protocol::ObjectContent>);
        let result = filter_control_message(env, &recorder);
        assert!(result.is_none());
        assert_eq!(recorder.0.lock().unwrap().as_slice(), &[("go".to_string(), "".to_string())]);
    }

    #[test]
    fn non_control_message_passes_through() {
        use arras_protocol::ExecutorHeartbeat;
        let recorder = Recorder(Mutex::new(Vec::new()));
        let env = Envelope::new(std::sync::Arc::new(ExecutorHeartbeat::default()) as std::sync::Arc<dyn arras_protocol::ObjectContent>);
        let result = filter_control_message(env, &recorder);
        assert!(result.is_some());
        assert!(recorder.0.lock().unwrap().is_empty());
    }
}
