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

use std::any::Any;
use std::io::{Read, Write};

use crate::envelope::ObjectContent;
use crate::error::MessageFormatError;
use crate::uuid_id::{ClassId, Uuid};
use crate::wire::{read_string, write_string};

pub const CONTROL_MESSAGE_CLASS_ID: &str = "0f5db360-a67d-4485-b6a4-e1652a399925";

pub fn control_message_class_id() -> ClassId {
    Uuid::parse(CONTROL_MESSAGE_CLASS_ID).expect("valid static uuid literal")
}

/// Lifecycle command intercepted by the control-message filter before
/// it ever reaches the dispatcher's inbound queue. The commands the
/// runtime itself understands are `ready`, `go`, `stop`, `abort`, and
/// `update`; anything else is logged and dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    pub command: String,
    pub data: String,
    pub extra: String,
}

impl ControlMessage {
    pub fn command(cmd: impl Into<String>) -> Self {
        ControlMessage { command: cmd.into(), data: String::new(), extra: String::new() }
    }

    pub fn with_data(cmd: impl Into<String>, data: impl Into<String>) -> Self {
        ControlMessage { command: cmd.into(), data: data.into(), extra: String::new() }
    }
}

impl ObjectContent for ControlMessage {
    fn class_id(&self) -> ClassId {
        control_message_class_id()
    }

    fn class_version(&self) -> u32 {
        0
    }

    fn serialize(&self, w: &mut dyn Write) -> std::io::Result<()> {
        write_string(w, &self.command)?;
        write_string(w, &self.data)?;
        write_string(w, &self.extra)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl ControlMessage {
    pub fn deserialize(r: &mut dyn Read) -> Result<Self, MessageFormatError> {
        let command = read_string(r)?;
        let data = read_string(r)?;
        let extra = read_string(r)?;
        Ok(ControlMessage { command, data, extra })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trips() {
        let msg = ControlMessage::with_data("update", "{\"routing\":{}}");
        let mut buf = Vec::new();
        msg.serialize(&mut buf).unwrap();
        let back = ControlMessage::deserialize(&mut &buf[..]).unwrap();
        assert_eq!(back, msg);
    }
}
