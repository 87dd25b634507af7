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

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::envelope::ObjectContent;
use crate::error::MessageFormatError;
use crate::uuid_id::{ClassId, Uuid};
use crate::wire::{read_string, write_string};

pub const EXECUTOR_HEARTBEAT_CLASS_ID: &str = "92c7ab1d-21a4-4cfe-a9fd-bd541436c15d";

pub fn executor_heartbeat_class_id() -> ClassId {
    Uuid::parse(EXECUTOR_HEARTBEAT_CLASS_ID).expect("valid static uuid literal")
}

/// Periodic telemetry envelope emitted by the performance monitor:
/// CPU/memory/message-count stats plus an optional free-form status
/// string the computation may set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutorHeartbeat {
    pub transmit_secs: u64,
    pub transmit_micros: u32,

    pub threads: u16,
    pub cpu_usage_5s: f32,
    pub cpu_usage_60s: f32,
    pub cpu_usage_total_secs: f32,
    pub hyperthreaded: bool,

    pub memory_usage_bytes: u64,

    pub sent_messages_5s: u64,
    pub sent_messages_60s: u64,
    pub sent_messages_total: u64,
    pub received_messages_5s: u64,
    pub received_messages_60s: u64,
    pub received_messages_total: u64,

    pub status: String,
}

impl ObjectContent for ExecutorHeartbeat {
    fn class_id(&self) -> ClassId {
        executor_heartbeat_class_id()
    }

    fn class_version(&self) -> u32 {
        0
    }

    fn serialize(&self, w: &mut dyn Write) -> std::io::Result<()> {
        w.write_u64::<LittleEndian>(self.transmit_secs)?;
        w.write_u32::<LittleEndian>(self.transmit_micros)?;
        w.write_u16::<LittleEndian>(self.threads)?;
        w.write_f32::<LittleEndian>(self.cpu_usage_5s)?;
        w.write_f32::<LittleEndian>(self.cpu_usage_60s)?;
        w.write_f32::<LittleEndian>(self.cpu_usage_total_secs)?;
        w.write_u8(self.hyperthreaded as u8)?;
        w.write_u64::<LittleEndian>(self.memory_usage_bytes)?;
        w.write_u64::<LittleEndian>(self.sent_messages_5s)?;
        w.write_u64::<LittleEndian>(self.sent_messages_60s)?;
        w.write_u64::<LittleEndian>(self.sent_messages_total)?;
        w.write_u64::<LittleEndian>(self.received_messages_5s)?;
        w.write_u64::<LittleEndian>(self.received_messages_60s)?;
        w.write_u64::<LittleEndian>(self.received_messages_total)?;
        write_string(w, &self.status)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl ExecutorHeartbeat {
    pub fn deserialize(r: &mut dyn Read) -> Result<Self, MessageFormatError> {
        Ok(ExecutorHeartbeat {
            transmit_secs: r.read_u64::<LittleEndian>()?,
            transmit_micros: r.read_u32::<LittleEndian>()?,
            threads: r.read_u16::<LittleEndian>()?,
            cpu_usage_5s: r.read_f32::<LittleEndian>()?,
            cpu_usage_60s: r.read_f32::<LittleEndian>()?,
            cpu_usage_total_secs: r.read_f32::<LittleEndian>()?,
            hyperthreaded: r.read_u8()? != 0,
            memory_usage_bytes: r.read_u64::<LittleEndian>()?,
            sent_messages_5s: r.read_u64::<LittleEndian>()?,
            sent_messages_60s: r.read_u64::<LittleEndian>()?,
            sent_messages_total: r.read_u64::<LittleEndian>()?,
            received_messages_5s: r.read_u64::<LittleEndian>()?,
            received_messages_60s: r.read_u64::<LittleEndian>()?,
            received_messages_total: r.read_u64::<LittleEndian>()?,
            status: read_string(r)?,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trips() {
        let hb = ExecutorHeartbeat {
            transmit_secs: 1_700_000_000,
            transmit_micros: 42,
            threads: 4,
            cpu_usage_5s: 0.5,
            cpu_usage_60s: 2.0,
            cpu_usage_total_secs: 120.0,
            hyperthreaded: true,
            memory_usage_bytes: 1 << 20,
            sent_messages_5s: 3,
            sent_messages_60s: 30,
            sent_messages_total: 300,
            received_messages_5s: 2,
            received_messages_60s: 20,
            received_messages_total: 200,
            status: "running".to_string(),
        };
        let mut buf = Vec::new();
        hb.serialize(&mut buf).unwrap();
        let back = ExecutorHeartbeat::deserialize(&mut &buf[..]).unwrap();
        assert_eq!(back, hb);
    }
}
