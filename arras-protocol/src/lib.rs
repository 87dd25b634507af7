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

//! Wire-level types shared between an Arras worker process and its
//! supervisor: identifiers, envelopes, the chunking header, the
//! registration handshake, and the handful of well-known content types
//! (`ControlMessage`, `ExecutorHeartbeat`) that the runtime itself sends.

mod address;
mod chunk;
mod control;
mod envelope;
mod error;
mod exit_codes;
mod heartbeat;
mod registration;
mod time;
mod uuid_id;
mod wire;

pub use address::Address;
pub use chunk::{message_chunk_class_id, ChunkHeader, MessageChunk, CHUNKING_METHOD, MESSAGE_CHUNK_CLASS_ID};
pub use control::{control_message_class_id, ControlMessage, CONTROL_MESSAGE_CLASS_ID};
pub use envelope::{
    read_envelope, read_envelope_with_header, write_envelope, ContentFactory, Envelope, Metadata,
    MessageContent, NoContentFactory, ObjectContent,
};
pub use error::{MessageFormatError, ProtocolInternalError};
pub use exit_codes::{exit_code_string, ProcessExitCode};
pub use heartbeat::{executor_heartbeat_class_id, ExecutorHeartbeat, EXECUTOR_HEARTBEAT_CLASS_ID};
pub use registration::{RegistrationData, RegistrationType, REGISTRATION_MAGIC, WIRE_SIZE as REGISTRATION_WIRE_SIZE};
pub use time::ArrasTime;
pub use uuid_id::{ClassId, Uuid};
pub use wire::{read_long_string, read_string, write_long_string, write_string, WireRead, WireWrite};
