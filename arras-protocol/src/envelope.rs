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

//! The envelope codec. An envelope is the transport unit for every
//! message that crosses a worker's IPC link. This module encodes and
//! decodes the bit-exact wire format; it knows nothing about framing
//! (that's the transport's job, see `arras_core::ipc`) and nothing about
//! which content types exist (that's the content registry's job, see
//! `arras_core::registry::ContentRegistry`) beyond the small
//! `ContentFactory` seam used to attempt deserialization.

use std::any::Any;
use std::io::{Cursor, Read, Write};
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::address::Address;
use crate::error::MessageFormatError;
use crate::uuid_id::{ClassId, Uuid};
use crate::wire::{read_bytes, read_string, write_bytes, write_string};

/// A payload type carried inside an envelope. Implementors are
/// registered with a `ContentRegistry` (in `arras-core`) keyed by
/// `class_id()`/`class_version()` so the dispatcher can deserialize
/// bytes arriving off the wire back into one of these.
pub trait ObjectContent: Any + Send + Sync {
    fn class_id(&self) -> ClassId;
    fn class_version(&self) -> u32;
    /// Routing name used when the sender didn't specify one explicitly.
    fn default_routing_name(&self) -> &str {
        ""
    }
    fn serialize(&self, w: &mut dyn Write) -> std::io::Result<()>;
    fn as_any(&self) -> &dyn Any;
}

/// Attempts to reconstruct a registered `ObjectContent` from its raw
/// serialized bytes. Implemented by `arras_core::registry::ContentRegistry`;
/// kept as a trait here so the wire codec doesn't need to depend on the
/// registry's storage details.
pub trait ContentFactory {
    fn create(&self, class_id: ClassId, version: u32, bytes: &[u8]) -> Option<Arc<dyn ObjectContent>>;
}

/// A factory that never recognizes anything; useful for tests and for
/// transports that intentionally want everything left opaque.
pub struct NoContentFactory;
impl ContentFactory for NoContentFactory {
    fn create(&self, _class_id: ClassId, _version: u32, _bytes: &[u8]) -> Option<Arc<dyn ObjectContent>> {
        None
    }
}

/// Either a strongly-typed, registered payload, or an opaque byte blob
/// recorded with the class-id/version it arrived with. Opaque content
/// arises when the content registry doesn't recognize a class-id (e.g.
/// forwarding a message whose type this process never registered) and
/// when the filter chain forwards chunk fragments without fully
/// reassembling them yet.
#[derive(Clone)]
pub enum MessageContent {
    Object(Arc<dyn ObjectContent>),
    Opaque { class_id: ClassId, class_version: u32, bytes: Arc<[u8]> },
}

impl MessageContent {
    pub fn class_id(&self) -> ClassId {
        match self {
            MessageContent::Object(o) => o.class_id(),
            MessageContent::Opaque { class_id, .. } => *class_id,
        }
    }

    pub fn class_version(&self) -> u32 {
        match self {
            MessageContent::Object(o) => o.class_version(),
            MessageContent::Opaque { class_version, .. } => *class_version,
        }
    }

    pub fn is_object(&self) -> bool {
        matches!(self, MessageContent::Object(_))
    }

    /// Estimated serialized size, used by the chunking filter to decide
    /// whether a payload needs to be split. For opaque content this is
    /// exact (the bytes are already serialized); for object content it
    /// serializes into a throwaway buffer to measure.
    pub fn serialized_length(&self) -> std::io::Result<u64> {
        match self {
            MessageContent::Opaque { bytes, .. } => Ok(bytes.len() as u64),
            MessageContent::Object(o) => {
                let mut counter = ByteCounter(0);
                o.serialize(&mut counter)?;
                Ok(counter.0)
            }
        }
    }

    pub fn serialize_to_bytes(&self) -> std::io::Result<Vec<u8>> {
        match self {
            MessageContent::Opaque { bytes, .. } => Ok(bytes.to_vec()),
            MessageContent::Object(o) => {
                let mut buf = Vec::new();
                o.serialize(&mut buf)?;
                Ok(buf)
            }
        }
    }
}

struct ByteCounter(u64);
impl Write for ByteCounter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0 += buf.len() as u64;
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Per-envelope bookkeeping carried alongside the content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub instance_id: Uuid,
    pub source_id: Uuid,
    pub creation_time_sec: u32,
    pub creation_time_micro: u32,
    pub from: Address,
    pub routing_name: String,
    pub trace: bool,
}

impl Default for Metadata {
    fn default() -> Self {
        Metadata {
            instance_id: Uuid::generate(),
            source_id: Uuid::NIL,
            creation_time_sec: 0,
            creation_time_micro: 0,
            from: Address::NULL,
            routing_name: String::new(),
            trace: false,
        }
    }
}

/// The transport unit: metadata, a resolved destination list, and a
/// content payload.
#[derive(Clone)]
pub struct Envelope {
    pub metadata: Metadata,
    pub to: Vec<Address>,
    pub content: MessageContent,
}

impl Envelope {
    pub fn new(content: impl Into<MessageContent>) -> Self {
        let content = content.into();
        let mut metadata = Metadata::default();
        if let MessageContent::Object(ref o) = content {
            metadata.routing_name = o.default_routing_name().to_string();
        }
        Envelope { metadata, to: Vec::new(), content }
    }

    pub fn class_id(&self) -> ClassId {
        self.content.class_id()
    }

    pub fn class_version(&self) -> u32 {
        self.content.class_version()
    }

    pub fn content_as<T: 'static>(&self) -> Option<&T> {
        match &self.content {
            MessageContent::Object(o) => o.as_any().downcast_ref::<T>(),
            MessageContent::Opaque { .. } => None,
        }
    }
}

impl From<Arc<dyn ObjectContent>> for MessageContent {
    fn from(o: Arc<dyn ObjectContent>) -> Self {
        MessageContent::Object(o)
    }
}

/// Writes the bit-exact wire form:
/// `class_id(16B) | class_version(u32) | metadata_block | to_count(u32)
/// | to_address×to_count | payload`.
pub fn write_envelope(env: &Envelope, w: &mut dyn Write) -> std::io::Result<()> {
    env.class_id().write_wire(w)?;
    w.write_u32::<LittleEndian>(env.class_version())?;
    write_metadata(&env.metadata, w)?;
    w.write_u32::<LittleEndian>(env.to.len() as u32)?;
    for addr in &env.to {
        addr.write_wire(w)?;
    }
    let payload = env.content.serialize_to_bytes()?;
    w.write_all(&payload)
}

fn write_metadata(m: &Metadata, w: &mut dyn Write) -> std::io::Result<()> {
    m.instance_id.write_wire(w)?;
    m.source_id.write_wire(w)?;
    w.write_u32::<LittleEndian>(m.creation_time_sec)?;
    w.write_u32::<LittleEndian>(m.creation_time_micro)?;
    m.from.write_wire(w)?;
    write_string(w, &m.routing_name)
}

fn read_metadata(r: &mut dyn Read) -> Result<Metadata, MessageFormatError> {
    let instance_id = Uuid::read_wire(r)?;
    let source_id = Uuid::read_wire(r)?;
    let creation_time_sec = r.read_u32::<LittleEndian>()?;
    let creation_time_micro = r.read_u32::<LittleEndian>()?;
    let from = Address::read_wire(r)?;
    let routing_name = read_string(r)?;
    Ok(Metadata { instance_id, source_id, creation_time_sec, creation_time_micro, from, routing_name, trace: false })
}

/// Parses a complete, already-delimited envelope frame. `bytes` must
/// contain exactly one envelope (the transport is responsible for
/// slicing frames off the wire by length).
pub fn read_envelope(bytes: &[u8], factory: &dyn ContentFactory) -> Result<Envelope, MessageFormatError> {
    let mut cur = Cursor::new(bytes);
    let class_id = Uuid::read_wire(&mut cur)?;
    let class_version = cur.read_u32::<LittleEndian>()?;
    let metadata = read_metadata(&mut cur)?;
    let to_count = cur.read_u32::<LittleEndian>()?;
    let mut to = Vec::with_capacity(to_count as usize);
    for _ in 0..to_count {
        to.push(Address::read_wire(&mut cur)?);
    }
    let payload_start = cur.position() as usize;
    let payload = &bytes[payload_start..];
    let content = match factory.create(class_id, class_version, payload) {
        Some(obj) => MessageContent::Object(obj),
        None => MessageContent::Opaque { class_id, class_version, bytes: Arc::from(payload.to_vec()) },
    };
    Ok(Envelope { metadata, to, content })
}

/// Convenience used by `read_envelope`'s callers that also want the raw
/// `(class_id, version)` pair surfaced without re-deriving it from the
/// content.
pub fn read_envelope_with_header(
    bytes: &[u8],
    factory: &dyn ContentFactory,
) -> Result<(Envelope, ClassId, u32), MessageFormatError> {
    let env = read_envelope(bytes, factory)?;
    let class_id = env.class_id();
    let version = env.class_version();
    Ok((env, class_id, version))
}

#[allow(unused_imports)]
pub(crate) fn read_bytes_payload(r: &mut dyn Read) -> Result<Vec<u8>, MessageFormatError> {
    read_bytes(r)
}
#[allow(unused_imports)]
pub(crate) fn write_bytes_payload(w: &mut dyn Write, b: &[u8]) -> std::io::Result<()> {
    write_bytes(w, b)
}

#[cfg(test)]
mod test {
    use super::*;

    struct TestContent {
        text: String,
    }
    impl ObjectContent for TestContent {
        fn class_id(&self) -> ClassId {
            Uuid::parse("11111111-1111-1111-1111-111111111111").unwrap()
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

    struct TestFactory;
    impl ContentFactory for TestFactory {
        fn create(&self, class_id: ClassId, version: u32, bytes: &[u8]) -> Option<Arc<dyn ObjectContent>> {
            if class_id == Uuid::parse("11111111-1111-1111-1111-111111111111").unwrap() && version == 0 {
                let text = read_string(&mut &bytes[..]).ok()?;
                Some(Arc::new(TestContent { text }))
            } else {
                None
            }
        }
    }

    #[test]
    fn envelope_round_trips_through_registered_factory() {
        let content: Arc<dyn ObjectContent> = Arc::new(TestContent { text: "ping".to_string() });
        let mut env = Envelope::new(content);
        env.to.push(Address { session: Uuid::generate(), ..Default::default() });
        env.metadata.routing_name = "ping-route".to_string();

        let mut buf = Vec::new();
        write_envelope(&env, &mut buf).unwrap();

        let back = read_envelope(&buf, &TestFactory).unwrap();
        assert_eq!(back.class_id(), env.class_id());
        assert_eq!(back.metadata.routing_name, "ping-route");
        assert_eq!(back.to, env.to);
        assert_eq!(back.content_as::<TestContent>().unwrap().text, "ping");
    }

    #[test]
    fn unregistered_class_round_trips_as_opaque() {
        let content: Arc<dyn ObjectContent> = Arc::new(TestContent { text: "ping".to_string() });
        let env = Envelope::new(content);
        let mut buf = Vec::new();
        write_envelope(&env, &mut buf).unwrap();

        let back = read_envelope(&buf, &NoContentFactory).unwrap();
        assert!(matches!(back.content, MessageContent::Opaque { .. }));
        assert_eq!(back.class_id(), env.class_id());
    }
}
