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

//! Wire representation of a single chunk of an oversized payload. The
//! chunking filter in `arras-core` builds and consumes these; this
//! module only knows how to serialize/deserialize one.

use std::any::Any;
use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::envelope::ObjectContent;
use crate::error::MessageFormatError;
use crate::uuid_id::{ClassId, Uuid};
use crate::wire::{read_bytes, read_string, write_bytes, write_string};

pub const MESSAGE_CHUNK_CLASS_ID: &str = "164a8601-dbf7-42e5-b469-3ad1c58dbe83";
pub const CHUNKING_METHOD: u16 = 0;
const PROTOCOL_VERSION: u16 = 0;

pub fn message_chunk_class_id() -> ClassId {
    Uuid::parse(MESSAGE_CHUNK_CLASS_ID).expect("valid static uuid literal")
}

/// The inner header carried by every chunk of one logical oversized
/// message. All chunks sharing an `inner_instance_id` must agree on
/// `number_of_chunks`, `unchunked_size`, and the inner class/routing
/// fields; the set of `chunk_index` values across the chunk set must
/// exactly cover `0..number_of_chunks`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkHeader {
    pub chunking_method: u16,
    pub number_of_chunks: u16,
    pub chunk_index: u16,
    pub offset: u64,
    pub unchunked_size: u64,
    pub inner_class_id: ClassId,
    pub inner_routing_name: String,
    pub inner_instance_id: Uuid,
    pub inner_origin_id: Uuid,
    pub inner_class_version: u32,
}

#[derive(Debug, Clone)]
pub struct MessageChunk {
    pub header: ChunkHeader,
    pub payload: Vec<u8>,
}

impl ObjectContent for MessageChunk {
    fn class_id(&self) -> ClassId {
        message_chunk_class_id()
    }

    fn class_version(&self) -> u32 {
        0
    }

    fn default_routing_name(&self) -> &str {
        ""
    }

    fn serialize(&self, w: &mut dyn Write) -> std::io::Result<()> {
        w.write_u16::<LittleEndian>(PROTOCOL_VERSION)?;
        w.write_u16::<LittleEndian>(self.header.chunking_method)?;
        w.write_u16::<LittleEndian>(self.header.number_of_chunks)?;
        w.write_u16::<LittleEndian>(self.header.chunk_index)?;
        w.write_u64::<LittleEndian>(self.header.offset)?;
        w.write_u64::<LittleEndian>(self.header.unchunked_size)?;
        self.header.inner_class_id.write_wire(w)?;
        write_string(w, &self.header.inner_routing_name)?;
        self.header.inner_instance_id.write_wire(w)?;
        self.header.inner_origin_id.write_wire(w)?;
        w.write_u32::<LittleEndian>(self.header.inner_class_version)?;
        write_bytes(w, &self.payload)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl MessageChunk {
    pub fn deserialize(r: &mut dyn Read) -> Result<Self, MessageFormatError> {
        let protocol_version = r.read_u16::<LittleEndian>()?;
        if protocol_version != PROTOCOL_VERSION {
            return Err(MessageFormatError::UnsupportedChunkProtocolVersion { version: protocol_version });
        }
        let chunking_method = r.read_u16::<LittleEndian>()?;
        let number_of_chunks = r.read_u16::<LittleEndian>()?;
        let chunk_index = r.read_u16::<LittleEndian>()?;
        let offset = r.read_u64::<LittleEndian>()?;
        let unchunked_size = r.read_u64::<LittleEndian>()?;
        let inner_class_id = Uuid::read_wire(r)?;
        let inner_routing_name = read_string(r)?;
        let inner_instance_id = Uuid::read_wire(r)?;
        let inner_origin_id = Uuid::read_wire(r)?;
        let inner_class_version = r.read_u32::<LittleEndian>()?;
        let payload = read_bytes(r)?;
        Ok(MessageChunk {
            header: ChunkHeader {
                chunking_method,
                number_of_chunks,
                chunk_index,
                offset,
                unchunked_size,
                inner_class_id,
                inner_routing_name,
                inner_instance_id,
                inner_origin_id,
                inner_class_version,
            },
            payload,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample_header() -> ChunkHeader {
        ChunkHeader {
            chunking_method: CHUNKING_METHOD,
            number_of_chunks: 4,
            chunk_index: 1,
            offset: 1024,
            unchunked_size: 3500,
            inner_class_id: Uuid::generate(),
            inner_routing_name: "bigdata".to_string(),
            inner_instance_id: Uuid::generate(),
            inner_origin_id: Uuid::generate(),
            inner_class_version: 3,
        }
    }

    #[test]
    fn chunk_round_trips() {
        let chunk = MessageChunk { header: sample_header(), payload: vec![7u8; 1024] };
        let mut buf = Vec::new();
        chunk.serialize(&mut buf).unwrap();
        let back = MessageChunk::deserialize(&mut &buf[..]).unwrap();
        assert_eq!(back.header, chunk.header);
        assert_eq!(back.payload, chunk.payload);
    }

    #[test]
    fn rejects_unsupported_protocol_version() {
        let chunk = MessageChunk { header: sample_header(), payload: vec![] };
        let mut buf = Vec::new();
        chunk.serialize(&mut buf).unwrap();
        buf[0] = 7; // corrupt protocol version (LE u16 low byte)
        let err = MessageChunk::deserialize(&mut &buf[..]).unwrap_err();
        assert!(matches!(err, MessageFormatError::UnsupportedChunkProtocolVersion { version: 7 }));
    }
}
