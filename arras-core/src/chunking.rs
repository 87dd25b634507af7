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

//! Splits outbound envelopes whose content exceeds a size threshold
//! into a sequence of `MessageChunk` envelopes, and reassembles inbound
//! chunk sequences back into the original envelope. Neither direction
//! touches the transport itself; both work purely in terms of
//! `Envelope` values, so they compose as filters around any endpoint.

use std::collections::HashMap;
use std::sync::Arc;

use arras_protocol::{ChunkHeader, ClassId, Envelope, MessageChunk, MessageContent, Uuid, CHUNKING_METHOD};
use tracing::{debug, info};

use crate::error::InternalError;

/// Chunking is disabled by setting `min_chunking_size` above
/// `chunk_size` for every message seen in practice; `enabled = false`
/// short-circuits the check entirely.
#[derive(Debug, Clone, Copy)]
pub struct ChunkingConfig {
    pub enabled: bool,
    pub min_chunking_size: u64,
    pub chunk_size: u64,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        ChunkingConfig {
            enabled: true,
            min_chunking_size: 2047 * 1024 * 1024,
            chunk_size: 1024 * 1024 * 1024,
        }
    }
}

/// Splits `env` into one or more envelopes ready to hand to the
/// transport. Returns a single-element vec unchanged when the content
/// isn't chunkable or doesn't clear `min_chunking_size`.
pub fn chunk_envelope(env: &Envelope, config: &ChunkingConfig) -> Result<Vec<Envelope>, InternalError> {
    if !config.enabled {
        return Ok(vec![env.clone()]);
    }
    let MessageContent::Object(content) = &env.content else {
        return Ok(vec![env.clone()]);
    };
    let unchunked_size = content.serialized_length().map_err(|e| InternalError::new(e.to_string()))?;
    if unchunked_size < config.min_chunking_size {
        return Ok(vec![env.clone()]);
    }

    let payload = content.serialize_to_bytes().map_err(|e| InternalError::new(e.to_string()))?;
    let chunk_size = config.chunk_size.max(1) as usize;
    let num_chunks64 = payload.len().div_ceil(chunk_size).max(1) as u64;
    if num_chunks64 > u16::MAX as u64 {
        return Err(InternalError::new("message is too large for chunking"));
    }
    let num_chunks = num_chunks64 as u16;

    info!(
        instance_id = %env.metadata.instance_id,
        unchunked_size,
        num_chunks,
        chunk_size,
        "breaking oversized message into chunks"
    );

    let mut out = Vec::with_capacity(num_chunks as usize);
    for index in 0..num_chunks {
        let start = index as usize * chunk_size;
        let end = (start + chunk_size).min(payload.len());
        let header = ChunkHeader {
            chunking_method: CHUNKING_METHOD,
            number_of_chunks: num_chunks,
            chunk_index: index,
            offset: start as u64,
            unchunked_size,
            inner_class_id: env.class_id(),
            inner_routing_name: env.metadata.routing_name.clone(),
            inner_instance_id: env.metadata.instance_id,
            inner_origin_id: env.metadata.source_id,
            inner_class_version: env.class_version(),
        };
        let chunk = MessageChunk { header, payload: payload[start..end].to_vec() };
        let mut chunk_env = Envelope::new(Arc::new(chunk) as Arc<dyn arras_protocol::ObjectContent>);
        chunk_env.metadata = env.metadata.clone();
        chunk_env.to = env.to.clone();
        out.push(chunk_env);
    }
    Ok(out)
}

/// Accumulates the chunks of one logical message, keyed by
/// `inner_instance_id`. Call `add_chunk` for every chunk seen; once all
/// chunks for an instance id have arrived, `take_complete` returns the
/// reassembled raw payload bytes plus the class id/version/metadata
/// needed to turn them back into an `Envelope`.
pub struct MessageUnchunker {
    num_chunks: u16,
    instance_id: Uuid,
    chunks: Vec<Option<MessageChunk>>,
    received: u16,
}

impl MessageUnchunker {
    pub fn new(first: MessageChunk) -> Result<Self, InternalError> {
        let num_chunks = first.header.number_of_chunks;
        if num_chunks < 1 {
            return Err(InternalError::new("message chunk contained invalid chunk count of zero"));
        }
        let instance_id = first.header.inner_instance_id;
        debug!(%instance_id, num_chunks, "beginning collection of chunked message");
        let mut chunks = vec![None; num_chunks as usize];
        let index = first.header.chunk_index;
        let in_range = (index as usize) < chunks.len();
        if !in_range {
            return Err(InternalError::new("message chunk index out of range"));
        }
        chunks[index as usize] = Some(first);
        Ok(MessageUnchunker { num_chunks, instance_id, chunks, received: 1 })
    }

    pub fn add_chunk(&mut self, chunk: MessageChunk) -> Result<(), InternalError> {
        debug!(
            index = chunk.header.chunk_index,
            instance_id = %chunk.header.inner_instance_id,
            len = chunk.payload.len(),
            "processing chunk"
        );
        if chunk.header.number_of_chunks != self.num_chunks || chunk.header.inner_instance_id != self.instance_id {
            return Err(InternalError::new("chunk data mismatch"));
        }
        let index = chunk.header.chunk_index as usize;
        if index >= self.chunks.len() {
            return Err(InternalError::new("message chunk index out of range"));
        }
        if self.chunks[index].is_some() {
            return Err(InternalError::new("duplicate chunk received"));
        }
        self.chunks[index] = Some(chunk);
        self.received += 1;
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.received >= self.num_chunks
    }

    /// Reassembles the payload once every chunk has arrived. Returns
    /// `(class_id, class_version, routing_name, instance_id, source_id,
    /// bytes)`.
    pub fn take_complete(&self) -> Result<(ClassId, u32, String, Uuid, Uuid, Vec<u8>), InternalError> {
        if !self.is_complete() {
            return Err(InternalError::new("chunked message is not yet complete"));
        }
        let mut bytes = Vec::new();
        let mut sum_len: u64 = 0;
        for (i, slot) in self.chunks.iter().enumerate() {
            let chunk = slot.as_ref().ok_or_else(|| InternalError::new(format!("chunk #{i} was missing from chunked message")))?;
            sum_len += chunk.payload.len() as u64;
            bytes.extend_from_slice(&chunk.payload);
        }
        let first = self.chunks[0].as_ref().expect("complete unchunker has chunk 0");
        if sum_len != first.header.unchunked_size {
            return Err(InternalError::new(format!(
                "chunked message size mismatch: expected {} bytes, got {sum_len}",
                first.header.unchunked_size
            )));
        }
        info!(instance_id = %self.instance_id, num_chunks = self.num_chunks, "chunked message is complete, recreating");
        Ok((
            first.header.inner_class_id,
            first.header.inner_class_version,
            first.header.inner_routing_name.clone(),
            first.header.inner_instance_id,
            first.header.inner_origin_id,
            bytes,
        ))
    }
}

/// Per-connection table of in-progress unchunkers, one per logical
/// message currently being reassembled.
#[derive(Default)]
pub struct UnchunkerTable {
    unchunkers: HashMap<Uuid, MessageUnchunker>,
}

impl UnchunkerTable {
    pub fn new() -> Self {
        UnchunkerTable::default()
    }

    /// Feeds one received chunk in. Returns `Some(bytes...)` tuple when
    /// this chunk completed its message (and removes the bookkeeping for
    /// it), `None` while more chunks are still expected.
    pub fn add_chunk(
        &mut self,
        chunk: MessageChunk,
    ) -> Result<Option<(ClassId, u32, String, Uuid, Uuid, Vec<u8>)>, InternalError> {
        let instance_id = chunk.header.inner_instance_id;
        if let Some(unchunker) = self.unchunkers.get_mut(&instance_id) {
            unchunker.add_chunk(chunk)?;
        } else {
            self.unchunkers.insert(instance_id, MessageUnchunker::new(chunk)?);
        }
        let unchunker = self.unchunkers.get(&instance_id).expect("just inserted or found");
        if unchunker.is_complete() {
            let result = unchunker.take_complete()?;
            self.unchunkers.remove(&instance_id);
            Ok(Some(result))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use arras_protocol::{Address, ObjectContent};
    use std::any::Any;
    use std::io::Write;

    #[derive(Clone)]
    struct BigContent(Vec<u8>);
    impl ObjectContent for BigContent {
        fn class_id(&self) -> ClassId {
            Uuid::parse("22222222-2222-2222-2222-222222222222").unwrap()
        }
        fn class_version(&self) -> u32 {
            1
        }
        fn serialize(&self, w: &mut dyn Write) -> std::io::Result<()> {
            w.write_all(&self.0)
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn small_message_is_not_chunked() {
        let content: Arc<dyn ObjectContent> = Arc::new(BigContent(vec![1, 2, 3]));
        let env = Envelope::new(content);
        let config = ChunkingConfig::default();
        let out = chunk_envelope(&env, &config).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].class_id(), env.class_id());
    }

    #[test]
    fn oversized_message_splits_and_reassembles() {
        let payload = vec![42u8; 10_000];
        let content: Arc<dyn ObjectContent> = Arc::new(BigContent(payload.clone()));
        let mut env = Envelope::new(content);
        env.to.push(Address { session: Uuid::generate(), ..Default::default() });
        let config = ChunkingConfig { enabled: true, min_chunking_size: 100, chunk_size: 2_000 };

        let chunks = chunk_envelope(&env, &config).unwrap();
        assert_eq!(chunks.len(), 5);

        let mut table = UnchunkerTable::new();
        let mut result = None;
        for chunk_env in chunks {
            let chunk = chunk_env.content_as::<MessageChunk>().unwrap().clone();
            result = table.add_chunk(chunk).unwrap();
        }
        let (class_id, version, _routing, _instance, _origin, bytes) = result.expect("message should be complete");
        assert_eq!(class_id, env.class_id());
        assert_eq!(version, env.class_version());
        assert_eq!(bytes, payload);
    }

    #[test]
    fn duplicate_chunk_is_rejected() {
        let payload = vec![7u8; 5_000];
        let content: Arc<dyn ObjectContent> = Arc::new(BigContent(payload));
        let env = Envelope::new(content);
        let config = ChunkingConfig { enabled: true, min_chunking_size: 100, chunk_size: 1_000 };
        let chunks = chunk_envelope(&env, &config).unwrap();
        let first = chunks[0].content_as::<MessageChunk>().unwrap().clone();

        let mut table = UnchunkerTable::new();
        table.add_chunk(first.clone()).unwrap();
        let err = table.add_chunk(first).unwrap_err();
        assert!(err.0.contains("duplicate"));
    }
}
