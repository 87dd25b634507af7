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

use std::io;

use thiserror::Error;

/// Wire-level corruption: a bad length prefix, an embedded NUL in a
/// string, invalid UTF-8, or an unrecognized chunk protocol version.
/// Fatal to the envelope currently being read; propagated to the
/// dispatcher as `DispatcherExitReason::MessageError`.
#[derive(Debug, Error)]
pub enum MessageFormatError {
    #[error("io error reading envelope: {0}")]
    Io(#[from] io::Error),
    #[error("length prefix {len} exceeds maximum allowed string size")]
    LengthPrefixTooLarge { len: u64 },
    #[error("string contains an embedded NUL byte")]
    EmbeddedNul,
    #[error("string is not valid utf-8")]
    InvalidUtf8,
    #[error("unsupported chunk protocol version {version}")]
    UnsupportedChunkProtocolVersion { version: u16 },
    #[error("invalid uuid bytes")]
    InvalidUuid,
}

/// A violated precondition in protocol-level bookkeeping: e.g. a chunk
/// set that doesn't agree on `numChunks`/`instanceId`, a duplicate
/// chunk index, or more chunks than fit in a `u16` index. Same
/// disposition as `MessageFormatError` from the dispatcher's point of
/// view.
#[derive(Debug, Error)]
pub enum ProtocolInternalError {
    #[error("{0}")]
    Msg(String),
}

impl ProtocolInternalError {
    pub fn new(msg: impl Into<String>) -> Self {
        ProtocolInternalError::Msg(msg.into())
    }
}
