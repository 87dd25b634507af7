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

use thiserror::Error;

pub use arras_protocol::{MessageFormatError, ProtocolInternalError};

/// A violated precondition in runtime bookkeeping: a duplicate chunk, a
/// chunk count overflow, a content-registry miss where one was
/// required, or a dispatcher state transition attempted from the wrong
/// state. Disposed of the same way `MessageFormatError` is: fatal to
/// the current operation, reported to the dispatcher as
/// `DispatcherExitReason::MessageError`.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct InternalError(pub String);

impl InternalError {
    pub fn new(msg: impl Into<String>) -> Self {
        InternalError(msg.into())
    }
}

impl From<ProtocolInternalError> for InternalError {
    fn from(e: ProtocolInternalError) -> Self {
        InternalError(e.to_string())
    }
}

/// Cooperative cancellation signal raised by a shut-down `ThreadsafeQueue`
/// or transport. Caught by the thread that receives it and treated as an
/// orderly exit, never logged as an error.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("queue or transport has shut down")]
pub struct ShutdownError;

/// Supervisor-side configuration or spawn failure. Surfaces
/// synchronously to the caller of `LocalSessions::create_session`.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct SessionError(pub String);

impl SessionError {
    pub fn new(msg: impl Into<String>) -> Self {
        SessionError(msg.into())
    }
}

/// The computation plug-in named in the exec-config could not be
/// resolved or constructed: the name was never registered, or its
/// constructor failed. Surfaces via `ProcessExitCode::ComputationLoadError`.
#[derive(Debug, Error)]
#[error("failed to load computation '{name}': {detail}")]
pub struct ComputationLoadError {
    pub name: String,
    pub detail: String,
}

impl ComputationLoadError {
    pub fn new(name: impl Into<String>, detail: impl Into<String>) -> Self {
        ComputationLoadError { name: name.into(), detail: detail.into() }
    }
}

/// Used by the message dispatcher to classify a thread-local failure
/// into one of the reasons the dispatcher as a whole can report.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    MessageFormat(#[from] MessageFormatError),
    #[error(transparent)]
    Internal(#[from] InternalError),
    #[error(transparent)]
    Shutdown(#[from] ShutdownError),
    #[error("handler error: {0}")]
    Handler(String),
    #[error("peer disconnected")]
    Disconnected,
}
