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

//! The Arras core execution runtime: the message dispatcher, routing
//! table, chunking and control-message filters, the computation plug-in
//! environment, execution limits, and the local-session supervisor that
//! runs a computation in-process on the client machine.

pub mod chunking;
pub mod computation;
pub mod control_filter;
pub mod dispatcher;
pub mod environment;
pub mod error;
pub mod ipc;
pub mod limits;
pub mod local_session;
pub mod packaging;
pub mod perf_monitor;
pub mod process;
pub mod queue;
pub mod registry;
pub mod routing;

pub use computation::{load_computation, register_computation, Computation, MessageOutcome, SharedComputation};
pub use dispatcher::{DispatcherExitReason, DispatcherState, MessageDispatcher};
pub use environment::{CompEnvironmentImpl, ComputationExitReason, ControlState, EnvironmentValue, SendOptions};
pub use limits::ExecutionLimits;
pub use local_session::{LocalSession, LocalSessions, SessionDefinition, SessionState};
pub use registry::ContentRegistry;
pub use routing::{Addresser, ComputationMap, RoutingTable, SendTo};
