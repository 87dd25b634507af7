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

//! Worker process command line: the exec-config path plus the
//! supervisor's resource-limit overrides, which take priority over
//! whatever the computation's own config block says.

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "arras-worker", about = "Loads and runs a single Arras computation plug-in")]
pub struct Args {
    /// Path to the exec-config JSON file written by the supervisor.
    pub config_file: String,

    /// Memory ceiling in megabytes, reported in heartbeats but not enforced.
    #[arg(long = "memoryMB")]
    pub memory_mb: Option<u32>,

    /// Core count, as a float because a supervisor may hand out fractional
    /// shares; truncated to an integer core count when applying limits.
    #[arg(long = "cores")]
    pub cores: Option<f32>,

    #[arg(long = "threadsPerCore")]
    pub threads_per_core: Option<u32>,

    /// `0` or `1`; enables cpu pinning via `--processorList`/`--hyperthreadProcessorList`.
    #[arg(long = "use_affinity")]
    pub use_affinity: Option<u8>,

    /// Comma-separated cpu ids, e.g. `"0,1,2,3"`.
    #[arg(long = "processorList")]
    pub processor_list: Option<String>,

    #[arg(long = "hyperthreadProcessorList")]
    pub hyperthread_processor_list: Option<String>,

    /// Enables ANSI color in the worker's own log output.
    #[arg(long = "use_color", action = clap::ArgAction::SetTrue)]
    pub use_color: bool,

    /// Repeat for more verbose logging (info -> debug -> trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Write logs to this file instead of stderr.
    #[arg(long = "log-file")]
    pub log_file: Option<String>,
}
