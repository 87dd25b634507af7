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

//! `arras-worker` (nicknamed `execComp` in the original system): loads
//! one computation plug-in named by its exec-config file, registers
//! with the supervisor listening on the exec-config's `ipc` path, and
//! drives that computation through `run_computation` until it exits.

mod cli;
mod config;
mod demos;

use std::fs;
use std::io::Write;
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};

use arras_core::{
    Addresser, CompEnvironmentImpl, ComputationExitReason, ComputationMap, ContentRegistry, ControlState,
    ExecutionLimits, RoutingTable,
};
use arras_core::ipc::{IpcConnection, ShutdownHandle};
use arras_core::chunking::ChunkingConfig;
use arras_core::dispatcher::MessageDispatcher;
use arras_protocol::{exit_code_string, Address, ProcessExitCode, RegistrationData, RegistrationType};
use clap::Parser;
use tracing::{error, info};

use cli::Args;
use config::{read_config, ExecConfig};

/// `(4, 0, 0)`: the messaging API version this worker speaks, matched
/// against `REGISTRATION_API_MAJOR` on the supervisor side.
const API_VERSION: (u16, u16, u16) = (4, 0, 0);

fn init_logging(args: &Args) {
    let level = match args.verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    let builder = tracing_subscriber::fmt().with_max_level(level).with_target(false).with_ansi(args.use_color);
    if let Some(path) = &args.log_file {
        match fs::File::create(path) {
            Ok(file) => {
                builder.with_writer(Mutex::new(file)).init();
            }
            Err(e) => {
                builder.init();
                error!(path = %path, error = %e, "failed to open log file, logging to stderr instead");
            }
        }
    } else {
        builder.init();
    }
}

/// Merges the supervisor's CLI resource-limit overrides into the
/// computation's own config block (CLI wins) and parses the result.
fn resolve_limits(args: &Args, computation_config: &serde_json::Value) -> Result<ExecutionLimits, String> {
    let mut merged = computation_config.as_object().cloned().unwrap_or_default();
    if let Some(mb) = args.memory_mb {
        merged.insert("maxMemoryMB".to_string(), serde_json::json!(mb));
    }
    if let Some(cores) = args.cores {
        let cores = (cores.floor() as u32).max(1);
        merged.insert("maxCores".to_string(), serde_json::json!(cores));
    }
    if let Some(tpc) = args.threads_per_core {
        merged.insert("threadsPerCore".to_string(), serde_json::json!(tpc));
    }
    if let Some(use_affinity) = args.use_affinity {
        merged.insert("useAffinity".to_string(), serde_json::json!(use_affinity != 0));
    }
    if let Some(list) = &args.processor_list {
        merged.insert("cpuSet".to_string(), serde_json::json!(list));
    }
    if let Some(list) = &args.hyperthread_processor_list {
        merged.insert("hyperthreadCpuSet".to_string(), serde_json::json!(list));
    }
    ExecutionLimits::from_json(&serde_json::Value::Object(merged))
}

fn exit_reason_to_code(reason: &ComputationExitReason) -> ProcessExitCode {
    match reason {
        ComputationExitReason::Normal => ProcessExitCode::Normal,
        ComputationExitReason::Timeout => ProcessExitCode::ComputationGoTimeout,
        ComputationExitReason::StartException(_) | ComputationExitReason::StopException(_) => {
            ProcessExitCode::ExceptionCaught
        }
        ComputationExitReason::Disconnected => ProcessExitCode::Disconnected,
        ComputationExitReason::MessageError | ComputationExitReason::HandlerError => ProcessExitCode::InternalError,
    }
}

fn run(args: &Args) -> ProcessExitCode {
    demos::register_all();

    let config: ExecConfig = match read_config(&args.config_file) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to load exec-config");
            return ProcessExitCode::ConfigFileLoadError;
        }
    };

    let comp_name = match config.computation_name() {
        Ok(n) => n.to_string(),
        Err(e) => {
            error!(error = %e, "invalid exec-config");
            return ProcessExitCode::InvalidConfigData;
        }
    };

    let mut computation = match arras_core::load_computation(&comp_name) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to load computation plug-in");
            return ProcessExitCode::ComputationLoadError;
        }
    };

    let registry = Arc::new(ContentRegistry::new());
    computation.register_content(&registry);

    let comp_map = match ComputationMap::new(config.session_id, &config.routing_computations()) {
        Ok(m) => m,
        Err(e) => {
            error!(error = %e, "failed to build computation map from exec-config routing data");
            return ProcessExitCode::InvalidConfigData;
        }
    };
    let filters = config.routing_message_filter();
    let table = match RoutingTable::build(config.comp_id, &comp_map, &filters) {
        Ok(t) => t,
        Err(e) => {
            error!(error = %e, "failed to build routing table from exec-config routing data");
            return ProcessExitCode::InvalidConfigData;
        }
    };
    let addresser = Arc::new(Addresser::new(table));
    let control = Arc::new(ControlState::new(config.comp_id, Arc::new(comp_map), addresser.clone()));

    let stream = match UnixStream::connect(&config.ipc) {
        Ok(s) => s,
        Err(e) => {
            error!(path = %config.ipc, error = %e, "failed to connect to supervisor ipc socket");
            return ProcessExitCode::ExecError;
        }
    };

    let registration = RegistrationData::new(
        config.session_id,
        config.node_id,
        config.comp_id,
        RegistrationType::Executor,
        API_VERSION,
    );
    {
        let mut handshake = match stream.try_clone() {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "failed to clone ipc stream for registration handshake");
                return ProcessExitCode::ExecError;
            }
        };
        if let Err(e) = registration.write_wire(&mut handshake) {
            error!(error = %e, "failed to send registration header to supervisor");
            return ProcessExitCode::ExecError;
        }
        if let Err(e) = handshake.flush() {
            error!(error = %e, "failed to flush registration header to supervisor");
            return ProcessExitCode::ExecError;
        }
    }

    let conn = IpcConnection::new(match stream.try_clone() {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to clone ipc stream");
            return ProcessExitCode::ExecError;
        }
    });
    let (reader, writer) = match conn.split() {
        Ok(halves) => halves,
        Err(e) => {
            error!(error = %e, "failed to split ipc connection");
            return ProcessExitCode::ExecError;
        }
    };
    let shutdown = ShutdownHandle::new(stream);

    let dispatcher = Arc::new(MessageDispatcher::new(
        reader,
        writer,
        shutdown,
        registry,
        control.clone() as Arc<dyn arras_core::control_filter::Controlled>,
        ChunkingConfig::default(),
    ));

    let own_address = Address { session: config.session_id, node: config.node_id, computation: config.comp_id };
    let env = Arc::new(CompEnvironmentImpl::new(own_address, comp_name.clone(), dispatcher, addresser, control.clone()));
    computation.bind_environment(env.clone());

    let limits = match resolve_limits(args, config.computation_config()) {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, "invalid execution limits in exec-config / cli overrides");
            return ProcessExitCode::InvalidConfigData;
        }
    };

    let shared_computation: arras_core::SharedComputation = Arc::new(Mutex::new(computation));
    let status_comp_name = comp_name.clone();
    let reason = arras_core::environment::run_computation(
        env,
        control,
        shared_computation,
        limits,
        true,
        move || status_comp_name.clone(),
    );

    match &reason {
        ComputationExitReason::Normal => info!("computation exited normally"),
        other => error!(reason = ?other, "computation exited abnormally"),
    }
    let code = exit_reason_to_code(&reason);
    let expected = matches!(reason, ComputationExitReason::Normal);
    info!(code = code.code(), reason = %exit_code_string(code.code(), expected), "worker exiting");
    code
}

fn main() {
    let args = Args::parse();
    init_logging(&args);
    let code = run(&args);
    std::process::exit(code.code());
}
