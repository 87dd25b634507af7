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

//! Process exit codes a worker returns on termination, and the
//! human-readable stringification the supervisor uses to build the
//! `disconnectReason` it hands back to the application on `onTerminate`.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ProcessExitCode {
    Normal = 0,
    InvalidCommandline = 1,
    ConfigFileLoadError = 2,
    ExecError = 5,
    ComputationLoadError = 6,
    ComputationGoTimeout = 7,
    InitializationFailed = 8,
    InvalidConfigData = 9,
    ExceptionCaught = 13,
    UnspecifiedError = 14,
    Disconnected = 20,
    InternalError = 21,
}

impl ProcessExitCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        use ProcessExitCode::*;
        Some(match code {
            0 => Normal,
            1 => InvalidCommandline,
            2 => ConfigFileLoadError,
            5 => ExecError,
            6 => ComputationLoadError,
            7 => ComputationGoTimeout,
            8 => InitializationFailed,
            9 => InvalidConfigData,
            13 => ExceptionCaught,
            14 => UnspecifiedError,
            20 => Disconnected,
            21 => InternalError,
            _ => return None,
        })
    }
}

/// Renders a raw process exit code (as reported by wait(2), i.e. before
/// or regardless of whether it maps to a known `ProcessExitCode`) into
/// a human-readable string, qualified by whether termination was
/// expected (the supervisor itself asked the process to stop).
pub fn exit_code_string(code: i32, expected: bool) -> String {
    match ProcessExitCode::from_code(code) {
        Some(ProcessExitCode::Normal) => "exited normally".to_string(),
        Some(known) if expected => format!("exited normally ({known:?})"),
        Some(known) => format!("exited abnormally: {known:?} ({code})"),
        None => format!("exited with unrecognized code {code}"),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn normal_exit_is_friendly() {
        assert_eq!(exit_code_string(0, false), "exited normally");
    }

    #[test]
    fn unknown_code_is_reported() {
        assert_eq!(exit_code_string(42, false), "exited with unrecognized code 42");
    }

    #[test]
    fn round_trips_known_codes() {
        for code in [0, 1, 2, 5, 6, 7, 8, 9, 13, 14, 20, 21] {
            assert_eq!(ProcessExitCode::from_code(code).unwrap().code(), code);
        }
    }
}
