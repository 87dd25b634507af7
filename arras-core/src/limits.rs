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

//! System-level limits applied to a running computation: core/thread
//! count, optional memory ceiling, and optional CPU pinning. Parsed
//! from the computation's own config block and applied once, when the
//! dispatcher transitions into `Dispatching`.

use tracing::error;

/// `unlimited` disables every other field; a fresh `ExecutionLimits`
/// defaults to unlimited so computations that don't specify limits get
/// the previous unrestricted behavior.
#[derive(Debug, Clone)]
pub struct ExecutionLimits {
    unlimited: bool,
    max_memory_mb: u32,
    max_cores: u32,
    threads_per_core: u32,
    cpu_set: Option<Vec<u32>>,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        ExecutionLimits { unlimited: true, max_memory_mb: 2048, max_cores: 1, threads_per_core: 1, cpu_set: None }
    }
}

impl ExecutionLimits {
    pub fn new(max_memory_mb: u32, max_cores: u32, threads_per_core: u32) -> Self {
        ExecutionLimits { unlimited: false, max_memory_mb, max_cores, threads_per_core, cpu_set: None }
    }

    /// Parses the optional `unlimited`, `maxMemoryMB`, `maxCores`,
    /// `threadsPerCore`, `useAffinity`/`cpuSet`/`hyperthreadCpuSet` keys
    /// out of a computation's config block. Logs and refuses malformed
    /// input rather than silently falling back to defaults.
    pub fn from_json(obj: &serde_json::Value) -> Result<Self, String> {
        let mut limits = ExecutionLimits::default();
        limits.unlimited = obj.get("unlimited").and_then(|v| v.as_bool()).unwrap_or(false);

        if let Some(v) = obj.get("maxMemoryMB") {
            match v.as_u64() {
                Some(n) if n > 0 => limits.max_memory_mb = n as u32,
                _ => {
                    error!("invalid config: computation limit 'maxMemoryMB' must be a positive integer");
                    return Err("invalid maxMemoryMB".to_string());
                }
            }
        }
        if let Some(v) = obj.get("maxCores") {
            match v.as_u64() {
                Some(n) if n > 0 => limits.max_cores = n as u32,
                _ => {
                    error!("invalid config: computation limit 'maxCores' must be a positive integer");
                    return Err("invalid maxCores".to_string());
                }
            }
        }
        if let Some(v) = obj.get("threadsPerCore") {
            match v.as_u64() {
                Some(n) if n > 0 => limits.threads_per_core = n as u32,
                _ => {
                    error!("invalid config: computation limit 'threadsPerCore' must be a positive integer");
                    return Err("invalid threadsPerCore".to_string());
                }
            }
        }

        if let Some(use_affinity) = obj.get("useAffinity").and_then(|v| v.as_bool()) {
            if use_affinity {
                let cpu_set = obj.get("cpuSet").and_then(|v| v.as_str()).unwrap_or("");
                let ht_cpu_set = obj.get("hyperthreadCpuSet").and_then(|v| v.as_str()).unwrap_or("");
                limits
                    .enable_affinity(cpu_set, ht_cpu_set)
                    .map_err(|e| { error!("invalid config: {e}"); e })?;
            }
        } else if obj.get("useAffinity").is_some() || obj.get("cpuSet").is_some() || obj.get("hyperthreadCpuSet").is_some()
        {
            error!("invalid config: invalid cpu affinity settings for computation");
            return Err("invalid cpu affinity settings".to_string());
        }
        Ok(limits)
    }

    pub fn unlimited(&self) -> bool {
        self.unlimited
    }

    pub fn max_threads(&self) -> u32 {
        self.max_cores * self.threads_per_core
    }

    pub fn uses_affinity(&self) -> bool {
        self.cpu_set.is_some()
    }

    /// Parses `"1,2,3"`-style comma lists; `hyperthread_cpus` is
    /// combined in when `threads_per_core > 1`.
    pub fn enable_affinity(&mut self, cpus: &str, hyperthread_cpus: &str) -> Result<(), String> {
        let primary = parse_cpu_list(cpus, self.max_cores)?;
        let mut combined = primary.clone();
        if self.threads_per_core > 1 {
            let ht = parse_cpu_list(hyperthread_cpus, self.max_cores * (self.threads_per_core - 1))?;
            if primary.iter().any(|c| ht.contains(c)) {
                return Err("regular and hyperthread cpu affinity sets may not overlap".to_string());
            }
            combined.extend(ht);
        }
        self.cpu_set = Some(combined);
        Ok(())
    }

    pub fn disable_affinity(&mut self) {
        self.cpu_set = None;
    }

    /// Pins the whole process to the configured cpu set. Arras 3's
    /// behavior (apply to the process, not just the handler thread) is
    /// preserved here for compatibility. No-op when `unlimited` or no
    /// affinity is configured.
    #[cfg(unix)]
    pub fn apply(&self) {
        if self.unlimited {
            return;
        }
        if let Some(cpus) = &self.cpu_set {
            let mut set = nix::sched::CpuSet::new();
            for &cpu in cpus {
                if let Err(e) = set.set(cpu as usize) {
                    error!(cpu, error = %e, "failed to add cpu to affinity set");
                }
            }
            if let Err(e) = nix::sched::sched_setaffinity(nix::unistd::Pid::from_raw(0), &set) {
                error!(error = %e, "failed to apply cpu affinity to process");
            }
        }
    }

    #[cfg(not(unix))]
    pub fn apply(&self) {}
}

fn parse_cpu_list(list: &str, required_count: u32) -> Result<Vec<u32>, String> {
    if list.is_empty() {
        return Err("cpu affinity list is empty".to_string());
    }
    let mut cpus = Vec::new();
    for part in list.split(',') {
        let cpu: u32 = part.parse().map_err(|_| format!("invalid cpu affinity list: '{list}'"))?;
        cpus.push(cpu);
    }
    if cpus.len() as u32 != required_count {
        return Err(format!("cpu affinity list '{list}' does not contain the required {required_count} entries"));
    }
    Ok(cpus)
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_is_unlimited() {
        assert!(ExecutionLimits::default().unlimited());
    }

    #[test]
    fn parses_basic_fields() {
        let limits = ExecutionLimits::from_json(&json!({ "maxMemoryMB": 4096, "maxCores": 2, "threadsPerCore": 2 })).unwrap();
        assert!(!limits.unlimited());
        assert_eq!(limits.max_threads(), 4);
    }

    #[test]
    fn rejects_zero_cores() {
        assert!(ExecutionLimits::from_json(&json!({ "maxCores": 0 })).is_err());
    }

    #[test]
    fn affinity_sets_require_exact_count() {
        let mut limits = ExecutionLimits::new(2048, 2, 1);
        assert!(limits.enable_affinity("1,2", "").is_ok());
        assert!(limits.uses_affinity());
        let mut bad = ExecutionLimits::new(2048, 2, 1);
        assert!(bad.enable_affinity("1", "").is_err());
    }

    #[test]
    fn overlapping_hyperthread_set_is_rejected() {
        let mut limits = ExecutionLimits::new(2048, 1, 2);
        assert!(limits.enable_affinity("1", "1").is_err());
    }
}
