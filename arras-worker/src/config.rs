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

//! Loads and validates the exec-config file the local-session
//! supervisor (or a remote node daemon) writes before spawning this
//! process: `{sessionId, compId, execId, nodeId, ipc, logLevel,
//! consoleLogStyle, config: {<compName>: {...}}, routing}`.

use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context};
use arras_protocol::Uuid;
use serde::Deserialize;
use tracing::{info, instrument};

#[derive(Debug, Clone, Deserialize)]
pub struct ExecConfig {
    #[serde(rename = "sessionId")]
    pub session_id: Uuid,
    #[serde(rename = "compId")]
    pub comp_id: Uuid,
    #[serde(rename = "execId")]
    pub exec_id: Uuid,
    #[serde(rename = "nodeId")]
    pub node_id: Uuid,
    pub ipc: String,
    #[serde(rename = "logLevel", default)]
    pub log_level: i32,
    #[serde(rename = "consoleLogStyle", default)]
    pub console_log_style: i32,
    pub config: serde_json::Map<String, serde_json::Value>,
    #[serde(default = "serde_json::Value::default")]
    pub routing: serde_json::Value,
}

impl ExecConfig {
    /// The exec-config's `config` block has exactly one entry, keyed by
    /// this worker's computation name; that key doubles as the name
    /// looked up in the computation registry.
    pub fn computation_name(&self) -> anyhow::Result<&str> {
        let mut keys = self.config.keys();
        let name = keys.next().ok_or_else(|| anyhow!("exec-config 'config' block is empty"))?;
        if keys.next().is_some() {
            return Err(anyhow!("exec-config 'config' block must name exactly one computation"));
        }
        Ok(name)
    }

    pub fn computation_config(&self) -> &serde_json::Value {
        self.config.values().next().expect("computation_name already checked for exactly one entry")
    }

    pub fn routing_computations(&self) -> serde_json::Value {
        self.routing
            .get(self.session_id.to_string().as_str())
            .and_then(|s| s.get("computations"))
            .cloned()
            .unwrap_or_else(|| serde_json::json!({}))
    }

    pub fn routing_message_filter(&self) -> serde_json::Value {
        self.routing.get("messageFilter").cloned().unwrap_or_else(|| serde_json::json!({}))
    }
}

#[instrument(skip_all, fields(path = %path.as_ref().display()))]
pub fn read_config(path: impl AsRef<Path>) -> anyhow::Result<ExecConfig> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).with_context(|| format!("reading exec-config {}", path.display()))?;
    let config: ExecConfig = serde_json::from_str(&text).with_context(|| format!("parsing exec-config {}", path.display()))?;
    if config.computation_name().is_err() {
        return Err(anyhow!("exec-config 'config' block must name exactly one computation"));
    }
    info!(comp_id = %config.comp_id, name = %config.computation_name().unwrap(), "loaded exec-config");
    Ok(config)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    fn sample(name: &str) -> String {
        format!(
            r#"{{
                "sessionId": "{}", "compId": "{}", "execId": "{}", "nodeId": "{}",
                "ipc": "/tmp/exec-test.ipc", "logLevel": 1, "consoleLogStyle": 0,
                "config": {{ "{name}": {{ "maxCores": 1 }} }},
                "routing": {{}}
            }}"#,
            Uuid::generate(),
            Uuid::generate(),
            Uuid::generate(),
            Uuid::generate(),
        )
    }

    #[test]
    fn loads_single_computation_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(sample("worker").as_bytes()).unwrap();
        let config = read_config(file.path()).unwrap();
        assert_eq!(config.computation_name().unwrap(), "worker");
        assert_eq!(config.computation_config()["maxCores"], 1);
    }

    #[test]
    fn rejects_missing_file() {
        assert!(read_config("/nonexistent/exec-config.json").is_err());
    }

    #[test]
    fn rejects_multiple_computations_in_config_block() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let text = sample("worker").replace("\"config\": { \"worker\"", "\"config\": { \"extra\": {}, \"worker\"");
        file.write_all(text.as_bytes()).unwrap();
        assert!(read_config(file.path()).is_err());
    }
}
