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

//! Maps a session's computation names/ids to addresses. Built once from
//! the routing data a coordinator hands to a node and treated as
//! read-only afterward, so no locking is needed once constructed.

use std::collections::HashMap;

use arras_protocol::{Address, Uuid};
use serde::Deserialize;

use crate::error::InternalError;

pub const CLIENT_NAME: &str = "(client)";

#[derive(Debug, Deserialize)]
struct ComputationEntry {
    #[serde(rename = "compId")]
    comp_id: String,
    #[serde(rename = "nodeId")]
    node_id: String,
}

pub struct ComputationMap {
    name_to_id: HashMap<String, Uuid>,
    id_to_name: HashMap<Uuid, String>,
    id_to_address: HashMap<Uuid, Address>,
}

impl ComputationMap {
    /// `computations` is the `routing/<sessionId>/computations` object:
    /// `{ name: {compId, nodeId} }`.
    pub fn new(session_id: Uuid, computations: &serde_json::Value) -> Result<Self, InternalError> {
        let mut name_to_id = HashMap::new();
        let mut id_to_name = HashMap::new();
        let mut id_to_address = HashMap::new();

        let obj = computations.as_object().ok_or_else(|| InternalError::new("computations routing data is not an object"))?;
        for (name, value) in obj {
            let entry: ComputationEntry = serde_json::from_value(value.clone())
                .map_err(|e| InternalError::new(format!("invalid computation entry for '{name}': {e}")))?;
            let comp_id = Uuid::parse(&entry.comp_id).map_err(|e| InternalError::new(format!("invalid compId: {e}")))?;
            let node_id = Uuid::parse(&entry.node_id).map_err(|e| InternalError::new(format!("invalid nodeId: {e}")))?;
            name_to_id.insert(name.clone(), comp_id);
            id_to_name.insert(comp_id, name.clone());
            id_to_address.insert(comp_id, Address { session: session_id, node: node_id, computation: comp_id });
        }

        name_to_id.insert(CLIENT_NAME.to_string(), Uuid::NIL);
        id_to_name.insert(Uuid::NIL, CLIENT_NAME.to_string());
        id_to_address.insert(Uuid::NIL, Address { session: session_id, node: Uuid::NIL, computation: Uuid::NIL });

        Ok(ComputationMap { name_to_id, id_to_name, id_to_address })
    }

    pub fn computation_id(&self, name: &str) -> Result<Uuid, InternalError> {
        self.name_to_id.get(name).copied().ok_or_else(|| InternalError::new(format!("computation '{name}' not found")))
    }

    pub fn computation_address(&self, id: Uuid) -> Result<Address, InternalError> {
        self.id_to_address.get(&id).copied().ok_or_else(|| InternalError::new(format!("computation id {id} not found")))
    }

    pub fn computation_address_by_name(&self, name: &str) -> Result<Address, InternalError> {
        self.computation_address(self.computation_id(name)?)
    }

    pub fn computation_name(&self, id: Uuid) -> Result<&str, InternalError> {
        self.id_to_name.get(&id).map(String::as_str).ok_or_else(|| InternalError::new(format!("computation id {id} not found")))
    }

    /// All addresses, optionally including the client stub.
    pub fn all_addresses(&self, include_client: bool) -> Vec<Address> {
        self.id_to_address
            .iter()
            .filter(|(id, _)| include_client || !id.is_null())
            .map(|(_, addr)| *addr)
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn builds_map_and_includes_client() {
        let session_id = Uuid::generate();
        let node_id = Uuid::generate();
        let comp_id = Uuid::generate();
        let data = json!({
            "comp1": { "compId": comp_id.to_string(), "nodeId": node_id.to_string() }
        });
        let map = ComputationMap::new(session_id, &data).unwrap();
        assert_eq!(map.computation_id("comp1").unwrap(), comp_id);
        assert_eq!(map.computation_id(CLIENT_NAME).unwrap(), Uuid::NIL);
        assert_eq!(map.computation_name(comp_id).unwrap(), "comp1");

        let all = map.all_addresses(false);
        assert_eq!(all.len(), 1);
        let all_with_client = map.all_addresses(true);
        assert_eq!(all_with_client.len(), 2);
    }

    #[test]
    fn unknown_lookup_fails() {
        let map = ComputationMap::new(Uuid::generate(), &json!({})).unwrap();
        assert!(map.computation_id("ghost").is_err());
    }
}
