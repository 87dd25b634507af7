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

//! Builds and holds the per-session `RoutingTable`, and resolves
//! outbound destinations for a source computation. Construction is the
//! expensive part; once built, a table is read-only and can be shared
//! freely, which is why `Addresser` guards only the *pointer* to the
//! current table with a mutex rather than the table's contents.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use arras_protocol::{Address, Uuid};

use crate::error::InternalError;
use crate::routing::computation_map::ComputationMap;

/// `routingName -> destinations`, plus a fallback list and the full
/// broadcast set. Built once from a source computation's filter rules
/// and never mutated afterward.
pub struct RoutingTable {
    source_address: Address,
    message_address_map: HashMap<String, Vec<Address>>,
    default_destinations: Vec<Address>,
    all_addresses: Vec<Address>,
}

impl RoutingTable {
    /// An empty table that routes nothing; used when the source
    /// computation has no entry in the computation map.
    pub fn empty() -> Self {
        RoutingTable {
            source_address: Address::NULL,
            message_address_map: HashMap::new(),
            default_destinations: Vec::new(),
            all_addresses: Vec::new(),
        }
    }

    /// Builds a table for messages originating at `source_comp_id`, from
    /// the message-filters object under `routing/messageFilters` in the
    /// coordinator's session data: `{ sourceName: { destName: {accept:
    /// [...]} | {ignore: [...]} | {} } }`.
    pub fn build(
        source_comp_id: Uuid,
        comp_map: &ComputationMap,
        message_filters: &serde_json::Value,
    ) -> Result<Self, InternalError> {
        let all_addresses = comp_map.all_addresses(false);

        let source_address = match comp_map.computation_address(source_comp_id) {
            Ok(addr) => addr,
            Err(_) => return Ok(RoutingTable::empty()),
        };

        let source_name = comp_map.computation_name(source_comp_id)?;
        let filters = message_filters.get(source_name);

        let mut message_address_map: HashMap<String, Vec<Address>> = HashMap::new();
        let mut default_destinations: Vec<Address> = Vec::new();

        if let Some(filters) = filters.and_then(|f| f.as_object()) {
            for (dest_name, dest_filter) in filters {
                let dest_addr = comp_map.computation_address_by_name(dest_name)?;

                let accepts = dest_filter.get("accept").and_then(|v| v.as_array());
                let mut found_an_accept = false;
                if let Some(accepts) = accepts {
                    for accept in accepts {
                        if let Some(msg) = accept.as_str() {
                            let entry = message_address_map.entry(msg.to_string()).or_insert_with(|| default_destinations.clone());
                            entry.push(dest_addr);
                            found_an_accept = true;
                        }
                    }
                }
                if found_an_accept {
                    continue;
                }

                let mut ignore_set: HashSet<String> = HashSet::new();
                if let Some(ignores) = dest_filter.get("ignore").and_then(|v| v.as_array()) {
                    for ignore in ignores {
                        if let Some(msg) = ignore.as_str() {
                            ignore_set.insert(msg.to_string());
                        }
                    }
                }

                for (name, addrs) in message_address_map.iter_mut() {
                    if ignore_set.remove(name) {
                        // this destination ignores `name`; leave its entry unmodified
                    } else {
                        addrs.push(dest_addr);
                    }
                }

                for name in ignore_set {
                    message_address_map.insert(name, default_destinations.clone());
                }

                default_destinations.push(dest_addr);
            }
        }

        Ok(RoutingTable { source_address, message_address_map, default_destinations, all_addresses })
    }

    pub fn source_address(&self) -> Address {
        self.source_address
    }

    pub fn addresses(&self, routing_name: &str) -> &[Address] {
        self.message_address_map.get(routing_name).map(Vec::as_slice).unwrap_or(&self.default_destinations)
    }

    pub fn all_addresses(&self) -> &[Address] {
        &self.all_addresses
    }
}

/// Destination hint a sender can pass to `Addresser::resolve` to
/// override routing-name-based lookup.
pub enum SendTo {
    /// Resolve via the routing table's per-name / default mapping.
    RoutingName(String),
    /// Send to exactly these addresses.
    Explicit(Vec<Address>),
    /// Send to every non-client computation in the session.
    All,
}

/// Holds the current `RoutingTable` behind a mutex; `update` swaps in a
/// freshly built table atomically so in-flight sends never see a
/// half-updated table.
pub struct Addresser {
    table: Mutex<Arc<RoutingTable>>,
}

impl Addresser {
    pub fn new(table: RoutingTable) -> Self {
        Addresser { table: Mutex::new(Arc::new(table)) }
    }

    pub fn update(&self, table: RoutingTable) {
        *self.table.lock().expect("addresser mutex poisoned") = Arc::new(table);
    }

    pub fn current(&self) -> Arc<RoutingTable> {
        self.table.lock().expect("addresser mutex poisoned").clone()
    }

    /// Resolves `send_to` against the current table and stamps `from`
    /// with the table's recorded source address.
    pub fn resolve(&self, send_to: &SendTo) -> (Address, Vec<Address>) {
        let table = self.current();
        let to = match send_to {
            SendTo::Explicit(addrs) => addrs.clone(),
            SendTo::RoutingName(name) => table.addresses(name).to_vec(),
            SendTo::All => table.all_addresses().to_vec(),
        };
        (table.source_address(), to)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn two_comp_map() -> (ComputationMap, Uuid, Uuid) {
        let session_id = Uuid::generate();
        let node_id = Uuid::generate();
        let comp1 = Uuid::generate();
        let comp2 = Uuid::generate();
        let data = json!({
            "comp1": { "compId": comp1.to_string(), "nodeId": node_id.to_string() },
            "comp2": { "compId": comp2.to_string(), "nodeId": node_id.to_string() },
        });
        (ComputationMap::new(session_id, &data).unwrap(), comp1, comp2)
    }

    #[test]
    fn unmentioned_routing_name_falls_back_to_default() {
        let (map, comp1, comp2) = two_comp_map();
        let filters = json!({ "comp1": { "comp2": {} } });
        let table = RoutingTable::build(comp1, &map, &filters).unwrap();
        let to = table.addresses("anything");
        assert_eq!(to, &[map.computation_address(comp2).unwrap()]);
    }

    #[test]
    fn accept_list_restricts_to_named_messages_only() {
        let (map, comp1, comp2) = two_comp_map();
        let filters = json!({ "comp1": { "comp2": { "accept": ["foo"] } } });
        let table = RoutingTable::build(comp1, &map, &filters).unwrap();
        assert_eq!(table.addresses("foo"), &[map.computation_address(comp2).unwrap()]);
        assert!(table.addresses("bar").is_empty());
    }

    #[test]
    fn ignore_list_excludes_named_messages_from_that_destination() {
        let (map, comp1, comp2) = two_comp_map();
        let filters = json!({ "comp1": { "comp2": { "ignore": ["foo"] } } });
        let table = RoutingTable::build(comp1, &map, &filters).unwrap();
        assert!(table.addresses("foo").is_empty());
        assert_eq!(table.addresses("bar"), &[map.computation_address(comp2).unwrap()]);
    }

    #[test]
    fn update_is_visible_to_subsequent_resolves() {
        let (map, comp1, comp2) = two_comp_map();
        let empty_filters = json!({});
        let table1 = RoutingTable::build(comp1, &map, &empty_filters).unwrap();
        let addresser = Addresser::new(table1);
        let (_, to1) = addresser.resolve(&SendTo::RoutingName("A".to_string()));
        assert!(to1.is_empty());

        let updated_filters = json!({ "comp1": { "comp2": {} } });
        let table2 = RoutingTable::build(comp1, &map, &updated_filters).unwrap();
        addresser.update(table2);
        let (_, to2) = addresser.resolve(&SendTo::RoutingName("A".to_string()));
        assert_eq!(to2, vec![map.computation_address(comp2).unwrap()]);
    }
}
