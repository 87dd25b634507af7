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

use std::io::{Read, Write};

use crate::error::MessageFormatError;
use crate::uuid_id::Uuid;

/// `(session, node, computation)`. The null address (all three fields
/// null) denotes "no destination" / the special `(client)` endpoint
/// depending on context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
pub struct Address {
    pub session: Uuid,
    pub node: Uuid,
    pub computation: Uuid,
}

impl Address {
    pub const NULL: Address = Address { session: Uuid::NIL, node: Uuid::NIL, computation: Uuid::NIL };

    pub fn is_null(&self) -> bool {
        self.session.is_null() && self.node.is_null() && self.computation.is_null()
    }

    pub fn write_wire(&self, w: &mut dyn Write) -> std::io::Result<()> {
        self.session.write_wire(w)?;
        self.node.write_wire(w)?;
        self.computation.write_wire(w)
    }

    pub fn read_wire(r: &mut dyn Read) -> Result<Self, MessageFormatError> {
        Ok(Address {
            session: Uuid::read_wire(r)?,
            node: Uuid::read_wire(r)?,
            computation: Uuid::read_wire(r)?,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn null_address_is_null() {
        assert!(Address::NULL.is_null());
        assert!(Address::default().is_null());
    }

    #[test]
    fn non_null_address_is_not_null() {
        let addr = Address { session: Uuid::generate(), ..Default::default() };
        assert!(!addr.is_null());
    }

    #[test]
    fn wire_round_trip() {
        let addr =
            Address { session: Uuid::generate(), node: Uuid::generate(), computation: Uuid::generate() };
        let mut buf = Vec::new();
        addr.write_wire(&mut buf).unwrap();
        assert_eq!(buf.len(), 48);
        let back = Address::read_wire(&mut &buf[..]).unwrap();
        assert_eq!(addr, back);
    }
}
