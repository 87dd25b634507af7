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

use std::fmt;
use std::io::{Read, Write};

use crate::error::MessageFormatError;

/// A 128-bit identifier with a canonical `8-4-4-4-12` hex form.
/// Comparable, hashable, and totally ordered so it can key routing
/// tables and reassembly maps directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Uuid(uuid::Uuid);

/// `ClassID` discriminates message content types. It is structurally
/// the same type as `Uuid`; kept as an alias rather than a newtype so
/// content registries can key on it without an extra wrapper.
pub type ClassId = Uuid;

impl Uuid {
    pub const NIL: Uuid = Uuid(uuid::Uuid::nil());

    pub fn generate() -> Self {
        Uuid(uuid::Uuid::new_v4())
    }

    pub fn is_null(&self) -> bool {
        self.0.is_nil()
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Uuid(uuid::Uuid::parse_str(s)?))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Uuid(uuid::Uuid::from_bytes(bytes))
    }

    pub fn write_wire(&self, w: &mut dyn Write) -> std::io::Result<()> {
        w.write_all(self.0.as_bytes())
    }

    pub fn read_wire(r: &mut dyn Read) -> Result<Self, MessageFormatError> {
        let mut buf = [0u8; 16];
        r.read_exact(&mut buf)?;
        Ok(Uuid(uuid::Uuid::from_bytes(buf)))
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.as_hyphenated())
    }
}

impl From<uuid::Uuid> for Uuid {
    fn from(u: uuid::Uuid) -> Self {
        Uuid(u)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn generate_is_not_null() {
        assert!(!Uuid::generate().is_null());
    }

    #[test]
    fn wire_round_trip() {
        let id = Uuid::generate();
        let mut buf = Vec::new();
        id.write_wire(&mut buf).unwrap();
        let back = Uuid::read_wire(&mut &buf[..]).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn display_is_canonical_form() {
        let id = Uuid::parse("0f5db360-a67d-4485-b6a4-e1652a399925").unwrap();
        assert_eq!(id.to_string(), "0f5db360-a67d-4485-b6a4-e1652a399925");
    }

    #[test]
    fn ordering_is_total() {
        let a = Uuid::generate();
        let b = Uuid::generate();
        assert!(a == a);
        assert!((a < b) || (b < a) || a == b);
    }
}
