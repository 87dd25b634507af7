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

//! The fixed 56-byte registration header a worker sends its supervisor
//! as the very first thing on a freshly accepted IPC connection.

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::address::Address;
use crate::error::MessageFormatError;
use crate::uuid_id::Uuid;

pub const REGISTRATION_MAGIC: u64 = 0x0104_0203_0906_0201;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RegistrationType {
    Client = 0,
    Node = 1,
    Executor = 2,
    Control = 3,
}

impl RegistrationType {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(RegistrationType::Client),
            1 => Some(RegistrationType::Node),
            2 => Some(RegistrationType::Executor),
            3 => Some(RegistrationType::Control),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrationData {
    pub magic: u64,
    pub api_version_major: u16,
    pub api_version_minor: u16,
    pub api_version_patch: u16,
    pub session_id: Uuid,
    pub node_id: Uuid,
    pub computation_id: Uuid,
    pub registration_type: u32,
}

impl RegistrationData {
    pub fn new(
        session_id: Uuid,
        node_id: Uuid,
        computation_id: Uuid,
        registration_type: RegistrationType,
        api_version: (u16, u16, u16),
    ) -> Self {
        RegistrationData {
            magic: REGISTRATION_MAGIC,
            api_version_major: api_version.0,
            api_version_minor: api_version.1,
            api_version_patch: api_version.2,
            session_id,
            node_id,
            computation_id,
            registration_type: registration_type as u32,
        }
    }

    pub fn is_valid_magic(&self) -> bool {
        self.magic == REGISTRATION_MAGIC
    }

    pub fn to_address(&self) -> Address {
        Address { session: self.session_id, node: self.node_id, computation: self.computation_id }
    }

    pub fn write_wire(&self, w: &mut dyn Write) -> std::io::Result<()> {
        w.write_u64::<LittleEndian>(self.magic)?;
        w.write_u16::<LittleEndian>(self.api_version_major)?;
        w.write_u16::<LittleEndian>(self.api_version_minor)?;
        w.write_u16::<LittleEndian>(self.api_version_patch)?;
        w.write_u16::<LittleEndian>(0)?; // reserved, kept for alignment with the 56-byte layout
        self.session_id.write_wire(w)?;
        self.node_id.write_wire(w)?;
        self.computation_id.write_wire(w)?;
        w.write_u32::<LittleEndian>(self.registration_type)
    }

    pub fn read_wire(r: &mut dyn Read) -> Result<Self, MessageFormatError> {
        let magic = r.read_u64::<LittleEndian>()?;
        let api_version_major = r.read_u16::<LittleEndian>()?;
        let api_version_minor = r.read_u16::<LittleEndian>()?;
        let api_version_patch = r.read_u16::<LittleEndian>()?;
        let _reserved = r.read_u16::<LittleEndian>()?;
        let session_id = Uuid::read_wire(r)?;
        let node_id = Uuid::read_wire(r)?;
        let computation_id = Uuid::read_wire(r)?;
        let registration_type = r.read_u32::<LittleEndian>()?;
        Ok(RegistrationData {
            magic,
            api_version_major,
            api_version_minor,
            api_version_patch,
            session_id,
            node_id,
            computation_id,
            registration_type,
        })
    }
}

pub const WIRE_SIZE: usize = 8 + 2 + 2 + 2 + 2 + 16 + 16 + 16 + 4;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wire_size_is_56_bytes() {
        assert_eq!(WIRE_SIZE, 56);
    }

    #[test]
    fn round_trips() {
        let reg = RegistrationData::new(
            Uuid::generate(),
            Uuid::generate(),
            Uuid::generate(),
            RegistrationType::Executor,
            (4, 0, 0),
        );
        let mut buf = Vec::new();
        reg.write_wire(&mut buf).unwrap();
        assert_eq!(buf.len(), WIRE_SIZE);
        let back = RegistrationData::read_wire(&mut &buf[..]).unwrap();
        assert_eq!(back, reg);
        assert!(back.is_valid_magic());
    }

    #[test]
    fn rejects_bad_magic() {
        let mut reg = RegistrationData::new(
            Uuid::generate(),
            Uuid::generate(),
            Uuid::generate(),
            RegistrationType::Executor,
            (4, 0, 0),
        );
        reg.magic = 0xdead_beef;
        assert!(!reg.is_valid_magic());
    }
}
