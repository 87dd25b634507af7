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

//! Primitive encodings for the envelope wire format: length-prefixed
//! strings and little-endian integers, read/written directly off a
//! `std::io` stream. Every multi-byte integer on the wire is
//! little-endian, matching the stream implementation this protocol was
//! ported from.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::MessageFormatError;

/// A cap on string lengths so a corrupt length prefix can't trigger an
/// enormous allocation before we've even validated the frame.
const MAX_STRING_LEN: u64 = 1024 * 1024 * 1024;

pub trait WireWrite {
    fn write_wire(&self, w: &mut dyn Write) -> io::Result<()>;
}

pub trait WireRead: Sized {
    fn read_wire(r: &mut dyn Read) -> Result<Self, MessageFormatError>;
}

impl WireWrite for u16 {
    fn write_wire(&self, w: &mut dyn Write) -> io::Result<()> {
        w.write_u16::<LittleEndian>(*self)
    }
}
impl WireRead for u16 {
    fn read_wire(r: &mut dyn Read) -> Result<Self, MessageFormatError> {
        r.read_u16::<LittleEndian>().map_err(MessageFormatError::from)
    }
}

impl WireWrite for u32 {
    fn write_wire(&self, w: &mut dyn Write) -> io::Result<()> {
        w.write_u32::<LittleEndian>(*self)
    }
}
impl WireRead for u32 {
    fn read_wire(r: &mut dyn Read) -> Result<Self, MessageFormatError> {
        r.read_u32::<LittleEndian>().map_err(MessageFormatError::from)
    }
}

impl WireWrite for u64 {
    fn write_wire(&self, w: &mut dyn Write) -> io::Result<()> {
        w.write_u64::<LittleEndian>(*self)
    }
}
impl WireRead for u64 {
    fn read_wire(r: &mut dyn Read) -> Result<Self, MessageFormatError> {
        r.read_u64::<LittleEndian>().map_err(MessageFormatError::from)
    }
}

/// Writes a `string` per §4.1: `u32` length prefix, then raw bytes, no
/// trailing NUL.
pub fn write_string(w: &mut dyn Write, s: &str) -> io::Result<()> {
    w.write_u32::<LittleEndian>(s.len() as u32)?;
    w.write_all(s.as_bytes())
}

/// Reads a `string`. Fails with `MessageFormatError` if the length
/// prefix claims more bytes than is sane, or if the bytes contain an
/// embedded NUL or aren't valid UTF-8.
pub fn read_string(r: &mut dyn Read) -> Result<String, MessageFormatError> {
    let len = r.read_u32::<LittleEndian>()? as u64;
    read_string_body(r, len)
}

/// Writes a `longString`: a `u64` length prefix, used by chunk payloads
/// which may exceed 4 GiB in aggregate across chunks.
pub fn write_long_string(w: &mut dyn Write, s: &str) -> io::Result<()> {
    w.write_u64::<LittleEndian>(s.len() as u64)?;
    w.write_all(s.as_bytes())
}

pub fn read_long_string(r: &mut dyn Read) -> Result<String, MessageFormatError> {
    let len = r.read_u64::<LittleEndian>()?;
    read_string_body(r, len)
}

fn read_string_body(r: &mut dyn Read, len: u64) -> Result<String, MessageFormatError> {
    if len > MAX_STRING_LEN {
        return Err(MessageFormatError::LengthPrefixTooLarge { len });
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    if buf.contains(&0u8) {
        return Err(MessageFormatError::EmbeddedNul);
    }
    String::from_utf8(buf).map_err(|_| MessageFormatError::InvalidUtf8)
}

pub fn write_bytes(w: &mut dyn Write, bytes: &[u8]) -> io::Result<()> {
    w.write_u32::<LittleEndian>(bytes.len() as u32)?;
    w.write_all(bytes)
}

pub fn read_bytes(r: &mut dyn Read) -> Result<Vec<u8>, MessageFormatError> {
    let len = r.read_u32::<LittleEndian>()? as u64;
    if len > MAX_STRING_LEN {
        return Err(MessageFormatError::LengthPrefixTooLarge { len });
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    Ok(buf)
}
