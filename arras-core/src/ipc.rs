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

//! Frame-level transport over the worker's single IPC connection:
//! `openFrame(size)`/`closeFrame()` on the wire become a `u32` length
//! prefix followed by that many bytes. One frame carries exactly one
//! serialized `Envelope` (see `arras_protocol::envelope`), except for
//! the very first frame-less write on a freshly accepted connection,
//! which is the fixed-size `RegistrationData` header.

use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

/// Caps a single frame so a corrupt length prefix can't trigger an
/// unbounded allocation before the frame has even been validated.
const MAX_FRAME_LEN: u32 = 256 * 1024 * 1024;

pub fn write_frame(w: &mut dyn Write, bytes: &[u8]) -> io::Result<()> {
    w.write_u32::<LittleEndian>(bytes.len() as u32)?;
    w.write_all(bytes)?;
    w.flush()
}

/// Reads one complete frame. `Ok(None)` signals a clean EOF between
/// frames (the peer closed its write half); anything else is an error.
pub fn read_frame(r: &mut dyn Read) -> io::Result<Option<Vec<u8>>> {
    let len = match r.read_u32::<LittleEndian>() {
        Ok(len) => len,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, format!("frame length {len} exceeds maximum")));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    Ok(Some(buf))
}

/// The two halves of a worker's IPC connection, split so the reader
/// and writer threads can each own one independently. `shutdown` on
/// either half unblocks a blocking read/write on the other, mirroring
/// `ThreadsafeQueue::shutdown`'s cooperative-cancellation contract.
pub struct IpcConnection {
    stream: UnixStream,
}

impl IpcConnection {
    pub fn new(stream: UnixStream) -> Self {
        IpcConnection { stream }
    }

    pub fn split(&self) -> io::Result<(IpcReader, IpcWriter)> {
        let reader = self.stream.try_clone()?;
        let writer = self.stream.try_clone()?;
        Ok((IpcReader(reader), IpcWriter(writer)))
    }

    pub fn shutdown(&self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

pub struct IpcReader(UnixStream);
impl Read for IpcReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

pub struct IpcWriter(UnixStream);
impl Write for IpcWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }
    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

/// Shared handle used to shut down both halves of a connection from
/// whichever thread (reader, writer, or the dispatcher's `postQuit`)
/// notices a fatal condition first.
#[derive(Clone)]
pub struct ShutdownHandle(Arc<UnixStream>);

impl ShutdownHandle {
    pub fn new(stream: UnixStream) -> Self {
        ShutdownHandle(Arc::new(stream))
    }

    pub fn shutdown(&self) {
        let _ = self.0.shutdown(std::net::Shutdown::Both);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn frame_round_trips() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello").unwrap();
        let framed = read_frame(&mut &buf[..]).unwrap().unwrap();
        assert_eq!(framed, b"hello");
    }

    #[test]
    fn empty_read_is_clean_eof() {
        let mut empty: &[u8] = &[];
        assert!(read_frame(&mut empty).unwrap().is_none());
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut buf = Vec::new();
        buf.write_u32::<LittleEndian>(MAX_FRAME_LEN + 1).unwrap();
        assert!(read_frame(&mut &buf[..]).is_err());
    }
}
