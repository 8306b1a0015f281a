// Copyright 2024 Google LLC
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

use std::{
    fmt,
    io::{Read, Write},
    net::{Shutdown, SocketAddr, TcpStream},
};

use anyhow::{anyhow, Context};
use byteorder::{LittleEndian, ReadBytesExt as _, WriteBytesExt as _};
use jarpool_protocol::{Reply, Request};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use super::consts;

/// The frame length header named a payload above the cap. Typed
/// so the daemon can answer with invalid_request instead of just
/// dropping the connection.
#[derive(Debug, PartialEq, Eq)]
pub struct OversizeFrame {
    pub size: u32,
}

impl fmt::Display for OversizeFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "frame of size {} exceeds size limit of {} bytes",
            self.size,
            consts::MAX_FRAME_BYTES
        )
    }
}

impl std::error::Error for OversizeFrame {}

/// Read one length-prefixed frame: a 4 byte little endian unsigned
/// length followed by that many payload bytes.
///
/// `read_exact` supplies the short-read loop; a peer that hangs up
/// mid frame surfaces as an UnexpectedEof error.
pub fn read_frame<R>(r: &mut R) -> anyhow::Result<Vec<u8>>
where
    R: Read,
{
    let len = r.read_u32::<LittleEndian>().context("reading frame length")?;
    if len > consts::MAX_FRAME_BYTES {
        return Err(anyhow::Error::new(OversizeFrame { size: len }));
    }

    let mut buf = vec![0; len as usize];
    r.read_exact(&mut buf).context("reading frame payload")?;
    Ok(buf)
}

/// Write one length-prefixed frame. `write_all` loops over short
/// writes and reports a zero-byte transfer as a WriteZero error,
/// which is how a broken peer shows up here.
pub fn write_frame<W>(w: &mut W, payload: &[u8]) -> anyhow::Result<()>
where
    W: Write,
{
    if payload.len() as u64 > consts::MAX_FRAME_BYTES as u64 {
        return Err(anyhow!(
            "frame of size {} exceeds size limit of {} bytes",
            payload.len(),
            consts::MAX_FRAME_BYTES
        ));
    }

    w.write_u32::<LittleEndian>(payload.len() as u32).context("writing frame length")?;
    w.write_all(payload).context("writing frame payload")?;
    w.flush().context("flushing frame")?;
    Ok(())
}

/// The centralized encoding function that should be used for all
/// protocol serialization.
pub fn encode_to<T, W>(d: &T, w: &mut W) -> anyhow::Result<()>
where
    T: Serialize,
    W: Write,
{
    let payload = serde_json::to_vec(d).context("serializing data")?;
    write_frame(w, &payload)
}

/// The centralized decoding function that should be used for all
/// protocol deserialization.
pub fn decode_from<T, R>(r: &mut R) -> anyhow::Result<T>
where
    for<'de> T: Deserialize<'de>,
    R: Read,
{
    let payload = read_frame(r)?;
    let d = serde_json::from_slice(&payload).context("deserializing frame")?;
    Ok(d)
}

/// A blocking client for the daemon's request/response protocol.
///
/// Every request rides its own TCP connection: connect, write one
/// frame, read one frame, close. That is the whole protocol, so
/// the client just remembers where to dial.
pub struct Client {
    addr: SocketAddr,
}

impl Client {
    pub fn new(port: u16) -> Self {
        Client { addr: SocketAddr::from(([127, 0, 0, 1], port)) }
    }

    #[instrument(skip_all)]
    pub fn request(&self, request: &Request) -> anyhow::Result<Reply> {
        let mut stream = TcpStream::connect(self.addr)
            .with_context(|| format!("connecting to jarpool daemon at {}", self.addr))?;
        encode_to(request, &mut stream).context("writing request")?;
        let reply = decode_from(&mut stream).context("reading reply")?;
        let _ = stream.shutdown(Shutdown::Both);
        Ok(reply)
    }

    /// Open a session and hand back the sid, failing on any
    /// non-success reply.
    pub fn open_session(&self) -> anyhow::Result<String> {
        match self.request(&Request::NewSession)? {
            Reply::SessionCreated { sid } => Ok(sid),
            Reply::Failed { reason } => Err(anyhow!("could not open session: {}", reason)),
            other => Err(anyhow!("unexpected reply to new_session: {:?}", other)),
        }
    }
}

/// Map a reply onto the CLI's exit-code policy: `ok`-style replies
/// succeed, anything else is an error carrying the daemon's reason.
pub fn expect_ok(reply: Reply) -> anyhow::Result<()> {
    match reply {
        Reply::Ok => Ok(()),
        Reply::Failed { reason } => Err(anyhow!("{}", reason)),
        Reply::InvalidRequest { reason } => Err(anyhow!("invalid request: {}", reason)),
        other => Err(anyhow!("unexpected reply: {:?}", other)),
    }
}
