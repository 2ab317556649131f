//! Hub control PDUs and their wire codec.
//!
//! Every PDU starts with a one byte tag. Strings are a big-endian `u32` byte
//! length followed by UTF-8, a set of strings is a `u32` count followed by that
//! many strings, durations are big-endian `u64` milliseconds and ports `u32`.
//!
//! ```text
//! ┌─────┬──────────────────────────────────┐
//! │ tag │ payload (depends on tag)         │
//! │ u8  │                                  │
//! └─────┴──────────────────────────────────┘
//! ```

use crate::error::{Error, Result};
use bytes::{Buf, BufMut, BytesMut};
use std::collections::BTreeSet;
use tokio_util::codec::{Decoder, Encoder};

/// Longest peer id accepted on the wire, in bytes.
pub const MAX_STRING_LEN: usize = 64 * 1024;

/// Largest peer set accepted in a status reply.
pub const MAX_SET_LEN: usize = 65_536;

/// Largest encoded PDU, whatever its field counts.
pub const MAX_PDU_LEN: usize = 4 * 1024 * 1024;

const TAG_REGISTER: u8 = 0;
const TAG_HUB_STATUS_RQ: u8 = 1;
const TAG_HUB_STATUS_RPLY: u8 = 2;
const TAG_CONNECT_PEER_RQ: u8 = 3;
const TAG_CONNECT_PEER_NEW_CONNECTION_RPLY: u8 = 4;
const TAG_SILENT_RQ: u8 = 5;
const TAG_SILENT_RPLY: u8 = 6;
const TAG_CHANNEL_CLEAR: u8 = 7;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubPdu {
    /// First PDU a connector sends.
    Register { peer_id: String },
    HubStatusRq,
    HubStatusRply { peer_ids: BTreeSet<String> },
    ConnectPeerRq { target_peer_id: String },
    /// Reserved for bridging over a fresh connection, not acted on.
    ConnectPeerNewConnectionRply { port: u32, peer_id: String },
    SilentRq { wait_duration_ms: u64 },
    SilentRply { wait_duration_ms: u64 },
    /// Ends a silence negotiation, the stream carries raw data afterwards.
    ChannelClear {
        source_peer_id: String,
        target_peer_id: String,
        max_idle_ms: u64,
    },
}

impl HubPdu {
    pub fn tag(&self) -> u8 {
        match self {
            HubPdu::Register { .. } => TAG_REGISTER,
            HubPdu::HubStatusRq => TAG_HUB_STATUS_RQ,
            HubPdu::HubStatusRply { .. } => TAG_HUB_STATUS_RPLY,
            HubPdu::ConnectPeerRq { .. } => TAG_CONNECT_PEER_RQ,
            HubPdu::ConnectPeerNewConnectionRply { .. } => TAG_CONNECT_PEER_NEW_CONNECTION_RPLY,
            HubPdu::SilentRq { .. } => TAG_SILENT_RQ,
            HubPdu::SilentRply { .. } => TAG_SILENT_RPLY,
            HubPdu::ChannelClear { .. } => TAG_CHANNEL_CLEAR,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            HubPdu::Register { .. } => "register",
            HubPdu::HubStatusRq => "hub status rq",
            HubPdu::HubStatusRply { .. } => "hub status rply",
            HubPdu::ConnectPeerRq { .. } => "connect peer rq",
            HubPdu::ConnectPeerNewConnectionRply { .. } => "connect peer new connection rply",
            HubPdu::SilentRq { .. } => "silent rq",
            HubPdu::SilentRply { .. } => "silent rply",
            HubPdu::ChannelClear { .. } => "channel clear",
        }
    }

    /// Append the complete encoding of this PDU to `dst`.
    pub fn encode_into(&self, dst: &mut BytesMut) -> Result<()> {
        let start = dst.len();
        if let Err(e) = self.encode_fields(dst) {
            dst.truncate(start);
            return Err(e);
        }
        if dst.len() - start > MAX_PDU_LEN {
            let len = dst.len() - start;
            dst.truncate(start);
            return Err(too_large(len));
        }
        Ok(())
    }

    fn encode_fields(&self, dst: &mut BytesMut) -> Result<()> {
        dst.put_u8(self.tag());
        match self {
            HubPdu::Register { peer_id } => put_string(dst, peer_id)?,
            HubPdu::HubStatusRq => {}
            HubPdu::HubStatusRply { peer_ids } => {
                if peer_ids.len() > MAX_SET_LEN {
                    return Err(Error::protocol(format!(
                        "peer set too large: {} > {}",
                        peer_ids.len(),
                        MAX_SET_LEN
                    )));
                }
                dst.put_u32(peer_ids.len() as u32);
                for id in peer_ids {
                    put_string(dst, id)?;
                }
            }
            HubPdu::ConnectPeerRq { target_peer_id } => put_string(dst, target_peer_id)?,
            HubPdu::ConnectPeerNewConnectionRply { port, peer_id } => {
                dst.put_u32(*port);
                put_string(dst, peer_id)?;
            }
            HubPdu::SilentRq { wait_duration_ms } | HubPdu::SilentRply { wait_duration_ms } => {
                dst.put_u64(*wait_duration_ms)
            }
            HubPdu::ChannelClear {
                source_peer_id,
                target_peer_id,
                max_idle_ms,
            } => {
                put_string(dst, source_peer_id)?;
                put_string(dst, target_peer_id)?;
                dst.put_u64(*max_idle_ms);
            }
        }
        Ok(())
    }

    pub fn write_to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf)?;
        Ok(buf.to_vec())
    }

    /// Parse a buffer holding exactly one PDU.
    pub fn parse_from_bytes(buf: &[u8]) -> Result<HubPdu> {
        match parse(buf)? {
            Parsed::Done(pdu, n) if n == buf.len() => Ok(pdu),
            Parsed::Done(pdu, n) => Err(Error::protocol(format!(
                "{} trailing bytes after {}",
                buf.len() - n,
                pdu.name()
            ))),
            Parsed::Need(_) => Err(Error::protocol("truncated pdu")),
        }
    }
}

fn too_large(len: usize) -> Error {
    Error::protocol(format!("pdu too large: {} > {}", len, MAX_PDU_LEN))
}

fn put_string(dst: &mut BytesMut, s: &str) -> Result<()> {
    if s.len() > MAX_STRING_LEN {
        return Err(Error::protocol(format!(
            "string too long: {} > {}",
            s.len(),
            MAX_STRING_LEN
        )));
    }
    dst.put_u32(s.len() as u32);
    dst.put_slice(s.as_bytes());
    Ok(())
}

// Yields `None` from the enclosing parser when the buffer ends early.
macro_rules! need {
    ($e:expr) => {
        match $e {
            Some(v) => v,
            None => return Ok(None),
        }
    };
}

struct Cursor<'a> {
    buf: &'a [u8],
    total: usize,
    /// Length the input must reach for the failed `take` to succeed.
    need: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            total: buf.len(),
            need: 0,
        }
    }

    fn consumed(&self) -> usize {
        self.total - self.buf.len()
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.buf.len() < n {
            self.need = self.consumed() + n;
            return None;
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Some(head)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u32(&mut self) -> Option<u32> {
        self.take(4).map(|mut b| b.get_u32())
    }

    fn u64(&mut self) -> Option<u64> {
        self.take(8).map(|mut b| b.get_u64())
    }

    fn string(&mut self) -> Result<Option<String>> {
        let len = need!(self.u32()) as usize;
        if len > MAX_STRING_LEN {
            return Err(Error::protocol(format!(
                "string too long: {} > {}",
                len, MAX_STRING_LEN
            )));
        }
        let raw = need!(self.take(len));
        String::from_utf8(raw.to_vec())
            .map(Some)
            .map_err(|_| Error::protocol("peer id is not valid utf-8"))
    }
}

enum Parsed {
    /// The PDU and the number of bytes it occupied.
    Done(HubPdu, usize),
    /// Incomplete, nothing can be decided before the input has this length.
    Need(usize),
}

/// Try to parse one PDU from the front of `buf`.
fn parse(buf: &[u8]) -> Result<Parsed> {
    let mut c = Cursor::new(buf);
    let parsed = match parse_pdu(&mut c)? {
        Some(pdu) => Parsed::Done(pdu, c.consumed()),
        None => Parsed::Need(c.need),
    };
    match parsed {
        Parsed::Done(_, n) | Parsed::Need(n) if n > MAX_PDU_LEN => Err(too_large(n)),
        parsed => Ok(parsed),
    }
}

fn parse_pdu(c: &mut Cursor<'_>) -> Result<Option<HubPdu>> {
    let tag = need!(c.u8());

    let pdu = match tag {
        TAG_REGISTER => HubPdu::Register {
            peer_id: need!(c.string()?),
        },
        TAG_HUB_STATUS_RQ => HubPdu::HubStatusRq,
        TAG_HUB_STATUS_RPLY => {
            let count = need!(c.u32()) as usize;
            if count > MAX_SET_LEN {
                return Err(Error::protocol(format!(
                    "peer set too large: {} > {}",
                    count, MAX_SET_LEN
                )));
            }
            let mut peer_ids = BTreeSet::new();
            for _ in 0..count {
                let id = need!(c.string()?);
                if !peer_ids.insert(id) {
                    return Err(Error::protocol("duplicate peer id in status reply"));
                }
            }
            HubPdu::HubStatusRply { peer_ids }
        }
        TAG_CONNECT_PEER_RQ => HubPdu::ConnectPeerRq {
            target_peer_id: need!(c.string()?),
        },
        TAG_CONNECT_PEER_NEW_CONNECTION_RPLY => {
            let port = need!(c.u32());
            HubPdu::ConnectPeerNewConnectionRply {
                port,
                peer_id: need!(c.string()?),
            }
        }
        TAG_SILENT_RQ => HubPdu::SilentRq {
            wait_duration_ms: need!(c.u64()),
        },
        TAG_SILENT_RPLY => HubPdu::SilentRply {
            wait_duration_ms: need!(c.u64()),
        },
        TAG_CHANNEL_CLEAR => {
            let source_peer_id = need!(c.string()?);
            let target_peer_id = need!(c.string()?);
            HubPdu::ChannelClear {
                source_peer_id,
                target_peer_id,
                max_idle_ms: need!(c.u64()),
            }
        }
        unknown => return Err(Error::protocol(format!("unknown pdu tag {}", unknown))),
    };

    Ok(Some(pdu))
}

/// Framing codec for [`HubPdu`]. A PDU is only taken off the buffer once it is
/// complete, so bytes following it stay untouched for whoever reads next.
#[derive(Debug, Default)]
pub struct PduCodec {
    /// Buffer length below which the pending PDU is known to be incomplete.
    need: usize,
}

impl Decoder for PduCodec {
    type Item = HubPdu;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<HubPdu>> {
        if src.len() < self.need {
            return Ok(None);
        }
        match parse(&src[..])? {
            Parsed::Done(pdu, n) => {
                self.need = 0;
                src.advance(n);
                Ok(Some(pdu))
            }
            Parsed::Need(n) => {
                self.need = n;
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<HubPdu>> {
        match self.decode(src)? {
            Some(pdu) => Ok(Some(pdu)),
            None if src.is_empty() => Ok(None),
            None => Err(Error::protocol(format!(
                "stream ended inside a pdu ({} bytes pending)",
                src.len()
            ))),
        }
    }
}

impl Encoder<&HubPdu> for PduCodec {
    type Error = Error;

    fn encode(&mut self, pdu: &HubPdu, dst: &mut BytesMut) -> Result<()> {
        pdu.encode_into(dst)
    }
}
