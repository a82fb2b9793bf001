use crate::codec::Codec;
use crate::config::Metadata;
use crate::error::{Fault, InvokeError};
use crate::net::UnifyBufStream;
use log::*;
use std::fmt;
use std::mem::size_of;
use std::time::Duration;
use zerocopy::byteorder::{BigEndian, U16, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

pub const PROTO_VERSION: u8 = 1;
pub const FRAME_MAGIC: [u8; 2] = [b'%', b'T'];

/// Response body is an error (fault serial or handler error text)
pub const FLAG_ERROR: u16 = 1;
/// Push frame wants a runtime-level CallbackAck before the next delivery
pub const FLAG_ACK: u16 = 1 << 1;

// decode sanity bounds; a peer sending more is broken or hostile
const MAX_NAME_LEN: usize = 4 * 1024;
const MAX_META_LEN: usize = 1024 * 1024;
const MAX_BODY_LEN: usize = 64 * 1024 * 1024;

type BE = BigEndian;

/// Every exchange starts with this fixed head. Big-endian on the wire
/// since invokers cross hosts.
///
/// | 2B   |1B |1B  | 2B   | 2B      | 8B | 8B     | 8B | 4B      | 4B      |
/// | magic|ver|kind| flags| name_len| seq| session| aux| meta_len| body_len|
///
/// Variable part: name bytes, codec-encoded metadata, opaque body.
///
/// `aux` is kind-specific: Ping carries the requested lease period in
/// millis, Pong the available secondary count, CallbackPush/CallbackAck the
/// callback id.
#[derive(FromZeroes, FromBytes, AsBytes, Unaligned, Clone, Copy, Debug)]
#[repr(C)]
pub struct FrameHead {
    pub magic: [u8; 2],
    pub ver: u8,
    pub kind: u8,
    pub flags: U16<BE>,
    pub name_len: U16<BE>,
    pub seq: U64<BE>,
    pub session: U64<BE>,
    pub aux: U64<BE>,
    pub meta_len: U32<BE>,
    pub body_len: U32<BE>,
}

pub const FRAME_HEAD_LEN: usize = size_of::<FrameHead>();

impl FrameHead {
    #[inline(always)]
    pub fn decode(head_buf: &[u8]) -> Result<&Self, Fault> {
        let Some(head) = Self::ref_from(head_buf) else {
            return Err(Fault::Decode);
        };
        if head.magic != FRAME_MAGIC {
            warn!("wrong magic received: {:?}", head.magic);
            return Err(Fault::Version);
        }
        if head.ver != PROTO_VERSION {
            warn!("protocol version {} not supported", head.ver);
            return Err(Fault::Version);
        }
        Ok(head)
    }
}

impl fmt::Display for FrameHead {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "[kind:{} seq:{} session:{} aux:{} meta:{} body:{}]",
            self.kind,
            self.seq.get(),
            self.session.get(),
            self.aux.get(),
            self.meta_len.get(),
            self.body_len.get(),
        )
    }
}

#[derive(strum::FromRepr, strum::Display, PartialEq, Eq, Clone, Copy, Debug)]
#[repr(u8)]
pub enum FrameKind {
    Request = 0,
    Response = 1,
    /// Lease renewal / liveness probe; also the connect handshake
    Ping = 2,
    Pong = 3,
    /// Explicit client teardown; terminates the session lease
    Disconnect = 4,
    /// Server-originated callback on a push channel
    CallbackPush = 5,
    /// Runtime-level delivery acknowledgement
    CallbackAck = 6,
    /// First frame on a bisocket secondary connection, names the control
    /// session the connection belongs to
    SecondaryAttach = 7,
}

/// A decoded frame. Building one allocates nothing beyond its segments.
pub struct Frame {
    pub kind: FrameKind,
    pub flags: u16,
    pub seq: u64,
    pub session: u64,
    pub aux: u64,
    /// Subsystem name (Request); stringified handler id (CallbackPush/Ack)
    pub name: String,
    pub meta: Metadata,
    pub body: Vec<u8>,
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "[{} seq:{} session:{} aux:{} name:{:?} body:{}]",
            self.kind,
            self.seq,
            self.session,
            self.aux,
            self.name,
            self.body.len()
        )
    }
}

impl Frame {
    fn blank(kind: FrameKind) -> Self {
        Self {
            kind,
            flags: 0,
            seq: 0,
            session: 0,
            aux: 0,
            name: String::new(),
            meta: Metadata::new(),
            body: Vec::new(),
        }
    }

    pub fn request(
        name: &str, seq: u64, session: u64, meta: Metadata, body: Vec<u8>,
    ) -> Self {
        let mut f = Self::blank(FrameKind::Request);
        f.name = name.to_string();
        f.seq = seq;
        f.session = session;
        f.meta = meta;
        f.body = body;
        f
    }

    pub fn response(seq: u64, session: u64, body: Vec<u8>) -> Self {
        let mut f = Self::blank(FrameKind::Response);
        f.seq = seq;
        f.session = session;
        f.body = body;
        f
    }

    /// Faults travel as their strum serial, handler errors as plain text;
    /// either way FLAG_ERROR is set so the caller can tell result from error.
    pub fn error_response(seq: u64, session: u64, err: &InvokeError) -> Self {
        let mut f = Self::blank(FrameKind::Response);
        f.seq = seq;
        f.session = session;
        f.flags = FLAG_ERROR;
        f.body = match err {
            InvokeError::Fault(fault) => fault.as_bytes().to_vec(),
            InvokeError::Handler(text) => text.as_bytes().to_vec(),
            InvokeError::Config(text) => text.as_bytes().to_vec(),
        };
        f
    }

    pub fn ping(seq: u64, session: u64, lease_period: Option<Duration>) -> Self {
        let mut f = Self::blank(FrameKind::Ping);
        f.seq = seq;
        f.session = session;
        f.aux = lease_period.map(|d| d.as_millis() as u64).unwrap_or(0);
        f
    }

    pub fn pong(seq: u64, session: u64, aux: u64) -> Self {
        let mut f = Self::blank(FrameKind::Pong);
        f.seq = seq;
        f.session = session;
        f.aux = aux;
        f
    }

    pub fn disconnect(session: u64) -> Self {
        let mut f = Self::blank(FrameKind::Disconnect);
        f.session = session;
        f
    }

    pub fn callback_push(
        handler_id: u64, session: u64, callback_id: u64, need_ack: bool, body: Vec<u8>,
    ) -> Self {
        let mut f = Self::blank(FrameKind::CallbackPush);
        f.name = handler_id.to_string();
        f.session = session;
        f.aux = callback_id;
        if need_ack {
            f.flags = FLAG_ACK;
        }
        f.body = body;
        f
    }

    pub fn callback_ack(handler_id: u64, session: u64, callback_id: u64, body: Vec<u8>) -> Self {
        let mut f = Self::blank(FrameKind::CallbackAck);
        f.name = handler_id.to_string();
        f.session = session;
        f.aux = callback_id;
        f.body = body;
        f
    }

    pub fn secondary_attach(session: u64) -> Self {
        let mut f = Self::blank(FrameKind::SecondaryAttach);
        f.session = session;
        f
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        self.flags & FLAG_ERROR != 0
    }

    #[inline]
    pub fn need_ack(&self) -> bool {
        self.flags & FLAG_ACK != 0
    }
}

/// Read one frame. `head_timeout` covers the wait for the head (pass the
/// idle timeout there on server workers); `read_timeout` covers each
/// variable segment once the head has arrived.
pub async fn read_frame<C: Codec>(
    stream: &mut UnifyBufStream, codec: &C, head_timeout: Duration, read_timeout: Duration,
) -> Result<Frame, Fault> {
    let mut head_buf = [0u8; FRAME_HEAD_LEN];
    stream.read_exact_timeout(&mut head_buf, head_timeout).await.map_err(|e| {
        trace!("{}: head read failed: {:?}", stream, e);
        Fault::from(e)
    })?;
    let head = FrameHead::decode(&head_buf)?;
    trace!("{}: recv {}", stream, head);

    let kind = FrameKind::from_repr(head.kind).ok_or(Fault::Decode)?;
    let name_len = head.name_len.get() as usize;
    let meta_len = head.meta_len.get() as usize;
    let body_len = head.body_len.get() as usize;
    if name_len > MAX_NAME_LEN || meta_len > MAX_META_LEN || body_len > MAX_BODY_LEN {
        warn!("{}: oversized frame {}", stream, head);
        return Err(Fault::Decode);
    }

    let mut frame = Frame::blank(kind);
    frame.flags = head.flags.get();
    frame.seq = head.seq.get();
    frame.session = head.session.get();
    frame.aux = head.aux.get();

    if name_len > 0 {
        let mut name_buf = vec![0u8; name_len];
        stream.read_exact_timeout(&mut name_buf, read_timeout).await.map_err(Fault::from)?;
        frame.name = String::from_utf8(name_buf).map_err(|_| Fault::Decode)?;
    }
    if meta_len > 0 {
        let mut meta_buf = vec![0u8; meta_len];
        stream.read_exact_timeout(&mut meta_buf, read_timeout).await.map_err(Fault::from)?;
        frame.meta = codec.decode(&meta_buf).map_err(|_| Fault::Decode)?;
    }
    if body_len > 0 {
        let mut body = vec![0u8; body_len];
        stream.read_exact_timeout(&mut body, read_timeout).await.map_err(Fault::from)?;
        frame.body = body;
    }
    Ok(frame)
}

/// Write one frame; flushes when asked so a lone frame actually leaves the
/// buffered stream.
pub async fn write_frame<C: Codec>(
    stream: &mut UnifyBufStream, codec: &C, frame: &Frame, write_timeout: Duration,
    need_flush: bool,
) -> Result<(), Fault> {
    let meta_buf = if frame.meta.is_empty() {
        Vec::new()
    } else {
        codec.encode(&frame.meta).map_err(|_| Fault::Encode)?
    };
    if frame.name.len() > MAX_NAME_LEN || meta_buf.len() > MAX_META_LEN
        || frame.body.len() > MAX_BODY_LEN
    {
        return Err(Fault::Encode);
    }

    let head = FrameHead {
        magic: FRAME_MAGIC,
        ver: PROTO_VERSION,
        kind: frame.kind as u8,
        flags: U16::new(frame.flags),
        name_len: U16::new(frame.name.len() as u16),
        seq: U64::new(frame.seq),
        session: U64::new(frame.session),
        aux: U64::new(frame.aux),
        meta_len: U32::new(meta_buf.len() as u32),
        body_len: U32::new(frame.body.len() as u32),
    };
    trace!("{}: send {}", stream, head);

    stream.write_timeout(head.as_bytes(), write_timeout).await.map_err(Fault::from)?;
    if !frame.name.is_empty() {
        stream.write_timeout(frame.name.as_bytes(), write_timeout).await.map_err(Fault::from)?;
    }
    if !meta_buf.is_empty() {
        stream.write_timeout(&meta_buf, write_timeout).await.map_err(Fault::from)?;
    }
    if !frame.body.is_empty() {
        stream.write_timeout(&frame.body, write_timeout).await.map_err(Fault::from)?;
    }
    if need_flush {
        stream.flush_timeout(write_timeout).await.map_err(Fault::from)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_head_len() {
        assert_eq!(FRAME_HEAD_LEN, 40);
    }

    #[test]
    fn test_head_codec() {
        let head = FrameHead {
            magic: FRAME_MAGIC,
            ver: PROTO_VERSION,
            kind: FrameKind::Request as u8,
            flags: U16::new(FLAG_ERROR),
            name_len: U16::new(4),
            seq: U64::new(7),
            session: U64::new(99),
            aux: U64::new(0),
            meta_len: U32::new(0),
            body_len: U32::new(3),
        };
        let bytes = head.as_bytes().to_vec();
        let back = FrameHead::decode(&bytes).expect("decode");
        assert_eq!(back.seq.get(), 7);
        assert_eq!(back.session.get(), 99);
        assert_eq!(back.flags.get(), FLAG_ERROR);
    }

    #[test]
    fn test_bad_magic_and_version() {
        let mut head = FrameHead::new_zeroed();
        head.magic = [b'x', b'y'];
        assert_eq!(FrameHead::decode(head.as_bytes()).unwrap_err(), Fault::Version);

        head.magic = FRAME_MAGIC;
        head.ver = 42;
        assert_eq!(FrameHead::decode(head.as_bytes()).unwrap_err(), Fault::Version);
    }

    #[test]
    fn test_error_body_mapping() {
        let f = Frame::error_response(1, 0, &InvokeError::Fault(Fault::Subsystem));
        assert!(f.is_error());
        assert_eq!(InvokeError::from_wire(&f.body), InvokeError::Fault(Fault::Subsystem));

        let f = Frame::error_response(1, 0, &InvokeError::Handler("boom".into()));
        assert_eq!(InvokeError::from_wire(&f.body), InvokeError::Handler("boom".into()));
    }
}
