use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::CodecError;
use crate::member::{MemberRecord, Snapshot};
use crate::network::MAX_DATAGRAM_SIZE;

pub const WIRE_VERSION: u8 = 1;

const KIND_SNAPSHOT: u8 = 0;
const KIND_SHUTDOWN: u8 = 1;

const HEADER_LEN: usize = 2;
const COUNT_LEN: usize = 4;
// address length prefix plus heartbeat
const RECORD_FIXED_LEN: usize = 2 + 8;

/// Everything a node can put in a datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GossipMessage {
    Snapshot(Snapshot),
    /// Asks the receiving node to stop its receive loop.
    Shutdown,
}

pub fn encode(message: &GossipMessage) -> Result<Bytes, CodecError> {
    match message {
        GossipMessage::Snapshot(snapshot) => encode_snapshot(snapshot),
        GossipMessage::Shutdown => {
            let mut buf = BytesMut::with_capacity(HEADER_LEN);
            buf.put_u8(WIRE_VERSION);
            buf.put_u8(KIND_SHUTDOWN);
            Ok(buf.freeze())
        }
    }
}

/// Fails with [`CodecError::TooLarge`] when the result would not fit in one
/// datagram; the receiver could only ever see a truncated prefix of it.
pub fn encode_snapshot(snapshot: &Snapshot) -> Result<Bytes, CodecError> {
    let count = u32::try_from(snapshot.len()).map_err(|_| CodecError::TooManyMembers(snapshot.len()))?;
    let mut total = HEADER_LEN + COUNT_LEN;
    for member in snapshot.members() {
        if u16::try_from(member.address.len()).is_err() {
            return Err(CodecError::AddressTooLong(member.address.len()));
        }
        total += RECORD_FIXED_LEN + member.address.len();
    }
    if total > MAX_DATAGRAM_SIZE {
        return Err(CodecError::TooLarge(total));
    }
    let mut buf = BytesMut::with_capacity(total);
    buf.put_u8(WIRE_VERSION);
    buf.put_u8(KIND_SNAPSHOT);
    buf.put_u32(count);
    for member in snapshot.members() {
        buf.put_u16(member.address.len() as u16);
        buf.put_slice(member.address.as_bytes());
        buf.put_u64(member.heartbeat);
    }
    Ok(buf.freeze())
}

pub fn decode(mut buf: Bytes) -> Result<GossipMessage, CodecError> {
    if buf.is_empty() {
        return Err(CodecError::Empty);
    }
    ensure(&buf, HEADER_LEN)?;
    let version = buf.get_u8();
    if version != WIRE_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }
    let message = match buf.get_u8() {
        KIND_SNAPSHOT => GossipMessage::Snapshot(decode_records(&mut buf)?),
        KIND_SHUTDOWN => GossipMessage::Shutdown,
        kind => return Err(CodecError::UnknownKind(kind)),
    };
    if buf.has_remaining() {
        return Err(CodecError::TrailingBytes(buf.remaining()));
    }
    Ok(message)
}

fn decode_records(buf: &mut Bytes) -> Result<Snapshot, CodecError> {
    ensure(buf, COUNT_LEN)?;
    let count = buf.get_u32() as usize;
    // every record needs at least its fixed part, so a lying count cannot
    // make us reserve more than the payload could hold
    let mut members = Vec::with_capacity(count.min(buf.remaining() / RECORD_FIXED_LEN));
    for _ in 0..count {
        ensure(buf, 2)?;
        let len = buf.get_u16() as usize;
        ensure(buf, len + 8)?;
        let raw = buf.split_to(len);
        let address = String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidAddress)?;
        let heartbeat = buf.get_u64();
        members.push(MemberRecord { address, heartbeat });
    }
    Ok(Snapshot::new(members))
}

fn ensure(buf: &Bytes, needed: usize) -> Result<(), CodecError> {
    if buf.remaining() < needed {
        return Err(CodecError::Truncated { needed, remaining: buf.remaining() });
    }
    Ok(())
}
