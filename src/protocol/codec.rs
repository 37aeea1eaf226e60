use crate::protocol::Event;
use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Upper bound for one framed envelope, applied on both encode and
/// decode so a corrupt length prefix cannot force a huge allocation.
pub const MAX_FRAME: usize = 8 * 1024 * 1024;

const LEN_PREFIX: usize = 4;

/// Pack an envelope as a u32-LE length prefix + serialized body.
pub fn encode_frame(event: &Event) -> anyhow::Result<Bytes> {
    let body = serde_json::to_vec(event)?;
    if body.len() > MAX_FRAME {
        bail!("frame of {} bytes exceeds limit", body.len());
    }
    let mut buf = BytesMut::with_capacity(LEN_PREFIX + body.len());
    buf.put_u32_le(body.len() as u32);
    buf.put_slice(&body);
    Ok(buf.freeze())
}

/// Pop one complete frame off `buf`, or `None` when more bytes are
/// needed. Consumed bytes are advanced out of the buffer.
pub fn decode_frame(buf: &mut BytesMut) -> anyhow::Result<Option<Event>> {
    if buf.len() < LEN_PREFIX {
        return Ok(None);
    }
    let mut len_bytes = [0u8; LEN_PREFIX];
    len_bytes.copy_from_slice(&buf[..LEN_PREFIX]);
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME {
        bail!("frame length {len} exceeds limit");
    }
    if buf.len() < LEN_PREFIX + len {
        return Ok(None);
    }
    buf.advance(LEN_PREFIX);
    let body = buf.split_to(len);
    Ok(Some(serde_json::from_slice(&body)?))
}
