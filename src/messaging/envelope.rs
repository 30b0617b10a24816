use std::fmt::{Debug, Formatter};

use anyhow::anyhow;
use bytes::{Buf, BufMut, Bytes};

use crate::util::buf_ext::{varint_len, BufExt, BufMutExt};
use crate::util::safe_converter::SafeCast;


/// Envelope type 0 is reserved for control traffic (heartbeats) and must not be used for
///  application messages. Servers drop inbound envelopes of this type.
pub const CONTROL_MESSAGE_TYPE: u64 = 0;

/// The application-level unit of messaging: a type tag defined by the application and an opaque
///  payload.
#[derive(Clone, Eq, PartialEq)]
pub struct Envelope {
    pub message_type: u64,
    pub payload: Bytes,
}

impl Debug for Envelope {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match std::str::from_utf8(&self.payload) {
            Ok(s) if s.len() <= 64 => write!(f, "Envelope{{type:{}, payload:{:?}}}", self.message_type, s),
            _ => write!(f, "Envelope{{type:{}, payload:{} bytes}}", self.message_type, self.payload.len()),
        }
    }
}

impl Envelope {
    pub fn new(message_type: u64, payload: impl Into<Bytes>) -> Envelope {
        Envelope {
            message_type,
            payload: payload.into(),
        }
    }

    pub fn is_control(&self) -> bool {
        self.message_type == CONTROL_MESSAGE_TYPE
    }

    /// The number of bytes [Envelope::ser] writes, without actually serializing
    pub fn serialized_len(&self) -> usize {
        varint_len(self.message_type)
            + varint_len(self.payload.len().safe_cast())
            + self.payload.len()
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_varint(self.message_type);
        buf.put_len_varint(self.payload.len());
        buf.put_slice(&self.payload);
    }

    /// Reads an envelope that must span the entire buffer
    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Envelope> {
        let message_type = buf.try_get_varint()?;
        let payload_len = buf.try_get_len_varint()?;
        let payload = buf.try_get_bytes(payload_len)?;

        if buf.has_remaining() {
            return Err(anyhow!("{} trailing bytes after envelope payload", buf.remaining()));
        }

        Ok(Envelope {
            message_type,
            payload,
        })
    }
}
