use anyhow::anyhow;
use bytes::Bytes;
use bytes_varint::{VarIntSupport, VarIntSupportMut};


/// Number of bytes [BufMutExt::put_varint] uses for a given value
pub fn varint_len(value: u64) -> usize {
    let significant_bits = (64 - value.leading_zeros()).max(1) as usize;
    significant_bits.div_ceil(7)
}

pub trait BufExt: bytes::Buf + Sized {
    fn try_get_varint(&mut self) -> anyhow::Result<u64> {
        self.try_get_u64_varint()
            .map_err(|e| anyhow!("VarInt error: {:?}", e))
    }

    fn try_get_len_varint(&mut self) -> anyhow::Result<usize> {
        let raw = self.try_get_varint()?;
        usize::try_from(raw)
            .map_err(|_| anyhow!("length {} does not fit into usize", raw))
    }

    fn try_get_bytes(&mut self, len: usize) -> anyhow::Result<Bytes> {
        if self.remaining() < len {
            return Err(anyhow!("buffer underflow: {} bytes requested, {} remaining", len, self.remaining()));
        }
        Ok(self.copy_to_bytes(len))
    }
}

pub trait BufMutExt: bytes::BufMut + Sized {
    fn put_varint(&mut self, v: u64) {
        self.put_u64_varint(v);
    }

    fn put_len_varint(&mut self, len: usize) {
        self.put_usize_varint(len);
    }
}


impl <T: bytes::Buf> BufExt for T {
}

impl <T: bytes::BufMut> BufMutExt for T {
}
