use anyhow::anyhow;
use bytes::Bytes;
use bytes_varint::{VarIntSupport, VarIntSupportMut};

/// Upper bound for any length prefix read from the wire. Anything bigger is treated as a corrupt
///  buffer rather than an allocation request.
pub const MAX_WIRE_LEN: usize = 256 * 1024 * 1024;

macro_rules! read_try_impl {
    ($try_reader: ident, $ty:ty, $getter: ident) => {
        fn $try_reader(&mut self) -> anyhow::Result<$ty> {
            if self.remaining() < std::mem::size_of::<$ty>() {
                return Err(anyhow!("buffer underflow reading {}", stringify!($ty)));
            }
            Ok(self.$getter())
        }
    }
}

/// Bounds-checked reads for deserialization. The names are deliberately distinct from the
///  `try_get_*` family so they never clash with methods the `bytes` crate provides itself.
pub trait BufExt: bytes::Buf + VarIntSupport {
    read_try_impl!(try_read_u8, u8, get_u8);
    read_try_impl!(try_read_u16, u16, get_u16);
    read_try_impl!(try_read_u32, u32, get_u32);
    read_try_impl!(try_read_u64, u64, get_u64);

    fn try_read_len(&mut self) -> anyhow::Result<usize> {
        let raw = self.try_get_u64_varint()
            .map_err(|e| anyhow!("varint error: {:?}", e))?;
        let len = usize::try_from(raw)?;
        if len > MAX_WIRE_LEN {
            return Err(anyhow!("length prefix {} exceeds maximum of {}", len, MAX_WIRE_LEN));
        }
        Ok(len)
    }

    fn try_read_bool(&mut self) -> anyhow::Result<bool> {
        match self.try_read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            n => Err(anyhow!("invalid bool discriminator {}", n)),
        }
    }

    fn try_read_blob(&mut self) -> anyhow::Result<Bytes> {
        let len = self.try_read_len()?;
        if self.remaining() < len {
            return Err(anyhow!("buffer underflow: blob of {} bytes, {} remaining", len, self.remaining()));
        }
        Ok(self.copy_to_bytes(len))
    }

    fn try_read_string(&mut self) -> anyhow::Result<String> {
        let raw = self.try_read_blob()?;
        Ok(String::from_utf8(raw.to_vec())?)
    }
}

pub trait BufMutExt: bytes::BufMut + VarIntSupportMut {
    fn put_len(&mut self, len: usize) {
        self.put_u64_varint(len as u64);
    }

    fn put_bool(&mut self, b: bool) {
        self.put_u8(if b { 1 } else { 0 });
    }

    fn put_blob(&mut self, data: &[u8]) {
        self.put_len(data.len());
        self.put_slice(data);
    }

    fn put_string(&mut self, s: &str) {
        self.put_blob(s.as_bytes());
    }
}

impl <T: bytes::Buf> BufExt for T {
}

impl <T: bytes::BufMut> BufMutExt for T {
}
