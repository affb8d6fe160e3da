use anyhow::anyhow;
use bytes::{Buf, Bytes};


macro_rules! try_read_impl {
    ($try_reader: ident, $ty:ty, $getter: ident) => {
        fn $try_reader(&mut self) -> anyhow::Result<$ty> {
            if self.remaining() < std::mem::size_of::<$ty>() {
                return Err(anyhow!("buffer underflow reading {}: {} bytes remaining", stringify!($ty), self.remaining()));
            }
            Ok(self.$getter())
        }
    }
}


/// Checked big-endian reads: the wire format is network byte order throughout, and a truncated
///  datagram must surface as an error rather than a panic.
pub trait BufExt: Buf {
    try_read_impl!(try_read_u8, u8, get_u8);
    try_read_impl!(try_read_u16, u16, get_u16);
    try_read_impl!(try_read_u32, u32, get_u32);
    try_read_impl!(try_read_i32, i32, get_i32);
    try_read_impl!(try_read_u64, u64, get_u64);

    fn try_read_bytes(&mut self, len: usize) -> anyhow::Result<Bytes> {
        if self.remaining() < len {
            return Err(anyhow!("buffer underflow reading {} bytes: {} bytes remaining", len, self.remaining()));
        }
        Ok(self.copy_to_bytes(len))
    }
}

impl <T: Buf> BufExt for T {
}
