// Frame header layout for the append log: one header per put, one commit marker per batch.
use crate::core::error::{Error, ErrorKind};

pub const FRAME_MAGIC: [u8; 4] = *b"MKV1";
pub const FRAME_HEADER_LEN: usize = 20;
pub const MAX_ENTRY_PART: usize = u32::MAX as usize;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FrameKind {
    Put = 1,
    Commit = 2,
}

impl FrameKind {
    fn from_u32(value: u32) -> Result<Self, Error> {
        match value {
            1 => Ok(FrameKind::Put),
            2 => Ok(FrameKind::Commit),
            _ => Err(Error::new(ErrorKind::Iteration).with_message("invalid frame kind")),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FrameHeader {
    pub kind: FrameKind,
    pub key_len: u32,
    pub value_len: u32,
    pub len_xor: u32,
}

impl FrameHeader {
    pub fn put(key_len: u32, value_len: u32) -> Self {
        Self {
            kind: FrameKind::Put,
            key_len,
            value_len,
            len_xor: len_check(key_len, value_len),
        }
    }

    pub fn commit() -> Self {
        Self {
            kind: FrameKind::Commit,
            key_len: 0,
            value_len: 0,
            len_xor: len_check(0, 0),
        }
    }

    pub fn body_len(&self) -> usize {
        self.key_len as usize + self.value_len as usize
    }

    pub fn encode(&self) -> [u8; FRAME_HEADER_LEN] {
        let mut buf = [0u8; FRAME_HEADER_LEN];
        buf[0..4].copy_from_slice(&FRAME_MAGIC);
        write_u32(&mut buf, 4, self.kind as u32);
        write_u32(&mut buf, 8, self.key_len);
        write_u32(&mut buf, 12, self.value_len);
        write_u32(&mut buf, 16, self.len_xor);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < FRAME_HEADER_LEN {
            return Err(Error::new(ErrorKind::Iteration).with_message("frame header too small"));
        }
        if buf[0..4] != FRAME_MAGIC {
            return Err(Error::new(ErrorKind::Iteration).with_message("bad frame magic"));
        }
        let header = Self {
            kind: FrameKind::from_u32(read_u32(buf, 4))?,
            key_len: read_u32(buf, 8),
            value_len: read_u32(buf, 12),
            len_xor: read_u32(buf, 16),
        };
        header.validate()?;
        Ok(header)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.len_xor != len_check(self.key_len, self.value_len) {
            return Err(Error::new(ErrorKind::Iteration).with_message("frame length xor mismatch"));
        }
        if self.kind == FrameKind::Commit && self.body_len() != 0 {
            return Err(Error::new(ErrorKind::Iteration).with_message("commit frame has a body"));
        }
        Ok(())
    }
}

fn len_check(key_len: u32, value_len: u32) -> u32 {
    key_len.rotate_left(16) ^ value_len ^ 0xFFFF_FFFF
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(out)
}

fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}
