use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Result, SerieslyError};

pub const REQ_MAGIC: u8 = 0x80;
pub const RES_MAGIC: u8 = 0x81;
pub const HEADER_LEN: usize = 24;

const MAX_BODY: u32 = 64 << 20;

pub mod opcode {
    pub const GET: u8 = 0x00;
    pub const SET: u8 = 0x01;
    pub const NOOP: u8 = 0x0a;
    pub const SETQ: u8 = 0x11;
    pub const SELECT_BUCKET: u8 = 0x89;
}

pub mod status {
    pub const SUCCESS: u16 = 0x0000;
    pub const KEY_ENOENT: u16 = 0x0001;
    pub const EINVAL: u16 = 0x0004;
    pub const NOT_STORED: u16 = 0x0005;
    pub const UNKNOWN_COMMAND: u16 = 0x0081;
}

fn transport(err: impl std::fmt::Display) -> SerieslyError {
    SerieslyError::CacheTransport(err.to_string())
}

/// One binary-protocol request frame.
#[derive(Debug, Clone, Default)]
pub struct Request {
    pub opcode: u8,
    pub opaque: u32,
    pub cas: u64,
    pub extras: Bytes,
    pub key: Bytes,
    pub body: Bytes,
}

impl Request {
    pub fn encode(&self) -> Bytes {
        let total = self.extras.len() + self.key.len() + self.body.len();
        let mut buf = BytesMut::with_capacity(HEADER_LEN + total);
        buf.put_u8(REQ_MAGIC);
        buf.put_u8(self.opcode);
        buf.put_u16(self.key.len() as u16);
        buf.put_u8(self.extras.len() as u8);
        buf.put_u8(0); // data type
        buf.put_u16(0); // vbucket
        buf.put_u32(total as u32);
        buf.put_u32(self.opaque);
        buf.put_u64(self.cas);
        buf.put_slice(&self.extras);
        buf.put_slice(&self.key);
        buf.put_slice(&self.body);
        buf.freeze()
    }

    /// Reads one request, or None on a clean connection close.
    pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<Request>> {
        let mut header = [0u8; HEADER_LEN];
        match r.read_exact(&mut header).await {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(transport(err)),
        }

        let mut h = &header[..];
        let magic = h.get_u8();
        if magic != REQ_MAGIC {
            return Err(transport(format!("bad request magic {magic:#x}")));
        }
        let opcode = h.get_u8();
        let key_len = h.get_u16() as usize;
        let extras_len = h.get_u8() as usize;
        let _data_type = h.get_u8();
        let _vbucket = h.get_u16();
        let body_len = h.get_u32();
        let opaque = h.get_u32();
        let cas = h.get_u64();

        if body_len > MAX_BODY || extras_len + key_len > body_len as usize {
            return Err(transport(format!("bad frame length {body_len}")));
        }

        let mut payload = vec![0u8; body_len as usize];
        r.read_exact(&mut payload).await.map_err(transport)?;
        let mut payload = Bytes::from(payload);
        let extras = payload.split_to(extras_len);
        let key = payload.split_to(key_len);

        Ok(Some(Request {
            opcode,
            opaque,
            cas,
            extras,
            key,
            body: payload,
        }))
    }
}

/// One binary-protocol response frame.
#[derive(Debug, Clone, Default)]
pub struct Response {
    pub opcode: u8,
    pub status: u16,
    pub opaque: u32,
    pub cas: u64,
    pub extras: Bytes,
    pub key: Bytes,
    pub body: Bytes,
}

impl Response {
    pub fn encode(&self) -> Bytes {
        let total = self.extras.len() + self.key.len() + self.body.len();
        let mut buf = BytesMut::with_capacity(HEADER_LEN + total);
        buf.put_u8(RES_MAGIC);
        buf.put_u8(self.opcode);
        buf.put_u16(self.key.len() as u16);
        buf.put_u8(self.extras.len() as u8);
        buf.put_u8(0);
        buf.put_u16(self.status);
        buf.put_u32(total as u32);
        buf.put_u32(self.opaque);
        buf.put_u64(self.cas);
        buf.put_slice(&self.extras);
        buf.put_slice(&self.key);
        buf.put_slice(&self.body);
        buf.freeze()
    }

    pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<Response>> {
        let mut header = [0u8; HEADER_LEN];
        match r.read_exact(&mut header).await {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(transport(err)),
        }

        let mut h = &header[..];
        let magic = h.get_u8();
        if magic != RES_MAGIC {
            return Err(transport(format!("bad response magic {magic:#x}")));
        }
        let opcode = h.get_u8();
        let key_len = h.get_u16() as usize;
        let extras_len = h.get_u8() as usize;
        let _data_type = h.get_u8();
        let status = h.get_u16();
        let body_len = h.get_u32();
        let opaque = h.get_u32();
        let cas = h.get_u64();

        if body_len > MAX_BODY || extras_len + key_len > body_len as usize {
            return Err(transport(format!("bad frame length {body_len}")));
        }

        let mut payload = vec![0u8; body_len as usize];
        r.read_exact(&mut payload).await.map_err(transport)?;
        let mut payload = Bytes::from(payload);
        let extras = payload.split_to(extras_len);
        let key = payload.split_to(key_len);

        Ok(Some(Response {
            opcode,
            status,
            opaque,
            cas,
            extras,
            key,
            body: payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn request_frames_survive_the_wire() {
        let req = Request {
            opcode: opcode::SET,
            opaque: 0xdeadbeef,
            cas: 7,
            extras: Bytes::from_static(&[0; 8]),
            key: Bytes::from_static(b"2012-08-28T21:24:35Z"),
            body: Bytes::from_static(b"{\"v\":1}"),
        };
        let encoded = req.encode();
        assert_eq!(encoded.len(), HEADER_LEN + 8 + 20 + 7);

        let mut cursor = std::io::Cursor::new(encoded.to_vec());
        let decoded = Request::read_from(&mut cursor).await.unwrap().unwrap();
        assert_eq!(decoded.opcode, opcode::SET);
        assert_eq!(decoded.opaque, 0xdeadbeef);
        assert_eq!(decoded.key, req.key);
        assert_eq!(decoded.body, req.body);

        // The stream is now exhausted: clean EOF.
        assert!(Request::read_from(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn responses_carry_status_in_the_vbucket_slot() {
        let res = Response {
            opcode: opcode::GET,
            status: status::KEY_ENOENT,
            opaque: 42,
            ..Response::default()
        };
        let mut cursor = std::io::Cursor::new(res.encode().to_vec());
        let decoded = Response::read_from(&mut cursor).await.unwrap().unwrap();
        assert_eq!(decoded.status, status::KEY_ENOENT);
        assert_eq!(decoded.opaque, 42);
    }

    #[tokio::test]
    async fn rejects_the_wrong_magic() {
        let res = Response::default().encode();
        let mut cursor = std::io::Cursor::new(res.to_vec());
        assert!(Request::read_from(&mut cursor).await.is_err());
    }
}
