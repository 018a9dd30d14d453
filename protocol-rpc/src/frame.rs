use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ParseError;

/// Negotiation magic, first on the wire in both directions.
pub const MAGIC: [u8; 8] = *b"SSTARRPC";

const NEGOTIATION_HEADER: usize = 8 + 4 + 4 + 4;
const REQUEST_HEADER: usize = 8 + 8 + 4;
const RESPONSE_HEADER: usize = 8 + 4;

/// Feature negotiation frame. Both sides send one and verify the
/// other's; mismatched magic or required-features means disconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiation {
    pub required_features: u32,
    pub optional_features: u32,
    pub data: Bytes,
}

impl Negotiation {
    pub fn encode(&self, out: &mut BytesMut) {
        out.reserve(NEGOTIATION_HEADER + self.data.len());
        out.put_slice(&MAGIC);
        out.put_u32_le(self.required_features);
        out.put_u32_le(self.optional_features);
        out.put_u32_le(self.data.len() as u32);
        out.put_slice(&self.data);
    }

    /// Parse from the front of `src`. `Ok(None)` means more bytes are
    /// needed; on success returns the frame and the bytes consumed.
    pub fn parse(src: &[u8]) -> Result<Option<(Negotiation, usize)>, ParseError> {
        if src.len() < NEGOTIATION_HEADER {
            return Ok(None);
        }
        let mut buf = src;
        let mut magic = [0u8; 8];
        buf.copy_to_slice(&mut magic);
        if magic != MAGIC {
            return Err(ParseError::BadMagic);
        }
        let required_features = buf.get_u32_le();
        let optional_features = buf.get_u32_le();
        let len = buf.get_u32_le() as usize;
        if buf.remaining() < len {
            return Ok(None);
        }
        let data = Bytes::copy_from_slice(&buf[..len]);
        Ok(Some((
            Negotiation {
                required_features,
                optional_features,
                data,
            },
            NEGOTIATION_HEADER + len,
        )))
    }
}

/// One RPC request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub verb: u64,
    /// Positive, never reused within a connection.
    pub msg_id: i64,
    pub payload: Bytes,
}

impl Request {
    pub fn encode(&self, out: &mut BytesMut) {
        debug_assert!(self.msg_id > 0);
        out.reserve(REQUEST_HEADER + self.payload.len());
        out.put_u64_le(self.verb);
        out.put_i64_le(self.msg_id);
        out.put_u32_le(self.payload.len() as u32);
        out.put_slice(&self.payload);
    }

    pub fn parse(src: &[u8]) -> Result<Option<(Request, usize)>, ParseError> {
        if src.len() < REQUEST_HEADER {
            return Ok(None);
        }
        let mut buf = src;
        let verb = buf.get_u64_le();
        let msg_id = buf.get_i64_le();
        if msg_id <= 0 {
            return Err(ParseError::InvalidMsgId(msg_id));
        }
        let len = buf.get_u32_le() as usize;
        if buf.remaining() < len {
            return Ok(None);
        }
        let payload = Bytes::copy_from_slice(&buf[..len]);
        Ok(Some((
            Request {
                verb,
                msg_id,
                payload,
            },
            REQUEST_HEADER + len,
        )))
    }
}

/// One RPC response. `msg_id < 0` marks `payload` as an encoded
/// [`ExceptionBody`] answering request `-msg_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub msg_id: i64,
    pub payload: Bytes,
}

impl Response {
    /// A successful reply to `msg_id`.
    pub fn success(msg_id: i64, payload: Bytes) -> Response {
        debug_assert!(msg_id > 0);
        Response { msg_id, payload }
    }

    /// An exception reply to `msg_id`.
    pub fn exception(msg_id: i64, body: &ExceptionBody) -> Response {
        debug_assert!(msg_id > 0);
        let mut payload = BytesMut::new();
        body.encode(&mut payload);
        Response {
            msg_id: -msg_id,
            payload: payload.freeze(),
        }
    }

    /// Is this an exception reply?
    pub fn is_exception(&self) -> bool {
        self.msg_id < 0
    }

    /// The request this response answers.
    pub fn request_id(&self) -> i64 {
        self.msg_id.abs()
    }

    pub fn encode(&self, out: &mut BytesMut) {
        out.reserve(RESPONSE_HEADER + self.payload.len());
        out.put_i64_le(self.msg_id);
        out.put_u32_le(self.payload.len() as u32);
        out.put_slice(&self.payload);
    }

    pub fn parse(src: &[u8]) -> Result<Option<(Response, usize)>, ParseError> {
        if src.len() < RESPONSE_HEADER {
            return Ok(None);
        }
        let mut buf = src;
        let msg_id = buf.get_i64_le();
        let len = buf.get_u32_le() as usize;
        if buf.remaining() < len {
            return Ok(None);
        }
        let payload = Bytes::copy_from_slice(&buf[..len]);
        Ok(Some((Response { msg_id, payload }, RESPONSE_HEADER + len)))
    }
}

/// Body of an exception response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExceptionBody {
    /// Type 0: an application error, carried as a UTF-8 string.
    User(String),
    /// Type 1: the server did not recognize this verb.
    UnknownVerb(u64),
}

impl ExceptionBody {
    pub fn encode(&self, out: &mut BytesMut) {
        match self {
            ExceptionBody::User(msg) => {
                out.put_u32_le(0);
                out.put_u32_le(msg.len() as u32);
                out.put_slice(msg.as_bytes());
            }
            ExceptionBody::UnknownVerb(verb) => {
                out.put_u32_le(1);
                out.put_u32_le(8);
                out.put_u64_le(*verb);
            }
        }
    }

    /// Decode a complete exception body (the payload of a negative-id
    /// response).
    pub fn parse(src: &[u8]) -> Result<ExceptionBody, ParseError> {
        if src.len() < 8 {
            return Err(ParseError::TruncatedException);
        }
        let mut buf = src;
        let kind = buf.get_u32_le();
        let len = buf.get_u32_le() as usize;
        if buf.remaining() < len {
            return Err(ParseError::TruncatedException);
        }
        match kind {
            0 => {
                let msg = std::str::from_utf8(&buf[..len]).map_err(|_| ParseError::BadUtf8)?;
                Ok(ExceptionBody::User(msg.to_string()))
            }
            1 => {
                if len < 8 {
                    return Err(ParseError::TruncatedException);
                }
                Ok(ExceptionBody::UnknownVerb(buf.get_u64_le()))
            }
            other => Err(ParseError::UnknownExceptionType(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiation_wire_layout() {
        let n = Negotiation {
            required_features: 0x0102_0304,
            optional_features: 5,
            data: Bytes::from_static(b"xy"),
        };
        let mut out = BytesMut::new();
        n.encode(&mut out);
        assert_eq!(&out[..8], b"SSTARRPC");
        assert_eq!(&out[8..12], &[0x04, 0x03, 0x02, 0x01]); // little-endian
        assert_eq!(&out[12..16], &[5, 0, 0, 0]);
        assert_eq!(&out[16..20], &[2, 0, 0, 0]);
        assert_eq!(&out[20..], b"xy");

        let (parsed, consumed) = Negotiation::parse(&out).unwrap().unwrap();
        assert_eq!(parsed, n);
        assert_eq!(consumed, out.len());
    }

    #[test]
    fn negotiation_bad_magic_disconnects() {
        let mut out = BytesMut::new();
        Negotiation {
            required_features: 0,
            optional_features: 0,
            data: Bytes::new(),
        }
        .encode(&mut out);
        out[0] = b'X';
        assert_eq!(Negotiation::parse(&out), Err(ParseError::BadMagic));
    }

    #[test]
    fn negotiation_incremental() {
        let n = Negotiation {
            required_features: 1,
            optional_features: 2,
            data: Bytes::from_static(b"hello"),
        };
        let mut out = BytesMut::new();
        n.encode(&mut out);
        for cut in 0..out.len() {
            assert_eq!(Negotiation::parse(&out[..cut]).unwrap(), None, "cut={cut}");
        }
        assert!(Negotiation::parse(&out).unwrap().is_some());
    }

    #[test]
    fn request_wire_layout() {
        let r = Request {
            verb: 7,
            msg_id: 42,
            payload: Bytes::from_static(b"ping"),
        };
        let mut out = BytesMut::new();
        r.encode(&mut out);
        assert_eq!(&out[..8], &[7, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&out[8..16], &[42, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&out[16..20], &[4, 0, 0, 0]);
        assert_eq!(&out[20..], b"ping");

        let (parsed, consumed) = Request::parse(&out).unwrap().unwrap();
        assert_eq!(parsed, r);
        assert_eq!(consumed, out.len());
    }

    #[test]
    fn request_rejects_non_positive_msg_id() {
        let mut out = BytesMut::new();
        out.put_u64_le(1);
        out.put_i64_le(0);
        out.put_u32_le(0);
        assert_eq!(Request::parse(&out), Err(ParseError::InvalidMsgId(0)));

        let mut out = BytesMut::new();
        out.put_u64_le(1);
        out.put_i64_le(-3);
        out.put_u32_le(0);
        assert_eq!(Request::parse(&out), Err(ParseError::InvalidMsgId(-3)));
    }

    #[test]
    fn response_round_trip() {
        let r = Response::success(9, Bytes::from_static(b"pong"));
        let mut out = BytesMut::new();
        r.encode(&mut out);
        let (parsed, consumed) = Response::parse(&out).unwrap().unwrap();
        assert_eq!(parsed, r);
        assert_eq!(consumed, out.len());
        assert!(!parsed.is_exception());
        assert_eq!(parsed.request_id(), 9);
    }

    #[test]
    fn exception_response_negates_msg_id() {
        let r = Response::exception(5, &ExceptionBody::User("kaboom".into()));
        assert_eq!(r.msg_id, -5);
        assert!(r.is_exception());
        assert_eq!(r.request_id(), 5);
        assert_eq!(
            ExceptionBody::parse(&r.payload).unwrap(),
            ExceptionBody::User("kaboom".into())
        );
    }

    #[test]
    fn unknown_verb_exception_layout() {
        let mut out = BytesMut::new();
        ExceptionBody::UnknownVerb(0xDEAD).encode(&mut out);
        assert_eq!(&out[..4], &[1, 0, 0, 0]);
        assert_eq!(&out[4..8], &[8, 0, 0, 0]);
        assert_eq!(&out[8..], &[0xAD, 0xDE, 0, 0, 0, 0, 0, 0]);
        assert_eq!(
            ExceptionBody::parse(&out).unwrap(),
            ExceptionBody::UnknownVerb(0xDEAD)
        );
    }

    #[test]
    fn exception_body_errors() {
        assert_eq!(
            ExceptionBody::parse(&[0, 0, 0]),
            Err(ParseError::TruncatedException)
        );
        let mut out = BytesMut::new();
        out.put_u32_le(2);
        out.put_u32_le(0);
        assert_eq!(
            ExceptionBody::parse(&out),
            Err(ParseError::UnknownExceptionType(2))
        );
        let mut out = BytesMut::new();
        out.put_u32_le(0);
        out.put_u32_le(2);
        out.put_slice(&[0xFF, 0xFE]);
        assert_eq!(ExceptionBody::parse(&out), Err(ParseError::BadUtf8));
    }

    #[test]
    fn partial_request_needs_more() {
        let r = Request {
            verb: 1,
            msg_id: 1,
            payload: Bytes::from_static(&[0; 100]),
        };
        let mut out = BytesMut::new();
        r.encode(&mut out);
        assert_eq!(Request::parse(&out[..50]).unwrap(), None);
    }
}
