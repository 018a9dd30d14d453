//! Wire codec for the shoal RPC framing protocol.
//!
//! All integers are little-endian. The connection opens with a
//! negotiation frame from each side; after that, requests flow one way
//! and responses the other, matched by `msg_id`. Responses may arrive in
//! any order, and not every request must be answered.
//!
//! Frame layouts:
//! - Negotiation: 8-byte magic `SSTARRPC`, u32 required-features,
//!   u32 optional-features, u32 len, len bytes of data.
//! - Request: u64 verb, i64 msg_id (positive, never reused), u32 len,
//!   len bytes of payload.
//! - Response: i64 msg_id, u32 len, len bytes of payload. A negative
//!   msg_id marks the payload as an exception for request `-msg_id`.
//! - Exception body: u32 type, u32 len, len bytes; type 0 carries a
//!   UTF-8 error string, type 1 carries the unrecognized u64 verb.

mod error;
mod frame;

pub use error::ParseError;
pub use frame::{ExceptionBody, MAGIC, Negotiation, Request, Response};
