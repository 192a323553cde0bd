//! Wire frames for the dispatcher↔worker datagram protocol.
//!
//! A request is a single datagram; all integers are network byte order:
//!
//! ```text
//! offset 0  : u32      op
//! offset 4  : [u8;16]  key fingerprint
//! offset 20 : u32      inner_len  (= 8 + data_len)
//! offset 24 : u32      data_len
//! offset 28 : u32      padding mode
//! offset 32 : data_len bytes of payload
//! ```
//!
//! Replies carry no framing at all: the datagram's bytes are the result and
//! its length is the result length. Absence of a reply within the RTO is the
//! only failure signal on the wire.

use std::fmt;
use thiserror::Error;

/// Maximum datagram size either direction; fits a 4096-bit RSA operation.
pub const MAX_DATAGRAM: usize = 2048;

/// Byte length of a key fingerprint (MD5 over `n || e`, treated as opaque).
pub const FINGERPRINT_LEN: usize = 16;

/// Fixed-size request header preceding the payload.
pub const HEADER_LEN: usize = 32;

/// Opaque 16-byte key identifier, compared bytewise and sent verbatim on the
/// wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(pub [u8; FINGERPRINT_LEN]);

impl Fingerprint {
    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_LEN] {
        &self.0
    }

    /// Parse from a 32-character hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 2 * FINGERPRINT_LEN {
            return None;
        }
        let mut out = [0u8; FINGERPRINT_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[2 * i..2 * i + 2], 16).ok()?;
        }
        Some(Self(out))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// RSA operation requested of the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Op {
    RsaPrivDecrypt = 1,
    RsaPrivEncrypt = 2,
    RsaPubDecrypt = 3,
    RsaPubEncrypt = 4,
}

impl Op {
    pub fn from_wire(v: u32) -> Option<Self> {
        match v {
            1 => Some(Op::RsaPrivDecrypt),
            2 => Some(Op::RsaPrivEncrypt),
            3 => Some(Op::RsaPubDecrypt),
            4 => Some(Op::RsaPubEncrypt),
            _ => None,
        }
    }
}

/// Padding mode; values match the OpenSSL constants the workers understand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Padding {
    Pkcs1 = 1,
    Sslv23 = 2,
    NoPadding = 3,
    Oaep = 4,
    X931 = 5,
}

impl Padding {
    pub fn from_wire(v: u32) -> Option<Self> {
        match v {
            1 => Some(Padding::Pkcs1),
            2 => Some(Padding::Sslv23),
            3 => Some(Padding::NoPadding),
            4 => Some(Padding::Oaep),
            5 => Some(Padding::X931),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("request payload of {len} bytes exceeds the {MAX_DATAGRAM}-byte datagram limit")]
    TooLarge { len: usize },
    #[error("datagram of {len} bytes is shorter than the {HEADER_LEN}-byte header")]
    Truncated { len: usize },
    #[error("unknown operation code {0}")]
    UnknownOp(u32),
    #[error("unknown padding mode {0}")]
    UnknownPadding(u32),
    #[error("length fields disagree with the datagram (inner {inner}, data {data}, got {got})")]
    LengthMismatch { inner: u32, data: u32, got: usize },
}

/// Encode one request datagram.
pub fn encode_request(
    fingerprint: &Fingerprint,
    op: Op,
    pad: Padding,
    data: &[u8],
) -> Result<Vec<u8>, CodecError> {
    let total = HEADER_LEN + data.len();
    if total > MAX_DATAGRAM {
        return Err(CodecError::TooLarge { len: data.len() });
    }

    let mut buf = Vec::with_capacity(total);
    buf.extend_from_slice(&(op as u32).to_be_bytes());
    buf.extend_from_slice(&fingerprint.0);
    buf.extend_from_slice(&(8 + data.len() as u32).to_be_bytes());
    buf.extend_from_slice(&(data.len() as u32).to_be_bytes());
    buf.extend_from_slice(&(pad as u32).to_be_bytes());
    buf.extend_from_slice(data);
    Ok(buf)
}

/// Append one length-prefixed field (`u32 len | len bytes`) to a key
/// material blob. Big integers in registration blobs are carried this way,
/// big-endian, one field per RSA parameter.
pub fn encode_vli(buf: &mut Vec<u8>, field: &[u8]) {
    buf.extend_from_slice(&(field.len() as u32).to_be_bytes());
    buf.extend_from_slice(field);
}

/// Split one length-prefixed field off the front of `buf`, returning the
/// field and the remainder.
pub fn decode_vli(buf: &[u8]) -> Result<(&[u8], &[u8]), CodecError> {
    if buf.len() < 4 {
        return Err(CodecError::Truncated { len: buf.len() });
    }
    let len = u32::from_be_bytes(buf[0..4].try_into().unwrap()) as usize;
    if buf.len() < 4 + len {
        return Err(CodecError::Truncated { len: buf.len() });
    }
    Ok((&buf[4..4 + len], &buf[4 + len..]))
}

/// Decoded view of a request datagram, borrowed from the receive buffer.
#[derive(Debug)]
pub struct RequestFrame<'a> {
    pub op: Op,
    pub fingerprint: Fingerprint,
    pub pad: Padding,
    pub data: &'a [u8],
}

/// Decode and validate a request datagram (worker side).
pub fn decode_request(buf: &[u8]) -> Result<RequestFrame<'_>, CodecError> {
    if buf.len() < HEADER_LEN {
        return Err(CodecError::Truncated { len: buf.len() });
    }

    let op_raw = u32::from_be_bytes(buf[0..4].try_into().unwrap());
    let op = Op::from_wire(op_raw).ok_or(CodecError::UnknownOp(op_raw))?;

    let mut fp = [0u8; FINGERPRINT_LEN];
    fp.copy_from_slice(&buf[4..20]);

    let inner_len = u32::from_be_bytes(buf[20..24].try_into().unwrap());
    let data_len = u32::from_be_bytes(buf[24..28].try_into().unwrap());
    let pad_raw = u32::from_be_bytes(buf[28..32].try_into().unwrap());
    let pad = Padding::from_wire(pad_raw).ok_or(CodecError::UnknownPadding(pad_raw))?;

    if inner_len != 8 + data_len || buf.len() != HEADER_LEN + data_len as usize {
        return Err(CodecError::LengthMismatch {
            inner: inner_len,
            data: data_len,
            got: buf.len(),
        });
    }

    Ok(RequestFrame {
        op,
        fingerprint: Fingerprint(fp),
        pad,
        data: &buf[HEADER_LEN..],
    })
}
