//! Shared-secret authentication for bus frames.
//!
//! A signed frame is `len | payload | tag`, where `len` is the 4-byte
//! big-endian count of payload plus tag bytes. The tag is HMAC-SHA256
//! over the length prefix followed by the payload, and the payload opens
//! with the message type, so a frame cannot be cut short, padded or
//! retyped without failing verification. Frames that fail are dropped
//! without a reply.

use std::fmt;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::ProtocolError;

type HmacSha256 = Hmac<Sha256>;

/// Bytes appended to every signed frame.
pub const TAG_LEN: usize = 32;

/// The key every node on the bus shares.
///
/// Keyed once at startup; each frame works on a clone of the keyed state.
#[derive(Clone)]
pub struct BusSecret {
    keyed: HmacSha256,
}

impl BusSecret {
    pub fn new(key: &[u8]) -> Self {
        Self {
            keyed: HmacSha256::new_from_slice(key).expect("HMAC accepts any key length"),
        }
    }

    /// The tag for a frame with length prefix `prefix`.
    pub fn tag(&self, prefix: [u8; 4], payload: &[u8]) -> [u8; TAG_LEN] {
        let mut mac = self.keyed.clone();
        mac.update(&prefix);
        mac.update(payload);
        mac.finalize().into_bytes().into()
    }

    /// Checks the tag trailing `body` (everything after the prefix) in
    /// constant time and returns the payload in front of it.
    pub fn open<'a>(&self, prefix: [u8; 4], body: &'a [u8]) -> Result<&'a [u8], ProtocolError> {
        let split = body
            .len()
            .checked_sub(TAG_LEN)
            .ok_or(ProtocolError::BadSignature)?;
        let (payload, tag) = body.split_at(split);
        let expected = self.tag(prefix, payload);
        if bool::from(expected[..].ct_eq(tag)) {
            Ok(payload)
        } else {
            Err(ProtocolError::BadSignature)
        }
    }
}

impl fmt::Debug for BusSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BusSecret(..)")
    }
}
