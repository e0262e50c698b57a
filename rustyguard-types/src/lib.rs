//! On-the-wire layouts for the tunnel's four message kinds.
//!
//! Every type here is `#[repr(C)]` and implements zerocopy's `FromBytes` /
//! `AsBytes` so that an inbound datagram can be reinterpreted in place
//! without a copy. Field order and sizes follow the wire format exactly;
//! do not reorder fields.
#![no_std]

use zerocopy::{little_endian, AsBytes, FromBytes, FromZeroes};

/// First (and only meaningful) 4 bytes of every tunnel message: a
/// little-endian `u32` type tag. The upper 3 bytes are reserved and must
/// be zero on send; readers must not reject on them being non-zero here,
/// classification only inspects the low byte.
pub const MSG_FIRST: u32 = 1;
pub const MSG_SECOND: u32 = 2;
pub const MSG_COOKIE_REPLY: u32 = 3;
pub const MSG_DATA: u32 = 4;

/// `sizeof(HandshakeInit)`.
pub const HANDSHAKE_INIT_SZ: usize = 148;
/// `sizeof(HandshakeResp)`.
pub const HANDSHAKE_RESP_SZ: usize = 92;
/// `sizeof(CookieMessage)`.
pub const COOKIE_REPLY_SZ: usize = 64;
/// `sizeof(DataHeader)`, the fixed prefix of every data message.
pub const DATA_HEADER_SZ: usize = 16;
/// Smallest a `Data` message may be: header plus a bare AEAD tag, no payload.
pub const DATA_MIN_SZ: usize = DATA_HEADER_SZ + 16;

pub type Mac = [u8; 16];

/// Plaintext cookie value, as produced by [`crate::CookieMessage`]'s peer
/// and consumed by `rustyguard-crypto`.
#[derive(Clone, Copy, FromBytes, FromZeroes, AsBytes)]
#[repr(transparent)]
pub struct Cookie(pub Mac);

/// A detached Poly1305/ChaCha20Poly1305 tag.
#[derive(Clone, Copy, FromBytes, FromZeroes, AsBytes)]
#[repr(transparent)]
pub struct Tag(pub [u8; 16]);

impl core::ops::Deref for Tag {
    type Target = [u8];
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

macro_rules! encrypted {
    ($i:ident, $n:literal, $doc:literal) => {
        #[doc = $doc]
        #[derive(Clone, Copy, FromBytes, FromZeroes, AsBytes)]
        #[repr(C)]
        pub struct $i {
            pub msg: [u8; $n],
            pub tag: Tag,
        }
    };
}

encrypted!(EncryptedEmpty, 0, "An empty payload, authenticated only.");
encrypted!(EncryptedTimestamp, 12, "An encrypted TAI64N timestamp.");
encrypted!(
    EncryptedPublicKey,
    32,
    "An encrypted X25519 public key."
);

/// The cookie payload, AEAD-sealed under the responder's per-minute secret.
#[derive(Clone, Copy, FromBytes, FromZeroes, AsBytes)]
#[repr(C)]
pub struct EncryptedCookie {
    pub msg: Cookie,
    pub tag: Tag,
}

/// Type 1: the initiator's first handshake message.
///
/// `sender_index(4), ephemeral(32), static+tag(48), timestamp+tag(28),
/// MAC1(16), MAC2(16)` = 148 bytes.
#[derive(Clone, Copy, FromBytes, FromZeroes, AsBytes)]
#[repr(C)]
pub struct HandshakeInit {
    pub _type: little_endian::U32,
    pub sender: little_endian::U32,
    pub ephemeral_key: [u8; 32],
    pub static_key: EncryptedPublicKey,
    pub timestamp: EncryptedTimestamp,
    pub mac1: Mac,
    pub mac2: Mac,
}

/// Type 2: the responder's reply.
///
/// `sender_index(4), receiver_index(4), ephemeral(32), empty+tag(16),
/// MAC1(16), MAC2(16)` = 92 bytes.
#[derive(Clone, Copy, FromBytes, FromZeroes, AsBytes)]
#[repr(C)]
pub struct HandshakeResp {
    pub _type: little_endian::U32,
    pub sender: little_endian::U32,
    pub receiver: little_endian::U32,
    pub ephemeral_key: [u8; 32],
    pub empty: EncryptedEmpty,
    pub mac1: Mac,
    pub mac2: Mac,
}

/// Type 3: a cookie challenge, sent instead of a real response while under
/// load and the sender has not yet proven address ownership.
///
/// `receiver_index(4), nonce(24), encrypted_cookie(16+16)` = 64 bytes.
#[derive(Clone, Copy, FromBytes, FromZeroes, AsBytes)]
#[repr(C)]
pub struct CookieMessage {
    pub _type: little_endian::U32,
    pub receiver: little_endian::U32,
    pub nonce: [u8; 24],
    pub cookie: EncryptedCookie,
}

/// Type 4: the fixed prefix of a transport data message. The remainder of
/// the datagram is `ciphertext || tag`, of variable length.
///
/// `receiver_index(4), counter(8)` = 12 bytes of header, but messages are
/// always aligned to start with the 4-byte type tag, so the header
/// reinterpreted from the wire is `type(4), receiver(4), counter(8)`.
#[derive(Clone, Copy, FromBytes, FromZeroes, AsBytes)]
#[repr(C)]
pub struct DataHeader {
    pub _type: little_endian::U32,
    pub receiver: little_endian::U32,
    pub counter: little_endian::U64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_sizes_match_spec() {
        assert_eq!(core::mem::size_of::<HandshakeInit>(), HANDSHAKE_INIT_SZ);
        assert_eq!(core::mem::size_of::<HandshakeResp>(), HANDSHAKE_RESP_SZ);
        assert_eq!(core::mem::size_of::<CookieMessage>(), COOKIE_REPLY_SZ);
        assert_eq!(core::mem::size_of::<DataHeader>(), DATA_HEADER_SZ);
    }

    #[test]
    fn wire_types_are_four_byte_aligned() {
        assert_eq!(core::mem::align_of::<HandshakeInit>(), 4);
        assert_eq!(core::mem::align_of::<HandshakeResp>(), 4);
        assert_eq!(core::mem::align_of::<CookieMessage>(), 4);
        assert_eq!(core::mem::align_of::<DataHeader>(), 4);
    }
}
