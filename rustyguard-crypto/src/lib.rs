//! Noise IKpsk2 handshake transforms and cookie AEAD for the tunnel.
//!
//! This crate is the cryptographic collaborator the receive path treats as
//! a black box: it is handed wire-format structs and returns either a
//! decrypted/authenticated view of them or a [`CryptoError`]. It never
//! touches sockets, peer tables, or timers.
#![no_std]

use core::{net::SocketAddr, ops::ControlFlow};

pub use prim::{DecryptionKey, EncryptionKey, HandshakeState, Key, Mac};
use prim::{hash, LABEL_COOKIE, LABEL_MAC1};

use rand_core::{CryptoRng, RngCore};
pub use rustyguard_types::Cookie;
use rustyguard_types::{
    EncryptedCookie, EncryptedEmpty, EncryptedPublicKey, EncryptedTimestamp, HandshakeInit,
    HandshakeResp, Tag, MSG_FIRST, MSG_SECOND,
};

use tai64::Tai64N;
pub use x25519_dalek::{PublicKey, StaticSecret};
use zerocopy::{little_endian, AsBytes};
use zeroize::{Zeroize, ZeroizeOnDrop};

#[cfg(any(test, rustyguard_unsafe_logging))]
extern crate std;

macro_rules! unsafe_log {
    ($($t:tt)*) => {
        match core::format_args!($($t)*) {
            #[cfg(any(test, rustyguard_unsafe_logging))]
            args => std::eprintln!("{args}"),
            #[cfg(not(any(test, rustyguard_unsafe_logging)))]
            _ => {}
        };
    }
}

mod prim;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    DecryptionError,
    Rejected,
}

fn as_tag(tag: &Tag) -> &chacha20poly1305::Tag {
    chacha20poly1305::Tag::from_slice(&tag.0)
}

macro_rules! encrypted_ops {
    ($i:ident, $n:literal, $decrypt_fn:ident, $encrypt_fn:ident) => {
        fn $decrypt_fn<'m>(
            msg: &'m mut rustyguard_types::$i,
            state: &mut HandshakeState,
            key: &Key,
        ) -> Result<&'m mut [u8; $n], CryptoError> {
            use chacha20poly1305::{AeadInPlace, ChaCha20Poly1305, KeyInit};

            let aad = state.current_hash();
            state.mix_hash(msg.as_bytes());

            ChaCha20Poly1305::new(key)
                .decrypt_in_place_detached(&prim::nonce(0), &aad, &mut msg.msg, as_tag(&msg.tag))
                .map_err(|_| CryptoError::DecryptionError)?;
            Ok(&mut msg.msg)
        }

        fn $encrypt_fn(
            mut payload: [u8; $n],
            state: &mut HandshakeState,
            key: &Key,
        ) -> rustyguard_types::$i {
            use chacha20poly1305::{AeadInPlace, ChaCha20Poly1305, KeyInit};

            let aad = state.current_hash();
            let tag = ChaCha20Poly1305::new(key)
                .encrypt_in_place_detached(&prim::nonce(0), &aad, &mut payload)
                .expect("handshake field is far smaller than the AEAD message limit");

            let out = rustyguard_types::$i {
                msg: payload,
                tag: Tag(tag.into()),
            };
            state.mix_hash(out.as_bytes());
            out
        }
    };
}

encrypted_ops!(EncryptedEmpty, 0, decrypt_empty, encrypt_empty);
encrypted_ops!(EncryptedTimestamp, 12, decrypt_timestamp, encrypt_timestamp);
encrypted_ops!(EncryptedPublicKey, 32, decrypt_public_key, encrypt_public_key);

pub fn decrypt_cookie<'c>(
    cookie: &'c mut EncryptedCookie,
    key: &Key,
    nonce: &[u8; 24],
    aad: &[u8],
) -> Result<&'c mut Cookie, CryptoError> {
    use chacha20poly1305::{AeadInPlace, KeyInit, XChaCha20Poly1305};

    XChaCha20Poly1305::new(key)
        .decrypt_in_place_detached(nonce.into(), aad, &mut cookie.msg.0, as_tag(&cookie.tag))
        .map_err(|_| CryptoError::DecryptionError)?;

    Ok(&mut cookie.msg)
}

pub fn encrypt_cookie(
    mut cookie: Cookie,
    key: &Key,
    nonce: &[u8; 24],
    aad: &[u8],
) -> EncryptedCookie {
    use chacha20poly1305::{AeadInPlace, KeyInit, XChaCha20Poly1305};

    let tag = XChaCha20Poly1305::new(key)
        .encrypt_in_place_detached(nonce.into(), aad, &mut cookie.0)
        .expect("cookie message is far smaller than the AEAD message limit");

    EncryptedCookie {
        msg: cookie,
        tag: Tag(tag.into()),
    }
}

pub fn mac1_key(spk: &PublicKey) -> Key {
    hash([&LABEL_MAC1, spk.as_bytes()]).into()
}
pub fn cookie_key(spk: &PublicKey) -> Key {
    hash([&LABEL_COOKIE, spk.as_bytes()]).into()
}

/// Per-device cookie secret, rotated on a timer (see [`CookieState::generate`]).
/// Validation never blocks on rotation: the caller is expected to hold the
/// current secret behind something like `arc_swap::ArcSwap` and only clone
/// out a `CookieState` snapshot to call into this crate.
#[derive(Zeroize, ZeroizeOnDrop, Default)]
pub struct CookieState {
    key: Key,
}

impl CookieState {
    pub fn generate(&mut self, rng: &mut (impl CryptoRng + RngCore)) {
        rng.fill_bytes(&mut self.key);
    }

    /// Derive the cookie value for a given source address. There is no
    /// specified encoding here beyond "binds the address" — WireGuard's
    /// own reference implementation leaves this unspecified.
    pub fn new_cookie(&self, addr: SocketAddr) -> Cookie {
        let mut a = [0u8; 18];
        match addr.ip() {
            core::net::IpAddr::V4(ipv4) => a[..4].copy_from_slice(&ipv4.octets()[..]),
            core::net::IpAddr::V6(ipv6) => a[..16].copy_from_slice(&ipv6.octets()[..]),
        }
        a[16..].copy_from_slice(&addr.port().to_le_bytes()[..]);
        Cookie(prim::mac(&self.key, &a))
    }
}

/// Both handshake messages are protected via MACs which can quickly be
/// used to rule out invalid messages.
///
/// MAC1 verifies that the message is even worth processing: it is cheap
/// and checked unconditionally. MAC2 is only checked under load; it proves
/// the sender holds a cookie minted for their address, and failing it
/// returns a fresh cookie rather than an error.
pub trait HasMac: AsBytes + Sized {
    fn verify<'m>(
        &'m self,
        mac1_key: &Key,
        overload: bool,
        cookie: &CookieState,
        addr: SocketAddr,
    ) -> Result<ControlFlow<Cookie, &'m Self>, CryptoError> {
        self.verify_mac1(mac1_key)?;

        if overload {
            let cookie = cookie.new_cookie(addr);
            if self.verify_mac2(&cookie).is_err() {
                return Ok(ControlFlow::Break(cookie));
            }
        }

        Ok(ControlFlow::Continue(self))
    }

    fn verify_mac1(&self, mac1_key: &Key) -> Result<(), CryptoError> {
        use subtle::ConstantTimeEq;
        let actual_mac1 = self.compute_mac1(mac1_key);
        if actual_mac1.ct_ne(self.get_mac1()).into() {
            unsafe_log!("invalid mac1");
            Err(CryptoError::Rejected)
        } else {
            unsafe_log!("valid mac1");
            Ok(())
        }
    }

    fn verify_mac2(&self, cookie: &Cookie) -> Result<(), CryptoError> {
        use subtle::ConstantTimeEq;
        let actual_mac2 = self.compute_mac2(cookie);
        if actual_mac2.ct_ne(self.get_mac2()).into() {
            unsafe_log!("invalid mac2");
            Err(CryptoError::Rejected)
        } else {
            unsafe_log!("valid mac2");
            Ok(())
        }
    }

    fn compute_mac1(&self, mac1_key: &Key) -> Mac;
    fn compute_mac2(&self, cookie: &Cookie) -> Mac;
    fn get_mac1(&self) -> &Mac;
    fn get_mac2(&self) -> &Mac;
}

macro_rules! mac_protected {
    ($i:ident) => {
        impl HasMac for $i {
            fn compute_mac1(&self, mac1_key: &Key) -> Mac {
                let offset = core::mem::offset_of!($i, mac1);
                let bytes = self.as_bytes();
                prim::mac(mac1_key, &bytes[..offset])
            }

            fn compute_mac2(&self, cookie: &Cookie) -> Mac {
                let offset = core::mem::offset_of!($i, mac2);
                let bytes = self.as_bytes();
                prim::mac(&cookie.0, &bytes[..offset])
            }

            fn get_mac1(&self) -> &Mac {
                &self.mac1
            }

            fn get_mac2(&self) -> &Mac {
                &self.mac2
            }
        }
    };
}

mac_protected!(HandshakeInit);
mac_protected!(HandshakeResp);

// ---- Noise IKpsk2 ---- //
// WireGuard makes use of a slightly modified Noise IKpsk2 handshake.
// Read the noise specification: https://noiseprotocol.org/noise.html
//
// The IKpsk2 pattern is as follows:
// <- s
// -> e, es, s, ss
// <- e, ee, se, psk
//
// The initiator is expected to know the responder's static public key
// prior to the handshake. The initiator sends an ephemeral public key and
// their encrypted static public key.

pub struct StaticPeerConfig {
    /// Peer's public key.
    pub key: PublicKey,
    /// Peer's preshared key.
    pub preshared_key: Key,
    /// Cached mac1_key: calculated using `mac1_key(&self.key)`.
    pub mac1_key: Key,
    /// Cached cookie_key: calculated using `cookie_key(&self.key)`.
    pub cookie_key: Key,
}

pub struct StaticInitiatorConfig {
    /// Our private key.
    pub private_key: StaticSecret,
    /// Cached public key, derived from the above private key.
    pub public_key: PublicKey,
    /// Cached mac1_key: calculated using `mac1_key(&self.public_key)`.
    pub mac1_key: Key,
    /// Cached cookie_key: calculated using `cookie_key(&self.public_key)`.
    pub cookie_key: Key,
}

impl StaticPeerConfig {
    pub fn new(key: PublicKey, preshared_key: Option<Key>) -> Self {
        Self {
            mac1_key: mac1_key(&key),
            cookie_key: cookie_key(&key),
            key,
            preshared_key: preshared_key.unwrap_or_default(),
        }
    }
}

impl StaticInitiatorConfig {
    pub fn new(key: StaticSecret) -> Self {
        let public_key = PublicKey::from(&key);
        Self {
            mac1_key: mac1_key(&public_key),
            cookie_key: cookie_key(&public_key),
            public_key,
            private_key: key,
        }
    }
}

/// A [`HandshakeInit`] whose static key and timestamp fields have been
/// decrypted in place. Distinguishing this type from `HandshakeInit`
/// statically prevents reading `static_key`/`timestamp` before they have
/// been authenticated.
#[repr(transparent)]
pub struct DecryptedHandshakeInit(HandshakeInit);

impl DecryptedHandshakeInit {
    #[inline(always)]
    pub fn static_key(&self) -> PublicKey {
        PublicKey::from(self.0.static_key.msg)
    }
    #[inline(always)]
    pub fn timestamp(&self) -> Tai64N {
        Tai64N::from_slice(&self.0.timestamp.msg).expect("tai64n timestamps are exactly 12 bytes")
    }
    #[inline(always)]
    pub fn sender_index(&self) -> u32 {
        self.0.sender.get()
    }
}

#[allow(clippy::too_many_arguments)]
pub fn encrypt_handshake_init(
    hs: &mut HandshakeState,
    initiator: &StaticInitiatorConfig,
    peer: &StaticPeerConfig,
    esk_i: &StaticSecret,
    now: Tai64N,
    sender: u32,
    cookie: Option<&Cookie>,
) -> HandshakeInit {
    // <- s:
    hs.mix_hash(peer.key.as_bytes());

    // -> e: ephemeral keypair generated by caller.
    // WireGuard goes off-spec here with mix_chain.
    let epk_i = PublicKey::from(esk_i);
    hs.mix_chain(epk_i.as_bytes());
    hs.mix_hash(epk_i.as_bytes());

    // -> es:
    let k = hs.mix_key_dh(esk_i, &peer.key);

    // -> s:
    let static_key = encrypt_public_key(initiator.public_key.to_bytes(), hs, &k);

    // -> ss:
    let k = hs.mix_key_dh(&initiator.private_key, &peer.key);

    // payload:
    let timestamp = encrypt_timestamp(now.to_bytes(), hs, &k);

    let mut msg = HandshakeInit {
        _type: little_endian::U32::new(MSG_FIRST),
        sender: little_endian::U32::new(sender),
        ephemeral_key: epk_i.to_bytes(),
        static_key,
        timestamp,
        mac1: [0; 16],
        mac2: [0; 16],
    };
    msg.mac1 = msg.compute_mac1(&peer.mac1_key);
    if let Some(cookie) = cookie {
        msg.mac2 = msg.compute_mac2(cookie);
    }

    msg
}

pub fn decrypt_handshake_init<'m>(
    init: &'m mut HandshakeInit,
    hs: &mut HandshakeState,
    receiver: &StaticInitiatorConfig,
) -> Result<&'m mut DecryptedHandshakeInit, CryptoError> {
    // <- s:
    hs.mix_hash(receiver.public_key.as_bytes());

    // -> e:
    hs.mix_chain(&init.ephemeral_key);
    hs.mix_hash(&init.ephemeral_key);

    // -> es:
    let epk_i = PublicKey::from(init.ephemeral_key);
    let k = hs.mix_key_dh(&receiver.private_key, &epk_i);

    unsafe_log!("decrypting static key");
    // -> s:
    let spk_i = decrypt_public_key(&mut init.static_key, hs, &k)?;
    let spk_i = PublicKey::from(*spk_i);
    unsafe_log!("decrypted static key {spk_i:?}");

    // -> ss:
    let k = hs.mix_key_dh(&receiver.private_key, &spk_i);

    unsafe_log!("decrypting timestamp payload");
    // payload:
    let _timestamp = *decrypt_timestamp(&mut init.timestamp, hs, &k)?;

    // SAFETY: `DecryptedHandshakeInit` is `#[repr(transparent)]` over
    // `HandshakeInit`; both fields we just decrypted are plaintext now.
    Ok(unsafe { &mut *(init as *mut HandshakeInit as *mut DecryptedHandshakeInit) })
}

pub fn encrypt_handshake_resp(
    hs: &mut HandshakeState,
    data: &DecryptedHandshakeInit,
    esk_r: &StaticSecret,
    peer: &StaticPeerConfig,
    sender: u32,
    cookie: Option<&Cookie>,
) -> HandshakeResp {
    // <- e: ephemeral keypair generated by caller.
    let epk_r = PublicKey::from(esk_r);
    hs.mix_chain(epk_r.as_bytes());
    hs.mix_hash(epk_r.as_bytes());

    // <- ee
    let epk_i = PublicKey::from(data.0.ephemeral_key);
    hs.mix_dh(esk_r, &epk_i);

    // <- se
    let spk_i = PublicKey::from(data.0.static_key.msg);
    hs.mix_dh(esk_r, &spk_i);

    // <- psk
    let k = hs.mix_key_and_hash(&peer.preshared_key);

    // payload:
    let empty = encrypt_empty([], hs, &k);

    let mut msg = HandshakeResp {
        _type: little_endian::U32::new(MSG_SECOND),
        sender: little_endian::U32::new(sender),
        receiver: data.0.sender,
        ephemeral_key: epk_r.to_bytes(),
        empty,
        mac1: [0; 16],
        mac2: [0; 16],
    };
    msg.mac1 = msg.compute_mac1(&peer.mac1_key);
    if let Some(cookie) = cookie {
        msg.mac2 = msg.compute_mac2(cookie);
    }

    msg
}

pub fn decrypt_handshake_resp(
    resp: &mut HandshakeResp,
    hs: &mut HandshakeState,
    initiator: &StaticInitiatorConfig,
    peer: &StaticPeerConfig,
    esk_i: &StaticSecret,
) -> Result<(), CryptoError> {
    // <- e:
    let epk_r = PublicKey::from(resp.ephemeral_key);
    hs.mix_chain(epk_r.as_bytes());
    hs.mix_hash(epk_r.as_bytes());

    // <- ee:
    hs.mix_dh(esk_i, &epk_r);

    // <- se:
    hs.mix_dh(&initiator.private_key, &epk_r);

    // <- psk:
    let k = hs.mix_key_and_hash(&peer.preshared_key);

    unsafe_log!("decrypting empty payload");
    // payload:
    decrypt_empty(&mut resp.empty, hs, &k)?;

    Ok(())
}

/// Encrypt one transport data packet. `counter` becomes the wire nonce and
/// must never repeat under the same [`EncryptionKey`].
pub fn encrypt_data(key: &EncryptionKey, counter: u64, plaintext: &mut [u8]) -> Result<Tag, CryptoError> {
    use chacha20poly1305::{AeadInPlace, ChaCha20Poly1305, KeyInit};

    let tag = ChaCha20Poly1305::new(key.as_key())
        .encrypt_in_place_detached(&prim::nonce(counter), b"", plaintext)
        .map_err(|_| CryptoError::DecryptionError)?;
    Ok(Tag(tag.into()))
}

/// Decrypt one transport data packet in place.
pub fn decrypt_data(
    key: &DecryptionKey,
    counter: u64,
    ciphertext: &mut [u8],
    tag: &Tag,
) -> Result<(), CryptoError> {
    use chacha20poly1305::{AeadInPlace, ChaCha20Poly1305, KeyInit};

    ChaCha20Poly1305::new(key.as_key())
        .decrypt_in_place_detached(&prim::nonce(counter), b"", ciphertext, as_tag(tag))
        .map_err(|_| CryptoError::DecryptionError)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    fn make_peers() -> (StaticInitiatorConfig, StaticPeerConfig, StaticInitiatorConfig, StaticPeerConfig) {
        let i_sk = StaticSecret::random_from_rng(OsRng);
        let r_sk = StaticSecret::random_from_rng(OsRng);
        let i_cfg = StaticInitiatorConfig::new(i_sk);
        let r_cfg = StaticInitiatorConfig::new(r_sk);

        let i_as_peer = StaticPeerConfig::new(i_cfg.public_key, None);
        let r_as_peer = StaticPeerConfig::new(r_cfg.public_key, None);
        (i_cfg, r_as_peer, r_cfg, i_as_peer)
    }

    #[test]
    fn full_handshake_roundtrip_and_mac1() {
        let (i_cfg, r_as_peer_of_i, r_cfg, i_as_peer_of_r) = make_peers();

        let esk_i = StaticSecret::random_from_rng(OsRng);
        let mut hs_i = HandshakeState::default();
        let mut init = encrypt_handshake_init(
            &mut hs_i,
            &i_cfg,
            &r_as_peer_of_i,
            &esk_i,
            Tai64N::UNIX_EPOCH,
            42,
            None,
        );

        init.verify_mac1(&r_as_peer_of_i.mac1_key).unwrap();

        let mut hs_r = HandshakeState::default();
        let decrypted = decrypt_handshake_init(&mut init, &mut hs_r, &r_cfg).unwrap();
        assert_eq!(decrypted.static_key(), i_cfg.public_key);
        assert_eq!(decrypted.sender_index(), 42);

        let esk_r = StaticSecret::random_from_rng(OsRng);
        let mut resp = encrypt_handshake_resp(
            &mut hs_r,
            decrypted,
            &esk_r,
            &i_as_peer_of_r,
            7,
            None,
        );
        resp.verify_mac1(&i_as_peer_of_r.mac1_key).unwrap();

        decrypt_handshake_resp(&mut resp, &mut hs_i, &i_cfg, &r_as_peer_of_i, &esk_i).unwrap();

        let (enc_i, dec_i) = hs_i.split(true);
        let (enc_r, dec_r) = hs_r.split(false);
        assert_eq!(enc_i.as_key(), dec_r.as_key());
        assert_eq!(enc_r.as_key(), dec_i.as_key());

        let mut payload = *b"hello, tunnel!!!";
        let tag = encrypt_data(&enc_i, 0, &mut payload).unwrap();
        decrypt_data(&dec_r, 0, &mut payload, &tag).unwrap();
        assert_eq!(&payload, b"hello, tunnel!!!");
    }

    #[test]
    fn tampered_mac1_is_rejected() {
        let (i_cfg, r_as_peer_of_i, _r_cfg, _i_as_peer_of_r) = make_peers();
        let esk_i = StaticSecret::random_from_rng(OsRng);
        let mut hs_i = HandshakeState::default();
        let mut init = encrypt_handshake_init(
            &mut hs_i,
            &i_cfg,
            &r_as_peer_of_i,
            &esk_i,
            Tai64N::UNIX_EPOCH,
            1,
            None,
        );
        init.mac1[0] ^= 0xff;
        assert_eq!(
            init.verify_mac1(&r_as_peer_of_i.mac1_key),
            Err(CryptoError::Rejected)
        );
    }
}
