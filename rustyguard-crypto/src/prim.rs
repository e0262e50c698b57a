//! BLAKE2s/HKDF/ChaCha20Poly1305 primitives underlying the Noise IKpsk2
//! handshake and the transport cipher. Nothing here understands the wire
//! format; it only knows how to mix hashes and chain keys.

use blake2::digest::consts::U32;
use blake2::digest::generic_array::GenericArray;
use blake2::digest::{Digest, Output};
use blake2::Blake2s256;
use chacha20poly1305::Nonce;
use hmac::SimpleHmac;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Construction: the UTF-8 string literal "Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s".
/// Identifier: the UTF-8 string literal "WireGuard v1 zx2c4 Jason@zx2c4.com".
/// Ci := Hash(Construction), Hi := Hash(Ci || Identifier).
pub(crate) const CONSTRUCTION_HASH: [u8; 32] = [
    96, 226, 109, 174, 243, 39, 239, 192, 46, 195, 53, 226, 160, 37, 210, 208, 22, 235, 66, 6, 248,
    114, 119, 245, 45, 56, 209, 152, 139, 120, 205, 54,
];
pub(crate) const IDENTIFIER_HASH: [u8; 32] = [
    34, 17, 179, 97, 8, 26, 197, 102, 105, 18, 67, 219, 69, 138, 213, 50, 45, 156, 108, 102, 34,
    147, 232, 183, 14, 225, 156, 101, 186, 7, 158, 243,
];
pub(crate) const LABEL_MAC1: [u8; 8] = *b"mac1----";
pub(crate) const LABEL_COOKIE: [u8; 8] = *b"cookie--";

pub type Key = GenericArray<u8, U32>;
pub type Mac = [u8; 16];

/// Per-direction transport key. `EncryptionKey`/`DecryptionKey` are
/// distinct types so the handshake's `split` cannot be accidentally used
/// with the keys swapped between initiator and responder.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey(pub(crate) Key);
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DecryptionKey(pub(crate) Key);

impl EncryptionKey {
    pub fn as_key(&self) -> &Key {
        &self.0
    }

    /// Wrap an already-derived key. Only `split` produces keys in normal
    /// operation; this exists for tests and for restoring a keypair that
    /// was serialized elsewhere.
    pub fn from_bytes(key: Key) -> Self {
        Self(key)
    }
}
impl DecryptionKey {
    pub fn as_key(&self) -> &Key {
        &self.0
    }

    pub fn from_bytes(key: Key) -> Self {
        Self(key)
    }
}

/// `nonce(0)` for every handshake AEAD operation: each handshake message
/// field is encrypted exactly once under a freshly derived key, so the
/// counter is always zero. Transport messages instead use the 64-bit data
/// counter from the wire header.
pub(crate) fn nonce(counter: u64) -> Nonce {
    let mut n = Nonce::default();
    n[4..].copy_from_slice(&u64::to_le_bytes(counter));
    n
}

pub(crate) fn hash<const M: usize>(msg: [&[u8]; M]) -> Output<Blake2s256> {
    let mut digest = Blake2s256::default();
    for msg in msg {
        digest.update(msg);
    }
    digest.finalize()
}

pub fn mac(key: &[u8], msg: &[u8]) -> Mac {
    use blake2::digest::Mac as _;
    let mut mac = blake2::Blake2sMac::<blake2::digest::consts::U16>::new_from_slice(key).unwrap();
    mac.update(msg);
    mac.finalize().into_bytes().into()
}

fn hmac<const M: usize>(key: &Key, msg: [&[u8]; M]) -> Output<Blake2s256> {
    use hmac::Mac as _;
    let mut hmac = <SimpleHmac<Blake2s256> as hmac::Mac>::new_from_slice(key).unwrap();
    for msg in msg {
        hmac.update(msg);
    }
    hmac.finalize().into_bytes()
}

pub(crate) fn hkdf<const N: usize, const M: usize>(
    key: &Key,
    msg: [&[u8]; M],
) -> [Output<Blake2s256>; N] {
    assert!(N <= 255);

    let mut output = [Output::<Blake2s256>::default(); N];
    if N == 0 {
        return output;
    }

    let t0 = hmac(key, msg);
    let mut ti = hmac(&t0, [&[1]]);
    output[0] = ti;
    for i in 1..N as u8 {
        ti = hmac(&t0, [&ti, &[i + 1]]);
        output[i as usize] = ti;
    }

    output
}

/// Running Noise `(h, ck)` state. `mix_chain`/`mix_dh`/`mix_key_dh` feed
/// the chaining key; `mix_hash` feeds the transcript hash used as AEAD
/// associated data.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct HandshakeState {
    hash: Key,
    chain: Key,
}

impl Default for HandshakeState {
    fn default() -> Self {
        let chain = GenericArray::from(CONSTRUCTION_HASH);
        let hash = GenericArray::from(IDENTIFIER_HASH);
        Self { chain, hash }
    }
}

impl HandshakeState {
    pub fn mix_chain(&mut self, b: &[u8]) {
        let [c] = hkdf(&self.chain, [b]);
        self.chain = c;
    }

    pub fn mix_dh(&mut self, sk: &StaticSecret, pk: &PublicKey) {
        let prk = sk.diffie_hellman(pk);
        let [c] = hkdf(&self.chain, [prk.as_bytes()]);
        self.chain = c;
    }

    pub fn mix_key_dh(&mut self, sk: &StaticSecret, pk: &PublicKey) -> Key {
        let prk = sk.diffie_hellman(pk);
        let [c, k] = hkdf(&self.chain, [prk.as_bytes()]);
        self.chain = c;
        k
    }

    pub fn mix_key_and_hash(&mut self, b: &[u8]) -> Key {
        let [c, t, k] = hkdf(&self.chain, [b]);
        self.chain = c;
        self.mix_hash(&t);
        k
    }

    pub fn mix_hash(&mut self, b: &[u8]) {
        self.hash = hash([&self.hash, b]);
    }

    /// The transcript hash, used as AEAD associated data for the *next*
    /// field to be encrypted or decrypted — callers must mix the field's
    /// own bytes in via `mix_hash` only after using this value as AAD.
    pub(crate) fn current_hash(&self) -> Key {
        self.hash
    }

    /// Derive the pair of transport keys and zeroize the handshake state.
    /// `is_initiator` selects which of the two derived keys encrypts and
    /// which decrypts: the initiator sends with the first, the responder
    /// sends with the second.
    pub fn split(&mut self, is_initiator: bool) -> (EncryptionKey, DecryptionKey) {
        let [k1, k2] = hkdf(&self.chain, []);
        self.zeroize();
        if is_initiator {
            (EncryptionKey(k1), DecryptionKey(k2))
        } else {
            (EncryptionKey(k2), DecryptionKey(k1))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blake2::Digest;

    #[test]
    fn construction_identifier() {
        let c = Blake2s256::default()
            .chain_update(b"Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s")
            .finalize();
        let h = Blake2s256::default()
            .chain_update(c)
            .chain_update(b"WireGuard v1 zx2c4 Jason@zx2c4.com")
            .finalize();

        assert_eq!(&*c, &CONSTRUCTION_HASH);
        assert_eq!(&*h, &IDENTIFIER_HASH);
    }

    #[test]
    fn split_is_antisymmetric() {
        let mut a = HandshakeState::default();
        a.mix_hash(b"shared transcript");
        let mut b = HandshakeState::default();
        b.mix_hash(b"shared transcript");

        let (enc_i, dec_i) = a.split(true);
        let (enc_r, dec_r) = b.split(false);

        assert_eq!(enc_i.as_key(), dec_r.as_key());
        assert_eq!(enc_r.as_key(), dec_i.as_key());
    }
}
