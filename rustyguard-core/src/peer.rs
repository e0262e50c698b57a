use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwapOption;
use ipnet::IpNet;
use parking_lot::Mutex;
use rustyguard_crypto::{DecryptionKey, EncryptionKey, HandshakeState, StaticPeerConfig};
use tai64::Tai64N;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::device::DeviceInner;
use crate::stats::Stats;

static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);

/// State left behind by [`Device::initiate_handshake`] so the response,
/// when it arrives, can be matched against the transcript that produced
/// the initiation.
pub struct InitiationState {
    pub(crate) hs: HandshakeState,
    pub(crate) esk: StaticSecret,
    pub(crate) local_index: u32,
}

/// The five named states of the per-peer handshake state machine. Only
/// `Idle` and `CreatedInitiation` persist across a network round trip;
/// `ConsumedInitiation` and `CreatedResponse` are entered and (for the
/// responder role) settled within a single worker invocation, and
/// `ConsumedResponse` is entered immediately before the keypair promotion
/// that follows it.
pub enum HandshakePhase {
    Idle,
    CreatedInitiation(Box<InitiationState>),
    ConsumedInitiation,
    CreatedResponse,
    ConsumedResponse,
}

impl HandshakePhase {
    pub fn is_idle(&self) -> bool {
        matches!(self, HandshakePhase::Idle)
    }
}

/// One derived transport keypair, directional (send/recv are distinct
/// types so a decryption key can never accidentally be used to encrypt).
pub struct Keypair {
    pub send: EncryptionKey,
    pub recv: DecryptionKey,
    pub local_index: u32,
    pub remote_index: u32,
    pub send_counter: AtomicU64,
    pub established_at: Tai64N,
}

/// The {previous, current, next} triple described in the data model.
/// `next` holds a responder-created session until the first data packet
/// decrypted under it proves the peer received our response, at which
/// point [`KeypairSet::promote_next_to_current`] runs.
#[derive(Default)]
pub struct KeypairSet {
    pub previous: Option<Arc<Keypair>>,
    pub current: Option<Arc<Keypair>>,
    pub next: Option<Arc<Keypair>>,
}

impl KeypairSet {
    /// Initiator path: a freshly confirmed session becomes `current`
    /// immediately (receiving a valid signed response is itself the
    /// confirmation); the old `current` retires to `previous` and the old
    /// `previous` is discarded.
    pub fn install_as_current(&mut self, kp: Keypair) {
        self.previous = self.current.take();
        self.current = Some(Arc::new(kp));
    }

    /// Responder path: park the new session in `next` until proven live.
    pub fn install_as_next(&mut self, kp: Keypair) {
        self.next = Some(Arc::new(kp));
    }

    /// Find the keypair matching `receiver_index` (the index *we* assigned
    /// when this keypair's local half was created), searching current,
    /// then previous, then next. Returns whether it was `next`, so the
    /// caller can promote it.
    pub fn find_decrypt(&self, receiver_index: u32) -> Option<(Arc<Keypair>, bool)> {
        if let Some(kp) = &self.current {
            if kp.local_index == receiver_index {
                return Some((kp.clone(), false));
            }
        }
        if let Some(kp) = &self.previous {
            if kp.local_index == receiver_index {
                return Some((kp.clone(), false));
            }
        }
        if let Some(kp) = &self.next {
            if kp.local_index == receiver_index {
                return Some((kp.clone(), true));
            }
        }
        None
    }

    pub fn promote_next_to_current(&mut self) {
        self.previous = self.current.take();
        self.current = self.next.take();
    }

    pub fn current_send(&self) -> Option<Arc<Keypair>> {
        self.current.clone()
    }

    /// Drop any keypair established more than `timeout` ago. Once a slot
    /// is cleared, [`Device::send_message`](crate::device::Device::send_message)
    /// falls back to originating a fresh handshake, and
    /// [`KeypairSet::find_decrypt`] simply no longer matches on that index.
    pub fn expire_older_than(&mut self, now: Tai64N, timeout: std::time::Duration) {
        let is_stale = |kp: &Arc<Keypair>| {
            now.to_duration().saturating_sub(kp.established_at.to_duration()) >= timeout
        };
        if self.current.as_ref().is_some_and(is_stale) {
            self.current = None;
        }
        if self.previous.as_ref().is_some_and(is_stale) {
            self.previous = None;
        }
        if self.next.as_ref().is_some_and(is_stale) {
            self.next = None;
        }
    }
}

/// A configured tunnel peer. Reference-counted (`Arc<Peer>`); the receive
/// path only clones and drops the `Arc`, it never constructs or tears one
/// down (see [`crate::device::Device::add_peer`]).
pub struct Peer {
    id: u64,
    pub(crate) config: StaticPeerConfig,
    allowed_ips: Vec<IpNet>,
    last_endpoint: ArcSwapOption<SocketAddr>,
    pub stats: Stats,
    pub(crate) handshake: Mutex<HandshakePhase>,
    pub(crate) keypairs: Mutex<KeypairSet>,
    /// MAC1 bytes of the last handshake message we sent to this peer,
    /// kept around as the AEAD associated data needed to decrypt a
    /// CookieReply responding to it.
    pub(crate) last_mac1: Mutex<Option<rustyguard_crypto::Mac>>,
    /// Cookie value learned from the most recent CookieReply, consumed by
    /// the send path on the next handshake retry.
    pub(crate) pending_cookie: Mutex<Option<rustyguard_types::Cookie>>,
    next_local_index: AtomicU32,
    device: Weak<DeviceInner>,
}

impl Peer {
    pub(crate) fn new(
        id: u64,
        public_key: PublicKey,
        preshared_key: Option<rustyguard_crypto::Key>,
        allowed_ips: Vec<IpNet>,
        endpoint: Option<SocketAddr>,
        device: Weak<DeviceInner>,
    ) -> Self {
        Self {
            id,
            config: StaticPeerConfig::new(public_key, preshared_key),
            allowed_ips,
            last_endpoint: ArcSwapOption::from_pointee(endpoint),
            stats: Stats::default(),
            handshake: Mutex::new(HandshakePhase::Idle),
            keypairs: Mutex::new(KeypairSet::default()),
            last_mac1: Mutex::new(None),
            pending_cookie: Mutex::new(None),
            next_local_index: AtomicU32::new(1),
            device,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn public_key(&self) -> PublicKey {
        self.config.key
    }

    pub fn allowed_ips(&self) -> &[IpNet] {
        &self.allowed_ips
    }

    pub fn last_endpoint(&self) -> Option<SocketAddr> {
        *self.last_endpoint.load_full()
    }

    pub fn set_last_endpoint(&self, addr: SocketAddr) {
        self.last_endpoint.store(Some(Arc::new(addr)));
    }

    /// A fresh local sender index for a handshake message or keypair this
    /// peer is about to originate. Monotonic per-peer; collision with
    /// another peer's index is resolved by the device-wide index table
    /// (see `Device::register_local_index`).
    pub(crate) fn next_local_index(&self) -> u32 {
        self.next_local_index.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn device(&self) -> Option<Arc<DeviceInner>> {
        self.device.upgrade()
    }

    /// `send_queue_flush`: no outbound queue is owned by this crate (the
    /// send path is an external collaborator per the data model), so this
    /// is the single call site documenting where an embedder's queued
    /// plaintext would be drained once a session becomes usable.
    pub(crate) fn flush_send_queue(&self) {
        tracing::trace!(peer = self.id, "send queue flushed");
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for Peer {}

#[cfg(test)]
mod tests {
    use super::*;
    use rustyguard_crypto::{DecryptionKey, EncryptionKey};

    fn dummy_keypair(local: u32, remote: u32) -> Keypair {
        Keypair {
            send: EncryptionKey::from_bytes([0u8; 32].into()),
            recv: DecryptionKey::from_bytes([0u8; 32].into()),
            local_index: local,
            remote_index: remote,
            send_counter: AtomicU64::new(0),
            established_at: Tai64N::UNIX_EPOCH,
        }
    }

    #[test]
    fn initiator_install_retires_current_to_previous() {
        let mut ks = KeypairSet::default();
        ks.install_as_current(dummy_keypair(1, 1));
        ks.install_as_current(dummy_keypair(2, 2));
        assert_eq!(ks.current.as_ref().unwrap().local_index, 2);
        assert_eq!(ks.previous.as_ref().unwrap().local_index, 1);
    }

    #[test]
    fn expire_older_than_clears_only_stale_slots() {
        let mut ks = KeypairSet::default();
        let old = Keypair {
            established_at: Tai64N::UNIX_EPOCH,
            ..dummy_keypair(1, 1)
        };
        ks.install_as_current(old);
        let now = Tai64N::now();
        ks.install_as_current(Keypair {
            established_at: now,
            ..dummy_keypair(2, 2)
        });

        // `current` (index 2) was just established; `previous` (index 1,
        // UNIX_EPOCH) is ancient — only the latter should be cleared.
        ks.expire_older_than(now, std::time::Duration::from_secs(180));
        assert!(ks.current.is_some());
        assert!(ks.previous.is_none());
    }

    #[test]
    fn next_key_promotes_on_first_use() {
        let mut ks = KeypairSet::default();
        ks.install_as_next(dummy_keypair(5, 5));
        let (kp, was_next) = ks.find_decrypt(5).unwrap();
        assert!(was_next);
        assert_eq!(kp.local_index, 5);
        ks.promote_next_to_current();
        assert_eq!(ks.current.as_ref().unwrap().local_index, 5);
        assert!(ks.next.is_none());
    }
}
