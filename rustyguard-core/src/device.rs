use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;
use bytes::Bytes;
use ipnet::IpNet;
use parking_lot::{Mutex, RwLock};
use rand_core::{OsRng, RngCore};
use rustyguard_crypto::{CookieState, HasMac, StaticInitiatorConfig};
use rustyguard_types::{CookieMessage, DataHeader, HandshakeInit, HandshakeResp, Tag, MSG_COOKIE_REPLY, MSG_DATA};
use rustyguard_utils::KeyedHasher;
use tai64::Tai64N;
use x25519_dalek::{PublicKey, StaticSecret};
use zerocopy::little_endian;

use crate::buf::DatagramBuf;
use crate::error::{Error, SourceRateLimiter};
use crate::frame::{self, MessageKind};
use crate::hsqueue::HandshakeQueue;
use crate::peer::{HandshakePhase, InitiationState, Keypair, Peer};
use crate::routing::RoutingTable;
use crate::stats::Stats;
use crate::timers::{DeviceTimers, Timers};
use crate::worker;

/// A delivered, decrypted inner packet, or a report that delivery failed
/// — the return type of [`NetworkStack::deliver`].
pub enum DeliveryResult {
    Delivered,
    Dropped,
}

/// The embedder's local network stack (a TUN device, typically). The
/// receive path only ever calls `deliver`; it never reads from or
/// otherwise owns the stack.
pub trait NetworkStack: Send + Sync {
    fn deliver(&self, payload: Bytes) -> DeliveryResult;

    /// Hand a handshake-layer datagram (a `RespHandshake` or a
    /// `CookieReply`) to the embedder's socket. The core owns no socket of
    /// its own, so this is the send-path counterpart to `deliver` for the
    /// one class of outbound traffic the receive path originates itself,
    /// rather than in response to outbound user data (see
    /// [`Device::send_message`] for that path).
    fn send_handshake_datagram(&self, dest: SocketAddr, payload: Bytes);
}

/// Static device identity and initial peer list, mirroring the shape of
/// the teacher's own `Config`/`examples/tun.rs` peer list.
pub struct Config {
    pub private_key: StaticSecret,
    pub peers: Vec<PeerConfig>,
}

pub struct PeerConfig {
    pub public_key: PublicKey,
    pub preshared_key: Option<rustyguard_crypto::Key>,
    pub allowed_ips: Vec<IpNet>,
    pub endpoint: Option<SocketAddr>,
}

/// Holds the device's cookie MAC2 secret, rotated on a timer; current and
/// previous live behind `ArcSwap` so validation during rotation never
/// blocks (per the concurrency model's seqlock-like requirement).
struct CookieChecker {
    current: ArcSwap<CookieState>,
    previous: ArcSwap<CookieState>,
    last_rotation: Mutex<std::time::Instant>,
}

impl CookieChecker {
    fn new() -> Self {
        let mut state = CookieState::default();
        state.generate(&mut OsRng);
        Self {
            current: ArcSwap::new(Arc::new(state)),
            previous: ArcSwap::new(Arc::new(CookieState::default())),
            last_rotation: Mutex::new(std::time::Instant::now()),
        }
    }

    fn rotate(&self) {
        let mut next = CookieState::default();
        next.generate(&mut OsRng);
        let old_current = self.current.swap(Arc::new(next));
        self.previous.store(old_current);
    }

    /// Called on every maintenance tick; only actually rotates once
    /// `COOKIE_REFRESH` has elapsed, so an embedder ticking faster than
    /// that (e.g. once a second, as `examples/tun.rs` does) doesn't churn
    /// the secret on every tick.
    fn maybe_rotate(&self) {
        let mut last = self.last_rotation.lock();
        if last.elapsed() >= crate::timers::COOKIE_REFRESH {
            self.rotate();
            *last = std::time::Instant::now();
        }
    }
}

pub(crate) struct DeviceInner {
    pub(crate) identity: StaticInitiatorConfig,
    peers_by_pubkey: RwLock<HashMap<PublicKey, Arc<Peer>, KeyedHasher>>,
    index_table: RwLock<HashMap<u32, Arc<Peer>, KeyedHasher>>,
    pub(crate) hsqueue: HandshakeQueue,
    cookies: CookieChecker,
    pub(crate) routing: RoutingTable,
    pub(crate) stats: Stats,
    rate_limiter: SourceRateLimiter,
    pub(crate) timers: Arc<dyn Timers>,
    network_stack: Arc<dyn NetworkStack>,
    next_peer_id: AtomicU64,
    self_ref: std::sync::OnceLock<Weak<DeviceInner>>,
}

/// The device: owns the peer table, the handshake admission queue, and
/// the cookie/rotation state. `Peer`s hold a non-owning `Weak` back to
/// this so the `Peer`→`Device`→peer-table cycle never leaks.
pub struct Device {
    pub(crate) inner: Arc<DeviceInner>,
}

impl Device {
    pub fn new(config: Config, network_stack: Arc<dyn NetworkStack>) -> Self {
        Self::with_timers(config, network_stack, Arc::new(DeviceTimers))
    }

    pub fn with_timers(
        config: Config,
        network_stack: Arc<dyn NetworkStack>,
        timers: Arc<dyn Timers>,
    ) -> Self {
        let identity = StaticInitiatorConfig::new(config.private_key);
        let inner = Arc::new(DeviceInner {
            identity,
            peers_by_pubkey: RwLock::new(HashMap::default()),
            index_table: RwLock::new(HashMap::default()),
            hsqueue: HandshakeQueue::new(crate::hsqueue::MAX_QUEUED_HANDSHAKES),
            cookies: CookieChecker::new(),
            routing: RoutingTable::default(),
            stats: Stats::default(),
            rate_limiter: SourceRateLimiter::new(1000),
            timers,
            network_stack,
            next_peer_id: AtomicU64::new(1),
            self_ref: std::sync::OnceLock::new(),
        });
        let _ = inner.self_ref.set(Arc::downgrade(&inner));

        let device = Self { inner };
        for peer in config.peers {
            device.add_peer(peer);
        }
        device
    }

    fn weak(&self) -> Weak<DeviceInner> {
        self.inner.self_ref.get().cloned().unwrap_or_default()
    }

    pub fn add_peer(&self, cfg: PeerConfig) -> Arc<Peer> {
        let id = self.inner.next_peer_id.fetch_add(1, Ordering::Relaxed);
        let peer = Arc::new(Peer::new(
            id,
            cfg.public_key,
            cfg.preshared_key,
            cfg.allowed_ips.clone(),
            cfg.endpoint,
            self.weak(),
        ));

        self.inner.routing.insert(&cfg.allowed_ips, peer.clone());
        self.inner
            .peers_by_pubkey
            .write()
            .insert(cfg.public_key, peer.clone());
        peer
    }

    pub fn remove_peer(&self, public_key: &PublicKey) {
        let removed = self.inner.peers_by_pubkey.write().remove(public_key);
        if let Some(peer) = removed {
            self.inner.routing.remove_peer(&peer);
            self.inner
                .index_table
                .write()
                .retain(|_, p| p.id() != peer.id());
        }
    }

    pub fn peer(&self, public_key: &PublicKey) -> Option<Arc<Peer>> {
        self.inner.peers_by_pubkey.read().get(public_key).cloned()
    }

    pub fn stats(&self) -> crate::stats::StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Send-path counterpart to the data post-processor's cryptokey
    /// routing check (4.E step 6): which peer is delegated the given
    /// destination address, so the caller knows where to route an
    /// outbound inner packet before calling [`Device::send_message`].
    pub fn peer_for_destination(&self, addr: IpAddr) -> Option<Arc<Peer>> {
        self.inner.routing.lookup_src(addr)
    }

    /// Periodic device maintenance: cookie secret rotation and
    /// stale-session expiry. Intended to be driven by a
    /// `tokio::time::interval` in the embedder's event loop (see
    /// `rustyguard-tun`). Rotation is internally gated by
    /// [`crate::timers::COOKIE_REFRESH`], so calling `turn` faster than
    /// that is harmless; expiry is a cheap per-peer comparison against
    /// [`crate::timers::SESSION_EXPIRY`] and is safe to run every tick.
    pub fn turn(&self) {
        self.inner.cookies.maybe_rotate();
        self.inner.expire_stale_sessions();
    }

    /// 4.F, for an embedder whose transport already demultiplexes UDP
    /// (i.e. almost everyone — `tokio::net::UdpSocket::recv_from` hands
    /// back the tunnel payload directly, with no outer IP/UDP framing to
    /// parse).
    pub fn recv_message(&self, src: SocketAddr, payload: &[u8]) {
        let kind = frame::classify(payload);
        self.dispatch(kind, DatagramBuf::from_vec(payload.to_vec(), Some(src)));
    }

    /// 4.F for an embedder receiving raw L3 frames (a kernel-bypass NIC or
    /// raw socket that hasn't stripped IP/UDP headers yet): runs the
    /// outer-frame parser (4.A) first.
    pub fn recv_raw_frame(&self, src: SocketAddr, frame_bytes: &[u8]) {
        let Ok((offset, len)) = frame::parse_outer_frame(frame_bytes) else {
            self.log_drop(Some(src), "invalid outer frame");
            return;
        };
        let payload = &frame_bytes[offset..offset + len];
        let kind = frame::classify(payload);
        self.dispatch(kind, DatagramBuf::from_vec(payload.to_vec(), Some(src)));
    }

    fn dispatch(&self, kind: MessageKind, mut buf: DatagramBuf) {
        match kind {
            MessageKind::Invalid => {
                self.log_drop(buf.source(), "unclassifiable message");
            }
            MessageKind::Data => {
                crate::data::submit(&self.inner, buf);
            }
            _ => {
                if self.inner.hsqueue.len() >= self.inner.hsqueue.capacity() {
                    self.log_drop(buf.source(), "handshake queue full");
                    return;
                }
                buf.linearize();
                if self.inner.hsqueue.enqueue(buf).is_err() {
                    tracing::debug!("handshake queue overflow");
                    return;
                }
                worker::run_burst(&self.inner);
            }
        }
    }

    fn log_drop(&self, src: Option<SocketAddr>, why: &'static str) {
        self.inner.rate_limiter_log(src, why);
    }

    /// Send-path: originate a handshake initiation addressed to `peer`.
    /// Returns the wire bytes and the destination address to send them
    /// to. Framing the outer UDP/IP envelope is the caller's
    /// responsibility (see module docs).
    pub fn initiate_handshake(&self, peer: &Arc<Peer>) -> Option<(HandshakeInit, SocketAddr)> {
        let dest = peer.last_endpoint()?;
        let esk = StaticSecret::random_from_rng(OsRng);
        let local_index = peer.next_local_index();
        let mut hs = rustyguard_crypto::HandshakeState::default();
        let cookie = peer.pending_cookie.lock().take();

        let init = rustyguard_crypto::encrypt_handshake_init(
            &mut hs,
            &self.inner.identity,
            &peer.config,
            &esk,
            Tai64N::now(),
            local_index,
            cookie.as_ref(),
        );
        *peer.last_mac1.lock() = Some(init.mac1);

        *peer.handshake.lock() = HandshakePhase::CreatedInitiation(Box::new(InitiationState {
            hs,
            esk,
            local_index,
        }));
        self.inner.register_index(local_index, peer.clone());

        Some((init, dest))
    }

    /// Send-path entry point for outbound plaintext, mirroring the
    /// teacher's `Sessions::send_message` contract in `examples/tun.rs`:
    /// an established session encrypts in place and hands back the wire
    /// header and detached tag for the caller to frame around `plaintext`;
    /// no session yet means the caller gets a handshake initiation to
    /// send instead, and must retry the data send once it completes.
    pub fn send_message(&self, peer: &Arc<Peer>, plaintext: &mut [u8]) -> Option<SendMessage> {
        let current = peer.keypairs.lock().current_send();
        match current {
            Some(kp) => {
                let dest = peer.last_endpoint()?;
                let counter = kp.send_counter.fetch_add(1, Ordering::Relaxed);
                let tag = rustyguard_crypto::encrypt_data(&kp.send, counter, plaintext).ok()?;
                peer.stats.add_tx(plaintext.len() as u64 + 16);
                Some(SendMessage::Data(
                    dest,
                    DataHeader {
                        _type: little_endian::U32::new(MSG_DATA),
                        receiver: little_endian::U32::new(kp.remote_index),
                        counter: little_endian::U64::new(counter),
                    },
                    tag,
                ))
            }
            None => {
                let (init, dest) = self.initiate_handshake(peer)?;
                Some(SendMessage::Maintenance(init, dest))
            }
        }
    }
}

/// Result of [`Device::send_message`]: either the caller's plaintext was
/// encrypted in place (frame `header || plaintext || tag` and send to the
/// address), or no session exists yet and a handshake must go out first.
pub enum SendMessage {
    Data(SocketAddr, DataHeader, Tag),
    Maintenance(HandshakeInit, SocketAddr),
}

impl DeviceInner {
    /// Rate-limited debug log plus the device-wide drop counter — the
    /// aggregate figure for datagrams that never reached a peer (malformed
    /// frames, unknown receiver indices, queue overflow), as distinct from
    /// the per-peer counters in [`crate::peer::Peer::stats`].
    pub(crate) fn rate_limiter_log(&self, src: Option<SocketAddr>, why: &'static str) {
        self.stats.inc_rx_dropped();
        if let Some(src) = src {
            let now = Tai64N::now().to_duration().as_millis() as i64;
            if self.rate_limiter.allow(src, now) {
                tracing::debug!(%src, why, "dropping datagram");
            }
        } else {
            tracing::debug!(why, "dropping datagram");
        }
    }

    pub(crate) fn peer_by_pubkey(&self, key: &PublicKey) -> Option<Arc<Peer>> {
        self.peers_by_pubkey.read().get(key).cloned()
    }

    pub(crate) fn peer_by_index(&self, index: u32) -> Option<Arc<Peer>> {
        self.index_table.read().get(&index).cloned()
    }

    pub(crate) fn register_index(&self, index: u32, peer: Arc<Peer>) {
        self.index_table.write().insert(index, peer);
    }

    pub(crate) fn deliver(&self, payload: Bytes) -> DeliveryResult {
        self.network_stack.deliver(payload)
    }

    pub(crate) fn send_handshake_datagram(&self, dest: SocketAddr, payload: Bytes) {
        self.network_stack.send_handshake_datagram(dest, payload);
    }

    /// Stale-session expiry: drop any keypair established more than
    /// [`crate::timers::SESSION_EXPIRY`] ago, across every configured peer,
    /// forcing a fresh handshake before traffic can resume under it.
    pub(crate) fn expire_stale_sessions(&self) {
        let now = Tai64N::now();
        for peer in self.peers_by_pubkey.read().values() {
            peer.keypairs.lock().expire_older_than(now, crate::timers::SESSION_EXPIRY);
        }
    }

    /// Verdict for an inbound handshake datagram's MAC1/MAC2, matching the
    /// collaborator interface `cookie_validate(buf, len, under_load)`. MAC1
    /// is checked unconditionally; MAC2 is only consulted when
    /// `under_load`, tried against the current cookie secret and then the
    /// previous one (so a sender holding a cookie minted just before a
    /// rotation isn't spuriously challenged again). A `Break` result
    /// carries the fresh cookie the worker should challenge the sender
    /// with (`needs_cookie` in the decision matrix); `Err` means MAC1
    /// itself was wrong, which no cookie secret can rescue.
    pub(crate) fn verify_mac<'m, T: HasMac>(
        &self,
        msg: &'m T,
        under_load: bool,
        src: SocketAddr,
    ) -> Result<ControlFlow<rustyguard_types::Cookie, &'m T>, Error> {
        msg.verify_mac1(&self.identity.mac1_key)
            .map_err(|_| Error::InvalidMac)?;

        if !under_load {
            return Ok(ControlFlow::Continue(msg));
        }

        let current = self.cookies.current.load();
        let fresh = current.new_cookie(src);
        if msg.verify_mac2(&fresh).is_ok() {
            return Ok(ControlFlow::Continue(msg));
        }

        let previous = self.cookies.previous.load();
        let stale = previous.new_cookie(src);
        if msg.verify_mac2(&stale).is_ok() {
            return Ok(ControlFlow::Continue(msg));
        }

        Ok(ControlFlow::Break(fresh))
    }

    pub(crate) fn new_cookie_reply(
        &self,
        sender_index: little_endian::U32,
        mac1: &rustyguard_crypto::Mac,
        cookie: rustyguard_types::Cookie,
    ) -> CookieMessage {
        let mut nonce = [0u8; 24];
        OsRng.fill_bytes(&mut nonce);
        let encrypted =
            rustyguard_crypto::encrypt_cookie(cookie, &self.identity.cookie_key, &nonce, &mac1[..]);
        CookieMessage {
            _type: little_endian::U32::new(MSG_COOKIE_REPLY),
            receiver: sender_index,
            nonce,
            cookie: encrypted,
        }
    }

    /// `cookie_consume`: update the sending peer's cached cookie from an
    /// inbound `CookieReply`, using the MAC1 bytes of whichever handshake
    /// message we last sent them as AAD.
    pub(crate) fn consume_cookie_reply(&self, msg: &mut CookieMessage) -> Option<()> {
        let peer = self.peer_by_index(msg.receiver.get())?;
        let mac1 = (*peer.last_mac1.lock())?;
        let decrypted =
            rustyguard_crypto::decrypt_cookie(&mut msg.cookie, &peer.config.cookie_key, &msg.nonce, &mac1[..])
                .ok()?;
        *peer.pending_cookie.lock() = Some(*decrypted);
        Some(())
    }

    /// `handshake_consume_initiation`: decrypt an inbound `InitHandshake`,
    /// identify the sending peer by its revealed static key, and build the
    /// response. Returns `None` for an unrecognized or malformed
    /// initiation (the worker logs "invalid initiation" and drops).
    pub(crate) fn consume_handshake_initiation(
        &self,
        init: &mut HandshakeInit,
    ) -> Option<(Arc<Peer>, HandshakeResp)> {
        let mut hs = rustyguard_crypto::HandshakeState::default();
        let decrypted = rustyguard_crypto::decrypt_handshake_init(init, &mut hs, &self.identity).ok()?;

        let peer = self.peer_by_pubkey(&decrypted.static_key())?;
        *peer.handshake.lock() = HandshakePhase::ConsumedInitiation;

        let esk_r = StaticSecret::random_from_rng(OsRng);
        let local_index = peer.next_local_index();
        let remote_index = decrypted.sender_index();
        let resp =
            rustyguard_crypto::encrypt_handshake_resp(&mut hs, decrypted, &esk_r, &peer.config, local_index, None);

        let (send, recv) = hs.split(false);
        peer.keypairs.lock().install_as_next(Keypair {
            send,
            recv,
            local_index,
            remote_index,
            send_counter: AtomicU64::new(0),
            established_at: Tai64N::now(),
        });
        *peer.handshake.lock() = HandshakePhase::CreatedResponse;
        self.register_index(local_index, peer.clone());

        Some((peer, resp))
    }

    /// `handshake_consume_response` + `handshake_begin_session`: decrypt an
    /// inbound `RespHandshake` against the matching in-flight initiation
    /// and, on success, promote the derived session to `current`.
    pub(crate) fn consume_handshake_response(&self, resp: &mut HandshakeResp) -> Option<Arc<Peer>> {
        let peer = self.peer_by_index(resp.receiver.get())?;

        let mut phase = peer.handshake.lock();
        let HandshakePhase::CreatedInitiation(ref mut state) = *phase else {
            return None;
        };

        rustyguard_crypto::decrypt_handshake_resp(resp, &mut state.hs, &self.identity, &peer.config, &state.esk)
            .ok()?;

        let local_index = state.local_index;
        let remote_index = resp.sender.get();
        let (send, recv) = state.hs.split(true);

        *phase = HandshakePhase::ConsumedResponse;
        drop(phase);

        peer.keypairs.lock().install_as_current(Keypair {
            send,
            recv,
            local_index,
            remote_index,
            send_counter: AtomicU64::new(0),
            established_at: Tai64N::now(),
        });
        *peer.handshake.lock() = HandshakePhase::Idle;

        Some(peer)
    }
}

pub(crate) mod test_support {
    use super::*;
    use std::net::Ipv4Addr;

    pub fn test_peer(id: u64) -> Arc<Peer> {
        let sk = StaticSecret::random_from_rng(OsRng);
        let pk = PublicKey::from(&sk);
        Arc::new(Peer::new(
            id,
            pk,
            None,
            vec![],
            Some(SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 51820)),
            Weak::new(),
        ))
    }
}
