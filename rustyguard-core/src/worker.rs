//! The handshake worker (4.D): drains the admission queue in bursts,
//! applies the cookie decision matrix, and drives the per-peer handshake
//! state machine. Runs on the device's bounded work queue — one logical
//! instance at a time, cooperatively yielding after a burst.

use std::ops::ControlFlow;

use rustyguard_types::{CookieMessage, HandshakeInit, HandshakeResp};
use zerocopy::{AsBytes, FromBytes};

use crate::buf::DatagramBuf;
use crate::device::DeviceInner;
use crate::frame::{self, MessageKind};
use crate::hsqueue::MAX_BURST_HANDSHAKES;

/// Drain up to `MAX_BURST_HANDSHAKES` datagrams and process each. If work
/// remains, the queue has already re-signalled (see
/// [`crate::hsqueue::HandshakeQueue::drain_burst`]); this function simply
/// loops until a drain comes back empty, matching "re-signals itself and
/// returns" without needing an actual executor hop.
pub(crate) fn run_burst(inner: &DeviceInner) {
    loop {
        let (len_before, batch) = inner.hsqueue.drain_burst(MAX_BURST_HANDSHAKES);
        if batch.is_empty() {
            return;
        }
        let under_load = inner.hsqueue.is_at_or_above(len_before);
        for buf in batch {
            process_one(inner, buf, under_load);
        }
    }
}

fn process_one(inner: &DeviceInner, mut buf: DatagramBuf, under_load: bool) {
    let Some(src) = buf.source() else {
        inner.rate_limiter_log(None, "handshake datagram missing source address");
        return;
    };

    let kind = frame::classify(buf.as_slice());
    debug_assert!(
        kind.is_handshake(),
        "non-handshake message reached the handshake worker"
    );
    if !kind.is_handshake() {
        tracing::error!("internal invariant violated: data message in handshake queue");
        return;
    }

    if kind == MessageKind::CookieReply {
        let Some(mut msg) = CookieMessage::read_from(buf.as_slice()) else {
            inner.rate_limiter_log(Some(src), "malformed cookie reply");
            return;
        };
        inner.consume_cookie_reply(&mut msg);
        return;
    }

    match kind {
        MessageKind::InitHandshake => process_init(inner, &mut buf, src, under_load),
        MessageKind::RespHandshake => process_resp(inner, &mut buf, src, under_load),
        _ => unreachable!("classified and filtered above"),
    }
}

fn process_init(inner: &DeviceInner, buf: &mut DatagramBuf, src: std::net::SocketAddr, under_load: bool) {
    let Some(mut init) = HandshakeInit::read_from(buf.as_slice()) else {
        inner.rate_limiter_log(Some(src), "malformed handshake initiation");
        return;
    };

    let verdict = match inner.verify_mac(&init, under_load, src) {
        Ok(v) => v,
        Err(_) => {
            inner.rate_limiter_log(Some(src), "invalid mac on handshake initiation");
            return;
        }
    };

    let ControlFlow::Continue(_) = verdict else {
        let ControlFlow::Break(cookie) = verdict else {
            unreachable!()
        };
        // needs_cookie: emit a challenge, no state transition.
        let reply = inner.new_cookie_reply(init.sender, &init.mac1, cookie);
        emit_cookie_reply(inner, reply, src);
        return;
    };

    let Some((peer, resp)) = inner.consume_handshake_initiation(&mut init) else {
        inner.rate_limiter_log(Some(src), "invalid handshake initiation");
        return;
    };

    peer.set_last_endpoint(src);
    emit_handshake_response(inner, resp, src);

    post_accept(inner, &peer, buf);
}

fn process_resp(inner: &DeviceInner, buf: &mut DatagramBuf, src: std::net::SocketAddr, under_load: bool) {
    let Some(mut resp) = HandshakeResp::read_from(buf.as_slice()) else {
        inner.rate_limiter_log(Some(src), "malformed handshake response");
        return;
    };

    let verdict = match inner.verify_mac(&resp, under_load, src) {
        Ok(v) => v,
        Err(_) => {
            inner.rate_limiter_log(Some(src), "invalid mac on handshake response");
            return;
        }
    };

    let ControlFlow::Continue(_) = verdict else {
        let ControlFlow::Break(cookie) = verdict else {
            unreachable!()
        };
        let reply = inner.new_cookie_reply(resp.sender, &resp.mac1, cookie);
        emit_cookie_reply(inner, reply, src);
        return;
    };

    let Some(peer) = inner.consume_handshake_response(&mut resp) else {
        inner.rate_limiter_log(Some(src), "invalid handshake response");
        return;
    };

    inner.timers.ephemeral_key_created(&peer);
    inner.timers.handshake_complete(&peer);
    // `begin_session` succeeded (keys are installed as `current` for the
    // initiator role): flush whatever plaintext was waiting on the
    // handshake to complete.
    peer.flush_send_queue();

    peer.set_last_endpoint(src);
    post_accept(inner, &peer, buf);
}

fn post_accept(inner: &DeviceInner, peer: &std::sync::Arc<crate::peer::Peer>, buf: &DatagramBuf) {
    peer.stats.add_rx(buf.len() as u64);
    inner.timers.any_authorized_packet_received(peer);
}

/// `send_handshake_response`: hands the built datagram to the embedder's
/// [`crate::device::NetworkStack::send_handshake_datagram`] — the
/// network-facing counterpart of `deliver`, since the core has no socket
/// of its own.
fn emit_handshake_response(inner: &DeviceInner, resp: HandshakeResp, dest: std::net::SocketAddr) {
    tracing::trace!(%dest, "handshake response ready to send");
    inner.send_handshake_datagram(dest, bytes::Bytes::copy_from_slice(resp.as_bytes()));
}

fn emit_cookie_reply(inner: &DeviceInner, reply: CookieMessage, dest: std::net::SocketAddr) {
    tracing::trace!(%dest, "cookie reply ready to send");
    inner.send_handshake_datagram(dest, bytes::Bytes::copy_from_slice(reply.as_bytes()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Config, Device, DeliveryResult, PeerConfig};
    use crate::timers::test_support::RecordingTimers;
    use rand_core::OsRng;
    use std::net::{Ipv4Addr, SocketAddr};
    use std::sync::Arc;
    use x25519_dalek::{PublicKey, StaticSecret};

    struct NullStack;
    impl crate::device::NetworkStack for NullStack {
        fn deliver(&self, _payload: bytes::Bytes) -> DeliveryResult {
            DeliveryResult::Delivered
        }
        fn send_handshake_datagram(&self, _dest: std::net::SocketAddr, _payload: bytes::Bytes) {}
    }

    /// Records every handshake-layer datagram the device hands back, so
    /// tests can assert on what was actually emitted instead of just on
    /// peer-state side effects.
    #[derive(Default)]
    struct RecordingStack {
        sent: parking_lot::Mutex<Vec<(SocketAddr, bytes::Bytes)>>,
    }
    impl crate::device::NetworkStack for RecordingStack {
        fn deliver(&self, _payload: bytes::Bytes) -> DeliveryResult {
            DeliveryResult::Delivered
        }
        fn send_handshake_datagram(&self, dest: SocketAddr, payload: bytes::Bytes) {
            self.sent.lock().push((dest, payload));
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port)
    }

    #[test]
    fn init_not_under_load_emits_response_and_updates_stats() {
        let r_sk = StaticSecret::random_from_rng(OsRng);
        let r_pk = PublicKey::from(&r_sk);
        let i_sk = StaticSecret::random_from_rng(OsRng);
        let i_pk = PublicKey::from(&i_sk);

        let timers = Arc::new(RecordingTimers::default());
        let stack = Arc::new(RecordingStack::default());
        let responder = Device::with_timers(
            Config {
                private_key: r_sk,
                peers: vec![PeerConfig {
                    public_key: i_pk,
                    preshared_key: None,
                    allowed_ips: vec![],
                    endpoint: None,
                }],
            },
            stack.clone(),
            timers.clone(),
        );

        let initiator = Device::new(
            Config {
                private_key: i_sk,
                peers: vec![PeerConfig {
                    public_key: r_pk,
                    preshared_key: None,
                    allowed_ips: vec![],
                    endpoint: Some(addr(51820)),
                }],
            },
            Arc::new(NullStack),
        );
        let i_peer = initiator.peer(&r_pk).unwrap();
        let (init, _dest) = initiator.initiate_handshake(&i_peer).unwrap();

        responder.recv_message(addr(4000), init.as_bytes());

        let r_peer = responder.peer(&i_pk).unwrap();
        let stats = r_peer.stats.snapshot();
        assert_eq!(stats.rx_packets, 1);
        assert_eq!(stats.rx_bytes, rustyguard_types::HANDSHAKE_INIT_SZ as u64);
        assert_eq!(timers.authorized.load(std::sync::atomic::Ordering::Relaxed), 1);

        let sent = stack.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, addr(4000));
        assert_eq!(frame::classify(&sent[0].1), MessageKind::RespHandshake);
    }

    #[test]
    fn under_load_without_cookie_emits_cookie_reply_not_response() {
        let r_sk = StaticSecret::random_from_rng(OsRng);
        let r_pk = PublicKey::from(&r_sk);
        let i_sk = StaticSecret::random_from_rng(OsRng);
        let i_pk = PublicKey::from(&i_sk);

        let stack = Arc::new(RecordingStack::default());
        let responder = Device::new(
            Config {
                private_key: r_sk,
                peers: vec![PeerConfig {
                    public_key: i_pk,
                    preshared_key: None,
                    allowed_ips: vec![],
                    endpoint: None,
                }],
            },
            stack.clone(),
        );

        let initiator = Device::new(
            Config {
                private_key: i_sk,
                peers: vec![PeerConfig {
                    public_key: r_pk,
                    preshared_key: None,
                    allowed_ips: vec![],
                    endpoint: Some(addr(51820)),
                }],
            },
            Arc::new(NullStack),
        );
        let i_peer = initiator.peer(&r_pk).unwrap();
        let (init, _dest) = initiator.initiate_handshake(&i_peer).unwrap();

        // Drive a single datagram through the worker with `under_load`
        // forced true and no cookie attached, instead of flooding the
        // real queue: `under_load` is recomputed fresh on every burst, so
        // simulating the flood would require keeping the queue at least
        // half full for every single drain, which this decision-matrix
        // check doesn't need to exercise.
        process_one(
            &responder.inner,
            crate::buf::DatagramBuf::from_vec(init.as_bytes().to_vec(), Some(addr(4001))),
            true,
        );

        // No state transition should have happened for the cookie-starved
        // replay; the peer's handshake phase stays Idle.
        let r_peer = responder.peer(&i_pk).unwrap();
        assert!(r_peer.handshake.lock().is_idle());

        // A cookie reply, and nothing else, was actually handed to the
        // network stack.
        let sent = stack.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, addr(4001));
        assert_eq!(frame::classify(&sent[0].1), MessageKind::CookieReply);
    }
}
