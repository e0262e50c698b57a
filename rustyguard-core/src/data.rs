//! Data-packet post-processor (4.E): the completion callback the
//! decryption pipeline invokes once a transport message has been
//! authenticated and decrypted in place. This crate treats the AEAD
//! decryption step itself as the one piece of the pipeline worth doing
//! locally (there is no separate async scheduler to hand it off to); the
//! rest — routing enforcement, delivery, bookkeeping — is exactly the
//! callback contract from the data model.

use std::net::IpAddr;
use std::sync::Arc;

use rustyguard_types::{DataHeader, Tag};
use zerocopy::FromBytes;

use crate::buf::DatagramBuf;
use crate::device::{DeliveryResult, DeviceInner};
use crate::peer::Peer;

/// Entry point from [`crate::device::Device::dispatch`] for `Data`
/// messages. Runs the decryption step, then the post-processing
/// callback described in 4.E. Every path frees `buf` and releases the
/// peer reference it acquired.
pub(crate) fn submit(inner: &DeviceInner, mut buf: DatagramBuf) {
    let Some(src) = buf.source() else {
        inner.rate_limiter_log(None, "data datagram missing source address");
        return;
    };

    let Ok(header_bytes) = buf.pull(16) else {
        inner.rate_limiter_log(Some(src), "short data header");
        return;
    };
    let Some(header) = DataHeader::read_from(header_bytes) else {
        inner.rate_limiter_log(Some(src), "malformed data header");
        return;
    };

    let Some(peer) = inner.peer_by_index(header.receiver.get()) else {
        // No peer: nothing was acquired, nothing to release.
        inner.rate_limiter_log(Some(src), "data packet for unknown receiver index");
        return;
    };

    let Some((kp, was_next)) = peer.keypairs.lock().find_decrypt(header.receiver.get()) else {
        inner.rate_limiter_log(Some(src), "no matching keypair for data packet");
        return;
    };

    buf.advance(16);
    let body = buf.as_mut_slice();
    if body.len() < 16 {
        inner.rate_limiter_log(Some(src), "data packet shorter than an AEAD tag");
        return;
    }
    let tag_offset = body.len() - 16;
    let (ciphertext, tag_bytes) = body.split_at_mut(tag_offset);
    let mut tag_arr = [0u8; 16];
    tag_arr.copy_from_slice(tag_bytes);
    let tag = Tag(tag_arr);

    if rustyguard_crypto::decrypt_data(&kp.recv, header.counter.get(), ciphertext, &tag).is_err() {
        // `err < 0` in the callback contract: free the buffer, release
        // the peer, no further bookkeeping.
        inner.rate_limiter_log(Some(src), "data packet failed to decrypt");
        return;
    }
    let plaintext_len = ciphertext.len();

    let used_new_key = was_next;
    if used_new_key {
        peer.keypairs.lock().promote_next_to_current();
    }

    post_process(inner, peer, buf, plaintext_len, used_new_key, src);
}

fn post_process(
    inner: &DeviceInner,
    peer: Arc<Peer>,
    mut buf: DatagramBuf,
    plaintext_len: usize,
    used_new_key: bool,
    source_addr: std::net::SocketAddr,
) {
    // Step 1: a first successful decryption under `next` confirms the
    // peer received our handshake response.
    if used_new_key {
        peer.flush_send_queue();
    }

    // Step 2: zero-length plaintext is a keepalive, nothing to deliver.
    if plaintext_len == 0 {
        inner.timers.data_received(&peer);
        common_tail(inner, &peer, source_addr);
        return;
    }

    // `buf` already has the 16-byte header stripped (done in `submit`
    // before decryption) and the ciphertext was decrypted in place, so
    // the inner packet occupies the first `plaintext_len` bytes; the
    // trailing 16 are the now-spent AEAD tag.
    buf.truncate(plaintext_len);
    let inner_packet = buf.as_slice();

    // Step 3: inner IP minimum length / pullable version byte.
    if inner_packet.len() < 20 {
        peer.stats.inc_rx_errors();
        peer.stats.inc_rx_length_errors();
        common_tail(inner, &peer, source_addr);
        return;
    }

    // Step 4: inner IP version and matching minimum length.
    let version = inner_packet[0] >> 4;
    let src_ip = match version {
        4 => IpAddr::V4(std::net::Ipv4Addr::new(
            inner_packet[12],
            inner_packet[13],
            inner_packet[14],
            inner_packet[15],
        )),
        6 => {
            if inner_packet.len() < 40 {
                peer.stats.inc_rx_errors();
                peer.stats.inc_rx_length_errors();
                common_tail(inner, &peer, source_addr);
                return;
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&inner_packet[8..24]);
            IpAddr::V6(std::net::Ipv6Addr::from(octets))
        }
        _ => {
            peer.stats.inc_rx_errors();
            peer.stats.inc_rx_length_errors();
            common_tail(inner, &peer, source_addr);
            return;
        }
    };

    // Step 5.
    inner.timers.data_received(&peer);

    // Step 6: cryptokey routing — the decrypted inner source address must
    // be delegated to the peer that just authenticated this packet.
    match inner.routing.lookup_src(src_ip) {
        Some(delegate) if delegate.id() == peer.id() => {}
        _ => {
            peer.stats.inc_rx_errors();
            peer.stats.inc_rx_frame_errors();
            common_tail(inner, &peer, source_addr);
            return;
        }
    }

    // Step 7: deliver upward.
    let payload = buf.freeze();
    match inner.deliver(payload) {
        DeliveryResult::Delivered => peer.stats.add_rx(plaintext_len as u64),
        DeliveryResult::Dropped => peer.stats.inc_rx_dropped(),
    }

    common_tail_peer_only(inner, &peer, source_addr);
}

/// Step 8, reached whenever the buffer has already been consumed (either
/// delivered or frozen-and-dropped above) and only bookkeeping remains.
fn common_tail_peer_only(inner: &DeviceInner, peer: &Arc<Peer>, source_addr: std::net::SocketAddr) {
    inner.timers.any_authorized_packet_received(peer);
    peer.set_last_endpoint(source_addr);
}

/// Step 8 for the early-return jumps that never reached delivery.
fn common_tail(inner: &DeviceInner, peer: &Arc<Peer>, source_addr: std::net::SocketAddr) {
    common_tail_peer_only(inner, peer, source_addr);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Config, Device};
    use crate::timers::test_support::RecordingTimers;
    use rand_core::OsRng;
    use rustyguard_crypto::HandshakeState;
    use std::net::{Ipv4Addr, SocketAddr};
    use std::sync::atomic::{AtomicU64, Ordering};
    use x25519_dalek::StaticSecret;

    struct NullStack;
    impl crate::device::NetworkStack for NullStack {
        fn deliver(&self, _payload: bytes::Bytes) -> DeliveryResult {
            DeliveryResult::Delivered
        }
        fn send_handshake_datagram(&self, _dest: std::net::SocketAddr, _payload: bytes::Bytes) {}
    }

    fn established_peer_pair() -> (Arc<Peer>, u32) {
        let peer = crate::device::test_support::test_peer(1);

        let mut hs = HandshakeState::default();
        let (send, recv) = hs.split(true);
        let local_index = 7;
        peer.keypairs.lock().install_as_current(crate::peer::Keypair {
            send,
            recv,
            local_index,
            remote_index: 9,
            send_counter: AtomicU64::new(0),
            established_at: tai64::Tai64N::UNIX_EPOCH,
        });
        (peer, local_index)
    }

    #[test]
    fn keepalive_skips_delivery_but_still_touches_timers() {
        let timers = Arc::new(RecordingTimers::default());
        let (peer, _local_index) = established_peer_pair();
        let inner = test_inner(timers.clone());

        post_process(
            &inner,
            peer,
            DatagramBuf::from_vec(vec![], Some(addr(1))),
            0,
            false,
            addr(1),
        );

        assert_eq!(timers.data.load(Ordering::Relaxed), 1);
        assert_eq!(timers.authorized.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn routing_violation_counts_frame_error_and_still_touches_timers() {
        let timers = Arc::new(RecordingTimers::default());
        let (peer, _local_index) = established_peer_pair();
        let inner = test_inner(timers.clone());
        // No routing delegation installed: any inner source IP is a
        // violation.
        let mut packet = vec![0u8; 20];
        packet[0] = 0x45; // IPv4, version 4
        packet[12..16].copy_from_slice(&[10, 0, 0, 9]);

        post_process(
            &inner,
            peer.clone(),
            DatagramBuf::from_vec(packet, Some(addr(1))),
            20,
            false,
            addr(1),
        );

        assert_eq!(peer.stats.snapshot().rx_errors, 1);
        assert_eq!(peer.stats.snapshot().rx_frame_errors, 1);
        assert_eq!(timers.authorized.load(Ordering::Relaxed), 1);
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port)
    }

    fn test_inner(timers: Arc<RecordingTimers>) -> Arc<DeviceInner> {
        let device = Device::with_timers(
            Config {
                private_key: StaticSecret::random_from_rng(OsRng),
                peers: vec![],
            },
            Arc::new(NullStack),
            timers,
        );
        device.inner.clone()
    }
}
