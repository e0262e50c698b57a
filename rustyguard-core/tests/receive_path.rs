//! End-to-end scenarios against a fully constructed `Device`, covering the
//! cases the unit tests embedded in `worker.rs`/`data.rs`/`frame.rs` don't
//! already exercise in isolation.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use rand_core::OsRng;
use rustyguard_core::{Config, DeliveryResult, Device, NetworkStack, PeerConfig};
use rustyguard_crypto::HasMac;
use rustyguard_types::{EncryptedEmpty, HandshakeResp, Tag, MSG_SECOND};
use x25519_dalek::{PublicKey, StaticSecret};
use zerocopy::{little_endian, AsBytes};

struct NullStack;
impl NetworkStack for NullStack {
    fn deliver(&self, _payload: Bytes) -> DeliveryResult {
        DeliveryResult::Delivered
    }
    fn send_handshake_datagram(&self, _dest: SocketAddr, _payload: Bytes) {}
}

fn addr(port: u16) -> SocketAddr {
    SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port)
}

/// Scenario 1: a raw L3 frame whose UDP length field is shorter than a UDP
/// header is dropped before anything is enqueued; the device-wide
/// pre-peer drop counter is the only thing that moves.
#[test]
fn malformed_udp_length_is_dropped_before_enqueue() {
    let device = Device::new(
        Config {
            private_key: StaticSecret::random_from_rng(OsRng),
            peers: vec![],
        },
        Arc::new(NullStack),
    );

    let mut frame = vec![0u8; 20 + 8 + 4];
    frame[0] = 0x45; // IPv4, IHL 5
    frame[20 + 4..20 + 6].copy_from_slice(&7u16.to_be_bytes()); // UDP len = 7 < 8

    device.recv_raw_frame(addr(1), &frame);

    assert_eq!(device.stats().rx_dropped, 1);
}

/// Scenario 4: a well-formed (MAC1-valid) handshake response naming a
/// receiver index nobody registered is dropped without touching any peer
/// state.
#[test]
fn handshake_response_with_unknown_receiver_is_dropped() {
    let r_sk = StaticSecret::random_from_rng(OsRng);
    let r_pk = PublicKey::from(&r_sk);

    let responder = Device::new(
        Config {
            private_key: r_sk,
            peers: vec![],
        },
        Arc::new(NullStack),
    );

    let mac1_key = rustyguard_crypto::mac1_key(&r_pk);
    let mut resp = HandshakeResp {
        _type: little_endian::U32::new(MSG_SECOND),
        sender: little_endian::U32::new(1),
        receiver: little_endian::U32::new(0xDEAD_BEEF),
        ephemeral_key: [7u8; 32],
        empty: EncryptedEmpty {
            msg: [],
            tag: Tag([0u8; 16]),
        },
        mac1: [0u8; 16],
        mac2: [0u8; 16],
    };
    resp.mac1 = resp.compute_mac1(&mac1_key);

    responder.recv_message(addr(2), resp.as_bytes());

    assert_eq!(responder.stats().rx_dropped, 1);
}

/// Invariant 8: replaying an identical, validly-signed handshake
/// initiation twice resolves to the same peer both times and never
/// panics or corrupts peer bookkeeping — `KeypairSet::install_as_next`'s
/// single-slot overwrite means there is structurally never more than one
/// pending responder session for a peer at a time.
#[test]
fn replayed_handshake_initiation_resolves_idempotently() {
    let r_sk = StaticSecret::random_from_rng(OsRng);
    let r_pk = PublicKey::from(&r_sk);
    let i_sk = StaticSecret::random_from_rng(OsRng);
    let i_pk = PublicKey::from(&i_sk);

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
        Arc::new(NullStack),
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
    let bytes = init.as_bytes();

    responder.recv_message(addr(3), bytes);
    responder.recv_message(addr(3), bytes);

    let r_peer = responder.peer(&i_pk).unwrap();
    assert_eq!(r_peer.stats.snapshot().rx_packets, 2);
}
