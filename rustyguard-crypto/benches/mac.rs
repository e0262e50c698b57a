use rand_core::OsRng;
use rustyguard_crypto::{HasMac, StaticInitiatorConfig, StaticPeerConfig};
use x25519_dalek::StaticSecret;

fn main() {
    divan::main();
}

#[divan::bench]
fn mac1_verify(bencher: divan::Bencher) {
    let sk = StaticSecret::random_from_rng(OsRng);
    let cfg = StaticInitiatorConfig::new(sk);
    let peer = StaticPeerConfig::new(cfg.public_key, None);

    let esk = StaticSecret::random_from_rng(OsRng);
    let mut hs = rustyguard_crypto::HandshakeState::default();
    let init = rustyguard_crypto::encrypt_handshake_init(
        &mut hs,
        &cfg,
        &peer,
        &esk,
        tai64::Tai64N::UNIX_EPOCH,
        0,
        None,
    );

    bencher.bench_local(|| init.verify_mac1(&peer.mac1_key));
}
