use rand_core::OsRng;
use rustyguard_crypto::{
    decrypt_handshake_init, encrypt_handshake_init, HandshakeState, StaticInitiatorConfig,
    StaticPeerConfig,
};
use x25519_dalek::StaticSecret;

fn main() {
    divan::main();
}

#[divan::bench]
fn initiation_roundtrip(bencher: divan::Bencher) {
    let i_sk = StaticSecret::random_from_rng(OsRng);
    let r_sk = StaticSecret::random_from_rng(OsRng);
    let i_cfg = StaticInitiatorConfig::new(i_sk);
    let r_cfg = StaticInitiatorConfig::new(r_sk);
    let r_as_peer = StaticPeerConfig::new(r_cfg.public_key, None);

    bencher.bench_local(|| {
        let esk = StaticSecret::random_from_rng(OsRng);
        let mut hs_i = HandshakeState::default();
        let mut init = encrypt_handshake_init(
            &mut hs_i,
            &i_cfg,
            &r_as_peer,
            &esk,
            tai64::Tai64N::UNIX_EPOCH,
            1,
            None,
        );

        let mut hs_r = HandshakeState::default();
        decrypt_handshake_init(&mut init, &mut hs_r, &r_cfg).ok();
    });
}
