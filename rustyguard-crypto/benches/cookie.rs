use rand_core::OsRng;
use rustyguard_crypto::CookieState;

fn main() {
    divan::main();
}

#[divan::bench]
fn new_cookie(bencher: divan::Bencher) {
    let mut state = CookieState::default();
    state.generate(&mut OsRng);
    let addr = "10.0.0.1:51820".parse().unwrap();

    bencher.bench_local(|| state.new_cookie(addr));
}
