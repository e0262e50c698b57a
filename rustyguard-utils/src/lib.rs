//! Small pieces shared between `rustyguard-core` and `rustyguard-crypto`
//! that don't belong in either: a fast keyed hasher for the peer table and
//! an atomic rate gate for noisy per-datagram logging.

use std::hash::{BuildHasher, Hasher};
use std::sync::atomic::{AtomicI64, Ordering};

/// `BuildHasher` for the peer table, keyed on process start so that an
/// attacker who can see public keys cannot predict hash bucket placement.
#[derive(Clone)]
pub struct KeyedHasher(ahash::RandomState);

impl Default for KeyedHasher {
    fn default() -> Self {
        Self(ahash::RandomState::with_seeds(
            rand_seed(),
            rand_seed(),
            rand_seed(),
            rand_seed(),
        ))
    }
}

impl BuildHasher for KeyedHasher {
    type Hasher = ahash::AHasher;

    fn build_hasher(&self) -> Self::Hasher {
        self.0.build_hasher()
    }
}

fn rand_seed() -> u64 {
    use rand_core::{OsRng, RngCore};
    OsRng.next_u64()
}

/// Boolean rate limiter with atomic (thread-safe) semantics: `gate` returns
/// `true` at most once per `interval_millis`, given a monotonically
/// increasing `now_millis`. Used to cap the volume of per-drop debug
/// logging under flood conditions without adding a lock to the hot path.
pub struct AtomicIntervalGate {
    interval_millis: i64,
    last: AtomicI64,
}

impl AtomicIntervalGate {
    pub const fn new(interval_millis: i64) -> Self {
        Self {
            interval_millis,
            last: AtomicI64::new(i64::MIN),
        }
    }

    pub fn gate(&self, now_millis: i64) -> bool {
        let last = self.last.load(Ordering::Acquire);
        if now_millis.saturating_sub(last) < self.interval_millis {
            false
        } else {
            self.last.store(now_millis, Ordering::Release);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_opens_once_per_interval() {
        let gate = AtomicIntervalGate::new(1000);
        assert!(gate.gate(0));
        assert!(!gate.gate(500));
        assert!(!gate.gate(999));
        assert!(gate.gate(1000));
        assert!(gate.gate(5000));
    }

    #[test]
    fn keyed_hasher_is_usable_in_a_map() {
        use std::collections::HashMap;
        let mut map: HashMap<u32, u32, KeyedHasher> = HashMap::default();
        map.insert(1, 2);
        assert_eq!(map.get(&1), Some(&2));
    }
}
