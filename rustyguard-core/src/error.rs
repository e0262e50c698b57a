use std::net::SocketAddr;

/// Everything the receive path can reject a datagram for. Every variant
/// here is either silently dropped (with a rate-limited debug log) or, for
/// [`Error::InternalInvariant`], indicates a programming bug rather than
/// adversarial input.
#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone, Copy)]
pub enum Error {
    #[error("malformed outer frame")]
    InvalidFrame,
    #[error("mac1/mac2 check failed")]
    InvalidMac,
    #[error("handshake consumer rejected the message")]
    InvalidHandshake,
    #[error("handshake admission queue is full")]
    QueueOverflow,
    #[error("aead decryption failed")]
    DecryptionFailed,
    #[error("inner source address is not delegated to this peer")]
    RoutingViolation,
    #[error("upper network stack dropped the packet")]
    DeliveryDropped,
    #[error("a non-handshake message reached the handshake worker")]
    InternalInvariant,
}

/// Rate-limited debug logging for per-datagram drops, keyed by source
/// address so one noisy peer cannot drown out everything else. One gate
/// per address, reclaimed lazily; see [`SourceRateLimiter`].
pub(crate) struct SourceRateLimiter {
    gates: parking_lot::Mutex<std::collections::HashMap<SocketAddr, rustyguard_utils::AtomicIntervalGate>>,
    interval_millis: i64,
}

impl SourceRateLimiter {
    pub(crate) fn new(interval_millis: i64) -> Self {
        Self {
            gates: parking_lot::Mutex::new(std::collections::HashMap::new()),
            interval_millis,
        }
    }

    /// Returns `true` at most once per `interval_millis` for a given
    /// source address. Callers should skip logging (but still drop) when
    /// this returns `false`.
    pub(crate) fn allow(&self, addr: SocketAddr, now_millis: i64) -> bool {
        let mut gates = self.gates.lock();
        let gate = gates
            .entry(addr)
            .or_insert_with(|| rustyguard_utils::AtomicIntervalGate::new(self.interval_millis));
        gate.gate(now_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limiter_gates_per_address() {
        let rl = SourceRateLimiter::new(1000);
        let a: SocketAddr = "10.0.0.1:1".parse().unwrap();
        let b: SocketAddr = "10.0.0.2:1".parse().unwrap();
        assert!(rl.allow(a, 0));
        assert!(!rl.allow(a, 500));
        assert!(rl.allow(b, 500));
    }
}
