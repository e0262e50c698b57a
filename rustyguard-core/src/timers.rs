use std::sync::Arc;
use std::time::Duration;

use crate::peer::Peer;

/// Notification hooks the worker (4.D) and data post-processor (4.E)
/// call into. Split out as a trait so tests can substitute a recording
/// fake instead of driving real wall-clock timers.
pub trait Timers: Send + Sync {
    fn any_authorized_packet_received(&self, peer: &Arc<Peer>);
    fn data_received(&self, peer: &Arc<Peer>);
    fn handshake_complete(&self, peer: &Arc<Peer>);
    fn ephemeral_key_created(&self, peer: &Arc<Peer>);
}

/// Cookie-secret rotation period. Matches the corpus's minute-scale
/// rotation for MAC2 secrets (short enough to bound replay of a captured
/// cookie, long enough that legitimate retries don't get a fresh
/// challenge every round trip).
pub const COOKIE_REFRESH: Duration = Duration::from_secs(120);

/// How long a derived transport keypair stays usable without a fresh
/// handshake. Matches the corpus's session-lifetime constant (WireGuard's
/// `REJECT_AFTER_TIME`): long enough that an idle-but-live peer doesn't
/// get needlessly re-handshaken, short enough to bound how long a
/// compromised session key stays valid.
pub const SESSION_EXPIRY: Duration = Duration::from_secs(180);

/// `tokio::time`-backed implementation used by `Device`. Authorized/data
/// events only bump `tracing` counters at debug verbosity — the actual
/// stats counters are updated directly by the caller (worker/data
/// post-processor) since they're hot-path atomics, not timer state.
#[derive(Default)]
pub struct DeviceTimers;

impl Timers for DeviceTimers {
    fn any_authorized_packet_received(&self, peer: &Arc<Peer>) {
        tracing::trace!(peer = peer.id(), "authorized packet received");
    }

    fn data_received(&self, peer: &Arc<Peer>) {
        tracing::trace!(peer = peer.id(), "data packet received");
    }

    fn handshake_complete(&self, peer: &Arc<Peer>) {
        tracing::debug!(peer = peer.id(), "handshake complete");
    }

    fn ephemeral_key_created(&self, peer: &Arc<Peer>) {
        tracing::debug!(peer = peer.id(), "ephemeral key created");
    }
}
