//! Receive-path demultiplexer for the tunnel: outer-frame parsing,
//! message classification, handshake admission control with cookie-based
//! DoS mitigation, the per-peer handshake state machine, and
//! post-decryption data-packet checks including cryptokey routing.
//!
//! The cryptographic transforms ([`rustyguard_crypto`]), wire layouts
//! ([`rustyguard_types`]), and small shared utilities
//! ([`rustyguard_utils`]) are consumed as collaborators; this crate owns
//! none of the actual socket I/O, which belongs to an embedder such as
//! `rustyguard-tun`.

mod buf;
mod data;
mod device;
mod error;
mod frame;
mod hsqueue;
mod peer;
mod routing;
mod stats;
mod timers;
mod worker;

pub use buf::DatagramBuf;
pub use device::{Config, DeliveryResult, Device, NetworkStack, PeerConfig, SendMessage};
pub use error::Error;
pub use frame::MessageKind;
pub use hsqueue::{MAX_BURST_HANDSHAKES, MAX_QUEUED_HANDSHAKES};
pub use peer::{HandshakePhase, Keypair, KeypairSet, Peer};
pub use stats::{Stats, StatsSnapshot};
pub use timers::{DeviceTimers, Timers, COOKIE_REFRESH};
