//! Reference client: wires a `tun` device and a UDP socket to
//! [`rustyguard_core::Device`]. Configuration is a small KDL file naming
//! the local interface and the peer list, read the same way the teacher's
//! own demo binary does it (`knuffel`).

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use rustyguard_core::{Config, DeliveryResult, Device, NetworkStack, PeerConfig, SendMessage};
use rustyguard_types::DataHeader;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use x25519_dalek::{PublicKey, StaticSecret};
use zerocopy::AsBytes;

const H: usize = std::mem::size_of::<DataHeader>();

/// Hands decrypted inner packets, and outbound handshake-layer datagrams,
/// to channels instead of writing the tun device or the UDP socket
/// directly: both `NetworkStack` methods run synchronously on whatever
/// task is driving `Device::recv_message`, but writing the tun device and
/// sending on the socket are both async, so each is bridged through its
/// own unbounded channel drained by the main select loop.
struct TunStack {
    tun_tx: mpsc::UnboundedSender<Bytes>,
    udp_tx: mpsc::UnboundedSender<(SocketAddr, Bytes)>,
}

impl NetworkStack for TunStack {
    fn deliver(&self, payload: Bytes) -> DeliveryResult {
        match self.tun_tx.send(payload) {
            Ok(()) => DeliveryResult::Delivered,
            Err(_) => DeliveryResult::Dropped,
        }
    }

    fn send_handshake_datagram(&self, dest: SocketAddr, payload: Bytes) {
        let _ = self.udp_tx.send((dest, payload));
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt::init();

    let args = TunConfig::parse();

    let config = Config {
        private_key: args.key(),
        peers: args.peers(),
    };

    let (tun_tx, mut tun_rx) = mpsc::unbounded_channel();
    let (udp_tx, mut udp_rx) = mpsc::unbounded_channel();
    let device = Arc::new(Device::new(config, Arc::new(TunStack { tun_tx, udp_tx })));

    let endpoint = UdpSocket::bind(&args.interface.host).await.unwrap();

    let mut tun_config = tun::Configuration::default();
    tun_config
        .address(args.interface.addr.addr())
        .netmask(args.interface.addr.netmask())
        .up();
    let mut dev = tun::create_as_async(&tun_config).unwrap();

    let mut recv_buf = vec![0u8; 2048];
    let mut tun_buf = vec![0u8; 2048];
    let mut tick = tokio::time::interval(std::time::Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = tick.tick() => {
                device.turn();
            }
            Some(payload) = tun_rx.recv() => {
                if let Err(err) = dev.write_all(&payload).await {
                    tracing::warn!(%err, "failed writing decrypted packet to tun device");
                }
            }
            Some((dest, payload)) = udp_rx.recv() => {
                if let Err(err) = endpoint.send_to(&payload, dest).await {
                    tracing::warn!(%err, %dest, "failed sending handshake datagram");
                }
            }
            res = endpoint.recv_from(&mut recv_buf) => {
                let Ok((n, addr)) = res else {
                    continue;
                };
                device.recv_message(addr, &recv_buf[..n]);
            }
            res = dev.read(&mut tun_buf[H..]) => {
                let Ok(n) = res else {
                    continue;
                };
                let Some(dest) = destination_of(&tun_buf[H..H + n]) else {
                    continue;
                };
                let Some(peer) = device.peer_for_destination(dest) else {
                    continue;
                };

                let pad_to = n.next_multiple_of(16);
                tun_buf[H + n..H + pad_to].fill(0);

                match device.send_message(&peer, &mut tun_buf[H..H + pad_to]) {
                    Some(SendMessage::Data(ep, header, tag)) => {
                        tun_buf[..H].copy_from_slice(header.as_bytes());
                        tun_buf[H + pad_to..H + pad_to + 16].copy_from_slice(&tag.0);
                        let _ = endpoint.send_to(&tun_buf[..H + pad_to + 16], ep).await;
                    }
                    Some(SendMessage::Maintenance(init, ep)) => {
                        let _ = endpoint.send_to(init.as_bytes(), ep).await;
                    }
                    None => {}
                }
            }
        }
    }
}

/// Destination address of an inner IPv4/IPv6 packet, read directly from
/// the header (no parsing crate needed for four bytes).
fn destination_of(packet: &[u8]) -> Option<IpAddr> {
    if packet.is_empty() {
        return None;
    }
    match packet[0] >> 4 {
        4 if packet.len() >= 20 => Some(IpAddr::V4(std::net::Ipv4Addr::new(
            packet[16], packet[17], packet[18], packet[19],
        ))),
        6 if packet.len() >= 40 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&packet[24..40]);
            Some(IpAddr::V6(std::net::Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

#[derive(knuffel::Decode)]
struct TunConfig {
    #[knuffel(child)]
    interface: TunInterface,

    #[knuffel(children(name = "peer"))]
    peers: Vec<PeerSection>,
}

#[derive(knuffel::Decode)]
struct TunInterface {
    #[knuffel(child, unwrap(argument, bytes))]
    key: Option<Vec<u8>>,

    #[knuffel(child, unwrap(argument))]
    host: String,

    #[knuffel(child, unwrap(argument, str))]
    addr: ipnet::Ipv4Net,
}

#[derive(knuffel::Decode)]
struct PeerSection {
    #[knuffel(child, unwrap(argument, bytes))]
    key: Vec<u8>,

    #[knuffel(children(name = "addr"), unwrap(argument, str))]
    addrs: Vec<ipnet::IpNet>,

    #[knuffel(child, unwrap(argument))]
    endpoint: Option<String>,
}

impl TunConfig {
    fn parse() -> Self {
        let path = std::env::args().nth(1).unwrap_or_else(|| "./rustyguard-tun.kdl".into());
        let config = std::fs::read_to_string(&path)
            .unwrap_or_else(|err| panic!("reading config {path}: {err}"));
        knuffel::parse(&path, &config).unwrap()
    }

    fn key(&self) -> StaticSecret {
        use base64ct::{Base64, Encoding};
        use rand_core::OsRng;

        match &self.interface.key {
            Some(key) => StaticSecret::from(<[u8; 32]>::try_from(&**key).unwrap()),
            None => {
                let private_key = StaticSecret::random_from_rng(OsRng);
                tracing::info!(
                    public_key = %Base64::encode_string(PublicKey::from(&private_key).as_bytes()),
                    "generated ephemeral interface key",
                );
                private_key
            }
        }
    }

    fn peers(&self) -> Vec<PeerConfig> {
        self.peers
            .iter()
            .map(|peer| PeerConfig {
                public_key: PublicKey::from(<[u8; 32]>::try_from(&*peer.key).unwrap()),
                preshared_key: None,
                allowed_ips: peer.addrs.clone(),
                endpoint: peer
                    .endpoint
                    .as_ref()
                    .and_then(|e| e.parse::<SocketAddr>().ok()),
            })
            .collect()
    }
}
