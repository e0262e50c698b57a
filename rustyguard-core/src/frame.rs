//! Outer UDP-over-IP envelope parsing and message-kind classification.
//!
//! This is the layer a raw-socket or kernel-bypass embedder calls before
//! handing a datagram to [`crate::device::Device`]; an embedder using an
//! ordinary `UdpSocket` (like `rustyguard-tun`) never sees this module —
//! the OS has already stripped the IP/UDP headers by the time `recv_from`
//! returns.

use rustyguard_types::{
    COOKIE_REPLY_SZ, DATA_MIN_SZ, HANDSHAKE_INIT_SZ, HANDSHAKE_RESP_SZ, MSG_COOKIE_REPLY, MSG_DATA,
    MSG_FIRST, MSG_SECOND,
};

use crate::error::Error;

/// One of the four classified message kinds, or `Invalid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    InitHandshake,
    RespHandshake,
    CookieReply,
    Data,
    Invalid,
}

impl MessageKind {
    /// Is this one of the three kinds routed through the handshake
    /// admission queue?
    pub fn is_handshake(self) -> bool {
        matches!(
            self,
            MessageKind::InitHandshake | MessageKind::RespHandshake | MessageKind::CookieReply
        )
    }
}

/// Validate the outer IP/UDP envelope and locate the tunnel payload.
/// Returns `(data_offset, data_len)` into `frame` on success.
pub fn parse_outer_frame(frame: &[u8]) -> Result<(usize, usize), Error> {
    if frame.len() < 20 {
        return Err(Error::InvalidFrame);
    }
    let version = frame[0] >> 4;
    let ip_header_len = match version {
        4 => ((frame[0] & 0x0f) as usize) * 4,
        6 => {
            if frame.len() < 40 {
                return Err(Error::InvalidFrame);
            }
            40
        }
        _ => return Err(Error::InvalidFrame),
    };
    if ip_header_len < 20 {
        return Err(Error::InvalidFrame);
    }

    let udp_offset = ip_header_len;
    let total_len = frame.len();
    if udp_offset + 8 > total_len {
        return Err(Error::InvalidFrame);
    }

    let udp_len = u16::from_be_bytes([frame[udp_offset + 4], frame[udp_offset + 5]]) as usize;
    if udp_len < 8 || udp_len > total_len - udp_offset {
        return Err(Error::InvalidFrame);
    }

    let data_offset = udp_offset + 8;
    let data_len = udp_len - 8;
    if frame.get(data_offset..data_offset + 4.min(data_len)).is_none() || data_len < 4 {
        return Err(Error::InvalidFrame);
    }

    Ok((data_offset, data_len))
}

/// Classify a tunnel payload (post outer-frame-parse, or the raw payload
/// from a `UdpSocket::recv_from`) by its first 4 bytes.
pub fn classify(payload: &[u8]) -> MessageKind {
    if payload.len() < 4 {
        return MessageKind::Invalid;
    }
    let ty = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
    match ty {
        MSG_FIRST if payload.len() == HANDSHAKE_INIT_SZ => MessageKind::InitHandshake,
        MSG_SECOND if payload.len() == HANDSHAKE_RESP_SZ => MessageKind::RespHandshake,
        MSG_COOKIE_REPLY if payload.len() == COOKIE_REPLY_SZ => MessageKind::CookieReply,
        MSG_DATA if payload.len() >= DATA_MIN_SZ => MessageKind::Data,
        _ => MessageKind::Invalid,
    }
}
