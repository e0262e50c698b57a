use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};

use crate::error::Error;

/// A reference-counted datagram buffer with an associated source address,
/// modeling the "linear value with explicit transfer" buffer ownership
/// described for the receive path: it is enqueued, decrypted, or freed
/// exactly once.
///
/// Built on `bytes::BytesMut` so header stripping (advancing past the
/// outer frame, or past the data-message header before decryption) is a
/// cursor move rather than a copy.
pub struct DatagramBuf {
    data: BytesMut,
    source: Option<SocketAddr>,
}

impl DatagramBuf {
    pub fn from_vec(data: Vec<u8>, source: Option<SocketAddr>) -> Self {
        Self {
            data: BytesMut::from(&data[..]),
            source,
        }
    }

    pub fn from_bytes_mut(data: BytesMut, source: Option<SocketAddr>) -> Self {
        Self { data, source }
    }

    pub fn source(&self) -> Option<SocketAddr> {
        self.source
    }

    pub fn set_source(&mut self, addr: SocketAddr) {
        self.source = Some(addr);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Ensure `n` bytes are contiguous starting at the current offset.
    /// `BytesMut` is already contiguous by construction, so this can only
    /// fail on short buffers — kept as an explicit, fallible operation to
    /// match the "pull" contract the worker and cookie checker rely on.
    pub fn pull(&self, n: usize) -> Result<&[u8], Error> {
        self.data.get(..n).ok_or(Error::InvalidFrame)
    }

    /// Drop the first `n` bytes (header stripping).
    pub fn advance(&mut self, n: usize) {
        let _ = self.data.split_to(n.min(self.data.len()));
    }

    /// Drop everything after the first `n` bytes (tag/trailer stripping).
    pub fn truncate(&mut self, n: usize) {
        self.data.truncate(n);
    }

    /// Linearize into contiguous memory. A no-op for `BytesMut`; kept to
    /// mirror the collaborator interface a chunked/rope-based buffer
    /// implementation would need, and as the single call site the
    /// receive entry point (4.F) invokes before admission-queueing a
    /// handshake datagram.
    pub fn linearize(&mut self) {}

    /// Hand the contents off, freezing into an immutable `Bytes` for
    /// delivery to the upper network stack.
    pub fn freeze(self) -> Bytes {
        self.data.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pull_fails_on_short_buffer() {
        let buf = DatagramBuf::from_vec(vec![1, 2, 3], None);
        assert!(buf.pull(4).is_err());
        assert_eq!(buf.pull(3).unwrap(), &[1, 2, 3]);
    }

    #[test]
    fn advance_strips_header() {
        let mut buf = DatagramBuf::from_vec(vec![1, 2, 3, 4], None);
        buf.advance(2);
        assert_eq!(buf.as_slice(), &[3, 4]);
    }
}
