//! Outbound datagram seam.
//!
//! Front-ends never own a socket; they send through a [`DatagramSink`]. The
//! daemon passes its bound `UdpSocket`, tests pass a `MemorySink` (feature `test-util`).
//! Sends are fire-and-forget: a full socket buffer is a lost datagram, which
//! the protocol already tolerates.

use std::io;
use std::net::SocketAddr;

use tokio::net::UdpSocket;

pub trait DatagramSink: Send + Sync {
    fn send_to(&self, datagram: &[u8], addr: SocketAddr) -> io::Result<usize>;
}

impl DatagramSink for UdpSocket {
    fn send_to(&self, datagram: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.try_send_to(datagram, addr)
    }
}

/// Send and log failures instead of returning them.
pub(crate) fn send_logged(sink: &dyn DatagramSink, datagram: &[u8], addr: SocketAddr) {
    if let Err(e) = sink.send_to(datagram, addr) {
        tracing::warn!(error = %e, addr = %addr, len = datagram.len(), "send failed");
    }
}

#[cfg(any(test, feature = "test-util"))]
/// Records every datagram instead of sending it.
#[derive(Debug, Default)]
pub struct MemorySink {
    sent: std::sync::Mutex<Vec<(SocketAddr, Vec<u8>)>>,
}

#[cfg(any(test, feature = "test-util"))]
impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything sent so far, oldest first.
    pub fn sent(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        self.sent.lock().map(|sent| sent.clone()).unwrap_or_default()
    }

    /// Remove and return everything sent so far.
    pub fn take(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        self.sent
            .lock()
            .map(|mut sent| std::mem::take(&mut *sent))
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.sent.lock().map(|sent| sent.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(any(test, feature = "test-util"))]
impl DatagramSink for MemorySink {
    fn send_to(&self, datagram: &[u8], addr: SocketAddr) -> io::Result<usize> {
        let mut sent = self
            .sent
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "sink poisoned"))?;
        sent.push((addr, datagram.to_vec()));
        Ok(datagram.len())
    }
}
