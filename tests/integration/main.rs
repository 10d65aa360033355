//! Scape integration test harness.
//!
//! Every test runs the front-ends behind real UDP sockets on the loopback
//! interface, with devices played by plain sockets. No daemon process and
//! no privileges are needed:
//!
//!   cargo test --test integration
//!
//! Sockets bind to port 0, so tests can run in parallel.

mod iotscape;
mod roboscape;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::Value;
use tokio::net::UdpSocket;

use scape_core::config::RoboScapeMode;
use scape_core::CipherSuite;
use scape_services::{AllowAll, IotScape, MemoryStore, RoboScape};

// ── Harness ───────────────────────────────────────────────────────────────────

/// How long a device socket waits for the server before a test fails.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

pub fn loopback() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

/// A plain socket standing in for a device.
pub async fn device_socket() -> Result<UdpSocket> {
    UdpSocket::bind(loopback())
        .await
        .context("failed to bind device socket")
}

/// Start an IoTScape front-end on a fresh socket. Returns it and its address.
pub async fn serve_iotscape(response_timeout: Duration) -> Result<(IotScape, SocketAddr)> {
    let socket = Arc::new(UdpSocket::bind(loopback()).await?);
    let addr = socket.local_addr()?;
    let scape = IotScape::new(
        CipherSuite::with_defaults(),
        Arc::new(MemoryStore::new()),
        response_timeout,
        socket.clone(),
    );

    let server = scape.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65_535];
        while let Ok((len, from)) = socket.recv_from(&mut buf).await {
            server.handle_datagram(&buf[..len], from).await;
        }
    });
    Ok((scape, addr))
}

/// Start a RoboScape front-end on a fresh socket.
pub async fn serve_roboscape(mode: RoboScapeMode) -> Result<(RoboScape, SocketAddr)> {
    let socket = Arc::new(UdpSocket::bind(loopback()).await?);
    let addr = socket.local_addr()?;
    let scape = RoboScape::new(
        CipherSuite::with_defaults(),
        mode,
        Duration::from_millis(500),
        Arc::new(AllowAll),
        socket.clone(),
    );

    let server = scape.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65_535];
        while let Ok((len, from)) = socket.recv_from(&mut buf).await {
            server.handle_datagram(&buf[..len], from);
        }
    });
    Ok((scape, addr))
}

/// Next datagram on `socket`, or an error after [`RECV_TIMEOUT`].
pub async fn recv(socket: &UdpSocket) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; 65_535];
    let (len, _) = tokio::time::timeout(RECV_TIMEOUT, socket.recv_from(&mut buf))
        .await
        .context("timed out waiting for a datagram")??;
    buf.truncate(len);
    Ok(buf)
}

pub async fn recv_json(socket: &UdpSocket) -> Result<Value> {
    let bytes = recv(socket).await?;
    serde_json::from_slice(&bytes).context("datagram is not JSON")
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually(what: &str, check: impl Fn() -> bool) -> Result<()> {
    for _ in 0..200 {
        if check() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    bail!("condition never held: {what}")
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_loopback_round_trip() {
    let a = device_socket().await.unwrap();
    let b = device_socket().await.unwrap();
    a.send_to(b"ping", b.local_addr().unwrap()).await.unwrap();
    assert_eq!(recv(&b).await.unwrap(), b"ping");
}
