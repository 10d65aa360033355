//! Per-family receive loops.
//!
//! One UDP socket per device family. Each loop reads datagrams and hands
//! them to its front-end; nothing here inspects the payload.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use scape_services::{IotScape, RoboScape};

/// Largest datagram we accept.
const MAX_DATAGRAM: usize = 65_535;

/// Bind a non-blocking UDP socket with address reuse.
pub fn bind(addr: SocketAddr) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .context("socket()")?;
    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    socket.set_nonblocking(true).context("set_nonblocking")?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("bind({addr})"))?;

    let socket = UdpSocket::from_std(socket.into()).context("failed to convert to tokio UdpSocket")?;
    tracing::info!(addr = %socket.local_addr()?, "socket bound");
    Ok(socket)
}

/// Feed JSON-family datagrams to the IoTScape front-end until shutdown.
pub async fn iotscape_loop(
    socket: Arc<UdpSocket>,
    scape: IotScape,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, from) = tokio::select! {
            _ = shutdown.recv() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(error = %e, "iotscape recv_from failed");
                    continue;
                }
            },
        };
        scape.handle_datagram(&buf[..len], from).await;
    }
    tracing::debug!("iotscape receive loop stopped");
}

/// Feed binary-family datagrams to the RoboScape front-end until shutdown.
pub async fn roboscape_loop(
    socket: Arc<UdpSocket>,
    scape: RoboScape,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, from) = tokio::select! {
            _ = shutdown.recv() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(error = %e, "roboscape recv_from failed");
                    continue;
                }
            },
        };
        scape.handle_datagram(&buf[..len], from);
    }
    tracing::debug!("roboscape receive loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use scape_core::config::RoboScapeMode;
    use scape_core::CipherSuite;
    use scape_services::roboscape::ROBOSCAPE;
    use scape_services::{AllowAll, MemoryStore};

    fn loopback() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 0))
    }

    async fn eventually(check: impl Fn() -> bool) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn bind_picks_a_port() {
        let socket = bind(loopback()).unwrap();
        assert_ne!(socket.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn robot_frames_reach_the_front_end() {
        let socket = Arc::new(bind(loopback()).unwrap());
        let server = socket.local_addr().unwrap();
        let scape = RoboScape::new(
            CipherSuite::with_defaults(),
            RoboScapeMode::Both,
            Duration::from_millis(200),
            Arc::new(AllowAll),
            socket.clone(),
        );
        let (shutdown_tx, _) = broadcast::channel(1);
        let task = tokio::spawn(roboscape_loop(socket, scape.clone(), shutdown_tx.subscribe()));

        let robot = UdpSocket::bind(loopback()).await.unwrap();
        let mut frame = vec![0xaa, 0xbb, 0xcc, 0x00, 0x00, 0x01];
        frame.extend_from_slice(&1u32.to_le_bytes());
        frame.push(b'I');
        robot.send_to(&frame, server).await.unwrap();

        assert!(eventually(|| scape.registry().exists(ROBOSCAPE, "aabbcc000001")).await);

        shutdown_tx.send(()).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn garbage_does_not_stop_the_loop() {
        let socket = Arc::new(bind(loopback()).unwrap());
        let server = socket.local_addr().unwrap();
        let scape = IotScape::new(
            CipherSuite::with_defaults(),
            Arc::new(MemoryStore::new()),
            Duration::from_millis(100),
            socket.clone(),
        );
        let (shutdown_tx, _) = broadcast::channel(1);
        let task = tokio::spawn(iotscape_loop(socket, scape.clone(), shutdown_tx.subscribe()));

        let device = UdpSocket::bind(loopback()).await.unwrap();
        device.send_to(b"{not json", server).await.unwrap();
        let announcement = serde_json::json!({
            "Lamp": {
                "service": {"description": "", "version": 1},
                "id": "l1",
                "methods": {"turnOn": {"params": [], "returns": {"type": ["void"]}}}
            }
        });
        device
            .send_to(announcement.to_string().as_bytes(), server)
            .await
            .unwrap();

        assert!(eventually(|| scape.registry().exists("Lamp", "l1")).await);

        shutdown_tx.send(()).unwrap();
        task.await.unwrap();
    }
}
