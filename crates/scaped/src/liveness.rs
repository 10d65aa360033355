//! Housekeeping timers.
//!
//! The tick loop drives both families: rate windows reset, heartbeat
//! counters advance, silent devices are forgotten. The probe loop asks
//! JSON-family devices for a heartbeat and drops those that stay quiet.

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{self, Instant, MissedTickBehavior};

use scape_services::{IotScape, RoboScape};

/// Run the housekeeping tick until shutdown.
pub async fn tick_loop(
    iotscape: Option<IotScape>,
    roboscape: Option<RoboScape>,
    every: Duration,
    forget_ticks: u32,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut interval = time::interval_at(Instant::now() + every, every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = interval.tick() => {}
        }
        let mut forgotten = 0;
        if let Some(scape) = &iotscape {
            forgotten += scape.tick(forget_ticks).len();
        }
        if let Some(scape) = &roboscape {
            forgotten += scape.tick(forget_ticks).len();
        }
        if forgotten > 0 {
            tracing::debug!(forgotten, "tick forgot silent devices");
        }
    }
}

/// Probe every JSON-family device each `every` until shutdown.
pub async fn heartbeat_loop(scape: IotScape, every: Duration, mut shutdown: broadcast::Receiver<()>) {
    let mut interval = time::interval_at(Instant::now() + every, every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = interval.tick() => {}
        }
        let probed = scape.registry().len();
        let removed = tokio::select! {
            _ = shutdown.recv() => break,
            removed = scape.probe_heartbeats() => removed,
        };
        tracing::debug!(probed, removed = removed.len(), "heartbeat probe finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::Arc;

    use scape_core::config::RoboScapeMode;
    use scape_core::CipherSuite;
    use scape_services::roboscape::ROBOSCAPE;
    use scape_services::{AllowAll, MemorySink, MemoryStore};
    use serde_json::json;

    fn addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 7400))
    }

    fn robot_frame() -> Vec<u8> {
        let mut frame = vec![1, 2, 3, 4, 5, 6];
        frame.extend_from_slice(&1u32.to_le_bytes());
        frame.push(b'I');
        frame
    }

    fn iotscape() -> (IotScape, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let scape = IotScape::new(
            CipherSuite::with_defaults(),
            Arc::new(MemoryStore::new()),
            Duration::from_millis(3000),
            sink.clone(),
        );
        (scape, sink)
    }

    fn announcement() -> Vec<u8> {
        json!({
            "Lamp": {
                "service": {"description": "", "version": 1},
                "id": "l1",
                "methods": {"turnOn": {"params": [], "returns": {"type": ["void"]}}}
            }
        })
        .to_string()
        .into_bytes()
    }

    #[tokio::test(start_paused = true)]
    async fn silent_robots_are_forgotten_by_the_tick() {
        let roboscape = RoboScape::new(
            CipherSuite::with_defaults(),
            RoboScapeMode::Both,
            Duration::from_millis(200),
            Arc::new(AllowAll),
            Arc::new(MemorySink::new()),
        );
        roboscape.handle_datagram(&robot_frame(), addr());

        let (shutdown_tx, _) = broadcast::channel(1);
        let task = tokio::spawn(tick_loop(
            None,
            Some(roboscape.clone()),
            Duration::from_secs(1),
            3,
            shutdown_tx.subscribe(),
        ));

        time::sleep(Duration::from_millis(3500)).await;
        assert!(roboscape.registry().exists(ROBOSCAPE, "010203040506"));

        // a frame resets the counter
        roboscape.handle_datagram(&robot_frame(), addr());
        time::sleep(Duration::from_secs(3)).await;
        assert!(roboscape.registry().exists(ROBOSCAPE, "010203040506"));

        time::sleep(Duration::from_secs(2)).await;
        assert!(!roboscape.registry().exists(ROBOSCAPE, "010203040506"));

        shutdown_tx.send(()).unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_probes_remove_the_device() {
        let (scape, sink) = iotscape();
        scape.handle_datagram(&announcement(), addr()).await;

        let (shutdown_tx, _) = broadcast::channel(1);
        let task = tokio::spawn(heartbeat_loop(
            scape.clone(),
            Duration::from_secs(120),
            shutdown_tx.subscribe(),
        ));

        time::sleep(Duration::from_secs(121)).await;
        assert!(scape.registry().exists("Lamp", "l1"));
        assert_eq!(sink.len(), 1);

        // two probes, each sent twice
        time::sleep(Duration::from_secs(12)).await;
        assert!(!scape.registry().exists("Lamp", "l1"));
        assert_eq!(sink.len(), 4);

        shutdown_tx.send(()).unwrap();
        task.await.unwrap();
    }
}
