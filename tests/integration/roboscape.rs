use serde_json::json;

use scape_core::config::RoboScapeMode;
use scape_core::wire::RobotCommand;
use scape_services::roboscape::{ROBOSCAPE, ROBOT_MESSAGE};
use scape_services::{MemoryClient, RobotMethod, RobotReply};

use crate::*;

const MAC: [u8; 6] = [0xde, 0xad, 0xbe, 0xef, 0x00, 0x07];
const ID: &str = "deadbeef0007";

fn frame(timestamp: u32, tag: u8, payload: &[u8]) -> Vec<u8> {
    let mut bytes = MAC.to_vec();
    bytes.extend_from_slice(&timestamp.to_le_bytes());
    bytes.push(tag);
    bytes.extend_from_slice(payload);
    bytes
}

/// Say hello from `robot` and wait for the server to register it.
async fn identify(scape: &scape_services::RoboScape, server: std::net::SocketAddr, robot: &tokio::net::UdpSocket) {
    robot.send_to(&frame(1, b'I', &[]), server).await.unwrap();
    eventually("robot registered", || scape.registry().exists(ROBOSCAPE, ID))
        .await
        .unwrap();
}

/// A text command becomes a binary command on the robot's socket.
#[tokio::test]
async fn test_text_command_drives_robot() {
    let (scape, server) = serve_roboscape(RoboScapeMode::Both).await.unwrap();
    let robot = device_socket().await.unwrap();
    identify(&scape, server, &robot).await;

    let client = MemoryClient::new("c1");
    let reply = scape.send(client.as_ref(), "0007", "1 set speed 50 -50").await.unwrap();
    assert_eq!(reply, RobotReply::Done);
    assert_eq!(recv(&robot).await.unwrap(), RobotCommand::set_speed(50, -50).encode());

    let replay = scape.send(client.as_ref(), "0007", "1 set speed 50 -50").await.unwrap();
    assert_eq!(replay, RobotReply::Refused);
}

/// A range query is answered by the robot's `R` frame.
#[tokio::test]
async fn test_range_query_round_trip() {
    let (scape, server) = serve_roboscape(RoboScapeMode::Native).await.unwrap();
    let robot = device_socket().await.unwrap();
    identify(&scape, server, &robot).await;

    let query = {
        let scape = scape.clone();
        tokio::spawn(async move {
            let client = MemoryClient::new("c1");
            scape.call(client.as_ref(), ID, RobotMethod::GetRange, &[]).await
        })
    };

    assert_eq!(recv(&robot).await.unwrap(), vec![b'R']);
    robot
        .send_to(&frame(2, b'R', &77i16.to_le_bytes()), server)
        .await
        .unwrap();

    let reply = query.await.unwrap().unwrap();
    assert_eq!(reply, RobotReply::Value(json!(77)));
}

/// Telemetry reaches listeners as a typed message and an envelope.
#[tokio::test]
async fn test_telemetry_reaches_listeners() {
    let (scape, server) = serve_roboscape(RoboScapeMode::Both).await.unwrap();
    let robot = device_socket().await.unwrap();
    identify(&scape, server, &robot).await;

    let client = MemoryClient::new("c1");
    assert!(scape.listen(client.clone(), "beef0007"));

    robot.send_to(&frame(5, b'W', &[0x2]), server).await.unwrap();
    eventually("telemetry delivered", || client.received().len() == 2)
        .await
        .unwrap();

    let messages = client.take();
    assert_eq!(messages[0].msg_type, "whiskers");
    assert_eq!(messages[0].content["left"], false);
    assert_eq!(messages[0].content["right"], true);
    assert_eq!(messages[1].msg_type, ROBOT_MESSAGE);
    assert_eq!(messages[1].content["message"], "whiskers 5 false true");
}
