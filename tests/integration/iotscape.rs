use std::time::Duration;

use serde_json::json;

use scape_services::listeners::DEVICE_MESSAGE;
use scape_services::{MemoryClient, Reply};

use crate::*;

fn announcement(id: &str) -> Vec<u8> {
    json!({
        "Robot": {
            "service": {"description": "Loopback robot", "version": 1},
            "id": id,
            "methods": {
                "setSpeed": {
                    "params": [{"name": "left", "type": "number"}, {"name": "right", "type": "number"}],
                    "returns": {"type": ["void"]}
                },
                "getRange": {"params": [], "returns": {"type": ["number"]}}
            },
            "events": {"bumped": {"params": ["side"]}}
        }
    })
    .to_string()
    .into_bytes()
}

/// Announce `id` from `device` and wait until the server knows it.
async fn announce(scape: &scape_services::IotScape, server: std::net::SocketAddr, device: &tokio::net::UdpSocket, id: &str) {
    device.send_to(&announcement(id), server).await.unwrap();
    eventually("device registered", || scape.registry().exists("Robot", id))
        .await
        .unwrap();
}

/// Announce, send a text command, answer it from the device.
#[tokio::test]
async fn test_command_reaches_device_and_reply_returns() {
    let (scape, server) = serve_iotscape(Duration::from_millis(500)).await.unwrap();
    let device = device_socket().await.unwrap();
    announce(&scape, server, &device, "r1").await;

    let call = {
        let scape = scape.clone();
        tokio::spawn(async move { scape.send("Robot", "r1", "3 get range", "c1").await })
    };

    let request = recv_json(&device).await.unwrap();
    assert_eq!(request["function"], "getRange");
    assert_eq!(request["device"], "r1");
    assert_eq!(request["clientId"], "c1");

    let response = json!({"request": request["id"], "response": [42]});
    device
        .send_to(response.to_string().as_bytes(), server)
        .await
        .unwrap();

    let reply = call.await.unwrap().unwrap();
    assert_eq!(reply, Some(Reply::Value(json!(42))));

    // same sequence number again is a replay
    let replay = scape.send("Robot", "r1", "3 get range", "c1").await.unwrap();
    assert_eq!(replay, None);
}

/// A device that never answers yields the timeout sentinel after two tries.
#[tokio::test]
async fn test_unanswered_request_times_out() {
    let (scape, server) = serve_iotscape(Duration::from_millis(100)).await.unwrap();
    let device = device_socket().await.unwrap();
    announce(&scape, server, &device, "r2").await;

    let reply = scape
        .call("Robot", "r2", "getRange", None, Vec::new())
        .await
        .unwrap();
    assert!(reply.is_timed_out());

    // both attempts reached the device
    let first = recv_json(&device).await.unwrap();
    let second = recv_json(&device).await.unwrap();
    assert_eq!(first["id"], second["id"]);
}

/// Events fan out to listeners, encrypted with the device's key.
#[tokio::test]
async fn test_events_fan_out_to_listeners() {
    let (scape, server) = serve_iotscape(Duration::from_millis(500)).await.unwrap();
    let device = device_socket().await.unwrap();
    announce(&scape, server, &device, "r3").await;

    let client = MemoryClient::new("c1");
    assert!(scape.listen("Robot", "r3", client.clone()).unwrap());

    let event = json!({"service": "Robot", "id": "r3", "event": {"type": "bumped", "args": {"side": "left"}}});
    device.send_to(event.to_string().as_bytes(), server).await.unwrap();

    eventually("event delivered", || !client.received().is_empty())
        .await
        .unwrap();
    let messages = client.take();
    assert_eq!(messages[0].msg_type, DEVICE_MESSAGE);
    assert_eq!(messages[0].content["message"], "bumped left");
}

/// `_requestKey` from the device sets a caesar key and sends it back.
#[tokio::test]
async fn test_hardware_key_request() {
    let (scape, server) = serve_iotscape(Duration::from_millis(500)).await.unwrap();
    let device = device_socket().await.unwrap();
    announce(&scape, server, &device, "r4").await;

    let event = json!({"service": "Robot", "id": "r4", "event": {"type": "_requestKey", "args": {}}});
    device.send_to(event.to_string().as_bytes(), server).await.unwrap();

    let request = recv_json(&device).await.unwrap();
    assert_eq!(request["function"], "_requestedKey");
    let digits: Vec<i64> = request["params"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_i64().unwrap())
        .collect();
    assert_eq!(digits.len(), 4);

    let state = scape.registry().encryption_state("Robot", "r4").unwrap();
    assert!(state.is_caesar());
    assert_eq!(state.key, digits);
}
