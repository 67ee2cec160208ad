#![cfg(feature = "ws")]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use arpc::Router;
use arpc_axum::{Config, Connections};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::{tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

fn demo_router() -> Arc<Router<()>> {
    Router::builder()
        .query("greeting", |_, _: ()| async { Ok("hello world") })
        .query("slow", |_, _: ()| async {
            tokio::time::sleep(Duration::from_millis(150)).await;
            Ok("slow")
        })
        .subscription("countdown", |_, from: u32| {
            async_stream::stream! {
                for i in (1..=from).rev() {
                    yield Ok(i);
                }
            }
        })
        .subscription("forever", |_, _: ()| {
            async_stream::stream! {
                let mut i = 0u64;
                loop {
                    yield Ok(i);
                    i += 1;
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        })
        .build()
        .expect("failed to build router")
        .arced()
}

async fn spawn_server() -> (SocketAddr, Connections) {
    let connections = Connections::new();
    let app = arpc_axum::endpoint_with(
        demo_router(),
        || (),
        Config::new().connections(connections.clone()),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind");
    let addr = listener.local_addr().expect("failed to read local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("server crashed");
    });

    (addr, connections)
}

async fn connect(addr: SocketAddr) -> Socket {
    let (socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .expect("failed to connect");
    socket
}

async fn send(socket: &mut Socket, value: Value) {
    socket
        .send(Message::Text(value.to_string()))
        .await
        .expect("failed to send");
}

async fn recv(socket: &mut Socket) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for a message")
            .expect("connection closed")
            .expect("websocket error");

        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).expect("invalid json frame");
        }
    }
}

#[tokio::test]
async fn query_over_websocket() {
    let (addr, _) = spawn_server().await;
    let mut socket = connect(addr).await;

    send(
        &mut socket,
        json!({ "id": 1, "method": "query", "params": { "path": "greeting", "input": null } }),
    )
    .await;

    assert_eq!(
        recv(&mut socket).await,
        json!({ "id": 1, "result": { "type": "data", "data": "hello world" } })
    );
}

#[tokio::test]
async fn concurrent_calls_interleave_on_one_socket() {
    let (addr, _) = spawn_server().await;
    let mut socket = connect(addr).await;

    send(
        &mut socket,
        json!({ "id": 1, "method": "query", "params": { "path": "slow" } }),
    )
    .await;
    send(
        &mut socket,
        json!({ "id": 2, "method": "query", "params": { "path": "greeting" } }),
    )
    .await;

    // The fast call answers first; each response is attributable by id.
    let first = recv(&mut socket).await;
    assert_eq!(first["id"], json!(2));
    assert_eq!(first["result"]["data"], json!("hello world"));

    let second = recv(&mut socket).await;
    assert_eq!(second["id"], json!(1));
    assert_eq!(second["result"]["data"], json!("slow"));
}

#[tokio::test]
async fn jsonrpc_tag_is_echoed() {
    let (addr, _) = spawn_server().await;
    let mut socket = connect(addr).await;

    send(
        &mut socket,
        json!({ "jsonrpc": "2.0", "id": 7, "method": "query", "params": { "path": "greeting" } }),
    )
    .await;

    let resp = recv(&mut socket).await;
    assert_eq!(resp["jsonrpc"], json!("2.0"));
    assert_eq!(resp["id"], json!(7));
}

#[tokio::test]
async fn malformed_json_does_not_close_the_socket() {
    let (addr, _) = spawn_server().await;
    let mut socket = connect(addr).await;

    socket
        .send(Message::Text("{ not json".to_string()))
        .await
        .expect("failed to send");

    let resp = recv(&mut socket).await;
    assert_eq!(resp["id"], Value::Null);
    assert_eq!(resp["error"]["code"], json!("ParseError"));

    // The connection survived the bad frame.
    send(
        &mut socket,
        json!({ "id": 2, "method": "query", "params": { "path": "greeting" } }),
    )
    .await;
    assert_eq!(
        recv(&mut socket).await["result"],
        json!({ "type": "data", "data": "hello world" })
    );
}

#[tokio::test]
async fn subscription_lifecycle() {
    let (addr, _) = spawn_server().await;
    let mut socket = connect(addr).await;

    send(
        &mut socket,
        json!({ "id": 4, "method": "subscription", "params": { "path": "countdown", "input": 3 } }),
    )
    .await;

    assert_eq!(
        recv(&mut socket).await,
        json!({ "id": 4, "result": { "type": "started" } })
    );

    for expected in [3, 2, 1] {
        assert_eq!(
            recv(&mut socket).await,
            json!({ "id": 4, "result": { "type": "data", "data": expected } })
        );
    }

    assert_eq!(
        recv(&mut socket).await,
        json!({ "id": 4, "result": { "type": "stopped" } })
    );
}

#[tokio::test]
async fn duplicate_subscription_id_is_rejected() {
    let (addr, _) = spawn_server().await;
    let mut socket = connect(addr).await;

    send(
        &mut socket,
        json!({ "id": 5, "method": "subscription", "params": { "path": "forever" } }),
    )
    .await;
    assert_eq!(recv(&mut socket).await["result"]["type"], json!("started"));

    send(
        &mut socket,
        json!({ "id": 5, "method": "subscription", "params": { "path": "forever" } }),
    )
    .await;

    loop {
        let resp = recv(&mut socket).await;
        if resp["error"] != Value::Null {
            assert_eq!(resp["error"]["code"], json!("BadRequest"));
            break;
        }
        // Skip data frames from the first subscription.
        assert_eq!(resp["result"]["type"], json!("data"));
    }
}

#[tokio::test]
async fn subscription_stop_terminates_the_stream() {
    let (addr, _) = spawn_server().await;
    let mut socket = connect(addr).await;

    send(
        &mut socket,
        json!({ "id": 6, "method": "subscription", "params": { "path": "forever" } }),
    )
    .await;
    assert_eq!(recv(&mut socket).await["result"]["type"], json!("started"));
    assert_eq!(recv(&mut socket).await["result"]["type"], json!("data"));

    send(&mut socket, json!({ "id": 6, "method": "subscription.stop" })).await;

    loop {
        let resp = recv(&mut socket).await;
        if resp["result"]["type"] == json!("stopped") {
            break;
        }
        // Events already in flight are fine; anything else is not.
        assert_eq!(resp["result"]["type"], json!("data"));
    }
}

#[tokio::test]
async fn reconnect_broadcast_reaches_every_client() {
    let (addr, connections) = spawn_server().await;
    let mut a = connect(addr).await;
    let mut b = connect(addr).await;

    // Wait until both sessions are registered.
    for _ in 0..50 {
        if connections.len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(connections.len(), 2);

    connections.broadcast_reconnect();

    for socket in [&mut a, &mut b] {
        assert_eq!(
            recv(socket).await,
            json!({ "id": null, "method": "reconnect" })
        );
    }
}
