use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use pairspeed_relay::{Dispatcher, router};
use pairspeed_types::envelope::{decode_payload, encode_payload};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_relay() -> (SocketAddr, Dispatcher) {
    let dispatcher = Dispatcher::new();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(dispatcher.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, dispatcher)
}

async fn connect(addr: SocketAddr) -> Socket {
    let (socket, _) = tokio_tungstenite::connect_async(format!("ws://{}/signal", addr))
        .await
        .unwrap();
    socket
}

async fn request(socket: &mut Socket, id: u64, dest: u64, payload: &Value) {
    let frame = json!({ "Id": id, "Dest": dest, "Datab64": encode_payload(payload).unwrap() });
    socket.send(Message::Text(frame.to_string().into())).await.unwrap();
}

async fn next_json(socket: &mut Socket) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("relay went quiet")
            .expect("relay closed")
            .unwrap();
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

/// Ask the rendezvous address who we are.
async fn whoami(socket: &mut Socket, id: u64) -> u64 {
    request(socket, id, 0, &json!({})).await;
    let ack = next_json(socket).await;
    assert_eq!(ack["Id"], id);
    assert_eq!(ack["Deliverable"], false);
    ack["You"].as_u64().unwrap()
}

async fn wait_for_sessions(dispatcher: &Dispatcher, count: usize) {
    for _ in 0..200 {
        if dispatcher.session_count() == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {} sessions, have {}", count, dispatcher.session_count());
}

#[tokio::test]
async fn rendezvous_reports_own_identifier() {
    let (addr, _dispatcher) = start_relay().await;
    let mut socket = connect(addr).await;
    let me = whoami(&mut socket, 1).await;
    assert!(me > 0 && me < 1 << 22);
    assert_eq!(whoami(&mut socket, 2).await, me);
}

#[tokio::test]
async fn relays_payloads_between_sessions() {
    let (addr, _dispatcher) = start_relay().await;
    let mut a = connect(addr).await;
    let mut b = connect(addr).await;
    let id_a = whoami(&mut a, 1).await;
    let id_b = whoami(&mut b, 1).await;
    assert_ne!(id_a, id_b);

    request(&mut a, 2, id_b, &json!("PING")).await;
    let ack = next_json(&mut a).await;
    assert_eq!(ack, json!({ "Id": 2, "Deliverable": true, "You": id_a }));

    let delivery = next_json(&mut b).await;
    assert_eq!(delivery["Src"], id_a);
    assert_eq!(delivery["Dest"], id_b);
    let payload: String = decode_payload(delivery["Datab64"].as_str().unwrap()).unwrap();
    assert_eq!(payload, "PING");
}

#[tokio::test]
async fn unknown_destination_is_undeliverable() {
    let (addr, _dispatcher) = start_relay().await;
    let mut socket = connect(addr).await;
    let me = whoami(&mut socket, 1).await;
    let nobody = if me == 1 { 2 } else { 1 };
    request(&mut socket, 2, nobody, &json!("PING")).await;
    let ack = next_json(&mut socket).await;
    assert_eq!(ack, json!({ "Id": 2, "Deliverable": false, "You": me }));
}

#[tokio::test]
async fn id_zero_ends_the_session() {
    let (addr, dispatcher) = start_relay().await;
    let mut socket = connect(addr).await;
    whoami(&mut socket, 1).await;
    assert_eq!(dispatcher.session_count(), 1);

    request(&mut socket, 0, 0, &json!({})).await;
    wait_for_sessions(&dispatcher, 0).await;
}

#[tokio::test]
async fn malformed_request_ends_the_session() {
    let (addr, dispatcher) = start_relay().await;
    let mut socket = connect(addr).await;
    whoami(&mut socket, 1).await;

    socket.send(Message::Text("{not json".into())).await.unwrap();
    wait_for_sessions(&dispatcher, 0).await;
}

#[tokio::test]
async fn hang_up_unregisters() {
    let (addr, dispatcher) = start_relay().await;
    let mut a = connect(addr).await;
    let mut b = connect(addr).await;
    whoami(&mut a, 1).await;
    let id_b = whoami(&mut b, 1).await;
    assert_eq!(dispatcher.session_count(), 2);

    b.close(None).await.unwrap();
    wait_for_sessions(&dispatcher, 1).await;

    request(&mut a, 2, id_b, &json!("PING")).await;
    assert_eq!(next_json(&mut a).await["Deliverable"], false);
}
