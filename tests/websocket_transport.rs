//! Terminal protocol over a real WebSocket, served by axum.
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use rs_terminals::protocol::{ServerMessage, WebSocketConnection};
use rs_terminals::pty::MemoryPtyFactory;
use rs_terminals::{CreateSessionRequest, TerminalConfig, TerminalsApi};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

async fn terminal_socket(
    ws: WebSocketUpgrade,
    Path(name): Path<String>,
    State(api): State<TerminalsApi>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let connection = WebSocketConnection::new(socket, uuid::Uuid::new_v4().to_string());
        let _ = api.connect(connection, &name).await;
    })
}

async fn serve(api: TerminalsApi) -> SocketAddr {
    let app = Router::new()
        .route("/terminals/websocket/:name", get(terminal_socket))
        .with_state(api);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn connect(addr: SocketAddr, name: &str) -> Client {
    let url = format!("ws://{addr}/terminals/websocket/{name}");
    let (client, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    client
}

/// Next protocol message; `None` once the server closed the socket.
async fn next_message(client: &mut Client) -> Option<ServerMessage> {
    loop {
        let frame = timeout(WAIT, client.next()).await.expect("no frame in time");
        match frame {
            Some(Ok(Message::Text(text))) => return Some(serde_json::from_str(&text).unwrap()),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
            Some(Ok(other)) => panic!("unexpected frame {:?}", other),
        }
    }
}

fn setup() -> (MemoryPtyFactory, TerminalsApi) {
    let factory = MemoryPtyFactory::new();
    let api = TerminalsApi::new(Arc::new(factory.clone()), TerminalConfig::default());
    (factory, api)
}

#[tokio::test]
async fn websocket_client_drives_a_terminal() {
    let (factory, api) = setup();
    api.create_or_get("t1", &CreateSessionRequest::default())
        .await
        .unwrap();
    let addr = serve(api.clone()).await;
    let mut client = connect(addr, "t1").await;

    assert_eq!(
        next_message(&mut client).await,
        Some(ServerMessage::Size { rows: 24, cols: 80 })
    );

    client
        .send(Message::Text(r#"{"type":"stdin","data":"hello"}"#.to_string()))
        .await
        .unwrap();
    assert_eq!(
        next_message(&mut client).await,
        Some(ServerMessage::Output {
            data: "hello".to_string()
        })
    );

    client
        .send(Message::Text(r#"["stdin", "again"]"#.to_string()))
        .await
        .unwrap();
    assert_eq!(
        next_message(&mut client).await,
        Some(ServerMessage::Output {
            data: "again".to_string()
        })
    );
    assert_eq!(api.get("t1").unwrap().connections, 1);

    api.kill("t1").await.unwrap();
    assert_eq!(
        next_message(&mut client).await,
        Some(ServerMessage::Exit { code: None })
    );
    assert_eq!(next_message(&mut client).await, None);
    assert_eq!(factory.last().unwrap().written(), b"helloagain");
}

#[tokio::test]
async fn unknown_terminal_is_closed_immediately() {
    let (factory, api) = setup();
    let addr = serve(api).await;
    let mut client = connect(addr, "nobody").await;

    assert_eq!(next_message(&mut client).await, None);
    assert_eq!(factory.spawn_count(), 0);
}

#[tokio::test]
async fn client_disconnect_detaches_but_keeps_the_terminal() {
    let (_factory, api) = setup();
    api.create_or_get("t2", &CreateSessionRequest::default())
        .await
        .unwrap();
    let addr = serve(api.clone()).await;

    let mut client = connect(addr, "t2").await;
    next_message(&mut client).await;
    assert_eq!(api.get("t2").unwrap().connections, 1);
    client.close(None).await.unwrap();

    timeout(WAIT, async {
        while api.get("t2").unwrap().connections > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connection was not detached");
    assert_eq!(api.list().len(), 1);
}
